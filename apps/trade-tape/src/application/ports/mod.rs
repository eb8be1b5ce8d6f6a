//! Port Interfaces
//!
//! Contracts between the reconciliation services and the outside world,
//! following the Hexagonal Architecture pattern.
//!
//! ## Driven Ports (Outbound)
//!
//! - `MarketDataSource`: a venue's historical REST queries and realtime push
//!   feed for one market.
//!
//! ## Driver Ports (Inbound)
//!
//! - `TradeObserver`: where reconciled trades are delivered.

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::domain::trade::{Trade, TradeId, TradeOrigin};

// =============================================================================
// Errors
// =============================================================================

/// HTTP status codes retried besides the whole 5xx range.
const RETRYABLE_STATUS_CODES: &[u16] = &[408, 429];

/// Failure reported by a [`MarketDataSource`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum SourceError {
    /// The request did not complete in time.
    #[error("request timed out")]
    Timeout,

    /// The venue answered with an error status.
    #[error("venue returned status {status}: {message}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body or reason.
        message: String,
    },

    /// The connection was dropped.
    #[error("connection lost")]
    Disconnected,

    /// The venue refused the request outright.
    #[error("request rejected: {0}")]
    Rejected(String),
}

impl SourceError {
    /// Whether retrying the same request can succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout | Self::Disconnected => true,
            Self::Status { status, .. } => {
                (500..600).contains(status) || RETRYABLE_STATUS_CODES.contains(status)
            }
            Self::Rejected(_) => false,
        }
    }
}

// =============================================================================
// Market Data Source
// =============================================================================

/// Realtime trade feed. Ends or yields an error when the connection drops.
pub type TradeStream = BoxStream<'static, Result<Trade, SourceError>>;

/// One market on one venue.
///
/// All batch-returning operations yield trades in ascending id order.
/// Reconnecting the realtime feed is the caller's job.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    /// Market identifier, used for logs, metrics and retry policy names.
    fn market_id(&self) -> &str;

    /// Maximum number of trades a single REST response carries.
    fn page_size(&self) -> usize;

    /// Trades with `start_id < id <= end_id`, at most one page.
    ///
    /// Venues without stable range queries may ignore `end_id` and return
    /// more or fewer trades than the range holds.
    async fn fetch_after(
        &self,
        start_id: TradeId,
        end_id: TradeId,
    ) -> Result<Vec<Trade>, SourceError>;

    /// The newest page of trades with `id < before_id`.
    async fn fetch_before(&self, before_id: TradeId) -> Result<Vec<Trade>, SourceError>;

    /// The most recent trade, or `None` if the market has never traded.
    async fn fetch_latest(&self) -> Result<Option<Trade>, SourceError>;

    /// Open a new realtime connection.
    async fn subscribe_realtime(&self) -> Result<TradeStream, SourceError>;

    /// Whether `fetch_after` honours its range exactly.
    fn supports_stable_range_query(&self) -> bool {
        true
    }

    /// Venue-specific dedup comparison.
    fn trades_are_equal(&self, a: &Trade, b: &Trade) -> bool {
        a.id == b.id
    }

    /// Last id durably stored by an external cache, for warm starts.
    async fn estimate_last_id(&self) -> Option<TradeId> {
        None
    }
}

// =============================================================================
// Trade Observer
// =============================================================================

/// Receiver of reconciled trades.
///
/// Called by the backfill loop and, once forwarding, by the realtime pump.
/// Both are futures polled by the same pipeline task, so calls for one
/// market never overlap. Spawning either onto its own task would need a
/// lock around the observer.
pub trait TradeObserver: Send + Sync {
    /// Deliver one trade.
    fn on_trade(&self, trade: Trade, origin: TradeOrigin);
}
