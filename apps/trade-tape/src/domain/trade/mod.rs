//! Trade Types
//!
//! The canonical execution record carried through the tape. A trade is
//! immutable once reported by a venue; its `id` is the sole ordering key
//! within one venue.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// =============================================================================
// Types
// =============================================================================

/// Venue-assigned trade identifier. Increases monotonically, may have gaps.
pub type TradeId = i64;

/// Aggressor side of a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    /// Taker bought.
    Buy,
    /// Taker sold.
    Sell,
}

impl Side {
    /// Lowercase name of the side.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Buy => "buy",
            Self::Sell => "sell",
        }
    }
}

/// Where a delivered trade came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TradeOrigin {
    /// Paginated historical query.
    Rest,
    /// Push feed.
    Realtime,
}

impl TradeOrigin {
    /// Label used for metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Rest => "rest",
            Self::Realtime => "realtime",
        }
    }
}

/// Relation between a trade and the one immediately before it.
///
/// A single aggressive order sweeping several resting orders produces a run
/// of fills from the same taker; consumers merge such runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Consecutive {
    /// Different taker (or unknown).
    Difference,
    /// Same buying taker as the previous trade.
    SameBuyer,
    /// Same selling taker as the previous trade.
    SameSeller,
}

// =============================================================================
// Trade
// =============================================================================

/// One executed trade reported by a venue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trade {
    /// Venue trade id.
    pub id: TradeId,
    /// Execution time.
    pub timestamp: DateTime<Utc>,
    /// Execution price.
    pub price: Decimal,
    /// Executed size.
    pub size: Decimal,
    /// Aggressor side.
    pub side: Side,
    /// Buyer order id, when the venue reports it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buyer_id: Option<String>,
    /// Seller order id, when the venue reports it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seller_id: Option<String>,
    /// Running size of the taker's multi-fill order up to this trade.
    pub cumulative_size: Decimal,
}

impl Trade {
    /// Create a trade with no counterparty ids.
    ///
    /// `cumulative_size` starts equal to `size`.
    #[must_use]
    pub const fn new(
        id: TradeId,
        timestamp: DateTime<Utc>,
        price: Decimal,
        size: Decimal,
        side: Side,
    ) -> Self {
        Self {
            id,
            timestamp,
            price,
            size,
            side,
            buyer_id: None,
            seller_id: None,
            cumulative_size: size,
        }
    }

    /// Attach counterparty order ids.
    #[must_use]
    pub fn with_counterparties(
        mut self,
        buyer_id: impl Into<String>,
        seller_id: impl Into<String>,
    ) -> Self {
        self.buyer_id = Some(buyer_id.into());
        self.seller_id = Some(seller_id.into());
        self
    }

    /// Id of the aggressive order, if known.
    #[must_use]
    pub fn taker_id(&self) -> Option<&str> {
        match self.side {
            Side::Buy => self.buyer_id.as_deref(),
            Side::Sell => self.seller_id.as_deref(),
        }
    }

    /// Classify this trade against the previous one on the tape.
    #[must_use]
    pub fn consecutive_with(&self, previous: &Self) -> Consecutive {
        if self.side != previous.side {
            return Consecutive::Difference;
        }
        match (self.taker_id(), previous.taker_id()) {
            (Some(current), Some(prior)) if current == prior => match self.side {
                Side::Buy => Consecutive::SameBuyer,
                Side::Sell => Consecutive::SameSeller,
            },
            _ => Consecutive::Difference,
        }
    }

    /// Copy of this trade with `cumulative_size` carried over from the
    /// previous fill of the same taker.
    #[must_use]
    pub fn accumulate_from(&self, previous: &Self) -> Self {
        let mut next = self.clone();
        next.cumulative_size = match self.consecutive_with(previous) {
            Consecutive::Difference => self.size,
            Consecutive::SameBuyer | Consecutive::SameSeller => {
                previous.cumulative_size + self.size
            }
        };
        next
    }
}

// =============================================================================
// Tests
// =============================================================================
