#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Trade Tape - Execution Stream Reconciliation
//!
//! Turns a venue's paginated REST trade history and its realtime push feed
//! into one ordered, gap-free, duplicate-free stream of executions per
//! market, multicast to any number of subscribers.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Trade records and reconciliation state
//!   - `trade`: Executions and taker-run classification
//!   - `cursor`: Per-market progress shared with diagnostics
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: The venue contract and the trade observer
//!   - `services`: Retry, locator, buffer, backfill, reconciler, registry
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `broadcast`: Channel-based multicast of each tape
//!   - `simulated`: In-memory venue for the binary and tests
//!   - `config`: Environment configuration
//!   - `health`: Health check HTTP endpoint
//!   - `metrics` / `telemetry`: Prometheus and tracing
//!
//! # Data Flow
//!
//! ```text
//! Venue REST ──▶ BackfillLoop ──┐
//!                               ├──▶ CursorObserver ──▶ Broadcast ──▶ Subscriber 1..N
//! Venue WS ───▶ RealtimeBuffer ─┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Trade records with no I/O.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

/// Crate-wide terminal error.
pub mod error;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::cursor::{CursorSnapshot, StreamCursor, StreamPhase};
pub use domain::trade::{Consecutive, Side, Trade, TradeId, TradeOrigin};

// Ports
pub use application::ports::{MarketDataSource, SourceError, TradeObserver, TradeStream};

// Services
pub use application::services::{
    AdaptiveSizer, HistoricalLocator, MarketRegistry, RealtimeBuffer, ReconcilerConfig,
    RetryConfig, RetryPolicy, SizerConfig, StartPoint, StreamReconciler, TapeStream,
};

// Errors
pub use error::ReconcileError;

// Infrastructure config
pub use infrastructure::config::{ConfigError, TapeConfig};

// Health server
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};

// Simulated venue (for integration tests)
pub use infrastructure::simulated::{CallCounts, SimulatedVenue, SimulatedVenueConfig};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
