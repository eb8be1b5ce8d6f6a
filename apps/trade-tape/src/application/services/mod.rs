//! Application Services
//!
//! Services that turn a venue's REST history and realtime feed into one
//! ordered trade tape.
//!
//! - `RetryPolicy`: Bounded quadratic backoff per named scope
//! - `HistoricalLocator`: Finds the first trade, or the trade nearest a time
//! - `RealtimeBuffer`: Queues live trades until backfill catches up
//! - `AdaptiveSizer` / `BackfillLoop`: Walks history in adaptive windows
//! - `StreamReconciler`: Runs the pipeline and multicasts its output
//! - `MarketRegistry`: One reconciler per market

pub mod backfill;
pub mod locator;
pub mod realtime_buffer;
pub mod reconciler;
pub mod registry;
pub mod retry;
pub mod sizer;

pub use backfill::{BackfillLoop, BackfillOutcome};
pub use locator::HistoricalLocator;
pub use realtime_buffer::RealtimeBuffer;
pub use reconciler::{ReconcilerConfig, StartPoint, StreamReconciler, TapeStream};
pub use registry::MarketRegistry;
pub use retry::{RetryConfig, RetryPolicy};
pub use sizer::{AdaptiveSizer, GrowthTier, SizerConfig};
