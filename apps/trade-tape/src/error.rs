//! Terminal errors surfaced to tape subscribers.
//!
//! Transient collaborator faults never reach a subscriber directly: they are
//! retried by the owning [`RetryPolicy`](crate::application::services::RetryPolicy)
//! and only surface here once the policy gives up, or when the fault is of a
//! kind that retrying cannot fix.
//!
//! | Variant | Cause | Stream outcome |
//! |---------|-------|----------------|
//! | `RetryExhausted` | Retry bound reached on REST or realtime | Terminated |
//! | `Fatal` | Non-retryable venue response (4xx, rejection) | Terminated |
//! | `LocatorDiverged` | History search failed to converge | Terminated |
//! | `ConsumerLagged` | Subscriber fell behind the multicast buffer | That subscriber only |
//! | `Disposed` | Reconciler torn down | Stream ends |

use thiserror::Error;

use crate::application::ports::SourceError;

/// Error delivered as the final item of a tape stream.
///
/// Cloneable so one failure can be multicast to every subscriber.
#[derive(Debug, Clone, Error)]
pub enum ReconcileError {
    /// A retry scope ran out of attempts.
    #[error("{policy}: gave up after {attempts} attempts: {source}")]
    RetryExhausted {
        /// Name of the retry policy (market and channel).
        policy: String,
        /// Number of attempts made, including the first.
        attempts: u32,
        /// Last failure observed.
        source: SourceError,
    },

    /// The venue returned an error that must not be retried.
    #[error("non-retryable venue error: {0}")]
    Fatal(SourceError),

    /// A history search failed to bracket its target.
    #[error("history locator did not converge: {detail}")]
    LocatorDiverged {
        /// Search state at the point of failure.
        detail: String,
    },

    /// The subscriber could not keep up and missed trades.
    #[error("subscriber lagged behind and skipped {skipped} trades")]
    ConsumerLagged {
        /// Number of trades the subscriber missed.
        skipped: u64,
    },

    /// The reconciler was disposed.
    #[error("stream reconciler disposed")]
    Disposed,
}

impl ReconcileError {
    /// Short label used for metrics and log fields.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::RetryExhausted { .. } => "retry_exhausted",
            Self::Fatal(_) => "fatal",
            Self::LocatorDiverged { .. } => "locator_diverged",
            Self::ConsumerLagged { .. } => "consumer_lagged",
            Self::Disposed => "disposed",
        }
    }

    /// Whether the error ends the shared stream for every subscriber.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::ConsumerLagged { .. } | Self::Disposed)
    }
}
