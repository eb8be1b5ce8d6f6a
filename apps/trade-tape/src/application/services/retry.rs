//! Retry Policy
//!
//! Bounded-attempt backoff around one fallible venue operation. Each policy
//! carries a name (`<market>-rest`, `<market>-realtime`) so that REST and
//! realtime failures of one market, and the failures of different markets,
//! are counted and logged separately.
//!
//! The delay before retry `n` (zero-based) is `min(base * (n + 1)^2, max)`,
//! which with the defaults gives 1s, 4s, 9s, ... capped at 15 minutes.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::application::ports::SourceError;
use crate::error::ReconcileError;
use crate::infrastructure::metrics;

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total attempts allowed in one scope, including the first.
    pub max_attempts: u32,
    /// Unit of the quadratic delay schedule.
    pub base_delay: Duration,
    /// Upper bound of any single delay.
    pub max_delay: Duration,
    /// Jitter factor as a fraction (e.g., 0.1 = ±10% randomization).
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(900),
            jitter_factor: 0.0,
        }
    }
}

impl RetryConfig {
    /// Create a new configuration with custom values.
    #[must_use]
    pub const fn new(
        max_attempts: u32,
        base_delay: Duration,
        max_delay: Duration,
        jitter_factor: f64,
    ) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            jitter_factor,
        }
    }
}

/// Named retry scope.
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use trade_tape::application::services::{RetryConfig, RetryPolicy};
///
/// let mut policy = RetryPolicy::new("BTC-USD-rest", RetryConfig::default());
/// assert_eq!(policy.next_delay(), Some(Duration::from_secs(1)));
/// assert_eq!(policy.next_delay(), Some(Duration::from_secs(4)));
/// policy.reset();
/// assert_eq!(policy.attempt_count(), 0);
/// ```
#[derive(Debug)]
pub struct RetryPolicy {
    name: String,
    config: RetryConfig,
    attempt_count: u32,
}

impl RetryPolicy {
    /// Create a policy.
    #[must_use]
    pub fn new(name: impl Into<String>, config: RetryConfig) -> Self {
        Self {
            name: name.into(),
            config,
            attempt_count: 0,
        }
    }

    /// Policy name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Failed attempts recorded since the last reset.
    #[must_use]
    pub const fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    /// Whether another attempt is allowed.
    #[must_use]
    pub const fn should_retry(&self) -> bool {
        self.attempt_count.saturating_add(1) < self.config.max_attempts
    }

    /// Forget previous failures after a successful emission.
    pub const fn reset(&mut self) {
        self.attempt_count = 0;
    }

    /// Unjittered delay before retry `retry` (zero-based).
    #[must_use]
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = u64::from(retry).saturating_add(1);
        let squared = u32::try_from(factor.saturating_mul(factor)).unwrap_or(u32::MAX);
        self.config
            .base_delay
            .saturating_mul(squared)
            .min(self.config.max_delay)
    }

    /// Record a failed attempt and return the delay before the next one.
    ///
    /// Returns `None` once the attempt budget is spent.
    #[must_use]
    pub fn next_delay(&mut self) -> Option<Duration> {
        if !self.should_retry() {
            self.attempt_count = self.config.max_attempts.max(1);
            return None;
        }
        let delay = self.delay_for(self.attempt_count);
        self.attempt_count += 1;
        Some(self.apply_jitter(delay))
    }

    /// Account for `error` and sleep until the next attempt is due.
    ///
    /// # Errors
    ///
    /// - [`ReconcileError::Fatal`] if `error` is not retryable.
    /// - [`ReconcileError::RetryExhausted`] once the budget is spent.
    /// - [`ReconcileError::Disposed`] if `cancel` fires while waiting.
    pub async fn backoff(
        &mut self,
        cancel: &CancellationToken,
        error: SourceError,
    ) -> Result<(), ReconcileError> {
        if !error.is_retryable() {
            tracing::error!(policy = %self.name, error = %error, "Non-retryable venue error");
            return Err(ReconcileError::Fatal(error));
        }

        let Some(delay) = self.next_delay() else {
            tracing::error!(
                policy = %self.name,
                attempts = self.attempt_count,
                error = %error,
                "Retry attempts exhausted"
            );
            return Err(ReconcileError::RetryExhausted {
                policy: self.name.clone(),
                attempts: self.attempt_count,
                source: error,
            });
        };

        metrics::record_retry(&self.name);
        tracing::warn!(
            policy = %self.name,
            attempt = self.attempt_count,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error = %error,
            "Retrying after failure"
        );

        tokio::select! {
            () = cancel.cancelled() => Err(ReconcileError::Disposed),
            () = tokio::time::sleep(delay) => Ok(()),
        }
    }

    /// Run `operation` until it succeeds, the budget is spent, or `cancel`
    /// fires. Success resets the attempt counter.
    ///
    /// # Errors
    ///
    /// See [`RetryPolicy::backoff`].
    pub async fn run<T, F, Fut>(
        &mut self,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> Result<T, ReconcileError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SourceError>>,
    {
        loop {
            if cancel.is_cancelled() {
                return Err(ReconcileError::Disposed);
            }
            match operation().await {
                Ok(value) => {
                    self.reset();
                    return Ok(value);
                }
                Err(error) => self.backoff(cancel, error).await?,
            }
        }
    }

    fn apply_jitter(&self, duration: Duration) -> Duration {
        if self.config.jitter_factor <= 0.0 {
            return duration;
        }

        #[allow(clippy::cast_precision_loss)]
        let base_millis = duration.as_millis() as f64;
        let jitter_range = base_millis * self.config.jitter_factor;
        let mut rng = rand::rng();
        let jitter: f64 = rng.random_range(-jitter_range..=jitter_range);
        let adjusted_millis = (base_millis + jitter).max(1.0);

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let adjusted_u64 = adjusted_millis as u64;
        Duration::from_millis(adjusted_u64)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn fast_config(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
            jitter_factor: 0.0,
        }
    }

    #[test]
    fn default_config_values() {
        let config = RetryConfig::default();
        assert_eq!(config.max_attempts, 10);
        assert_eq!(config.base_delay, Duration::from_secs(1));
        assert_eq!(config.max_delay, Duration::from_secs(900));
    }

    #[test]
    fn quadratic_schedule() {
        let policy = RetryPolicy::new("test", RetryConfig::default());
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(4));
        assert_eq!(policy.delay_for(2), Duration::from_secs(9));
        assert_eq!(policy.delay_for(9), Duration::from_secs(100));
    }

    #[test]
    fn schedule_is_capped() {
        let policy = RetryPolicy::new("test", RetryConfig::default());
        assert_eq!(policy.delay_for(29), Duration::from_secs(900));
        assert_eq!(policy.delay_for(1_000), Duration::from_secs(900));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(900));
    }

    #[test]
    fn budget_counts_first_attempt() {
        let mut policy = RetryPolicy::new("test", fast_config(3));
        assert!(policy.next_delay().is_some());
        assert!(policy.next_delay().is_some());
        assert!(policy.next_delay().is_none());
        assert_eq!(policy.attempt_count(), 3);
    }

    #[test]
    fn reset_restores_schedule() {
        let mut policy = RetryPolicy::new("test", RetryConfig::default());
        let _ = policy.next_delay();
        let _ = policy.next_delay();
        policy.reset();
        assert_eq!(policy.attempt_count(), 0);
        assert_eq!(policy.next_delay(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn jitter_bounds() {
        for _ in 0..100 {
            let mut policy = RetryPolicy::new(
                "test",
                RetryConfig {
                    jitter_factor: 0.1,
                    ..RetryConfig::default()
                },
            );
            let millis = policy.next_delay().unwrap().as_millis();
            assert!((900..=1100).contains(&millis), "delay {millis}ms out of range");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut policy = RetryPolicy::new("test", fast_config(5));
        let cancel = CancellationToken::new();

        let counter = Arc::clone(&calls);
        let result = policy
            .run(&cancel, move || {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 3 {
                        Err(SourceError::Timeout)
                    } else {
                        Ok(7)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(policy.attempt_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failure_exhausts_budget() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut policy = RetryPolicy::new("BTC-USD-rest", fast_config(4));
        let cancel = CancellationToken::new();

        let counter = Arc::clone(&calls);
        let result: Result<(), _> = policy
            .run(&cancel, move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(SourceError::Status {
                        status: 503,
                        message: "maintenance".into(),
                    })
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        match result {
            Err(ReconcileError::RetryExhausted {
                policy, attempts, ..
            }) => {
                assert_eq!(policy, "BTC-USD-rest");
                assert_eq!(attempts, 4);
            }
            other => panic!("expected RetryExhausted, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_fails_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut policy = RetryPolicy::new("test", fast_config(10));
        let cancel = CancellationToken::new();

        let counter = Arc::clone(&calls);
        let result: Result<(), _> = policy
            .run(&cancel, move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(SourceError::Rejected("unknown market".into()))
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(ReconcileError::Fatal(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_backoff() {
        let mut policy = RetryPolicy::new("test", RetryConfig::default());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = policy.backoff(&cancel, SourceError::Timeout).await;
        assert!(matches!(result, Err(ReconcileError::Disposed)));
    }
}
