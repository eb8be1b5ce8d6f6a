//! Prometheus Metrics Module
//!
//! Exposes reconciliation metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **REST**: Venue queries by kind, retries by policy
//! - **Delivery**: Trades delivered by origin, trades discarded as stale
//! - **Switchover**: Backfill-to-realtime handoffs, window coefficient
//! - **Subscribers**: Active tape subscribers per market
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port. Recording
//! functions are no-ops until [`init_metrics`] installs the recorder.

use std::sync::OnceLock;

use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::domain::trade::TradeOrigin;

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// # Panics
///
/// Panics if the recorder cannot be installed.
#[allow(clippy::expect_used)]
pub fn init_metrics() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            let builder = PrometheusBuilder::new();
            let handle = builder
                .install_recorder()
                .expect("failed to install Prometheus recorder");

            register_metrics();
            handle
        })
        .clone()
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    describe_counter!(
        "trade_tape_rest_requests_total",
        "Total REST queries issued to venues"
    );
    describe_counter!(
        "trade_tape_retries_total",
        "Total retries scheduled by retry policy"
    );
    describe_counter!(
        "trade_tape_trades_delivered_total",
        "Total trades delivered to subscribers"
    );
    describe_counter!(
        "trade_tape_trades_discarded_total",
        "Total trades dropped for not advancing the tape"
    );
    describe_counter!(
        "trade_tape_switchovers_total",
        "Total handoffs from REST backfill to the realtime feed"
    );
    describe_gauge!(
        "trade_tape_window_coefficient",
        "Current REST window coefficient"
    );
    describe_gauge!("trade_tape_subscribers", "Active tape subscribers");
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Metric labels for REST query kinds.
#[derive(Debug, Clone, Copy)]
pub enum RestCall {
    /// Range query after an id.
    FetchAfter,
    /// Page before an id.
    FetchBefore,
    /// Latest trade.
    FetchLatest,
}

impl RestCall {
    const fn as_str(self) -> &'static str {
        match self {
            Self::FetchAfter => "fetch_after",
            Self::FetchBefore => "fetch_before",
            Self::FetchLatest => "fetch_latest",
        }
    }
}

/// Record a REST query.
pub fn record_rest_request(market: &str, kind: RestCall) {
    counter!(
        "trade_tape_rest_requests_total",
        "market" => market.to_string(),
        "kind" => kind.as_str()
    )
    .increment(1);
}

/// Record a scheduled retry.
pub fn record_retry(policy: &str) {
    counter!(
        "trade_tape_retries_total",
        "policy" => policy.to_string()
    )
    .increment(1);
}

/// Record a trade delivered to subscribers.
pub fn record_trade_delivered(market: &str, origin: TradeOrigin) {
    counter!(
        "trade_tape_trades_delivered_total",
        "market" => market.to_string(),
        "origin" => origin.as_str()
    )
    .increment(1);
}

/// Record a stale trade dropped by the ordering guard.
pub fn record_trade_discarded(market: &str) {
    counter!(
        "trade_tape_trades_discarded_total",
        "market" => market.to_string()
    )
    .increment(1);
}

/// Record a backfill-to-realtime handoff.
pub fn record_switchover(market: &str) {
    counter!(
        "trade_tape_switchovers_total",
        "market" => market.to_string()
    )
    .increment(1);
}

/// Update the window coefficient of a market.
pub fn set_window_coefficient(market: &str, coefficient: f64) {
    gauge!(
        "trade_tape_window_coefficient",
        "market" => market.to_string()
    )
    .set(coefficient);
}

/// Update the subscriber count of a market.
#[allow(clippy::cast_precision_loss)]
pub fn set_subscribers(market: &str, count: usize) {
    gauge!(
        "trade_tape_subscribers",
        "market" => market.to_string()
    )
    .set(count as f64);
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rest_call_as_str() {
        assert_eq!(RestCall::FetchAfter.as_str(), "fetch_after");
        assert_eq!(RestCall::FetchBefore.as_str(), "fetch_before");
        assert_eq!(RestCall::FetchLatest.as_str(), "fetch_latest");
    }

    #[test]
    fn recording_without_recorder_is_noop() {
        record_rest_request("TEST", RestCall::FetchAfter);
        record_retry("TEST-rest");
        record_trade_delivered("TEST", TradeOrigin::Realtime);
        set_window_coefficient("TEST", 2.5);
        set_subscribers("TEST", 3);
    }
}
