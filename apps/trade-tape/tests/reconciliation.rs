//! Reconciliation Integration Tests
//!
//! Drives full pipelines against the simulated venue on a paused clock:
//! backfill into realtime handover, multicast, disposal, feed loss and
//! retry budgets.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use trade_tape::{
    MarketDataSource, ReconcileError, ReconcilerConfig, RetryConfig, SimulatedVenue,
    SimulatedVenueConfig, SourceError, StartPoint, StreamReconciler, TapeStream, Trade, TradeId,
    TradeStream,
};

fn venue(
    config: SimulatedVenueConfig,
    ids: impl IntoIterator<Item = TradeId>,
) -> Arc<SimulatedVenue> {
    Arc::new(SimulatedVenue::with_history(config, ids))
}

fn paged(page_size: usize) -> SimulatedVenueConfig {
    SimulatedVenueConfig {
        page_size,
        ..SimulatedVenueConfig::default()
    }
}

async fn take_ids(stream: &mut TapeStream, count: usize) -> Vec<TradeId> {
    let mut ids = Vec::with_capacity(count);
    while ids.len() < count {
        match stream.next().await {
            Some(Ok(trade)) => ids.push(trade.id),
            other => panic!("unexpected item after {} trades: {other:?}", ids.len()),
        }
    }
    ids
}

fn range(from: TradeId, to: TradeId) -> Vec<TradeId> {
    (from..=to).collect()
}

/// Prints one trade on the venue right after answering the first non-empty
/// window, before the realtime feed has connected.
struct PrintsAfterFirstWindow {
    venue: Arc<SimulatedVenue>,
    armed: AtomicBool,
}

#[async_trait]
impl MarketDataSource for PrintsAfterFirstWindow {
    fn market_id(&self) -> &str {
        self.venue.market_id()
    }

    fn page_size(&self) -> usize {
        self.venue.page_size()
    }

    async fn fetch_after(
        &self,
        start_id: TradeId,
        end_id: TradeId,
    ) -> Result<Vec<Trade>, SourceError> {
        let batch = self.venue.fetch_after(start_id, end_id).await?;
        if !batch.is_empty() && self.armed.swap(false, Ordering::SeqCst) {
            self.venue.publish(1);
        }
        Ok(batch)
    }

    async fn fetch_before(&self, before_id: TradeId) -> Result<Vec<Trade>, SourceError> {
        self.venue.fetch_before(before_id).await
    }

    async fn fetch_latest(&self) -> Result<Option<Trade>, SourceError> {
        self.venue.fetch_latest().await
    }

    async fn subscribe_realtime(&self) -> Result<TradeStream, SourceError> {
        self.venue.subscribe_realtime().await
    }

    fn supports_stable_range_query(&self) -> bool {
        self.venue.supports_stable_range_query()
    }
}

// =============================================================================
// Backfill into realtime
// =============================================================================

#[tokio::test(start_paused = true)]
async fn backfill_then_live_trades_without_gaps() {
    let venue = venue(paged(100), 1..=500);
    let reconciler = StreamReconciler::new(venue.clone(), ReconcilerConfig::default());
    let mut tape = reconciler.subscribe();

    let publisher = Arc::clone(&venue);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        publisher.publish_id(501);
        publisher.publish_id(502);
    });

    assert_eq!(take_ids(&mut tape, 502).await, range(1, 502));
    let calls = venue.calls();
    assert!(calls.fetch_after <= 5, "{} window requests", calls.fetch_after);
    assert_eq!(calls.subscribe_realtime, 1);

    reconciler.dispose();
    reconciler.join().await;
}

#[tokio::test(start_paused = true)]
async fn live_trades_during_slow_backfill_are_merged_in_order() {
    let venue = venue(
        SimulatedVenueConfig {
            rest_latency: Duration::from_millis(10),
            ..paged(100)
        },
        1..=1_000,
    );
    let feed = CancellationToken::new();
    tokio::spawn(Arc::clone(&venue).run_live(Duration::from_millis(5), feed.clone()));

    let reconciler = StreamReconciler::new(venue.clone(), ReconcilerConfig::default());
    let mut tape = reconciler.subscribe();

    assert_eq!(take_ids(&mut tape, 1_500).await, range(1, 1_500));
    assert_eq!(venue.calls().subscribe_realtime, 1);

    feed.cancel();
    reconciler.dispose();
}

#[tokio::test(start_paused = true)]
async fn unstable_ranges_still_produce_a_contiguous_tape() {
    let venue = venue(
        SimulatedVenueConfig {
            stable_range: false,
            ..paged(50)
        },
        1..=300,
    );
    let reconciler = StreamReconciler::new(venue.clone(), ReconcilerConfig::default());
    let mut tape = reconciler.subscribe();

    assert_eq!(take_ids(&mut tape, 300).await, range(1, 300));
    tokio::time::sleep(Duration::from_millis(10)).await;
    venue.publish(5);
    assert_eq!(take_ids(&mut tape, 5).await, range(301, 305));

    reconciler.dispose();
}

#[tokio::test(start_paused = true)]
async fn unstable_venue_keeps_trade_printed_before_first_connect() {
    let venue = venue(
        SimulatedVenueConfig {
            stable_range: false,
            ..paged(100)
        },
        1..=30,
    );
    let source = Arc::new(PrintsAfterFirstWindow {
        venue: Arc::clone(&venue),
        armed: AtomicBool::new(true),
    });
    let reconciler = StreamReconciler::new(source, ReconcilerConfig::default());
    let mut tape = reconciler.subscribe();

    assert_eq!(take_ids(&mut tape, 31).await, range(1, 31));
    tokio::time::sleep(Duration::from_millis(10)).await;
    venue.publish(2);
    assert_eq!(take_ids(&mut tape, 2).await, range(32, 33));
    assert_eq!(venue.calls().subscribe_realtime, 1);

    reconciler.dispose();
}

#[tokio::test(start_paused = true)]
async fn since_start_point_skips_older_history() {
    let venue = venue(paged(100), (1..=20_000).step_by(4));
    let config = ReconcilerConfig {
        start: StartPoint::Since(SimulatedVenue::timestamp_for(10_000)),
        ..ReconcilerConfig::default()
    };
    let reconciler = StreamReconciler::new(venue.clone(), config);
    let mut tape = reconciler.subscribe();

    let ids = take_ids(&mut tape, 3).await;
    assert_eq!(ids, vec![10_001, 10_005, 10_009]);

    reconciler.dispose();
}

// =============================================================================
// Multicast
// =============================================================================

#[tokio::test(start_paused = true)]
async fn subscribers_share_one_pipeline() {
    let venue = venue(paged(100), 1..=200);
    let reconciler = StreamReconciler::new(venue.clone(), ReconcilerConfig::default());
    let mut first = reconciler.subscribe();
    let mut second = reconciler.subscribe();
    assert_eq!(reconciler.subscriber_count(), 2);

    let expected = range(1, 200);
    assert_eq!(take_ids(&mut first, 200).await, expected);
    assert_eq!(take_ids(&mut second, 200).await, expected);

    tokio::time::sleep(Duration::from_millis(10)).await;
    let mut late = reconciler.subscribe();
    venue.publish(3);

    assert_eq!(take_ids(&mut late, 3).await, range(201, 203));
    assert_eq!(take_ids(&mut first, 3).await, range(201, 203));
    assert_eq!(take_ids(&mut second, 3).await, range(201, 203));

    let calls = venue.calls();
    assert_eq!(calls.subscribe_realtime, 1);
    assert_eq!(venue.realtime_connections(), 1);

    reconciler.dispose();
}

#[tokio::test(start_paused = true)]
async fn dispose_ends_every_stream_and_closes_the_feed() {
    let venue = venue(paged(100), 1..=50);
    let reconciler = StreamReconciler::new(venue.clone(), ReconcilerConfig::default());
    let mut first = reconciler.subscribe();
    let mut second = reconciler.subscribe();

    take_ids(&mut first, 50).await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(venue.realtime_connections(), 1);

    reconciler.dispose();
    reconciler.join().await;

    while let Some(item) = first.next().await {
        assert!(item.is_ok());
    }
    while let Some(item) = second.next().await {
        assert!(item.is_ok());
    }
    assert_eq!(venue.realtime_connections(), 0);
    assert!(matches!(
        reconciler.subscribe().next().await,
        Some(Err(ReconcileError::Disposed))
    ));
}

#[tokio::test(start_paused = true)]
async fn dropping_the_last_subscriber_closes_the_feed() {
    let venue = venue(paged(100), 1..=200);
    let reconciler = StreamReconciler::new(venue.clone(), ReconcilerConfig::default());
    let mut first = reconciler.subscribe();
    let second = reconciler.subscribe();

    assert_eq!(take_ids(&mut first, 50).await, range(1, 50));
    drop(second);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(venue.realtime_connections(), 1);

    drop(first);
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(venue.realtime_connections(), 0);
    assert_eq!(reconciler.subscriber_count(), 0);
    assert!(!reconciler.is_disposed());

    venue.publish(5);
    let mut again = reconciler.subscribe();
    assert_eq!(take_ids(&mut again, 205).await, range(1, 205));
    assert_eq!(venue.calls().subscribe_realtime, 2);

    reconciler.dispose();
}

// =============================================================================
// Feed loss and retries
// =============================================================================

#[tokio::test(start_paused = true)]
async fn feed_loss_after_switch_resyncs_from_last_delivered() {
    let venue = venue(paged(100), 1..=100);
    let reconciler = StreamReconciler::new(venue.clone(), ReconcilerConfig::default());
    let mut tape = reconciler.subscribe();

    assert_eq!(take_ids(&mut tape, 100).await, range(1, 100));
    tokio::time::sleep(Duration::from_millis(10)).await;
    venue.publish(2);
    assert_eq!(take_ids(&mut tape, 2).await, range(101, 102));

    venue.disconnect_realtime();
    venue.publish(3);
    tokio::time::sleep(Duration::from_secs(5)).await;
    venue.publish(2);

    assert_eq!(take_ids(&mut tape, 5).await, range(103, 107));
    assert_eq!(venue.calls().subscribe_realtime, 2);
    assert!(!reconciler.is_terminated());

    reconciler.dispose();
}

#[tokio::test(start_paused = true)]
async fn transient_rest_failures_are_absorbed() {
    let venue = venue(paged(20), 1..=50);
    venue.fail_next_rest(4);
    let reconciler = StreamReconciler::new(venue.clone(), ReconcilerConfig::default());
    let mut tape = reconciler.subscribe();

    assert_eq!(take_ids(&mut tape, 50).await, range(1, 50));
    assert!(!reconciler.is_terminated());

    reconciler.dispose();
}

#[tokio::test(start_paused = true)]
async fn failed_realtime_connects_are_retried() {
    let venue = venue(paged(100), 1..=20);
    venue.fail_next_subscribe(2);
    let reconciler = StreamReconciler::new(venue.clone(), ReconcilerConfig::default());
    let mut tape = reconciler.subscribe();

    assert_eq!(take_ids(&mut tape, 20).await, range(1, 20));
    tokio::time::sleep(Duration::from_secs(30)).await;
    venue.publish(1);

    assert_eq!(take_ids(&mut tape, 1).await, vec![21]);
    assert_eq!(venue.calls().subscribe_realtime, 3);

    reconciler.dispose();
}

#[tokio::test(start_paused = true)]
async fn exhausted_rest_retries_terminate_every_subscriber() {
    let venue = venue(paged(100), 1..=10);
    venue.fail_next_rest(u32::MAX);
    let config = ReconcilerConfig {
        retry: RetryConfig::new(3, Duration::from_millis(10), Duration::from_secs(1), 0.0),
        ..ReconcilerConfig::default()
    };
    let reconciler = StreamReconciler::new(venue.clone(), config);
    let mut first = reconciler.subscribe();
    let mut second = reconciler.subscribe();

    for tape in [&mut first, &mut second] {
        match tape.next().await {
            Some(Err(ReconcileError::RetryExhausted { policy, attempts, .. })) => {
                assert_eq!(policy, "SIM-rest");
                assert_eq!(attempts, 3);
            }
            other => panic!("expected retry exhaustion, got {other:?}"),
        }
        assert!(tape.next().await.is_none());
    }

    reconciler.join().await;
    assert!(reconciler.is_terminated());
    assert_eq!(venue.calls().fetch_latest, 3);
    assert_eq!(venue.calls().subscribe_realtime, 0);
}
