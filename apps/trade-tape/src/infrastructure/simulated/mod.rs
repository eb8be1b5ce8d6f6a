//! Simulated Venue
//!
//! Deterministic in-memory [`MarketDataSource`] used by the service binary
//! and the test suites. It holds a sorted trade history, pushes newly
//! published trades to every open realtime connection, and can inject REST
//! failures and realtime disconnects on demand.
//!
//! Trade `id` is generated at `SIM_EPOCH + id` seconds, so timestamps are
//! strictly increasing in id and gaps in id are gaps in time.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::application::ports::{MarketDataSource, SourceError, TradeStream};
use crate::domain::trade::{Side, Trade, TradeId};

/// Unix time of trade id 0.
const SIM_EPOCH: i64 = 1_700_000_000;

/// Simulated venue configuration.
#[derive(Debug, Clone)]
pub struct SimulatedVenueConfig {
    /// Market identifier.
    pub market_id: String,
    /// Maximum trades per REST response.
    pub page_size: usize,
    /// Whether `fetch_after` honours its end id.
    pub stable_range: bool,
    /// Value reported by `estimate_last_id`.
    pub estimated_last_id: Option<TradeId>,
    /// Delay added to every REST response.
    pub rest_latency: Duration,
}

impl Default for SimulatedVenueConfig {
    fn default() -> Self {
        Self {
            market_id: "SIM".to_string(),
            page_size: 100,
            stable_range: true,
            estimated_last_id: None,
            rest_latency: Duration::ZERO,
        }
    }
}

/// Calls served so far, per operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    /// `fetch_after` calls, failed ones included.
    pub fetch_after: u64,
    /// `fetch_before` calls, failed ones included.
    pub fetch_before: u64,
    /// `fetch_latest` calls, failed ones included.
    pub fetch_latest: u64,
    /// `subscribe_realtime` calls, failed ones included.
    pub subscribe_realtime: u64,
}

type LiveSender = mpsc::UnboundedSender<Result<Trade, SourceError>>;

#[derive(Debug, Default)]
struct VenueState {
    history: Vec<Trade>,
    subscribers: Vec<LiveSender>,
}

#[derive(Debug, Default)]
struct Counters {
    fetch_after: AtomicU64,
    fetch_before: AtomicU64,
    fetch_latest: AtomicU64,
    subscribe_realtime: AtomicU64,
}

/// In-memory venue for one market.
#[derive(Debug)]
pub struct SimulatedVenue {
    config: SimulatedVenueConfig,
    state: Mutex<VenueState>,
    rest_failures: AtomicU32,
    subscribe_failures: AtomicU32,
    counters: Counters,
}

impl SimulatedVenue {
    /// Create a venue with no history.
    #[must_use]
    pub fn new(config: SimulatedVenueConfig) -> Self {
        Self {
            config,
            state: Mutex::new(VenueState::default()),
            rest_failures: AtomicU32::new(0),
            subscribe_failures: AtomicU32::new(0),
            counters: Counters::default(),
        }
    }

    /// Create a venue whose history holds the given ids.
    #[must_use]
    pub fn with_history(
        config: SimulatedVenueConfig,
        ids: impl IntoIterator<Item = TradeId>,
    ) -> Self {
        let venue = Self::new(config);
        {
            let mut state = venue.state.lock();
            state.history = ids.into_iter().map(Self::trade_for).collect();
            state.history.sort_by_key(|trade| trade.id);
            state.history.dedup_by_key(|trade| trade.id);
        }
        venue
    }

    /// Timestamp of trade `id`.
    #[must_use]
    pub fn timestamp_for(id: TradeId) -> DateTime<Utc> {
        DateTime::from_timestamp(SIM_EPOCH.saturating_add(id), 0).unwrap_or_default()
    }

    /// The trade this venue generates for `id`.
    #[must_use]
    pub fn trade_for(id: TradeId) -> Trade {
        let side = if id % 2 == 0 { Side::Buy } else { Side::Sell };
        let taker = id / 3;
        Trade::new(
            id,
            Self::timestamp_for(id),
            Decimal::new(10_000 + id % 97, 2),
            Decimal::new(1 + id % 9, 3),
            side,
        )
        .with_counterparties(format!("B{taker}"), format!("S{taker}"))
    }

    // =========================================================================
    // Live publication
    // =========================================================================

    /// Append `count` consecutive trades and push them to realtime
    /// subscribers.
    pub fn publish(&self, count: usize) -> Vec<Trade> {
        let mut state = self.state.lock();
        let last = state.history.last().map_or(0, |trade| trade.id);
        let trades: Vec<Trade> = (1..=TradeId::try_from(count).unwrap_or(TradeId::MAX))
            .map(|offset| Self::trade_for(last + offset))
            .collect();
        for trade in &trades {
            Self::append(&mut state, trade.clone());
        }
        trades
    }

    /// Append one trade with an explicit id. Ids not above the current last
    /// id are ignored.
    pub fn publish_id(&self, id: TradeId) -> Option<Trade> {
        let mut state = self.state.lock();
        if state.history.last().is_some_and(|last| last.id >= id) {
            return None;
        }
        let trade = Self::trade_for(id);
        Self::append(&mut state, trade.clone());
        Some(trade)
    }

    fn append(state: &mut VenueState, trade: Trade) {
        state
            .subscribers
            .retain(|subscriber| subscriber.send(Ok(trade.clone())).is_ok());
        state.history.push(trade);
    }

    /// Publish one trade every `interval` until cancelled.
    pub async fn run_live(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.publish(1);
                }
            }
        }
        tracing::debug!(market = %self.config.market_id, "Simulated feed stopped");
    }

    // =========================================================================
    // Fault injection
    // =========================================================================

    /// Fail the next `count` REST calls with a 503.
    pub fn fail_next_rest(&self, count: u32) {
        self.rest_failures.store(count, Ordering::SeqCst);
    }

    /// Fail the next `count` realtime subscriptions.
    pub fn fail_next_subscribe(&self, count: u32) {
        self.subscribe_failures.store(count, Ordering::SeqCst);
    }

    /// Drop every open realtime connection.
    pub fn disconnect_realtime(&self) {
        let subscribers = std::mem::take(&mut self.state.lock().subscribers);
        for subscriber in subscribers {
            let _ = subscriber.send(Err(SourceError::Disconnected));
        }
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    /// Number of open realtime connections.
    #[must_use]
    pub fn realtime_connections(&self) -> usize {
        let mut state = self.state.lock();
        state.subscribers.retain(|subscriber| !subscriber.is_closed());
        state.subscribers.len()
    }

    /// Id of the newest trade.
    #[must_use]
    pub fn last_id(&self) -> Option<TradeId> {
        self.state.lock().history.last().map(|trade| trade.id)
    }

    /// Calls served so far.
    #[must_use]
    pub fn calls(&self) -> CallCounts {
        CallCounts {
            fetch_after: self.counters.fetch_after.load(Ordering::SeqCst),
            fetch_before: self.counters.fetch_before.load(Ordering::SeqCst),
            fetch_latest: self.counters.fetch_latest.load(Ordering::SeqCst),
            subscribe_realtime: self.counters.subscribe_realtime.load(Ordering::SeqCst),
        }
    }

    async fn rest_call(&self, counter: &AtomicU64) -> Result<(), SourceError> {
        counter.fetch_add(1, Ordering::SeqCst);
        if !self.config.rest_latency.is_zero() {
            tokio::time::sleep(self.config.rest_latency).await;
        }
        if take_one(&self.rest_failures) {
            return Err(SourceError::Status {
                status: 503,
                message: "simulated outage".to_string(),
            });
        }
        Ok(())
    }
}

fn take_one(budget: &AtomicU32) -> bool {
    budget
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl MarketDataSource for SimulatedVenue {
    fn market_id(&self) -> &str {
        &self.config.market_id
    }

    fn page_size(&self) -> usize {
        self.config.page_size
    }

    async fn fetch_after(
        &self,
        start_id: TradeId,
        end_id: TradeId,
    ) -> Result<Vec<Trade>, SourceError> {
        self.rest_call(&self.counters.fetch_after).await?;
        let state = self.state.lock();
        let from = state.history.partition_point(|trade| trade.id <= start_id);
        let stable = self.config.stable_range;
        Ok(state.history[from..]
            .iter()
            .take_while(|trade| !stable || trade.id <= end_id)
            .take(self.config.page_size)
            .cloned()
            .collect())
    }

    async fn fetch_before(&self, before_id: TradeId) -> Result<Vec<Trade>, SourceError> {
        self.rest_call(&self.counters.fetch_before).await?;
        let state = self.state.lock();
        let to = state.history.partition_point(|trade| trade.id < before_id);
        let from = to.saturating_sub(self.config.page_size);
        Ok(state.history[from..to].to_vec())
    }

    async fn fetch_latest(&self) -> Result<Option<Trade>, SourceError> {
        self.rest_call(&self.counters.fetch_latest).await?;
        Ok(self.state.lock().history.last().cloned())
    }

    async fn subscribe_realtime(&self) -> Result<TradeStream, SourceError> {
        self.counters
            .subscribe_realtime
            .fetch_add(1, Ordering::SeqCst);
        if take_one(&self.subscribe_failures) {
            return Err(SourceError::Disconnected);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().subscribers.push(tx);
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    fn supports_stable_range_query(&self) -> bool {
        self.config.stable_range
    }

    async fn estimate_last_id(&self) -> Option<TradeId> {
        self.config.estimated_last_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn venue(ids: impl IntoIterator<Item = TradeId>) -> SimulatedVenue {
        SimulatedVenue::with_history(
            SimulatedVenueConfig {
                page_size: 10,
                ..SimulatedVenueConfig::default()
            },
            ids,
        )
    }

    fn ids(trades: &[Trade]) -> Vec<TradeId> {
        trades.iter().map(|trade| trade.id).collect()
    }

    #[tokio::test]
    async fn fetch_after_honours_range_and_page() {
        let venue = venue(1..=100);
        assert_eq!(ids(&venue.fetch_after(0, 5).await.unwrap()), vec![1, 2, 3, 4, 5]);
        assert_eq!(
            ids(&venue.fetch_after(50, 500).await.unwrap()),
            (51..=60).collect::<Vec<_>>()
        );
        assert!(venue.fetch_after(100, 200).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unstable_range_ignores_end() {
        let venue = SimulatedVenue::with_history(
            SimulatedVenueConfig {
                page_size: 10,
                stable_range: false,
                ..SimulatedVenueConfig::default()
            },
            1..=100,
        );
        assert_eq!(venue.fetch_after(0, 3).await.unwrap().len(), 10);
        assert!(!venue.supports_stable_range_query());
    }

    #[tokio::test]
    async fn fetch_before_returns_newest_page_below() {
        let venue = venue((1..=100).step_by(2));
        assert_eq!(
            ids(&venue.fetch_before(30).await.unwrap()),
            vec![11, 13, 15, 17, 19, 21, 23, 25, 27, 29]
        );
        assert_eq!(ids(&venue.fetch_before(4).await.unwrap()), vec![1, 3]);
        assert!(venue.fetch_before(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn publish_reaches_history_and_subscribers() {
        let venue = venue(1..=3);
        let mut live = venue.subscribe_realtime().await.unwrap();
        venue.publish(2);

        assert_eq!(live.next().await.unwrap().unwrap().id, 4);
        assert_eq!(live.next().await.unwrap().unwrap().id, 5);
        assert_eq!(venue.last_id(), Some(5));
        assert_eq!(venue.fetch_latest().await.unwrap().unwrap().id, 5);
    }

    #[tokio::test]
    async fn disconnect_ends_streams() {
        let venue = venue(1..=3);
        let mut live = venue.subscribe_realtime().await.unwrap();
        venue.disconnect_realtime();
        assert!(matches!(live.next().await, Some(Err(SourceError::Disconnected))));
        assert!(live.next().await.is_none());
        assert_eq!(venue.realtime_connections(), 0);
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let venue = venue(1..=3);
        venue.fail_next_rest(2);
        assert!(venue.fetch_latest().await.is_err());
        assert!(venue.fetch_before(3).await.is_err());
        assert!(venue.fetch_latest().await.is_ok());
        assert_eq!(venue.calls().fetch_latest, 2);
        assert_eq!(venue.calls().fetch_before, 1);
    }

    #[test]
    fn generated_trades_are_deterministic() {
        assert_eq!(SimulatedVenue::trade_for(9), SimulatedVenue::trade_for(9));
        assert!(SimulatedVenue::timestamp_for(2) > SimulatedVenue::timestamp_for(1));
    }
}
