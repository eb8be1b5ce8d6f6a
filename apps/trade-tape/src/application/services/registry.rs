//! Market Registry
//!
//! Owns one [`StreamReconciler`] per market id. The registry is created by
//! the caller and passed where it is needed; there is no process-wide map.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::application::ports::MarketDataSource;
use crate::application::services::reconciler::{ReconcilerConfig, StreamReconciler};
use crate::domain::cursor::CursorSnapshot;

/// Per-market reconcilers sharing one configuration.
#[derive(Debug)]
pub struct MarketRegistry {
    config: ReconcilerConfig,
    markets: RwLock<HashMap<String, Arc<StreamReconciler>>>,
}

impl MarketRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new(config: ReconcilerConfig) -> Self {
        Self {
            config,
            markets: RwLock::new(HashMap::new()),
        }
    }

    /// Reconciler for `source`'s market, creating it if needed.
    ///
    /// A disposed or failed reconciler is replaced by a fresh one.
    pub fn register(&self, source: Arc<dyn MarketDataSource>) -> Arc<StreamReconciler> {
        let market = source.market_id().to_string();
        let mut markets = self.markets.write();
        if let Some(existing) = markets.get(&market)
            && !existing.is_disposed()
            && !existing.is_terminated()
        {
            return Arc::clone(existing);
        }

        let reconciler = Arc::new(StreamReconciler::new(source, self.config.clone()));
        if let Some(previous) = markets.insert(market.clone(), Arc::clone(&reconciler)) {
            previous.dispose();
            tracing::info!(market = %market, "Replaced finished reconciler");
        } else {
            tracing::info!(market = %market, "Registered market");
        }
        reconciler
    }

    /// Reconciler for `market`, if registered.
    #[must_use]
    pub fn get(&self, market: &str) -> Option<Arc<StreamReconciler>> {
        self.markets.read().get(market).cloned()
    }

    /// Dispose and forget one market. Returns whether it was registered.
    pub fn dispose(&self, market: &str) -> bool {
        let removed = self.markets.write().remove(market);
        removed.is_some_and(|reconciler| {
            reconciler.dispose();
            true
        })
    }

    /// Dispose every market and wait for their pipelines to stop.
    pub async fn dispose_all(&self) {
        let reconcilers: Vec<_> = self.markets.write().drain().map(|(_, r)| r).collect();
        for reconciler in &reconcilers {
            reconciler.dispose();
        }
        for reconciler in &reconcilers {
            reconciler.join().await;
        }
        tracing::info!(markets = reconcilers.len(), "All markets disposed");
    }

    /// Cursor snapshots of every market, sorted by market id.
    #[must_use]
    pub fn snapshots(&self) -> Vec<CursorSnapshot> {
        let mut snapshots: Vec<_> = self
            .markets
            .read()
            .values()
            .map(|reconciler| reconciler.snapshot())
            .collect();
        snapshots.sort_by(|a, b| a.market.cmp(&b.market));
        snapshots
    }

    /// Registered market ids, sorted.
    #[must_use]
    pub fn market_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.markets.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Number of registered markets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.markets.read().len()
    }

    /// Whether no market is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.markets.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;
    use crate::domain::cursor::StreamPhase;
    use crate::error::ReconcileError;
    use crate::infrastructure::simulated::{SimulatedVenue, SimulatedVenueConfig};

    fn venue(market: &str) -> Arc<SimulatedVenue> {
        Arc::new(SimulatedVenue::with_history(
            SimulatedVenueConfig {
                market_id: market.to_string(),
                ..SimulatedVenueConfig::default()
            },
            1..=10,
        ))
    }

    #[tokio::test]
    async fn register_returns_existing_reconciler() {
        let registry = MarketRegistry::new(ReconcilerConfig::default());
        let first = registry.register(venue("BTC-USD"));
        let second = registry.register(venue("BTC-USD"));

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn disposed_market_is_replaced() {
        let registry = MarketRegistry::new(ReconcilerConfig::default());
        let first = registry.register(venue("BTC-USD"));
        first.dispose();
        let second = registry.register(venue("BTC-USD"));

        assert!(!Arc::ptr_eq(&first, &second));
        assert!(!second.is_disposed());
    }

    #[tokio::test]
    async fn dispose_removes_market() {
        let registry = MarketRegistry::new(ReconcilerConfig::default());
        let reconciler = registry.register(venue("ETH-USD"));

        assert!(registry.dispose("ETH-USD"));
        assert!(!registry.dispose("ETH-USD"));
        assert!(reconciler.is_disposed());
        assert!(registry.get("ETH-USD").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn dispose_all_ends_streams() {
        let registry = MarketRegistry::new(ReconcilerConfig::default());
        let mut btc = registry.register(venue("BTC-USD")).subscribe();
        let mut eth = registry.register(venue("ETH-USD")).subscribe();

        registry.dispose_all().await;

        assert!(registry.is_empty());
        for stream in [&mut btc, &mut eth] {
            while let Some(item) = stream.next().await {
                assert!(!matches!(item, Err(ReconcileError::Disposed)));
            }
        }
    }

    #[test]
    fn snapshots_are_sorted() {
        let registry = MarketRegistry::new(ReconcilerConfig::default());
        let _ = registry.register(venue("ETH-USD"));
        let _ = registry.register(venue("BTC-USD"));

        let snapshots = registry.snapshots();
        assert_eq!(registry.market_ids(), vec!["BTC-USD", "ETH-USD"]);
        assert_eq!(snapshots[0].market, "BTC-USD");
        assert_eq!(snapshots[1].phase, StreamPhase::Idle);
        assert_eq!(snapshots[1].subscribers, 0);
    }
}
