//! Historical Locator
//!
//! Finds positions in a venue's history using only "page before id" and
//! "latest trade" queries:
//!
//! - [`HistoricalLocator::find_first_trade`] bisects the id space for the
//!   oldest trade the venue still serves.
//! - [`HistoricalLocator::find_nearest_trade`] finds the last trade strictly
//!   before a timestamp, alternating time-interpolated probes with bisection.
//!
//! Both searches are bounded. Failing to converge means the venue broke the
//! ordering contract, which is reported as [`ReconcileError::LocatorDiverged`]
//! rather than retried.

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::application::ports::MarketDataSource;
use crate::application::services::retry::RetryPolicy;
use crate::domain::trade::{Trade, TradeId};
use crate::error::ReconcileError;
use crate::infrastructure::metrics::{self, RestCall};

/// Default probe budget for one search.
pub const DEFAULT_MAX_ITERATIONS: u32 = 128;

/// Bounded searches over one market's history.
pub struct HistoricalLocator<'a> {
    source: &'a dyn MarketDataSource,
    retry: &'a mut RetryPolicy,
    cancel: &'a CancellationToken,
    max_iterations: u32,
    probes: u32,
}

impl<'a> HistoricalLocator<'a> {
    /// Create a locator sharing the caller's REST retry scope.
    pub fn new(
        source: &'a dyn MarketDataSource,
        retry: &'a mut RetryPolicy,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            source,
            retry,
            cancel,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            probes: 0,
        }
    }

    /// Override the probe budget.
    #[must_use]
    pub const fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// REST calls issued so far.
    #[must_use]
    pub const fn probes(&self) -> u32 {
        self.probes
    }

    // =========================================================================
    // First trade
    // =========================================================================

    /// The oldest trade the venue serves, or `None` for an empty market.
    ///
    /// Invariant while searching: no trade has an id `<= low`, and `anchor`
    /// is a known trade. The interval `(low, anchor.id]` halves on every
    /// probe that does not finish the search.
    ///
    /// # Errors
    ///
    /// [`ReconcileError::LocatorDiverged`] if the probe budget runs out, or
    /// any error of the REST retry scope.
    pub async fn find_first_trade(&mut self) -> Result<Option<Trade>, ReconcileError> {
        let Some(mut anchor) = self.latest().await? else {
            return Ok(None);
        };
        let page = self.source.page_size();
        let mut low: TradeId = 0;

        for _ in 0..self.max_iterations {
            if anchor.id - low <= 1 {
                return Ok(Some(anchor));
            }
            let mid = low + (anchor.id - low) / 2;
            let batch = self.before(mid + 1).await?;

            let Some(oldest) = batch.first() else {
                low = mid;
                continue;
            };
            if batch.len() < page {
                tracing::debug!(
                    market = %self.source.market_id(),
                    first_id = oldest.id,
                    probes = self.probes,
                    "Located first trade"
                );
                return Ok(Some(oldest.clone()));
            }
            if oldest.id >= anchor.id {
                break;
            }
            anchor = oldest.clone();
        }

        Err(self.diverged(format!(
            "first trade search stuck between {low} and {}",
            anchor.id
        )))
    }

    // =========================================================================
    // Nearest trade
    // =========================================================================

    /// The last trade strictly before `target`, or `None` if every trade the
    /// venue serves is at or after `target`.
    ///
    /// The first probe looks at the page just below the latest trade, which
    /// answers directly when `target` is recent. Later probes alternate
    /// between a time-interpolated estimate and plain bisection so a skewed
    /// trade rate cannot stall the search.
    ///
    /// # Errors
    ///
    /// [`ReconcileError::LocatorDiverged`] if the probe budget runs out, or
    /// any error of the REST retry scope.
    pub async fn find_nearest_trade(
        &mut self,
        target: DateTime<Utc>,
    ) -> Result<Option<Trade>, ReconcileError> {
        let Some(mut upper) = self.latest().await? else {
            return Ok(None);
        };
        if upper.timestamp < target {
            return Ok(Some(upper));
        }

        let page = self.source.page_size();
        // Every trade with id <= floor is before target; `lower` is the
        // newest of them seen so far.
        let mut floor: TradeId = 0;
        let mut lower: Option<Trade> = None;
        let mut probe = upper.id;

        for iteration in 0..self.max_iterations {
            if upper.id - floor <= 1 {
                return Ok(lower);
            }

            let batch = self.before(probe).await?;

            if let Some(found) = bracket(&batch, target) {
                return Ok(Some(found.clone()));
            }
            match (batch.first(), batch.last()) {
                (None, _) | (_, None) => floor = probe - 1,
                (Some(_), Some(newest)) if newest.timestamp < target => {
                    floor = probe - 1;
                    lower = Some(newest.clone());
                }
                (Some(oldest), Some(_)) => {
                    if batch.len() < page {
                        return Ok(lower);
                    }
                    upper = oldest.clone();
                }
            }

            if upper.id - floor <= 1 {
                return Ok(lower);
            }
            let estimate = if upper.id - floor <= page_span(page) {
                upper.id
            } else if iteration % 2 == 0 {
                lower
                    .as_ref()
                    .and_then(|low| interpolate(low, &upper, target))
                    .unwrap_or_else(|| bisect(floor, upper.id))
            } else {
                bisect(floor, upper.id)
            };
            probe = estimate.clamp(floor + 2, upper.id);
        }

        Err(self.diverged(format!(
            "nearest trade search for {target} stuck between {floor} and {}",
            upper.id
        )))
    }

    // =========================================================================
    // REST helpers
    // =========================================================================

    async fn latest(&mut self) -> Result<Option<Trade>, ReconcileError> {
        let source = self.source;
        self.probes += 1;
        metrics::record_rest_request(source.market_id(), RestCall::FetchLatest);
        self.retry.run(self.cancel, || source.fetch_latest()).await
    }

    async fn before(&mut self, id: TradeId) -> Result<Vec<Trade>, ReconcileError> {
        let source = self.source;
        self.probes += 1;
        metrics::record_rest_request(source.market_id(), RestCall::FetchBefore);
        self.retry.run(self.cancel, || source.fetch_before(id)).await
    }

    fn diverged(&self, detail: String) -> ReconcileError {
        tracing::error!(
            market = %self.source.market_id(),
            probes = self.probes,
            detail = %detail,
            "History search did not converge"
        );
        ReconcileError::LocatorDiverged { detail }
    }
}

/// The trade in `batch` immediately followed by one at or after `target`.
fn bracket(batch: &[Trade], target: DateTime<Utc>) -> Option<&Trade> {
    batch
        .windows(2)
        .find(|pair| pair[0].timestamp < target && pair[1].timestamp >= target)
        .map(|pair| &pair[0])
}

fn bisect(floor: TradeId, upper: TradeId) -> TradeId {
    floor + (upper - floor) / 2
}

fn page_span(page: usize) -> TradeId {
    TradeId::try_from(page).unwrap_or(TradeId::MAX)
}

/// Estimate the id at `target` assuming a uniform trade rate between
/// `low` and `high`.
fn interpolate(low: &Trade, high: &Trade, target: DateTime<Utc>) -> Option<TradeId> {
    let time_span = (high.timestamp - low.timestamp).num_milliseconds();
    if time_span <= 0 {
        return None;
    }
    let remaining = (high.timestamp - target).num_milliseconds();
    let id_span = i128::from(high.id - low.id);
    let offset = id_span * i128::from(remaining) / i128::from(time_span);
    TradeId::try_from(i128::from(high.id) - offset).ok()
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::application::ports::{MockMarketDataSource, SourceError};
    use crate::application::services::retry::RetryConfig;
    use crate::infrastructure::simulated::{SimulatedVenue, SimulatedVenueConfig};

    fn venue(ids: impl IntoIterator<Item = TradeId>, page: usize) -> SimulatedVenue {
        SimulatedVenue::with_history(
            SimulatedVenueConfig {
                page_size: page,
                ..SimulatedVenueConfig::default()
            },
            ids,
        )
    }

    fn ts(id: TradeId) -> DateTime<Utc> {
        SimulatedVenue::timestamp_for(id)
    }

    async fn first(venue: &SimulatedVenue) -> (Option<Trade>, u32) {
        let mut retry = RetryPolicy::new("test", RetryConfig::default());
        let cancel = CancellationToken::new();
        let mut locator = HistoricalLocator::new(venue, &mut retry, &cancel);
        let found = locator.find_first_trade().await.unwrap();
        (found, locator.probes())
    }

    async fn nearest(venue: &SimulatedVenue, target: DateTime<Utc>) -> Option<Trade> {
        let mut retry = RetryPolicy::new("test", RetryConfig::default());
        let cancel = CancellationToken::new();
        HistoricalLocator::new(venue, &mut retry, &cancel)
            .find_nearest_trade(target)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn first_trade_of_empty_market() {
        let (found, probes) = first(&venue(std::iter::empty(), 100)).await;
        assert!(found.is_none());
        assert_eq!(probes, 1);
    }

    #[tokio::test]
    async fn first_trade_from_id_one() {
        let (found, _) = first(&venue(1..=500, 100)).await;
        assert_eq!(found.unwrap().id, 1);
    }

    #[tokio::test]
    async fn first_trade_after_pruned_history() {
        let (found, _) = first(&venue(40_001..=50_000, 100)).await;
        assert_eq!(found.unwrap().id, 40_001);
    }

    #[tokio::test]
    async fn first_trade_with_sparse_ids() {
        let (found, _) = first(&venue((1_003..=90_000).step_by(7), 50)).await;
        assert_eq!(found.unwrap().id, 1_003);
    }

    #[tokio::test]
    async fn first_trade_single_trade() {
        let (found, _) = first(&venue([42], 10)).await;
        assert_eq!(found.unwrap().id, 42);
    }

    #[tokio::test]
    async fn nearest_recent_target_uses_one_page() {
        let venue = venue(1..=10_000, 100);
        let found = nearest(&venue, ts(9_950)).await.unwrap();
        assert_eq!(found.id, 9_949);
        assert_eq!(venue.calls().fetch_before, 1);
    }

    #[tokio::test]
    async fn nearest_target_after_latest() {
        let venue = venue(1..=100, 10);
        let found = nearest(&venue, ts(500)).await.unwrap();
        assert_eq!(found.id, 100);
    }

    #[tokio::test]
    async fn nearest_deep_in_history() {
        let venue = venue(1..=100_000, 100);
        let found = nearest(&venue, ts(12_345)).await.unwrap();
        assert_eq!(found.id, 12_344);
    }

    #[tokio::test]
    async fn nearest_in_a_gap_returns_trade_before_gap() {
        let ids = (1..=3_000).chain(8_000..=12_000);
        let venue = venue(ids, 100);
        let found = nearest(&venue, ts(5_000)).await.unwrap();
        assert_eq!(found.id, 3_000);
    }

    #[tokio::test]
    async fn nearest_before_all_history() {
        let venue = venue(5_000..=9_000, 100);
        assert!(nearest(&venue, ts(10)).await.is_none());
    }

    #[tokio::test]
    async fn equal_timestamps_are_not_before_target() {
        let venue = venue(1..=1_000, 100);
        let found = nearest(&venue, ts(600)).await.unwrap();
        assert!(found.timestamp < ts(600));
        assert_eq!(found.id, 599);
    }

    #[test]
    fn interpolation_uses_time_to_id_ratio() {
        let at = |id, secs| {
            Trade::new(
                id,
                Utc.timestamp_opt(secs, 0).unwrap(),
                rust_decimal::Decimal::ONE,
                rust_decimal::Decimal::ONE,
                crate::domain::trade::Side::Buy,
            )
        };
        let low = at(1_000, 0);
        let high = at(2_000, 100);
        let estimate = interpolate(&low, &high, Utc.timestamp_opt(25, 0).unwrap());
        assert_eq!(estimate, Some(1_250));
        assert_eq!(interpolate(&high, &low, Utc.timestamp_opt(25, 0).unwrap()), None);
    }

    #[tokio::test]
    async fn inconsistent_venue_fails_loudly() {
        let mut mock = MockMarketDataSource::new();
        mock.expect_market_id().return_const("BROKEN".to_string());
        mock.expect_page_size().return_const(10_usize);
        mock.expect_fetch_latest().returning(|| {
            Ok(Some(Trade::new(
                1_000,
                Utc.timestamp_opt(1_000, 0).unwrap(),
                rust_decimal::Decimal::ONE,
                rust_decimal::Decimal::ONE,
                crate::domain::trade::Side::Buy,
            )))
        });
        // Always a full page of trades that never move below the anchor.
        mock.expect_fetch_before().returning(|_| {
            Ok((1_000..1_010)
                .map(|id| {
                    Trade::new(
                        id,
                        Utc.timestamp_opt(id, 0).unwrap(),
                        rust_decimal::Decimal::ONE,
                        rust_decimal::Decimal::ONE,
                        crate::domain::trade::Side::Buy,
                    )
                })
                .collect())
        });

        let mut retry = RetryPolicy::new("test", RetryConfig::default());
        let cancel = CancellationToken::new();
        let result = HistoricalLocator::new(&mock, &mut retry, &cancel)
            .with_max_iterations(16)
            .find_first_trade()
            .await;
        assert!(matches!(result, Err(ReconcileError::LocatorDiverged { .. })));
    }

    #[tokio::test]
    async fn rejected_probe_is_fatal() {
        let mut mock = MockMarketDataSource::new();
        mock.expect_market_id().return_const("BROKEN".to_string());
        mock.expect_page_size().return_const(10_usize);
        mock.expect_fetch_latest()
            .returning(|| Err(SourceError::Rejected("unknown market".into())));

        let mut retry = RetryPolicy::new("test", RetryConfig::default());
        let cancel = CancellationToken::new();
        let result = HistoricalLocator::new(&mock, &mut retry, &cancel)
            .find_first_trade()
            .await;
        assert!(matches!(result, Err(ReconcileError::Fatal(_))));
    }
}
