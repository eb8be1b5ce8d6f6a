//! Backfill Loop
//!
//! Pulls history forward from a start id in adaptively sized windows until
//! it meets the realtime feed, then hands the tape over to the
//! [`RealtimeBuffer`]. One iteration:
//!
//! 1. Request `(position, position + window]`.
//! 2. If the venue returned more trades than the window can hold, shrink
//!    the window and repeat without moving.
//! 3. Emit trades in order. If one equals the oldest buffered realtime
//!    trade, switch over right there.
//! 4. If the batch was small and either the venue's ranges are unreliable
//!    or the buffered feed starts within reach, switch at the last trade.
//! 5. Otherwise grow the window in proportion to the shortfall and loop.
//!
//! An empty window below the realtime feed is a gap in the id space: skip
//! it and boost the window. An empty window that reaches the feed means
//! backfill is done.
//!
//! Gap skips and catch-up switches are only trusted when the same realtime
//! connection was up before the window was requested. Otherwise a trade
//! published between the REST response and the connect could be missed, so
//! the window is requested again. On a venue with stable ranges, a batch
//! that ends at the latest venue id looked up on the live connection also
//! counts as caught up.

use std::sync::Arc;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::application::ports::{MarketDataSource, TradeObserver};
use crate::application::services::realtime_buffer::RealtimeBuffer;
use crate::application::services::retry::RetryPolicy;
use crate::application::services::sizer::AdaptiveSizer;
use crate::domain::cursor::{StreamCursor, StreamPhase};
use crate::domain::trade::{TradeId, TradeOrigin};
use crate::error::ReconcileError;
use crate::infrastructure::metrics::{self, RestCall};

/// How a backfill run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackfillOutcome {
    /// Handed over to the realtime feed after trade `at`.
    Switched {
        /// Last id delivered from REST.
        at: TradeId,
        /// Buffered realtime trades forwarded during the switch.
        drained: usize,
    },
    /// Cancelled between iterations.
    Cancelled,
}

/// One market's backfill run.
pub struct BackfillLoop<'a> {
    source: &'a dyn MarketDataSource,
    buffer: &'a RealtimeBuffer,
    observer: &'a Arc<dyn TradeObserver>,
    cursor: &'a StreamCursor,
    sizer: &'a mut AdaptiveSizer,
    retry: &'a mut RetryPolicy,
    cancel: &'a CancellationToken,
}

impl<'a> BackfillLoop<'a> {
    /// Assemble a run from the pipeline's collaborators.
    pub fn new(
        source: &'a dyn MarketDataSource,
        buffer: &'a RealtimeBuffer,
        observer: &'a Arc<dyn TradeObserver>,
        cursor: &'a StreamCursor,
        sizer: &'a mut AdaptiveSizer,
        retry: &'a mut RetryPolicy,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            source,
            buffer,
            observer,
            cursor,
            sizer,
            retry,
            cancel,
        }
    }

    /// Backfill everything after `start_after`.
    ///
    /// `first_response` fires once the first REST window succeeds; the
    /// realtime feed is only opened after that.
    ///
    /// # Errors
    ///
    /// Propagates errors of the REST retry scope.
    pub async fn run(
        mut self,
        start_after: TradeId,
        first_response: oneshot::Sender<()>,
    ) -> Result<BackfillOutcome, ReconcileError> {
        let market = self.source.market_id().to_string();
        let stable = self.source.supports_stable_range_query();
        let venue_page = self.source.page_size();
        let mut first_response = Some(first_response);
        let mut position = start_after;

        self.cursor.set_phase(StreamPhase::Backfilling);
        tracing::info!(market = %market, start_after, stable, "Backfill started");

        loop {
            if self.cancel.is_cancelled() {
                return Ok(BackfillOutcome::Cancelled);
            }

            let window = self.sizer.window();
            let end = position.saturating_add(window);
            let fence = self.buffer.live_epoch();
            let source = self.source;
            metrics::record_rest_request(&market, RestCall::FetchAfter);
            let batch = self
                .retry
                .run(self.cancel, || source.fetch_after(position, end))
                .await?;
            if let Some(signal) = first_response.take() {
                let _ = signal.send(());
                // Gives the realtime pump a chance to connect before the next window.
                tokio::task::yield_now().await;
            }

            let retrieved = batch.len();
            let expected = self.sizer.expected(venue_page);
            tracing::debug!(
                market = %market,
                position,
                window,
                retrieved,
                coefficient = self.sizer.coefficient(),
                "Backfill window"
            );

            if self.sizer.is_overshoot(retrieved) && self.sizer.shrink() {
                tracing::debug!(
                    market = %market,
                    retrieved,
                    window,
                    coefficient = self.sizer.coefficient(),
                    "Venue returned more than the window holds, shrinking"
                );
                self.publish_coefficient(&market);
                continue;
            }

            if batch.is_empty() {
                if !stable {
                    if let Some(outcome) = self.fenced_catch_up(&market, position, fence).await? {
                        return Ok(outcome);
                    }
                    continue;
                }
                let (target, epoch) = self
                    .buffer
                    .first_buffered_id(position, self.retry, self.cancel)
                    .await?;
                if target > position && fence != Some(epoch) {
                    tracing::debug!(
                        market = %market,
                        position,
                        target,
                        "Realtime feed connected after the window was requested, refetching"
                    );
                    continue;
                }
                if end < target {
                    position = end;
                    self.sizer.boost();
                    self.publish_coefficient(&market);
                    tracing::debug!(
                        market = %market,
                        position,
                        target,
                        coefficient = self.sizer.coefficient(),
                        "Skipping empty id range"
                    );
                    continue;
                }
                if let Some(outcome) = self.catch_up(&market, position, epoch) {
                    return Ok(outcome);
                }
                continue;
            }

            for trade in batch {
                if trade.id <= position {
                    continue;
                }
                if let Some(epoch) = self.buffer.live_epoch()
                    && self.buffer.can_switch(&trade)
                {
                    self.cursor.set_phase(StreamPhase::CaughtUp);
                    if let Some(drained) =
                        self.buffer.switch_to_realtime(position, self.observer, epoch)
                    {
                        return Ok(self.switched(&market, position, drained));
                    }
                    self.cursor.set_phase(StreamPhase::Backfilling);
                }
                let id = trade.id;
                self.observer.on_trade(trade, TradeOrigin::Rest);
                position = id;
            }

            if self.sizer.is_small(retrieved, expected) {
                if !stable {
                    if let Some(outcome) = self.fenced_catch_up(&market, position, fence).await? {
                        return Ok(outcome);
                    }
                    continue;
                }
                let front_in_reach = self
                    .buffer
                    .front_id()
                    .is_some_and(|front| front <= end.saturating_add(1));
                if front_in_reach
                    && let Some(epoch) = fence
                    && self.buffer.live_epoch() == fence
                    && let Some(outcome) = self.catch_up(&market, position, epoch)
                {
                    return Ok(outcome);
                }
            }

            if stable && self.buffer.live_epoch().is_some() {
                let (target, epoch) = self
                    .buffer
                    .first_buffered_id(position, self.retry, self.cancel)
                    .await?;
                if target <= position
                    && let Some(outcome) = self.catch_up(&market, position, epoch)
                {
                    return Ok(outcome);
                }
            }

            let step = self.sizer.grow(retrieved, expected);
            if step > 0.0 {
                self.publish_coefficient(&market);
            }
        }
    }

    /// Switch after `position` only if the connection of `fence` was live
    /// before the last window was requested and still is.
    ///
    /// Otherwise waits for a connection and returns `None` so the caller
    /// requests the window again.
    async fn fenced_catch_up(
        &self,
        market: &str,
        position: TradeId,
        fence: Option<u64>,
    ) -> Result<Option<BackfillOutcome>, ReconcileError> {
        if let Some(epoch) = fence
            && self.buffer.live_epoch() == fence
        {
            return Ok(self.catch_up(market, position, epoch));
        }
        self.buffer.wait_live(self.cancel).await?;
        tracing::debug!(
            market = %market,
            position,
            "Realtime feed connected after the window was requested, refetching"
        );
        Ok(None)
    }

    /// Switch after `position` on the connection of `epoch`.
    ///
    /// Returns `None` if that connection dropped before the switch.
    fn catch_up(&self, market: &str, position: TradeId, epoch: u64) -> Option<BackfillOutcome> {
        self.cursor.set_phase(StreamPhase::CaughtUp);
        match self.buffer.switch_to_realtime(position, self.observer, epoch) {
            Some(drained) => Some(self.switched(market, position, drained)),
            None => {
                self.cursor.set_phase(StreamPhase::Backfilling);
                tracing::debug!(market = %market, position, "Realtime feed dropped before switch");
                None
            }
        }
    }

    fn switched(&self, market: &str, at: TradeId, drained: usize) -> BackfillOutcome {
        self.cursor.set_phase(StreamPhase::Forwarding);
        metrics::record_switchover(market);
        tracing::info!(
            market = %market,
            at,
            drained,
            coefficient = self.sizer.coefficient(),
            "Switched to realtime feed"
        );
        BackfillOutcome::Switched { at, drained }
    }

    fn publish_coefficient(&self, market: &str) {
        let coefficient = self.sizer.coefficient();
        self.cursor.set_coefficient(coefficient);
        metrics::set_window_coefficient(market, coefficient);
    }
}
