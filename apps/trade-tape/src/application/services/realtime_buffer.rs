//! Realtime Buffer
//!
//! Switchable sink between the realtime feed and the tape. While backfill
//! is still pulling history, live trades queue here. Once backfill proves it
//! has reached the oldest queued trade, [`RealtimeBuffer::switch_to_realtime`]
//! drains the queue into the output observer and points all later trades
//! straight at it.
//!
//! The switch is a swap-and-drain loop: each round takes the whole queue
//! under the lock and forwards it outside the lock, so the realtime writer
//! is never blocked behind observer calls. Destination flips to the
//! observer only when a round finds the queue empty while holding the lock.
//!
//! Every realtime connection gets an epoch. The queue holds every trade
//! published since the current epoch started, so a caller that saw the same
//! epoch before and after a REST request knows that request plus the queue
//! covers the whole tape.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::application::ports::{MarketDataSource, TradeObserver};
use crate::application::services::retry::RetryPolicy;
use crate::domain::trade::{Trade, TradeId, TradeOrigin};
use crate::error::ReconcileError;
use crate::infrastructure::metrics::{self, RestCall};

enum Destination {
    Queue(VecDeque<Trade>),
    Observer(Arc<dyn TradeObserver>),
}

/// Realtime trades waiting for backfill to catch up.
pub struct RealtimeBuffer {
    source: Arc<dyn MarketDataSource>,
    destination: Mutex<Destination>,
    live: watch::Sender<bool>,
    latest_hint: Mutex<Option<TradeId>>,
    generation: AtomicU64,
}

impl std::fmt::Debug for RealtimeBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeBuffer")
            .field("market", &self.source.market_id())
            .field("queued", &self.len())
            .field("forwarding", &self.is_forwarding())
            .field("live", &self.is_live())
            .finish()
    }
}

impl RealtimeBuffer {
    /// Create an empty buffer in queueing mode.
    #[must_use]
    pub fn new(source: Arc<dyn MarketDataSource>) -> Self {
        Self {
            source,
            destination: Mutex::new(Destination::Queue(VecDeque::new())),
            live: watch::Sender::new(false),
            latest_hint: Mutex::new(None),
            generation: AtomicU64::new(0),
        }
    }

    // =========================================================================
    // Writer side
    // =========================================================================

    /// Hand a live trade to the current destination.
    pub fn accept(&self, trade: Trade) {
        let observer = {
            let mut destination = self.destination.lock();
            match &mut *destination {
                Destination::Queue(queue) => {
                    queue.push_back(trade);
                    return;
                }
                Destination::Observer(observer) => Arc::clone(observer),
            }
        };
        observer.on_trade(trade, TradeOrigin::Realtime);
    }

    /// The realtime connection is up and trades from now on will arrive.
    pub fn mark_live(&self) {
        let _destination = self.destination.lock();
        self.live.send_replace(true);
    }

    /// The realtime connection dropped.
    ///
    /// While queueing, the queue no longer describes a contiguous run of
    /// live trades, so it is cleared and the buffer waits for the next
    /// connection. Returns `true` if the buffer was already forwarding, in
    /// which case trades may have been lost and the caller must resync.
    pub fn interrupt(&self) -> bool {
        let mut destination = self.destination.lock();
        match &mut *destination {
            Destination::Observer(_) => true,
            Destination::Queue(queue) => {
                queue.clear();
                self.live.send_replace(false);
                self.generation.fetch_add(1, Ordering::AcqRel);
                *self.latest_hint.lock() = None;
                false
            }
        }
    }

    // =========================================================================
    // Backfill side
    // =========================================================================

    /// Whether `candidate` is the oldest queued trade.
    #[must_use]
    pub fn can_switch(&self, candidate: &Trade) -> bool {
        match &*self.destination.lock() {
            Destination::Queue(queue) => queue
                .front()
                .is_some_and(|front| self.source.trades_are_equal(front, candidate)),
            Destination::Observer(_) => false,
        }
    }

    /// Id of the oldest queued trade.
    #[must_use]
    pub fn front_id(&self) -> Option<TradeId> {
        match &*self.destination.lock() {
            Destination::Queue(queue) => queue.front().map(|trade| trade.id),
            Destination::Observer(_) => None,
        }
    }

    /// Number of queued trades.
    #[must_use]
    pub fn len(&self) -> usize {
        match &*self.destination.lock() {
            Destination::Queue(queue) => queue.len(),
            Destination::Observer(_) => 0,
        }
    }

    /// Whether nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether live trades go straight to the observer.
    #[must_use]
    pub fn is_forwarding(&self) -> bool {
        matches!(&*self.destination.lock(), Destination::Observer(_))
    }

    /// Whether the realtime connection is currently up.
    #[must_use]
    pub fn is_live(&self) -> bool {
        *self.live.borrow()
    }

    /// Epoch of the current realtime connection, or `None` while it is down.
    #[must_use]
    pub fn live_epoch(&self) -> Option<u64> {
        let _destination = self.destination.lock();
        self.is_live().then(|| self.generation.load(Ordering::Acquire))
    }

    /// Wait for the realtime connection.
    ///
    /// # Errors
    ///
    /// [`ReconcileError::Disposed`] if `cancel` fires first.
    pub async fn wait_live(&self, cancel: &CancellationToken) -> Result<(), ReconcileError> {
        let mut live = self.live.subscribe();
        tokio::select! {
            () = cancel.cancelled() => Err(ReconcileError::Disposed),
            changed = live.wait_for(|up| *up) => changed
                .map(|_| ())
                .map_err(|_| ReconcileError::Disposed),
        }
    }

    /// Forward every queued trade newer than `after` to `observer`, then
    /// route all later trades to it.
    ///
    /// Returns the number of queued trades forwarded, or `None` without
    /// switching if the connection of `epoch` is no longer up.
    pub fn switch_to_realtime(
        &self,
        after: TradeId,
        observer: &Arc<dyn TradeObserver>,
        epoch: u64,
    ) -> Option<usize> {
        let mut drained = 0;
        loop {
            let batch = {
                let mut destination = self.destination.lock();
                match &mut *destination {
                    Destination::Observer(_) => return Some(drained),
                    Destination::Queue(queue) => {
                        if !*self.live.borrow() || self.generation.load(Ordering::Acquire) != epoch {
                            return None;
                        }
                        if queue.is_empty() {
                            *destination = Destination::Observer(Arc::clone(observer));
                            return Some(drained);
                        }
                        std::mem::take(queue)
                    }
                }
            };

            for trade in batch {
                if trade.id > after {
                    observer.on_trade(trade, TradeOrigin::Realtime);
                    drained += 1;
                }
            }
        }
    }

    /// How far backfill has to advance before it meets the realtime feed,
    /// and the connection epoch that answer holds for.
    ///
    /// This is the oldest queued id, or when nothing is queued yet the
    /// venue's latest id fetched after the connection came up. The fetched
    /// value is cached for the epoch until backfill passes it. A connection
    /// drop during the fetch restarts the lookup.
    ///
    /// # Errors
    ///
    /// Propagates retry exhaustion and cancellation.
    pub async fn first_buffered_id(
        &self,
        after: TradeId,
        retry: &mut RetryPolicy,
        cancel: &CancellationToken,
    ) -> Result<(TradeId, u64), ReconcileError> {
        loop {
            self.wait_live(cancel).await?;
            let Some(epoch) = self.live_epoch() else {
                continue;
            };
            if let Some(front) = self.front_id() {
                return Ok((front, epoch));
            }

            let hint = *self.latest_hint.lock();
            if let Some(hint) = hint.filter(|id| *id > after) {
                return Ok((hint, epoch));
            }

            let source = Arc::clone(&self.source);
            metrics::record_rest_request(source.market_id(), RestCall::FetchLatest);
            let latest = retry.run(cancel, || source.fetch_latest()).await?;
            let latest_id = latest.map_or(after, |trade| trade.id);

            if self.live_epoch() != Some(epoch) {
                tracing::debug!(
                    market = %self.source.market_id(),
                    "Realtime feed changed during latest-id lookup, retrying"
                );
                continue;
            }
            *self.latest_hint.lock() = Some(latest_id);
            tracing::debug!(
                market = %self.source.market_id(),
                after,
                latest_id,
                epoch,
                "Realtime buffer empty, using latest venue id"
            );
            return Ok((latest_id, epoch));
        }
    }
}
