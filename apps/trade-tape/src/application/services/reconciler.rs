//! Stream Reconciler
//!
//! Owns one market's reconciliation pipeline and multicasts its output.
//!
//! # Pipeline
//!
//! ```text
//! ┌──────────────┐    ┌──────────────┐    ┌────────────────┐    ┌───────────┐
//! │ start point  │───▶│ BackfillLoop │───▶│ CursorObserver │───▶│ Broadcast │
//! │  (locator)   │    │   (REST)     │    │ (order guard)  │    │   hub     │
//! └──────────────┘    └──────▲───────┘    └───────▲────────┘    └───────────┘
//!                            │ switch             │
//!                     ┌──────┴───────┐            │
//!                     │RealtimeBuffer│────────────┘
//!                     └──────▲───────┘  once forwarding
//!                     ┌──────┴───────┐
//!                     │realtime pump │
//!                     └──────────────┘
//! ```
//!
//! The pipeline task is spawned on the first [`StreamReconciler::subscribe`]
//! call and stopped when the last subscriber stream is dropped; the next
//! subscription starts a fresh run with a new cursor. The realtime connection is opened only after the first REST window
//! has answered, so a venue that is down fails once on REST instead of on
//! both channels. If the realtime feed drops after the switch, the pipeline
//! backfills again from the last delivered id with a fresh buffer.
//!
//! Failures end every subscriber stream with the terminal error. Nothing
//! restarts the pipeline except a new reconciler.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use futures::stream;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::application::ports::{MarketDataSource, SourceError, TradeObserver};
use crate::application::services::backfill::{BackfillLoop, BackfillOutcome};
use crate::application::services::locator::{DEFAULT_MAX_ITERATIONS, HistoricalLocator};
use crate::application::services::realtime_buffer::RealtimeBuffer;
use crate::application::services::retry::{RetryConfig, RetryPolicy};
use crate::application::services::sizer::{AdaptiveSizer, SizerConfig};
use crate::domain::cursor::{CursorSnapshot, StreamCursor, StreamPhase};
use crate::domain::trade::{Trade, TradeId, TradeOrigin};
use crate::error::ReconcileError;
use crate::infrastructure::broadcast::{DEFAULT_CAPACITY, TapeBroadcast};
use crate::infrastructure::metrics;

pub use crate::infrastructure::broadcast::TapeStream;

// =============================================================================
// Configuration
// =============================================================================

/// Where backfill starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartPoint {
    /// After the venue's cached last id, or from the first trade if there
    /// is none.
    #[default]
    Resume,
    /// From the first trade the venue serves.
    FirstTrade,
    /// From the first trade at or after this time.
    Since(DateTime<Utc>),
}

/// Per-market pipeline configuration.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Policy shared by the REST and realtime retry scopes.
    pub retry: RetryConfig,
    /// Window sizer constants.
    pub sizer: SizerConfig,
    /// Trades a subscriber may fall behind before it is dropped.
    pub broadcast_capacity: usize,
    /// Start point resolved when the pipeline starts.
    pub start: StartPoint,
    /// Probe budget of the historical locator.
    pub locator_max_iterations: u32,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            sizer: SizerConfig::default(),
            broadcast_capacity: DEFAULT_CAPACITY,
            start: StartPoint::default(),
            locator_max_iterations: DEFAULT_MAX_ITERATIONS,
        }
    }
}

// =============================================================================
// Reconciler
// =============================================================================

/// Ordered, deduplicated trade tape of one market.
///
/// Any number of subscribers share one REST backfill and one realtime
/// connection. A subscriber receives the trades emitted after it joined.
pub struct StreamReconciler {
    source: Arc<dyn MarketDataSource>,
    config: ReconcilerConfig,
    cancel: CancellationToken,
    session: Mutex<Option<Arc<Session>>>,
}

impl std::fmt::Debug for StreamReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamReconciler")
            .field("market", &self.source.market_id())
            .field("phase", &self.phase())
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}

impl StreamReconciler {
    /// Create an idle reconciler. Nothing is fetched until the first
    /// subscription.
    #[must_use]
    pub fn new(source: Arc<dyn MarketDataSource>, config: ReconcilerConfig) -> Self {
        Self {
            source,
            config,
            cancel: CancellationToken::new(),
            session: Mutex::new(None),
        }
    }

    /// Market served by this reconciler.
    #[must_use]
    pub fn market_id(&self) -> &str {
        self.source.market_id()
    }

    /// Attach a subscriber, starting the pipeline if it is not running.
    ///
    /// Dropping the last subscriber stream stops the pipeline; the next
    /// subscription starts a new one. After a failure the stream yields the
    /// terminal error; after [`dispose`](Self::dispose) it yields
    /// [`ReconcileError::Disposed`].
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime when a pipeline starts.
    #[must_use]
    pub fn subscribe(&self) -> TapeStream {
        let mut current = self.session.lock();
        let attached = current.as_ref().and_then(Session::attach);
        let (stream, subscribers) = match attached {
            Some(attached) => attached,
            None if self.cancel.is_cancelled() => {
                let closed = TapeBroadcast::new(self.market_id(), 1);
                closed.close();
                return closed.subscribe();
            }
            None => {
                let session = self.start_session();
                let Some(attached) = Session::attach(&session) else {
                    return session.hub.subscribe();
                };
                *current = Some(session);
                attached
            }
        };
        drop(current);

        metrics::set_subscribers(self.market_id(), subscribers);
        tracing::debug!(market = %self.market_id(), subscribers, "Subscriber attached");
        stream
    }

    /// Stop the pipeline and end every subscriber stream.
    pub fn dispose(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        if let Some(session) = self.session.lock().as_ref() {
            session.hub.close();
            session.cursor.set_phase(StreamPhase::Idle);
        }
        metrics::set_subscribers(self.market_id(), 0);
        tracing::info!(market = %self.market_id(), "Reconciler disposed");
    }

    /// Wait for the current pipeline task to finish.
    pub async fn join(&self) {
        let handle = self
            .session
            .lock()
            .as_ref()
            .and_then(|session| session.task.lock().take());
        if let Some(handle) = handle
            && let Err(error) = handle.await
        {
            tracing::error!(market = %self.market_id(), error = %error, "Pipeline task panicked");
        }
    }

    /// Whether [`dispose`](Self::dispose) was called.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Whether the pipeline ended with an error.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.phase() == StreamPhase::Terminated
    }

    /// Active subscriber count.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.session
            .lock()
            .as_ref()
            .map_or(0, |session| session.hub.receiver_count())
    }

    /// Diagnostic view of the cursor.
    #[must_use]
    pub fn snapshot(&self) -> CursorSnapshot {
        let cursor = self.session.lock().as_ref().map(|session| Arc::clone(&session.cursor));
        cursor
            .unwrap_or_default()
            .snapshot(self.market_id(), self.subscriber_count())
    }

    fn phase(&self) -> StreamPhase {
        self.session
            .lock()
            .as_ref()
            .map_or(StreamPhase::Idle, |session| session.cursor.phase())
    }

    fn start_session(&self) -> Arc<Session> {
        let market = self.market_id().to_string();
        let hub = Arc::new(TapeBroadcast::new(market.clone(), self.config.broadcast_capacity));
        let cursor = Arc::new(StreamCursor::new());
        let cancel = self.cancel.child_token();

        let observer: Arc<dyn TradeObserver> = Arc::new(CursorObserver {
            market: market.clone(),
            cursor: Arc::clone(&cursor),
            hub: Arc::clone(&hub),
        });
        let pipeline = Pipeline {
            source: Arc::clone(&self.source),
            market: market.clone(),
            start: self.config.start,
            locator_max_iterations: self.config.locator_max_iterations,
            observer,
            hub: Arc::clone(&hub),
            cursor: Arc::clone(&cursor),
            sizer: AdaptiveSizer::new(self.config.sizer.clone(), self.source.page_size()),
            rest_retry: RetryPolicy::new(format!("{market}-rest"), self.config.retry.clone()),
            realtime_retry: RetryPolicy::new(
                format!("{market}-realtime"),
                self.config.retry.clone(),
            ),
            cancel: cancel.clone(),
        };

        let span = tracing::info_span!("reconciler", market = %market);
        let task = tokio::spawn(pipeline.run().instrument(span));
        tracing::debug!(market = %market, "Pipeline started");

        Arc::new(Session {
            market,
            hub,
            cursor,
            cancel,
            subscribers: Mutex::new(Some(0)),
            task: Mutex::new(Some(task)),
        })
    }
}

impl Drop for StreamReconciler {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// =============================================================================
// Session
// =============================================================================

/// One pipeline run and the subscribers attached to it.
///
/// Each run owns its hub and cursor, so a stopped run can never publish
/// into its successor.
struct Session {
    market: String,
    hub: Arc<TapeBroadcast>,
    cursor: Arc<StreamCursor>,
    cancel: CancellationToken,
    /// `None` once the last subscriber left and the run was stopped.
    subscribers: Mutex<Option<usize>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Attach one subscriber, or `None` if the run was already stopped.
    fn attach(session: &Arc<Self>) -> Option<(TapeStream, usize)> {
        let mut subscribers = session.subscribers.lock();
        let count = subscribers.as_mut()?;
        *count += 1;
        let lease = Lease {
            session: Arc::clone(session),
        };
        Some((with_lease(session.hub.subscribe(), lease), *count))
    }
}

/// Held by a subscriber stream; the last one dropped stops the run.
///
/// A disposed or failed run stays attachable so later subscribers still
/// learn how it ended.
struct Lease {
    session: Arc<Session>,
}

impl Drop for Lease {
    fn drop(&mut self) {
        let session = &self.session;
        let mut subscribers = session.subscribers.lock();
        let Some(count) = subscribers.as_mut() else {
            return;
        };
        *count = count.saturating_sub(1);
        let remaining = *count;
        metrics::set_subscribers(&session.market, remaining);
        if remaining == 0 && !session.hub.is_closed() {
            *subscribers = None;
            session.cancel.cancel();
            tracing::info!(market = %session.market, "Last subscriber left, stopping pipeline");
        }
    }
}

fn with_lease(inner: TapeStream, lease: Lease) -> TapeStream {
    stream::unfold((inner, lease), |(mut inner, lease)| async move {
        let item = inner.next().await?;
        Some((item, (inner, lease)))
    })
    .boxed()
}

// =============================================================================
// Ordering guard
// =============================================================================

/// Output observer: advances the cursor and publishes, dropping anything
/// at or below the last delivered id.
struct CursorObserver {
    market: String,
    cursor: Arc<StreamCursor>,
    hub: Arc<TapeBroadcast>,
}

impl TradeObserver for CursorObserver {
    fn on_trade(&self, trade: Trade, origin: TradeOrigin) {
        if !self.cursor.advance(trade.id) {
            metrics::record_trade_discarded(&self.market);
            tracing::trace!(
                id = trade.id,
                last_delivered_id = ?self.cursor.last_delivered_id(),
                origin = origin.as_str(),
                "Discarded trade at or below cursor"
            );
            return;
        }
        metrics::record_trade_delivered(&self.market, origin);
        let _ = self.hub.publish(trade);
    }
}

// =============================================================================
// Pipeline task
// =============================================================================

/// How the realtime pump ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RealtimeExit {
    /// The feed dropped while forwarding; trades may be missing.
    Lost,
    /// Disposed, or backfill ended before the first response.
    Cancelled,
}

struct Pipeline {
    source: Arc<dyn MarketDataSource>,
    market: String,
    start: StartPoint,
    locator_max_iterations: u32,
    observer: Arc<dyn TradeObserver>,
    hub: Arc<TapeBroadcast>,
    cursor: Arc<StreamCursor>,
    sizer: AdaptiveSizer,
    rest_retry: RetryPolicy,
    realtime_retry: RetryPolicy,
    cancel: CancellationToken,
}

impl Pipeline {
    async fn run(mut self) {
        match self.drive().await {
            Ok(()) | Err(ReconcileError::Disposed) => {
                self.cursor.set_phase(StreamPhase::Idle);
                tracing::info!(market = %self.market, "Reconciliation stopped");
            }
            Err(error) => {
                tracing::error!(
                    market = %self.market,
                    kind = error.kind(),
                    error = %error,
                    "Reconciliation failed"
                );
                self.cursor.set_phase(StreamPhase::Terminated);
                self.hub.terminate(error);
            }
        }
    }

    async fn drive(&mut self) -> Result<(), ReconcileError> {
        let mut start_after = self.resolve_start().await?;
        loop {
            match self.cycle(start_after).await? {
                RealtimeExit::Cancelled => return Ok(()),
                RealtimeExit::Lost => {
                    start_after = self.cursor.last_delivered_id().unwrap_or(start_after);
                    self.cursor.set_phase(StreamPhase::Backfilling);
                    tracing::warn!(
                        market = %self.market,
                        start_after,
                        "Realtime feed lost while forwarding, resyncing from REST"
                    );
                }
            }
        }
    }

    /// Id after which backfill starts.
    async fn resolve_start(&mut self) -> Result<TradeId, ReconcileError> {
        if self.start == StartPoint::Resume
            && let Some(id) = self.source.estimate_last_id().await
        {
            tracing::info!(market = %self.market, start_after = id, "Resuming after cached id");
            return Ok(id);
        }

        let mut locator =
            HistoricalLocator::new(self.source.as_ref(), &mut self.rest_retry, &self.cancel)
                .with_max_iterations(self.locator_max_iterations);
        let start_after = match self.start {
            StartPoint::Resume | StartPoint::FirstTrade => locator
                .find_first_trade()
                .await?
                .map_or(0, |first| first.id.saturating_sub(1)),
            StartPoint::Since(target) => locator
                .find_nearest_trade(target)
                .await?
                .map_or(0, |before| before.id),
        };
        tracing::info!(
            market = %self.market,
            start = ?self.start,
            start_after,
            probes = locator.probes(),
            "Located start point"
        );
        Ok(start_after)
    }

    /// Backfill from `start_after` alongside a fresh realtime connection
    /// until the pipeline is cancelled or the feed drops after the switch.
    async fn cycle(&mut self, start_after: TradeId) -> Result<RealtimeExit, ReconcileError> {
        let buffer = RealtimeBuffer::new(Arc::clone(&self.source));
        let (first_tx, first_rx) = oneshot::channel();

        let backfill = BackfillLoop::new(
            self.source.as_ref(),
            &buffer,
            &self.observer,
            &self.cursor,
            &mut self.sizer,
            &mut self.rest_retry,
            &self.cancel,
        )
        .run(start_after, first_tx);
        let pump = pump_realtime(
            self.source.as_ref(),
            &buffer,
            &self.cursor,
            &mut self.realtime_retry,
            &self.cancel,
            first_rx,
        );
        tokio::pin!(backfill);
        tokio::pin!(pump);

        // Polled together on this task; observer calls rely on that.
        tokio::select! {
            outcome = &mut backfill => match outcome? {
                BackfillOutcome::Cancelled => Ok(RealtimeExit::Cancelled),
                BackfillOutcome::Switched { .. } => pump.await,
            },
            exit = &mut pump => exit,
        }
    }
}

/// Feed realtime trades into `buffer`, reconnecting with `retry` on drops.
///
/// Connects only after `first_response` fires. The retry scope is reset by
/// each received trade, not by a successful connect, so a feed that
/// accepts connections and drops them at once still exhausts its budget.
async fn pump_realtime(
    source: &dyn MarketDataSource,
    buffer: &RealtimeBuffer,
    cursor: &StreamCursor,
    retry: &mut RetryPolicy,
    cancel: &CancellationToken,
    first_response: oneshot::Receiver<()>,
) -> Result<RealtimeExit, ReconcileError> {
    let market = source.market_id();

    tokio::select! {
        () = cancel.cancelled() => return Ok(RealtimeExit::Cancelled),
        received = first_response => {
            if received.is_err() {
                return Ok(RealtimeExit::Cancelled);
            }
        }
    }

    loop {
        let connected = tokio::select! {
            () = cancel.cancelled() => return Ok(RealtimeExit::Cancelled),
            connected = source.subscribe_realtime() => connected,
        };
        let mut trades = match connected {
            Ok(trades) => trades,
            Err(error) => {
                tracing::warn!(market = %market, error = %error, "Realtime connect failed");
                retry.backoff(cancel, error).await?;
                continue;
            }
        };

        buffer.mark_live();
        cursor.mark_realtime_started();
        tracing::info!(market = %market, "Realtime feed connected");

        let failure = loop {
            let next = tokio::select! {
                () = cancel.cancelled() => return Ok(RealtimeExit::Cancelled),
                next = trades.next() => next,
            };
            match next {
                Some(Ok(trade)) => {
                    retry.reset();
                    buffer.accept(trade);
                }
                Some(Err(error)) => break error,
                None => break SourceError::Disconnected,
            }
        };

        let lost = buffer.interrupt();
        tracing::warn!(
            market = %market,
            error = %failure,
            forwarding = lost,
            "Realtime feed dropped"
        );
        retry.backoff(cancel, failure).await?;
        if lost {
            return Ok(RealtimeExit::Lost);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
