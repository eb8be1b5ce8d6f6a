//! Tape Broadcast
//!
//! Multicast fan-out of one market's reconciled tape using a tokio
//! broadcast channel. Every subscriber shares one pipeline; a subscriber
//! joining late sees only trades published after it joined.
//!
//! The hub is closed on dispose, which ends every subscriber stream. A
//! pipeline failure is published as a final event before closing, and kept
//! so later subscribers receive it instead of an empty stream.

use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::domain::trade::Trade;
use crate::error::ReconcileError;

/// Default per-market channel capacity in trades.
pub const DEFAULT_CAPACITY: usize = 65_536;

/// Event carried on the tape channel.
#[derive(Debug, Clone)]
pub enum TapeEvent {
    /// Next trade of the tape.
    Trade(Trade),
    /// The pipeline failed; no more trades follow.
    Terminated(ReconcileError),
}

/// Stream of reconciled trades handed to a subscriber.
pub type TapeStream = BoxStream<'static, Result<Trade, ReconcileError>>;

/// Fan-out hub for one market.
#[derive(Debug)]
pub struct TapeBroadcast {
    market: String,
    sender: Mutex<Option<broadcast::Sender<TapeEvent>>>,
    failure: Mutex<Option<ReconcileError>>,
}

impl TapeBroadcast {
    /// Create an open hub.
    #[must_use]
    pub fn new(market: impl Into<String>, capacity: usize) -> Self {
        Self {
            market: market.into(),
            sender: Mutex::new(Some(broadcast::channel(capacity.max(1)).0)),
            failure: Mutex::new(None),
        }
    }

    /// Market served by this hub.
    #[must_use]
    pub fn market(&self) -> &str {
        &self.market
    }

    /// Publish one trade.
    ///
    /// Returns the number of subscribers that received it, or `None` if
    /// there are none or the hub is closed.
    #[must_use]
    pub fn publish(&self, trade: Trade) -> Option<usize> {
        self.sender
            .lock()
            .as_ref()
            .and_then(|sender| sender.send(TapeEvent::Trade(trade)).ok())
    }

    /// Attach a new subscriber.
    ///
    /// Once closed, the returned stream yields the stored failure (or
    /// [`ReconcileError::Disposed`]) and ends.
    #[must_use]
    pub fn subscribe(&self) -> TapeStream {
        let receiver = self.sender.lock().as_ref().map(broadcast::Sender::subscribe);
        match receiver {
            Some(receiver) => into_stream(receiver),
            None => {
                let failure = self.failure.lock().clone().unwrap_or(ReconcileError::Disposed);
                stream::once(async move { Err(failure) }).boxed()
            }
        }
    }

    /// Publish `error` as the final event and close.
    pub fn terminate(&self, error: ReconcileError) {
        *self.failure.lock() = Some(error.clone());
        if let Some(sender) = self.sender.lock().take() {
            let _ = sender.send(TapeEvent::Terminated(error));
        }
    }

    /// Close without an error. Open streams end after their buffered trades.
    pub fn close(&self) {
        self.sender.lock().take();
    }

    /// Whether the hub no longer accepts subscribers.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sender.lock().is_none()
    }

    /// Active subscriber count.
    #[must_use]
    pub fn receiver_count(&self) -> usize {
        self.sender
            .lock()
            .as_ref()
            .map_or(0, broadcast::Sender::receiver_count)
    }
}

fn into_stream(receiver: broadcast::Receiver<TapeEvent>) -> TapeStream {
    stream::unfold(Some(receiver), |state| async move {
        let mut receiver = state?;
        match receiver.recv().await {
            Ok(TapeEvent::Trade(trade)) => Some((Ok(trade), Some(receiver))),
            Ok(TapeEvent::Terminated(error)) => Some((Err(error), None)),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                Some((Err(ReconcileError::ConsumerLagged { skipped }), None))
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    })
    .boxed()
}
