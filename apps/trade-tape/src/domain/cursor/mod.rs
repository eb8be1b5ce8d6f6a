//! Stream Cursor
//!
//! Reconciler-owned progress state for one market: the last trade id handed
//! to subscribers, the current REST window coefficient, whether the realtime
//! feed has connected, and the pipeline phase.
//!
//! One cursor exists per market. Every subscriber of that market shares it
//! through the multicast output; it is never duplicated per subscriber.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use parking_lot::RwLock;
use serde::Serialize;

use crate::domain::trade::TradeId;

/// Sentinel for "nothing delivered yet". Venue ids start at 1.
const NOTHING_DELIVERED: TradeId = 0;

// =============================================================================
// Phase
// =============================================================================

/// Lifecycle phase of a market's reconciliation pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamPhase {
    /// Created, no subscriber yet.
    Idle,
    /// Locating history or pulling REST windows.
    Backfilling,
    /// Backfill reached the realtime feed, draining the buffer.
    CaughtUp,
    /// Realtime trades go straight to subscribers.
    Forwarding,
    /// Failed or disposed. The stream will not produce more trades.
    Terminated,
}

impl StreamPhase {
    /// Lowercase name of the phase.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Backfilling => "backfilling",
            Self::CaughtUp => "caught_up",
            Self::Forwarding => "forwarding",
            Self::Terminated => "terminated",
        }
    }
}

// =============================================================================
// Cursor
// =============================================================================

/// Shared progress state for one market.
#[derive(Debug)]
pub struct StreamCursor {
    last_delivered_id: AtomicI64,
    coefficient: RwLock<f64>,
    realtime_started: AtomicBool,
    phase: RwLock<StreamPhase>,
}

impl Default for StreamCursor {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamCursor {
    /// Create a cursor with nothing delivered and a unit coefficient.
    #[must_use]
    pub fn new() -> Self {
        Self {
            last_delivered_id: AtomicI64::new(NOTHING_DELIVERED),
            coefficient: RwLock::new(1.0),
            realtime_started: AtomicBool::new(false),
            phase: RwLock::new(StreamPhase::Idle),
        }
    }

    /// Id of the last trade delivered, if any.
    #[must_use]
    pub fn last_delivered_id(&self) -> Option<TradeId> {
        match self.last_delivered_id.load(Ordering::Acquire) {
            NOTHING_DELIVERED => None,
            id => Some(id),
        }
    }

    /// Record `id` as delivered if it is newer than the current position.
    ///
    /// Returns `false` and leaves the cursor untouched for stale ids.
    pub fn advance(&self, id: TradeId) -> bool {
        self.last_delivered_id
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (id > current).then_some(id)
            })
            .is_ok()
    }

    /// Current window coefficient.
    #[must_use]
    pub fn coefficient(&self) -> f64 {
        *self.coefficient.read()
    }

    /// Publish a new window coefficient.
    pub fn set_coefficient(&self, coefficient: f64) {
        *self.coefficient.write() = coefficient;
    }

    /// Whether the realtime feed has connected at least once.
    #[must_use]
    pub fn realtime_started(&self) -> bool {
        self.realtime_started.load(Ordering::Acquire)
    }

    /// Mark the realtime feed as connected.
    pub fn mark_realtime_started(&self) {
        self.realtime_started.store(true, Ordering::Release);
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> StreamPhase {
        *self.phase.read()
    }

    /// Move to `phase`. A terminated cursor stays terminated.
    pub fn set_phase(&self, phase: StreamPhase) {
        let mut current = self.phase.write();
        if *current != StreamPhase::Terminated {
            *current = phase;
        }
    }

    /// Point-in-time view for diagnostics.
    #[must_use]
    pub fn snapshot(&self, market: &str, subscribers: usize) -> CursorSnapshot {
        CursorSnapshot {
            market: market.to_string(),
            phase: self.phase(),
            last_delivered_id: self.last_delivered_id(),
            coefficient: self.coefficient(),
            realtime_started: self.realtime_started(),
            subscribers,
        }
    }
}

/// Serializable view of a [`StreamCursor`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CursorSnapshot {
    /// Market identifier.
    pub market: String,
    /// Pipeline phase.
    pub phase: StreamPhase,
    /// Last delivered trade id.
    pub last_delivered_id: Option<TradeId>,
    /// Current REST window coefficient.
    pub coefficient: f64,
    /// Whether the realtime feed has connected.
    pub realtime_started: bool,
    /// Active subscriber count.
    pub subscribers: usize,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_cursor_is_empty() {
        let cursor = StreamCursor::new();
        assert_eq!(cursor.last_delivered_id(), None);
        assert_eq!(cursor.phase(), StreamPhase::Idle);
        assert!(!cursor.realtime_started());
        assert!((cursor.coefficient() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn advance_only_moves_forward() {
        let cursor = StreamCursor::new();
        assert!(cursor.advance(5));
        assert!(cursor.advance(9));
        assert!(!cursor.advance(9));
        assert!(!cursor.advance(3));
        assert_eq!(cursor.last_delivered_id(), Some(9));
    }

    #[test]
    fn terminated_is_sticky() {
        let cursor = StreamCursor::new();
        cursor.set_phase(StreamPhase::Terminated);
        cursor.set_phase(StreamPhase::Forwarding);
        assert_eq!(cursor.phase(), StreamPhase::Terminated);
    }

    #[test]
    fn snapshot_serializes_phase_snake_case() {
        let cursor = StreamCursor::new();
        cursor.set_phase(StreamPhase::CaughtUp);
        cursor.advance(42);
        let json = serde_json::to_value(cursor.snapshot("BTC-USD", 2)).unwrap();
        assert_eq!(json["phase"], "caught_up");
        assert_eq!(json["last_delivered_id"], 42);
        assert_eq!(json["subscribers"], 2);
    }
}
