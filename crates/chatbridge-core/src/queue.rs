//! Event queue between interception and serving.
//!
//! The sole hand-off point between the network-interception context (which
//! may run on another thread, or out of process behind an IPC shim) and the
//! serving logic. Producers push decoded JSON items without blocking;
//! exactly one consumer pulls them per session.

use serde_json::Value;
use tokio::sync::mpsc;

/// Producer handle, cloneable into the interception callback.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<Value>,
}

impl EventSink {
    /// Pushes one item. Never blocks; a dropped consumer makes this a no-op.
    pub fn push(&self, item: Value) {
        if self.tx.send(item).is_err() {
            tracing::debug!("event sink push after consumer dropped");
        }
    }
}

/// Consumer side of the queue.
///
/// `try_pull` is non-blocking by design: the stream consumer owns its own
/// polling cadence and must interleave timeout/shutdown checks between
/// pulls.
pub struct EventQueue {
    rx: parking_lot::Mutex<mpsc::UnboundedReceiver<Value>>,
}

impl EventQueue {
    /// Creates a connected sink/queue pair.
    pub fn channel() -> (EventSink, EventQueue) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            EventSink { tx },
            EventQueue {
                rx: parking_lot::Mutex::new(rx),
            },
        )
    }

    /// Pulls one item if available.
    pub fn try_pull(&self) -> Option<Value> {
        self.rx.lock().try_recv().ok()
    }

    /// Discards everything currently queued and returns the count.
    ///
    /// Called when a session exits so stale items never leak into the next
    /// generation.
    pub fn drain(&self) -> usize {
        let mut rx = self.rx.lock();
        let mut dropped = 0;
        while rx.try_recv().is_ok() {
            dropped += 1;
        }
        dropped
    }
}

impl std::fmt::Debug for EventQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventQueue").finish()
    }
}
