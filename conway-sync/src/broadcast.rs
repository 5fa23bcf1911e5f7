//! Fan-out of state updates to every open session, with bounded buffering.
//!
//! Every registered session owns an [`Outbox`]; its [`Subscriber`] half is
//! drained by the connection task. A broadcast encodes the message once,
//! walks the [`SessionRegistry`] and pushes a clone of the same shared text
//! buffer into each open session's outbox, so all clients see
//! byte-identical frames in the same order. Deregistering a session drops
//! its outbox, which ends its subscriber stream.
//!
//! Each outbox buffers at most `capacity` frames. A client that falls
//! further behind loses the oldest frames and resumes from the newest; since
//! every `UPDATE_STATE` carries the full board, it still converges.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio_tungstenite::tungstenite::Utf8Bytes;

use crate::error::ProtocolError;
use crate::protocol::ServerMessage;
use crate::registry::SessionRegistry;

/// An encoded text frame, cheap to clone.
pub type Frame = Utf8Bytes;

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_receivers: usize,
}

/// Counters shared between the group and its subscribers.
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
    active_receivers: AtomicUsize,
}

impl AtomicBroadcastStats {
    fn new() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
            active_receivers: AtomicUsize::new(0),
        }
    }
}

/// The broadcast engine.
pub struct BroadcastGroup {
    /// Frames buffered per session before the oldest are dropped
    capacity: usize,
    atomic_stats: Arc<AtomicBroadcastStats>,
}

impl BroadcastGroup {
    /// Create a group buffering up to `capacity` frames per session.
    ///
    /// The bound is rounded up to a power of two (minimum 1), which is what
    /// the underlying channel enforces.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1).next_power_of_two(),
            atomic_stats: Arc::new(AtomicBroadcastStats::new()),
        }
    }

    /// A fresh per-session queue.
    ///
    /// The outbox goes into the session's registry entry; the subscriber
    /// goes to the task that writes to the socket.
    pub fn channel(&self) -> (Outbox, Subscriber) {
        let (sender, receiver) = broadcast::channel(self.capacity);
        self.atomic_stats.active_receivers.fetch_add(1, Ordering::Relaxed);
        (
            Outbox { sender },
            Subscriber {
                receiver,
                stats: self.atomic_stats.clone(),
            },
        )
    }

    /// Encode one `UPDATE_STATE` envelope and send it to every open session.
    ///
    /// Returns the number of sessions the frame was queued for.
    pub fn broadcast_state(
        &self,
        registry: &SessionRegistry,
        state: &Value,
    ) -> Result<usize, ProtocolError> {
        self.broadcast(registry, &ServerMessage::update_state(state.clone()))
    }

    /// Encode once, then fan out.
    pub fn broadcast(
        &self,
        registry: &SessionRegistry,
        msg: &ServerMessage,
    ) -> Result<usize, ProtocolError> {
        let encoded = msg.encode()?;
        Ok(self.broadcast_raw(registry, Frame::from(encoded)))
    }

    /// Fan out an already-encoded frame.
    pub fn broadcast_raw(&self, registry: &SessionRegistry, frame: Frame) -> usize {
        let mut count = 0;
        registry.for_each(|session| {
            if session.deliver(frame.clone()) {
                count += 1;
            }
        });
        self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        log::trace!("Broadcast frame to {count} session(s)");
        count
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.atomic_stats.messages_dropped.load(Ordering::Relaxed),
            active_receivers: self.atomic_stats.active_receivers.load(Ordering::Relaxed),
        }
    }
}

/// Sending half of one session's queue, held by its registry entry.
pub struct Outbox {
    sender: broadcast::Sender<Frame>,
}

impl Outbox {
    /// Queue a frame. `false` if the subscriber is gone.
    pub fn push(&self, frame: Frame) -> bool {
        self.sender.send(frame).is_ok()
    }
}

impl fmt::Debug for Outbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Outbox")
            .field("queued", &self.sender.len())
            .finish()
    }
}

/// One session's view of the broadcast stream.
///
/// The stream ends once the session's outbox is dropped.
pub struct Subscriber {
    receiver: broadcast::Receiver<Frame>,
    stats: Arc<AtomicBroadcastStats>,
}

impl Subscriber {
    /// Wait for the next frame. `None` once the session is deregistered.
    ///
    /// Frames lost to overflow are counted and skipped.
    pub async fn recv(&mut self) -> Option<Frame> {
        loop {
            match self.receiver.recv().await {
                Ok(frame) => return Some(frame),
                Err(RecvError::Lagged(n)) => self.record_lag(n),
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Next frame if one is already queued.
    pub fn try_recv(&mut self) -> Option<Frame> {
        loop {
            match self.receiver.try_recv() {
                Ok(frame) => return Some(frame),
                Err(TryRecvError::Lagged(n)) => self.record_lag(n),
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }

    /// Frames queued and not yet received.
    pub fn pending(&self) -> usize {
        self.receiver.len()
    }

    fn record_lag(&self, n: u64) {
        self.stats.messages_dropped.fetch_add(n, Ordering::Relaxed);
        log::warn!("Slow subscriber dropped {n} oldest update(s)");
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.stats.active_receivers.fetch_sub(1, Ordering::Relaxed);
    }
}
