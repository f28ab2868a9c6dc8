// Progress fan-out — per-session subscriber set with last-frame replay.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use super::frame::{Frame, PHASE_COUNT};

/// Why a subscriber's channel is being closed. Mapped to WebSocket close
/// codes by the server handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Job finished, archive link delivered (1000).
    Done,
    /// Gallery does not exist upstream (1008).
    NotFound,
    /// Terminal failure during download or packing (1011).
    Error,
}

/// Event delivered to a subscriber's forwarding task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    Frame(Frame),
    Close(CloseReason),
}

pub type EventSender = mpsc::UnboundedSender<SocketEvent>;

struct Subscriber {
    id: u64,
    tx: EventSender,
}

/// Subscribers and the per-phase frame cache live behind one lock so a
/// joining subscriber always sees replayed frames strictly before any frame
/// broadcast after its attach. `closed` latches the first terminal close so
/// a subscriber attaching after teardown began is closed on arrival instead
/// of joining a dead session.
struct Inner {
    subscribers: Vec<Subscriber>,
    cached: [Option<Frame>; PHASE_COUNT],
    closed: Option<CloseReason>,
}

pub struct Broadcaster {
    inner: Mutex<Inner>,
    next_id: AtomicU64,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                subscribers: Vec::new(),
                cached: [None, None, None],
                closed: None,
            }),
            next_id: AtomicU64::new(1),
        }
    }

    /// Add a subscriber and replay cached frames in phase order
    /// (download, pack, result). If the session already reached a terminal
    /// outcome — a result frame is cached, or `close_all` ran — the
    /// subscriber is closed right after replay and is not added to the live
    /// set. Returns the subscriber id.
    pub fn attach(&self, tx: EventSender) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock();

        for frame in inner.cached.iter().flatten() {
            let _ = tx.send(SocketEvent::Frame(frame.clone()));
        }

        let finished = matches!(inner.cached[2], Some(Frame::Result { .. }));
        let terminal = inner
            .closed
            .or(if finished { Some(CloseReason::Done) } else { None });
        match terminal {
            Some(reason) => {
                let _ = tx.send(SocketEvent::Close(reason));
            }
            None => inner.subscribers.push(Subscriber { id, tx }),
        }
        id
    }

    /// Remove a subscriber. Returns the number of subscribers remaining.
    pub fn detach(&self, id: u64) -> usize {
        let mut inner = self.inner.lock();
        inner.subscribers.retain(|s| s.id != id);
        inner.subscribers.len()
    }

    /// Cache the frame for its phase and send it to every live subscriber.
    /// Subscribers whose channel has gone away are pruned as the failure is
    /// observed.
    pub fn broadcast(&self, frame: Frame) {
        let mut inner = self.inner.lock();
        inner.cached[frame.phase() as usize] = Some(frame.clone());
        inner.subscribers.retain(|s| {
            let alive = s.tx.send(SocketEvent::Frame(frame.clone())).is_ok();
            if !alive {
                debug!("pruning dead subscriber {}", s.id);
            }
            alive
        });
    }

    /// Close and drop every subscriber, and latch the reason so anyone
    /// attaching afterwards is closed on arrival. The first reason wins.
    pub fn close_all(&self, reason: CloseReason) {
        let mut inner = self.inner.lock();
        if inner.closed.is_none() {
            inner.closed = Some(reason);
        }
        for s in inner.subscribers.drain(..) {
            let _ = s.tx.send(SocketEvent::Close(reason));
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }

    /// Whether a result frame has been cached (job finished).
    pub fn has_result(&self) -> bool {
        matches!(self.inner.lock().cached[2], Some(Frame::Result { .. }))
    }

    /// Drop all cached frames. Used by cleanup when a session is reclaimed.
    pub fn clear_cache(&self) {
        let mut inner = self.inner.lock();
        inner.cached = [None, None, None];
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}
