//! Per-connection outbound queue with bounded backpressure.
//!
//! Each WebSocket connection owns exactly one [`Outbound`]. The hub pushes
//! frames under its own lock; the connection's writer task drains them in
//! FIFO order. On overflow, the oldest coalescible frame (progress) is
//! evicted first; a critical frame that still cannot fit closes the
//! connection with `1009` rather than being dropped silently.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Notify;

use crate::realtime::protocol::{ServerMessage, close};

/// Frame queued for a connection's writer task.
#[derive(Debug, Clone)]
pub enum OutFrame {
    Message(ServerMessage),
    Ping,
    Close { code: u16, reason: String },
}

/// What happened to a pushed frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// An older progress frame was evicted to make room.
    Coalesced,
    /// Non-critical frame dropped; the dropped-count metric was bumped.
    DroppedNonCritical,
    /// Critical frame undeliverable; the connection is closing with `1009`.
    OverflowCritical,
}

pub struct Outbound {
    capacity: usize,
    inner: Mutex<Inner>,
    notify: Notify,
}

struct Inner {
    queue: VecDeque<OutFrame>,
    closing: bool,
    dropped: u64,
}

impl Outbound {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                closing: false,
                dropped: 0,
            }),
            notify: Notify::new(),
        }
    }

    /// Queue a server frame, applying the overflow policy.
    pub fn push(&self, msg: ServerMessage) -> PushOutcome {
        let mut inner = self.inner.lock().expect("outbound lock");
        if inner.closing {
            inner.dropped += 1;
            return PushOutcome::DroppedNonCritical;
        }

        if inner.queue.len() >= self.capacity {
            let coalescible = inner.queue.iter().position(
                |f| matches!(f, OutFrame::Message(m) if m.is_coalescible()),
            );
            if let Some(pos) = coalescible {
                inner.queue.remove(pos);
                inner.queue.push_back(OutFrame::Message(msg));
                self.notify.notify_one();
                return PushOutcome::Coalesced;
            }
            if msg.is_critical() {
                inner.closing = true;
                inner.queue.push_back(OutFrame::Close {
                    code: close::TOO_BIG,
                    reason: "outbound queue overflow".to_string(),
                });
                self.notify.notify_one();
                return PushOutcome::OverflowCritical;
            }
            inner.dropped += 1;
            return PushOutcome::DroppedNonCritical;
        }

        inner.queue.push_back(OutFrame::Message(msg));
        self.notify.notify_one();
        PushOutcome::Queued
    }

    /// Queue a liveness ping. Pings bypass the capacity bound.
    pub fn push_ping(&self) {
        let mut inner = self.inner.lock().expect("outbound lock");
        if inner.closing {
            return;
        }
        inner.queue.push_back(OutFrame::Ping);
        self.notify.notify_one();
    }

    /// Queue a close frame; everything pushed afterwards is dropped.
    pub fn close(&self, code: u16, reason: impl Into<String>) {
        let mut inner = self.inner.lock().expect("outbound lock");
        if inner.closing {
            return;
        }
        inner.closing = true;
        inner.queue.push_back(OutFrame::Close {
            code,
            reason: reason.into(),
        });
        self.notify.notify_one();
    }

    /// Await the next frame. The writer task exits after receiving
    /// [`OutFrame::Close`].
    pub async fn next(&self) -> OutFrame {
        loop {
            {
                let mut inner = self.inner.lock().expect("outbound lock");
                if let Some(frame) = inner.queue.pop_front() {
                    return frame;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Number of frames dropped under backpressure.
    pub fn dropped_count(&self) -> u64 {
        self.inner.lock().expect("outbound lock").dropped
    }

    pub fn queue_len(&self) -> usize {
        self.inner.lock().expect("outbound lock").queue.len()
    }
}
