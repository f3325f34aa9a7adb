//! Per-request backlog ring for late subscribers.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::realtime::protocol::ServerMessage;

/// Bounded ring of recently published frames, retained for the TTL window so
/// a late subscriber receives the tail in publish order.
pub struct Backlog {
    entries: VecDeque<ServerMessage>,
    capacity: usize,
    ttl: Duration,
    last_publish: Instant,
    /// Set once the terminal frame has been published.
    terminal: bool,
}

impl Backlog {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(64)),
            capacity,
            ttl,
            last_publish: Instant::now(),
            terminal: false,
        }
    }

    /// Append a frame; ring overflow evicts the oldest entry.
    pub fn push(&mut self, msg: ServerMessage) {
        if matches!(msg, ServerMessage::Terminal { .. }) {
            self.terminal = true;
        }
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(msg);
        self.last_publish = Instant::now();
    }

    /// Snapshot in publish order, oldest first.
    pub fn replay(&self) -> Vec<ServerMessage> {
        self.entries.iter().cloned().collect()
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal
    }

    /// Expired backlogs are reclaimed by the hub's heartbeat pass.
    pub fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.last_publish) > self.ttl
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
