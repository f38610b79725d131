//! Bounded holding buffer for unrouted peer-negotiation envelopes
//!
//! Peer-negotiation messages can arrive before the peer session has
//! registered its handlers. Instead of dropping them, the channel parks them
//! here until a handler for their tag appears. The buffer is bounded
//! (oldest entries evicted first) and entries are timestamped so the
//! janitor can expire stale ones.

use super::envelope::Envelope;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::debug;

/// One parked envelope with its arrival time
#[derive(Debug, Clone)]
pub struct BufferedEnvelope {
    /// The parked envelope
    pub envelope: Envelope,
    /// When it was received
    pub arrived_at: Instant,
}

/// Bounded FIFO of envelopes awaiting a handler
#[derive(Debug)]
pub struct PendingBuffer {
    entries: VecDeque<BufferedEnvelope>,
    capacity: usize,
}

impl PendingBuffer {
    /// Create a buffer holding at most `capacity` envelopes
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(64)),
            capacity,
        }
    }

    /// Park an envelope, evicting the oldest entries once full
    pub fn push(&mut self, envelope: Envelope) {
        self.entries.push_back(BufferedEnvelope {
            envelope,
            arrived_at: Instant::now(),
        });
        while self.entries.len() > self.capacity {
            if let Some(evicted) = self.entries.pop_front() {
                debug!(
                    tag = %evicted.envelope.tag,
                    "Pending buffer full, evicting oldest envelope"
                );
            }
        }
    }

    /// Remove and return every envelope with the given tag, in arrival order
    pub fn drain_tag(&mut self, tag: &str) -> Vec<Envelope> {
        let mut drained = Vec::new();
        let mut kept = VecDeque::with_capacity(self.entries.len());
        for entry in self.entries.drain(..) {
            if entry.envelope.tag == tag {
                drained.push(entry.envelope);
            } else {
                kept.push_back(entry);
            }
        }
        self.entries = kept;
        drained
    }

    /// Evict entries older than `ttl`, returning how many were removed
    pub fn sweep(&mut self, ttl: Duration) -> usize {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.arrived_at.elapsed() < ttl);
        before - self.entries.len()
    }

    /// Number of parked envelopes
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the buffer is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Configured capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drop every entry
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
