//! Early-candidate buffer.
//!
//! Candidates race the offer/answer exchange: the remote side can start
//! trickling them before a negotiation session exists locally, and the engine
//! rejects candidates until a remote description is applied. They wait here
//! until the session is ready, then drain exactly once in arrival order.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

/// Default number of buffered candidates before the oldest is dropped.
pub const DEFAULT_CAPACITY: usize = 256;

/// A candidate held back until its session exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCandidate {
    /// Endpoint that sent it.
    pub from: String,
    /// Encoded candidate exactly as received.
    pub candidate: String,
    pub received_at: Instant,
}

/// Bounded FIFO of early candidates.
#[derive(Debug)]
pub struct CandidateBuffer {
    items: VecDeque<PendingCandidate>,
    capacity: usize,
    dropped: u64,
}

impl CandidateBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::new(),
            capacity: capacity.max(1),
            dropped: 0,
        }
    }

    /// Store a candidate. Never fails; drops the oldest entry when full.
    pub fn append(&mut self, from: impl Into<String>, candidate: impl Into<String>) {
        if self.items.len() >= self.capacity {
            if let Some(oldest) = self.items.pop_front() {
                self.dropped += 1;
                tracing::warn!(
                    from = %oldest.from,
                    capacity = self.capacity,
                    dropped = self.dropped,
                    "Candidate buffer full, dropping oldest candidate"
                );
            }
        }
        self.items.push_back(PendingCandidate {
            from: from.into(),
            candidate: candidate.into(),
            received_at: Instant::now(),
        });
    }

    /// Take everything in arrival order, leaving the buffer empty.
    pub fn drain(&mut self) -> Vec<PendingCandidate> {
        self.items.drain(..).collect()
    }

    /// Take the candidates sent by `from` in arrival order; everything else is discarded.
    pub fn drain_from(&mut self, from: &str) -> Vec<String> {
        let mut kept = Vec::new();
        let mut discarded = 0usize;
        for item in self.drain() {
            if item.from == from {
                kept.push(item.candidate);
            } else {
                discarded += 1;
            }
        }
        if discarded > 0 {
            tracing::debug!(remote = %from, discarded, "Dropped buffered candidates from other endpoints");
        }
        kept
    }

    /// Discard entries that have waited longer than `max_age`. Returns how many went.
    pub fn expire(&mut self, max_age: Duration) -> usize {
        let now = Instant::now();
        let before = self.items.len();
        self.items
            .retain(|item| now.saturating_duration_since(item.received_at) <= max_age);
        let expired = before - self.items.len();
        if expired > 0 {
            tracing::debug!(expired, "Dropped candidates that outlived their call");
        }
        expired
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl Default for CandidateBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
