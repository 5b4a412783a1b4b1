//! Ordered record of per-applied-entry token allocations awaiting release.

use std::collections::VecDeque;

use ebb_pool::Alloc;

/// One allocation per applied log entry since leadership was assumed, in
/// strict log-index order. The apply path appends; the reconciler drains a
/// prefix once all live peers have replicated past it.
#[derive(Debug, Default)]
pub struct ReleaseQueue {
    entries: VecDeque<Alloc>,
    queued_tokens: u64,
}

impl ReleaseQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, alloc: Alloc) {
        self.queued_tokens = self.queued_tokens.saturating_add(alloc.acquired());
        self.entries.push_back(alloc);
    }

    /// Remove and return the oldest `n` entries. `n` beyond the queue length
    /// is an accounting bug and fatal.
    pub fn drain_prefix(&mut self, n: usize) -> Vec<Alloc> {
        if n > self.entries.len() {
            panic!(
                "release queue prefix {} exceeds queue length {}",
                n,
                self.entries.len()
            );
        }
        let drained: Vec<Alloc> = self.entries.drain(..n).collect();
        for alloc in &drained {
            self.queued_tokens = self.queued_tokens.saturating_sub(alloc.acquired());
        }
        drained
    }

    pub fn drain_all(&mut self) -> Vec<Alloc> {
        self.queued_tokens = 0;
        self.entries.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total tokens currently held by queued entries.
    pub fn queued_tokens(&self) -> u64 {
        self.queued_tokens
    }
}
