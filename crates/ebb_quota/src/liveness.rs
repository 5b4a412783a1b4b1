//! Per-peer activity bookkeeping backing the liveness predicate.
//!
//! The policy for deciding who is live is stricter than the one a range
//! would use for quiescing: treating a dead peer as live stalls writes,
//! whereas treating it as dead for quiescing merely keeps the range awake.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::types::ReplicaId;

/// Wall-clock time at which each peer's liveness was last confirmed.
#[derive(Debug, Default)]
pub struct LastUpdateTimes {
    by_peer: HashMap<ReplicaId, Instant>,
}

impl LastUpdateTimes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `peer` was heard from at `now`.
    pub fn update(&mut self, peer: ReplicaId, now: Instant) {
        self.by_peer.insert(peer, now);
    }

    /// Seed every member with `now` when this replica becomes leader. A new
    /// leader has no recent communication with anyone; this gives it a full
    /// lease window to observe its peers before writing any of them off.
    pub fn update_on_become_leader(&mut self, replicas: &[ReplicaId], now: Instant) {
        for replica in replicas {
            self.by_peer.insert(*replica, now);
        }
    }

    /// True iff `peer` was heard from within `threshold` of `now`. Unknown
    /// peers are not active.
    pub fn is_follower_active_since(
        &self,
        peer: ReplicaId,
        now: Instant,
        threshold: Duration,
    ) -> bool {
        match self.by_peer.get(&peer) {
            Some(last) => now.saturating_duration_since(*last) <= threshold,
            None => false,
        }
    }

    pub fn clear(&mut self) {
        self.by_peer.clear();
    }

    pub fn len(&self) -> usize {
        self.by_peer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_peer.is_empty()
    }
}
