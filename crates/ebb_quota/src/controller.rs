//! Replica-side quota controller: leader lifecycle, per-tick reconciliation
//! of peer progress, and the proposer-facing acquire path.
//!
//! All mutable state sits behind one mutex, the per-range lock. The
//! reconciler runs entirely under it and never blocks; the acquire path
//! snapshots the pool handle under the lock and waits outside it. Accounting
//! mismatches are fatal: the process crashes rather than continue with
//! silently corrupt replication bookkeeping.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use ebb_pool::{AcquireError, Alloc, TokenPool};

use crate::liveness::LastUpdateTimes;
use crate::queue::ReleaseQueue;
use crate::types::{
    Clock, LogIndex, ProposalRequest, QuotaConfig, RaftProgress, RangeDescriptor, ReplicaId,
    SystemClock,
};

/// Point-in-time snapshot of controller internals for debugging.
#[derive(Clone, Debug)]
pub struct QuotaDebugStats {
    pub leader: bool,
    pub base_index: LogIndex,
    pub queue_len: usize,
    pub queued_tokens: u64,
    pub approximate_quota: Option<u64>,
    pub capacity: Option<u64>,
    pub paused_followers_len: usize,
    pub last_proposal_at_ticks: Option<u64>,
}

struct QuotaState {
    /// Present iff this replica is the leader.
    pool: Option<TokenPool>,
    /// The release queue records costs for log indices
    /// `base_index + 1 ..= base_index + queue.len()`.
    base_index: LogIndex,
    queue: ReleaseQueue,
    last_update_times: LastUpdateTimes,
    /// Peers the leader is intentionally not sending log entries to. Distinct
    /// from liveness: a paused peer may be healthy, but it must not hold up
    /// quota while it is being starved of appends.
    paused_followers: HashSet<ReplicaId>,
    /// Latest descriptor observed on a tick, snapshotted by the acquire path.
    desc: Option<RangeDescriptor>,
    /// Most recently added replica, `0` if none is being tracked.
    last_replica_added: ReplicaId,
    last_replica_added_at: Option<Instant>,
    ticks: u64,
    /// Tick of the most recent proposal activity, used to delay quiescence.
    last_proposal_at_ticks: Option<u64>,
}

/// Leader-side proposal quota controller for one replica of one range.
///
/// Inert on followers. The consensus driver calls [`on_tick`] after every
/// tick, the apply path calls [`on_applied`] for every committed entry, and
/// proposers go through [`maybe_acquire`] before submitting.
///
/// [`on_tick`]: ReplicaQuota::on_tick
/// [`on_applied`]: ReplicaQuota::on_applied
/// [`maybe_acquire`]: ReplicaQuota::maybe_acquire
pub struct ReplicaQuota {
    replica_id: ReplicaId,
    config: QuotaConfig,
    enabled: AtomicBool,
    clock: Arc<dyn Clock>,
    mu: Mutex<QuotaState>,
}

impl ReplicaQuota {
    pub fn new(replica_id: ReplicaId, config: QuotaConfig) -> Self {
        Self::with_clock(replica_id, config, Arc::new(SystemClock))
    }

    pub fn with_clock(replica_id: ReplicaId, config: QuotaConfig, clock: Arc<dyn Clock>) -> Self {
        let enabled = AtomicBool::new(config.enabled);
        Self {
            replica_id,
            config,
            enabled,
            clock,
            mu: Mutex::new(QuotaState {
                pool: None,
                base_index: 0,
                queue: ReleaseQueue::new(),
                last_update_times: LastUpdateTimes::new(),
                paused_followers: HashSet::new(),
                desc: None,
                last_replica_added: 0,
                last_replica_added_at: None,
                ticks: 0,
                last_proposal_at_ticks: None,
            }),
        }
    }

    /// Flip the acquire path on or off at runtime. Tick-side bookkeeping is
    /// unaffected, so the flag is safe to toggle mid-run.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Acquire quota for a proposal of `cost` tokens, or decide the proposal
    /// is exempt and let it through with `None`.
    ///
    /// Lease requests and transfers, disabled quota, follower replicas, and
    /// the node-liveness range all short-circuit to `Ok(None)`. A pool closed
    /// by a concurrent leader change also maps to `Ok(None)`: the proposal
    /// proceeds, the former leader has relinquished control. Cancellation
    /// propagates to the caller.
    pub async fn maybe_acquire(
        &self,
        cancel: &CancellationToken,
        request: &ProposalRequest,
        cost: u64,
    ) -> Result<Option<Alloc>, AcquireError> {
        // Lease traffic is small and latency-sensitive; throttling it risks
        // lease-renewal starvation and cascading failures.
        if request.is_single_lease_request || request.is_single_lease_transfer {
            return Ok(None);
        }
        if !self.enabled() {
            return Ok(None);
        }

        // Snapshot under the range lock, wait outside it.
        let (pool, desc) = {
            let mut state = self.mu.lock().unwrap();
            let ticks = state.ticks;
            state.last_proposal_at_ticks = Some(ticks);
            (state.pool.clone(), state.desc.clone())
        };
        // Followers (and leaseholders that are not the leader) have no pool;
        // their proposals must go through or nobody could request the lease.
        let Some(pool) = pool else {
            return Ok(None);
        };
        if desc.is_some_and(|d| d.is_liveness_range()) {
            return Ok(None);
        }

        let available = pool.approximate_quota();
        if available < pool.capacity() / 10 {
            tracing::trace!(
                available,
                capacity = pool.capacity(),
                "proposal quota running low"
            );
        }

        match pool.acquire(cancel, cost).await {
            Ok(alloc) => Ok(Some(alloc)),
            Err(AcquireError::Closed { .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Record the allocation for the committed entry applied at `index`.
    /// `None` stands for a zero-cost entry the leader generated internally.
    ///
    /// Must be called in apply order; an index that does not extend the
    /// queue contiguously is fatal.
    pub fn on_applied(&self, index: LogIndex, alloc: Option<Alloc>) {
        let mut state = self.mu.lock().unwrap();
        let Some(pool) = state.pool.clone() else {
            // Not leading: nothing is tracked. A surviving allocation from an
            // earlier term drops here and credits its own (closed) pool.
            return;
        };
        let expected = state.base_index + state.queue.len() as u64 + 1;
        if index != expected {
            panic!(
                "applied entry at index {index} does not extend the release queue \
                 (base index {} + queue length {})",
                state.base_index,
                state.queue.len()
            );
        }
        state
            .queue
            .push(alloc.unwrap_or_else(|| pool.empty_alloc()));
    }

    /// Reconcile quota bookkeeping against consensus progress. Called by the
    /// consensus driver after every tick; `prev_leader_id` is the leader
    /// observed on the previous tick.
    pub fn on_tick(
        &self,
        prev_leader_id: ReplicaId,
        raft: &dyn RaftProgress,
        desc: &RangeDescriptor,
    ) {
        let now = self.clock.now();
        let mut guard = self.mu.lock().unwrap();
        let state = &mut *guard;
        state.ticks += 1;
        state.desc = Some(desc.clone());

        let status = raft.status();
        if status.leader_id != prev_leader_id {
            if self.replica_id == status.leader_id {
                self.become_leader(state, status.applied, desc, now);
            } else if state.pool.is_some() {
                self.become_follower(state);
            }
            return;
        } else if state.pool.is_none() {
            if self.replica_id == status.leader_id {
                panic!("leader has uninitialized proposal quota pool");
            }
            // Follower with nothing to do.
            return;
        }
        if self.replica_id != status.leader_id {
            panic!("follower holds a live proposal quota pool");
        }

        // Still the leader: find the minimum index live followers have
        // acknowledged. Start at the locally applied index; the queue holds
        // nothing beyond it, so progress past it is irrelevant here. The
        // commit index decides whether a newly added replica has caught up.
        let mut min_index = status.applied;
        let mut last_added_caught_up = false;
        {
            let base_index = state.base_index;
            let last_update_times = &state.last_update_times;
            let paused_followers = &state.paused_followers;
            let last_replica_added = state.last_replica_added;
            let lease = self.config.lease_duration;
            raft.with_progress(&mut |peer, _peer_state, match_index| {
                if !desc.replicas.contains(&peer) {
                    return;
                }
                // Inactive peers do not hold up releasing quota. Either we
                // communicated with this peer recently or we became leader
                // recently; the latter is ambiguous but temporary.
                if !last_update_times.is_follower_active_since(peer, now, lease) {
                    return;
                }
                // A recovering peer must first catch up to the base index,
                // otherwise its return would pin throughput at zero until it
                // has replayed everything it missed.
                if match_index < base_index {
                    return;
                }
                // Appends to this peer are being dropped on purpose; it is
                // non-live for replication and falls behind intentionally.
                if paused_followers.contains(&peer) {
                    return;
                }
                if match_index > 0 && match_index < min_index {
                    min_index = match_index;
                }
                if last_replica_added != 0
                    && peer == last_replica_added
                    && match_index >= status.commit
                {
                    last_added_caught_up = true;
                }
            });
        }
        if last_added_caught_up {
            // Unrelated to quota, but this scan is the convenient place to
            // notice the newest replica finished catching up.
            state.last_replica_added = 0;
            state.last_replica_added_at = None;
        }

        if min_index > state.base_index {
            // Every live peer has persisted entries up to min_index and we
            // applied them locally, so the difference goes back to the pool.
            let releases = (min_index - state.base_index) as usize;
            let released = state.queue.drain_prefix(releases);
            if let Some(pool) = &state.pool {
                pool.release(released);
            }
            state.base_index = min_index;
        }

        let releasable = state.base_index + state.queue.len() as u64;
        if releasable != status.applied {
            panic!(
                "quota base index ({}) + release queue length ({}) = {} \
                 must equal the applied index ({})",
                state.base_index,
                state.queue.len(),
                releasable,
                status.applied
            );
        }
    }

    /// Record that `peer` was heard from. Fed by the embedding message layer;
    /// only meaningful while leading.
    pub fn record_peer_activity(&self, peer: ReplicaId) {
        let now = self.clock.now();
        let mut state = self.mu.lock().unwrap();
        if state.pool.is_some() {
            state.last_update_times.update(peer, now);
        }
    }

    /// Stop counting `peer` towards quota release while appends to it are
    /// deliberately withheld.
    pub fn pause_follower(&self, peer: ReplicaId) {
        let mut state = self.mu.lock().unwrap();
        state.paused_followers.insert(peer);
    }

    pub fn resume_follower(&self, peer: ReplicaId) {
        let mut state = self.mu.lock().unwrap();
        state.paused_followers.remove(&peer);
    }

    /// Track `peer` as the most recently added replica until it catches up
    /// to the commit index.
    pub fn note_replica_added(&self, peer: ReplicaId) {
        let now = self.clock.now();
        let mut state = self.mu.lock().unwrap();
        state.last_replica_added = peer;
        state.last_replica_added_at = Some(now);
    }

    pub fn last_replica_added(&self) -> Option<ReplicaId> {
        let state = self.mu.lock().unwrap();
        (state.last_replica_added != 0).then_some(state.last_replica_added)
    }

    pub fn last_replica_added_at(&self) -> Option<Instant> {
        self.mu.lock().unwrap().last_replica_added_at
    }

    /// Tick of the most recent proposal activity, used by the embedding
    /// replica to delay imminent quiescence.
    pub fn last_proposal_at_ticks(&self) -> Option<u64> {
        self.mu.lock().unwrap().last_proposal_at_ticks
    }

    pub fn debug_stats(&self) -> QuotaDebugStats {
        let state = self.mu.lock().unwrap();
        QuotaDebugStats {
            leader: state.pool.is_some(),
            base_index: state.base_index,
            queue_len: state.queue.len(),
            queued_tokens: state.queue.queued_tokens(),
            approximate_quota: state.pool.as_ref().map(|p| p.approximate_quota()),
            capacity: state.pool.as_ref().map(|p| p.capacity()),
            paused_followers_len: state.paused_followers.len(),
            last_proposal_at_ticks: state.last_proposal_at_ticks,
        }
    }

    /// Tear down on replica destruction: unblock waiters and reclaim the
    /// queue. Safe to call on followers and more than once.
    pub fn close(&self) {
        let mut state = self.mu.lock().unwrap();
        if let Some(pool) = state.pool.take() {
            pool.close("replica destroyed");
            pool.release(state.queue.drain_all());
        }
        state.last_update_times.clear();
        state.desc = None;
    }

    fn become_leader(
        &self,
        state: &mut QuotaState,
        applied: LogIndex,
        desc: &RangeDescriptor,
        now: Instant,
    ) {
        if state.pool.is_some() {
            panic!("proposal quota pool was not empty before becoming the leader");
        }
        if !state.queue.is_empty() {
            panic!(
                "release queue has {} entries, expected 0 before becoming the leader",
                state.queue.len()
            );
        }
        // Consensus synthesises log entries at term boundaries (the empty
        // entry after an election) that never pass through acquire. Anchoring
        // the base at the applied index with a fresh pool re-aligns the
        // accounting without chasing those out-of-band entries.
        state.base_index = applied;
        state.pool = Some(TokenPool::with_slow_acquisition(
            "proposal quota",
            self.config.capacity,
            self.config.slow_acquisition_threshold,
        ));
        state.last_update_times = LastUpdateTimes::new();
        state
            .last_update_times
            .update_on_become_leader(&desc.replicas, now);
        state.last_proposal_at_ticks = Some(state.ticks);
        tracing::debug!(
            replica = self.replica_id,
            range = desc.range_id,
            base_index = applied,
            capacity = self.config.capacity,
            "became leader, opened proposal quota pool"
        );
    }

    fn become_follower(&self, state: &mut QuotaState) {
        // Unblock every ongoing and subsequent acquisition, then run the
        // queue through release so handles are reclaimed; against the closed
        // pool that credits nothing.
        let Some(pool) = state.pool.take() else {
            return;
        };
        pool.close("leader change");
        pool.release(state.queue.drain_all());
        state.last_update_times.clear();
        tracing::debug!(
            replica = self.replica_id,
            "lost leadership, closed proposal quota pool"
        );
    }
}

impl std::fmt::Debug for ReplicaQuota {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.debug_stats();
        f.debug_struct("ReplicaQuota")
            .field("replica_id", &self.replica_id)
            .field("stats", &stats)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use crate::types::{ConsensusStatus, PeerState};

    struct ManualClock {
        now: StdMutex<Instant>,
    }

    impl ManualClock {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                now: StdMutex::new(Instant::now()),
            })
        }

        fn advance(&self, by: Duration) {
            let mut now = self.now.lock().unwrap();
            *now += by;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> Instant {
            *self.now.lock().unwrap()
        }
    }

    struct TestRaft {
        status: ConsensusStatus,
        progress: Vec<(ReplicaId, PeerState, LogIndex)>,
    }

    impl RaftProgress for TestRaft {
        fn status(&self) -> ConsensusStatus {
            self.status
        }

        fn with_progress(&self, f: &mut dyn FnMut(ReplicaId, PeerState, LogIndex)) {
            for (peer, state, match_index) in &self.progress {
                f(*peer, *state, *match_index);
            }
        }
    }

    fn config(capacity: u64) -> QuotaConfig {
        QuotaConfig {
            enabled: true,
            capacity,
            lease_duration: Duration::from_secs(9),
            slow_acquisition_threshold: None,
        }
    }

    fn desc(replicas: &[ReplicaId]) -> RangeDescriptor {
        RangeDescriptor {
            range_id: 1,
            start_key: b"user".to_vec(),
            end_key: Vec::new(),
            replicas: replicas.to_vec(),
        }
    }

    fn raft(leader: ReplicaId, applied: u64, commit: u64) -> TestRaft {
        TestRaft {
            status: ConsensusStatus {
                applied,
                commit,
                leader_id: leader,
            },
            progress: Vec::new(),
        }
    }

    /// Drive replica 1 into leadership at the given applied index.
    fn lead(quota: &ReplicaQuota, applied: u64, members: &[ReplicaId]) {
        let mut raft = raft(1, applied, applied);
        raft.progress = members
            .iter()
            .map(|id| (*id, PeerState::Replicate, applied))
            .collect();
        quota.on_tick(0, &raft, &desc(members));
    }

    #[test]
    fn becoming_leader_opens_pool_at_applied_index() {
        let quota = ReplicaQuota::new(1, config(100));
        lead(&quota, 10, &[1, 2, 3]);

        let stats = quota.debug_stats();
        assert!(stats.leader);
        assert_eq!(stats.base_index, 10);
        assert_eq!(stats.queue_len, 0);
        assert_eq!(stats.approximate_quota, Some(100));
        assert_eq!(stats.last_proposal_at_ticks, Some(1));
    }

    #[test]
    fn losing_leadership_clears_everything() {
        let quota = ReplicaQuota::new(1, config(100));
        lead(&quota, 10, &[1, 2, 3]);
        quota.on_applied(11, None);

        // Leader moved to replica 2.
        let mut raft = raft(2, 11, 11);
        raft.progress = vec![(1, PeerState::Replicate, 11)];
        quota.on_tick(1, &raft, &desc(&[1, 2, 3]));

        let stats = quota.debug_stats();
        assert!(!stats.leader);
        assert_eq!(stats.queue_len, 0);
        assert_eq!(stats.approximate_quota, None);
    }

    #[test]
    fn stuck_live_follower_holds_the_queue() {
        let quota = ReplicaQuota::new(1, config(100));
        lead(&quota, 5, &[1, 2]);
        for index in 6..=20 {
            quota.on_applied(index, None);
        }

        let mut raft = raft(1, 20, 20);
        raft.progress = vec![
            (1, PeerState::Replicate, 20),
            (2, PeerState::Replicate, 5),
        ];
        quota.on_tick(1, &raft, &desc(&[1, 2]));

        let stats = quota.debug_stats();
        assert_eq!(stats.base_index, 5);
        assert_eq!(stats.queue_len, 15);
    }

    #[test]
    fn paused_follower_does_not_hold_the_queue() {
        let quota = ReplicaQuota::new(1, config(100));
        lead(&quota, 5, &[1, 2]);
        for index in 6..=20 {
            quota.on_applied(index, None);
        }
        quota.pause_follower(2);

        let mut raft = raft(1, 20, 20);
        raft.progress = vec![
            (1, PeerState::Replicate, 20),
            (2, PeerState::Replicate, 5),
        ];
        quota.on_tick(1, &raft, &desc(&[1, 2]));

        let stats = quota.debug_stats();
        assert_eq!(stats.base_index, 20);
        assert_eq!(stats.queue_len, 0);

        quota.resume_follower(2);
        assert_eq!(quota.debug_stats().paused_followers_len, 0);
    }

    #[test]
    fn inactive_follower_does_not_hold_the_queue() {
        let clock = ManualClock::new();
        let quota = ReplicaQuota::with_clock(1, config(100), clock.clone());
        lead(&quota, 5, &[1, 2]);
        for index in 6..=8 {
            quota.on_applied(index, None);
        }

        // Replica 2 goes quiet past the lease window; replica 1 stays fresh.
        clock.advance(Duration::from_secs(10));
        quota.record_peer_activity(1);

        let mut raft = raft(1, 8, 8);
        raft.progress = vec![
            (1, PeerState::Replicate, 8),
            (2, PeerState::Probe, 5),
        ];
        quota.on_tick(1, &raft, &desc(&[1, 2]));

        assert_eq!(quota.debug_stats().base_index, 8);
    }

    #[test]
    fn follower_behind_base_does_not_pin_throughput() {
        let quota = ReplicaQuota::new(1, config(100));
        lead(&quota, 10, &[1, 2]);
        quota.on_applied(11, None);

        // Replica 2 is live again but still replaying entries below the
        // base; it must not pull the minimum below where we started.
        let mut raft = raft(1, 11, 11);
        raft.progress = vec![
            (1, PeerState::Replicate, 11),
            (2, PeerState::Snapshot, 3),
        ];
        quota.on_tick(1, &raft, &desc(&[1, 2]));

        assert_eq!(quota.debug_stats().base_index, 11);
        assert_eq!(quota.debug_stats().queue_len, 0);
    }

    #[test]
    fn peer_outside_membership_is_ignored() {
        let quota = ReplicaQuota::new(1, config(100));
        lead(&quota, 10, &[1, 2]);
        quota.on_applied(11, None);

        // Replica 9 was removed from the range but still shows progress.
        let mut raft = raft(1, 11, 11);
        raft.progress = vec![
            (1, PeerState::Replicate, 11),
            (2, PeerState::Replicate, 11),
            (9, PeerState::Replicate, 4),
        ];
        quota.on_tick(1, &raft, &desc(&[1, 2]));

        assert_eq!(quota.debug_stats().base_index, 11);
    }

    #[test]
    fn caught_up_new_replica_is_untracked() {
        let quota = ReplicaQuota::new(1, config(100));
        lead(&quota, 10, &[1, 2, 3]);
        quota.note_replica_added(3);
        assert_eq!(quota.last_replica_added(), Some(3));
        assert!(quota.last_replica_added_at().is_some());

        let mut raft = raft(1, 10, 10);
        raft.progress = vec![
            (1, PeerState::Replicate, 10),
            (2, PeerState::Replicate, 10),
            (3, PeerState::Replicate, 10),
        ];
        quota.on_tick(1, &raft, &desc(&[1, 2, 3]));
        assert_eq!(quota.last_replica_added(), None);
        assert_eq!(quota.last_replica_added_at(), None);
    }

    #[test]
    fn lagging_new_replica_stays_tracked() {
        let quota = ReplicaQuota::new(1, config(100));
        lead(&quota, 10, &[1, 2, 3]);
        quota.note_replica_added(3);
        quota.on_applied(11, None);

        let mut raft = raft(1, 11, 11);
        raft.progress = vec![
            (1, PeerState::Replicate, 11),
            (2, PeerState::Replicate, 11),
            (3, PeerState::Replicate, 10),
        ];
        quota.on_tick(1, &raft, &desc(&[1, 2, 3]));
        assert_eq!(quota.last_replica_added(), Some(3));
    }

    #[test]
    #[should_panic(expected = "does not extend the release queue")]
    fn misaligned_apply_is_fatal() {
        let quota = ReplicaQuota::new(1, config(100));
        lead(&quota, 10, &[1]);
        quota.on_applied(13, None);
    }

    #[test]
    #[should_panic(expected = "leader has uninitialized proposal quota pool")]
    fn steady_state_leader_without_pool_is_fatal() {
        let quota = ReplicaQuota::new(1, config(100));
        // No transition (prev leader == current leader) while we never
        // became leader through a transition tick.
        let raft = raft(1, 10, 10);
        quota.on_tick(1, &raft, &desc(&[1]));
    }

    #[test]
    fn applies_on_follower_are_ignored() {
        let quota = ReplicaQuota::new(1, config(100));
        quota.on_applied(42, None);
        assert_eq!(quota.debug_stats().queue_len, 0);
    }

    #[test]
    fn close_is_idempotent_and_safe_on_followers() {
        let quota = ReplicaQuota::new(1, config(100));
        quota.close();
        lead(&quota, 10, &[1]);
        quota.close();
        quota.close();
        assert!(!quota.debug_stats().leader);
    }
}
