//! Shared fixtures for quota controller scenario tests.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use ebb_quota::{Clock, ConsensusStatus, PeerState, RangeDescriptor, ReplicaId, ReplicaQuota};

pub const LEASE: Duration = Duration::from_secs(9);

/// Scripted progress view: a status plus one `(peer, state, match)` row per
/// tracked replica.
pub struct TestRaft {
    pub status: ConsensusStatus,
    pub progress: Vec<(ReplicaId, PeerState, u64)>,
}

impl TestRaft {
    pub fn new(leader: ReplicaId, applied: u64, commit: u64) -> Self {
        Self {
            status: ConsensusStatus {
                applied,
                commit,
                leader_id: leader,
            },
            progress: Vec::new(),
        }
    }

    pub fn all_matched(leader: ReplicaId, applied: u64, members: &[ReplicaId]) -> Self {
        let mut raft = Self::new(leader, applied, applied);
        raft.progress = members
            .iter()
            .map(|id| (*id, PeerState::Replicate, applied))
            .collect();
        raft
    }
}

impl ebb_quota::RaftProgress for TestRaft {
    fn status(&self) -> ConsensusStatus {
        self.status
    }

    fn with_progress(&self, f: &mut dyn FnMut(ReplicaId, PeerState, u64)) {
        for (peer, state, match_index) in &self.progress {
            f(*peer, *state, *match_index);
        }
    }
}

/// Test clock driven by hand.
pub struct ManualClock {
    now: Mutex<Instant>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Mutex::new(Instant::now()),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock().unwrap() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock().unwrap()
    }
}

pub fn user_range(members: &[ReplicaId]) -> RangeDescriptor {
    RangeDescriptor {
        range_id: 1,
        start_key: b"user-table".to_vec(),
        end_key: Vec::new(),
        replicas: members.to_vec(),
    }
}

/// Tick replica 1 into leadership at `applied`.
pub fn lead(quota: &ReplicaQuota, applied: u64, members: &[ReplicaId]) {
    let raft = TestRaft::all_matched(1, applied, members);
    quota.on_tick(0, &raft, &user_range(members));
}
