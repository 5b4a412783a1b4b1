//! Shared types and seam traits for the quota controller.
//!
//! These are kept in a small, dependency-light module because they sit on the
//! boundary between the controller and the embedding replica: the consensus
//! module implements [`RaftProgress`], the request layer fills in
//! [`ProposalRequest`], and tests substitute [`Clock`].

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Logical replica identifier within a range. `0` means "no replica".
pub type ReplicaId = u64;
/// Position in the replicated log.
pub type LogIndex = u64;

/// Reserved key prefix of the range holding cluster-wide node heartbeats.
/// Writes to that range are never throttled: stalling liveness updates can
/// cascade into loss of leases cluster-wide.
pub const NODE_LIVENESS_PREFIX: &[u8] = b"\x04liveness-";

/// Replication state the leader tracks per peer.
///
/// The `match_index` reported alongside this state has different freshness
/// semantics per variant, and the reconciler deliberately uses it uniformly:
///
/// - `Replicate`: optimistically advanced when the leader sends, not when the
///   follower acknowledges. Protocol-level flow control bounds how far ahead
///   it can run.
/// - `Probe`: equals `next_index - 1`, a best-guess lower bound refreshed
///   each heartbeat.
/// - `Snapshot`: the last known index before the snapshot went out; catches
///   up to the true match when the snapshot applies.
///
/// A peer whose `match_index` would be stale for the wrong reason is already
/// excluded by the liveness filter, so no per-state correction is applied.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerState {
    Replicate,
    Probe,
    Snapshot,
}

/// Cheap snapshot of the local consensus state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConsensusStatus {
    /// Highest log index applied to the local state machine.
    pub applied: LogIndex,
    /// Highest log index known to be durably replicated on a quorum.
    pub commit: LogIndex,
    /// Replica currently believed to be leader, `0` if unknown.
    pub leader_id: ReplicaId,
}

/// Read-only view of consensus progress, borrowed for the duration of a tick.
///
/// Progress records passed to `with_progress` must not be retained past the
/// scan; the reconciler only folds them into a minimum index.
pub trait RaftProgress {
    fn status(&self) -> ConsensusStatus;

    /// Enumerate `(peer, state, match_index)` for every tracked peer,
    /// including the leader itself.
    fn with_progress(&self, f: &mut dyn FnMut(ReplicaId, PeerState, LogIndex));
}

/// Wall-clock source for the liveness predicate.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> Instant;
}

/// Production clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// The quota-relevant shape of a batched proposal.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProposalRequest {
    /// The batch is a single lease request (e.g. an expiration lease
    /// extension). Small, latency-sensitive, never throttled.
    pub is_single_lease_request: bool,
    /// The batch is a single lease transfer. Same exemption.
    pub is_single_lease_transfer: bool,
}

impl ProposalRequest {
    /// An ordinary write batch, subject to quota.
    pub fn write() -> Self {
        Self::default()
    }

    pub fn lease_request() -> Self {
        Self {
            is_single_lease_request: true,
            ..Self::default()
        }
    }

    pub fn lease_transfer() -> Self {
        Self {
            is_single_lease_transfer: true,
            ..Self::default()
        }
    }
}

/// Descriptor of the range this replica belongs to. Key ranges are
/// lexicographic and end-exclusive.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeDescriptor {
    pub range_id: u64,
    pub start_key: Vec<u8>,
    pub end_key: Vec<u8>,
    pub replicas: Vec<ReplicaId>,
}

impl RangeDescriptor {
    /// True for the range holding node heartbeats, identified by its
    /// reserved key prefix.
    pub fn is_liveness_range(&self) -> bool {
        self.start_key.starts_with(NODE_LIVENESS_PREFIX)
    }
}

/// Controller configuration. Plain data; the embedding node carries it
/// inside its own configuration structure.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QuotaConfig {
    /// When false, `maybe_acquire` returns no allocation for every call.
    /// Pool and queue bookkeeping is still maintained on ticks, so the flag
    /// can flip either way mid-run without breaking invariants.
    pub enabled: bool,
    /// Pool capacity in tokens (typically bytes of proposal payload).
    pub capacity: u64,
    /// Lease duration; a peer is live iff it was heard from within one lease.
    pub lease_duration: Duration,
    /// Emit a slow-acquisition warning after this wait. `None` disables it.
    pub slow_acquisition_threshold: Option<Duration>,
}
