//! Leader-side proposal quota control for a replicated consensus range.
//!
//! A range leader may only inject a bounded volume of in-flight, not yet
//! durably replicated commands into the log. This crate ties a token pool to
//! the replica lifecycle: proposals acquire tokens before submission, every
//! applied entry queues its allocation, and a per-tick reconciler converts
//! follower progress into credit returned to the pool.
//!
//! The consensus protocol itself, storage, and leases are external
//! collaborators; they appear here only as the seam traits in [`types`].

pub mod controller;
pub mod liveness;
pub mod queue;
pub mod types;

pub use controller::{QuotaDebugStats, ReplicaQuota};
pub use ebb_pool::{AcquireError, Alloc, TokenPool};
pub use types::{
    Clock, ConsensusStatus, LogIndex, PeerState, ProposalRequest, QuotaConfig, RaftProgress,
    RangeDescriptor, ReplicaId, SystemClock, NODE_LIVENESS_PREFIX,
};
