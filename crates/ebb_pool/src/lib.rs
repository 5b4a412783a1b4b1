//! Bounded token pool with FIFO-fair, cancellable acquisition.
//!
//! A [`TokenPool`] hands out integer-valued token allocations up to a fixed
//! capacity. Callers that cannot be satisfied immediately queue in strict
//! arrival order; a later small request never skips ahead of an earlier large
//! one. Acquisition is cancellable and the pool can be closed, which fails
//! all present and future waiters.
//!
//! The pool is intentionally free of any I/O or policy: it is the shared
//! backpressure primitive that the replica-side quota controller builds on.

mod pool;

pub use pool::{AcquireError, Alloc, TokenPool};
