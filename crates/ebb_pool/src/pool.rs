//! Counting-semaphore core: token accounting plus the FIFO waiter queue.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Errors returned by [`TokenPool::acquire`].
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum AcquireError {
    /// The caller's cancellation token fired while waiting.
    #[error("token acquisition cancelled")]
    Cancelled,
    /// The pool was closed before or while waiting.
    #[error("token pool closed: {reason}")]
    Closed { reason: String },
}

/// An acquired amount of tokens.
///
/// The handle is bound to the pool incarnation it was minted by. Releasing it
/// against a different pool discards it without crediting anything; dropping
/// it returns the tokens to its own pool if that pool is still open. Release
/// consumes the handle, so tokens are returned at most once.
#[derive(Debug)]
pub struct Alloc {
    acquired: u64,
    core: Weak<PoolCore>,
}

impl Alloc {
    /// Number of tokens held by this allocation.
    pub fn acquired(&self) -> u64 {
        self.acquired
    }
}

impl Drop for Alloc {
    fn drop(&mut self) {
        if self.acquired == 0 {
            return;
        }
        if let Some(core) = self.core.upgrade() {
            core.credit(self.acquired);
        }
    }
}

struct Waiter {
    id: u64,
    want: u64,
    grant: oneshot::Sender<Result<(), AcquireError>>,
}

struct PoolState {
    free: u64,
    closed: Option<String>,
    waiters: VecDeque<Waiter>,
    next_waiter_id: u64,
}

struct PoolCore {
    name: String,
    capacity: u64,
    slow_threshold: Option<Duration>,
    state: Mutex<PoolState>,
    // Racy mirror of `free` so tracing never has to take the lock.
    approx_free: AtomicU64,
}

impl PoolCore {
    /// Return `amount` tokens and hand out whatever the head of the queue can
    /// now take. No-op once the pool is closed.
    fn credit(&self, amount: u64) {
        if amount == 0 {
            return;
        }
        let mut state = self.state.lock().unwrap();
        if state.closed.is_some() {
            return;
        }
        state.free = state.free.saturating_add(amount).min(self.capacity);
        self.pump_locked(&mut state);
    }

    /// Grant queued waiters in arrival order while tokens last. The head
    /// waiter blocks everyone behind it even if a later request would fit.
    fn pump_locked(&self, state: &mut PoolState) {
        while let Some(front) = state.waiters.front() {
            if front.want > state.free {
                break;
            }
            let Some(waiter) = state.waiters.pop_front() else {
                break;
            };
            state.free -= waiter.want;
            if waiter.grant.send(Ok(())).is_err() {
                // The acquiring future was dropped while queued; take the
                // debited tokens straight back.
                state.free += waiter.want;
            }
        }
        self.approx_free.store(state.free, Ordering::Relaxed);
    }
}

/// Bounded counting semaphore with integer-valued tokens and a FIFO wait
/// queue. Cheaply cloneable; clones share the same pool.
#[derive(Clone)]
pub struct TokenPool {
    core: Arc<PoolCore>,
}

impl TokenPool {
    pub fn new(name: impl Into<String>, capacity: u64) -> Self {
        Self::with_slow_acquisition(name, capacity, None)
    }

    /// Like [`TokenPool::new`], but a waiter that blocks longer than
    /// `slow_threshold` logs a warning (and keeps blocking), once per
    /// threshold interval.
    pub fn with_slow_acquisition(
        name: impl Into<String>,
        capacity: u64,
        slow_threshold: Option<Duration>,
    ) -> Self {
        Self {
            core: Arc::new(PoolCore {
                name: name.into(),
                capacity,
                slow_threshold,
                state: Mutex::new(PoolState {
                    free: capacity,
                    closed: None,
                    waiters: VecDeque::new(),
                    next_waiter_id: 0,
                }),
                approx_free: AtomicU64::new(capacity),
            }),
        }
    }

    /// The configured capacity in tokens.
    pub fn capacity(&self) -> u64 {
        self.core.capacity
    }

    /// Racy read of the currently available tokens, for tracing.
    pub fn approximate_quota(&self) -> u64 {
        self.core.approx_free.load(Ordering::Relaxed)
    }

    /// Mint a zero-token allocation bound to this pool. Used as a placeholder
    /// for log entries that never went through `acquire`.
    pub fn empty_alloc(&self) -> Alloc {
        self.mint(0)
    }

    /// Reserve `want` tokens, blocking until the request is at the head of
    /// the wait queue and enough tokens are free. Requests larger than the
    /// capacity are clamped to it.
    ///
    /// Returns [`AcquireError::Cancelled`] if `cancel` fires first and
    /// [`AcquireError::Closed`] if the pool is closed before or while
    /// waiting. Neither outcome leaks tokens.
    pub async fn acquire(
        &self,
        cancel: &CancellationToken,
        want: u64,
    ) -> Result<Alloc, AcquireError> {
        let want = want.min(self.core.capacity);
        if cancel.is_cancelled() {
            return Err(AcquireError::Cancelled);
        }

        let (id, mut rx) = {
            let mut state = self.core.state.lock().unwrap();
            if let Some(reason) = state.closed.as_ref() {
                return Err(AcquireError::Closed {
                    reason: reason.clone(),
                });
            }
            // Fast path only when nobody is queued, otherwise this request
            // would jump the line.
            if state.waiters.is_empty() && state.free >= want {
                state.free -= want;
                self.core.approx_free.store(state.free, Ordering::Relaxed);
                return Ok(self.mint(want));
            }
            let (tx, rx) = oneshot::channel();
            let id = state.next_waiter_id;
            state.next_waiter_id = state.next_waiter_id.wrapping_add(1);
            state.waiters.push_back(Waiter {
                id,
                want,
                grant: tx,
            });
            (id, rx)
        };

        let started = Instant::now();
        loop {
            let slow_wait = async {
                match self.core.slow_threshold {
                    Some(threshold) => tokio::time::sleep(threshold).await,
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                verdict = &mut rx => {
                    return match verdict {
                        Ok(Ok(())) => Ok(self.mint(want)),
                        Ok(Err(err)) => Err(err),
                        // Sender gone without a verdict: every pool handle
                        // was dropped while we waited.
                        Err(_) => Err(AcquireError::Closed {
                            reason: "pool dropped".to_string(),
                        }),
                    };
                }
                _ = cancel.cancelled() => {
                    return self.abandon(id, &mut rx, want);
                }
                _ = slow_wait => {
                    tracing::warn!(
                        pool = %self.core.name,
                        want,
                        waited_ms = started.elapsed().as_millis() as u64,
                        "slow token acquisition"
                    );
                }
            }
        }
    }

    /// Return a batch of allocations to the pool in one sweep, so a long
    /// release run wakes waiters once instead of per entry. Allocations
    /// minted by a different pool incarnation are discarded without effect.
    pub fn release(&self, allocs: impl IntoIterator<Item = Alloc>) {
        let mut total = 0u64;
        for mut alloc in allocs {
            let same_pool = alloc
                .core
                .upgrade()
                .is_some_and(|core| Arc::ptr_eq(&core, &self.core));
            if same_pool {
                total = total.saturating_add(alloc.acquired);
            }
            // Disarm the drop hook either way: matched tokens are credited
            // below in one batch, foreign ones are discarded outright.
            alloc.acquired = 0;
        }
        self.core.credit(total);
    }

    /// Fail all present and future waiters with [`AcquireError::Closed`].
    /// Idempotent; the first reason wins. Outstanding [`Alloc`] handles stay
    /// valid for `release`, which becomes a no-op.
    pub fn close(&self, reason: &str) {
        let mut state = self.core.state.lock().unwrap();
        if state.closed.is_some() {
            return;
        }
        state.closed = Some(reason.to_string());
        for waiter in state.waiters.drain(..) {
            let _ = waiter.grant.send(Err(AcquireError::Closed {
                reason: reason.to_string(),
            }));
        }
    }

    fn mint(&self, amount: u64) -> Alloc {
        Alloc {
            acquired: amount,
            core: Arc::downgrade(&self.core),
        }
    }

    /// Drop out of the wait queue after cancellation. If a grant or close
    /// verdict raced the cancellation, settle it here so no tokens leak.
    fn abandon(
        &self,
        id: u64,
        rx: &mut oneshot::Receiver<Result<(), AcquireError>>,
        want: u64,
    ) -> Result<Alloc, AcquireError> {
        let mut state = self.core.state.lock().unwrap();
        if let Some(idx) = state.waiters.iter().position(|w| w.id == id) {
            drop(state.waiters.remove(idx));
            // Removing the head may unblock the waiter behind it.
            self.core.pump_locked(&mut state);
            return Err(AcquireError::Cancelled);
        }
        // No longer queued: a verdict was already sent under the lock.
        match rx.try_recv() {
            Ok(Ok(())) => {
                // Granted concurrently with the cancellation; hand the
                // debited tokens straight back.
                state.free = state.free.saturating_add(want).min(self.core.capacity);
                self.core.pump_locked(&mut state);
                Err(AcquireError::Cancelled)
            }
            Ok(Err(err)) => Err(err),
            Err(_) => Err(AcquireError::Cancelled),
        }
    }
}

impl std::fmt::Debug for TokenPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenPool")
            .field("name", &self.core.name)
            .field("capacity", &self.core.capacity)
            .field("approx_free", &self.approximate_quota())
            .finish()
    }
}
