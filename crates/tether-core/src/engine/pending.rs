//! Pending-call registry: in-flight `seq` to completion and timeout timer.
//!
//! The registry is the only place that decides whether a call is still
//! outstanding. Every terminal event (reply, timeout, cancel, close) goes
//! through one `take`, which removes the entry under the
//! lock. Whoever removes the entry invokes the completion; everyone else sees
//! "not found" and does nothing. This is what makes the completion fire at
//! most once no matter how a reply and a timer race.
//!
//! Completions always run after the lock is released, so they may issue new
//! calls on the same engine.

use super::sequence::Seq;
use crate::error::{Result, RpcError};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tracing::debug;

/// Callback receiving the outcome of an outbound call. Invoked at most once.
pub type Completion = Box<dyn FnOnce(Result<Value>) + Send + 'static>;

struct PendingCall {
    completion: Completion,
    timer: AbortHandle,
    /// Distinguishes this entry's timer from a stale timer of an earlier
    /// entry that used the same `seq`.
    generation: u64,
    timeout: Duration,
    registered_at: Instant,
}

impl PendingCall {
    fn finish(self, outcome: Result<Value>) {
        self.timer.abort();
        (self.completion)(outcome);
    }
}

struct Table {
    calls: HashMap<Seq, PendingCall>,
    closed: bool,
}

struct PendingInner {
    table: Mutex<Table>,
    runtime: Handle,
    max_pending: usize,
    next_generation: AtomicU64,
    completed: AtomicU64,
    expired: AtomicU64,
    cancelled: AtomicU64,
}

/// Registration refused; the completion has not been invoked yet.
pub struct Rejected {
    pub error: RpcError,
    completion: Completion,
}

impl Rejected {
    /// Deliver the rejection to the caller's completion.
    pub fn fail(self) {
        (self.completion)(Err(self.error));
    }
}

impl std::fmt::Debug for Rejected {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rejected")
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

/// Lifetime counters for terminal events handled by the registry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingStats {
    pub pending: usize,
    pub completed: u64,
    pub expired: u64,
    pub cancelled: u64,
}

/// Table of outstanding calls with timeout-based expiry.
#[derive(Clone)]
pub struct PendingCallRegistry {
    inner: Arc<PendingInner>,
}

impl PendingCallRegistry {
    /// Create a registry whose timers run on `runtime`.
    pub fn new(runtime: Handle, max_pending: usize) -> Self {
        Self {
            inner: Arc::new(PendingInner {
                table: Mutex::new(Table {
                    calls: HashMap::new(),
                    closed: false,
                }),
                runtime,
                max_pending,
                next_generation: AtomicU64::new(0),
                completed: AtomicU64::new(0),
                expired: AtomicU64::new(0),
                cancelled: AtomicU64::new(0),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Table> {
        self.inner.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store `completion` under `seq` and arm a timer of `timeout`.
    ///
    /// Fails with `DuplicateSequence` if `seq` is already outstanding,
    /// `TooManyPending` at capacity, and `Closed` after [`close`](Self::close).
    /// The existing entry is never overwritten.
    pub fn register(
        &self,
        seq: Seq,
        completion: Completion,
        timeout: Duration,
    ) -> std::result::Result<(), Rejected> {
        let mut table = self.lock();

        let refusal = if table.closed {
            Some(RpcError::Closed)
        } else if table.calls.contains_key(&seq) {
            Some(RpcError::DuplicateSequence(seq))
        } else if table.calls.len() >= self.inner.max_pending {
            Some(RpcError::TooManyPending {
                limit: self.inner.max_pending,
            })
        } else {
            None
        };
        if let Some(error) = refusal {
            return Err(Rejected { error, completion });
        }

        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let weak = Arc::downgrade(&self.inner);
        let timer = self
            .inner
            .runtime
            .spawn(async move {
                tokio::time::sleep(timeout).await;
                expire_generation(weak, seq, generation);
            })
            .abort_handle();

        table.calls.insert(
            seq,
            PendingCall {
                completion,
                timer,
                generation,
                timeout,
                registered_at: Instant::now(),
            },
        );
        Ok(())
    }

    /// Remove the entry for `seq`, if any. The caller owns the terminal event.
    fn take(&self, seq: Seq) -> Option<PendingCall> {
        self.lock().calls.remove(&seq)
    }

    /// Deliver `outcome` to the call `seq`.
    ///
    /// Cancels the timer, removes the entry and runs the completion. Returns
    /// `false` (and does nothing) when no entry exists, e.g. because the
    /// call already timed out.
    pub fn complete(&self, seq: Seq, outcome: Result<Value>) -> bool {
        match self.take(seq) {
            Some(call) => {
                debug!(
                    "Call {} completed after {:?}",
                    seq,
                    call.registered_at.elapsed()
                );
                self.inner.completed.fetch_add(1, Ordering::Relaxed);
                call.finish(outcome);
                true
            }
            None => false,
        }
    }

    /// Time the call out if it is still outstanding.
    pub fn expire(&self, seq: Seq) -> bool {
        match self.take(seq) {
            Some(call) => self.finish_expired(seq, call),
            None => false,
        }
    }

    fn finish_expired(&self, seq: Seq, call: PendingCall) -> bool {
        debug!("Call {} timed out after {:?}", seq, call.timeout);
        self.inner.expired.fetch_add(1, Ordering::Relaxed);
        let after = call.timeout;
        call.finish(Err(RpcError::Timeout { seq, after }));
        true
    }

    /// Cancel the call; its completion receives `Cancelled`.
    pub fn cancel(&self, seq: Seq) -> bool {
        match self.take(seq) {
            Some(call) => {
                debug!("Call {} cancelled", seq);
                self.inner.cancelled.fetch_add(1, Ordering::Relaxed);
                call.finish(Err(RpcError::Cancelled { seq }));
                true
            }
            None => false,
        }
    }

    /// Refuse new registrations and fail every outstanding call with `Closed`.
    ///
    /// Returns the number of calls that were failed.
    pub fn close(&self) -> usize {
        let drained: Vec<(Seq, PendingCall)> = {
            let mut table = self.lock();
            table.closed = true;
            table.calls.drain().collect()
        };

        let count = drained.len();
        for (seq, call) in drained {
            debug!("Call {} failed: engine closed", seq);
            call.finish(Err(RpcError::Closed));
        }
        count
    }

    pub fn contains(&self, seq: Seq) -> bool {
        self.lock().calls.contains_key(&seq)
    }

    pub fn len(&self) -> usize {
        self.lock().calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn stats(&self) -> PendingStats {
        PendingStats {
            pending: self.len(),
            completed: self.inner.completed.load(Ordering::Relaxed),
            expired: self.inner.expired.load(Ordering::Relaxed),
            cancelled: self.inner.cancelled.load(Ordering::Relaxed),
        }
    }
}

/// Timer body: expire `seq` only if it still belongs to the arming entry.
fn expire_generation(weak: Weak<PendingInner>, seq: Seq, generation: u64) {
    let Some(inner) = weak.upgrade() else {
        return;
    };
    let registry = PendingCallRegistry { inner };

    let call = {
        let mut table = registry.lock();
        match table.calls.get(&seq) {
            Some(call) if call.generation == generation => table.calls.remove(&seq),
            _ => None,
        }
    };

    if let Some(call) = call {
        registry.finish_expired(seq, call);
    }
}

impl std::fmt::Debug for PendingCallRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCallRegistry")
            .field("stats", &self.stats())
            .field("max_pending", &self.inner.max_pending)
            .finish()
    }
}
