//! Timeout guard and per-operation timer.
//!
//! [`GuardedExecutor`] bounds one transport call at a time and aborts it
//! when the deadline passes. [`OpTimer`] is the watchdog armed around a
//! single send/receive/inbox operation; each arm carries a generation so
//! a late expiry can never act on a newer operation.

use std::future::Future;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::task::AbortHandle;
use tracing::debug;

use crate::error::{LinkError, TaskError};
use crate::state::Timeout;
use crate::transport::lock;

// ── GuardedExecutor ──────────────────────────────────────────────

/// Runs transport calls under an optional deadline.
///
/// Only one guarded call is in flight: starting a new one aborts the
/// previous one first.
#[derive(Debug, Default)]
pub struct GuardedExecutor {
    inflight: Mutex<Option<(u64, AbortHandle)>>,
    next_id: AtomicU64,
}

impl GuardedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `operation`, bounded by `timeout` when `enabled`.
    ///
    /// Without a bounded timeout (or when disabled) the operation is
    /// awaited inline. Otherwise it is spawned and aborted on expiry,
    /// which fails the call with [`TaskError::Timeout`].
    pub async fn run_with_timeout<F, T>(
        &self,
        enabled: bool,
        timeout: Timeout,
        operation: F,
    ) -> Result<T, LinkError>
    where
        F: Future<Output = Result<T, LinkError>> + Send + 'static,
        T: Send + 'static,
    {
        let limit = match timeout.bounded() {
            Some(limit) if enabled => limit,
            _ => return operation.await,
        };

        let mut handle = tokio::spawn(operation);
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        if let Some((prev, abort)) = lock(&self.inflight).replace((id, handle.abort_handle())) {
            debug!(task = prev, "superseding guarded task");
            abort.abort();
        }

        let outcome = tokio::time::timeout(limit, &mut handle).await;
        self.release(id);

        match outcome {
            Ok(joined) => joined?,
            Err(_) => {
                handle.abort();
                debug!(task = id, ?limit, "guarded task timed out");
                Err(TaskError::Timeout(limit).into())
            }
        }
    }

    /// Abort the in-flight guarded task, if any.
    pub fn abort(&self) {
        if let Some((_, abort)) = lock(&self.inflight).take() {
            abort.abort();
        }
    }

    /// Whether a guarded task is currently running.
    pub fn is_busy(&self) -> bool {
        lock(&self.inflight).is_some()
    }

    fn release(&self, id: u64) {
        let mut slot = lock(&self.inflight);
        if slot.as_ref().is_some_and(|(current, _)| *current == id) {
            *slot = None;
        }
    }
}

// ── OpTimer ──────────────────────────────────────────────────────

/// One-shot, generation-numbered expiry timer.
///
/// `arm` returns a generation. Exactly one of `disarm(generation)` and
/// the expiry callback wins for that generation; the loser sees `false`
/// or is never called.
#[derive(Debug, Default)]
pub struct OpTimer {
    generation: Arc<AtomicU64>,
    pending: Mutex<Option<AbortHandle>>,
}

impl OpTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start the timer. `on_expire` runs after `after` unless disarmed
    /// or re-armed first.
    pub fn arm<F>(&self, after: Duration, on_expire: F) -> u64
    where
        F: FnOnce() + Send + 'static,
    {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let current = Arc::clone(&self.generation);
        let task = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if claim(&current, generation) {
                on_expire();
            }
        });
        if let Some(prev) = lock(&self.pending).replace(task.abort_handle()) {
            prev.abort();
        }
        generation
    }

    /// Stop the timer armed as `generation`.
    ///
    /// Returns `false` when that generation already expired (or was
    /// superseded), meaning the expiry path owns the outcome.
    pub fn disarm(&self, generation: u64) -> bool {
        if !claim(&self.generation, generation) {
            return false;
        }
        if let Some(task) = lock(&self.pending).take() {
            task.abort();
        }
        true
    }

    /// Invalidate whatever is armed.
    pub fn stop(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(task) = lock(&self.pending).take() {
            task.abort();
        }
    }
}

fn claim(current: &AtomicU64, generation: u64) -> bool {
    current
        .compare_exchange(generation, generation + 1, Ordering::SeqCst, Ordering::SeqCst)
        .is_ok()
}
