// ============================
// crates/backend-lib/src/readiness.rs
// ============================
//! Session readiness gate.
//!
//! A session is visible in memory the moment the DJ registers, but its durable
//! row is written asynchronously. Writes that reference the session (played
//! tracks, polls) call [`ReadinessGate::ensure_ready`] first and wait, with a
//! bounded timeout, until the insert task calls [`ReadinessGate::signal_ready`].
//!
//! Each waiter is a oneshot channel, so it resolves exactly once: either the
//! signal sends on it, or the timeout (or the caller dropping the future)
//! removes it from the waiter list. Whichever happens second finds nothing
//! to do.
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

struct Waiter {
    id: u64,
    tx: oneshot::Sender<bool>,
}

#[derive(Default)]
struct GateState {
    /// Sessions with a confirmed durable row
    persisted: HashSet<String>,
    /// Sessions whose durable insert failed
    failed: HashSet<String>,
    waiters: HashMap<String, Vec<Waiter>>,
}

#[derive(Default)]
pub struct ReadinessGate {
    state: Mutex<GateState>,
    next_waiter: AtomicU64,
}

/// Removes its waiter on drop unless the signal already took it
struct WaiterGuard<'a> {
    gate: &'a ReadinessGate,
    session_id: &'a str,
    id: u64,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.gate.remove_waiter(self.session_id, self.id);
    }
}

impl ReadinessGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until `session_id` has a durable row.
    ///
    /// Returns `true` immediately for a persisted session and `false`
    /// immediately for one whose insert already failed. Otherwise suspends
    /// until the insert task signals (resolving to its outcome) or `timeout`
    /// elapses (resolving to `false`). Expiry is a soft failure: callers skip
    /// the dependent write.
    pub async fn ensure_ready(&self, session_id: &str, timeout: Duration) -> bool {
        let (id, rx) = {
            let mut state = self.state.lock();
            if state.persisted.contains(session_id) {
                return true;
            }
            if state.failed.contains(session_id) {
                return false;
            }

            let id = self.next_waiter.fetch_add(1, Ordering::Relaxed);
            let (tx, rx) = oneshot::channel();
            state
                .waiters
                .entry(session_id.to_string())
                .or_default()
                .push(Waiter { id, tx });
            (id, rx)
        };

        let _guard = WaiterGuard {
            gate: self,
            session_id,
            id,
        };

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(ready)) => ready,
            Ok(Err(_)) => {
                // Sender dropped without a signal
                false
            },
            Err(_) => {
                warn!(
                    session_id,
                    timeout_ms = timeout.as_millis() as u64,
                    "Timed out waiting for session to be persisted"
                );
                false
            },
        }
    }

    /// Resolve every pending waiter of `session_id` with `success`.
    ///
    /// Called exactly once per durable insert attempt, on success and on
    /// failure alike, so waiters never sit out the full timeout after a
    /// failed insert. The outcome is remembered, so later callers get the
    /// same answer without waiting.
    pub fn signal_ready(&self, session_id: &str, success: bool) {
        let waiters = {
            let mut state = self.state.lock();
            if success {
                state.failed.remove(session_id);
                state.persisted.insert(session_id.to_string());
            } else {
                state.persisted.remove(session_id);
                state.failed.insert(session_id.to_string());
            }
            state.waiters.remove(session_id).unwrap_or_default()
        };

        debug!(
            session_id,
            success,
            waiters = waiters.len(),
            "Signalling session readiness"
        );
        for waiter in waiters {
            // The receiver may have timed out in the meantime
            let _ = waiter.tx.send(success);
        }
    }

    /// Mark a session persisted without a durable insert (bypass mode)
    pub fn mark_persisted(&self, session_id: &str) {
        self.signal_ready(session_id, true);
    }

    pub fn is_persisted(&self, session_id: &str) -> bool {
        self.state.lock().persisted.contains(session_id)
    }

    /// Drop the recorded outcome when a session ends.
    ///
    /// Outstanding waiters are left alone and expire on their own.
    pub fn forget(&self, session_id: &str) {
        let mut state = self.state.lock();
        state.persisted.remove(session_id);
        state.failed.remove(session_id);
    }

    /// Whether an insert outcome is recorded for `session_id`
    pub fn has_outcome(&self, session_id: &str) -> bool {
        let state = self.state.lock();
        state.persisted.contains(session_id) || state.failed.contains(session_id)
    }

    pub fn pending_waiters(&self, session_id: &str) -> usize {
        self.state
            .lock()
            .waiters
            .get(session_id)
            .map_or(0, Vec::len)
    }

    /// Sessions with at least one pending waiter
    pub fn waiting_sessions(&self) -> usize {
        self.state.lock().waiters.len()
    }

    pub fn persisted_count(&self) -> usize {
        self.state.lock().persisted.len()
    }

    fn remove_waiter(&self, session_id: &str, id: u64) {
        let mut state = self.state.lock();
        if let Some(list) = state.waiters.get_mut(session_id) {
            list.retain(|w| w.id != id);
            if list.is_empty() {
                state.waiters.remove(session_id);
            }
        }
    }
}
