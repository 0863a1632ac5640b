//! # phantom-lock
//!
//! The working-tree lock arbitrated by the mount process. External `git`
//! invocations acquire it over IPC before touching the index or working
//! tree; the mount's own engine takes cooperative internal holds (for
//! example around a projection rebuild). At most one writer, external
//! or internal, is observable at any instant.
//!
//! Releasing an external hold queues deferred actions the callback
//! surface drains, e.g. re-reading the index after a `git checkout`.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

/// Identity of one external lock holder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    pub pid: u32,
    /// Short command name, e.g. `git checkout`.
    pub name: String,
    /// Full parsed command line.
    pub args: String,
    /// Probe without acquiring.
    pub check_only: bool,
}

impl LockToken {
    /// Rendering used in `Deny(Git, holder)` responses and status output.
    pub fn describe(&self) -> String {
        format!("{} (pid {})", self.name, self.pid)
    }
}

/// Outcome of an external acquire attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// Lock granted (or, for check-only probes, available).
    Granted,
    /// The mount holds an implicit internal write.
    DeniedInternal,
    /// Another external command holds it.
    DeniedExternal { holder: String },
}

/// Actions queued at release time for the callback surface to drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferredAction {
    /// The index may have changed under us; rebuild the projection.
    InvalidateProjection,
    /// Re-stat placeholder metadata the external command may have touched.
    RevisitPlaceholders,
}

#[derive(Debug, Default)]
struct LockState {
    external: Option<LockToken>,
    internal_holds: usize,
}

/// The lock itself. Clone-cheap; all clones share state.
#[derive(Clone, Default)]
pub struct WorkingTreeLock {
    state: Arc<Mutex<LockState>>,
    deferred: Arc<Mutex<Vec<DeferredAction>>>,
}

impl WorkingTreeLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempts an external acquire. Check-only tokens never take the
    /// lock, they only report what a real acquire would have returned.
    pub fn try_acquire_external(&self, token: LockToken) -> AcquireOutcome {
        let mut state = self.state.lock();
        if state.internal_holds > 0 {
            debug!(pid = token.pid, "lock denied, internal hold active");
            return AcquireOutcome::DeniedInternal;
        }
        if let Some(holder) = &state.external {
            if holder.pid != token.pid {
                debug!(pid = token.pid, holder = %holder.describe(), "lock denied");
                return AcquireOutcome::DeniedExternal {
                    holder: holder.describe(),
                };
            }
            // Same pid re-asserting its own hold.
            return AcquireOutcome::Granted;
        }
        if !token.check_only {
            info!(pid = token.pid, command = %token.name, "external lock granted");
            state.external = Some(token);
        }
        AcquireOutcome::Granted
    }

    /// Releases an external hold. Only the holding pid may release; a
    /// successful release queues the post-command deferred actions.
    pub fn release_external(&self, pid: u32) -> bool {
        let mut state = self.state.lock();
        match &state.external {
            Some(holder) if holder.pid == pid => {
                info!(pid, command = %holder.name, "external lock released");
                state.external = None;
                drop(state);
                let mut deferred = self.deferred.lock();
                deferred.push(DeferredAction::InvalidateProjection);
                deferred.push(DeferredAction::RevisitPlaceholders);
                true
            }
            _ => false,
        }
    }

    /// Takes a cooperative internal hold, unless an external command
    /// currently owns the tree. Internal holds nest.
    pub fn try_hold_internal(&self) -> Option<InternalHold> {
        let mut state = self.state.lock();
        if state.external.is_some() {
            return None;
        }
        state.internal_holds += 1;
        Some(InternalHold {
            lock: self.clone(),
        })
    }

    /// Who currently holds the lock, for `GetStatus`.
    pub fn status(&self) -> String {
        let state = self.state.lock();
        if state.internal_holds > 0 {
            return "Held by GVFS".to_string();
        }
        match &state.external {
            Some(holder) => format!("Held by {}", holder.describe()),
            None => "Free".to_string(),
        }
    }

    /// True when neither an external nor an internal holder exists.
    pub fn is_free(&self) -> bool {
        let state = self.state.lock();
        state.external.is_none() && state.internal_holds == 0
    }

    /// Drains (and empties) the deferred action queue.
    pub fn drain_deferred(&self) -> Vec<DeferredAction> {
        let mut deferred = self.deferred.lock();
        let mut drained: Vec<DeferredAction> = std::mem::take(&mut *deferred);
        drained.dedup();
        drained
    }
}

/// RAII guard for an internal hold.
pub struct InternalHold {
    lock: WorkingTreeLock,
}

impl Drop for InternalHold {
    fn drop(&mut self) {
        let mut state = self.lock.state.lock();
        state.internal_holds = state.internal_holds.saturating_sub(1);
    }
}
