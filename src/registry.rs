//! In-memory directory of live sandboxes and terminal sessions.
//!
//! This is the only shared mutable structure in the crate. All mutations go
//! through one lock, so the capacity invariant (reserved + live ≤ cap) holds
//! under arbitrary concurrent request rates. Every critical section is a
//! short map or counter mutation; nothing awaits while holding the lock.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Instant, SystemTime};

use tokio::sync::mpsc;
use tracing::debug;

use crate::backend::EnvironmentHandle;
use crate::error::SandboxError;
use crate::session::SessionControl;
use crate::types::{ActiveSandbox, SandboxKind};

#[derive(Debug)]
struct SandboxEntry {
    kind: SandboxKind,
    env: EnvironmentHandle,
    started_at: SystemTime,
    /// Ids of terminal sessions attached to this sandbox. Always empty for
    /// run sandboxes.
    sessions: HashSet<String>,
}

/// Registry-side record of a live terminal session.
pub struct SessionRecord {
    pub sandbox_id: String,
    pub control: mpsc::Sender<SessionControl>,
    pub last_activity: Instant,
    pub cols: u16,
    pub rows: u16,
}

#[derive(Default)]
struct Inner {
    reserved: usize,
    sandboxes: HashMap<String, SandboxEntry>,
    sessions: HashMap<String, SessionRecord>,
}

/// Directory of live sandboxes/sessions plus the capacity accountant.
pub struct SandboxRegistry {
    cap: usize,
    inner: Arc<Mutex<Inner>>,
}

/// Proof of a successful capacity reservation.
///
/// Either consumed by [`ReservationToken::register`] when provisioning
/// succeeds, or dropped — in which case the slot is released automatically,
/// so no error path can leak capacity.
pub struct ReservationToken {
    inner: Arc<Mutex<Inner>>,
    consumed: bool,
}

impl SandboxRegistry {
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Atomically claim a capacity slot. Fails with `CapacityExceeded` when
    /// reserved-plus-live sandboxes already meet the cap.
    pub fn try_reserve(&self) -> Result<ReservationToken, SandboxError> {
        let mut inner = self.lock();
        if inner.reserved + inner.sandboxes.len() >= self.cap {
            return Err(SandboxError::CapacityExceeded { limit: self.cap });
        }
        inner.reserved += 1;
        Ok(ReservationToken {
            inner: Arc::clone(&self.inner),
            consumed: false,
        })
    }

    /// Remove a sandbox. Idempotent: cleanup may race timeout-driven
    /// cleanup, and the loser's call is a no-op.
    pub fn unregister(&self, sandbox_id: &str) {
        let mut inner = self.lock();
        if inner.sandboxes.remove(sandbox_id).is_some() {
            debug!(sandbox = %sandbox_id, "Sandbox unregistered");
        }
    }

    /// Snapshot of one live sandbox.
    pub fn get(&self, sandbox_id: &str) -> Option<ActiveSandbox> {
        self.lock().sandboxes.get(sandbox_id).map(|e| ActiveSandbox {
            id: sandbox_id.to_string(),
            kind: e.kind,
            started_at: e.started_at,
        })
    }

    pub fn kind_of(&self, sandbox_id: &str) -> Option<SandboxKind> {
        self.lock().sandboxes.get(sandbox_id).map(|e| e.kind)
    }

    /// Backend handle for a live sandbox.
    pub fn env_of(&self, sandbox_id: &str) -> Option<EnvironmentHandle> {
        self.lock().sandboxes.get(sandbox_id).map(|e| e.env.clone())
    }

    /// Snapshot of live sandboxes for listing endpoints.
    pub fn list_active(&self) -> Vec<ActiveSandbox> {
        self.lock()
            .sandboxes
            .iter()
            .map(|(id, entry)| ActiveSandbox {
                id: id.clone(),
                kind: entry.kind,
                started_at: entry.started_at,
            })
            .collect()
    }

    /// Count of live sandboxes plus outstanding reservations.
    pub fn live_count(&self) -> usize {
        let inner = self.lock();
        inner.reserved + inner.sandboxes.len()
    }

    /// Number of sessions attached to a sandbox.
    pub fn session_count_for(&self, sandbox_id: &str) -> usize {
        self.lock()
            .sandboxes
            .get(sandbox_id)
            .map_or(0, |e| e.sessions.len())
    }

    /// Record a terminal session against an existing session sandbox.
    pub fn attach_session(
        &self,
        session_id: &str,
        record: SessionRecord,
    ) -> Result<(), SandboxError> {
        let mut inner = self.lock();
        let entry = inner
            .sandboxes
            .get_mut(&record.sandbox_id)
            .ok_or_else(|| SandboxError::SessionNotFound(session_id.to_string()))?;
        entry.sessions.insert(session_id.to_string());
        inner.sessions.insert(session_id.to_string(), record);
        Ok(())
    }

    /// Remove a session. Returns the sandbox id and whether this was the last
    /// session holding the sandbox open. `None` if already detached.
    pub fn detach_session(&self, session_id: &str) -> Option<(String, bool)> {
        let mut inner = self.lock();
        let record = inner.sessions.remove(session_id)?;
        let last = match inner.sandboxes.get_mut(&record.sandbox_id) {
            Some(entry) => {
                entry.sessions.remove(session_id);
                entry.sessions.is_empty()
            }
            None => false,
        };
        Some((record.sandbox_id, last))
    }

    /// Control channel for a live session, if any.
    pub fn session_control(&self, session_id: &str) -> Option<mpsc::Sender<SessionControl>> {
        self.lock()
            .sessions
            .get(session_id)
            .map(|r| r.control.clone())
    }

    /// All session control channels, for the shutdown sweep.
    pub fn all_session_controls(&self) -> Vec<mpsc::Sender<SessionControl>> {
        self.lock()
            .sessions
            .values()
            .map(|r| r.control.clone())
            .collect()
    }

    /// Every live sandbox with its backend handle, for the shutdown sweep.
    pub fn all_sandboxes(&self) -> Vec<(String, EnvironmentHandle)> {
        self.lock()
            .sandboxes
            .iter()
            .map(|(id, entry)| (id.clone(), entry.env.clone()))
            .collect()
    }

    /// Stamp a session's last-activity time.
    pub fn touch_session(&self, session_id: &str) {
        if let Some(record) = self.lock().sessions.get_mut(session_id) {
            record.last_activity = Instant::now();
        }
    }

    /// Record session geometry. Metadata only; forwarding to the backend is
    /// the bridge's concern.
    pub fn set_session_geometry(&self, session_id: &str, cols: u16, rows: u16) {
        if let Some(record) = self.lock().sessions.get_mut(session_id) {
            record.cols = cols;
            record.rows = rows;
        }
    }

    pub fn session_count(&self) -> usize {
        self.lock().sessions.len()
    }
}

impl ReservationToken {
    /// Convert the reservation into a registered sandbox.
    pub fn register(mut self, sandbox_id: &str, kind: SandboxKind, env: EnvironmentHandle) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.reserved -= 1;
        inner.sandboxes.insert(
            sandbox_id.to_string(),
            SandboxEntry {
                kind,
                env,
                started_at: SystemTime::now(),
                sessions: HashSet::new(),
            },
        );
        self.consumed = true;
        debug!(sandbox = %sandbox_id, ?kind, "Sandbox registered");
    }
}

impl Drop for ReservationToken {
    fn drop(&mut self) {
        if !self.consumed {
            let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            inner.reserved -= 1;
        }
    }
}
