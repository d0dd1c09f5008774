//! Session Store — sole owner of session state.
//!
//! Sessions live in a pluggable [`SessionBackend`] (in-memory or SQLite). The
//! store adds what the backends do not: a per-session turn lock so at most one
//! turn runs per session, FIFO queueing of follow-up turns, and TTL/capacity
//! eviction that never touches a session with a turn in flight.
//!
//! Turn protocol:
//! 1. [`SessionStore::begin_turn`] (or [`SessionStore::open_turn`], which
//!    also creates a missing session under the lock) waits for the session's
//!    lock and hands back a [`TurnGuard`] plus a snapshot of the session.
//! 2. The caller works on the snapshot.
//! 3. [`SessionStore::commit`] writes the snapshot back. Dropping the guard
//!    without committing leaves the stored session untouched.
//!
//! Turn locks are process-local. A backend must not be shared by two
//! processes; the SQLite backend enforces this with an exclusive file lock.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::OwnedMutexGuard;

use super::errors::DeskError;
use super::types::{Message, Session, SessionId, TransparencyReport};
use crate::inference::config::SessionConfig;

// ─── Backend ────────────────────────────────────────────────────────────────

/// Storage contract shared by the single-process and persistent backends.
///
/// One process owns a backend at a time; turn serialization happens in the
/// owning [`SessionStore`].
pub trait SessionBackend: Send + Sync {
    fn load(&self, id: SessionId) -> Result<Option<Session>, DeskError>;

    /// Insert the session only if no session with its id exists, as one
    /// atomic step. Returns whether it was inserted.
    fn create_if_absent(&self, session: &Session) -> Result<bool, DeskError>;

    /// Insert or replace the session. Messages are append-only.
    fn save(&self, session: &Session) -> Result<(), DeskError>;

    /// Remove a session and its reports. Returns whether it existed.
    fn remove(&self, id: SessionId) -> Result<bool, DeskError>;

    /// Every stored session with its last activity time.
    fn activity(&self) -> Result<Vec<(SessionId, DateTime<Utc>)>, DeskError>;

    fn save_report(&self, report: &TransparencyReport) -> Result<(), DeskError>;

    /// Reports for a session, oldest turn first.
    fn reports(&self, id: SessionId) -> Result<Vec<TransparencyReport>, DeskError>;
}

/// Process-local backend.
#[derive(Default)]
pub struct InMemoryBackend {
    sessions: Mutex<HashMap<SessionId, Session>>,
    reports: Mutex<HashMap<SessionId, Vec<TransparencyReport>>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionBackend for InMemoryBackend {
    fn load(&self, id: SessionId) -> Result<Option<Session>, DeskError> {
        Ok(lock(&self.sessions)?.get(&id).cloned())
    }

    fn create_if_absent(&self, session: &Session) -> Result<bool, DeskError> {
        match lock(&self.sessions)?.entry(session.id) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(session.clone());
                Ok(true)
            }
        }
    }

    fn save(&self, session: &Session) -> Result<(), DeskError> {
        lock(&self.sessions)?.insert(session.id, session.clone());
        Ok(())
    }

    fn remove(&self, id: SessionId) -> Result<bool, DeskError> {
        lock(&self.reports)?.remove(&id);
        Ok(lock(&self.sessions)?.remove(&id).is_some())
    }

    fn activity(&self) -> Result<Vec<(SessionId, DateTime<Utc>)>, DeskError> {
        Ok(lock(&self.sessions)?
            .values()
            .map(|s| (s.id, s.last_activity))
            .collect())
    }

    fn save_report(&self, report: &TransparencyReport) -> Result<(), DeskError> {
        lock(&self.reports)?
            .entry(report.session_id)
            .or_default()
            .push(report.clone());
        Ok(())
    }

    fn reports(&self, id: SessionId) -> Result<Vec<TransparencyReport>, DeskError> {
        Ok(lock(&self.reports)?.get(&id).cloned().unwrap_or_default())
    }
}

pub(crate) fn lock<T>(m: &Mutex<T>) -> Result<MutexGuard<'_, T>, DeskError> {
    m.lock().map_err(|e| DeskError::Storage {
        reason: format!("lock poisoned: {e}"),
    })
}

// ─── Turn locks ─────────────────────────────────────────────────────────────

/// Per-session lock plus a count of turns holding or awaiting it.
#[derive(Default)]
struct Slot {
    lock: Arc<tokio::sync::Mutex<()>>,
    pending: AtomicUsize,
}

/// Counts one pending turn until dropped, including when the waiting future
/// is cancelled.
struct Ticket {
    slot: Arc<Slot>,
}

impl Drop for Ticket {
    fn drop(&mut self) {
        self.slot.pending.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Exclusive right to run a turn on one session.
pub struct TurnGuard {
    id: SessionId,
    _lock: OwnedMutexGuard<()>,
    _ticket: Ticket,
}

impl TurnGuard {
    pub fn session_id(&self) -> SessionId {
        self.id
    }
}

// ─── Store ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct StoreSettings {
    pub ttl: Duration,
    pub capacity: usize,
    /// Turns allowed to wait behind the running one.
    pub max_queued_turns: usize,
}

impl From<&SessionConfig> for StoreSettings {
    fn from(c: &SessionConfig) -> Self {
        Self {
            ttl: Duration::from_secs(c.ttl_secs),
            capacity: c.capacity,
            max_queued_turns: c.max_queued_turns,
        }
    }
}

pub struct SessionStore {
    backend: Arc<dyn SessionBackend>,
    slots: Mutex<HashMap<SessionId, Arc<Slot>>>,
    settings: StoreSettings,
}

impl SessionStore {
    pub fn new(backend: Arc<dyn SessionBackend>, settings: StoreSettings) -> Self {
        Self {
            backend,
            slots: Mutex::new(HashMap::new()),
            settings,
        }
    }

    /// Store backed by process memory.
    pub fn in_memory(settings: StoreSettings) -> Self {
        Self::new(Arc::new(InMemoryBackend::new()), settings)
    }

    pub fn create_session(&self) -> Result<SessionId, DeskError> {
        self.create_with_id(SessionId::new())
    }

    /// Create a session under a caller-chosen id. An existing session with
    /// that id is returned unchanged.
    pub fn create_with_id(&self, id: SessionId) -> Result<SessionId, DeskError> {
        self.insert_new(id)?;
        Ok(id)
    }

    /// Atomically create `id` if absent, then enforce capacity. Returns
    /// whether the session was created.
    fn insert_new(&self, id: SessionId) -> Result<bool, DeskError> {
        if !self.backend.create_if_absent(&Session::new(id))? {
            return Ok(false);
        }
        tracing::info!(session_id = %id, "session created");

        if self.len()? > self.settings.capacity {
            self.evict(Utc::now())?;
        }
        Ok(true)
    }

    pub fn get(&self, id: SessionId) -> Result<Session, DeskError> {
        self.backend
            .load(id)?
            .ok_or_else(|| DeskError::SessionNotFound {
                session_id: id.to_string(),
            })
    }

    /// Append one message outside of a pipeline turn.
    pub async fn append_message(&self, id: SessionId, message: Message) -> Result<Session, DeskError> {
        let (guard, mut session) = self.begin_turn(id).await?;
        session.messages.push(message);
        self.commit(&guard, &mut session)?;
        Ok(session)
    }

    /// Mark the session closed. Waits for an in-flight turn to finish first.
    pub async fn close(&self, id: SessionId) -> Result<(), DeskError> {
        let (guard, mut session) = self.begin_turn(id).await?;
        if session.closed {
            return Ok(());
        }
        session.closed = true;
        session.messages.push(Message::system("Session closed."));
        self.commit(&guard, &mut session)?;
        tracing::info!(session_id = %id, "session closed");
        Ok(())
    }

    /// Wait for the session's turn lock and load a snapshot.
    ///
    /// Turns run in arrival order. When `max_queued_turns` turns are already
    /// waiting, fails with `SessionBusy` instead of queueing.
    pub async fn begin_turn(&self, id: SessionId) -> Result<(TurnGuard, Session), DeskError> {
        self.acquire(id, false).await
    }

    /// Like [`Self::begin_turn`], but a missing session is created while the
    /// turn lock is held. Eviction cannot remove it before the turn commits.
    pub async fn open_turn(&self, id: SessionId) -> Result<(TurnGuard, Session), DeskError> {
        self.acquire(id, true).await
    }

    async fn acquire(&self, id: SessionId, create: bool) -> Result<(TurnGuard, Session), DeskError> {
        // The ticket is registered before the session is looked up, so
        // eviction skips it from here on.
        let (slot, ahead) = {
            let mut slots = lock(&self.slots)?;
            let slot = slots.entry(id).or_default().clone();
            let ahead = slot.pending.fetch_add(1, Ordering::SeqCst);
            (slot, ahead)
        };
        let ticket = Ticket { slot: slot.clone() };

        // `ahead` counts the running turn plus those queued before us.
        if ahead > self.settings.max_queued_turns {
            tracing::warn!(session_id = %id, queued = ahead, "turn queue full");
            return Err(DeskError::SessionBusy {
                session_id: id.to_string(),
            });
        }
        if ahead > 0 {
            tracing::debug!(session_id = %id, ahead, "turn queued");
        }

        let guard = TurnGuard {
            id,
            _lock: slot.lock.clone().lock_owned().await,
            _ticket: ticket,
        };

        if create {
            self.insert_new(id)?;
        }
        match self.backend.load(id)? {
            Some(session) => Ok((guard, session)),
            None => {
                drop(guard);
                self.forget_slot(id)?;
                Err(DeskError::SessionNotFound {
                    session_id: id.to_string(),
                })
            }
        }
    }

    /// Persist the turn's snapshot.
    pub fn commit(&self, guard: &TurnGuard, session: &mut Session) -> Result<(), DeskError> {
        if guard.id != session.id {
            return Err(DeskError::Storage {
                reason: format!("turn guard for {} cannot commit {}", guard.id, session.id),
            });
        }
        session.last_activity = Utc::now();
        self.backend.save(session)
    }

    pub fn save_report(&self, report: &TransparencyReport) -> Result<(), DeskError> {
        self.backend.save_report(report)
    }

    pub fn list_reports(&self, id: SessionId) -> Result<Vec<TransparencyReport>, DeskError> {
        self.get(id)?;
        self.backend.reports(id)
    }

    pub fn len(&self) -> Result<usize, DeskError> {
        Ok(self.backend.activity()?.len())
    }

    pub fn is_empty(&self) -> Result<bool, DeskError> {
        Ok(self.len()? == 0)
    }

    /// Evict sessions idle longer than the TTL, then the least recently
    /// active ones while over capacity. Sessions with a turn running or
    /// queued are never evicted.
    pub fn evict(&self, now: DateTime<Utc>) -> Result<Vec<SessionId>, DeskError> {
        // Held throughout so no turn can start on a session being removed.
        let mut slots = lock(&self.slots)?;

        let mut activity = self.backend.activity()?;
        activity.sort_by_key(|(id, at)| (*at, *id));

        let mut remaining = activity.len();
        let mut evicted = Vec::new();
        for (id, last_activity) in activity {
            let in_flight = slots
                .get(&id)
                .is_some_and(|s| s.pending.load(Ordering::SeqCst) > 0);
            if in_flight {
                continue;
            }
            let idle = (now - last_activity).to_std().unwrap_or_default();
            if idle > self.settings.ttl || remaining > self.settings.capacity {
                self.backend.remove(id)?;
                slots.remove(&id);
                remaining -= 1;
                evicted.push(id);
            }
        }

        if !evicted.is_empty() {
            tracing::info!(evicted = evicted.len(), remaining, "sessions evicted");
        }
        Ok(evicted)
    }

    fn forget_slot(&self, id: SessionId) -> Result<(), DeskError> {
        let mut slots = lock(&self.slots)?;
        if slots
            .get(&id)
            .is_some_and(|s| s.pending.load(Ordering::SeqCst) == 0)
        {
            slots.remove(&id);
        }
        Ok(())
    }
}
