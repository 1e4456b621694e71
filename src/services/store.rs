//! Session store — the authoritative in-memory registry of sessions.
//!
//! DESIGN
//! ======
//! One `RwLock<HashMap>` keyed by session id. Every method takes the lock for
//! a single synchronous critical section and returns owned data, so no
//! caller ever holds a session across an await. Compound transitions that
//! must not interleave (tick + offer check, decision recording, the
//! end-once latch) each run inside one critical section.
//!
//! Besides the session itself, each entry carries the transport bindings
//! (client channels), the per-session reply lock that serializes paced
//! deliveries, and the abort handle of the countdown task.
//!
//! ERROR HANDLING
//! ==============
//! Unknown ids are `NotFound`; mutations on ended sessions are `Inactive`.
//! Deferred pacing steps treat both as "stop quietly".

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::task::AbortHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::frame::Frame;
use crate::persona::Persona;
use crate::state::{ChatMessage, ExtensionState, Session, SessionPhase};

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("session not found: {0}")]
    NotFound(Uuid),
    #[error("session is no longer active: {0}")]
    Inactive(Uuid),
}

impl crate::frame::ErrorCode for StoreError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "E_SESSION_NOT_FOUND",
            Self::Inactive(_) => "E_SESSION_INACTIVE",
        }
    }
}

/// Listing row for `GET /api/sessions`.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: Uuid,
    pub persona_id: String,
    pub persona_name: String,
    pub message_count: usize,
    pub time_remaining_secs: u64,
    pub is_active: bool,
    pub phase: SessionPhase,
    pub created_at: chrono::DateTime<Utc>,
}

/// What one countdown tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Session gone or ended. The countdown should stop.
    Inactive,
    Ticked { remaining: u64 },
    /// Warning threshold crossed for the first time this cycle.
    Offer { remaining: u64 },
    /// Clock hit zero. Phase is now `Ending`.
    Expired,
}

struct SessionEntry {
    session: Session,
    /// Connected clients: `client_id` -> sender for outgoing frames.
    clients: HashMap<Uuid, mpsc::Sender<Frame>>,
    reply_lock: Arc<Mutex<()>>,
    countdown: Option<AbortHandle>,
}

impl SessionEntry {
    fn new(session: Session) -> Self {
        Self { session, clients: HashMap::new(), reply_lock: Arc::new(Mutex::new(())), countdown: None }
    }
}

#[derive(Clone, Default)]
pub struct SessionStore {
    inner: Arc<RwLock<HashMap<Uuid, SessionEntry>>>,
}

// =============================================================================
// CRUD
// =============================================================================

impl SessionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new session in `Connecting` with a full clock.
    pub async fn create(&self, persona: Persona, duration_secs: u64) -> Session {
        let session = Session::new(persona, duration_secs);
        let snapshot = session.clone();
        self.inner
            .write()
            .await
            .insert(session.id, SessionEntry::new(session));
        info!(session_id = %snapshot.id, persona = %snapshot.persona.id, duration_secs, "store: session created");
        snapshot
    }

    /// Snapshot of one session.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for unknown ids.
    pub async fn get(&self, id: Uuid) -> Result<Session, StoreError> {
        self.inner
            .read()
            .await
            .get(&id)
            .map(|e| e.session.clone())
            .ok_or(StoreError::NotFound(id))
    }

    pub async fn list(&self) -> Vec<SessionSummary> {
        let sessions = self.inner.read().await;
        let mut rows: Vec<SessionSummary> = sessions
            .values()
            .map(|e| {
                let s = &e.session;
                SessionSummary {
                    id: s.id,
                    persona_id: s.persona.id.clone(),
                    persona_name: s.persona.name.clone(),
                    message_count: s.messages.len(),
                    time_remaining_secs: s.time_remaining_secs,
                    is_active: s.is_active,
                    phase: s.phase,
                    created_at: s.created_at,
                }
            })
            .collect();
        rows.sort_by_key(|r| r.created_at);
        rows
    }

    /// Remove a session entirely, stopping its countdown.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for unknown ids.
    pub async fn delete(&self, id: Uuid) -> Result<(), StoreError> {
        let entry = self
            .inner
            .write()
            .await
            .remove(&id)
            .ok_or(StoreError::NotFound(id))?;
        if let Some(handle) = entry.countdown {
            abort_unless_current(&handle);
        }
        info!(session_id = %id, "store: session deleted");
        Ok(())
    }

    pub async fn is_active(&self, id: Uuid) -> bool {
        self.inner
            .read()
            .await
            .get(&id)
            .is_some_and(|e| e.session.is_active)
    }

    /// Append a finalized message.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] or [`StoreError::Inactive`].
    pub async fn append_message(&self, id: Uuid, message: ChatMessage) -> Result<(), StoreError> {
        let mut sessions = self.inner.write().await;
        let entry = active_entry(&mut sessions, id)?;
        entry.session.messages.push(message);
        Ok(())
    }
}

fn active_entry(sessions: &mut HashMap<Uuid, SessionEntry>, id: Uuid) -> Result<&mut SessionEntry, StoreError> {
    let entry = sessions.get_mut(&id).ok_or(StoreError::NotFound(id))?;
    if !entry.session.is_active {
        return Err(StoreError::Inactive(id));
    }
    Ok(entry)
}

/// Abort a countdown unless the caller is that countdown task itself, which
/// is about to return on its own.
fn abort_unless_current(handle: &AbortHandle) {
    if tokio::task::try_id() != Some(handle.id()) {
        handle.abort();
    }
}

// =============================================================================
// LIFECYCLE TRANSITIONS
// =============================================================================

impl SessionStore {
    /// `Connecting` → `Active`. Returns `true` only for the call that made
    /// the transition, so the countdown is started exactly once.
    pub async fn activate(&self, id: Uuid) -> bool {
        let mut sessions = self.inner.write().await;
        match sessions.get_mut(&id) {
            Some(entry) if entry.session.is_active && entry.session.phase == SessionPhase::Connecting => {
                entry.session.phase = SessionPhase::Active;
                true
            }
            _ => false,
        }
    }

    pub async fn set_phase(&self, id: Uuid, phase: SessionPhase) {
        if let Some(entry) = self.inner.write().await.get_mut(&id) {
            if entry.session.is_active {
                entry.session.phase = phase;
            }
        }
    }

    /// Reset the clock after a successful extension and clear the
    /// negotiation back to its unoffered shape.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] or [`StoreError::Inactive`].
    pub async fn mark_extended(&self, id: Uuid, extension_secs: u64) -> Result<Session, StoreError> {
        let mut sessions = self.inner.write().await;
        let entry = active_entry(&mut sessions, id)?;
        entry.session.time_remaining_secs = extension_secs;
        entry.session.extension = ExtensionState::default();
        entry.session.phase = SessionPhase::Active;
        info!(session_id = %id, extension_secs, "store: session extended");
        Ok(entry.session.clone())
    }

    /// Mark a session inactive and stop its countdown. Returns `true` only
    /// for the first call; later calls are no-ops.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for unknown ids.
    pub async fn mark_ended(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut sessions = self.inner.write().await;
        let entry = sessions.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if !entry.session.is_active {
            return Ok(false);
        }
        entry.session.is_active = false;
        entry.session.phase = SessionPhase::Ended;
        entry.session.ended_at = Some(Utc::now());
        if let Some(handle) = entry.countdown.take() {
            abort_unless_current(&handle);
        }
        Ok(true)
    }

    /// Remember the countdown task so ending the session can stop it.
    pub async fn set_countdown(&self, id: Uuid, handle: AbortHandle) {
        let mut sessions = self.inner.write().await;
        match sessions.get_mut(&id) {
            Some(entry) if entry.session.is_active => {
                if let Some(old) = entry.countdown.replace(handle) {
                    old.abort();
                }
            }
            _ => handle.abort(),
        }
    }

    /// One countdown second plus the warning-threshold check, atomically.
    pub async fn tick(&self, id: Uuid, warning_secs: u64) -> TickOutcome {
        let mut sessions = self.inner.write().await;
        let Some(entry) = sessions.get_mut(&id) else {
            return TickOutcome::Inactive;
        };
        let session = &mut entry.session;
        if !session.is_active {
            return TickOutcome::Inactive;
        }

        let remaining = session.clock().tick().total_secs();
        session.time_remaining_secs = remaining;

        if remaining == 0 {
            session.phase = SessionPhase::Ending;
            return TickOutcome::Expired;
        }
        if !session.extension.has_been_offered && remaining <= warning_secs {
            session.extension.has_been_offered = true;
            session.phase = SessionPhase::Extending;
            return TickOutcome::Offer { remaining };
        }
        TickOutcome::Ticked { remaining }
    }

    /// Run `f` against the extension state of an active session.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] or [`StoreError::Inactive`].
    pub async fn update_extension<R>(
        &self,
        id: Uuid,
        f: impl FnOnce(&mut ExtensionState) -> R,
    ) -> Result<R, StoreError> {
        let mut sessions = self.inner.write().await;
        let entry = active_entry(&mut sessions, id)?;
        Ok(f(&mut entry.session.extension))
    }

    /// Shared lock that serializes reply deliveries for one session.
    pub async fn reply_lock(&self, id: Uuid) -> Option<Arc<Mutex<()>>> {
        self.inner
            .read()
            .await
            .get(&id)
            .map(|e| Arc::clone(&e.reply_lock))
    }

    /// Drop sessions that ended more than `retention` ago, and sessions
    /// still waiting in `Connecting` that were created before then. Returns
    /// how many went.
    pub async fn sweep(&self, retention: Duration) -> usize {
        let Some(cutoff) = chrono::Duration::from_std(retention)
            .ok()
            .and_then(|r| Utc::now().checked_sub_signed(r))
        else {
            return 0;
        };
        let mut sessions = self.inner.write().await;
        let before = sessions.len();
        sessions.retain(|id, e| {
            let s = &e.session;
            let expired = match s.ended_at {
                Some(ended) => ended <= cutoff,
                None => s.phase == SessionPhase::Connecting && s.created_at <= cutoff,
            };
            if expired && s.is_active {
                info!(session_id = %id, "store: never joined, dropping");
            }
            !expired
        });
        before - sessions.len()
    }
}

// =============================================================================
// CLIENT BINDINGS
// =============================================================================

impl SessionStore {
    /// Attach a client channel and return the current snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] or [`StoreError::Inactive`].
    pub async fn bind_client(
        &self,
        id: Uuid,
        client_id: Uuid,
        tx: mpsc::Sender<Frame>,
    ) -> Result<Session, StoreError> {
        let mut sessions = self.inner.write().await;
        let entry = active_entry(&mut sessions, id)?;
        entry.clients.insert(client_id, tx);
        Ok(entry.session.clone())
    }

    pub async fn unbind_client(&self, id: Uuid, client_id: Uuid) {
        if let Some(entry) = self.inner.write().await.get_mut(&id) {
            entry.clients.remove(&client_id);
        }
    }

    /// Detach every client from a session, e.g. to move them to its successor.
    pub async fn take_clients(&self, id: Uuid) -> HashMap<Uuid, mpsc::Sender<Frame>> {
        self.inner
            .write()
            .await
            .get_mut(&id)
            .map(|e| std::mem::take(&mut e.clients))
            .unwrap_or_default()
    }

    /// Attach a batch of clients. Returns `false` if the session is gone.
    pub async fn bind_clients(&self, id: Uuid, clients: HashMap<Uuid, mpsc::Sender<Frame>>) -> bool {
        let mut sessions = self.inner.write().await;
        let Some(entry) = sessions.get_mut(&id) else {
            return false;
        };
        entry.clients.extend(clients);
        true
    }

    pub async fn client_count(&self, id: Uuid) -> usize {
        self.inner
            .read()
            .await
            .get(&id)
            .map_or(0, |e| e.clients.len())
    }

    /// Broadcast a frame to every client bound to a session.
    ///
    /// Uses `try_send` so a slow client drops frames instead of stalling the
    /// session's pacing.
    pub async fn broadcast(&self, id: Uuid, frame: &Frame, exclude: Option<Uuid>) {
        let sessions = self.inner.read().await;
        let Some(entry) = sessions.get(&id) else {
            return;
        };

        for (client_id, tx) in &entry.clients {
            if exclude == Some(*client_id) {
                continue;
            }
            if let Err(e) = tx.try_send(frame.clone()) {
                warn!(session_id = %id, %client_id, syscall = %frame.syscall, error = %e, "store: broadcast dropped");
            }
        }
    }
}

#[cfg(test)]
#[path = "store_test.rs"]
mod tests;
