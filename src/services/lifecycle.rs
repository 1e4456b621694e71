//! Session lifecycle — countdown, extension outcomes, termination, rollover.
//!
//! ARCHITECTURE
//! ============
//! ```text
//! Connecting ──join──▶ Active ──warning──▶ Extending ──both extend──▶ Active
//!                        │                     │
//!                        │ zero / manual       │ any decline / zero / manual
//!                        ▼                     ▼
//!                      Ending ───────────▶ Ended ──auto-reconnect──▶ (new session)
//! ```
//!
//! Each active session owns one countdown task. Ticks go through the store,
//! which decrements the clock and latches the extension offer in one
//! critical section. Ending a session aborts its countdown; every other
//! deferred step (pacing, outcome delay, rollover) re-checks the store
//! before acting.
//!
//! The controller itself is stateless. Client bindings move from an ended
//! session to its successor, so one connection lives across many sessions.

use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};
use uuid::Uuid;

use crate::services::events;
use crate::services::extension::ExtensionOutcome;
use crate::services::store::TickOutcome;
use crate::state::{AppState, SessionPhase};

const TICK: Duration = Duration::from_secs(1);
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EndReason {
    /// The clock ran out.
    Expired,
    /// Extension negotiation did not produce two extends.
    Declined,
    /// The user left.
    Manual,
}

// =============================================================================
// COUNTDOWN
// =============================================================================

/// Move a `Connecting` session to `Active` and start its countdown. Returns
/// `false` if the session was already started, ended, or unknown.
pub async fn start(state: &AppState, session_id: Uuid) -> bool {
    if !state.store.activate(session_id).await {
        return false;
    }
    let handle = spawn_countdown(state.clone(), session_id);
    state
        .store
        .set_countdown(session_id, handle.abort_handle())
        .await;
    info!(%session_id, "lifecycle: countdown started");
    true
}

fn spawn_countdown(state: AppState, session_id: Uuid) -> JoinHandle<()> {
    tokio::spawn(async move {
        let warning_secs = state.settings.extension_warning_secs;
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + TICK, TICK);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            match state.store.tick(session_id, warning_secs).await {
                TickOutcome::Inactive => break,
                TickOutcome::Ticked { remaining } => {
                    state
                        .store
                        .broadcast(session_id, &events::clock(session_id, remaining), None)
                        .await;
                }
                TickOutcome::Offer { remaining } => {
                    info!(%session_id, remaining, "lifecycle: extension offered");
                    state
                        .store
                        .broadcast(session_id, &events::clock(session_id, remaining), None)
                        .await;
                    state
                        .store
                        .broadcast(session_id, &events::extension_offer(session_id, remaining), None)
                        .await;
                }
                TickOutcome::Expired => {
                    state
                        .store
                        .broadcast(session_id, &events::clock(session_id, 0), None)
                        .await;
                    end_session(&state, session_id, EndReason::Expired).await;
                    break;
                }
            }
        }
    })
}

// =============================================================================
// EXTENSION OUTCOME
// =============================================================================

/// Apply a resolved negotiation after the outcome has been on screen for a
/// moment: reset the clock on a double extend, otherwise end the session.
pub async fn apply_extension_outcome(state: &AppState, session_id: Uuid, outcome: ExtensionOutcome) {
    tokio::time::sleep(state.settings.pacing.extension_outcome).await;

    if outcome.both_extend {
        match state
            .store
            .mark_extended(session_id, state.settings.extension_duration_secs)
            .await
        {
            Ok(session) => {
                state
                    .store
                    .broadcast(session_id, &events::clock(session_id, session.time_remaining_secs), None)
                    .await;
            }
            Err(e) => info!(%session_id, error = %e, "lifecycle: extension outcome dropped"),
        }
        return;
    }

    state.store.set_phase(session_id, SessionPhase::Ending).await;
    end_session(state, session_id, EndReason::Declined).await;
}

// =============================================================================
// TERMINATION
// =============================================================================

/// End a session once. Notifies bound clients and, with auto-reconnect on,
/// schedules a successor session for them. Returns `false` if the session
/// was already ended or does not exist.
pub async fn end_session(state: &AppState, session_id: Uuid, reason: EndReason) -> bool {
    match state.store.mark_ended(session_id).await {
        Ok(true) => {}
        Ok(false) | Err(_) => return false,
    }
    info!(%session_id, ?reason, "lifecycle: session ended");

    state
        .store
        .broadcast(session_id, &events::ended(session_id, reason), None)
        .await;

    if state.settings.auto_reconnect && state.store.client_count(session_id).await > 0 {
        spawn_rollover(state.clone(), session_id);
    }
    true
}

/// End a session without a successor and remove it from the store.
///
/// # Errors
///
/// Returns [`crate::services::store::StoreError::NotFound`] for unknown ids.
pub async fn discard(state: &AppState, session_id: Uuid) -> Result<(), crate::services::store::StoreError> {
    if state.store.mark_ended(session_id).await? {
        state
            .store
            .broadcast(session_id, &events::ended(session_id, EndReason::Manual), None)
            .await;
    }
    state.store.delete(session_id).await
}

fn spawn_rollover(state: AppState, old_session_id: Uuid) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(state.settings.pacing.rollover_settle).await;
        rollover(&state, old_session_id).await;
    })
}

/// Provision a successor with a different persona and move the old
/// session's clients onto it.
async fn rollover(state: &AppState, old_session_id: Uuid) {
    let previous = state
        .store
        .get(old_session_id)
        .await
        .ok()
        .map(|s| s.persona.id);

    let persona = match state.personas.random_excluding(previous.as_deref()) {
        Ok(p) => p,
        Err(e) => {
            warn!(%old_session_id, error = %e, "lifecycle: rollover skipped, no persona");
            return;
        }
    };

    let clients = state.store.take_clients(old_session_id).await;
    if clients.is_empty() {
        info!(%old_session_id, "lifecycle: rollover skipped, no clients left");
        return;
    }

    let session = state
        .store
        .create(persona, state.settings.session_duration_secs)
        .await;
    let moved = clients.len();
    state.store.bind_clients(session.id, clients).await;
    start(state, session.id).await;

    match state.store.get(session.id).await {
        Ok(snapshot) => {
            info!(%old_session_id, session_id = %session.id, persona = %snapshot.persona.id, moved, "lifecycle: rolled over");
            let frame = events::session_joined(&snapshot, state.settings.session_duration_minutes());
            state.store.broadcast(session.id, &frame, None).await;
        }
        Err(e) => warn!(session_id = %session.id, error = %e, "lifecycle: successor vanished"),
    }
}

// =============================================================================
// SWEEPER
// =============================================================================

/// Spawn the background task that drops ended and never-joined sessions
/// after the retention window. Returns a handle for shutdown.
pub fn spawn_sweeper(state: AppState) -> JoinHandle<()> {
    let retention = state.settings.ended_retention;
    info!(retention_secs = retention.as_secs(), "ended-session sweeper configured");
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let removed = state.store.sweep(retention).await;
            if removed > 0 {
                info!(removed, "sweeper: stale sessions removed");
            }
        }
    })
}

#[cfg(test)]
#[path = "lifecycle_test.rs"]
mod tests;
