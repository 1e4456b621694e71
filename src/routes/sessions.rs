//! Session and persona REST routes.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::persona::{Persona, PersonaError};
use crate::services::lifecycle;
use crate::services::prompt::{self, PromptBlock};
use crate::services::store::{SessionSummary, StoreError};
use crate::state::{AppState, Session};

#[derive(Debug, Default, Deserialize)]
pub struct CreateSessionBody {
    #[serde(default)]
    pub persona_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CreateSessionResponse {
    pub session_id: Uuid,
    pub persona: Persona,
    pub duration_minutes: u64,
}

/// `POST /api/sessions` — provision a session with the requested or a random persona.
pub async fn create_session(
    State(state): State<AppState>,
    body: Option<Json<CreateSessionBody>>,
) -> Result<(StatusCode, Json<CreateSessionResponse>), StatusCode> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let persona = match body.persona_id.as_deref() {
        Some(id) => state.personas.get(id),
        None => state.personas.random_excluding(None),
    }
    .map_err(persona_error_to_status)?;

    let session = state
        .store
        .create(persona, state.settings.session_duration_secs)
        .await;
    info!(session_id = %session.id, persona = %session.persona.id, "rest: session created");

    Ok((
        StatusCode::CREATED,
        Json(CreateSessionResponse {
            session_id: session.id,
            persona: session.persona,
            duration_minutes: state.settings.session_duration_minutes(),
        }),
    ))
}

/// `GET /api/sessions` — summaries, oldest first.
pub async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionSummary>> {
    Json(state.store.list().await)
}

/// `GET /api/sessions/:id` — full snapshot.
pub async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> Result<Json<Session>, StatusCode> {
    let session = state
        .store
        .get(session_id)
        .await
        .map_err(store_error_to_status)?;
    Ok(Json(session))
}

/// `DELETE /api/sessions/:id` — end without a successor and forget the session.
pub async fn delete_session(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> Result<StatusCode, StatusCode> {
    lifecycle::discard(&state, session_id)
        .await
        .map_err(store_error_to_status)?;
    info!(%session_id, "rest: session deleted");
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /api/sessions/:id/prompt` — the prompt the persona would see next.
pub async fn get_prompt(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> Result<Json<PromptBlock>, StatusCode> {
    let session = state
        .store
        .get(session_id)
        .await
        .map_err(store_error_to_status)?;
    Ok(Json(prompt::prompt_block(&session, state.settings.generation.history_window)))
}

/// `GET /api/personas` — the roster.
pub async fn list_personas(State(state): State<AppState>) -> Json<Vec<Persona>> {
    Json(state.personas.list())
}

pub(crate) fn store_error_to_status(err: StoreError) -> StatusCode {
    match err {
        StoreError::NotFound(_) => StatusCode::NOT_FOUND,
        StoreError::Inactive(_) => StatusCode::CONFLICT,
    }
}

pub(crate) fn persona_error_to_status(err: PersonaError) -> StatusCode {
    match err {
        PersonaError::NotFound(_) => StatusCode::NOT_FOUND,
        PersonaError::Empty | PersonaError::Load(_) => {
            warn!(error = %err, "rest: persona roster unavailable");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

#[cfg(test)]
#[path = "sessions_test.rs"]
mod tests;
