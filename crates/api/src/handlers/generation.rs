//! Handlers for page generation and generation sessions.
//!
//! Generation output is delivered as server-sent events. Each event's name is
//! the stream event kind (`status`, `chunk`, `snapshot`, `complete`,
//! `failed`, `interrupted`) and its data is the JSON payload. Snapshot events
//! carry the pass number as the SSE id, so a reconnecting browser sends it
//! back as `Last-Event-ID`.

use std::convert::Infallible;

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use futures::{Stream, StreamExt};
use pagecraft_core::error::GenerationErrorCode;
use pagecraft_core::policy::{GenerationMode, Tier};
use pagecraft_core::session::{GenerationSession, SessionStatus};
use pagecraft_core::stream::StreamEvent;
use pagecraft_core::types::{DbId, SessionId, Timestamp};
use pagecraft_pipeline::SessionStream;
use serde::{Deserialize, Serialize};

use crate::error::AppResult;
use crate::middleware::auth::AuthUser;
use crate::response::DataResponse;
use crate::state::AppState;

const LAST_EVENT_ID: &str = "last-event-id";

/// Body of `POST /projects/{id}/generate`.
#[derive(Debug, Deserialize)]
pub struct GenerateRequest {
    pub prompt: String,
}

/// Query of `GET /generation-sessions/{id}/stream`.
#[derive(Debug, Default, Deserialize)]
pub struct StreamQuery {
    /// Highest snapshot pass the caller already holds.
    pub cursor: Option<u32>,
}

/// Session record as returned to its owner.
#[derive(Debug, Serialize)]
pub struct SessionView {
    pub id: SessionId,
    pub project_id: DbId,
    pub tier: Tier,
    pub mode: GenerationMode,
    pub status: SessionStatus,
    pub credit_cost: i32,
    pub passes_total: u32,
    pub passes_completed: u32,
    pub delivery_cursor: u32,
    pub error_code: Option<GenerationErrorCode>,
    pub brief_fallback: bool,
    pub refunded: bool,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub closed_at: Option<Timestamp>,
}

impl From<GenerationSession> for SessionView {
    fn from(s: GenerationSession) -> Self {
        Self {
            id: s.id,
            project_id: s.project_id,
            tier: s.tier,
            mode: s.mode,
            status: s.status,
            credit_cost: s.credit_cost,
            passes_total: s.passes_total,
            passes_completed: s.passes_completed,
            delivery_cursor: s.delivery_cursor,
            error_code: s.error_code,
            brief_fallback: s.brief_fallback,
            refunded: s.refunded_at.is_some(),
            created_at: s.created_at,
            updated_at: s.updated_at,
            closed_at: s.closed_at,
        }
    }
}

/// Convert a stream event to its SSE form.
pub fn to_sse_event(event: &StreamEvent) -> Event {
    let sse = Event::default()
        .event(event.name())
        .data(event.payload().to_string());
    match event {
        StreamEvent::Snapshot { pass, .. } => sse.id(pass.to_string()),
        _ => sse,
    }
}

fn sse_response(stream: SessionStream) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    Sse::new(stream.map(|event| Ok(to_sse_event(&event)))).keep_alive(KeepAlive::default())
}

/// Resolve the resume cursor: the query parameter wins over `Last-Event-ID`.
pub fn resume_cursor(query: &StreamQuery, headers: &HeaderMap) -> Option<u32> {
    query.cursor.or_else(|| {
        headers
            .get(LAST_EVENT_ID)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok())
    })
}

/// POST /api/v1/projects/{id}/generate
///
/// Rejections (validation, rate limit, entitlement, lock, balance) are
/// returned as JSON errors before any stream is opened.
pub async fn generate(
    State(state): State<AppState>,
    user: AuthUser,
    Path(project_id): Path<DbId>,
    Json(input): Json<GenerateRequest>,
) -> AppResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let stream = state
        .generation
        .open(user.account_id, project_id, &input.prompt)
        .await?;
    Ok(sse_response(stream))
}

/// GET /api/v1/generation-sessions/{id}
pub async fn get_session(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<SessionId>,
) -> AppResult<Json<DataResponse<SessionView>>> {
    let session = state.generation.session(user.account_id, id).await?;
    Ok(Json(DataResponse {
        data: session.into(),
    }))
}

/// GET /api/v1/generation-sessions/{id}/stream
pub async fn stream(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<SessionId>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
) -> AppResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let cursor = resume_cursor(&query, &headers);
    let stream = state.generation.resume(user.account_id, id, cursor).await?;
    Ok(sse_response(stream))
}

/// POST /api/v1/generation-sessions/{id}/cancel
pub async fn cancel(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<SessionId>,
) -> AppResult<Json<DataResponse<SessionView>>> {
    let session = state.generation.cancel(user.account_id, id).await?;
    Ok(Json(DataResponse {
        data: session.into(),
    }))
}
