//! Route definitions for generation and generation sessions.

use axum::routing::{get, post};
use axum::Router;

use crate::handlers::generation;
use crate::state::AppState;

/// Streaming routes.
///
/// ```text
/// POST   /projects/{id}/generate              -> generate
/// GET    /generation-sessions/{id}/stream     -> stream
/// ```
pub fn stream_router() -> Router<AppState> {
    Router::new()
        .route("/projects/{id}/generate", post(generation::generate))
        .route("/generation-sessions/{id}/stream", get(generation::stream))
}

/// Session management routes.
///
/// ```text
/// GET    /generation-sessions/{id}            -> get_session
/// POST   /generation-sessions/{id}/cancel     -> cancel
/// ```
pub fn session_router() -> Router<AppState> {
    Router::new()
        .route("/generation-sessions/{id}", get(generation::get_session))
        .route("/generation-sessions/{id}/cancel", post(generation::cancel))
}
