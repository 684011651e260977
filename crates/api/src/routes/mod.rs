pub mod credits;
pub mod generation;
pub mod health;

use std::time::Duration;

use axum::http::StatusCode;
use axum::Router;
use tower_http::timeout::TimeoutLayer;

use crate::state::AppState;

/// Build the `/api/v1` route tree.
///
/// Route hierarchy:
///
/// ```text
/// /projects/{id}/generate                 start a generation (POST, SSE)
///
/// /generation-sessions/{id}               session record (GET)
/// /generation-sessions/{id}/stream        resume the stream (GET, SSE)
/// /generation-sessions/{id}/cancel        cancel (POST)
///
/// /credits                                balance and recent ledger (GET)
/// ```
///
/// `request_timeout` bounds the non-streaming routes only; an SSE response
/// stays open for as long as its session runs.
pub fn api_routes(request_timeout: Duration) -> Router<AppState> {
    let bounded = Router::new()
        .merge(generation::session_router())
        .merge(credits::router())
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            request_timeout,
        ));

    Router::new().merge(generation::stream_router()).merge(bounded)
}
