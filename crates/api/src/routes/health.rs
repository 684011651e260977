//! Liveness and readiness at `/health`, outside `/api/v1`.

use axum::extract::State;
use axum::http::StatusCode;
use axum::{routing::get, Json, Router};
use serde::Serialize;

use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct HealthReport {
    /// `ok`, or `degraded` when the database cannot be reached.
    pub status: &'static str,
    pub version: &'static str,
    pub database: bool,
    /// Sessions an orchestrator in this process is currently driving.
    pub live_sessions: usize,
}

/// GET /health
///
/// Answers 503 while the database is unreachable, since no session can be
/// opened or resumed without it; live streams keep running regardless.
async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthReport>) {
    let database = match pagecraft_db::health_check(&state.pool).await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(error = %e, "Health check could not reach the database");
            false
        }
    };

    let report = HealthReport {
        status: if database { "ok" } else { "degraded" },
        version: env!("CARGO_PKG_VERSION"),
        database,
        live_sessions: state.generation.hub().live_count(),
    };
    let code = if database { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (code, Json(report))
}

pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health))
}
