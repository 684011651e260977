use std::sync::Arc;

use pagecraft_events::EventBus;
use pagecraft_pipeline::GenerationService;

use crate::config::ServerConfig;

/// Shared application state available to all Axum handlers via `State<AppState>`.
///
/// Cheaply cloneable (inner data is behind `Arc` or is already `Clone`).
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool.
    pub pool: pagecraft_db::DbPool,
    /// Server configuration.
    pub config: Arc<ServerConfig>,
    /// Generation pipeline entry point.
    pub generation: Arc<GenerationService>,
    /// Event bus for session lifecycle events.
    pub event_bus: Arc<EventBus>,
}
