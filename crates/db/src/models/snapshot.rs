use serde::Serialize;
use sqlx::FromRow;
use pagecraft_core::session::Snapshot;
use pagecraft_core::types::{SessionId, Timestamp};

/// A row from the `generation_snapshots` table. Rows are never updated.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct GenerationSnapshot {
    pub session_id: SessionId,
    pub pass: i32,
    pub html: String,
    pub created_at: Timestamp,
}

impl From<GenerationSnapshot> for Snapshot {
    fn from(row: GenerationSnapshot) -> Self {
        Snapshot {
            session_id: row.session_id,
            pass: row.pass.max(0) as u32,
            html: row.html,
        }
    }
}
