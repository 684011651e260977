//! Repository for the immutable `generation_snapshots` table.

use sqlx::PgPool;
use pagecraft_core::types::SessionId;

use crate::models::snapshot::GenerationSnapshot;

const COLUMNS: &str = "session_id, pass, html, created_at";

pub struct SnapshotRepo;

impl SnapshotRepo {
    /// The highest-pass snapshot of a session.
    pub async fn latest_for_session(
        pool: &PgPool,
        session_id: SessionId,
    ) -> Result<Option<GenerationSnapshot>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM generation_snapshots
             WHERE session_id = $1
             ORDER BY pass DESC
             LIMIT 1"
        );
        sqlx::query_as::<_, GenerationSnapshot>(&query)
            .bind(session_id)
            .fetch_optional(pool)
            .await
    }
}
