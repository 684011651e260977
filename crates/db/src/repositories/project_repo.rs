//! Repository for `projects` and their `conversation_turns`.

use sqlx::PgPool;
use pagecraft_core::assembly::ChatRole;
use pagecraft_core::types::DbId;

use crate::models::project::{role_str, ConversationTurn, CreateProject, Project};

const COLUMNS: &str = "id, account_id, name, committed_html, created_at, updated_at";

const TURN_COLUMNS: &str = "id, project_id, role, content, created_at";

pub struct ProjectRepo;

impl ProjectRepo {
    pub async fn create(pool: &PgPool, input: &CreateProject) -> Result<Project, sqlx::Error> {
        let query = format!(
            "INSERT INTO projects (account_id, name)
             VALUES ($1, $2)
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Project>(&query)
            .bind(input.account_id)
            .bind(&input.name)
            .fetch_one(pool)
            .await
    }

    pub async fn find_by_id(pool: &PgPool, id: DbId) -> Result<Option<Project>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM projects WHERE id = $1");
        sqlx::query_as::<_, Project>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// The most recent `limit` turns of a project, oldest first.
    pub async fn list_recent_turns(
        pool: &PgPool,
        project_id: DbId,
        limit: i64,
    ) -> Result<Vec<ConversationTurn>, sqlx::Error> {
        let query = format!(
            "SELECT {TURN_COLUMNS} FROM (
                SELECT {TURN_COLUMNS} FROM conversation_turns
                WHERE project_id = $1
                ORDER BY id DESC
                LIMIT $2
             ) recent
             ORDER BY id ASC"
        );
        sqlx::query_as::<_, ConversationTurn>(&query)
            .bind(project_id)
            .bind(limit)
            .fetch_all(pool)
            .await
    }

    /// Append a turn. User text must already be sanitized.
    pub async fn add_turn(
        pool: &PgPool,
        project_id: DbId,
        role: ChatRole,
        content: &str,
    ) -> Result<ConversationTurn, sqlx::Error> {
        let query = format!(
            "INSERT INTO conversation_turns (project_id, role, content)
             VALUES ($1, $2, $3)
             RETURNING {TURN_COLUMNS}"
        );
        sqlx::query_as::<_, ConversationTurn>(&query)
            .bind(project_id)
            .bind(role_str(role))
            .bind(content)
            .fetch_one(pool)
            .await
    }
}
