//! Repository for the `generation_sessions` table.
//!
//! Every mutation of an open session is guarded by `closed_at IS NULL`, so a
//! closed session is never modified again. Status writes are further guarded
//! by `status = ANY(<allowed sources>)`. Credit movements happen in the same
//! transaction as the session change that causes them.

use sqlx::{PgConnection, PgPool};
use pagecraft_core::error::GenerationErrorCode;
use pagecraft_core::policy::LedgerReason;
use pagecraft_core::session::SessionStatus;
use pagecraft_core::types::{DbId, SessionId, Timestamp};

use crate::is_unique_violation;
use crate::models::generation_session::{
    CloseOutcome, CreateGenerationSession, GenerationSessionRow, OpenOutcome, StatusWrite,
};

/// Column list for generation_sessions queries.
const COLUMNS: &str = "id, project_id, account_id, tier, mode, credit_cost, \
    passes_total, passes_completed, status, error_code, brief, brief_fallback, \
    system_prompt, request_messages, delivery_cursor, interrupted_at, closed_at, \
    refunded_at, created_at, updated_at";

/// Partial unique index holding the per-project generation lock.
pub const ACTIVE_PROJECT_CONSTRAINT: &str = "uq_generation_sessions_active_project";

pub struct GenerationSessionRepo;

impl GenerationSessionRepo {
    /// Insert a session and charge its cost in one transaction.
    ///
    /// 1. Insert the session row. A conflict on the per-project partial
    ///    unique index means another session is open: `ProjectBusy`.
    /// 2. Conditionally decrement the balance. Zero affected rows means the
    ///    balance does not cover the cost: `InsufficientCredits`.
    /// 3. Append the charge to the ledger.
    ///
    /// Both rejection paths roll back, leaving no trace.
    pub async fn open_charged(
        pool: &PgPool,
        input: &CreateGenerationSession,
    ) -> Result<OpenOutcome, sqlx::Error> {
        let mut tx = pool.begin().await?;

        let query = format!(
            "INSERT INTO generation_sessions
                (id, project_id, account_id, tier, mode, credit_cost, passes_total,
                 brief, brief_fallback, system_prompt, request_messages)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
             RETURNING {COLUMNS}"
        );
        let inserted = sqlx::query_as::<_, GenerationSessionRow>(&query)
            .bind(input.id)
            .bind(input.project_id)
            .bind(input.account_id)
            .bind(&input.tier)
            .bind(&input.mode)
            .bind(input.credit_cost)
            .bind(input.passes_total)
            .bind(&input.brief)
            .bind(input.brief_fallback)
            .bind(&input.system_prompt)
            .bind(&input.request_messages)
            .fetch_one(&mut *tx)
            .await;

        let row = match inserted {
            Ok(row) => row,
            Err(e) if is_unique_violation(&e, ACTIVE_PROJECT_CONSTRAINT) => {
                tx.rollback().await?;
                return Ok(OpenOutcome::ProjectBusy);
            }
            Err(e) => return Err(e),
        };

        let charged = sqlx::query(
            "UPDATE accounts SET credit_balance = credit_balance - $2, updated_at = NOW()
             WHERE id = $1 AND credit_balance >= $2",
        )
        .bind(input.account_id)
        .bind(input.credit_cost)
        .execute(&mut *tx)
        .await?;

        if charged.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(OpenOutcome::InsufficientCredits);
        }

        sqlx::query(
            "INSERT INTO credit_ledger (account_id, delta, reason, session_id)
             VALUES ($1, $2, $3, $4)",
        )
        .bind(input.account_id)
        .bind(-input.credit_cost)
        .bind(LedgerReason::GenerationCharge.as_str())
        .bind(input.id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(OpenOutcome::Opened(row))
    }

    pub async fn find_by_id(
        pool: &PgPool,
        id: SessionId,
    ) -> Result<Option<GenerationSessionRow>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM generation_sessions WHERE id = $1");
        sqlx::query_as::<_, GenerationSessionRow>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// The open session holding a project's lock, if any.
    pub async fn find_open_for_project(
        pool: &PgPool,
        project_id: DbId,
    ) -> Result<Option<GenerationSessionRow>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM generation_sessions
             WHERE project_id = $1 AND closed_at IS NULL"
        );
        sqlx::query_as::<_, GenerationSessionRow>(&query)
            .bind(project_id)
            .fetch_optional(pool)
            .await
    }

    /// Move an open session to a non-closing status.
    ///
    /// Entering INTERRUPTED stamps `interrupted_at`; any other status clears it.
    pub async fn set_status(
        pool: &PgPool,
        id: SessionId,
        status: SessionStatus,
    ) -> Result<StatusWrite, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE generation_sessions SET
                status = $2,
                interrupted_at = CASE WHEN $2::TEXT = 'INTERRUPTED' THEN NOW() ELSE NULL END,
                updated_at = NOW()
             WHERE id = $1 AND closed_at IS NULL AND status = ANY($3)",
        )
        .bind(id)
        .bind(status.as_str())
        .bind(sources(status))
        .execute(pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(StatusWrite::Applied);
        }
        let mut conn = pool.acquire().await?;
        explain_miss(&mut conn, id).await
    }

    /// Persist the output of a finished pass and count it as completed.
    ///
    /// Snapshots are immutable: re-committing an existing pass keeps the
    /// original row.
    pub async fn commit_snapshot(
        pool: &PgPool,
        id: SessionId,
        pass: i32,
        html: &str,
    ) -> Result<bool, sqlx::Error> {
        let mut tx = pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE generation_sessions SET
                passes_completed = GREATEST(passes_completed, $2),
                updated_at = NOW()
             WHERE id = $1 AND closed_at IS NULL",
        )
        .bind(id)
        .bind(pass)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            "INSERT INTO generation_snapshots (session_id, pass, html)
             VALUES ($1, $2, $3)
             ON CONFLICT (session_id, pass) DO NOTHING",
        )
        .bind(id)
        .bind(pass)
        .bind(html)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    /// Close a session and release its project lock.
    ///
    /// The latest snapshot, if any, becomes the project's committed content
    /// in the same transaction. With `refund` set the charge is returned in
    /// that transaction too, so a closed session that owes a refund never
    /// exists on its own. Closing an already closed session changes nothing.
    pub async fn finish(
        pool: &PgPool,
        id: SessionId,
        status: SessionStatus,
        error_code: Option<GenerationErrorCode>,
        refund: bool,
    ) -> Result<CloseOutcome, sqlx::Error> {
        let mut tx = pool.begin().await?;

        let project_id = sqlx::query_scalar::<_, DbId>(
            "UPDATE generation_sessions SET
                status = $2,
                error_code = $3,
                closed_at = NOW(),
                updated_at = NOW()
             WHERE id = $1 AND closed_at IS NULL AND status = ANY($4)
             RETURNING project_id",
        )
        .bind(id)
        .bind(status.as_str())
        .bind(error_code.map(|c| c.as_str()))
        .bind(sources(status))
        .fetch_optional(&mut *tx)
        .await?;

        let Some(project_id) = project_id else {
            let outcome = match explain_miss(&mut tx, id).await? {
                StatusWrite::Rejected { from } => CloseOutcome::Rejected { from },
                _ => CloseOutcome::AlreadyClosed,
            };
            tx.rollback().await?;
            return Ok(outcome);
        };

        sqlx::query(
            "UPDATE projects SET committed_html = latest.html, updated_at = NOW()
             FROM (
                SELECT html FROM generation_snapshots
                WHERE session_id = $1
                ORDER BY pass DESC
                LIMIT 1
             ) latest
             WHERE projects.id = $2",
        )
        .bind(id)
        .bind(project_id)
        .execute(&mut *tx)
        .await?;

        let refunded = if refund {
            return_charge(&mut tx, id).await?
        } else {
            None
        };

        tx.commit().await?;
        Ok(CloseOutcome::Closed { refunded })
    }

    /// Record that a reader received the snapshot of `pass`. Never moves back.
    pub async fn advance_cursor(
        pool: &PgPool,
        id: SessionId,
        pass: i32,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE generation_sessions SET
                delivery_cursor = GREATEST(delivery_cursor, $2),
                updated_at = NOW()
             WHERE id = $1",
        )
        .bind(id)
        .bind(pass)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Open INTERRUPTED sessions whose interruption predates `cutoff`.
    pub async fn list_stale_interrupted(
        pool: &PgPool,
        cutoff: Timestamp,
    ) -> Result<Vec<GenerationSessionRow>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM generation_sessions
             WHERE status = 'INTERRUPTED'
               AND closed_at IS NULL
               AND interrupted_at < $1
             ORDER BY interrupted_at ASC"
        );
        sqlx::query_as::<_, GenerationSessionRow>(&query)
            .bind(cutoff)
            .fetch_all(pool)
            .await
    }

    /// Move sessions left running by a previous process to INTERRUPTED.
    ///
    /// Returns the ids of the sessions that were moved.
    pub async fn interrupt_orphans(pool: &PgPool) -> Result<Vec<SessionId>, sqlx::Error> {
        sqlx::query_scalar::<_, SessionId>(
            "UPDATE generation_sessions SET
                status = 'INTERRUPTED',
                interrupted_at = NOW(),
                updated_at = NOW()
             WHERE closed_at IS NULL
               AND status IN ('PENDING', 'STREAMING', 'REFINING')
             RETURNING id",
        )
        .fetch_all(pool)
        .await
    }
}

fn sources(to: SessionStatus) -> Vec<&'static str> {
    SessionStatus::allowed_sources(to)
        .into_iter()
        .map(SessionStatus::as_str)
        .collect()
}

/// Why a guarded update touched no row.
async fn explain_miss(conn: &mut PgConnection, id: SessionId) -> Result<StatusWrite, sqlx::Error> {
    let current = sqlx::query_as::<_, (String, bool)>(
        "SELECT status, closed_at IS NOT NULL FROM generation_sessions WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(match current {
        Some((status, false)) => match SessionStatus::parse(&status) {
            Some(from) => StatusWrite::Rejected { from },
            None => StatusWrite::Closed,
        },
        _ => StatusWrite::Closed,
    })
}

/// Return a session's charge to its account, at most once.
async fn return_charge(conn: &mut PgConnection, id: SessionId) -> Result<Option<i32>, sqlx::Error> {
    let charge = sqlx::query_as::<_, (DbId, i32)>(
        "UPDATE generation_sessions SET refunded_at = NOW(), updated_at = NOW()
         WHERE id = $1 AND refunded_at IS NULL
         RETURNING account_id, credit_cost",
    )
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?;

    let Some((account_id, amount)) = charge else {
        return Ok(None);
    };

    sqlx::query(
        "UPDATE accounts SET credit_balance = credit_balance + $2, updated_at = NOW()
         WHERE id = $1",
    )
    .bind(account_id)
    .bind(amount)
    .execute(&mut *conn)
    .await?;

    sqlx::query(
        "INSERT INTO credit_ledger (account_id, delta, reason, session_id)
         VALUES ($1, $2, $3, $4)",
    )
    .bind(account_id)
    .bind(amount)
    .bind(LedgerReason::GenerationRefund.as_str())
    .bind(id)
    .execute(&mut *conn)
    .await?;

    Ok(Some(amount))
}
