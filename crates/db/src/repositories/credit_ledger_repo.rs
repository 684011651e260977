//! Repository for the append-only `credit_ledger` table.

use sqlx::PgPool;
use pagecraft_core::types::{DbId, SessionId};

use crate::models::credit_ledger::CreditLedgerEntry;

const COLUMNS: &str = "id, account_id, delta, reason, session_id, created_at";

pub struct CreditLedgerRepo;

impl CreditLedgerRepo {
    /// Most recent entries for an account, newest first.
    pub async fn list_recent(
        pool: &PgPool,
        account_id: DbId,
        limit: i64,
    ) -> Result<Vec<CreditLedgerEntry>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM credit_ledger
             WHERE account_id = $1
             ORDER BY created_at DESC, id DESC
             LIMIT $2"
        );
        sqlx::query_as::<_, CreditLedgerEntry>(&query)
            .bind(account_id)
            .bind(limit)
            .fetch_all(pool)
            .await
    }

    /// All entries recorded against a session, oldest first.
    pub async fn list_for_session(
        pool: &PgPool,
        session_id: SessionId,
    ) -> Result<Vec<CreditLedgerEntry>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM credit_ledger
             WHERE session_id = $1
             ORDER BY id ASC"
        );
        sqlx::query_as::<_, CreditLedgerEntry>(&query)
            .bind(session_id)
            .fetch_all(pool)
            .await
    }
}
