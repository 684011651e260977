use serde::Serialize;
use sqlx::FromRow;
use pagecraft_core::types::{DbId, SessionId, Timestamp};

/// An append-only row from the `credit_ledger` table.
///
/// `delta` is negative for charges and positive for refunds and grants.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct CreditLedgerEntry {
    pub id: DbId,
    pub account_id: DbId,
    pub delta: i32,
    pub reason: String,
    pub session_id: Option<SessionId>,
    pub created_at: Timestamp,
}
