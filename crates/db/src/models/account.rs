use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use pagecraft_core::policy::Tier;
use pagecraft_core::types::{DbId, Timestamp};

/// A row from the `accounts` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Account {
    pub id: DbId,
    pub tier: String,
    pub credit_balance: i32,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Account {
    pub fn tier(&self) -> Tier {
        Tier::from_str_or_free(&self.tier)
    }
}

/// Input for creating an account.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateAccount {
    pub tier: Tier,
    pub credit_balance: i32,
}
