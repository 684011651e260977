//! Repository for the `accounts` table.

use sqlx::PgPool;
use pagecraft_core::policy::LedgerReason;
use pagecraft_core::types::DbId;

use crate::models::account::{Account, CreateAccount};

const COLUMNS: &str = "id, tier, credit_balance, created_at, updated_at";

pub struct AccountRepo;

impl AccountRepo {
    pub async fn create(pool: &PgPool, input: &CreateAccount) -> Result<Account, sqlx::Error> {
        let query = format!(
            "INSERT INTO accounts (tier, credit_balance)
             VALUES ($1, $2)
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Account>(&query)
            .bind(input.tier.as_str())
            .bind(input.credit_balance)
            .fetch_one(pool)
            .await
    }

    pub async fn find_by_id(pool: &PgPool, id: DbId) -> Result<Option<Account>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM accounts WHERE id = $1");
        sqlx::query_as::<_, Account>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// Current credit balance, or `None` if the account does not exist.
    pub async fn balance(pool: &PgPool, id: DbId) -> Result<Option<i32>, sqlx::Error> {
        sqlx::query_scalar::<_, i32>("SELECT credit_balance FROM accounts WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// Add credits and record a `grant` ledger entry in one transaction.
    ///
    /// Returns the new balance, or `None` if the account does not exist.
    pub async fn grant(pool: &PgPool, id: DbId, amount: i32) -> Result<Option<i32>, sqlx::Error> {
        let mut tx = pool.begin().await?;

        let balance = sqlx::query_scalar::<_, i32>(
            "UPDATE accounts SET credit_balance = credit_balance + $2, updated_at = NOW()
             WHERE id = $1
             RETURNING credit_balance",
        )
        .bind(id)
        .bind(amount)
        .fetch_optional(&mut *tx)
        .await?;

        if balance.is_none() {
            return Ok(None);
        }

        sqlx::query("INSERT INTO credit_ledger (account_id, delta, reason) VALUES ($1, $2, $3)")
            .bind(id)
            .bind(amount)
            .bind(LedgerReason::Grant.as_str())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(balance)
    }
}
