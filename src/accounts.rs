//! Account profile rows (email and billing plan).

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::Instrument;
use uuid::Uuid;

use crate::ledger::normalize_email;
use crate::quota::Plan;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Account {
    pub id: Uuid,
    pub email: String,
    pub plan: Plan,
    pub plan_changed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Insert an account and return its id.
///
/// # Errors
/// Returns an error if the email is already taken or the insert fails.
pub async fn create_account(pool: &PgPool, email: &str, plan: Plan) -> Result<Uuid> {
    let query = "INSERT INTO accounts (id, email, plan) VALUES ($1, $2, $3)";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    let id = Uuid::now_v7();
    sqlx::query(query)
        .bind(id)
        .bind(normalize_email(email))
        .bind(plan.as_str())
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to create account")?;
    Ok(id)
}

/// # Errors
/// Returns an error if the query fails or a stored plan is unknown.
pub async fn find_account(pool: &PgPool, account_id: Uuid) -> Result<Option<Account>> {
    let query = r"
        SELECT id, email, plan, plan_changed_at, created_at
        FROM accounts
        WHERE id = $1
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(account_id)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to load account")?;

    let Some(row) = row else {
        return Ok(None);
    };
    let plan: String = row.get("plan");
    Ok(Some(Account {
        id: row.get("id"),
        email: row.get("email"),
        plan: plan.parse()?,
        plan_changed_at: row.get("plan_changed_at"),
        created_at: row.get("created_at"),
    }))
}
