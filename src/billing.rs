//! Billing provider events.
//!
//! Deliveries are at-least-once, unordered and may be duplicated. Duplicates
//! are absorbed by [`apply_once`]. Reordering is absorbed by `plan_changed_at`:
//! an event older than the last applied plan change is marked processed but
//! leaves the plan alone.

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgConnection, PgPool};
use tracing::{info, warn, Instrument};
use uuid::Uuid;

use crate::error::Error;
use crate::idempotency::{apply_once, ApplyOutcome};
use crate::quota::Plan;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingEvent {
    #[serde(rename = "id")]
    pub external_id: String,
    pub occurred_at: DateTime<Utc>,
    #[serde(rename = "data")]
    pub kind: BillingEventKind,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BillingEventKind {
    PlanChanged { account_id: Uuid, plan: Plan },
    SubscriptionCanceled { account_id: Uuid },
}

impl BillingEventKind {
    #[must_use]
    pub const fn account_id(&self) -> Uuid {
        match self {
            Self::PlanChanged { account_id, .. } | Self::SubscriptionCanceled { account_id } => {
                *account_id
            }
        }
    }

    /// Plan the account ends up on.
    #[must_use]
    pub const fn target_plan(&self) -> Plan {
        match self {
            Self::PlanChanged { plan, .. } => *plan,
            Self::SubscriptionCanceled { .. } => Plan::Free,
        }
    }
}

/// What applying a billing event did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BillingEffect {
    PlanUpdated(Plan),
    /// A newer plan change was already applied.
    Stale,
    /// The account is gone (purged). Nothing to update.
    AccountMissing,
}

impl BillingEvent {
    /// Decode a webhook payload.
    ///
    /// # Errors
    /// Returns [`Error::Invalid`] when the payload is not a known event.
    pub fn parse(payload: &[u8]) -> Result<Self, Error> {
        let event: Self = serde_json::from_slice(payload).map_err(|err| {
            warn!("rejected billing payload: {err}");
            Error::Invalid("malformed billing event")
        })?;
        if event.external_id.trim().is_empty() {
            return Err(Error::Invalid("billing event id is required"));
        }
        Ok(event)
    }
}

/// Apply a billing event exactly once.
///
/// # Errors
/// Returns [`Error::Store`] if the transaction fails.
pub async fn apply_billing_event(
    pool: &PgPool,
    event: &BillingEvent,
) -> Result<ApplyOutcome<BillingEffect>, Error> {
    let kind = event.kind;
    let occurred_at = event.occurred_at;
    let outcome = apply_once(pool, &event.external_id, move |conn| {
        Box::pin(set_plan(conn, kind.account_id(), kind.target_plan(), occurred_at))
    })
    .await?;

    if let ApplyOutcome::Applied(effect) = &outcome {
        info!(
            external_id = event.external_id.as_str(),
            account_id = %kind.account_id(),
            ?effect,
            "billing event applied"
        );
    }
    Ok(outcome)
}

/// Move the account to `plan` unless a newer change was already applied.
async fn set_plan(
    conn: &mut PgConnection,
    account_id: Uuid,
    plan: Plan,
    changed_at: DateTime<Utc>,
) -> anyhow::Result<BillingEffect> {
    let query = r"
        UPDATE accounts
        SET plan = $2, plan_changed_at = $3
        WHERE id = $1 AND (plan_changed_at IS NULL OR plan_changed_at < $3)
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    let updated = sqlx::query(query)
        .bind(account_id)
        .bind(plan.as_str())
        .bind(changed_at)
        .execute(&mut *conn)
        .instrument(span)
        .await
        .context("failed to update plan")?;
    if updated.rows_affected() == 1 {
        return Ok(BillingEffect::PlanUpdated(plan));
    }

    let query = "SELECT EXISTS (SELECT 1 FROM accounts WHERE id = $1)";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let exists: bool = sqlx::query_scalar(query)
        .bind(account_id)
        .fetch_one(&mut *conn)
        .instrument(span)
        .await
        .context("failed to look up account")?;

    if exists {
        Ok(BillingEffect::Stale)
    } else {
        warn!(%account_id, "billing event for unknown account");
        Ok(BillingEffect::AccountMissing)
    }
}
