use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgConnection, PgPool, Row};
use tracing::Instrument;
use uuid::Uuid;

use super::{AuthEvent, AuthEventKind, EventLedger};
use crate::external::BoxFuture;
use crate::policy::Scope;

const INSERT_EVENT: &str = r"
    INSERT INTO auth_events
        (id, event_type, account_id, email, subject, origin_address, user_agent, metadata, created_at)
    VALUES ($1, $2, $3, $4, $5, $6::inet, $7, $8, $9)
";

/// `PostgreSQL` ledger shared by every service instance.
#[derive(Clone, Debug)]
pub struct PgEventLedger {
    pool: PgPool,
}

impl PgEventLedger {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Delete events created at or before `cutoff`. Returns the number removed.
    ///
    /// # Errors
    /// Returns an error if the delete fails.
    pub async fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let query = "DELETE FROM auth_events WHERE created_at <= $1";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "DELETE",
            db.statement = query
        );
        let result = sqlx::query(query)
            .bind(cutoff)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to prune auth events")?;
        Ok(result.rows_affected())
    }

    async fn count(
        &self,
        scope: Scope,
        identifier: &str,
        kind: AuthEventKind,
        since: DateTime<Utc>,
    ) -> Result<i64> {
        let query = match scope {
            Scope::Account => {
                "SELECT COUNT(*) FROM auth_events WHERE subject = $1 AND event_type = $2 AND created_at > $3"
            }
            Scope::Origin => {
                "SELECT COUNT(*) FROM auth_events WHERE origin_address = $1::inet AND event_type = $2 AND created_at > $3"
            }
        };
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(identifier)
            .bind(kind.as_str())
            .bind(since)
            .fetch_one(&self.pool)
            .instrument(span)
            .await
            .with_context(|| format!("failed to count {kind} events for {scope}"))?;
        Ok(row.get(0))
    }

    async fn latest(
        &self,
        scope: Scope,
        identifier: &str,
        kind: AuthEventKind,
        since: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        let query = match scope {
            Scope::Account => {
                "SELECT MAX(created_at) FROM auth_events WHERE subject = $1 AND event_type = $2 AND created_at > $3"
            }
            Scope::Origin => {
                "SELECT MAX(created_at) FROM auth_events WHERE origin_address = $1::inet AND event_type = $2 AND created_at > $3"
            }
        };
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(identifier)
            .bind(kind.as_str())
            .bind(since)
            .fetch_one(&self.pool)
            .instrument(span)
            .await
            .with_context(|| format!("failed to read latest {kind} event for {scope}"))?;
        Ok(row.get(0))
    }
}

impl EventLedger for PgEventLedger {
    fn append<'a>(&'a self, event: &'a AuthEvent) -> BoxFuture<'a, Uuid> {
        Box::pin(async move {
            let mut conn = self
                .pool
                .acquire()
                .await
                .context("failed to acquire ledger connection")?;
            append_in(&mut *conn, event).await
        })
    }

    fn count_since<'a>(
        &'a self,
        scope: Scope,
        identifier: &'a str,
        kind: AuthEventKind,
        since: DateTime<Utc>,
    ) -> BoxFuture<'a, i64> {
        Box::pin(self.count(scope, identifier, kind, since))
    }

    fn latest_since<'a>(
        &'a self,
        scope: Scope,
        identifier: &'a str,
        kind: AuthEventKind,
        since: DateTime<Utc>,
    ) -> BoxFuture<'a, Option<DateTime<Utc>>> {
        Box::pin(self.latest(scope, identifier, kind, since))
    }
}

/// Append an event on an existing connection, typically inside a larger
/// transaction so the event commits or rolls back with it.
///
/// # Errors
/// Returns an error if the event is malformed or the insert fails.
pub async fn append_in(conn: &mut PgConnection, event: &AuthEvent) -> Result<Uuid> {
    event.validate().map_err(anyhow::Error::msg)?;

    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = INSERT_EVENT
    );
    sqlx::query(INSERT_EVENT)
        .bind(event.id)
        .bind(event.kind.as_str())
        .bind(event.account_id)
        .bind(event.email.as_deref())
        .bind(event.subject())
        .bind(event.origin.to_string())
        .bind(event.user_agent.as_deref())
        .bind(Value::Object(event.metadata.clone()))
        .bind(event.created_at)
        .execute(conn)
        .instrument(span)
        .await
        .with_context(|| format!("failed to append {} event", event.kind))?;

    Ok(event.id)
}
