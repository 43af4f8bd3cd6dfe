//! Atomic account purge.
//!
//! One transaction removes every first-party row of an account and records the
//! deletion in the ledger. Blob references are collected inside it and handed
//! back; removing the blobs is the caller's job once the transaction has
//! committed (see [`crate::AccountLifecycle::erase_account`]).

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool};
use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use tracing::{error, info, Instrument};
use uuid::Uuid;

use crate::error::Error;
use crate::ledger::{append_in, AuthEvent, AuthEventKind};
use crate::reconcile;

const DEFAULT_MAX_ARTIFACTS_IN_TRANSACTION: i64 = 1_000;
const DEFAULT_DRAIN_BATCH_SIZE: i64 = 500;

/// Reconciliation reason for references moved out ahead of a purge.
pub const DRAIN_REASON: &str = "purge_drain";

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EntityKind {
    Uploads,
    UsageCounters,
    AuthEvents,
    Accounts,
}

impl EntityKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Uploads => "uploads",
            Self::UsageCounters => "usage_counters",
            Self::AuthEvents => "auth_events",
            Self::Accounts => "accounts",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PurgeResult {
    pub account_id: Uuid,
    /// Blob references to remove after commit.
    pub artifact_refs: Vec<String>,
    pub deleted_counts: BTreeMap<EntityKind, u64>,
    /// Ledger id of the `account_deleted` event written in the transaction.
    pub deletion_event_id: Uuid,
}

impl PurgeResult {
    #[must_use]
    pub fn deleted(&self, kind: EntityKind) -> u64 {
        self.deleted_counts.get(&kind).copied().unwrap_or(0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PurgeConfig {
    max_artifacts_in_transaction: i64,
    drain_batch_size: i64,
}

impl PurgeConfig {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_artifacts_in_transaction: DEFAULT_MAX_ARTIFACTS_IN_TRANSACTION,
            drain_batch_size: DEFAULT_DRAIN_BATCH_SIZE,
        }
    }

    /// Largest artifact set the core transaction handles on its own. Larger
    /// sets are drained in batches first.
    #[must_use]
    pub fn with_max_artifacts_in_transaction(mut self, max: i64) -> Self {
        self.max_artifacts_in_transaction = max;
        self
    }

    #[must_use]
    pub fn with_drain_batch_size(mut self, size: i64) -> Self {
        self.drain_batch_size = size;
        self
    }

    #[must_use]
    pub fn normalize(self) -> Self {
        Self {
            max_artifacts_in_transaction: self.max_artifacts_in_transaction.max(0),
            drain_batch_size: self.drain_batch_size.max(1),
        }
    }

    #[must_use]
    pub const fn max_artifacts_in_transaction(&self) -> i64 {
        self.max_artifacts_in_transaction
    }

    #[must_use]
    pub const fn drain_batch_size(&self) -> i64 {
        self.drain_batch_size
    }
}

impl Default for PurgeConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Remove the account and everything tied to it, all or nothing.
///
/// The `account_deleted` ledger event is written inside the same transaction,
/// so a purge without its audit record cannot commit.
///
/// # Errors
/// Returns [`Error::AccountNotFound`] when there is nothing to purge, or
/// [`Error::PurgeFailed`] when any step fails. No partial state is left behind.
pub async fn purge_account(
    pool: &PgPool,
    account_id: Uuid,
    origin: IpAddr,
    now: DateTime<Utc>,
) -> Result<PurgeResult, Error> {
    let mut tx = pool
        .begin()
        .await
        .map_err(|err| purge_failed(account_id, &anyhow::Error::new(err)))?;

    let result = match purge_in(&mut *tx, account_id, origin, now).await {
        Ok(Some(result)) => result,
        Ok(None) => {
            tx.rollback()
                .await
                .map_err(|err| purge_failed(account_id, &anyhow::Error::new(err)))?;
            return Err(Error::AccountNotFound(account_id));
        }
        Err(err) => {
            if let Err(rollback_err) = tx.rollback().await {
                error!(%account_id, "failed to roll back purge: {rollback_err}");
            }
            return Err(purge_failed(account_id, &err));
        }
    };

    tx.commit()
        .await
        .map_err(|err| purge_failed(account_id, &anyhow::Error::new(err)))?;

    info!(
        %account_id,
        artifacts = result.artifact_refs.len(),
        uploads = result.deleted(EntityKind::Uploads),
        auth_events = result.deleted(EntityKind::AuthEvents),
        "account purged"
    );
    Ok(result)
}

fn purge_failed(account_id: Uuid, err: &anyhow::Error) -> Error {
    error!(%account_id, "account purge failed: {err:#}");
    Error::PurgeFailed(format!("{err:#}"))
}

async fn purge_in(
    conn: &mut PgConnection,
    account_id: Uuid,
    origin: IpAddr,
    now: DateTime<Utc>,
) -> Result<Option<PurgeResult>> {
    let query = "SELECT email FROM accounts WHERE id = $1 FOR UPDATE";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let email: Option<String> = sqlx::query_scalar(query)
        .bind(account_id)
        .fetch_optional(&mut *conn)
        .instrument(span)
        .await
        .context("failed to lock account")?;
    let Some(email) = email else {
        return Ok(None);
    };

    let mut deleted_counts = BTreeMap::new();

    let query = "DELETE FROM uploads WHERE account_id = $1 RETURNING storage_path";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "DELETE",
        db.statement = query
    );
    let artifact_refs: Vec<String> = sqlx::query_scalar(query)
        .bind(account_id)
        .fetch_all(&mut *conn)
        .instrument(span)
        .await
        .context("failed to delete uploads")?;
    deleted_counts.insert(EntityKind::Uploads, artifact_refs.len() as u64);

    let query = "DELETE FROM usage_counters WHERE account_id = $1";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "DELETE",
        db.statement = query
    );
    let counters = sqlx::query(query)
        .bind(account_id)
        .execute(&mut *conn)
        .instrument(span)
        .await
        .context("failed to delete usage counters")?;
    deleted_counts.insert(EntityKind::UsageCounters, counters.rows_affected());

    let query = r"
        DELETE FROM auth_events
        WHERE account_id = $1 OR subject = $2 OR subject = $1::text
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "DELETE",
        db.statement = query
    );
    let events = sqlx::query(query)
        .bind(account_id)
        .bind(&email)
        .execute(&mut *conn)
        .instrument(span)
        .await
        .context("failed to delete auth events")?;
    deleted_counts.insert(EntityKind::AuthEvents, events.rows_affected());

    let query = "DELETE FROM accounts WHERE id = $1";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "DELETE",
        db.statement = query
    );
    let accounts = sqlx::query(query)
        .bind(account_id)
        .execute(&mut *conn)
        .instrument(span)
        .await
        .context("failed to delete account")?;
    deleted_counts.insert(EntityKind::Accounts, accounts.rows_affected());

    // The record outlives the account, so it carries the id only as metadata.
    let counts: serde_json::Map<String, serde_json::Value> = deleted_counts
        .iter()
        .map(|(kind, count)| (kind.as_str().to_string(), serde_json::Value::from(*count)))
        .collect();
    let deletion = AuthEvent::new(AuthEventKind::AccountDeleted, origin, now)
        .with_metadata("account_id", account_id.to_string())
        .with_metadata("deleted", counts);
    let deletion_event_id = append_in(&mut *conn, &deletion)
        .await
        .context("failed to record account deletion")?;

    Ok(Some(PurgeResult {
        account_id,
        artifact_refs,
        deleted_counts,
        deletion_event_id,
    }))
}

/// Number of blob references an account currently holds.
///
/// # Errors
/// Returns an error if the query fails.
pub async fn count_artifacts(pool: &PgPool, account_id: Uuid) -> Result<i64> {
    let query = "SELECT COUNT(*) FROM uploads WHERE account_id = $1";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let count: i64 = sqlx::query_scalar(query)
        .bind(account_id)
        .fetch_one(pool)
        .instrument(span)
        .await
        .context("failed to count artifacts")?;
    Ok(count)
}

/// Move upload rows into the reconciliation queue in bounded batches until at
/// most `max_artifacts_in_transaction` remain. Each batch commits on its own.
/// Returns the number of references moved.
///
/// # Errors
/// Returns an error if a batch fails. Batches already committed stay moved.
pub async fn drain_artifacts(
    pool: &PgPool,
    account_id: Uuid,
    config: PurgeConfig,
    now: DateTime<Utc>,
) -> Result<u64> {
    let config = config.normalize();
    let mut moved = 0_u64;

    while count_artifacts(pool, account_id).await? > config.max_artifacts_in_transaction() {
        let mut tx = pool
            .begin()
            .await
            .context("failed to begin drain batch")?;

        let query = r"
            DELETE FROM uploads
            WHERE id IN (
                SELECT id FROM uploads
                WHERE account_id = $1
                ORDER BY created_at
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING storage_path
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "DELETE",
            db.statement = query
        );
        let refs: Vec<String> = sqlx::query_scalar(query)
            .bind(account_id)
            .bind(config.drain_batch_size())
            .fetch_all(&mut *tx)
            .instrument(span)
            .await
            .context("failed to drain uploads")?;

        if refs.is_empty() {
            tx.rollback()
                .await
                .context("failed to roll back empty drain batch")?;
            break;
        }

        reconcile::enqueue_in(&mut *tx, &refs, DRAIN_REASON, now).await?;
        tx.commit().await.context("failed to commit drain batch")?;
        moved += refs.len() as u64;
    }

    if moved > 0 {
        info!(%account_id, moved, "artifacts drained ahead of purge");
    }
    Ok(moved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{EventLedger, PgEventLedger};
    use crate::quota::{record_upload, Plan};
    use crate::testing::TestDb;
    use std::net::Ipv4Addr;

    fn origin() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(198, 51, 100, 200))
    }

    async fn seed(db: &TestDb, email: &str, uploads: usize) -> anyhow::Result<Uuid> {
        let account_id = db.insert_account(email, Plan::Pro).await?;
        let now = Utc::now();
        for n in 0..uploads {
            record_upload(&db.pool, account_id, &format!("{account_id}/{n}.jpg"), 100, now)
                .await?;
        }
        let ledger = PgEventLedger::new(db.pool.clone());
        let login = AuthEvent::new(AuthEventKind::LoginSuccess, origin(), now)
            .with_account_id(account_id)
            .with_email(email);
        ledger.append(&login).await?;
        let failure = AuthEvent::new(AuthEventKind::LoginFailure, origin(), now).with_email(email);
        ledger.append(&failure).await?;
        Ok(account_id)
    }

    async fn remaining(db: &TestDb, account_id: Uuid) -> anyhow::Result<[i64; 4]> {
        Ok([
            db.count_rows("accounts", account_id).await?,
            db.count_rows("uploads", account_id).await?,
            db.count_rows("usage_counters", account_id).await?,
            db.count_rows("auth_events", account_id).await?,
        ])
    }

    #[tokio::test]
    async fn purge_removes_everything_and_returns_refs() -> anyhow::Result<()> {
        let Some(db) = TestDb::start().await? else {
            return Ok(());
        };
        let account_id = seed(&db, "gus@example.com", 3).await?;
        let bystander = seed(&db, "hana@example.com", 1).await?;

        let result = purge_account(&db.pool, account_id, origin(), Utc::now()).await?;
        assert_eq!(result.artifact_refs.len(), 3);
        assert_eq!(result.deleted(EntityKind::Uploads), 3);
        assert_eq!(result.deleted(EntityKind::UsageCounters), 1);
        assert_eq!(result.deleted(EntityKind::AuthEvents), 2);
        assert_eq!(result.deleted(EntityKind::Accounts), 1);
        assert_eq!(remaining(&db, account_id).await?, [0, 0, 0, 0]);
        assert_eq!(remaining(&db, bystander).await?, [1, 1, 1, 1]);

        let recorded: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM auth_events WHERE event_type = 'account_deleted' AND metadata->>'account_id' = $1",
        )
        .bind(account_id.to_string())
        .fetch_one(&db.pool)
        .await?;
        assert_eq!(recorded, 1);
        Ok(())
    }

    #[tokio::test]
    async fn purge_of_unknown_account_is_not_found() -> anyhow::Result<()> {
        let Some(db) = TestDb::start().await? else {
            return Ok(());
        };
        let missing = Uuid::now_v7();
        let result = purge_account(&db.pool, missing, origin(), Utc::now()).await;
        assert!(matches!(result, Err(Error::AccountNotFound(id)) if id == missing));
        Ok(())
    }

    #[tokio::test]
    async fn purge_is_all_or_nothing_under_injected_failure() -> anyhow::Result<()> {
        let Some(db) = TestDb::start().await? else {
            return Ok(());
        };
        sqlx::raw_sql(
            r"
            CREATE FUNCTION fail_purge_step() RETURNS trigger AS $$
            BEGIN
                RAISE EXCEPTION 'injected failure on %', TG_TABLE_NAME;
            END;
            $$ LANGUAGE plpgsql;
            ",
        )
        .execute(&db.pool)
        .await?;

        let steps = [
            ("uploads", "DELETE"),
            ("usage_counters", "DELETE"),
            ("auth_events", "DELETE"),
            ("accounts", "DELETE"),
            ("auth_events", "INSERT"),
        ];
        for (n, (table, operation)) in steps.into_iter().enumerate() {
            let account_id = seed(&db, &format!("step{n}@example.com"), 2).await?;
            let before = remaining(&db, account_id).await?;

            sqlx::raw_sql(&format!(
                "CREATE TRIGGER inject_failure BEFORE {operation} ON {table} \
                 FOR EACH ROW EXECUTE FUNCTION fail_purge_step()"
            ))
            .execute(&db.pool)
            .await?;

            let result = purge_account(&db.pool, account_id, origin(), Utc::now()).await;
            assert!(
                matches!(result, Err(Error::PurgeFailed(_))),
                "expected failure at {operation} {table}"
            );

            sqlx::raw_sql(&format!("DROP TRIGGER inject_failure ON {table}"))
                .execute(&db.pool)
                .await?;
            assert_eq!(remaining(&db, account_id).await?, before, "{operation} {table}");
        }
        Ok(())
    }

    #[tokio::test]
    async fn drain_moves_batches_until_bounded() -> anyhow::Result<()> {
        let Some(db) = TestDb::start().await? else {
            return Ok(());
        };
        let account_id = seed(&db, "ida@example.com", 7).await?;
        let config = PurgeConfig::new()
            .with_max_artifacts_in_transaction(2)
            .with_drain_batch_size(3);

        let moved = drain_artifacts(&db.pool, account_id, config, Utc::now()).await?;
        assert_eq!(moved, 6);
        assert_eq!(count_artifacts(&db.pool, account_id).await?, 1);

        let queued: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM artifact_reconciliation WHERE reason = $1",
        )
        .bind(DRAIN_REASON)
        .fetch_one(&db.pool)
        .await?;
        assert_eq!(queued, 6);
        Ok(())
    }

    #[test]
    fn config_normalizes() {
        let config = PurgeConfig::new()
            .with_max_artifacts_in_transaction(-5)
            .with_drain_batch_size(0)
            .normalize();
        assert_eq!(config.max_artifacts_in_transaction(), 0);
        assert_eq!(config.drain_batch_size(), 1);
    }
}
