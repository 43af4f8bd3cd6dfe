//! Exactly-once application of at-least-once external events.
//!
//! The external id is inserted into `processed_external_events` in the same
//! transaction as the effect. A redelivery hits the primary key, rolls back
//! and skips the effect. Concurrent deliveries of one id serialize on the
//! uncommitted key: the second insert waits for the first transaction and
//! then either conflicts (first committed) or proceeds (first rolled back).

use anyhow::Context;
use sqlx::{PgConnection, PgPool};
use tracing::{debug, info, warn, Instrument};

use crate::error::Error;
use crate::external::BoxFuture;
use crate::storage::is_unique_violation;

/// Result of [`apply_once`]. A duplicate is a success, not an error.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ApplyOutcome<T> {
    Applied(T),
    Duplicate,
}

impl<T> ApplyOutcome<T> {
    #[must_use]
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate)
    }

    #[must_use]
    pub fn applied(self) -> Option<T> {
        match self {
            Self::Applied(value) => Some(value),
            Self::Duplicate => None,
        }
    }
}

/// Apply `effect` at most once for `external_id`.
///
/// The effect runs on the transaction's connection and must do all of its
/// writes there. If it fails, the whole transaction (including the ledger
/// row) rolls back so a redelivery can try again.
///
/// # Errors
/// Returns [`Error::Invalid`] for an empty id, or [`Error::Store`] when the
/// effect or the transaction fails.
pub async fn apply_once<T, F>(
    pool: &PgPool,
    external_id: &str,
    effect: F,
) -> Result<ApplyOutcome<T>, Error>
where
    F: for<'c> FnOnce(&'c mut PgConnection) -> BoxFuture<'c, T>,
{
    if external_id.trim().is_empty() {
        return Err(Error::Invalid("external event id is required"));
    }

    let mut tx = pool
        .begin()
        .await
        .context("failed to begin external event transaction")?;

    let query = "INSERT INTO processed_external_events (external_id) VALUES ($1)";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    let inserted = sqlx::query(query)
        .bind(external_id)
        .execute(&mut *tx)
        .instrument(span)
        .await;

    match inserted {
        Ok(_) => {}
        Err(err) if is_unique_violation(&err) => {
            tx.rollback()
                .await
                .context("failed to roll back duplicate external event")?;
            debug!(external_id, "external event already processed");
            return Ok(ApplyOutcome::Duplicate);
        }
        Err(err) => {
            return Err(Error::Store(
                anyhow::Error::new(err).context("failed to record external event"),
            ));
        }
    }

    let value = match effect(&mut *tx).await {
        Ok(value) => value,
        Err(err) => {
            if let Err(rollback_err) = tx.rollback().await {
                warn!(external_id, "failed to roll back external event: {rollback_err}");
            }
            return Err(Error::Store(
                err.context(format!("external event {external_id} failed")),
            ));
        }
    };

    tx.commit()
        .await
        .context("failed to commit external event")?;
    info!(external_id, "external event applied");
    Ok(ApplyOutcome::Applied(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quota::Plan;
    use crate::testing::TestDb;
    use sqlx::Row;

    async fn bump(conn: &mut PgConnection, account_id: uuid::Uuid) -> anyhow::Result<i64> {
        let row = sqlx::query(
            r"
            INSERT INTO usage_counters (account_id, period, consumed_count)
            VALUES ($1, DATE '2026-01-01', 1)
            ON CONFLICT (account_id, period)
            DO UPDATE SET consumed_count = usage_counters.consumed_count + 1
            RETURNING consumed_count
            ",
        )
        .bind(account_id)
        .fetch_one(conn)
        .await?;
        Ok(row.get(0))
    }

    #[tokio::test]
    async fn sequential_duplicate_is_skipped() -> anyhow::Result<()> {
        let Some(db) = TestDb::start().await? else {
            return Ok(());
        };
        let account_id = db.insert_account("bea@example.com", Plan::Free).await?;

        let first = apply_once(&db.pool, "evt_1", move |conn| {
            Box::pin(bump(conn, account_id))
        })
        .await?;
        assert_eq!(first, ApplyOutcome::Applied(1));

        let second = apply_once(&db.pool, "evt_1", move |conn| {
            Box::pin(bump(conn, account_id))
        })
        .await?;
        assert!(second.is_duplicate());
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_duplicates_apply_once() -> anyhow::Result<()> {
        let Some(db) = TestDb::start().await? else {
            return Ok(());
        };
        let account_id = db.insert_account("cal@example.com", Plan::Free).await?;

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let pool = db.pool.clone();
            tasks.push(tokio::spawn(async move {
                apply_once(&pool, "evt_concurrent", move |conn| {
                    Box::pin(bump(conn, account_id))
                })
                .await
            }));
        }

        let mut applied = Vec::new();
        for task in tasks {
            if let Some(value) = task.await??.applied() {
                applied.push(value);
            }
        }
        assert_eq!(applied, vec![1]);
        Ok(())
    }

    #[tokio::test]
    async fn failed_effect_leaves_id_unprocessed() -> anyhow::Result<()> {
        let Some(db) = TestDb::start().await? else {
            return Ok(());
        };
        let account_id = db.insert_account("dee@example.com", Plan::Free).await?;

        let failed = apply_once(&db.pool, "evt_retry", |_conn| {
            Box::pin(async move { Err::<i64, _>(anyhow::anyhow!("downstream rejected")) })
        })
        .await;
        assert!(matches!(failed, Err(Error::Store(_))));

        let retried = apply_once(&db.pool, "evt_retry", move |conn| {
            Box::pin(bump(conn, account_id))
        })
        .await?;
        assert_eq!(retried, ApplyOutcome::Applied(1));
        Ok(())
    }

    #[tokio::test]
    async fn empty_id_is_rejected() -> anyhow::Result<()> {
        let Some(db) = TestDb::start().await? else {
            return Ok(());
        };
        let result = apply_once(&db.pool, " ", |_conn| Box::pin(async move { Ok(()) })).await;
        assert!(matches!(result, Err(Error::Invalid(_))));
        Ok(())
    }
}
