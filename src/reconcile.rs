//! Artifact reconciliation queue.
//!
//! Blob removal happens after the purge commits, so a failure there cannot
//! undo the purge. Failed references are queued in `artifact_reconciliation`
//! and a sweep retries them later. The sweep locks a due batch with
//! `FOR UPDATE SKIP LOCKED`, so any number of sweepers can run side by side
//! without processing the same row twice.
//!
//! Failures are retried with exponential backoff and jitter until
//! `max_attempts`, after which the row is marked `abandoned` for an operator.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rand::Rng;
use sqlx::{PgConnection, PgPool, Row};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::external::{ObjectRemoval, ObjectStorage};
use crate::policy::add;

/// Reason recorded for references whose post-purge removal failed.
pub const PURGE_REASON: &str = "purge_cleanup";

#[derive(Clone, Copy, Debug)]
pub struct ReconcileConfig {
    poll_interval: Duration,
    batch_size: usize,
    max_attempts: u32,
    backoff_base: Duration,
    backoff_max: Duration,
}

impl ReconcileConfig {
    /// Defaults: 30s poll interval, batch size 100, 8 attempts,
    /// 30s->1h exponential backoff with jitter.
    #[must_use]
    pub fn new() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            batch_size: 100,
            max_attempts: 8,
            backoff_base: Duration::from_secs(30),
            backoff_max: Duration::from_secs(3600),
        }
    }

    #[must_use]
    pub fn with_poll_interval_seconds(mut self, seconds: u64) -> Self {
        self.poll_interval = Duration::from_secs(seconds);
        self
    }

    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    #[must_use]
    pub fn with_backoff_base_seconds(mut self, seconds: u64) -> Self {
        self.backoff_base = Duration::from_secs(seconds);
        self
    }

    #[must_use]
    pub fn with_backoff_max_seconds(mut self, seconds: u64) -> Self {
        self.backoff_max = Duration::from_secs(seconds);
        self
    }

    #[must_use]
    pub fn normalize(self) -> Self {
        let poll_interval = if self.poll_interval.is_zero() {
            Duration::from_secs(1)
        } else {
            self.poll_interval
        };
        let backoff_base = if self.backoff_base.is_zero() {
            Duration::from_secs(1)
        } else {
            self.backoff_base
        };
        Self {
            poll_interval,
            batch_size: self.batch_size.max(1),
            max_attempts: self.max_attempts.max(1),
            backoff_base,
            backoff_max: self.backoff_max.max(backoff_base),
        }
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    #[must_use]
    pub fn backoff_base(&self) -> Duration {
        self.backoff_base
    }

    #[must_use]
    pub fn backoff_max(&self) -> Duration {
        self.backoff_max
    }
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Queue references for removal, due immediately.
///
/// # Errors
/// Returns an error if the insert fails.
pub async fn enqueue_in(
    conn: &mut PgConnection,
    refs: &[String],
    reason: &str,
    now: DateTime<Utc>,
) -> Result<u64> {
    if refs.is_empty() {
        return Ok(0);
    }
    let query = r"
        INSERT INTO artifact_reconciliation (reference, reason, next_attempt_at, created_at)
        SELECT reference, $2, $3, $3
        FROM unnest($1::text[]) AS reference
    ";
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    let result = sqlx::query(query)
        .bind(refs)
        .bind(reason)
        .bind(now)
        .execute(conn)
        .instrument(span)
        .await
        .context("failed to enqueue artifacts for reconciliation")?;
    Ok(result.rows_affected())
}

/// # Errors
/// Returns an error if the insert fails.
pub async fn enqueue(
    pool: &PgPool,
    refs: &[String],
    reason: &str,
    now: DateTime<Utc>,
) -> Result<u64> {
    let mut conn = pool
        .acquire()
        .await
        .context("failed to acquire connection")?;
    enqueue_in(&mut *conn, refs, reason, now).await
}

/// Queue the failed entries of a removal report. Returns the queued references.
///
/// # Errors
/// Returns an error if the insert fails.
pub async fn enqueue_failures(
    pool: &PgPool,
    removals: &[ObjectRemoval],
    reason: &str,
    now: DateTime<Utc>,
) -> Result<Vec<String>> {
    let failed: Vec<String> = removals
        .iter()
        .filter(|removal| !removal.is_removed())
        .map(|removal| removal.reference.clone())
        .collect();
    enqueue(pool, &failed, reason, now).await?;
    Ok(failed)
}

/// Rows still waiting for a removal attempt.
///
/// # Errors
/// Returns an error if the query fails.
pub async fn pending_count(pool: &PgPool) -> Result<i64> {
    let query = "SELECT COUNT(*) FROM artifact_reconciliation WHERE status = 'pending'";
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let count: i64 = sqlx::query_scalar(query)
        .fetch_one(pool)
        .instrument(span)
        .await
        .context("failed to count pending reconciliation rows")?;
    Ok(count)
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub claimed: usize,
    pub removed: usize,
    pub rescheduled: usize,
    pub abandoned: usize,
}

/// Spawn a background task that sweeps the reconciliation queue.
pub fn spawn_reconciliation_worker(
    pool: PgPool,
    storage: Arc<dyn ObjectStorage>,
    config: ReconcileConfig,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let config = config.normalize();
        let poll_interval = config.poll_interval();

        loop {
            match sweep_batch(&pool, storage.as_ref(), &config, Utc::now()).await {
                Ok(report) if report.claimed > 0 => {
                    info!(
                        claimed = report.claimed,
                        removed = report.removed,
                        rescheduled = report.rescheduled,
                        abandoned = report.abandoned,
                        "reconciliation sweep"
                    );
                }
                Ok(_) => {}
                Err(err) => error!("reconciliation sweep failed: {err:#}"),
            }

            sleep(poll_interval).await;
        }
    })
}

/// Claim one due batch, try to remove its objects and record the outcome.
///
/// # Errors
/// Returns an error if the queue cannot be read or updated. Object storage
/// failures are not errors; they reschedule the affected rows.
pub async fn sweep_batch(
    pool: &PgPool,
    storage: &dyn ObjectStorage,
    config: &ReconcileConfig,
    now: DateTime<Utc>,
) -> Result<SweepReport> {
    let config = &config.normalize();
    let mut tx = pool
        .begin()
        .await
        .context("failed to start reconciliation transaction")?;

    let query = r"
        SELECT id, reference, attempts
        FROM artifact_reconciliation
        WHERE status = 'pending'
          AND next_attempt_at <= $2
        ORDER BY next_attempt_at ASC, created_at ASC
        LIMIT $1
        FOR UPDATE SKIP LOCKED
    ";
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let rows = sqlx::query(query)
        .bind(i64::try_from(config.batch_size()).unwrap_or(i64::MAX))
        .bind(now)
        .fetch_all(&mut *tx)
        .instrument(span)
        .await
        .context("failed to load reconciliation batch")?;

    if rows.is_empty() {
        tx.commit()
            .await
            .context("failed to commit empty reconciliation batch")?;
        return Ok(SweepReport::default());
    }

    let refs: Vec<String> = rows.iter().map(|row| row.get("reference")).collect();
    let removals = match storage.remove_objects(&refs).await {
        Ok(removals) => removals,
        Err(err) => {
            warn!("object storage unavailable during sweep: {err:#}");
            let reason = format!("{err:#}");
            refs.iter()
                .map(|reference| ObjectRemoval::failed(reference.as_str(), reason.as_str()))
                .collect()
        }
    };

    let mut report = SweepReport {
        claimed: rows.len(),
        ..SweepReport::default()
    };
    for row in rows {
        let id: Uuid = row.get("id");
        let reference: String = row.get("reference");
        let attempts: i32 = row.get("attempts");
        let attempts = u32::try_from(attempts).unwrap_or(0);

        let result = removals
            .iter()
            .find(|removal| removal.reference == reference)
            .map_or_else(
                || Err("no result reported for reference".to_string()),
                |removal| removal.result.clone(),
            );
        match update_status(&mut *tx, id, attempts, result, config, now).await? {
            RowOutcome::Removed => report.removed += 1,
            RowOutcome::Rescheduled => report.rescheduled += 1,
            RowOutcome::Abandoned => {
                warn!(%id, reference = %reference, "artifact reconciliation abandoned");
                report.abandoned += 1;
            }
        }
    }

    tx.commit()
        .await
        .context("failed to commit reconciliation batch")?;

    Ok(report)
}

enum RowOutcome {
    Removed,
    Rescheduled,
    Abandoned,
}

async fn update_status(
    conn: &mut PgConnection,
    id: Uuid,
    attempts: u32,
    result: Result<(), String>,
    config: &ReconcileConfig,
    now: DateTime<Utc>,
) -> Result<RowOutcome> {
    let next_attempt = attempts.saturating_add(1);
    let next_attempts_i32 = i32::try_from(next_attempt).unwrap_or(i32::MAX);

    let Err(reason) = result else {
        let query = "DELETE FROM artifact_reconciliation WHERE id = $1";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "DELETE",
            db.statement = query
        );
        sqlx::query(query)
            .bind(id)
            .execute(&mut *conn)
            .instrument(span)
            .await
            .context("failed to clear reconciled artifact")?;
        return Ok(RowOutcome::Removed);
    };

    if next_attempt >= config.max_attempts() {
        let query = r"
            UPDATE artifact_reconciliation
            SET status = 'abandoned',
                attempts = $2,
                last_error = $3
            WHERE id = $1
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        sqlx::query(query)
            .bind(id)
            .bind(next_attempts_i32)
            .bind(&reason)
            .execute(&mut *conn)
            .instrument(span)
            .await
            .context("failed to abandon artifact reconciliation")?;
        return Ok(RowOutcome::Abandoned);
    }

    let delay = backoff_delay(next_attempt, config.backoff_base(), config.backoff_max());
    let query = r"
        UPDATE artifact_reconciliation
        SET attempts = $2,
            last_error = $3,
            next_attempt_at = $4
        WHERE id = $1
    ";
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(id)
        .bind(next_attempts_i32)
        .bind(&reason)
        .bind(add(now, delay))
        .execute(&mut *conn)
        .instrument(span)
        .await
        .context("failed to reschedule artifact reconciliation")?;
    Ok(RowOutcome::Rescheduled)
}

fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let shift = attempt.saturating_sub(1).min(31);
    let factor = 1u32 << shift;
    let delay = base.checked_mul(factor).unwrap_or(max);
    jitter_delay(delay.min(max))
}

fn jitter_delay(delay: Duration) -> Duration {
    let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
    if delay_ms < 2 {
        return delay;
    }
    let half = delay_ms / 2;
    let jitter = rand::thread_rng().gen_range(0..=half);
    Duration::from_millis(half + jitter)
}
