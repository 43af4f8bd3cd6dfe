//! Shared sliding-window counter service.
//!
//! The Postgres implementation keeps one row per admitted hit. Each check runs
//! in its own short transaction under a transaction-scoped advisory lock on the
//! key, so concurrent checks for the same key serialize across every instance
//! while checks for different keys proceed in parallel.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use std::time::Duration;
use tracing::Instrument;

use crate::external::BoxFuture;
use crate::policy::{add, subtract};

/// Result of one sliding-window check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WindowVerdict {
    pub allowed: bool,
    /// Hits still available in the current window after this check.
    pub remaining: u32,
    /// When the oldest counted hit leaves the window.
    pub reset_at: DateTime<Utc>,
}

pub trait CounterService: Send + Sync {
    /// Record a hit for `key` if fewer than `capacity` hits fall inside the
    /// trailing `window` ending at `now`. Denied checks are not recorded.
    fn sliding_window_check<'a>(
        &'a self,
        key: &'a str,
        capacity: u32,
        window: Duration,
        now: DateTime<Utc>,
    ) -> BoxFuture<'a, WindowVerdict>;
}

/// Verdict for a window holding `hits` (oldest first) before this check.
pub(crate) fn verdict(
    hits: usize,
    oldest: Option<DateTime<Utc>>,
    capacity: u32,
    window: Duration,
    now: DateTime<Utc>,
) -> WindowVerdict {
    let capacity = usize::try_from(capacity).unwrap_or(usize::MAX);
    let allowed = hits < capacity;
    let used = if allowed { hits + 1 } else { hits };
    let remaining = u32::try_from(capacity.saturating_sub(used)).unwrap_or(u32::MAX);
    WindowVerdict {
        allowed,
        remaining,
        reset_at: add(oldest.unwrap_or(now), window),
    }
}

#[derive(Clone, Debug)]
pub struct PgCounterService {
    pool: PgPool,
}

impl PgCounterService {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Drop hits older than `before` for every key.
    ///
    /// # Errors
    /// Returns an error if the delete fails.
    pub async fn prune_expired(&self, before: DateTime<Utc>) -> Result<u64> {
        let query = "DELETE FROM throttle_hits WHERE hit_at <= $1";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "DELETE",
            db.statement = query
        );
        let result = sqlx::query(query)
            .bind(before)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to prune throttle hits")?;
        Ok(result.rows_affected())
    }

    async fn check(
        &self,
        key: &str,
        capacity: u32,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<WindowVerdict> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to begin throttle transaction")?;

        let lock_query = "SELECT pg_advisory_xact_lock(hashtextextended($1, 0))";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = lock_query
        );
        sqlx::query(lock_query)
            .bind(key)
            .execute(&mut *tx)
            .instrument(span)
            .await
            .context("failed to acquire throttle key lock")?;

        let expire_query = "DELETE FROM throttle_hits WHERE key = $1 AND hit_at <= $2";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "DELETE",
            db.statement = expire_query
        );
        sqlx::query(expire_query)
            .bind(key)
            .bind(subtract(now, window))
            .execute(&mut *tx)
            .instrument(span)
            .await
            .context("failed to expire throttle hits")?;

        let count_query =
            "SELECT COUNT(*) AS hits, MIN(hit_at) AS oldest FROM throttle_hits WHERE key = $1";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = count_query
        );
        let row = sqlx::query(count_query)
            .bind(key)
            .fetch_one(&mut *tx)
            .instrument(span)
            .await
            .context("failed to count throttle hits")?;
        let hits: i64 = row.get("hits");
        let oldest: Option<DateTime<Utc>> = row.get("oldest");

        let verdict = verdict(
            usize::try_from(hits).unwrap_or(usize::MAX),
            oldest,
            capacity,
            window,
            now,
        );

        if verdict.allowed {
            let insert_query = "INSERT INTO throttle_hits (key, hit_at) VALUES ($1, $2)";
            let span = tracing::info_span!(
                "db.query",
                db.system = "postgresql",
                db.operation = "INSERT",
                db.statement = insert_query
            );
            sqlx::query(insert_query)
                .bind(key)
                .bind(now)
                .execute(&mut *tx)
                .instrument(span)
                .await
                .context("failed to record throttle hit")?;
        }

        tx.commit()
            .await
            .context("failed to commit throttle transaction")?;

        Ok(verdict)
    }
}

impl CounterService for PgCounterService {
    fn sliding_window_check<'a>(
        &'a self,
        key: &'a str,
        capacity: u32,
        window: Duration,
        now: DateTime<Utc>,
    ) -> BoxFuture<'a, WindowVerdict> {
        Box::pin(self.check(key, capacity, window, now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestDb;
    use chrono::TimeZone;

    const WINDOW: Duration = Duration::from_secs(900);

    #[test]
    fn verdict_counts_this_hit() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let first = verdict(0, None, 5, WINDOW, now);
        assert!(first.allowed);
        assert_eq!(first.remaining, 4);
        assert_eq!(first.reset_at, add(now, WINDOW));

        let oldest = now - chrono::Duration::minutes(10);
        let last = verdict(4, Some(oldest), 5, WINDOW, now);
        assert!(last.allowed);
        assert_eq!(last.remaining, 0);

        let denied = verdict(5, Some(oldest), 5, WINDOW, now);
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert_eq!(denied.reset_at, oldest + chrono::Duration::minutes(15));
    }

    #[tokio::test]
    async fn pg_window_admits_capacity_then_denies() -> Result<()> {
        let Some(db) = TestDb::start().await? else {
            return Ok(());
        };
        let counter = PgCounterService::new(db.pool.clone());
        let now = Utc::now();

        for _ in 0..3 {
            let verdict = counter
                .sliding_window_check("account:dave@example.com", 3, WINDOW, now)
                .await?;
            assert!(verdict.allowed);
        }
        let denied = counter
            .sliding_window_check("account:dave@example.com", 3, WINDOW, now)
            .await?;
        assert!(!denied.allowed);

        let later = now + chrono::Duration::minutes(16);
        let reopened = counter
            .sliding_window_check("account:dave@example.com", 3, WINDOW, later)
            .await?;
        assert!(reopened.allowed);
        assert_eq!(reopened.remaining, 2);
        Ok(())
    }

    #[tokio::test]
    async fn pg_window_never_overshoots_under_concurrency() -> Result<()> {
        let Some(db) = TestDb::start().await? else {
            return Ok(());
        };
        let now = Utc::now();

        let mut tasks = Vec::new();
        for _ in 0..12 {
            let counter = PgCounterService::new(db.pool.clone());
            tasks.push(tokio::spawn(async move {
                counter
                    .sliding_window_check("origin:192.0.2.10", 5, WINDOW, now)
                    .await
            }));
        }

        let mut admitted = 0;
        for task in tasks {
            if task.await??.allowed {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 5);

        let pruned = PgCounterService::new(db.pool.clone())
            .prune_expired(now + chrono::Duration::seconds(1))
            .await?;
        assert_eq!(pruned, 5);
        Ok(())
    }
}
