//! Quota admission controller.
//!
//! Admission is a read-check-increment on the `(account_id, period)` usage
//! counter under a row lock, inside the same transaction as the write it
//! guards. Concurrent callers for one account serialize on that row lock, so
//! the counter can never pass the plan limit, whichever instance they run on.
//!
//! The account row is held `FOR SHARE` for the duration, which keeps the plan
//! stable and makes a concurrent purge wait, without serializing consumers of
//! unlimited plans against each other.

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, Months, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgConnection, PgPool, Row};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, warn, Instrument};
use uuid::Uuid;

use crate::error::Error;
use crate::external::BoxFuture;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    Free,
    Pro,
    Business,
}

impl Plan {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Pro => "pro",
            Self::Business => "business",
        }
    }

    /// Uploads allowed per billing period; `None` is unlimited.
    #[must_use]
    pub const fn limit(self) -> Option<i64> {
        match self {
            Self::Free => Some(10),
            Self::Pro => Some(1000),
            Self::Business => None,
        }
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Plan {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "free" => Ok(Self::Free),
            "pro" => Ok(Self::Pro),
            "business" => Ok(Self::Business),
            other => Err(anyhow::anyhow!("unknown plan: {other}")),
        }
    }
}

/// Calendar-month billing period, identified by its first day.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BillingPeriod(NaiveDate);

impl BillingPeriod {
    #[must_use]
    pub fn containing(now: DateTime<Utc>) -> Self {
        let date = now.date_naive();
        Self(date.with_day(1).unwrap_or(date))
    }

    #[must_use]
    pub const fn start(&self) -> NaiveDate {
        self.0
    }

    #[must_use]
    pub fn next(&self) -> Self {
        Self(self.0.checked_add_months(Months::new(1)).unwrap_or(self.0))
    }
}

impl fmt::Display for BillingPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m"))
    }
}

/// What one admission consumes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Amount {
    pub count: i64,
    pub bytes: i64,
}

impl Amount {
    #[must_use]
    pub const fn new(count: i64, bytes: i64) -> Self {
        Self { count, bytes }
    }

    #[must_use]
    pub const fn one() -> Self {
        Self::new(1, 0)
    }

    fn validate(self) -> Result<(), Error> {
        if self.count < 1 {
            return Err(Error::Invalid("amount must consume at least one unit"));
        }
        if self.bytes < 0 {
            return Err(Error::Invalid("amount bytes must not be negative"));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QuotaDecision {
    pub allowed: bool,
    /// Counter value after this call: incremented when admitted, unchanged
    /// when denied.
    pub current_count: i64,
    /// `None` for unlimited plans.
    pub limit: Option<i64>,
}

impl QuotaDecision {
    /// # Errors
    /// Returns [`Error::QuotaExceeded`] for a denied decision.
    pub fn into_result(self) -> Result<Self, Error> {
        if self.allowed {
            return Ok(self);
        }
        Err(Error::QuotaExceeded {
            current_count: self.current_count,
            limit: self.limit.unwrap_or(i64::MAX),
        })
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UsageCounter {
    pub consumed_count: i64,
    pub consumed_bytes: i64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Upload {
    pub id: Uuid,
    pub account_id: Uuid,
    pub storage_path: String,
    pub bytes: i64,
    pub created_at: DateTime<Utc>,
}

/// Admit and record `amount` against the account's counter for `period`.
///
/// Must run on a connection inside the transaction of the guarded write; the
/// locks it takes are released when that transaction ends. A denied decision
/// leaves the counter unchanged and the caller should roll back.
///
/// # Errors
/// Returns [`Error::AccountNotFound`], [`Error::Invalid`] for a bad amount, or
/// [`Error::Store`] when a query fails.
pub async fn try_consume(
    conn: &mut PgConnection,
    account_id: Uuid,
    period: BillingPeriod,
    amount: Amount,
) -> Result<QuotaDecision, Error> {
    amount.validate()?;

    let plan_query = "SELECT plan FROM accounts WHERE id = $1 FOR SHARE";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = plan_query
    );
    let plan: Option<String> = sqlx::query_scalar(plan_query)
        .bind(account_id)
        .fetch_optional(&mut *conn)
        .instrument(span)
        .await
        .context("failed to lock account plan")?;
    let plan: Plan = plan.ok_or(Error::AccountNotFound(account_id))?.parse()?;

    let Some(limit) = plan.limit() else {
        let usage = read_usage(&mut *conn, account_id, period).await?;
        return Ok(QuotaDecision {
            allowed: true,
            current_count: usage.consumed_count,
            limit: None,
        });
    };

    let create_query = r"
        INSERT INTO usage_counters (account_id, period)
        VALUES ($1, $2)
        ON CONFLICT (account_id, period) DO NOTHING
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = create_query
    );
    sqlx::query(create_query)
        .bind(account_id)
        .bind(period.start())
        .execute(&mut *conn)
        .instrument(span)
        .await
        .context("failed to create usage counter")?;

    let lock_query = r"
        SELECT consumed_count
        FROM usage_counters
        WHERE account_id = $1 AND period = $2
        FOR UPDATE
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = lock_query
    );
    let consumed: i64 = sqlx::query_scalar(lock_query)
        .bind(account_id)
        .bind(period.start())
        .fetch_one(&mut *conn)
        .instrument(span)
        .await
        .context("failed to lock usage counter")?;

    if consumed.saturating_add(amount.count) > limit {
        warn!(%account_id, %period, consumed, limit, "quota exceeded");
        return Ok(QuotaDecision {
            allowed: false,
            current_count: consumed,
            limit: Some(limit),
        });
    }

    let increment_query = r"
        UPDATE usage_counters
        SET consumed_count = consumed_count + $3,
            consumed_bytes = consumed_bytes + $4,
            updated_at = NOW()
        WHERE account_id = $1 AND period = $2
        RETURNING consumed_count
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = increment_query
    );
    let current_count: i64 = sqlx::query_scalar(increment_query)
        .bind(account_id)
        .bind(period.start())
        .bind(amount.count)
        .bind(amount.bytes)
        .fetch_one(&mut *conn)
        .instrument(span)
        .await
        .context("failed to increment usage counter")?;

    debug!(%account_id, %period, current_count, limit, "quota admitted");
    Ok(QuotaDecision {
        allowed: true,
        current_count,
        limit: Some(limit),
    })
}

/// Admit `amount` and run `write` in one transaction.
///
/// Denial rolls back before `write` runs. A failing `write` rolls back the
/// increment with it.
///
/// # Errors
/// Returns [`Error::QuotaExceeded`] on denial, the errors of [`try_consume`],
/// or [`Error::Store`] when `write` or the commit fails.
pub async fn consume_with<T, F>(
    pool: &PgPool,
    account_id: Uuid,
    period: BillingPeriod,
    amount: Amount,
    write: F,
) -> Result<(QuotaDecision, T), Error>
where
    F: for<'c> FnOnce(&'c mut PgConnection) -> BoxFuture<'c, T>,
{
    let mut tx = pool
        .begin()
        .await
        .context("failed to begin quota transaction")?;

    let decision = try_consume(&mut *tx, account_id, period, amount).await?;
    if let Err(denied) = decision.into_result() {
        tx.rollback()
            .await
            .context("failed to roll back denied quota transaction")?;
        return Err(denied);
    }

    let value = match write(&mut *tx).await {
        Ok(value) => value,
        Err(err) => {
            if let Err(rollback_err) = tx.rollback().await {
                warn!("failed to roll back quota transaction: {rollback_err}");
            }
            return Err(Error::Store(err.context("guarded write failed")));
        }
    };

    tx.commit()
        .await
        .context("failed to commit quota transaction")?;
    Ok((decision, value))
}

/// Record an uploaded object against the current period's quota.
///
/// # Errors
/// Same as [`consume_with`].
pub async fn record_upload(
    pool: &PgPool,
    account_id: Uuid,
    storage_path: &str,
    bytes: i64,
    now: DateTime<Utc>,
) -> Result<Upload, Error> {
    let upload = Upload {
        id: Uuid::now_v7(),
        account_id,
        storage_path: storage_path.to_string(),
        bytes,
        created_at: now,
    };
    let row = upload.clone();

    consume_with(
        pool,
        account_id,
        BillingPeriod::containing(now),
        Amount::new(1, bytes),
        move |conn| {
            Box::pin(async move {
                let query = r"
                    INSERT INTO uploads (id, account_id, storage_path, bytes, created_at)
                    VALUES ($1, $2, $3, $4, $5)
                ";
                let span = tracing::info_span!(
                    "db.query",
                    db.system = "postgresql",
                    db.operation = "INSERT",
                    db.statement = query
                );
                sqlx::query(query)
                    .bind(row.id)
                    .bind(row.account_id)
                    .bind(&row.storage_path)
                    .bind(row.bytes)
                    .bind(row.created_at)
                    .execute(conn)
                    .instrument(span)
                    .await
                    .context("failed to insert upload")?;
                Ok(())
            })
        },
    )
    .await?;

    Ok(upload)
}

/// Current counter for `period` without taking any lock.
///
/// # Errors
/// Returns an error if the query fails.
pub async fn usage(pool: &PgPool, account_id: Uuid, period: BillingPeriod) -> Result<UsageCounter> {
    let mut conn = pool
        .acquire()
        .await
        .context("failed to acquire connection")?;
    read_usage(&mut *conn, account_id, period).await
}

async fn read_usage(
    conn: &mut PgConnection,
    account_id: Uuid,
    period: BillingPeriod,
) -> Result<UsageCounter> {
    let query = r"
        SELECT consumed_count, consumed_bytes
        FROM usage_counters
        WHERE account_id = $1 AND period = $2
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(account_id)
        .bind(period.start())
        .fetch_optional(conn)
        .instrument(span)
        .await
        .context("failed to read usage counter")?;
    Ok(row.map_or_else(UsageCounter::default, |row| UsageCounter {
        consumed_count: row.get("consumed_count"),
        consumed_bytes: row.get("consumed_bytes"),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestDb;
    use chrono::TimeZone;

    #[test]
    fn plan_limits() {
        assert_eq!(Plan::Free.limit(), Some(10));
        assert_eq!(Plan::Pro.limit(), Some(1000));
        assert_eq!(Plan::Business.limit(), None);
        assert_eq!("pro".parse::<Plan>().ok(), Some(Plan::Pro));
        assert!("enterprise".parse::<Plan>().is_err());
    }

    #[test]
    fn period_is_calendar_month() {
        let now = Utc.with_ymd_and_hms(2026, 12, 31, 23, 59, 59).unwrap();
        let period = BillingPeriod::containing(now);
        assert_eq!(period.start(), NaiveDate::from_ymd_opt(2026, 12, 1).unwrap());
        assert_eq!(
            period.next().start(),
            NaiveDate::from_ymd_opt(2027, 1, 1).unwrap()
        );
        assert_eq!(period.to_string(), "2026-12");
    }

    #[test]
    fn denied_decision_becomes_quota_exceeded() {
        let decision = QuotaDecision {
            allowed: false,
            current_count: 10,
            limit: Some(10),
        };
        assert!(matches!(
            decision.into_result(),
            Err(Error::QuotaExceeded {
                current_count: 10,
                limit: 10
            })
        ));
    }

    #[test]
    fn amount_must_be_positive() {
        assert!(Amount::new(0, 0).validate().is_err());
        assert!(Amount::new(1, -1).validate().is_err());
        assert!(Amount::one().validate().is_ok());
    }

    async fn consume(
        db: &TestDb,
        account_id: Uuid,
        period: BillingPeriod,
    ) -> Result<QuotaDecision, Error> {
        let mut tx = db.pool.begin().await.context("begin")?;
        let decision = try_consume(&mut *tx, account_id, period, Amount::one()).await?;
        tx.commit().await.context("commit")?;
        Ok(decision)
    }

    #[tokio::test]
    async fn free_plan_admits_exactly_ten() -> anyhow::Result<()> {
        let Some(db) = TestDb::start().await? else {
            return Ok(());
        };
        let account_id = db.insert_account("walt@example.com", Plan::Free).await?;
        let period = BillingPeriod::containing(Utc::now());

        for expected in 1..=10 {
            let decision = consume(&db, account_id, period).await?;
            assert!(decision.allowed);
            assert_eq!(decision.current_count, expected);
        }

        let denied = consume(&db, account_id, period).await?;
        assert_eq!(
            denied,
            QuotaDecision {
                allowed: false,
                current_count: 10,
                limit: Some(10),
            }
        );

        // Next period starts from zero.
        let next = consume(&db, account_id, period.next()).await?;
        assert!(next.allowed);
        assert_eq!(next.current_count, 1);
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_consumers_never_overshoot() -> anyhow::Result<()> {
        let Some(db) = TestDb::start().await? else {
            return Ok(());
        };
        let account_id = db.insert_account("xena@example.com", Plan::Free).await?;
        let period = BillingPeriod::containing(Utc::now());

        let mut tasks = Vec::new();
        for _ in 0..25 {
            let pool = db.pool.clone();
            tasks.push(tokio::spawn(async move {
                let mut tx = pool.begin().await.context("begin")?;
                let decision = try_consume(&mut *tx, account_id, period, Amount::one()).await?;
                tx.commit().await.context("commit")?;
                Ok::<bool, Error>(decision.allowed)
            }));
        }

        let mut admitted = 0;
        for task in tasks {
            if task.await?? {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 10);
        assert_eq!(usage(&db.pool, account_id, period).await?.consumed_count, 10);
        Ok(())
    }

    #[tokio::test]
    async fn unlimited_plan_skips_counter() -> anyhow::Result<()> {
        let Some(db) = TestDb::start().await? else {
            return Ok(());
        };
        let account_id = db.insert_account("yara@example.com", Plan::Business).await?;
        let period = BillingPeriod::containing(Utc::now());

        for _ in 0..50 {
            let decision = consume(&db, account_id, period).await?;
            assert!(decision.allowed);
            assert_eq!(decision.limit, None);
        }
        assert_eq!(db.count_rows("usage_counters", account_id).await?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn failed_write_rolls_back_increment() -> anyhow::Result<()> {
        let Some(db) = TestDb::start().await? else {
            return Ok(());
        };
        let account_id = db.insert_account("zoe@example.com", Plan::Free).await?;
        let period = BillingPeriod::containing(Utc::now());

        let result = consume_with(&db.pool, account_id, period, Amount::one(), |_conn| {
            Box::pin(async move { Err::<(), _>(anyhow::anyhow!("disk full")) })
        })
        .await;
        assert!(matches!(result, Err(Error::Store(_))));
        assert_eq!(usage(&db.pool, account_id, period).await?, UsageCounter::default());
        Ok(())
    }

    #[tokio::test]
    async fn record_upload_counts_against_quota() -> anyhow::Result<()> {
        let Some(db) = TestDb::start().await? else {
            return Ok(());
        };
        let account_id = db.insert_account("abe@example.com", Plan::Free).await?;
        let now = Utc::now();

        for n in 0..10 {
            record_upload(&db.pool, account_id, &format!("{account_id}/{n}.png"), 2048, now)
                .await?;
        }
        let denied = record_upload(&db.pool, account_id, "overflow.png", 1, now).await;
        assert!(matches!(
            denied,
            Err(Error::QuotaExceeded {
                current_count: 10,
                limit: 10
            })
        ));
        assert_eq!(db.count_rows("uploads", account_id).await?, 10);

        let counter = usage(&db.pool, account_id, BillingPeriod::containing(now)).await?;
        assert_eq!(counter.consumed_bytes, 10 * 2048);
        Ok(())
    }

    #[tokio::test]
    async fn unknown_account_is_not_found() -> anyhow::Result<()> {
        let Some(db) = TestDb::start().await? else {
            return Ok(());
        };
        let missing = Uuid::now_v7();
        let result = consume(&db, missing, BillingPeriod::containing(Utc::now())).await;
        assert!(matches!(result, Err(Error::AccountNotFound(id)) if id == missing));
        Ok(())
    }
}
