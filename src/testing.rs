//! Database fixtures for unit tests.

use anyhow::{Context, Result};
use sqlx::{postgres::PgPoolOptions, PgPool};
use test_support::{postgres::PostgresContainer, runtime, TestNetwork};
use tokio::sync::OnceCell;
use uuid::Uuid;

use crate::quota::Plan;

static TEST_CONTAINER: OnceCell<PostgresContainer> = OnceCell::const_new();

/// A schema-initialized database of its own inside the shared test container.
pub(crate) struct TestDb {
    pub(crate) pool: PgPool,
}

impl TestDb {
    /// Returns `Ok(None)` (after logging) when no container runtime is available.
    pub(crate) async fn start() -> Result<Option<Self>> {
        if let Err(err) = runtime::ensure_container_runtime() {
            eprintln!("Skipping integration test: {err}");
            return Ok(None);
        }

        let container = TEST_CONTAINER
            .get_or_try_init(|| async {
                let network = TestNetwork::new("gatekeep-test");
                let postgres = PostgresContainer::start(network.name()).await?;
                postgres.wait_until_ready().await?;
                Ok::<PostgresContainer, anyhow::Error>(postgres)
            })
            .await?;

        let dsn = container.create_database("gatekeep").await?;
        let pool = PgPoolOptions::new()
            .max_connections(12)
            .acquire_timeout(std::time::Duration::from_secs(30))
            .connect(&dsn)
            .await
            .context("failed to connect test pool")?;
        crate::schema::apply(&pool).await?;

        Ok(Some(Self { pool }))
    }

    pub(crate) async fn insert_account(&self, email: &str, plan: Plan) -> Result<Uuid> {
        crate::accounts::create_account(&self.pool, email, plan).await
    }

    pub(crate) async fn count_rows(&self, table: &str, account_id: Uuid) -> Result<i64> {
        let query = match table {
            "accounts" => "SELECT COUNT(*) FROM accounts WHERE id = $1",
            "uploads" => "SELECT COUNT(*) FROM uploads WHERE account_id = $1",
            "usage_counters" => "SELECT COUNT(*) FROM usage_counters WHERE account_id = $1",
            "auth_events" => "SELECT COUNT(*) FROM auth_events WHERE account_id = $1",
            other => anyhow::bail!("unknown table {other}"),
        };
        let count: i64 = sqlx::query_scalar(query)
            .bind(account_id)
            .fetch_one(&self.pool)
            .await
            .with_context(|| format!("failed to count {table}"))?;
        Ok(count)
    }
}
