//! Embedded `PostgreSQL` schema.

use anyhow::{Context, Result};
use sqlx::PgPool;
use tracing::{info, Instrument};

pub const SCHEMA_SQL: &str = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/sql/schema.sql"));

/// Apply the schema. Every statement is idempotent, so this is safe to re-run.
///
/// # Errors
/// Returns an error if any statement fails.
pub async fn apply(pool: &PgPool) -> Result<()> {
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "DDL"
    );
    sqlx::raw_sql(SCHEMA_SQL)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to apply schema")?;
    info!("schema applied");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_defines_every_table() {
        for table in [
            "accounts",
            "uploads",
            "usage_counters",
            "auth_events",
            "throttle_hits",
            "processed_external_events",
            "artifact_reconciliation",
        ] {
            assert!(
                SCHEMA_SQL.contains(&format!("CREATE TABLE IF NOT EXISTS {table} (")),
                "missing table {table}"
            );
        }
    }

    #[test]
    fn schema_is_rerunnable() {
        for line in SCHEMA_SQL.lines() {
            let line = line.trim_start();
            if line.starts_with("CREATE ") {
                assert!(line.contains("IF NOT EXISTS"), "not idempotent: {line}");
            }
        }
    }
}
