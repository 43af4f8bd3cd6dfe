use crate::cli::{commands::database, database::connect};
use crate::ledger::PgEventLedger;
use crate::policy::subtract;
use crate::throttle::PgCounterService;
use anyhow::Result;
use chrono::Utc;
use std::time::Duration;
use tracing::info;

#[derive(Debug)]
pub struct Args {
    pub database: database::Options,
    /// Already raised to the admission retention floor.
    pub retention: Duration,
}

/// Delete history older than the retention horizon.
/// # Errors
/// Returns an error if the database is unreachable or a delete fails.
pub async fn execute(args: Args) -> Result<()> {
    let pool = connect(&args.database).await?;
    let cutoff = subtract(Utc::now(), args.retention);

    let events = PgEventLedger::new(pool.clone()).prune_before(cutoff).await?;
    let hits = PgCounterService::new(pool.clone())
        .prune_expired(cutoff)
        .await?;

    info!(%cutoff, events, hits, "pruned expired history");
    pool.close().await;
    Ok(())
}
