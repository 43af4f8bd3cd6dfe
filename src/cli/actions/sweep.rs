use crate::cli::{commands::database, database::connect};
use crate::external::{FsObjectStorage, ObjectStorage};
use crate::reconcile::{self, ReconcileConfig};
use anyhow::{Context, Result};
use chrono::Utc;
use std::{path::PathBuf, sync::Arc};
use tracing::info;

#[derive(Debug)]
pub struct Args {
    pub database: database::Options,
    pub storage_root: PathBuf,
    pub once: bool,
    pub config: ReconcileConfig,
}

/// Run the reconciliation sweep, once or until interrupted.
/// # Errors
/// Returns an error if the database is unreachable or a one-shot sweep fails.
pub async fn execute(args: Args) -> Result<()> {
    let pool = connect(&args.database).await?;
    let storage: Arc<dyn ObjectStorage> = Arc::new(FsObjectStorage::new(args.storage_root));

    if args.once {
        let report = reconcile::sweep_batch(&pool, storage.as_ref(), &args.config, Utc::now())
            .await
            .context("reconciliation sweep failed")?;
        info!(
            claimed = report.claimed,
            removed = report.removed,
            rescheduled = report.rescheduled,
            abandoned = report.abandoned,
            "reconciliation sweep complete"
        );
        pool.close().await;
        return Ok(());
    }

    let worker = reconcile::spawn_reconciliation_worker(pool.clone(), storage, args.config);
    info!(
        poll_seconds = args.config.poll_interval().as_secs(),
        "reconciliation worker started"
    );

    tokio::select! {
        result = worker => {
            result.context("reconciliation worker stopped")?;
        }
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for shutdown signal")?;
            info!("shutting down reconciliation worker");
        }
    }

    pool.close().await;
    Ok(())
}
