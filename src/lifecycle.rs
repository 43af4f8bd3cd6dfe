//! Account lifecycle operations exposed to the CRUD layer.
//!
//! [`AccountLifecycle`] owns the pool and the external collaborators, and
//! sequences the steps that must happen outside a transaction: blob removal
//! and identity removal run only after the purge has committed, and their
//! failures never undo it.

use anyhow::Context;
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::billing::{apply_billing_event, BillingEffect, BillingEvent};
use crate::error::Error;
use crate::external::{BoxFuture, IdentityProvider, ObjectRemoval, ObjectStorage};
use crate::idempotency::{apply_once, ApplyOutcome};
use crate::purge::{self, PurgeConfig, PurgeResult};
use crate::quota::{self, Amount, BillingPeriod, QuotaDecision, Upload};
use crate::reconcile::{self, PURGE_REASON};

/// Outcome of [`AccountLifecycle::erase_account`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErasureReport {
    pub purge: PurgeResult,
    /// References moved to the reconciliation queue before the purge.
    pub drained_artifacts: u64,
    pub removed_artifacts: usize,
    /// References whose removal failed and were queued for the sweep.
    pub queued_for_reconciliation: Vec<String>,
}

#[derive(Clone)]
pub struct AccountLifecycle {
    pool: PgPool,
    storage: Arc<dyn ObjectStorage>,
    identity: Arc<dyn IdentityProvider>,
    purge_config: PurgeConfig,
}

impl AccountLifecycle {
    #[must_use]
    pub fn new(
        pool: PgPool,
        storage: Arc<dyn ObjectStorage>,
        identity: Arc<dyn IdentityProvider>,
    ) -> Self {
        Self {
            pool,
            storage,
            identity,
            purge_config: PurgeConfig::new(),
        }
    }

    #[must_use]
    pub fn with_purge_config(mut self, config: PurgeConfig) -> Self {
        self.purge_config = config.normalize();
        self
    }

    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Standalone quota admission: commits the increment when admitted.
    /// Use [`Self::consume_with`] to guard a write in the same transaction.
    ///
    /// # Errors
    /// See [`quota::try_consume`].
    pub async fn try_consume(
        &self,
        account_id: Uuid,
        period: BillingPeriod,
        amount: Amount,
    ) -> Result<QuotaDecision, Error> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to begin quota transaction")?;
        let decision = quota::try_consume(&mut *tx, account_id, period, amount).await?;
        if decision.allowed {
            tx.commit()
                .await
                .context("failed to commit quota transaction")?;
        } else {
            tx.rollback()
                .await
                .context("failed to roll back quota transaction")?;
        }
        Ok(decision)
    }

    /// # Errors
    /// See [`quota::consume_with`].
    pub async fn consume_with<T, F>(
        &self,
        account_id: Uuid,
        period: BillingPeriod,
        amount: Amount,
        write: F,
    ) -> Result<(QuotaDecision, T), Error>
    where
        F: for<'c> FnOnce(&'c mut PgConnection) -> BoxFuture<'c, T>,
    {
        quota::consume_with(&self.pool, account_id, period, amount, write).await
    }

    /// # Errors
    /// See [`quota::record_upload`].
    pub async fn record_upload(
        &self,
        account_id: Uuid,
        storage_path: &str,
        bytes: i64,
        now: DateTime<Utc>,
    ) -> Result<Upload, Error> {
        quota::record_upload(&self.pool, account_id, storage_path, bytes, now).await
    }

    /// The purge transaction alone. Blob and identity cleanup are left to the
    /// caller; prefer [`Self::erase_account`].
    ///
    /// # Errors
    /// See [`purge::purge_account`].
    pub async fn purge_account(
        &self,
        account_id: Uuid,
        origin: IpAddr,
        now: DateTime<Utc>,
    ) -> Result<PurgeResult, Error> {
        purge::purge_account(&self.pool, account_id, origin, now).await
    }

    /// Full erasure: drain oversized artifact sets, purge, remove blobs, queue
    /// failed removals, then remove the identity.
    ///
    /// # Errors
    /// - [`Error::AccountNotFound`] / [`Error::PurgeFailed`] from the purge,
    ///   with nothing committed (beyond drained batches).
    /// - [`Error::IdentityRemovalFailed`] when everything else is done but
    ///   the identity provider refused. The purge stays committed.
    pub async fn erase_account(
        &self,
        account_id: Uuid,
        origin: IpAddr,
        now: DateTime<Utc>,
    ) -> Result<ErasureReport, Error> {
        let artifacts = purge::count_artifacts(&self.pool, account_id).await?;
        let drained_artifacts = if artifacts > self.purge_config.max_artifacts_in_transaction() {
            purge::drain_artifacts(&self.pool, account_id, self.purge_config, now)
                .await
                .map_err(|err| {
                    error!(%account_id, "artifact drain failed: {err:#}");
                    Error::PurgeFailed(format!("{err:#}"))
                })?
        } else {
            0
        };

        let purge = purge::purge_account(&self.pool, account_id, origin, now).await?;

        let removals = self.remove_artifacts(&purge.artifact_refs).await;
        let removed_artifacts = removals.iter().filter(|removal| removal.is_removed()).count();
        let queued_for_reconciliation =
            match reconcile::enqueue_failures(&self.pool, &removals, PURGE_REASON, now).await {
                Ok(queued) => queued,
                Err(err) => {
                    // Not surfaced: the purge is committed and must stand.
                    error!(
                        %account_id,
                        failed = removals.len() - removed_artifacts,
                        "failed to queue artifacts for reconciliation: {err:#}"
                    );
                    Vec::new()
                }
            };
        if !queued_for_reconciliation.is_empty() {
            info!(
                %account_id,
                queued = queued_for_reconciliation.len(),
                "artifacts queued for reconciliation"
            );
        }

        if let Err(err) = self.identity.remove_account(account_id).await {
            error!(%account_id, "identity removal failed after purge: {err:#}");
            return Err(Error::IdentityRemovalFailed {
                account_id,
                reason: format!("{err:#}"),
            });
        }

        info!(%account_id, removed_artifacts, drained_artifacts, "account erased");
        Ok(ErasureReport {
            purge,
            drained_artifacts,
            removed_artifacts,
            queued_for_reconciliation,
        })
    }

    async fn remove_artifacts(&self, refs: &[String]) -> Vec<ObjectRemoval> {
        if refs.is_empty() {
            return Vec::new();
        }
        match self.storage.remove_objects(refs).await {
            Ok(removals) => {
                for removal in removals.iter().filter(|removal| !removal.is_removed()) {
                    if let Err(reason) = &removal.result {
                        warn!(reference = %removal.reference, "artifact removal failed: {reason}");
                    }
                }
                removals
            }
            Err(err) => {
                warn!("object storage unavailable after purge: {err:#}");
                let reason = format!("{err:#}");
                refs.iter()
                    .map(|reference| ObjectRemoval::failed(reference.as_str(), reason.as_str()))
                    .collect()
            }
        }
    }

    /// # Errors
    /// See [`apply_once`].
    pub async fn apply_external_event<T, F>(
        &self,
        external_id: &str,
        effect: F,
    ) -> Result<ApplyOutcome<T>, Error>
    where
        F: for<'c> FnOnce(&'c mut PgConnection) -> BoxFuture<'c, T>,
    {
        apply_once(&self.pool, external_id, effect).await
    }

    /// # Errors
    /// See [`apply_billing_event`].
    pub async fn apply_billing_event(
        &self,
        event: &BillingEvent,
    ) -> Result<ApplyOutcome<BillingEffect>, Error> {
        apply_billing_event(&self.pool, event).await
    }
}
