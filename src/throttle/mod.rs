//! Dual-scope throttle engine.
//!
//! Counts *attempts*, successful or not, per origin address and per account,
//! in sliding windows held by a shared [`CounterService`]. Origin is checked
//! first so a spraying origin is stopped before it touches per-account state.

mod counter;

pub use counter::{CounterService, PgCounterService, WindowVerdict};
pub(crate) use counter::verdict;

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::warn;

use crate::error::Error;
use crate::policy::{seconds_until, AdmissionPolicy, Scope};

#[derive(Clone)]
pub struct ThrottleEngine {
    counter: Arc<dyn CounterService>,
    policy: AdmissionPolicy,
}

impl ThrottleEngine {
    #[must_use]
    pub fn new(counter: Arc<dyn CounterService>, policy: AdmissionPolicy) -> Self {
        Self {
            counter,
            policy: policy.normalize(),
        }
    }

    #[must_use]
    pub fn policy(&self) -> &AdmissionPolicy {
        &self.policy
    }

    /// Check the origin, then the account when one is known.
    ///
    /// # Errors
    /// Returns [`Error::ThrottleExceeded`] for the first scope that denies.
    pub async fn check(
        &self,
        origin: &str,
        account: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), Error> {
        self.check_scope(Scope::Origin, origin, now).await?;
        if let Some(account) = account {
            self.check_scope(Scope::Account, account, now).await?;
        }
        Ok(())
    }

    /// Consume one attempt for `identifier` in `scope`.
    ///
    /// A counter service that errors or exceeds the check timeout denies with
    /// a full window wait, unless the policy enables throttle fail-open.
    ///
    /// # Errors
    /// Returns [`Error::ThrottleExceeded`] when the window is full or the
    /// counter service is unavailable and the throttle fails closed.
    pub async fn check_scope(
        &self,
        scope: Scope,
        identifier: &str,
        now: DateTime<Utc>,
    ) -> Result<(), Error> {
        let limit = self.policy.limit(scope);
        let key = scope.counter_key(identifier);
        let outcome = tokio::time::timeout(
            self.policy.check_timeout(),
            self.counter
                .sliding_window_check(&key, limit.threshold(), limit.window(), now),
        )
        .await;

        let verdict = match outcome {
            Ok(Ok(verdict)) => verdict,
            Ok(Err(err)) => {
                return self.degraded(scope, identifier, &format!("{err:#}"), limit.window_seconds());
            }
            Err(_) => {
                return self.degraded(scope, identifier, "check timed out", limit.window_seconds());
            }
        };

        if verdict.allowed {
            return Ok(());
        }

        let retry_after_seconds = seconds_until(now, verdict.reset_at);
        warn!(
            scope = scope.as_str(),
            identifier, retry_after_seconds, "throttle window exhausted"
        );
        Err(Error::ThrottleExceeded {
            scope,
            retry_after_seconds,
        })
    }

    fn degraded(
        &self,
        scope: Scope,
        identifier: &str,
        reason: &str,
        window_seconds: u64,
    ) -> Result<(), Error> {
        if self.policy.throttle_fail_open() {
            warn!(
                scope = scope.as_str(),
                identifier, "counter service degraded, admitting: {reason}"
            );
            return Ok(());
        }
        warn!(
            scope = scope.as_str(),
            identifier, "counter service degraded, denying: {reason}"
        );
        Err(Error::ThrottleExceeded {
            scope,
            retry_after_seconds: window_seconds,
        })
    }
}
