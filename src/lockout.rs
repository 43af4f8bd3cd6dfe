//! Lockout state machine.
//!
//! State is never stored. Every check recomputes it from the ledger:
//!
//! - `LOCKED` while an `account_locked`/`ip_blocked` event is younger than the
//!   lockout duration, or while the confirmed `login_failure` count in the
//!   trailing window is at or above the scope threshold.
//! - `UNLOCKED` otherwise, including for identifiers never seen before.
//!
//! There is no unlock transition; the lock ends when its events roll off.

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{info, warn};

use crate::ledger::{AuthEvent, AuthEventKind, EventLedger};
use crate::policy::{add, seconds_until, subtract, AdmissionPolicy, Scope};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockState {
    Unlocked,
    Locked { locked_until: DateTime<Utc> },
}

impl LockState {
    #[must_use]
    pub fn is_locked(&self) -> bool {
        matches!(self, Self::Locked { .. })
    }

    #[must_use]
    pub fn retry_after_seconds(&self, now: DateTime<Utc>) -> Option<u64> {
        match self {
            Self::Unlocked => None,
            Self::Locked { locked_until } => Some(seconds_until(now, *locked_until)),
        }
    }
}

#[derive(Clone)]
pub struct LockoutMachine {
    ledger: Arc<dyn EventLedger>,
    policy: AdmissionPolicy,
}

impl LockoutMachine {
    #[must_use]
    pub fn new(ledger: Arc<dyn EventLedger>, policy: AdmissionPolicy) -> Self {
        Self {
            ledger,
            policy: policy.normalize(),
        }
    }

    /// Current state of `identifier` in `scope`. Read-only.
    ///
    /// # Errors
    /// Returns an error if the ledger cannot be read. Callers must treat that
    /// as locked.
    pub async fn evaluate(
        &self,
        scope: Scope,
        identifier: &str,
        now: DateTime<Utc>,
    ) -> Result<LockState> {
        if let Some(locked_until) = self.active_lock(scope, identifier, now).await? {
            return Ok(LockState::Locked { locked_until });
        }

        let limit = self.policy.limit(scope);
        let since = limit.window_start(now);
        let failures = self
            .ledger
            .count_since(scope, identifier, AuthEventKind::LoginFailure, since)
            .await?;
        if failures < i64::from(limit.threshold()) {
            return Ok(LockState::Unlocked);
        }

        // Threshold reached but the lock event is missing (lost append or
        // pruned). Anchored on the newest failure, held at least until it
        // leaves the window.
        let latest = self
            .ledger
            .latest_since(scope, identifier, AuthEventKind::LoginFailure, since)
            .await?
            .unwrap_or(now);
        let hold = self.policy.lockout_duration().max(limit.window());
        Ok(LockState::Locked {
            locked_until: add(latest, hold),
        })
    }

    /// Apply the `UNLOCKED -> LOCKED` transition after a recorded failure.
    ///
    /// Appends the scope's lock event when the failure count has reached the
    /// threshold and no lock is active yet, and returns the new state. Returns
    /// `None` when nothing changed.
    ///
    /// # Errors
    /// Returns an error if the ledger cannot be read or the lock event cannot
    /// be appended.
    pub async fn after_failure(
        &self,
        scope: Scope,
        identifier: &str,
        failure: &AuthEvent,
        now: DateTime<Utc>,
    ) -> Result<Option<LockState>> {
        let limit = self.policy.limit(scope);
        let failures = self
            .ledger
            .count_since(
                scope,
                identifier,
                AuthEventKind::LoginFailure,
                limit.window_start(now),
            )
            .await?;
        if failures < i64::from(limit.threshold()) {
            return Ok(None);
        }
        if self.active_lock(scope, identifier, now).await?.is_some() {
            return Ok(None);
        }

        let locked_until = add(now, self.policy.lockout_duration());
        let mut lock = AuthEvent::new(scope.lock_event(), failure.origin, now)
            .with_user_agent(failure.user_agent.clone())
            .with_metadata("failures", failures)
            .with_metadata("threshold", limit.threshold())
            .with_metadata("locked_until", locked_until.to_rfc3339());
        if scope == Scope::Account {
            lock.account_id = failure.account_id;
            lock.email.clone_from(&failure.email);
        }
        self.ledger.append(&lock).await?;

        match scope {
            Scope::Account => warn!(identifier, failures, "account locked"),
            Scope::Origin => warn!(identifier, failures, "origin blocked"),
        }
        info!(scope = scope.as_str(), identifier, %locked_until, "lock recorded");

        Ok(Some(LockState::Locked { locked_until }))
    }

    async fn active_lock(
        &self,
        scope: Scope,
        identifier: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        let lockout = self.policy.lockout_duration();
        let latest = self
            .ledger
            .latest_since(scope, identifier, scope.lock_event(), subtract(now, lockout))
            .await?;
        Ok(latest
            .map(|locked_at| add(locked_at, lockout))
            .filter(|locked_until| *locked_until > now))
    }
}
