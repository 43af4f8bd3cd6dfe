//! Authentication admission gate.
//!
//! Wires the throttle engine, the lockout machine and the identity provider
//! into the login flow. Every denial happens before credentials are verified.

use chrono::{DateTime, Utc};
use secrecy::SecretString;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{error, warn};
use uuid::Uuid;

use crate::error::Error;
use crate::external::IdentityProvider;
use crate::ledger::{normalize_email, AuthEvent, AuthEventKind, EventLedger};
use crate::lockout::{LockState, LockoutMachine};
use crate::policy::{AdmissionPolicy, Scope};
use crate::throttle::{CounterService, ThrottleEngine};

#[derive(Debug)]
pub struct LoginAttempt {
    pub email: String,
    pub password: SecretString,
    pub origin: IpAddr,
    pub user_agent: Option<String>,
}

impl LoginAttempt {
    #[must_use]
    pub fn new(email: &str, password: SecretString, origin: IpAddr) -> Self {
        Self {
            email: email.to_string(),
            password,
            origin,
            user_agent: None,
        }
    }

    #[must_use]
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }
}

/// Answer of [`AuthGate::check_admission`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Admission {
    pub allowed: bool,
    pub retry_after_seconds: Option<u64>,
}

impl Admission {
    const ALLOWED: Self = Self {
        allowed: true,
        retry_after_seconds: None,
    };

    fn denied(err: &Error) -> Self {
        Self {
            allowed: false,
            retry_after_seconds: err.retry_after_seconds(),
        }
    }
}

/// What [`AuthGate::record_outcome`] persisted.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OutcomeReceipt {
    /// `None` when an informational append failed and was swallowed.
    pub event_id: Option<Uuid>,
    /// Scopes this outcome moved to `LOCKED`.
    pub locked: Vec<Scope>,
}

#[derive(Clone)]
pub struct AuthGate {
    policy: AdmissionPolicy,
    ledger: Arc<dyn EventLedger>,
    throttle: ThrottleEngine,
    lockout: LockoutMachine,
    identity: Arc<dyn IdentityProvider>,
}

impl AuthGate {
    #[must_use]
    pub fn new(
        policy: AdmissionPolicy,
        ledger: Arc<dyn EventLedger>,
        counter: Arc<dyn CounterService>,
        identity: Arc<dyn IdentityProvider>,
    ) -> Self {
        let policy = policy.normalize();
        Self {
            policy,
            throttle: ThrottleEngine::new(counter, policy),
            lockout: LockoutMachine::new(ledger.clone(), policy),
            ledger,
            identity,
        }
    }

    #[must_use]
    pub fn policy(&self) -> &AdmissionPolicy {
        &self.policy
    }

    #[must_use]
    pub fn lockout(&self) -> &LockoutMachine {
        &self.lockout
    }

    /// Lockout and throttle check for one scope.
    ///
    /// The lockout half only reads and runs first, so a locked identifier
    /// reports its lock rather than a spent throttle window. The throttle half
    /// consumes an attempt slot.
    pub async fn check_admission(
        &self,
        scope: Scope,
        identifier: &str,
        now: DateTime<Utc>,
    ) -> Admission {
        match self.admit(scope, identifier, now).await {
            Ok(()) => Admission::ALLOWED,
            Err(err) => Admission::denied(&err),
        }
    }

    /// [`Self::check_admission`] as a `Result`, for callers that propagate.
    ///
    /// The identifier is brought to the form the ledger stores: a normalized
    /// email for accounts, a re-rendered address for origins.
    ///
    /// # Errors
    /// Returns [`Error::Invalid`] for an empty email or an unparseable origin,
    /// otherwise the throttle or lockout denial.
    pub async fn admit(
        &self,
        scope: Scope,
        identifier: &str,
        now: DateTime<Utc>,
    ) -> Result<(), Error> {
        let identifier = canonical_identifier(scope, identifier)?;
        self.ensure_unlocked(scope, &identifier, now).await?;
        self.throttle.check_scope(scope, &identifier, now).await
    }

    /// Persist an authentication outcome and apply any lock transition.
    ///
    /// # Errors
    /// - [`Error::Invalid`] when the event is malformed.
    /// - [`Error::AccountLocked`] / [`Error::OriginBlocked`] when a
    ///   security-critical event or its lock transition cannot be persisted.
    ///   Losing one would let an attacker keep guessing, so the caller denies.
    pub async fn record_outcome(
        &self,
        event: &AuthEvent,
        now: DateTime<Utc>,
    ) -> Result<OutcomeReceipt, Error> {
        event.validate().map_err(Error::Invalid)?;

        let appended = tokio::time::timeout(self.policy.check_timeout(), self.ledger.append(event))
            .await
            .map_err(|_| anyhow::anyhow!("ledger append timed out"))
            .and_then(|result| result);

        let event_id = match appended {
            Ok(id) => id,
            Err(err) if event.kind.is_security_critical() => {
                error!(kind = event.kind.as_str(), "failed to record security event: {err:#}");
                let scope = if event.kind == AuthEventKind::IpBlocked {
                    Scope::Origin
                } else {
                    Scope::Account
                };
                return Err(Error::locked(scope, self.policy.lockout_seconds()));
            }
            Err(err) => {
                error!(kind = event.kind.as_str(), "failed to record auth event: {err:#}");
                return Ok(OutcomeReceipt::default());
            }
        };

        let mut receipt = OutcomeReceipt {
            event_id: Some(event_id),
            locked: Vec::new(),
        };
        if event.kind != AuthEventKind::LoginFailure {
            return Ok(receipt);
        }

        for scope in [Scope::Origin, Scope::Account] {
            let Some(identifier) = event.identifier(scope) else {
                continue;
            };
            let transition = tokio::time::timeout(
                self.policy.check_timeout(),
                self.lockout.after_failure(scope, &identifier, event, now),
            )
            .await;
            match transition {
                Ok(Ok(Some(_))) => receipt.locked.push(scope),
                Ok(Ok(None)) => {}
                Ok(Err(err)) => {
                    error!(
                        scope = scope.as_str(),
                        identifier = %identifier,
                        "lock transition failed: {err:#}"
                    );
                    return Err(Error::locked(scope, self.policy.lockout_seconds()));
                }
                Err(_) => {
                    error!(
                        scope = scope.as_str(),
                        identifier = %identifier,
                        "lock transition timed out"
                    );
                    return Err(Error::locked(scope, self.policy.lockout_seconds()));
                }
            }
        }

        Ok(receipt)
    }

    /// Full login flow: origin lock, account lock, origin throttle, account
    /// throttle, credential check, outcome recording.
    ///
    /// Both lock states are read before any credential is verified, so a
    /// correct password cannot get past a lock.
    ///
    /// # Errors
    /// Returns the first denial, [`Error::InvalidCredentials`] for a wrong
    /// password, or [`Error::Store`] when the identity provider cannot answer.
    pub async fn authenticate(
        &self,
        attempt: &LoginAttempt,
        now: DateTime<Utc>,
    ) -> Result<Uuid, Error> {
        let email = normalize_email(&attempt.email);
        if email.is_empty() {
            return Err(Error::Invalid("email is required"));
        }
        let origin = attempt.origin.to_string();

        self.ensure_unlocked(Scope::Origin, &origin, now).await?;
        self.ensure_unlocked(Scope::Account, &email, now).await?;
        self.throttle.check(&origin, Some(&email), now).await?;

        let verified = tokio::time::timeout(
            self.policy.check_timeout(),
            self.identity.verify_credentials(&email, &attempt.password),
        )
        .await
        .map_err(|_| anyhow::anyhow!("identity provider timed out"))??;

        let kind = if verified.is_some() {
            AuthEventKind::LoginSuccess
        } else {
            AuthEventKind::LoginFailure
        };
        let mut event = AuthEvent::new(kind, attempt.origin, now)
            .with_email(&email)
            .with_user_agent(attempt.user_agent.clone());
        if let Some(account_id) = verified {
            event = event.with_account_id(account_id);
        }
        self.record_outcome(&event, now).await?;

        verified.ok_or(Error::InvalidCredentials)
    }

    async fn ensure_unlocked(
        &self,
        scope: Scope,
        identifier: &str,
        now: DateTime<Utc>,
    ) -> Result<(), Error> {
        let evaluated = tokio::time::timeout(
            self.policy.check_timeout(),
            self.lockout.evaluate(scope, identifier, now),
        )
        .await;

        let state = match evaluated {
            Ok(Ok(state)) => state,
            Ok(Err(err)) => {
                error!(scope = scope.as_str(), identifier, "lockout check failed, denying: {err:#}");
                return Err(Error::locked(scope, self.policy.lockout_seconds()));
            }
            Err(_) => {
                error!(scope = scope.as_str(), identifier, "lockout check timed out, denying");
                return Err(Error::locked(scope, self.policy.lockout_seconds()));
            }
        };

        match state {
            LockState::Unlocked => Ok(()),
            LockState::Locked { locked_until } => {
                let retry_after_seconds = state
                    .retry_after_seconds(now)
                    .unwrap_or_else(|| self.policy.lockout_seconds());
                warn!(
                    scope = scope.as_str(),
                    identifier,
                    %locked_until,
                    "attempt rejected while locked"
                );
                Err(Error::locked(scope, retry_after_seconds))
            }
        }
    }
}

/// Identifier as [`AuthEvent::identifier`] renders it for `scope`.
fn canonical_identifier(scope: Scope, identifier: &str) -> Result<String, Error> {
    match scope {
        Scope::Account => {
            let email = normalize_email(identifier);
            if email.is_empty() {
                return Err(Error::Invalid("email is required"));
            }
            Ok(email)
        }
        Scope::Origin => identifier
            .trim()
            .parse::<IpAddr>()
            .map(|origin| origin.to_string())
            .map_err(|_| Error::Invalid("origin must be an IP address")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryCounterService, MemoryEventLedger, MemoryIdentityProvider};
    use std::net::Ipv4Addr;

    struct Harness {
        gate: AuthGate,
        ledger: Arc<MemoryEventLedger>,
        identity: Arc<MemoryIdentityProvider>,
    }

    fn harness(policy: AdmissionPolicy) -> Harness {
        let ledger = Arc::new(MemoryEventLedger::new());
        let identity = Arc::new(MemoryIdentityProvider::new());
        let gate = AuthGate::new(
            policy,
            ledger.clone(),
            Arc::new(MemoryCounterService::new()),
            identity.clone(),
        );
        Harness {
            gate,
            ledger,
            identity,
        }
    }

    fn origin() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(203, 0, 113, 77))
    }

    fn secret(value: &str) -> SecretString {
        SecretString::from(value.to_string())
    }

    #[tokio::test]
    async fn correct_password_is_admitted_and_recorded() -> anyhow::Result<()> {
        let h = harness(AdmissionPolicy::new());
        let account_id = h.identity.register("lee@example.com", "right").await;
        let attempt = LoginAttempt::new("Lee@Example.com", secret("right"), origin())
            .with_user_agent("curl/8");

        let verified = h.gate.authenticate(&attempt, Utc::now()).await?;
        assert_eq!(verified, account_id);

        let events = h.ledger.events().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, AuthEventKind::LoginSuccess);
        assert_eq!(events[0].account_id, Some(account_id));
        assert_eq!(events[0].user_agent.as_deref(), Some("curl/8"));
        Ok(())
    }

    #[tokio::test]
    async fn wrong_password_records_failure() {
        let h = harness(AdmissionPolicy::new());
        h.identity.register("max@example.com", "right").await;
        let attempt = LoginAttempt::new("max@example.com", secret("wrong"), origin());

        let result = h.gate.authenticate(&attempt, Utc::now()).await;
        assert!(matches!(result, Err(Error::InvalidCredentials)));
        let events = h.ledger.events().await;
        assert_eq!(events[0].kind, AuthEventKind::LoginFailure);
        assert_eq!(events[0].email.as_deref(), Some("max@example.com"));
    }

    #[tokio::test]
    async fn empty_email_is_invalid() {
        let h = harness(AdmissionPolicy::new());
        let attempt = LoginAttempt::new("   ", secret("x"), origin());
        assert!(matches!(
            h.gate.authenticate(&attempt, Utc::now()).await,
            Err(Error::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn record_outcome_rejects_failure_without_subject() {
        let h = harness(AdmissionPolicy::new());
        let event = AuthEvent::new(AuthEventKind::LoginFailure, origin(), Utc::now());
        assert!(matches!(
            h.gate.record_outcome(&event, Utc::now()).await,
            Err(Error::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn informational_append_failure_is_swallowed() -> anyhow::Result<()> {
        let h = harness(AdmissionPolicy::new());
        h.ledger.set_unavailable(true);
        let event = AuthEvent::new(AuthEventKind::SignupSuccess, origin(), Utc::now())
            .with_email("nia@example.com");
        let receipt = h.gate.record_outcome(&event, Utc::now()).await?;
        assert_eq!(receipt, OutcomeReceipt::default());
        Ok(())
    }

    #[tokio::test]
    async fn critical_append_failure_denies() {
        let h = harness(AdmissionPolicy::new());
        h.ledger.set_unavailable(true);
        let event = AuthEvent::new(AuthEventKind::LoginFailure, origin(), Utc::now())
            .with_email("oz@example.com");
        let result = h.gate.record_outcome(&event, Utc::now()).await;
        assert!(matches!(
            result,
            Err(Error::AccountLocked {
                retry_after_seconds: 900
            })
        ));
    }

    #[tokio::test]
    async fn receipt_reports_lock_transition() -> anyhow::Result<()> {
        let h = harness(AdmissionPolicy::new());
        let now = Utc::now();
        let mut last = OutcomeReceipt::default();
        for _ in 0..5 {
            let event = AuthEvent::new(AuthEventKind::LoginFailure, origin(), now)
                .with_email("pat@example.com");
            last = h.gate.record_outcome(&event, now).await?;
        }
        assert_eq!(last.locked, vec![Scope::Account]);
        Ok(())
    }

    #[tokio::test]
    async fn check_admission_reports_lock() -> anyhow::Result<()> {
        let h = harness(AdmissionPolicy::new());
        let now = Utc::now();
        assert_eq!(
            h.gate.check_admission(Scope::Account, "quinn@example.com", now).await,
            Admission::ALLOWED
        );

        for _ in 0..5 {
            let event = AuthEvent::new(AuthEventKind::LoginFailure, origin(), now)
                .with_email("quinn@example.com");
            h.gate.record_outcome(&event, now).await?;
        }
        let admission = h
            .gate
            .check_admission(Scope::Account, "quinn@example.com", now)
            .await;
        assert!(!admission.allowed);
        assert_eq!(admission.retry_after_seconds, Some(900));
        Ok(())
    }

    #[tokio::test]
    async fn check_admission_ignores_email_case() -> anyhow::Result<()> {
        let h = harness(AdmissionPolicy::new());
        let now = Utc::now();
        for _ in 0..5 {
            let event = AuthEvent::new(AuthEventKind::LoginFailure, origin(), now)
                .with_email("a1@example.com");
            h.gate.record_outcome(&event, now).await?;
        }

        for variant in ["a1@example.com", "A1@example.com", "  A1@EXAMPLE.COM "] {
            let admission = h.gate.check_admission(Scope::Account, variant, now).await;
            assert!(!admission.allowed, "{variant} admitted while locked");
            assert_eq!(admission.retry_after_seconds, Some(900));
        }
        Ok(())
    }

    #[tokio::test]
    async fn case_variants_share_one_throttle_bucket() {
        let h = harness(AdmissionPolicy::new());
        let now = Utc::now();
        let variants = [
            "b2@example.com",
            "B2@example.com",
            "b2@Example.com",
            "B2@EXAMPLE.COM",
            "b2@example.COM",
        ];
        for variant in variants {
            assert!(h.gate.admit(Scope::Account, variant, now).await.is_ok());
        }
        assert!(matches!(
            h.gate.admit(Scope::Account, "b2@EXAMPLE.com", now).await,
            Err(Error::ThrottleExceeded {
                scope: Scope::Account,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn origin_identifier_is_parsed() -> anyhow::Result<()> {
        let policy =
            AdmissionPolicy::new().with_origin_limit(1, std::time::Duration::from_secs(900));
        let h = harness(policy);
        let now = Utc::now();
        let event = AuthEvent::new(AuthEventKind::LoginFailure, origin(), now)
            .with_email("cy@example.com");
        h.gate.record_outcome(&event, now).await?;

        let padded = h.gate.check_admission(Scope::Origin, " 203.0.113.77 ", now).await;
        assert!(!padded.allowed);
        assert!(padded.retry_after_seconds.is_some());

        assert!(matches!(
            h.gate.admit(Scope::Origin, "not-an-address", now).await,
            Err(Error::Invalid(_))
        ));
        assert!(matches!(
            h.gate.admit(Scope::Account, "   ", now).await,
            Err(Error::Invalid(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn unavailable_identity_provider_is_a_store_error() {
        let h = harness(AdmissionPolicy::new());
        h.identity.set_unavailable(true);
        let attempt = LoginAttempt::new("rae@example.com", secret("x"), origin());
        let result = h.gate.authenticate(&attempt, Utc::now()).await;
        assert!(matches!(result, Err(Error::Store(_))));
        assert!(h.ledger.events().await.is_empty());
    }
}
