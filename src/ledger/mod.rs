//! Append-only security event ledger.
//!
//! Events are immutable. They are removed only by an account purge or by the
//! retention prune, never updated. The lockout machine derives its state from
//! windowed counts over this ledger, so `count_since` must observe every
//! committed `append` (the store's read-after-write guarantee is enough).

mod postgres;

pub use postgres::{append_in, PgEventLedger};

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use uuid::Uuid;

use crate::external::BoxFuture;
use crate::policy::Scope;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AuthEventKind {
    SignupSuccess,
    SignupFailure,
    LoginSuccess,
    LoginFailure,
    EmailVerified,
    AccountLocked,
    IpBlocked,
    AccountDeleted,
}

impl AuthEventKind {
    pub const ALL: [Self; 8] = [
        Self::SignupSuccess,
        Self::SignupFailure,
        Self::LoginSuccess,
        Self::LoginFailure,
        Self::EmailVerified,
        Self::AccountLocked,
        Self::IpBlocked,
        Self::AccountDeleted,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SignupSuccess => "signup_success",
            Self::SignupFailure => "signup_failure",
            Self::LoginSuccess => "login_success",
            Self::LoginFailure => "login_failure",
            Self::EmailVerified => "email_verified",
            Self::AccountLocked => "account_locked",
            Self::IpBlocked => "ip_blocked",
            Self::AccountDeleted => "account_deleted",
        }
    }

    /// Events whose loss would open a bypass. Appending them fails closed.
    ///
    /// `login_failure` is included because the lockout count is built from it.
    #[must_use]
    pub const fn is_security_critical(self) -> bool {
        matches!(
            self,
            Self::LoginFailure | Self::AccountLocked | Self::IpBlocked | Self::AccountDeleted
        )
    }
}

impl fmt::Display for AuthEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuthEventKind {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == value)
            .ok_or_else(|| anyhow::anyhow!("unknown auth event type: {value}"))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct AuthEvent {
    pub id: Uuid,
    pub kind: AuthEventKind,
    pub account_id: Option<Uuid>,
    pub email: Option<String>,
    pub origin: IpAddr,
    pub user_agent: Option<String>,
    pub metadata: Map<String, Value>,
    pub created_at: DateTime<Utc>,
}

impl AuthEvent {
    #[must_use]
    pub fn new(kind: AuthEventKind, origin: IpAddr, created_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7(),
            kind,
            account_id: None,
            email: None,
            origin,
            user_agent: None,
            metadata: Map::new(),
            created_at,
        }
    }

    #[must_use]
    pub fn with_account_id(mut self, account_id: Uuid) -> Self {
        self.account_id = Some(account_id);
        self
    }

    /// Stores the email normalized, so account-scope counts match however the
    /// user typed it.
    #[must_use]
    pub fn with_email(mut self, email: &str) -> Self {
        self.email = Some(normalize_email(email));
        self
    }

    #[must_use]
    pub fn with_user_agent(mut self, user_agent: Option<String>) -> Self {
        self.user_agent = user_agent;
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    /// Account-scope identifier: the normalized email, else the account id.
    #[must_use]
    pub fn subject(&self) -> Option<String> {
        self.email
            .clone()
            .or_else(|| self.account_id.map(|id| id.to_string()))
    }

    /// Identifier this event is counted under for `scope`.
    #[must_use]
    pub fn identifier(&self, scope: Scope) -> Option<String> {
        match scope {
            Scope::Account => self.subject(),
            Scope::Origin => Some(self.origin.to_string()),
        }
    }

    /// Structural checks applied before an event reaches any store.
    ///
    /// # Errors
    /// Returns an error when a `login_failure` has neither email nor account id.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.kind == AuthEventKind::LoginFailure && self.subject().is_none() {
            return Err("login_failure requires an email or an account id");
        }
        Ok(())
    }
}

/// Normalize an email for lookup and counting.
#[must_use]
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Ledger backend. Implementations must be safe to share across tasks and,
/// for multi-instance deployments, across processes.
pub trait EventLedger: Send + Sync {
    /// Persist an event and return its id.
    fn append<'a>(&'a self, event: &'a AuthEvent) -> BoxFuture<'a, Uuid>;

    /// Count `kind` events for `identifier` in `scope` created strictly after `since`.
    fn count_since<'a>(
        &'a self,
        scope: Scope,
        identifier: &'a str,
        kind: AuthEventKind,
        since: DateTime<Utc>,
    ) -> BoxFuture<'a, i64>;

    /// Creation time of the newest `kind` event for `identifier` after `since`.
    fn latest_since<'a>(
        &'a self,
        scope: Scope,
        identifier: &'a str,
        kind: AuthEventKind,
        since: DateTime<Utc>,
    ) -> BoxFuture<'a, Option<DateTime<Utc>>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn origin() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7))
    }

    #[test]
    fn kinds_round_trip_through_strings() {
        for kind in AuthEventKind::ALL {
            assert_eq!(kind.as_str().parse::<AuthEventKind>().ok(), Some(kind));
        }
        assert!("password_reset".parse::<AuthEventKind>().is_err());
    }

    #[test]
    fn critical_kinds() {
        assert!(AuthEventKind::LoginFailure.is_security_critical());
        assert!(AuthEventKind::AccountLocked.is_security_critical());
        assert!(AuthEventKind::AccountDeleted.is_security_critical());
        assert!(!AuthEventKind::LoginSuccess.is_security_critical());
        assert!(!AuthEventKind::SignupFailure.is_security_critical());
    }

    #[test]
    fn subject_prefers_normalized_email() {
        let account_id = Uuid::now_v7();
        let event = AuthEvent::new(AuthEventKind::LoginFailure, origin(), Utc::now())
            .with_account_id(account_id)
            .with_email("  Alice@Example.COM ");
        assert_eq!(event.subject().as_deref(), Some("alice@example.com"));
        assert_eq!(
            event.identifier(Scope::Origin).as_deref(),
            Some("203.0.113.7")
        );

        let by_id = AuthEvent::new(AuthEventKind::LoginFailure, origin(), Utc::now())
            .with_account_id(account_id);
        assert_eq!(by_id.subject(), Some(account_id.to_string()));
    }

    #[test]
    fn login_failure_needs_subject() {
        let event = AuthEvent::new(AuthEventKind::LoginFailure, origin(), Utc::now());
        assert!(event.validate().is_err());

        let signup = AuthEvent::new(AuthEventKind::SignupFailure, origin(), Utc::now());
        assert!(signup.validate().is_ok());
    }

    #[test]
    fn metadata_builder_inserts_values() {
        let event = AuthEvent::new(AuthEventKind::AccountLocked, origin(), Utc::now())
            .with_metadata("failures", 5)
            .with_metadata("reason", "threshold");
        assert_eq!(event.metadata.get("failures"), Some(&Value::from(5)));
        assert_eq!(event.metadata.get("reason"), Some(&Value::from("threshold")));
    }
}
