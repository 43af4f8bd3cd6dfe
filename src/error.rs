//! Error taxonomy surfaced to the route handlers.
//!
//! Denials carry the wait the caller should advertise (`Retry-After`).
//! Storage faults are wrapped as [`Error::Store`] with their `anyhow` context
//! chain intact. Duplicate external events are not errors; see
//! [`crate::idempotency::ApplyOutcome::Duplicate`].

use crate::policy::Scope;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Too many {scope} attempts: retry in {retry_after_seconds}s")]
    ThrottleExceeded {
        scope: Scope,
        retry_after_seconds: u64,
    },
    #[error("Account locked: retry in {retry_after_seconds}s")]
    AccountLocked { retry_after_seconds: u64 },
    #[error("Origin blocked: retry in {retry_after_seconds}s")]
    OriginBlocked { retry_after_seconds: u64 },
    #[error("Invalid credentials")]
    InvalidCredentials,
    #[error("Quota exceeded: {current_count} of {limit} used this period")]
    QuotaExceeded { current_count: i64, limit: i64 },
    #[error("Account not found: {0}")]
    AccountNotFound(Uuid),
    #[error("Invalid request: {0}")]
    Invalid(&'static str),
    #[error("Account purge failed: {0}")]
    PurgeFailed(String),
    #[error("Identity removal failed for purged account {account_id}: {reason}")]
    IdentityRemovalFailed { account_id: Uuid, reason: String },
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl Error {
    /// Conservative denial for `scope`, used whenever a check cannot complete.
    pub(crate) fn locked(scope: Scope, retry_after_seconds: u64) -> Self {
        match scope {
            Scope::Account => Self::AccountLocked {
                retry_after_seconds,
            },
            Scope::Origin => Self::OriginBlocked {
                retry_after_seconds,
            },
        }
    }

    /// Seconds the caller must wait before retrying, if the denial is temporary.
    #[must_use]
    pub fn retry_after_seconds(&self) -> Option<u64> {
        match self {
            Self::ThrottleExceeded {
                retry_after_seconds,
                ..
            }
            | Self::AccountLocked {
                retry_after_seconds,
            }
            | Self::OriginBlocked {
                retry_after_seconds,
            } => Some(*retry_after_seconds),
            _ => None,
        }
    }

    /// Whether the same request may succeed later without operator action.
    ///
    /// Quota denials only clear at period rollover, and purge/identity
    /// failures need an operator, so neither counts as retryable.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ThrottleExceeded { .. }
                | Self::AccountLocked { .. }
                | Self::OriginBlocked { .. }
                | Self::Store(_)
        )
    }

    /// Denials produced by the admission layers (as opposed to faults).
    #[must_use]
    pub fn is_denial(&self) -> bool {
        matches!(
            self,
            Self::ThrottleExceeded { .. }
                | Self::AccountLocked { .. }
                | Self::OriginBlocked { .. }
                | Self::InvalidCredentials
                | Self::QuotaExceeded { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn locked_maps_scope_to_variant() {
        assert!(matches!(
            Error::locked(Scope::Account, 30),
            Error::AccountLocked {
                retry_after_seconds: 30
            }
        ));
        assert!(matches!(
            Error::locked(Scope::Origin, 12),
            Error::OriginBlocked {
                retry_after_seconds: 12
            }
        ));
    }

    #[test]
    fn retry_hints_only_for_temporary_denials() {
        let throttled = Error::ThrottleExceeded {
            scope: Scope::Origin,
            retry_after_seconds: 90,
        };
        assert_eq!(throttled.retry_after_seconds(), Some(90));
        assert!(throttled.is_retryable());

        let quota = Error::QuotaExceeded {
            current_count: 10,
            limit: 10,
        };
        assert_eq!(quota.retry_after_seconds(), None);
        assert!(!quota.is_retryable());
        assert!(quota.is_denial());

        let purge = Error::PurgeFailed("boom".to_string());
        assert!(!purge.is_retryable());
        assert!(!purge.is_denial());
    }

    #[test]
    fn store_errors_keep_context_chain() {
        let err = Error::from(anyhow!("connection reset").context("failed to count events"));
        assert_eq!(err.to_string(), "failed to count events");
        assert!(err.is_retryable());
    }

    #[test]
    fn display_messages() {
        let err = Error::ThrottleExceeded {
            scope: Scope::Account,
            retry_after_seconds: 5,
        };
        assert_eq!(err.to_string(), "Too many account attempts: retry in 5s");
        assert_eq!(
            Error::QuotaExceeded {
                current_count: 10,
                limit: 10
            }
            .to_string(),
            "Quota exceeded: 10 of 10 used this period"
        );
    }
}
