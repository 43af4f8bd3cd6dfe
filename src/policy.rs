//! Admission policy shared by the throttle engine and the lockout machine.
//!
//! Both layers key on the same two scopes and read their thresholds and windows
//! from one [`AdmissionPolicy`]. Changing a limit here changes it for both.

use chrono::{DateTime, Utc};
use std::fmt;
use std::time::Duration;

use crate::ledger::AuthEventKind;

const DEFAULT_WINDOW: Duration = Duration::from_secs(15 * 60);
const DEFAULT_ACCOUNT_THRESHOLD: u32 = 5;
const DEFAULT_ORIGIN_THRESHOLD: u32 = 20;
const DEFAULT_LOCKOUT_DURATION: Duration = Duration::from_secs(15 * 60);
const DEFAULT_CHECK_TIMEOUT: Duration = Duration::from_secs(2);

/// Dimension an admission decision is keyed on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Scope {
    Account,
    Origin,
}

impl Scope {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Account => "account",
            Self::Origin => "origin",
        }
    }

    /// Ledger event appended when this scope transitions to `LOCKED`.
    #[must_use]
    pub const fn lock_event(self) -> AuthEventKind {
        match self {
            Self::Account => AuthEventKind::AccountLocked,
            Self::Origin => AuthEventKind::IpBlocked,
        }
    }

    /// Key used by the shared counter service, e.g. `origin:203.0.113.7`.
    #[must_use]
    pub fn counter_key(self, identifier: &str) -> String {
        format!("{}:{identifier}", self.as_str())
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Threshold and trailing window for one scope.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScopeLimit {
    threshold: u32,
    window: Duration,
}

impl ScopeLimit {
    #[must_use]
    pub const fn new(threshold: u32, window: Duration) -> Self {
        Self { threshold, window }
    }

    #[must_use]
    pub const fn threshold(&self) -> u32 {
        self.threshold
    }

    #[must_use]
    pub const fn window(&self) -> Duration {
        self.window
    }

    /// Start of the trailing window ending at `now` (exclusive bound).
    #[must_use]
    pub fn window_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        subtract(now, self.window)
    }

    #[must_use]
    pub fn window_seconds(&self) -> u64 {
        self.window.as_secs().max(1)
    }

    fn normalize(self) -> Self {
        Self {
            threshold: self.threshold.max(1),
            window: if self.window.is_zero() {
                Duration::from_secs(1)
            } else {
                self.window
            },
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AdmissionPolicy {
    account: ScopeLimit,
    origin: ScopeLimit,
    lockout_duration: Duration,
    check_timeout: Duration,
    throttle_fail_open: bool,
}

impl AdmissionPolicy {
    /// Default policy: 5 per account and 20 per origin within 15 minutes,
    /// 15-minute lockout, 2s check timeout, throttle fails closed.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            account: ScopeLimit::new(DEFAULT_ACCOUNT_THRESHOLD, DEFAULT_WINDOW),
            origin: ScopeLimit::new(DEFAULT_ORIGIN_THRESHOLD, DEFAULT_WINDOW),
            lockout_duration: DEFAULT_LOCKOUT_DURATION,
            check_timeout: DEFAULT_CHECK_TIMEOUT,
            throttle_fail_open: false,
        }
    }

    #[must_use]
    pub fn with_account_limit(mut self, threshold: u32, window: Duration) -> Self {
        self.account = ScopeLimit::new(threshold, window);
        self
    }

    #[must_use]
    pub fn with_origin_limit(mut self, threshold: u32, window: Duration) -> Self {
        self.origin = ScopeLimit::new(threshold, window);
        self
    }

    #[must_use]
    pub fn with_lockout_duration(mut self, duration: Duration) -> Self {
        self.lockout_duration = duration;
        self
    }

    #[must_use]
    pub fn with_check_timeout(mut self, timeout: Duration) -> Self {
        self.check_timeout = timeout;
        self
    }

    /// Let the throttle layer admit requests when the counter service is
    /// unreachable. Lockout checks always fail closed.
    #[must_use]
    pub fn with_throttle_fail_open(mut self, fail_open: bool) -> Self {
        self.throttle_fail_open = fail_open;
        self
    }

    /// Clamp zero values that would disable a layer by accident.
    ///
    /// The lockout duration never drops below the longest failure window, so a
    /// lock cannot expire while the failures that caused it are still counted.
    #[must_use]
    pub fn normalize(self) -> Self {
        let account = self.account.normalize();
        let origin = self.origin.normalize();
        let longest_window = account.window.max(origin.window);
        Self {
            account,
            origin,
            lockout_duration: self.lockout_duration.max(longest_window),
            check_timeout: if self.check_timeout.is_zero() {
                DEFAULT_CHECK_TIMEOUT
            } else {
                self.check_timeout
            },
            throttle_fail_open: self.throttle_fail_open,
        }
    }

    #[must_use]
    pub const fn limit(&self, scope: Scope) -> ScopeLimit {
        match scope {
            Scope::Account => self.account,
            Scope::Origin => self.origin,
        }
    }

    #[must_use]
    pub const fn lockout_duration(&self) -> Duration {
        self.lockout_duration
    }

    #[must_use]
    pub fn lockout_seconds(&self) -> u64 {
        self.lockout_duration.as_secs().max(1)
    }

    #[must_use]
    pub const fn check_timeout(&self) -> Duration {
        self.check_timeout
    }

    #[must_use]
    pub const fn throttle_fail_open(&self) -> bool {
        self.throttle_fail_open
    }

    /// Shortest history the ledger and the counters must keep for admission
    /// decisions to stay correct.
    #[must_use]
    pub fn retention_floor(&self) -> Duration {
        self.lockout_duration
            .max(self.account.window())
            .max(self.origin.window())
    }
}

impl Default for AdmissionPolicy {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn subtract(now: DateTime<Utc>, span: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(span)
        .ok()
        .and_then(|span| now.checked_sub_signed(span))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

pub(crate) fn add(now: DateTime<Utc>, span: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(span)
        .ok()
        .and_then(|span| now.checked_add_signed(span))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Whole seconds from `now` until `until`, rounded up and never below 1.
pub(crate) fn seconds_until(now: DateTime<Utc>, until: DateTime<Utc>) -> u64 {
    let millis = until.signed_duration_since(now).num_milliseconds().max(0);
    let seconds = u64::try_from(millis).unwrap_or(0).div_ceil(1000);
    seconds.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn defaults_match_published_limits() {
        let policy = AdmissionPolicy::new();
        assert_eq!(policy.limit(Scope::Account).threshold(), 5);
        assert_eq!(policy.limit(Scope::Origin).threshold(), 20);
        assert_eq!(
            policy.limit(Scope::Account).window(),
            Duration::from_secs(900)
        );
        assert_eq!(policy.lockout_duration(), Duration::from_secs(900));
        assert!(!policy.throttle_fail_open());
    }

    #[test]
    fn normalize_clamps_zero_values() {
        let policy = AdmissionPolicy::new()
            .with_account_limit(0, Duration::ZERO)
            .with_check_timeout(Duration::ZERO)
            .normalize();
        let account = policy.limit(Scope::Account);
        assert_eq!(account.threshold(), 1);
        assert_eq!(account.window(), Duration::from_secs(1));
        assert_eq!(policy.check_timeout(), DEFAULT_CHECK_TIMEOUT);
    }

    #[test]
    fn normalize_keeps_lockout_at_least_as_long_as_windows() {
        let policy = AdmissionPolicy::new()
            .with_origin_limit(20, Duration::from_secs(3600))
            .with_lockout_duration(Duration::from_secs(60))
            .normalize();
        assert_eq!(policy.lockout_duration(), Duration::from_secs(3600));
    }

    #[test]
    fn retention_floor_covers_every_window() {
        let policy = AdmissionPolicy::new().with_account_limit(5, Duration::from_secs(7200));
        assert_eq!(policy.retention_floor(), Duration::from_secs(7200));
        assert_eq!(
            AdmissionPolicy::new().retention_floor(),
            Duration::from_secs(900)
        );
    }

    #[test]
    fn scope_lock_events_and_keys() {
        assert_eq!(Scope::Account.lock_event(), AuthEventKind::AccountLocked);
        assert_eq!(Scope::Origin.lock_event(), AuthEventKind::IpBlocked);
        assert_eq!(Scope::Origin.counter_key("10.0.0.1"), "origin:10.0.0.1");
        assert_eq!(Scope::Account.to_string(), "account");
    }

    #[test]
    fn window_start_subtracts_window() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let limit = ScopeLimit::new(5, Duration::from_secs(900));
        assert_eq!(
            limit.window_start(now),
            Utc.with_ymd_and_hms(2026, 3, 1, 11, 45, 0).unwrap()
        );
    }

    #[test]
    fn seconds_until_rounds_up_and_floors_at_one() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let later = now + chrono::Duration::milliseconds(1500);
        assert_eq!(seconds_until(now, later), 2);
        assert_eq!(seconds_until(now, now), 1);
        assert_eq!(seconds_until(later, now), 1);
    }
}
