//! In-process collaborators.
//!
//! These back single-node deployments and the behavioral tests. Each one can
//! be switched to "unavailable" to exercise the fail-closed and fail-open paths.
//!
//! Long-running processes call [`MemoryCounterService::prune_expired`] and
//! [`MemoryEventLedger::prune_before`] on a timer, the way `gatekeep prune`
//! trims the `PostgreSQL` tables.

use anyhow::bail;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::external::{BoxFuture, IdentityProvider, ObjectRemoval, ObjectStorage};
use crate::ledger::{AuthEvent, AuthEventKind, EventLedger};
use crate::policy::{subtract, Scope};
use crate::throttle::{verdict, CounterService, WindowVerdict};

#[derive(Debug, Default)]
pub struct MemoryEventLedger {
    events: Mutex<Vec<AuthEvent>>,
    unavailable: AtomicBool,
}

impl MemoryEventLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail as if the store were unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Snapshot of every appended event, oldest first.
    pub async fn events(&self) -> Vec<AuthEvent> {
        self.events.lock().await.clone()
    }

    /// Drop events created at or before `cutoff`. Returns how many went.
    ///
    /// # Errors
    /// Returns an error while the ledger is marked unavailable.
    pub async fn prune_before(&self, cutoff: DateTime<Utc>) -> anyhow::Result<u64> {
        self.ensure_available()?;
        let mut events = self.events.lock().await;
        let before = events.len();
        events.retain(|event| event.created_at > cutoff);
        Ok(u64::try_from(before - events.len())?)
    }

    fn ensure_available(&self) -> anyhow::Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            bail!("event ledger unavailable");
        }
        Ok(())
    }

    async fn matching(
        &self,
        scope: Scope,
        identifier: &str,
        kind: AuthEventKind,
        since: DateTime<Utc>,
    ) -> anyhow::Result<Vec<DateTime<Utc>>> {
        self.ensure_available()?;
        let events = self.events.lock().await;
        Ok(events
            .iter()
            .filter(|event| {
                event.kind == kind
                    && event.created_at > since
                    && event.identifier(scope).as_deref() == Some(identifier)
            })
            .map(|event| event.created_at)
            .collect())
    }
}

impl EventLedger for MemoryEventLedger {
    fn append<'a>(&'a self, event: &'a AuthEvent) -> BoxFuture<'a, Uuid> {
        Box::pin(async move {
            self.ensure_available()?;
            event.validate().map_err(anyhow::Error::msg)?;
            self.events.lock().await.push(event.clone());
            Ok(event.id)
        })
    }

    fn count_since<'a>(
        &'a self,
        scope: Scope,
        identifier: &'a str,
        kind: AuthEventKind,
        since: DateTime<Utc>,
    ) -> BoxFuture<'a, i64> {
        Box::pin(async move {
            let matching = self.matching(scope, identifier, kind, since).await?;
            Ok(i64::try_from(matching.len())?)
        })
    }

    fn latest_since<'a>(
        &'a self,
        scope: Scope,
        identifier: &'a str,
        kind: AuthEventKind,
        since: DateTime<Utc>,
    ) -> BoxFuture<'a, Option<DateTime<Utc>>> {
        Box::pin(async move {
            let matching = self.matching(scope, identifier, kind, since).await?;
            Ok(matching.into_iter().max())
        })
    }
}

/// Sliding window over admitted hit timestamps, one deque per key.
#[derive(Debug, Default)]
pub struct MemoryCounterService {
    hits: Mutex<HashMap<String, VecDeque<DateTime<Utc>>>>,
    unavailable: AtomicBool,
    delay: Mutex<Option<Duration>>,
}

impl MemoryCounterService {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Stall every check by `delay`, to exercise the admission timeout.
    pub async fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock().await = delay;
    }

    /// Number of keys currently holding hits.
    pub async fn tracked_keys(&self) -> usize {
        self.hits.lock().await.len()
    }

    /// Drop hits at or before `before` for every key, and forget keys left
    /// without hits. Returns the number of hits dropped.
    pub async fn prune_expired(&self, before: DateTime<Utc>) -> u64 {
        let mut hits = self.hits.lock().await;
        let mut dropped = 0_u64;
        hits.retain(|_, entries| {
            dropped += expire(entries, before);
            !entries.is_empty()
        });
        dropped
    }
}

fn expire(entries: &mut VecDeque<DateTime<Utc>>, cutoff: DateTime<Utc>) -> u64 {
    let mut dropped = 0;
    while entries.front().is_some_and(|hit| *hit <= cutoff) {
        entries.pop_front();
        dropped += 1;
    }
    dropped
}

impl CounterService for MemoryCounterService {
    fn sliding_window_check<'a>(
        &'a self,
        key: &'a str,
        capacity: u32,
        window: Duration,
        now: DateTime<Utc>,
    ) -> BoxFuture<'a, WindowVerdict> {
        Box::pin(async move {
            let delay = *self.delay.lock().await;
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if self.unavailable.load(Ordering::SeqCst) {
                bail!("counter service unavailable");
            }

            let cutoff = subtract(now, window);
            let mut hits = self.hits.lock().await;
            let (count, oldest) = match hits.get_mut(key) {
                Some(entries) => {
                    expire(entries, cutoff);
                    (entries.len(), entries.front().copied())
                }
                None => (0, None),
            };

            let verdict = verdict(count, oldest, capacity, window, now);
            if verdict.allowed {
                hits.entry(key.to_string()).or_default().push_back(now);
            } else if count == 0 {
                hits.remove(key);
            }
            Ok(verdict)
        })
    }
}

#[derive(Debug)]
struct Credential {
    account_id: Uuid,
    password: SecretString,
}

/// Identity provider over a fixed credential table.
#[derive(Debug, Default)]
pub struct MemoryIdentityProvider {
    credentials: Mutex<HashMap<String, Credential>>,
    removed: Mutex<Vec<Uuid>>,
    unavailable: AtomicBool,
    fail_removal: AtomicBool,
}

impl MemoryIdentityProvider {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `email` with `password` and return its account id.
    pub async fn register(&self, email: &str, password: &str) -> Uuid {
        let account_id = Uuid::now_v7();
        self.register_with_id(account_id, email, password).await;
        account_id
    }

    pub async fn register_with_id(&self, account_id: Uuid, email: &str, password: &str) {
        self.credentials.lock().await.insert(
            crate::ledger::normalize_email(email),
            Credential {
                account_id,
                password: SecretString::from(password.to_string()),
            },
        );
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn set_fail_removal(&self, fail: bool) {
        self.fail_removal.store(fail, Ordering::SeqCst);
    }

    pub async fn removed(&self) -> Vec<Uuid> {
        self.removed.lock().await.clone()
    }
}

impl IdentityProvider for MemoryIdentityProvider {
    fn verify_credentials<'a>(
        &'a self,
        email: &'a str,
        password: &'a SecretString,
    ) -> BoxFuture<'a, Option<Uuid>> {
        Box::pin(async move {
            if self.unavailable.load(Ordering::SeqCst) {
                bail!("identity provider unavailable");
            }
            let credentials = self.credentials.lock().await;
            Ok(credentials
                .get(&crate::ledger::normalize_email(email))
                .filter(|credential| {
                    credential.password.expose_secret() == password.expose_secret()
                })
                .map(|credential| credential.account_id))
        })
    }

    fn remove_account(&self, account_id: Uuid) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if self.fail_removal.load(Ordering::SeqCst) {
                bail!("identity provider rejected removal of {account_id}");
            }
            self.credentials
                .lock()
                .await
                .retain(|_, credential| credential.account_id != account_id);
            self.removed.lock().await.push(account_id);
            Ok(())
        })
    }
}

/// Object store keeping references in a set. References listed as failing
/// report a per-object error without being removed.
#[derive(Debug, Default)]
pub struct MemoryObjectStorage {
    objects: Mutex<BTreeSet<String>>,
    failing: Mutex<HashSet<String>>,
    unavailable: AtomicBool,
}

impl MemoryObjectStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put(&self, reference: &str) {
        self.objects.lock().await.insert(reference.to_string());
    }

    pub async fn fail_on(&self, reference: &str) {
        self.failing.lock().await.insert(reference.to_string());
    }

    pub async fn heal(&self) {
        self.failing.lock().await.clear();
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub async fn contains(&self, reference: &str) -> bool {
        self.objects.lock().await.contains(reference)
    }
}

impl ObjectStorage for MemoryObjectStorage {
    fn remove_objects<'a>(&'a self, refs: &'a [String]) -> BoxFuture<'a, Vec<ObjectRemoval>> {
        Box::pin(async move {
            if self.unavailable.load(Ordering::SeqCst) {
                bail!("object storage unavailable");
            }
            let failing = self.failing.lock().await;
            let mut objects = self.objects.lock().await;
            Ok(refs
                .iter()
                .map(|reference| {
                    if failing.contains(reference) {
                        ObjectRemoval::failed(reference.as_str(), "injected failure")
                    } else {
                        objects.remove(reference);
                        ObjectRemoval::removed(reference.as_str())
                    }
                })
                .collect())
        })
    }
}
