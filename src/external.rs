//! Contracts for the collaborators this core calls but does not own.
//!
//! Async methods return boxed futures so the traits stay object safe and can be
//! held as `Arc<dyn ..>` by [`crate::AuthGate`] and [`crate::AccountLifecycle`].

use anyhow::Context;
use secrecy::SecretString;
use std::future::Future;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::pin::Pin;
use tracing::{debug, warn};
use uuid::Uuid;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = anyhow::Result<T>> + Send + 'a>>;

/// Identity provider holding the credentials.
pub trait IdentityProvider: Send + Sync {
    /// Returns the account id for valid credentials, `None` for a mismatch.
    /// An `Err` means the provider could not answer.
    fn verify_credentials<'a>(
        &'a self,
        email: &'a str,
        password: &'a SecretString,
    ) -> BoxFuture<'a, Option<Uuid>>;

    /// Remove the account from the provider. Called only after a purge commits.
    fn remove_account(&self, account_id: Uuid) -> BoxFuture<'_, ()>;
}

/// Per-reference outcome of an object removal.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectRemoval {
    pub reference: String,
    pub result: Result<(), String>,
}

impl ObjectRemoval {
    #[must_use]
    pub fn removed(reference: impl Into<String>) -> Self {
        Self {
            reference: reference.into(),
            result: Ok(()),
        }
    }

    #[must_use]
    pub fn failed(reference: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            reference: reference.into(),
            result: Err(reason.into()),
        }
    }

    #[must_use]
    pub fn is_removed(&self) -> bool {
        self.result.is_ok()
    }
}

/// Blob store. Never called from inside a database transaction that holds
/// account locks.
pub trait ObjectStorage: Send + Sync {
    /// Remove every reference, reporting success or failure per reference.
    /// Removing an object that is already gone counts as success.
    fn remove_objects<'a>(&'a self, refs: &'a [String]) -> BoxFuture<'a, Vec<ObjectRemoval>>;
}

/// Object storage on a local directory tree, references being paths relative
/// to `root`.
#[derive(Clone, Debug)]
pub struct FsObjectStorage {
    root: PathBuf,
}

impl FsObjectStorage {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a reference under the root, rejecting anything that could escape it.
    fn resolve(&self, reference: &str) -> Result<PathBuf, String> {
        let relative = Path::new(reference);
        if reference.is_empty()
            || !relative
                .components()
                .all(|component| matches!(component, Component::Normal(_)))
        {
            return Err(format!("reference escapes storage root: {reference}"));
        }
        Ok(self.root.join(relative))
    }

    async fn remove_one(&self, reference: &str) -> ObjectRemoval {
        let path = match self.resolve(reference) {
            Ok(path) => path,
            Err(reason) => return ObjectRemoval::failed(reference, reason),
        };
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!(reference, "object removed");
                ObjectRemoval::removed(reference)
            }
            Err(err) if err.kind() == ErrorKind::NotFound => ObjectRemoval::removed(reference),
            Err(err) => {
                warn!(reference, "object removal failed: {err}");
                ObjectRemoval::failed(reference, err.to_string())
            }
        }
    }
}

impl ObjectStorage for FsObjectStorage {
    fn remove_objects<'a>(&'a self, refs: &'a [String]) -> BoxFuture<'a, Vec<ObjectRemoval>> {
        Box::pin(async move {
            tokio::fs::metadata(&self.root)
                .await
                .with_context(|| format!("storage root unavailable: {}", self.root.display()))?;

            let mut removals = Vec::with_capacity(refs.len());
            for reference in refs {
                removals.push(self.remove_one(reference).await);
            }
            Ok(removals)
        })
    }
}
