//! Container helpers shared by the gatekeep database tests.
//!
//! Tests call [`runtime::ensure_container_runtime`] first and skip when no
//! Docker/Podman socket is reachable, so `cargo test` stays green on machines
//! without a container runtime.

pub mod postgres;
pub mod runtime;

use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct TestNetwork {
    name: String,
}

impl TestNetwork {
    #[must_use]
    pub fn new(prefix: &str) -> Self {
        Self {
            name: unique_name(prefix),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Unique, lowercase, identifier-safe name (usable as a database name).
#[must_use]
pub fn unique_name(prefix: &str) -> String {
    format!("{prefix}_{}", Uuid::new_v4().simple())
}
