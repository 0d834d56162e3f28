//! Registry of tenants known to be active
//!
//! Membership is a best-effort cache that only grows. A tenant missing from
//! the registry may still be running (activated before a restart or by
//! another actor), and a tenant present in it may since have been torn down:
//! there is no eviction and no re-check once a tenant has been recorded.

use dashmap::DashSet;

/// Concurrency-safe store of active tenants.
///
/// Injected into the dispatcher so tests can supply their own store.
pub trait ActivationStore: Send + Sync {
    /// Whether the tenant has been recorded as active
    fn contains(&self, tenant: &str) -> bool;

    /// Record the tenant as active.
    ///
    /// Returns `true` if this call inserted it, `false` if it was already present.
    fn mark_active(&self, tenant: &str) -> bool;

    /// Tenants currently recorded, in no particular order
    fn tenants(&self) -> Vec<String>;
}

/// In-memory [`ActivationStore`] backed by a sharded concurrent set
#[derive(Debug, Default)]
pub struct ActivationRegistry {
    tenants: DashSet<String>,
}

impl ActivationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tenants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tenants.is_empty()
    }
}

impl ActivationStore for ActivationRegistry {
    fn contains(&self, tenant: &str) -> bool {
        self.tenants.contains(tenant)
    }

    fn mark_active(&self, tenant: &str) -> bool {
        self.tenants.insert(tenant.to_string())
    }

    fn tenants(&self) -> Vec<String> {
        self.tenants.iter().map(|t| t.key().clone()).collect()
    }
}
