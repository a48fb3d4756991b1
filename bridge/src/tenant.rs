//! Tenant identity, execution contexts and budget gating.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::BridgeResult;

/// Unique identifier for a tenant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TenantId {
    fn default() -> Self {
        Self("default".to_string())
    }
}

impl std::fmt::Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for TenantId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for TenantId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifier scoping one agent run.
///
/// Opaque to the bridge; at most one [`Bridge`](crate::core::bridge::Bridge)
/// exists per live context.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionContextId(String);

impl ExecutionContextId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random context id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ExecutionContextId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ExecutionContextId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ExecutionContextId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Source of remaining tenant spend, queried before every dispatch.
#[async_trait]
pub trait BudgetProvider: Send + Sync {
    /// Remaining spend for `tenant`. `None` means unlimited.
    async fn remaining(&self, tenant: &TenantId) -> BridgeResult<Option<f64>>;
}

/// Budget provider that never blocks an invocation.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnlimitedBudget;

#[async_trait]
impl BudgetProvider for UnlimitedBudget {
    async fn remaining(&self, _tenant: &TenantId) -> BridgeResult<Option<f64>> {
        Ok(None)
    }
}

/// In-memory budget ledger.
///
/// Tenants without an entry are unlimited.
#[derive(Debug, Default)]
pub struct StaticBudget {
    remaining: DashMap<TenantId, f64>,
}

impl StaticBudget {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries<I, K>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, f64)>,
        K: Into<TenantId>,
    {
        let ledger = Self::new();
        for (tenant, amount) in entries {
            ledger.set_remaining(tenant, amount);
        }
        ledger
    }

    pub fn set_remaining(&self, tenant: impl Into<TenantId>, amount: f64) {
        self.remaining.insert(tenant.into(), amount);
    }

    /// Deduct `amount` from a tenant's remaining spend, returning the new balance.
    pub fn charge(&self, tenant: &TenantId, amount: f64) -> Option<f64> {
        self.remaining.get_mut(tenant).map(|mut balance| {
            *balance -= amount;
            *balance
        })
    }

    pub fn clear(&self, tenant: &TenantId) {
        self.remaining.remove(tenant);
    }

    pub fn into_provider(self) -> Arc<dyn BudgetProvider> {
        Arc::new(self)
    }
}

#[async_trait]
impl BudgetProvider for StaticBudget {
    async fn remaining(&self, tenant: &TenantId) -> BridgeResult<Option<f64>> {
        Ok(self.remaining.get(tenant).map(|v| *v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tenant_id() {
        let id = TenantId::new("tenant-123");
        assert_eq!(id.as_str(), "tenant-123");
        assert_eq!(id.to_string(), "tenant-123");
    }

    #[test]
    fn test_context_id_generate_is_unique() {
        let a = ExecutionContextId::generate();
        let b = ExecutionContextId::generate();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_static_budget() {
        let ledger = StaticBudget::from_entries([("acme", 10.0)]);
        let acme = TenantId::new("acme");

        assert_eq!(ledger.remaining(&acme).await.unwrap(), Some(10.0));
        assert_eq!(ledger.charge(&acme, 4.0), Some(6.0));
        assert_eq!(ledger.remaining(&acme).await.unwrap(), Some(6.0));

        let other = TenantId::new("other");
        assert_eq!(ledger.remaining(&other).await.unwrap(), None);
        assert_eq!(ledger.charge(&other, 1.0), None);

        ledger.clear(&acme);
        assert_eq!(ledger.remaining(&acme).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unlimited_budget() {
        let budget = UnlimitedBudget;
        assert_eq!(
            budget.remaining(&TenantId::default()).await.unwrap(),
            None
        );
    }
}
