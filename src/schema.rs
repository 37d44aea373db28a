use std::collections::{HashMap, HashSet};
use std::sync::{RwLock, PoisonError};

/// Read-only view of which tenants and tables exist.
///
/// Lock acquisition consults it so that a typo in a tenant name fails fast
/// instead of creating a lock nobody else will ever contend on.
pub trait SchemaStore: Send + Sync {
    fn tenant_exists(&self, tenant: &str) -> bool;

    fn table_exists(&self, tenant: &str, table: &str) -> bool;
}

/// In-memory schema, for embedding and tests
#[derive(Default)]
pub struct MemorySchema {
    tenants: RwLock<HashMap<String, HashSet<String>>>,
}

impl MemorySchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_tenant(&self, tenant: &str) {
        self.tenants
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(tenant.to_string())
            .or_default();
    }

    /// Creates the tenant too if needed
    pub fn create_table(&self, tenant: &str, table: &str) {
        self.tenants
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(tenant.to_string())
            .or_default()
            .insert(table.to_string());
    }

    pub fn drop_table(&self, tenant: &str, table: &str) {
        if let Some(tables) = self
            .tenants
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(tenant)
        {
            tables.remove(table);
        }
    }

    pub fn drop_tenant(&self, tenant: &str) {
        self.tenants
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(tenant);
    }
}

impl SchemaStore for MemorySchema {
    fn tenant_exists(&self, tenant: &str) -> bool {
        self.tenants
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(tenant)
    }

    fn table_exists(&self, tenant: &str, table: &str) -> bool {
        self.tenants
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(tenant)
            .is_some_and(|tables| tables.contains(table))
    }
}
