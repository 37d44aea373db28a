use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use super::{LockKey, LockRegistry, ReadWriteLock};
use crate::error::{Error, Result};
use crate::schema::SchemaStore;

/// Write locks taken so far by a tenant acquisition. Dropped before
/// `keep`, e.g. when the acquisition future is abandoned, it gives them
/// back.
struct Held(Vec<Arc<ReadWriteLock>>);

impl Held {
    fn keep(mut self) -> Vec<Arc<ReadWriteLock>> {
        std::mem::take(&mut self.0)
    }
}

impl Drop for Held {
    fn drop(&mut self) {
        for lock in self.0.iter().rev() {
            lock.release_write();
        }
    }
}

/// Global, tenant, table and record locks over one [`LockRegistry`].
///
/// Every scope is a registry key, so a table lock taken here and the same
/// `LockKey::table` taken on the registry directly are one lock, and free
/// locks of every scope are subject to the idle sweep. Global, tenant and
/// table keys are single-permit mutexes.
///
/// Tenant acquisition takes every table lock the registry knows for the
/// tenant (in table name order) before the tenant lock itself. Code that
/// holds a table lock and then waits for its tenant therefore cannot
/// deadlock against a tenant locker that already holds the tenant lock and
/// waits for that table.
///
/// All acquisitions wait indefinitely. Use the `*_within` variants, or drop
/// the future, to give up; permits taken so far are returned either way.
pub struct LockManager {
    schema: Arc<dyn SchemaStore>,
    locks: Arc<LockRegistry>,
    // Table locks taken on behalf of a held tenant lock.
    tenant_holds: Mutex<HashMap<String, Vec<Arc<ReadWriteLock>>>>,
}

impl LockManager {
    pub fn new(schema: Arc<dyn SchemaStore>, locks: Arc<LockRegistry>) -> Self {
        Self {
            schema,
            locks,
            tenant_holds: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<LockRegistry> {
        &self.locks
    }

    // ===== GLOBAL =====

    pub async fn acquire_global(&self) -> Result<()> {
        self.locks.acquire_write(&LockKey::global()).await?;
        tracing::debug!("Acquired global lock");
        Ok(())
    }

    pub async fn acquire_global_within(&self, timeout: Duration) -> Result<()> {
        self.locks
            .acquire_write_within(&LockKey::global(), timeout)
            .await?;
        tracing::debug!("Acquired global lock");
        Ok(())
    }

    pub fn release_global(&self) {
        self.locks.release_write(&LockKey::global());
        tracing::debug!("Released global lock");
    }

    pub fn is_global_locked(&self) -> bool {
        self.locks.is_locked(&LockKey::global())
    }

    // ===== TENANT =====

    pub async fn acquire_tenant(&self, tenant: &str) -> Result<()> {
        if !self.schema.tenant_exists(tenant) {
            return Err(Error::UnknownTenant(tenant.to_string()));
        }

        let mut held = Held(Vec::new());
        for table in self.locks.table_locks(tenant) {
            table.acquire_write().await?;
            held.0.push(table);
        }
        self.locks.acquire_write(&LockKey::tenant(tenant)).await?;

        let tables = held.keep();
        self.tenant_holds
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(tenant.to_string(), tables);

        tracing::debug!(tenant, "Acquired tenant lock");
        Ok(())
    }

    pub async fn acquire_tenant_within(&self, tenant: &str, timeout: Duration) -> Result<()> {
        tokio::time::timeout(timeout, self.acquire_tenant(tenant))
            .await
            .map_err(|_| Error::LockTimeout(LockKey::tenant(tenant).to_string()))?
    }

    /// Releases the tables taken by `acquire_tenant`, then the tenant lock.
    pub fn release_tenant(&self, tenant: &str) {
        let Some(tables) = self
            .tenant_holds
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(tenant)
        else {
            return;
        };

        for table in &tables {
            table.release_write();
        }
        self.locks.release_write(&LockKey::tenant(tenant));
        tracing::debug!(tenant, "Released tenant lock");
    }

    pub fn is_tenant_locked(&self, tenant: &str) -> bool {
        self.locks.is_locked(&LockKey::tenant(tenant))
    }

    // ===== TABLE =====

    fn check_table(&self, tenant: &str, table: &str) -> Result<()> {
        if !self.schema.tenant_exists(tenant) {
            return Err(Error::UnknownTenant(tenant.to_string()));
        }
        if !self.schema.table_exists(tenant, table) {
            return Err(Error::UnknownTable(tenant.to_string(), table.to_string()));
        }
        Ok(())
    }

    pub async fn acquire_table(&self, tenant: &str, table: &str) -> Result<()> {
        self.check_table(tenant, table)?;
        self.locks
            .acquire_write(&LockKey::table(tenant, table))
            .await?;
        tracing::debug!(tenant, table, "Acquired table lock");
        Ok(())
    }

    pub async fn acquire_table_within(
        &self,
        tenant: &str,
        table: &str,
        timeout: Duration,
    ) -> Result<()> {
        self.check_table(tenant, table)?;
        self.locks
            .acquire_write_within(&LockKey::table(tenant, table), timeout)
            .await?;
        tracing::debug!(tenant, table, "Acquired table lock");
        Ok(())
    }

    pub fn release_table(&self, tenant: &str, table: &str) {
        self.locks.release_write(&LockKey::table(tenant, table));
        tracing::debug!(tenant, table, "Released table lock");
    }

    pub fn is_table_locked(&self, tenant: &str, table: &str) -> bool {
        self.locks.is_locked(&LockKey::table(tenant, table))
    }

    // ===== RECORD =====

    pub async fn acquire_record_read(&self, tenant: &str, table: &str, record: &str) -> Result<()> {
        self.check_table(tenant, table)?;
        self.locks
            .acquire_read(&LockKey::record(tenant, table, record))
            .await
    }

    pub async fn acquire_record_write(
        &self,
        tenant: &str,
        table: &str,
        record: &str,
    ) -> Result<()> {
        self.check_table(tenant, table)?;
        self.locks
            .acquire_write(&LockKey::record(tenant, table, record))
            .await
    }

    pub fn release_record_read(&self, tenant: &str, table: &str, record: &str) {
        self.locks
            .release_read(&LockKey::record(tenant, table, record));
    }

    pub fn release_record_write(&self, tenant: &str, table: &str, record: &str) {
        self.locks
            .release_write(&LockKey::record(tenant, table, record));
    }
}
