//! Multi-granularity locking.
//!
//! Four scopes share one idiom, counting semaphores:
//!
//! ```text
//!   GLOBAL                      1 permit, cluster/topology changes
//!     └─ TENANT(t)              1 permit, taken after every table of t
//!          └─ TABLE(t, tb)      1 permit, schema changes
//!               └─ RECORD(...)  N permits, N readers XOR one writer
//! ```
//!
//! [`LockRegistry`] owns a [`ReadWriteLock`] per key of every scope,
//! creating it on first use and evicting it once idle. [`LockManager`] is
//! the validated, hierarchy-aware front over the same registry.
//!
//! Acquisition waits without a deadline. Callers that need a bound use the
//! `*_within` variants or drop the acquisition future; neither leaves
//! permits behind.

pub mod manager;
pub mod registry;
pub mod rwlock;
pub(crate) mod semaphore;

pub use manager::LockManager;
pub use registry::{LockRegistry, LockSweepTask};
pub use rwlock::{ReadGuard, ReadWriteLock, WriteGuard};

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LockScope {
    Global,
    Tenant,
    Table,
    Record,
}

/// Observable state of a [`ReadWriteLock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LockType {
    None = 0,
    Read = 1,
    Write = 2,
}

impl LockType {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => LockType::Read,
            2 => LockType::Write,
            _ => LockType::None,
        }
    }
}

/// Identity of a lockable resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LockKey {
    scope: LockScope,
    tenant: Option<String>,
    table: Option<String>,
    record: Option<String>,
}

impl LockKey {
    pub fn global() -> Self {
        Self {
            scope: LockScope::Global,
            tenant: None,
            table: None,
            record: None,
        }
    }

    pub fn tenant(tenant: impl Into<String>) -> Self {
        Self {
            scope: LockScope::Tenant,
            tenant: Some(tenant.into()),
            table: None,
            record: None,
        }
    }

    pub fn table(tenant: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            scope: LockScope::Table,
            tenant: Some(tenant.into()),
            table: Some(table.into()),
            record: None,
        }
    }

    pub fn record(
        tenant: impl Into<String>,
        table: impl Into<String>,
        record: impl Into<String>,
    ) -> Self {
        Self {
            scope: LockScope::Record,
            tenant: Some(tenant.into()),
            table: Some(table.into()),
            record: Some(record.into()),
        }
    }

    pub fn scope(&self) -> LockScope {
        self.scope
    }

    pub fn tenant_name(&self) -> Option<&str> {
        self.tenant.as_deref()
    }

    pub fn table_name(&self) -> Option<&str> {
        self.table.as_deref()
    }

    pub fn record_key(&self) -> Option<&str> {
        self.record.as_deref()
    }
}

/// `tenant-table-record`, for logs only.
impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.scope == LockScope::Global {
            return write!(f, "global");
        }
        let parts = [&self.tenant, &self.table, &self.record];
        let mut first = true;
        for part in parts.into_iter().flatten() {
            if !first {
                write!(f, "-")?;
            }
            write!(f, "{}", part)?;
            first = false;
        }
        Ok(())
    }
}
