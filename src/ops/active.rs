use std::collections::HashMap;
use std::sync::Arc;

use super::{Operable, OperationHandle};

/// An admitted operation.
///
/// The slot is reserved before the operation is dispatched so a tenant
/// never has two admissions in flight; the implementation and its handle
/// are attached once dispatch has happened.
pub struct ActiveOperation {
    pub tenant: String,
    pub table: String,
    pub operable: Option<Arc<dyn Operable>>,
    pub handle: Option<OperationHandle>,
}

/// Operations currently admitted, keyed by opid.
#[derive(Default)]
pub struct ActiveOperationStore {
    active: HashMap<String, ActiveOperation>,
}

impl ActiveOperationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reserve(&mut self, tenant: &str, table: &str, opid: &str) {
        self.active.insert(
            opid.to_string(),
            ActiveOperation {
                tenant: tenant.to_string(),
                table: table.to_string(),
                operable: None,
                handle: None,
            },
        );
    }

    /// Fill in a reserved slot. Returns false if the operation already
    /// finished and its slot is gone.
    pub fn attach(
        &mut self,
        opid: &str,
        operable: Option<Arc<dyn Operable>>,
        handle: OperationHandle,
    ) -> bool {
        match self.active.get_mut(opid) {
            Some(slot) => {
                slot.operable = operable;
                slot.handle = Some(handle);
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, opid: &str) -> Option<ActiveOperation> {
        self.active.remove(opid)
    }

    pub fn contains(&self, opid: &str) -> bool {
        self.active.contains_key(opid)
    }

    pub fn get(&self, opid: &str) -> Option<&ActiveOperation> {
        self.active.get(opid)
    }

    pub fn has_tenant(&self, tenant: &str) -> bool {
        self.active.values().any(|op| op.tenant == tenant)
    }

    /// Opid of the tenant's running operation, if any
    pub fn active_for(&self, tenant: &str) -> Option<String> {
        self.active
            .iter()
            .find(|(_, op)| op.tenant == tenant)
            .map(|(opid, _)| opid.clone())
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }
}
