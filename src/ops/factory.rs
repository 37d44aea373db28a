use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use super::{Operable, OperationKind};
use crate::error::{Error, Result};

/// Lookup of implementations by (type, sub-type).
#[derive(Default)]
pub struct OperationFactory {
    operables: RwLock<HashMap<OperationKind, Arc<dyn Operable>>>,
}

impl OperationFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an implementation under its own kind, replacing any earlier one
    pub fn register(&self, operable: Arc<dyn Operable>) {
        let kind = operable.kind();
        self.operables
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(kind, operable);
    }

    pub fn get(&self, kind: OperationKind) -> Result<Arc<dyn Operable>> {
        self.operables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .cloned()
            .ok_or_else(|| {
                Error::InternalOperation(format!("no implementation registered for {:?}", kind))
            })
    }

    pub fn kinds(&self) -> Vec<OperationKind> {
        self.operables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect()
    }
}
