use std::collections::{HashMap, VecDeque};

/// Per-tenant FIFO of operations waiting for admission.
///
/// An opid appears at most once. Tenants are independent: the head of one
/// tenant's queue never waits on another tenant.
#[derive(Debug, Default)]
pub struct OperationQueue {
    queues: HashMap<String, VecDeque<String>>,
}

impl OperationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `opid` to the tenant's queue. Returns false if it was
    /// already queued.
    pub fn enqueue(&mut self, tenant: &str, opid: &str) -> bool {
        let queue = self.queues.entry(tenant.to_string()).or_default();
        if queue.iter().any(|queued| queued == opid) {
            return false;
        }
        queue.push_back(opid.to_string());
        true
    }

    /// Remove a specific opid, wherever it sits in the queue
    pub fn dequeue(&mut self, tenant: &str, opid: &str) -> bool {
        let Some(queue) = self.queues.get_mut(tenant) else {
            return false;
        };
        let Some(pos) = queue.iter().position(|queued| queued == opid) else {
            return false;
        };
        queue.remove(pos);
        if queue.is_empty() {
            self.queues.remove(tenant);
        }
        true
    }

    /// Pop the oldest waiting opid of a tenant
    pub fn next(&mut self, tenant: &str) -> Option<String> {
        let queue = self.queues.get_mut(tenant)?;
        let opid = queue.pop_front();
        if queue.is_empty() {
            self.queues.remove(tenant);
        }
        opid
    }

    pub fn has_next(&self, tenant: &str) -> bool {
        self.queues.get(tenant).is_some_and(|q| !q.is_empty())
    }

    pub fn contains(&self, tenant: &str, opid: &str) -> bool {
        self.queues
            .get(tenant)
            .is_some_and(|q| q.iter().any(|queued| queued == opid))
    }

    /// Waiting opids of a tenant, oldest first
    pub fn queued(&self, tenant: &str) -> Vec<String> {
        self.queues
            .get(tenant)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn tenants(&self) -> Vec<String> {
        self.queues.keys().cloned().collect()
    }

    /// Total waiting operations across tenants
    pub fn len(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }
}
