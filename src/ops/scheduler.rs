use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::oneshot;

use super::{
    generate_opid, ActiveOperationStore, CompletionListener, LiveEntry, LiveIndex, Operable,
    OperationContext, OperationExecutor, OperationLogLevel, OperationQueue, OperationRecord,
    OperationStatus, OperationStore, OperationType, StatusReporter,
};
use crate::error::{Error, Result};

struct SchedulerState {
    queue: OperationQueue,
    active: ActiveOperationStore,
    /// Operations this process knows about and has not finished
    live: HashMap<String, LiveEntry>,
    waiters: HashMap<String, Vec<oneshot::Sender<OperationStatus>>>,
    /// Waiters of operations released by `notify_complete` while still
    /// running, resolved once their executor reports the final status
    detached: HashMap<String, Vec<oneshot::Sender<OperationStatus>>>,
}

/// Source of live-entry sequence numbers, seeded from the live index
/// before first use so numbering continues across restarts.
struct Sequence {
    next: u64,
    seeded: bool,
}

struct Inner {
    store: Arc<dyn OperationStore>,
    live: Arc<dyn LiveIndex>,
    executor: OperationExecutor,
    // Held across persist and enqueue, so queue order matches sequence order.
    sequence: Mutex<Sequence>,
    state: Mutex<SchedulerState>,
}

/// Admits at most one operation per tenant, in registration order.
///
/// Every operation is persisted and indexed as live before it is queued, so
/// a restart can rebuild the queues with [`OperationScheduler::recover`].
/// Completion of the active operation admits the next one of its tenant.
///
/// Admission dispatches onto the tokio runtime, so the registering and
/// completing methods must be called from within one.
#[derive(Clone)]
pub struct OperationScheduler {
    inner: Arc<Inner>,
}

enum StopTarget {
    Active(Arc<dyn Operable>, LiveEntry),
    Queued(LiveEntry, Vec<oneshot::Sender<OperationStatus>>),
    Unknown,
}

impl OperationScheduler {
    pub fn new(
        store: Arc<dyn OperationStore>,
        live: Arc<dyn LiveIndex>,
        executor: OperationExecutor,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                live,
                executor,
                sequence: Mutex::new(Sequence {
                    next: 1,
                    seeded: false,
                }),
                state: Mutex::new(SchedulerState {
                    queue: OperationQueue::new(),
                    active: ActiveOperationStore::new(),
                    live: HashMap::new(),
                    waiters: HashMap::new(),
                    detached: HashMap::new(),
                }),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, SchedulerState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn sequence(&self) -> Result<MutexGuard<'_, Sequence>> {
        let mut sequence = self
            .inner
            .sequence
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !sequence.seeded {
            let highest = self.inner.live.all()?.iter().map(|e| e.seq).max();
            sequence.advance_past(highest);
        }
        Ok(sequence)
    }

    /// Register a new operation and admit it if the tenant is idle.
    pub fn register(
        &self,
        tenant: &str,
        table: &str,
        op_type: OperationType,
        payload: serde_json::Value,
    ) -> Result<String> {
        let record = OperationRecord::new(generate_opid(op_type), tenant, table, op_type, payload);
        self.register_record(record)
    }

    /// Register a caller-built record, keeping its opid.
    pub fn register_record(&self, mut record: OperationRecord) -> Result<String> {
        let entry = {
            let mut sequence = self.sequence()?;
            let entry = self.persist(&mut record, sequence.take())?;
            let mut state = self.state();
            state.queue.enqueue(&entry.tenant, &entry.opid);
            state.live.insert(entry.opid.clone(), entry.clone());
            entry
        };

        tracing::info!(
            tenant = %entry.tenant,
            table = %entry.table,
            opid = %entry.opid,
            "Registered operation"
        );
        self.try_admit_next(&entry.tenant);
        Ok(record.opid)
    }

    /// Persist an operation without queueing it; the next
    /// [`recover`](Self::recover) picks it up.
    pub fn register_deferred(
        &self,
        tenant: &str,
        table: &str,
        op_type: OperationType,
        payload: serde_json::Value,
    ) -> Result<String> {
        let mut record =
            OperationRecord::new(generate_opid(op_type), tenant, table, op_type, payload);
        let entry = {
            let mut sequence = self.sequence()?;
            self.persist(&mut record, sequence.take())?
        };
        tracing::info!(
            tenant = %entry.tenant,
            table = %entry.table,
            opid = %entry.opid,
            "Registered deferred operation"
        );
        Ok(record.opid)
    }

    /// Operation file first, then the live entry. Nothing is left behind if
    /// either write fails.
    fn persist(&self, record: &mut OperationRecord, seq: u64) -> Result<LiveEntry> {
        record.set_status(OperationStatus::NotStarted);
        record.log = self
            .inner
            .store
            .log_path(&record.tenant, &record.table, &record.opid)
            .display()
            .to_string();

        self.inner.store.create_new(record)?;

        let entry = LiveEntry::new(&record.tenant, &record.table, &record.opid, record.op_type)
            .with_seq(seq);
        if let Err(e) = self.inner.live.register(&entry) {
            if let Err(cleanup) = self
                .inner
                .store
                .remove(&record.tenant, &record.table, &record.opid)
            {
                tracing::warn!(opid = %record.opid, error = %cleanup, "Failed to roll back operation file");
            }
            return Err(e);
        }
        Ok(entry)
    }

    /// Admit the head of the tenant's queue unless the tenant already has
    /// an active operation. Returns the admitted opid.
    pub fn try_admit_next(&self, tenant: &str) -> Option<String> {
        let entry = {
            let mut state = self.state();
            if let Some(active) = state.active.active_for(tenant) {
                tracing::debug!(tenant, active = %active, "Tenant busy, admission deferred");
                return None;
            }
            loop {
                let opid = state.queue.next(tenant)?;
                match state.live.get(&opid).cloned() {
                    Some(entry) => {
                        state.active.reserve(tenant, &entry.table, &opid);
                        break entry;
                    }
                    None => {
                        tracing::warn!(tenant, opid = %opid, "Dropping queued operation without live entry");
                    }
                }
            }
        };

        self.dispatch(&entry);
        Some(entry.opid)
    }

    fn dispatch(&self, entry: &LiveEntry) {
        let store = &self.inner.store;
        let (operable, payload, log_level) = match self.mark_running(entry) {
            Ok(record) => (
                self.inner.executor.resolve(&record),
                record.payload.clone(),
                record.log_level(),
            ),
            Err(e) => (Err(e), serde_json::Value::Null, OperationLogLevel::default()),
        };
        let attached = operable.as_ref().ok().cloned();

        let ctx = OperationContext {
            tenant: entry.tenant.clone(),
            table: entry.table.clone(),
            opid: entry.opid.clone(),
            log_level,
            log_path: store.log_path(&entry.tenant, &entry.table, &entry.opid),
            payload,
            reporter: StatusReporter::new(store.clone(), &entry.tenant, &entry.table, &entry.opid),
        };

        tracing::info!(tenant = %entry.tenant, table = %entry.table, opid = %entry.opid, "Admitted operation");
        let handle = self
            .inner
            .executor
            .dispatch(operable, ctx, Arc::new(self.clone()));

        if !self.state().active.attach(&entry.opid, attached, handle) {
            tracing::debug!(opid = %entry.opid, "Operation finished before its handle was stored");
        }
    }

    fn mark_running(&self, entry: &LiveEntry) -> Result<OperationRecord> {
        let mut record = self
            .inner
            .store
            .read(&entry.tenant, &entry.table, &entry.opid)?;
        record.set_status(OperationStatus::Running);
        self.inner.store.write(&record)?;
        Ok(record)
    }

    /// Take a finished operation out of the scheduler and admit the next
    /// one of its tenant. Unknown opids are ignored, including deferred
    /// operations not yet recovered.
    ///
    /// An operation released here while still running keeps its waiters;
    /// they resolve with the status its executor eventually reports.
    pub fn notify_complete(&self, opid: &str) {
        self.complete(opid, None);
    }

    fn complete(&self, opid: &str, status: Option<OperationStatus>) {
        let (entry, waiters) = {
            let mut state = self.state();
            if let Some(status) = status {
                if let Some(waiters) = state.detached.remove(opid) {
                    drop(state);
                    for waiter in waiters {
                        let _ = waiter.send(status);
                    }
                    tracing::debug!(opid, status = %status, "Released operation finished");
                    return;
                }
            }

            let Some(entry) = state.live.remove(opid) else {
                tracing::debug!(opid, "Completion for unknown operation ignored");
                return;
            };
            let was_active = state.active.remove(opid).is_some();
            state.queue.dequeue(&entry.tenant, opid);
            let waiters = state.waiters.remove(opid).unwrap_or_default();

            if status.is_none() && was_active {
                state.detached.insert(opid.to_string(), waiters);
                (entry, Vec::new())
            } else {
                (entry, waiters)
            }
        };

        if let Err(e) = self.inner.live.remove(opid) {
            tracing::warn!(opid, error = %e, "Failed to remove live entry");
        }

        if !waiters.is_empty() {
            let resolved = status.or_else(|| {
                self.inner
                    .store
                    .read(&entry.tenant, &entry.table, opid)
                    .ok()
                    .map(|record| record.status)
            });
            if let Some(status) = resolved {
                for waiter in waiters {
                    let _ = waiter.send(status);
                }
            }
        }

        tracing::info!(tenant = %entry.tenant, opid, status = ?status, "Operation left the scheduler");
        self.try_admit_next(&entry.tenant);
    }

    /// Rebuild the queues from the live index after a restart and admit the
    /// head of every tenant. Returns the number of operations requeued.
    pub fn recover(&self) -> Result<usize> {
        let mut tenants: Vec<String> = Vec::new();
        let mut recovered = 0;

        let entries = self.inner.live.all()?;
        self.inner
            .sequence
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .advance_past(entries.iter().map(|e| e.seq).max());

        for entry in entries {
            let record = match self
                .inner
                .store
                .read(&entry.tenant, &entry.table, &entry.opid)
            {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!(
                        tenant = %entry.tenant,
                        opid = %entry.opid,
                        error = %e,
                        "Skipping live operation, left for manual recovery"
                    );
                    continue;
                }
            };

            if record.status.is_terminal() {
                tracing::info!(opid = %entry.opid, status = %record.status, "Clearing finished operation from live index");
                if let Err(e) = self.inner.live.remove(&entry.opid) {
                    tracing::warn!(opid = %entry.opid, error = %e, "Failed to remove live entry");
                }
                continue;
            }
            if record.status != OperationStatus::NotStarted {
                tracing::info!(opid = %entry.opid, status = %record.status, "Requeueing interrupted operation");
            }

            let mut state = self.state();
            if state.live.contains_key(&entry.opid) {
                continue;
            }
            state.queue.enqueue(&entry.tenant, &entry.opid);
            if !tenants.contains(&entry.tenant) {
                tenants.push(entry.tenant.clone());
            }
            state.live.insert(entry.opid.clone(), entry);
            recovered += 1;
        }

        for tenant in &tenants {
            self.try_admit_next(tenant);
        }
        tracing::info!(recovered, tenants = tenants.len(), "Recovered live operations");
        Ok(recovered)
    }

    /// Stop an operation. A running one is asked to stop and finishes
    /// through the normal completion path; a waiting one is cancelled on
    /// the spot.
    pub async fn stop(&self, opid: &str) -> Result<()> {
        let target = {
            let mut state = self.state();
            match state.active.get(opid) {
                Some(active) => match &active.operable {
                    Some(operable) => match state.live.get(opid) {
                        Some(entry) => StopTarget::Active(operable.clone(), entry.clone()),
                        None => {
                            return Err(Error::InvalidState(format!(
                                "operation {} is already finishing",
                                opid
                            )))
                        }
                    },
                    None => {
                        return Err(Error::InvalidState(format!(
                            "operation {} is still being dispatched",
                            opid
                        )))
                    }
                },
                None => match state.live.get(opid).cloned() {
                    Some(entry) => {
                        state.queue.dequeue(&entry.tenant, opid);
                        state.live.remove(opid);
                        let waiters = state.waiters.remove(opid).unwrap_or_default();
                        StopTarget::Queued(entry, waiters)
                    }
                    None => StopTarget::Unknown,
                },
            }
        };

        match target {
            StopTarget::Active(operable, entry) => {
                tracing::info!(tenant = %entry.tenant, opid, "Requesting operation stop");
                operable.stop(&entry.tenant, &entry.table, opid).await
            }
            StopTarget::Queued(entry, waiters) => self.cancel(&entry, waiters),
            StopTarget::Unknown => match self.inner.live.get(opid)? {
                Some(entry) => self.cancel(&entry, Vec::new()),
                None => Err(Error::OperationNotFound(opid.to_string())),
            },
        }
    }

    fn cancel(
        &self,
        entry: &LiveEntry,
        waiters: Vec<oneshot::Sender<OperationStatus>>,
    ) -> Result<()> {
        let mut record = self
            .inner
            .store
            .read(&entry.tenant, &entry.table, &entry.opid)?;
        record.set_status(OperationStatus::Cancelled);
        self.inner.store.write(&record)?;
        self.inner.live.remove(&entry.opid)?;

        for waiter in waiters {
            let _ = waiter.send(OperationStatus::Cancelled);
        }
        tracing::info!(tenant = %entry.tenant, opid = %entry.opid, "Cancelled queued operation");
        Ok(())
    }

    /// Resolve once the operation has left the scheduler, with its final
    /// status. Operations not in flight in this process resolve at once
    /// with their persisted status.
    pub async fn wait_for(&self, tenant: &str, table: &str, opid: &str) -> Result<OperationStatus> {
        let waiting = {
            let mut state = self.state();
            if state.live.contains_key(opid) {
                let (tx, rx) = oneshot::channel();
                state.waiters.entry(opid.to_string()).or_default().push(tx);
                Some(rx)
            } else if let Some(waiters) = state.detached.get_mut(opid) {
                let (tx, rx) = oneshot::channel();
                waiters.push(tx);
                Some(rx)
            } else {
                None
            }
        };

        if let Some(rx) = waiting {
            if let Ok(status) = rx.await {
                return Ok(status);
            }
        }
        self.status(tenant, table, opid)
    }

    pub fn status(&self, tenant: &str, table: &str, opid: &str) -> Result<OperationStatus> {
        Ok(self.record(tenant, table, opid)?.status)
    }

    pub fn record(&self, tenant: &str, table: &str, opid: &str) -> Result<OperationRecord> {
        self.inner.store.read(tenant, table, opid)
    }

    pub fn list(
        &self,
        tenant: &str,
        table: &str,
        op_type: Option<OperationType>,
    ) -> Result<Vec<String>> {
        self.inner.store.list(tenant, table, op_type)
    }

    /// Delete a finished operation's record and log
    pub fn remove(&self, tenant: &str, table: &str, opid: &str) -> Result<()> {
        if self.state().live.contains_key(opid) || self.inner.live.get(opid)?.is_some() {
            return Err(Error::InvalidState(format!(
                "operation {} has not finished",
                opid
            )));
        }
        self.inner.store.remove(tenant, table, opid)?;
        tracing::info!(tenant, table, opid, "Removed operation");
        Ok(())
    }

    pub fn is_active(&self, opid: &str) -> bool {
        self.state().active.contains(opid)
    }

    pub fn active_for(&self, tenant: &str) -> Option<String> {
        self.state().active.active_for(tenant)
    }

    /// Operations admitted across all tenants
    pub fn active_count(&self) -> usize {
        self.state().active.len()
    }

    pub fn queued(&self, tenant: &str) -> Vec<String> {
        self.state().queue.queued(tenant)
    }
}

impl Sequence {
    /// Never hands out a number at or below `highest`
    fn advance_past(&mut self, highest: Option<u64>) {
        if let Some(highest) = highest {
            self.next = self.next.max(highest + 1);
        }
        self.seeded = true;
    }

    fn take(&mut self) -> u64 {
        let seq = self.next;
        self.next += 1;
        seq
    }
}

#[async_trait]
impl CompletionListener for OperationScheduler {
    async fn operation_finished(&self, opid: &str, status: OperationStatus) {
        self.complete(opid, Some(status));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::{
        FileLiveIndex, FileOperationStore, ImportFormat, OperationFactory, OperationHandle,
        OperationKind,
    };
    use serde_json::json;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    /// CSV import that runs until the test releases it.
    #[derive(Default)]
    struct Gated {
        started: Mutex<Vec<String>>,
        gates: Mutex<HashMap<String, oneshot::Sender<OperationStatus>>>,
        running: Arc<AtomicUsize>,
        max_running: Arc<AtomicUsize>,
    }

    impl Gated {
        fn started(&self) -> Vec<String> {
            self.started.lock().unwrap().clone()
        }

        fn finish(&self, opid: &str, status: OperationStatus) -> bool {
            match self.gates.lock().unwrap().remove(opid) {
                Some(gate) => gate.send(status).is_ok(),
                None => false,
            }
        }

        fn finish_any(&self) -> Option<String> {
            let mut gates = self.gates.lock().unwrap();
            let opid = gates.keys().next()?.clone();
            let gate = gates.remove(&opid)?;
            let _ = gate.send(OperationStatus::Completed);
            Some(opid)
        }
    }

    #[async_trait]
    impl Operable for Gated {
        fn kind(&self) -> OperationKind {
            OperationKind::Import(ImportFormat::Csv)
        }

        async fn start(&self, ctx: OperationContext) -> Result<OperationHandle> {
            let (tx, rx) = oneshot::channel();
            self.gates.lock().unwrap().insert(ctx.opid.clone(), tx);
            self.started.lock().unwrap().push(ctx.opid.clone());

            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(now, Ordering::SeqCst);
            let running = self.running.clone();

            Ok(OperationHandle::spawn(async move {
                let status = rx.await.unwrap_or(OperationStatus::Stopped);
                running.fetch_sub(1, Ordering::SeqCst);
                status
            }))
        }

        async fn stop(&self, _tenant: &str, _table: &str, opid: &str) -> Result<()> {
            self.finish(opid, OperationStatus::Stopped);
            Ok(())
        }
    }

    fn scheduler(dir: &Path, gated: Arc<Gated>) -> OperationScheduler {
        let factory = Arc::new(OperationFactory::new());
        factory.register(gated);
        OperationScheduler::new(
            Arc::new(FileOperationStore::new(dir)),
            Arc::new(FileLiveIndex::new(dir)),
            OperationExecutor::new(factory),
        )
    }

    fn csv() -> serde_json::Value {
        json!({"import-type": "CSV"})
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..400 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_second_import_waits_for_first() {
        let dir = TempDir::new().unwrap();
        let gated = Arc::new(Gated::default());
        let scheduler = scheduler(dir.path(), gated.clone());

        let a = scheduler.register("acme", "users", OperationType::Import, csv()).unwrap();
        let b = scheduler.register("acme", "users", OperationType::Import, csv()).unwrap();

        assert!(scheduler.is_active(&a));
        assert!(!scheduler.is_active(&b));
        assert_eq!(scheduler.queued("acme"), vec![b.clone()]);
        eventually(|| gated.started() == vec![a.clone()]).await;
        assert_eq!(
            scheduler.status("acme", "users", &a).unwrap(),
            OperationStatus::Running
        );

        scheduler.notify_complete(&a);
        assert!(scheduler.is_active(&b));
        assert!(scheduler.queued("acme").is_empty());
        eventually(|| gated.started().len() == 2).await;

        // The first import's own completion arrives late and changes nothing.
        assert!(gated.finish(&a, OperationStatus::Completed));
        eventually(|| {
            scheduler.status("acme", "users", &a).unwrap() == OperationStatus::Completed
        })
        .await;
        assert!(scheduler.is_active(&b));

        assert!(gated.finish(&b, OperationStatus::Completed));
        assert_eq!(
            scheduler.wait_for("acme", "users", &b).await.unwrap(),
            OperationStatus::Completed
        );
        eventually(|| scheduler.active_count() == 0).await;
    }

    #[tokio::test]
    async fn test_fifo_admission() {
        let dir = TempDir::new().unwrap();
        let gated = Arc::new(Gated::default());
        let scheduler = scheduler(dir.path(), gated.clone());

        let opids: Vec<String> = (0..3)
            .map(|_| {
                scheduler
                    .register("acme", "users", OperationType::Import, csv())
                    .unwrap()
            })
            .collect();

        for (i, opid) in opids.iter().enumerate() {
            eventually(|| gated.started().len() == i + 1).await;
            assert_eq!(&gated.started()[i], opid);
            assert!(gated.finish(opid, OperationStatus::Completed));
            scheduler.wait_for("acme", "users", opid).await.unwrap();
        }
        assert_eq!(gated.started(), opids);
    }

    #[tokio::test]
    async fn test_tenants_are_independent() {
        let dir = TempDir::new().unwrap();
        let gated = Arc::new(Gated::default());
        let scheduler = scheduler(dir.path(), gated.clone());

        let a = scheduler.register("acme", "users", OperationType::Import, csv()).unwrap();
        let b = scheduler.register("beta", "orders", OperationType::Import, csv()).unwrap();

        assert_eq!(scheduler.active_for("acme"), Some(a));
        assert_eq!(scheduler.active_for("beta"), Some(b));
        eventually(|| gated.started().len() == 2).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_one_active_under_concurrent_registration() {
        let dir = TempDir::new().unwrap();
        let gated = Arc::new(Gated::default());
        let scheduler = scheduler(dir.path(), gated.clone());

        let mut registrations = Vec::new();
        for _ in 0..8 {
            let scheduler = scheduler.clone();
            registrations.push(tokio::spawn(async move {
                scheduler
                    .register("acme", "users", OperationType::Import, csv())
                    .unwrap()
            }));
        }
        for registration in registrations {
            registration.await.unwrap();
        }
        assert_eq!(scheduler.active_count(), 1);
        assert_eq!(scheduler.queued("acme").len(), 7);

        for done in 0..8 {
            eventually(|| gated.started().len() == done + 1).await;
            eventually(|| gated.finish_any().is_some()).await;
        }
        eventually(|| scheduler.active_count() == 0).await;
        assert_eq!(gated.max_running.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_notify_complete_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let gated = Arc::new(Gated::default());
        let scheduler = scheduler(dir.path(), gated.clone());

        let a = scheduler.register("acme", "users", OperationType::Import, csv()).unwrap();
        let b = scheduler.register("acme", "users", OperationType::Import, csv()).unwrap();
        let c = scheduler.register("acme", "users", OperationType::Import, csv()).unwrap();

        scheduler.notify_complete(&a);
        scheduler.notify_complete(&a);
        scheduler.notify_complete("IMPnever-registered");

        assert_eq!(scheduler.active_for("acme"), Some(b));
        assert_eq!(scheduler.queued("acme"), vec![c]);
        assert_eq!(scheduler.active_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_dispatch_does_not_stall_tenant() {
        let dir = TempDir::new().unwrap();
        let gated = Arc::new(Gated::default());
        let scheduler = scheduler(dir.path(), gated.clone());

        // No export implementation is registered.
        let export = scheduler
            .register("acme", "users", OperationType::Export, json!({"export-type": "CSV"}))
            .unwrap();
        let import = scheduler.register("acme", "users", OperationType::Import, csv()).unwrap();

        assert_eq!(
            scheduler.wait_for("acme", "users", &export).await.unwrap(),
            OperationStatus::Error
        );
        assert_eq!(
            scheduler.status("acme", "users", &export).unwrap(),
            OperationStatus::Error
        );
        eventually(|| gated.started() == vec![import.clone()]).await;
    }

    #[tokio::test]
    async fn test_duplicate_opid_rejected() {
        let dir = TempDir::new().unwrap();
        let gated = Arc::new(Gated::default());
        let scheduler = scheduler(dir.path(), gated.clone());

        let record = OperationRecord::new("IMPfixed", "acme", "users", OperationType::Import, csv());
        scheduler.register_record(record.clone()).unwrap();
        assert!(matches!(
            scheduler.register_record(record),
            Err(Error::DuplicateOperation(opid)) if opid == "IMPfixed"
        ));

        assert!(scheduler.queued("acme").is_empty());
        assert_eq!(scheduler.active_count(), 1);
        eventually(|| gated.started().len() == 1).await;
    }

    #[tokio::test]
    async fn test_deferred_operation_runs_after_recovery() {
        let dir = TempDir::new().unwrap();
        let gated = Arc::new(Gated::default());

        let opid = {
            let first = scheduler(dir.path(), gated.clone());
            let opid = first
                .register_deferred("acme", "users", OperationType::Import, csv())
                .unwrap();
            assert!(!first.is_active(&opid));
            assert!(first.queued("acme").is_empty());
            assert_eq!(
                first.status("acme", "users", &opid).unwrap(),
                OperationStatus::NotStarted
            );
            opid
        };

        let restarted = scheduler(dir.path(), gated.clone());
        assert_eq!(restarted.recover().unwrap(), 1);
        assert!(restarted.is_active(&opid));
        eventually(|| gated.started() == vec![opid.clone()]).await;
    }

    #[tokio::test]
    async fn test_recovery_keeps_registration_order() {
        let dir = TempDir::new().unwrap();
        let gated = Arc::new(Gated::default());

        let mut registered: Vec<String> = {
            let first = scheduler(dir.path(), gated.clone());
            (0..10)
                .map(|_| {
                    first
                        .register_deferred("acme", "users", OperationType::Import, csv())
                        .unwrap()
                })
                .collect()
        };
        // A scheduler that never recovered still numbers after the index.
        {
            let second = scheduler(dir.path(), gated.clone());
            registered.push(
                second
                    .register_deferred("acme", "users", OperationType::Import, csv())
                    .unwrap(),
            );
        }

        let live = FileLiveIndex::new(dir.path());
        let seqs: Vec<u64> = registered
            .iter()
            .map(|opid| live.get(opid).unwrap().unwrap().seq)
            .collect();
        assert!(seqs.windows(2).all(|pair| pair[0] < pair[1]));

        let restarted = scheduler(dir.path(), gated.clone());
        assert_eq!(restarted.recover().unwrap(), registered.len());
        assert_eq!(restarted.active_for("acme").as_ref(), Some(&registered[0]));
        assert_eq!(restarted.queued("acme"), registered[1..].to_vec());

        let later = restarted
            .register("acme", "users", OperationType::Import, csv())
            .unwrap();
        assert!(live.get(&later).unwrap().unwrap().seq > seqs[seqs.len() - 1]);
        registered.push(later);

        for (i, opid) in registered.iter().enumerate() {
            eventually(|| gated.started().len() == i + 1).await;
            assert!(gated.finish(opid, OperationStatus::Completed));
            restarted.wait_for("acme", "users", opid).await.unwrap();
        }
        assert_eq!(gated.started(), registered);
    }

    #[tokio::test]
    async fn test_waiters_outlive_notify_complete() {
        let dir = TempDir::new().unwrap();
        let gated = Arc::new(Gated::default());
        let scheduler = scheduler(dir.path(), gated.clone());

        let a = scheduler.register("acme", "users", OperationType::Import, csv()).unwrap();
        let b = scheduler.register("acme", "users", OperationType::Import, csv()).unwrap();
        eventually(|| gated.started() == vec![a.clone()]).await;

        let wait = |opid: &String| {
            let scheduler = scheduler.clone();
            let opid = opid.clone();
            tokio::spawn(async move { scheduler.wait_for("acme", "users", &opid).await })
        };

        let early = wait(&a);
        tokio::time::sleep(Duration::from_millis(20)).await;
        scheduler.notify_complete(&a);
        assert!(scheduler.is_active(&b));

        let late = wait(&a);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!early.is_finished());
        assert!(!late.is_finished());

        assert!(gated.finish(&a, OperationStatus::Completed));
        assert_eq!(early.await.unwrap().unwrap(), OperationStatus::Completed);
        assert_eq!(late.await.unwrap().unwrap(), OperationStatus::Completed);
        assert!(scheduler.is_active(&b));
    }

    #[tokio::test]
    async fn test_notify_complete_leaves_deferred_operation() {
        let dir = TempDir::new().unwrap();
        let gated = Arc::new(Gated::default());

        let opid = {
            let first = scheduler(dir.path(), gated.clone());
            let opid = first
                .register_deferred("acme", "users", OperationType::Import, csv())
                .unwrap();
            first.notify_complete(&opid);
            assert!(FileLiveIndex::new(dir.path()).get(&opid).unwrap().is_some());
            assert_eq!(
                first.status("acme", "users", &opid).unwrap(),
                OperationStatus::NotStarted
            );
            opid
        };

        let restarted = scheduler(dir.path(), gated.clone());
        assert_eq!(restarted.recover().unwrap(), 1);
        eventually(|| gated.started() == vec![opid.clone()]).await;
    }

    #[tokio::test]
    async fn test_recovery_skips_finished_and_missing() {
        let dir = TempDir::new().unwrap();
        let store = FileOperationStore::new(dir.path());
        let live = FileLiveIndex::new(dir.path());

        let mut done = OperationRecord::new("IMPdone", "acme", "users", OperationType::Import, csv());
        done.set_status(OperationStatus::Completed);
        store.create_new(&done).unwrap();
        live.register(&LiveEntry::new("acme", "users", "IMPdone", OperationType::Import))
            .unwrap();
        live.register(&LiveEntry::new("acme", "users", "IMPgone", OperationType::Import))
            .unwrap();

        let mut interrupted =
            OperationRecord::new("IMPhalf", "beta", "orders", OperationType::Import, csv());
        interrupted.set_status(OperationStatus::Running);
        store.create_new(&interrupted).unwrap();
        live.register(&LiveEntry::new("beta", "orders", "IMPhalf", OperationType::Import))
            .unwrap();

        let gated = Arc::new(Gated::default());
        let scheduler = scheduler(dir.path(), gated.clone());
        assert_eq!(scheduler.recover().unwrap(), 1);

        assert_eq!(live.get("IMPdone").unwrap(), None);
        assert!(live.get("IMPgone").unwrap().is_some());
        assert_eq!(scheduler.active_for("beta").as_deref(), Some("IMPhalf"));
        assert_eq!(scheduler.active_for("acme"), None);
        eventually(|| gated.started() == vec!["IMPhalf".to_string()]).await;
    }

    #[tokio::test]
    async fn test_stop_and_cancel() {
        let dir = TempDir::new().unwrap();
        let gated = Arc::new(Gated::default());
        let scheduler = scheduler(dir.path(), gated.clone());

        let a = scheduler.register("acme", "users", OperationType::Import, csv()).unwrap();
        let b = scheduler.register("acme", "users", OperationType::Import, csv()).unwrap();
        let c = scheduler.register("acme", "users", OperationType::Import, csv()).unwrap();

        scheduler.stop(&b).await.unwrap();
        assert_eq!(
            scheduler.wait_for("acme", "users", &b).await.unwrap(),
            OperationStatus::Cancelled
        );
        assert_eq!(scheduler.queued("acme"), vec![c.clone()]);

        eventually(|| gated.started() == vec![a.clone()]).await;
        scheduler.stop(&a).await.unwrap();
        assert_eq!(
            scheduler.wait_for("acme", "users", &a).await.unwrap(),
            OperationStatus::Stopped
        );
        eventually(|| gated.started() == vec![a.clone(), c.clone()]).await;

        assert!(matches!(
            scheduler.stop("IMPnope").await,
            Err(Error::OperationNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_remove_only_after_finish() {
        let dir = TempDir::new().unwrap();
        let gated = Arc::new(Gated::default());
        let scheduler = scheduler(dir.path(), gated.clone());

        let a = scheduler.register("acme", "users", OperationType::Import, csv()).unwrap();
        assert!(matches!(
            scheduler.remove("acme", "users", &a),
            Err(Error::InvalidState(_))
        ));
        assert_eq!(
            scheduler.list("acme", "users", Some(OperationType::Import)).unwrap(),
            vec![a.clone()]
        );

        eventually(|| gated.finish(&a, OperationStatus::Completed)).await;
        scheduler.wait_for("acme", "users", &a).await.unwrap();
        scheduler.remove("acme", "users", &a).unwrap();
        assert!(scheduler.list("acme", "users", None).unwrap().is_empty());
    }
}
