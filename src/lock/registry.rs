use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use super::{LockKey, LockScope, LockType, ReadWriteLock};
use crate::background::{BackgroundTask, Context};
use crate::config::{EngineConfig, Fairness};
use crate::error::Result;

/// Process-wide store of [`ReadWriteLock`]s keyed by [`LockKey`].
///
/// Locks are created on first access and evicted by [`LockRegistry::sweep`]
/// once free and idle. Callers only ever see `Arc` handles; a lock whose
/// handle is still held somewhere (for example by a task parked in
/// `acquire_write`) is never evicted, so an in-flight acquisition cannot
/// lose its lock to the sweep.
pub struct LockRegistry {
    locks: Mutex<HashMap<LockKey, Arc<ReadWriteLock>>>,
    read_concurrency: usize,
    fairness: Fairness,
}

impl LockRegistry {
    pub fn new(read_concurrency: usize, fairness: Fairness) -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            read_concurrency: read_concurrency.max(1),
            fairness,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.read_concurrency, config.fairness)
    }

    /// Permits a fresh lock for this scope starts with
    pub fn permits_for(&self, scope: LockScope) -> usize {
        match scope {
            LockScope::Record => self.read_concurrency,
            LockScope::Global | LockScope::Tenant | LockScope::Table => 1,
        }
    }

    /// Existing lock for `key`, or a new one inserted atomically
    pub fn get(&self, key: &LockKey) -> Arc<ReadWriteLock> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks
            .entry(key.clone())
            .or_insert_with(|| {
                tracing::trace!(key = %key, "Creating lock");
                Arc::new(ReadWriteLock::new(
                    key.to_string(),
                    self.permits_for(key.scope()),
                    self.fairness,
                ))
            })
            .clone()
    }

    fn lookup(&self, key: &LockKey) -> Option<Arc<ReadWriteLock>> {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub fn contains(&self, key: &LockKey) -> bool {
        self.lookup(key).is_some()
    }

    /// `LockType::None` for keys the registry does not know
    pub fn lock_type(&self, key: &LockKey) -> LockType {
        self.lookup(key)
            .map(|lock| lock.lock_type())
            .unwrap_or(LockType::None)
    }

    pub fn is_locked(&self, key: &LockKey) -> bool {
        self.lock_type(key) != LockType::None
    }

    pub fn len(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Table locks currently known for `tenant`, in table name order
    pub(crate) fn table_locks(&self, tenant: &str) -> Vec<Arc<ReadWriteLock>> {
        let locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        let mut tables: Vec<_> = locks
            .iter()
            .filter(|(key, _)| {
                key.scope() == LockScope::Table && key.tenant_name() == Some(tenant)
            })
            .map(|(key, lock)| (key.clone(), lock.clone()))
            .collect();
        tables.sort_by(|a, b| a.0.cmp(&b.0));
        tables.into_iter().map(|(_, lock)| lock).collect()
    }

    pub async fn acquire_read(&self, key: &LockKey) -> Result<()> {
        let lock = self.get(key);
        lock.acquire_read().await
    }

    pub async fn acquire_write(&self, key: &LockKey) -> Result<()> {
        let lock = self.get(key);
        lock.acquire_write().await
    }

    pub async fn acquire_read_within(&self, key: &LockKey, timeout: Duration) -> Result<()> {
        let lock = self.get(key);
        lock.acquire_read_within(timeout).await
    }

    pub async fn acquire_write_within(&self, key: &LockKey, timeout: Duration) -> Result<()> {
        let lock = self.get(key);
        lock.acquire_write_within(timeout).await
    }

    /// Releasing a key the registry does not hold is a no-op
    pub fn release_read(&self, key: &LockKey) {
        if let Some(lock) = self.lookup(key) {
            lock.release_read();
        }
    }

    pub fn release_write(&self, key: &LockKey) {
        if let Some(lock) = self.lookup(key) {
            lock.release_write();
        }
    }

    /// Evict every free lock untouched for longer than `idle_window`
    pub fn sweep(&self, idle_window: Duration) -> usize {
        self.sweep_at(Instant::now(), idle_window)
    }

    pub(crate) fn sweep_at(&self, now: Instant, idle_window: Duration) -> usize {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        let before = locks.len();

        // strong_count == 1 means only the map references the lock; any
        // caller between `get` and release still holds a clone.
        locks.retain(|_, lock| {
            let evictable = Arc::strong_count(lock) == 1
                && lock.lock_type() == LockType::None
                && lock.idle_for(now) > idle_window;
            !evictable
        });

        let removed = before - locks.len();
        if removed > 0 {
            tracing::debug!(removed, remaining = locks.len(), "Swept idle locks");
        }
        removed
    }
}

/// Periodic eviction of idle registry locks
pub struct LockSweepTask {
    registry: Arc<LockRegistry>,
    interval: Duration,
    idle_window: Duration,
}

impl LockSweepTask {
    pub fn new(registry: Arc<LockRegistry>, interval: Duration, idle_window: Duration) -> Self {
        Self {
            registry,
            interval,
            idle_window,
        }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for LockSweepTask {
    fn name(&self) -> &'static str {
        "lock-sweep"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn execute(&self, ctx: Context) -> Result<()> {
        let removed = self.registry.sweep(self.idle_window);
        tracing::trace!(task = ctx.task_name, run_id = ctx.run_id, removed, "Lock sweep finished");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::background::Runner;

    fn registry() -> LockRegistry {
        LockRegistry::new(10, Fairness::Barging)
    }

    #[test]
    fn test_get_reuses_instance() {
        let registry = registry();
        let key = LockKey::record("acme", "users", "1");
        let a = registry.get(&key);
        let b = registry.get(&key);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_permits_by_scope() {
        let registry = registry();
        assert_eq!(
            registry
                .get(&LockKey::record("acme", "users", "1"))
                .total_permits(),
            10
        );
        assert_eq!(
            registry.get(&LockKey::table("acme", "users")).total_permits(),
            1
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_racing_first_access_converges() {
        let registry = Arc::new(registry());
        let key = LockKey::record("acme", "users", "hot");

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let registry = registry.clone();
                let key = key.clone();
                tokio::spawn(async move { registry.get(&key) })
            })
            .collect();

        let mut locks = Vec::new();
        for handle in handles {
            locks.push(handle.await.expect("join"));
        }
        assert!(locks.iter().all(|lock| Arc::ptr_eq(lock, &locks[0])));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_sweep_removes_only_idle_free_locks() -> Result<()> {
        let registry = registry();
        let idle = LockKey::record("acme", "users", "idle");
        let held = LockKey::record("acme", "users", "held");
        let fresh = LockKey::record("acme", "users", "fresh");

        registry.acquire_read(&idle).await?;
        registry.release_read(&idle);
        registry.acquire_write(&held).await?;

        tokio::time::sleep(Duration::from_millis(30)).await;
        registry.acquire_read(&fresh).await?;
        registry.release_read(&fresh);

        let removed = registry.sweep(Duration::from_millis(20));
        assert_eq!(removed, 1);
        assert!(!registry.contains(&idle));
        assert!(registry.contains(&held), "held lock survives");
        assert!(registry.contains(&fresh), "recently touched lock survives");
        Ok(())
    }

    #[tokio::test]
    async fn test_sweep_spares_lock_mid_acquisition() -> Result<()> {
        let registry = Arc::new(registry());
        let key = LockKey::record("acme", "users", "1");

        registry.acquire_read(&key).await?;

        // A writer is parked in acquire_write and holds a handle.
        let writer = {
            let registry = registry.clone();
            let key = key.clone();
            tokio::spawn(async move { registry.acquire_write(&key).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        registry.release_read(&key);
        let far_future = Instant::now() + Duration::from_secs(3600);
        // Whatever the writer's progress, the entry must not vanish under it.
        registry.sweep_at(far_future, Duration::from_secs(1));

        writer.await.expect("join")?;
        assert_eq!(registry.lock_type(&key), LockType::Write);
        assert!(registry.contains(&key));

        registry.release_write(&key);
        assert_eq!(registry.sweep_at(far_future, Duration::from_secs(1)), 1);
        Ok(())
    }

    #[test]
    fn test_unknown_keys() {
        let registry = registry();
        let key = LockKey::record("acme", "users", "nobody");
        assert_eq!(registry.lock_type(&key), LockType::None);
        assert!(!registry.is_locked(&key));
        registry.release_read(&key);
        registry.release_write(&key);
        assert!(registry.is_empty(), "release must not create entries");
    }

    #[tokio::test]
    async fn test_sweep_task_evicts_in_background() -> Result<()> {
        let registry = Arc::new(registry());
        let key = LockKey::record("acme", "users", "1");
        registry.acquire_read(&key).await?;
        registry.release_read(&key);

        let runner = Runner::new();
        runner.register(Arc::new(LockSweepTask::new(
            registry.clone(),
            Duration::from_millis(10),
            Duration::from_millis(5),
        )));

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(!registry.contains(&key));

        runner.shutdown().await
    }
}
