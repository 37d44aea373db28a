use std::fs;
use std::sync::{Arc, Mutex, PoisonError};

use crate::background::Runner;
use crate::config::EngineConfig;
use crate::error::Result;
use crate::flock::DirLock;
use crate::lock::{LockManager, LockRegistry, LockSweepTask};
use crate::ops::{
    FileLiveIndex, FileOperationStore, OperationExecutor, OperationFactory, OperationScheduler,
};
use crate::schema::SchemaStore;

const LOCK_FILE: &str = "tenantdb.lock";

/// Owns a data directory and everything coordinating work on it.
pub struct Engine {
    config: EngineConfig,
    lock: Mutex<Option<DirLock>>,
    registry: Arc<LockRegistry>,
    locks: Arc<LockManager>,
    scheduler: OperationScheduler,
    runner: Runner,
}

impl Engine {
    /// Open the data directory, requeue operations left live by the previous
    /// process and start the idle-lock sweep. Must be called from within a
    /// tokio runtime.
    pub fn open(
        config: EngineConfig,
        schema: Arc<dyn SchemaStore>,
        factory: Arc<OperationFactory>,
    ) -> Result<Self> {
        fs::create_dir_all(&config.dir)?;
        let lock = DirLock::acquire(config.dir.join(LOCK_FILE))?;

        let registry = Arc::new(LockRegistry::from_config(&config));
        let locks = Arc::new(LockManager::new(schema, registry.clone()));

        let scheduler = OperationScheduler::new(
            Arc::new(FileOperationStore::new(&config.dir)),
            Arc::new(FileLiveIndex::new(&config.dir)),
            OperationExecutor::new(factory),
        );
        let recovered = scheduler.recover()?;

        let runner = Runner::new();
        runner.register(Arc::new(LockSweepTask::new(
            registry.clone(),
            config.lock_sweep_interval,
            config.lock_idle_window,
        )));

        tracing::info!(dir = %config.dir.display(), recovered, "Engine opened");
        Ok(Self {
            config,
            lock: Mutex::new(Some(lock)),
            registry,
            locks,
            scheduler,
            runner,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<LockRegistry> {
        &self.registry
    }

    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    pub fn scheduler(&self) -> &OperationScheduler {
        &self.scheduler
    }

    /// Stop background tasks and give up the data directory. Running
    /// operations are not interrupted; their live entries requeue them on
    /// the next open.
    pub async fn shutdown(&self) -> Result<()> {
        self.runner.shutdown().await?;
        self.lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        tracing::info!(dir = %self.config.dir.display(), "Engine shut down");
        Ok(())
    }
}
