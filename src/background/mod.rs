use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::error::{Error, Result};

/// Handed to a task on every run
pub struct Context {
    pub task_name: &'static str,
    /// 1 for the first run, then counting up
    pub run_id: u64,
}

#[async_trait::async_trait]
pub trait BackgroundTask: Send + Sync {
    fn name(&self) -> &'static str;

    fn interval(&self) -> Duration;

    async fn execute(&self, ctx: Context) -> Result<()>;
}

/// Owns the periodic maintenance tasks of an engine.
///
/// A task runs once per interval from `register` until `shutdown`. A run
/// that fails is logged and the task keeps its schedule. Runs that overrun
/// the interval push the next one back instead of bunching up.
pub struct Runner {
    handles: Mutex<Vec<JoinHandle<()>>>,
    stop_tx: broadcast::Sender<()>,
}

impl Runner {
    pub fn new() -> Self {
        let (stop_tx, _) = broadcast::channel(1);
        Self {
            handles: Mutex::new(Vec::new()),
            stop_tx,
        }
    }

    /// Start running `task`. Must be called from within a tokio runtime.
    pub fn register<T: BackgroundTask + 'static>(&self, task: Arc<T>) -> &Self {
        tracing::debug!(task = task.name(), interval = ?task.interval(), "Registered background task");
        let handle = self.run_periodic(task);
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
        self
    }

    pub fn task_count(&self) -> usize {
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn run_periodic<T: BackgroundTask + 'static>(&self, task: Arc<T>) -> JoinHandle<()> {
        let mut stop_rx = self.stop_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(task.interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick fires at once; nothing is due at startup.
            ticker.tick().await;

            let mut run_id = 0u64;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        run_id += 1;
                        let ctx = Context { task_name: task.name(), run_id };
                        if let Err(e) = task.execute(ctx).await {
                            tracing::error!(task = task.name(), run_id, error = %e, "Background task run failed");
                        }
                    }
                    _ = stop_rx.recv() => {
                        tracing::info!(task = task.name(), runs = run_id, "Background task stopped");
                        break;
                    }
                }
            }
        })
    }

    /// Stop every task and wait until each has exited
    pub async fn shutdown(&self) -> Result<()> {
        let _ = self.stop_tx.send(());

        let handles: Vec<_> = self
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();

        for handle in handles {
            handle
                .await
                .map_err(|e| Error::InvalidState(format!("background task did not exit: {}", e)))?;
        }
        Ok(())
    }
}

impl Default for Runner {
    fn default() -> Self {
        Self::new()
    }
}
