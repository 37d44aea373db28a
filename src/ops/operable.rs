use std::fs::OpenOptions;
use std::future::Future;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;

use super::record::now_millis;
use super::{OperationKind, OperationLogLevel, OperationStatus, OperationStore};
use crate::error::Result;

/// Asynchronous handle on a running operation, resolving to its final status.
pub struct OperationHandle {
    task: JoinHandle<OperationStatus>,
}

impl OperationHandle {
    /// Run `work` on the runtime. Must be called from within a tokio runtime.
    pub fn spawn<F>(work: F) -> Self
    where
        F: Future<Output = OperationStatus> + Send + 'static,
    {
        Self {
            task: tokio::spawn(work),
        }
    }

    /// A handle that has already resolved
    pub fn ready(status: OperationStatus) -> Self {
        Self::spawn(async move { status })
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Final status. A panicked or aborted operation resolves to `Error`.
    pub async fn wait(self) -> OperationStatus {
        match self.task.await {
            Ok(status) => status,
            Err(e) => {
                tracing::error!(error = %e, "Operation task failed");
                OperationStatus::Error
            }
        }
    }
}

/// Writes an operation's status and payload updates through to its record.
#[derive(Clone)]
pub struct StatusReporter {
    store: Arc<dyn OperationStore>,
    tenant: String,
    table: String,
    opid: String,
}

impl StatusReporter {
    pub(crate) fn new(
        store: Arc<dyn OperationStore>,
        tenant: impl Into<String>,
        table: impl Into<String>,
        opid: impl Into<String>,
    ) -> Self {
        Self {
            store,
            tenant: tenant.into(),
            table: table.into(),
            opid: opid.into(),
        }
    }

    pub fn set(&self, status: OperationStatus) -> Result<()> {
        let mut record = self.store.read(&self.tenant, &self.table, &self.opid)?;
        record.set_status(status);
        self.store.write(&record)
    }

    pub fn status(&self) -> Result<OperationStatus> {
        Ok(self.store.read(&self.tenant, &self.table, &self.opid)?.status)
    }

    /// Store a progress value (row counts, checkpoints) in the payload
    pub fn update_payload(&self, key: &str, value: serde_json::Value) -> Result<()> {
        let mut record = self.store.read(&self.tenant, &self.table, &self.opid)?;
        if !record.payload.is_object() {
            record.payload = serde_json::Value::Object(Default::default());
        }
        if let Some(map) = record.payload.as_object_mut() {
            map.insert(key.to_string(), value);
        }
        record.updated_at = now_millis();
        self.store.write(&record)
    }
}

/// Everything an implementation needs to run one operation.
#[derive(Clone)]
pub struct OperationContext {
    pub tenant: String,
    pub table: String,
    pub opid: String,
    pub log_level: OperationLogLevel,
    pub log_path: PathBuf,
    pub payload: serde_json::Value,
    pub reporter: StatusReporter,
}

impl OperationContext {
    pub fn with_log_level(mut self, level: OperationLogLevel) -> Self {
        self.log_level = level;
        self
    }

    /// Append a line to the operation's own log if `level` passes its
    /// configured threshold.
    pub fn log(&self, level: OperationLogLevel, message: &str) {
        if level < self.log_level {
            return;
        }
        let appended = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .and_then(|mut file| writeln!(file, "[{:?}] {}", level, message));
        if let Err(e) = appended {
            tracing::warn!(opid = %self.opid, error = %e, "Failed to append to operation log");
        }
    }
}

/// A concrete import, export or index implementation.
#[async_trait]
pub trait Operable: Send + Sync {
    /// Which (type, sub-type) this implementation handles
    fn kind(&self) -> OperationKind;

    /// Begin the operation and hand back its handle without waiting for it.
    async fn start(&self, ctx: OperationContext) -> Result<OperationHandle>;

    /// Ask a running operation to halt. Advisory: the implementation
    /// resolves its handle to `Stopped` once it notices.
    async fn stop(&self, tenant: &str, table: &str, opid: &str) -> Result<()>;
}
