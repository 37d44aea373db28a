use std::sync::Arc;

use async_trait::async_trait;

use super::{
    Operable, OperationContext, OperationFactory, OperationHandle, OperationRecord,
    OperationStatus,
};
use crate::error::Result;

/// Told when a dispatched operation has reached its final status.
#[async_trait]
pub trait CompletionListener: Send + Sync {
    async fn operation_finished(&self, opid: &str, status: OperationStatus);
}

/// Runs operations off the caller's task.
pub struct OperationExecutor {
    factory: Arc<OperationFactory>,
}

impl OperationExecutor {
    pub fn new(factory: Arc<OperationFactory>) -> Self {
        Self { factory }
    }

    pub fn factory(&self) -> &Arc<OperationFactory> {
        &self.factory
    }

    /// Implementation for a record's (type, sub-type)
    pub fn resolve(&self, record: &OperationRecord) -> Result<Arc<dyn Operable>> {
        self.factory.get(record.kind()?)
    }

    /// Start `operable` on its own task and return immediately.
    ///
    /// Whatever goes wrong (no implementation, `start` failing or
    /// panicking, the operation's own task dying) ends as an `Error`
    /// status. The final status is written to the record and then handed
    /// to `listener`.
    pub fn dispatch(
        &self,
        operable: Result<Arc<dyn Operable>>,
        ctx: OperationContext,
        listener: Arc<dyn CompletionListener>,
    ) -> OperationHandle {
        let opid = ctx.opid.clone();
        let reporter = ctx.reporter.clone();

        OperationHandle::spawn(async move {
            let status = match operable {
                Ok(operable) => {
                    let started = tokio::spawn(async move { operable.start(ctx).await }).await;
                    match started {
                        Ok(Ok(handle)) => handle.wait().await,
                        Ok(Err(e)) => {
                            tracing::error!(opid = %opid, error = %e, "Operation failed to start");
                            OperationStatus::Error
                        }
                        Err(e) => {
                            tracing::error!(opid = %opid, error = %e, "Operation panicked while starting");
                            OperationStatus::Error
                        }
                    }
                }
                Err(e) => {
                    tracing::error!(opid = %opid, error = %e, "Operation could not be dispatched");
                    OperationStatus::Error
                }
            };

            if let Err(e) = reporter.set(status) {
                tracing::warn!(opid = %opid, status = %status, error = %e, "Failed to persist final status");
            }
            tracing::debug!(opid = %opid, status = %status, "Operation finished");

            listener.operation_finished(&opid, status).await;
            status
        })
    }
}
