use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use super::{OperationKind, OperationLogLevel, OperationStatus, OperationType, LOG_LEVEL_KEY};
use crate::error::Result;

/// Milliseconds since the epoch, 0 if the clock is before it
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// The durable description of one operation.
///
/// Written before the operation becomes visible to the scheduler and kept
/// after it finishes; only an explicit cleanup removes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRecord {
    pub opid: String,
    pub tenant: String,
    pub table: String,
    #[serde(rename = "type")]
    pub op_type: OperationType,
    /// Operation-specific parameters, e.g. `{"import-type": "CSV", ...}`
    #[serde(default)]
    pub payload: serde_json::Value,
    pub status: OperationStatus,
    /// Where the operation writes its own progress log
    #[serde(default)]
    pub log: String,
    pub created_at: u64,
    pub updated_at: u64,
}

impl OperationRecord {
    pub fn new(
        opid: impl Into<String>,
        tenant: impl Into<String>,
        table: impl Into<String>,
        op_type: OperationType,
        payload: serde_json::Value,
    ) -> Self {
        let now = now_millis();
        Self {
            opid: opid.into(),
            tenant: tenant.into(),
            table: table.into(),
            op_type,
            payload,
            status: OperationStatus::NotStarted,
            log: String::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn kind(&self) -> Result<OperationKind> {
        OperationKind::resolve(self.op_type, &self.payload)
    }

    /// Log level from the payload; unknown or missing values fall back to info
    pub fn log_level(&self) -> OperationLogLevel {
        self.payload
            .get(LOG_LEVEL_KEY)
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
            .unwrap_or_default()
    }

    pub fn set_status(&mut self, status: OperationStatus) {
        self.status = status;
        self.updated_at = now_millis();
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
