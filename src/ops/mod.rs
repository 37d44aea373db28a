//! Long-running operations and their per-tenant admission.
//!
//! An operation (bulk import, bulk export, index build) is registered,
//! persisted as an [`OperationRecord`], queued behind earlier operations of
//! the same tenant, and admitted once nothing else of that tenant is
//! running. Completion admits the next one.

pub mod active;
pub mod executor;
pub mod factory;
pub mod live;
pub mod operable;
pub mod queue;
pub mod record;
pub mod scheduler;
pub mod store;

pub use active::ActiveOperationStore;
pub use executor::{CompletionListener, OperationExecutor};
pub use factory::OperationFactory;
pub use live::{FileLiveIndex, LiveEntry, LiveIndex};
pub use operable::{Operable, OperationContext, OperationHandle, StatusReporter};
pub use queue::OperationQueue;
pub use record::OperationRecord;
pub use scheduler::OperationScheduler;
pub use store::{FileOperationStore, OperationStore};

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Payload key selecting the import format
pub const IMPORT_TYPE_KEY: &str = "import-type";
/// Payload key selecting the export format
pub const EXPORT_TYPE_KEY: &str = "export-type";
/// Payload key selecting the operation log level
pub const LOG_LEVEL_KEY: &str = "log-level";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationType {
    #[serde(rename = "IMP")]
    Import,
    #[serde(rename = "IND")]
    Index,
    #[serde(rename = "EXP")]
    Export,
}

impl OperationType {
    /// Three-letter prefix of every opid of this type
    pub fn code(&self) -> &'static str {
        match self {
            OperationType::Import => "IMP",
            OperationType::Index => "IND",
            OperationType::Export => "EXP",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "IMP" => Some(OperationType::Import),
            "IND" => Some(OperationType::Index),
            "EXP" => Some(OperationType::Export),
            _ => None,
        }
    }

    /// Type of an opid, read from its prefix
    pub fn of_opid(opid: &str) -> Option<Self> {
        opid.get(..3).and_then(Self::from_code)
    }

    pub fn all() -> [OperationType; 3] {
        [
            OperationType::Import,
            OperationType::Index,
            OperationType::Export,
        ]
    }
}

/// A fresh opid: type code followed by a random UUID
pub fn generate_opid(op_type: OperationType) -> String {
    format!("{}{}", op_type.code(), uuid::Uuid::new_v4())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationStatus {
    NotStarted,
    Running,
    Paused,
    Stopped,
    Error,
    Completed,
    Cancelled,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::NotStarted => "not-started",
            OperationStatus::Running => "running",
            OperationStatus::Paused => "paused",
            OperationStatus::Stopped => "stopped",
            OperationStatus::Error => "error",
            OperationStatus::Completed => "completed",
            OperationStatus::Cancelled => "cancelled",
        }
    }

    /// No further transitions happen from a terminal status
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationStatus::Stopped
                | OperationStatus::Error
                | OperationStatus::Completed
                | OperationStatus::Cancelled
        )
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "not-started" => Ok(OperationStatus::NotStarted),
            "running" => Ok(OperationStatus::Running),
            "paused" => Ok(OperationStatus::Paused),
            "stopped" => Ok(OperationStatus::Stopped),
            "error" => Ok(OperationStatus::Error),
            "completed" => Ok(OperationStatus::Completed),
            "cancelled" => Ok(OperationStatus::Cancelled),
            other => Err(Error::InvalidOperationFormat(format!(
                "unrecognized operation status: {}",
                other
            ))),
        }
    }
}

/// Verbosity of an operation's own log file. Messages below the level are
/// dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationLogLevel {
    Fine,
    #[default]
    Info,
    Error,
}

impl FromStr for OperationLogLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "fine" => Ok(OperationLogLevel::Fine),
            "info" => Ok(OperationLogLevel::Info),
            "error" => Ok(OperationLogLevel::Error),
            other => Err(Error::InvalidOperationFormat(format!(
                "unrecognized log level: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImportFormat {
    Csv,
    Json,
    Xml,
}

impl FromStr for ImportFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "CSV" => Ok(ImportFormat::Csv),
            "JSON" => Ok(ImportFormat::Json),
            "XML" => Ok(ImportFormat::Xml),
            other => Err(Error::InvalidOperationFormat(format!(
                "unsupported import type: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExportFormat {
    Csv,
    Json,
    Xml,
    Text,
}

impl FromStr for ExportFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "CSV" => Ok(ExportFormat::Csv),
            "JSON" => Ok(ExportFormat::Json),
            "XML" => Ok(ExportFormat::Xml),
            "TEXT" => Ok(ExportFormat::Text),
            other => Err(Error::InvalidOperationFormat(format!(
                "unsupported export type: {}",
                other
            ))),
        }
    }
}

/// Concrete implementation an operation dispatches to: its type plus the
/// sub-type carried in its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Import(ImportFormat),
    Export(ExportFormat),
    Index,
}

impl OperationKind {
    pub fn op_type(&self) -> OperationType {
        match self {
            OperationKind::Import(_) => OperationType::Import,
            OperationKind::Export(_) => OperationType::Export,
            OperationKind::Index => OperationType::Index,
        }
    }

    /// Resolve the kind from a type and its payload
    pub fn resolve(op_type: OperationType, payload: &serde_json::Value) -> Result<Self> {
        let subtype = |key: &str| {
            payload.get(key).and_then(|v| v.as_str()).ok_or_else(|| {
                Error::InvalidOperationFormat(format!("payload is missing \"{}\"", key))
            })
        };

        match op_type {
            OperationType::Import => Ok(OperationKind::Import(subtype(IMPORT_TYPE_KEY)?.parse()?)),
            OperationType::Export => Ok(OperationKind::Export(subtype(EXPORT_TYPE_KEY)?.parse()?)),
            OperationType::Index => Ok(OperationKind::Index),
        }
    }
}
