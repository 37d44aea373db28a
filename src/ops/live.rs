use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::record::now_millis;
use super::store::{check_name, write_atomic};
use super::OperationType;
use crate::error::{Error, Result};

/// Pointer to an operation that has not reached a terminal status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveEntry {
    pub tenant: String,
    pub table: String,
    pub opid: String,
    #[serde(rename = "type")]
    pub op_type: OperationType,
    /// Strictly increasing across registrations of one data directory
    #[serde(default)]
    pub seq: u64,
    pub registered_at: u64,
}

impl LiveEntry {
    pub fn new(
        tenant: impl Into<String>,
        table: impl Into<String>,
        opid: impl Into<String>,
        op_type: OperationType,
    ) -> Self {
        Self {
            tenant: tenant.into(),
            table: table.into(),
            opid: opid.into(),
            op_type,
            seq: 0,
            registered_at: now_millis(),
        }
    }

    pub fn with_seq(mut self, seq: u64) -> Self {
        self.seq = seq;
        self
    }
}

/// Durable index of every registered but unfinished operation, scanned on
/// startup to rebuild the queues.
pub trait LiveIndex: Send + Sync {
    fn register(&self, entry: &LiveEntry) -> Result<()>;

    fn get(&self, opid: &str) -> Result<Option<LiveEntry>>;

    /// Removing an absent entry is not an error
    fn remove(&self, opid: &str) -> Result<()>;

    /// Entries in registration order
    fn all(&self) -> Result<Vec<LiveEntry>>;
}

/// `<dir>/live/<opid>.json`
pub struct FileLiveIndex {
    dir: PathBuf,
}

impl FileLiveIndex {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            dir: root.into().join("live"),
        }
    }

    fn entry_path(&self, opid: &str) -> Result<PathBuf> {
        check_name("operation", opid)?;
        Ok(self.dir.join(format!("{}.json", opid)))
    }
}

impl LiveIndex for FileLiveIndex {
    fn register(&self, entry: &LiveEntry) -> Result<()> {
        let path = self.entry_path(&entry.opid)?;
        fs::create_dir_all(&self.dir)
            .map_err(|e| Error::OperationFile(format!("create {}", self.dir.display()), e))?;
        let bytes = serde_json::to_vec(entry)?;
        write_atomic(&path, &bytes).map_err(|e| Error::OperationFile(entry.opid.clone(), e))
    }

    fn get(&self, opid: &str) -> Result<Option<LiveEntry>> {
        let path = self.entry_path(opid)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::OperationFile(opid.to_string(), e)),
        }
    }

    fn remove(&self, opid: &str) -> Result<()> {
        let path = self.entry_path(opid)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::OperationFile(opid.to_string(), e)),
        }
    }

    fn all(&self) -> Result<Vec<LiveEntry>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(Error::OperationFile(
                    format!("list {}", self.dir.display()),
                    e,
                ))
            }
        };

        let mut live = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let parsed = fs::read(&path)
                .map_err(Error::from)
                .and_then(|bytes| Ok(serde_json::from_slice::<LiveEntry>(&bytes)?));
            match parsed {
                Ok(entry) => live.push(entry),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable live entry");
                }
            }
        }

        live.sort_by(|a, b| {
            a.seq
                .cmp(&b.seq)
                .then_with(|| a.registered_at.cmp(&b.registered_at))
                .then_with(|| a.opid.cmp(&b.opid))
        });
        Ok(live)
    }
}
