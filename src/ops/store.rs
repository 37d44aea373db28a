use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use super::{OperationRecord, OperationType};
use crate::error::{Error, Result};

/// Durable home of operation records.
pub trait OperationStore: Send + Sync {
    /// Persist a record under a name nobody has used yet.
    /// Fails with `DuplicateOperation` if the opid is taken.
    fn create_new(&self, record: &OperationRecord) -> Result<()>;

    /// Replace an existing record
    fn write(&self, record: &OperationRecord) -> Result<()>;

    fn read(&self, tenant: &str, table: &str, opid: &str) -> Result<OperationRecord>;

    fn exists(&self, tenant: &str, table: &str, opid: &str) -> bool;

    /// Opids stored for a table, optionally of a single type
    fn list(&self, tenant: &str, table: &str, op_type: Option<OperationType>)
        -> Result<Vec<String>>;

    /// Explicit cleanup of a record and its log
    fn remove(&self, tenant: &str, table: &str, opid: &str) -> Result<()>;

    fn log_path(&self, tenant: &str, table: &str, opid: &str) -> PathBuf;
}

/// Names become path components; keep them to a single one.
pub(crate) fn check_name(kind: &str, name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0']);
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidOperationFormat(format!(
            "invalid {} name: {:?}",
            kind, name
        )))
    }
}

/// Replace `path` with `bytes` so readers see either the old or new file.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("json.tmp");
    {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)
}

/// One JSON document per operation:
/// `<root>/tenants/<tenant>/<table>/ops/<opid>.json`
pub struct FileOperationStore {
    root: PathBuf,
}

impl FileOperationStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn ops_dir(&self, tenant: &str, table: &str) -> PathBuf {
        self.root
            .join("tenants")
            .join(tenant)
            .join(table)
            .join("ops")
    }

    fn record_path(&self, tenant: &str, table: &str, opid: &str) -> Result<PathBuf> {
        check_name("tenant", tenant)?;
        check_name("table", table)?;
        check_name("operation", opid)?;
        Ok(self.ops_dir(tenant, table).join(format!("{}.json", opid)))
    }
}

impl OperationStore for FileOperationStore {
    fn create_new(&self, record: &OperationRecord) -> Result<()> {
        let path = self.record_path(&record.tenant, &record.table, &record.opid)?;
        let bytes = record.to_json()?;

        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .map_err(|e| Error::OperationFile(format!("create {}", dir.display()), e))?;
        }

        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(Error::DuplicateOperation(record.opid.clone()));
            }
            Err(e) => return Err(Error::OperationFile(record.opid.clone(), e)),
        };

        let written = file.write_all(&bytes).and_then(|_| file.sync_all());
        if let Err(e) = written {
            drop(file);
            // Never leave a half-written record behind.
            let _ = fs::remove_file(&path);
            return Err(Error::OperationFile(record.opid.clone(), e));
        }
        Ok(())
    }

    fn write(&self, record: &OperationRecord) -> Result<()> {
        let path = self.record_path(&record.tenant, &record.table, &record.opid)?;
        if !path.exists() {
            return Err(Error::OperationNotFound(record.opid.clone()));
        }
        write_atomic(&path, &record.to_json()?)
            .map_err(|e| Error::OperationFile(record.opid.clone(), e))
    }

    fn read(&self, tenant: &str, table: &str, opid: &str) -> Result<OperationRecord> {
        let path = self.record_path(tenant, table, opid)?;
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(Error::OperationNotFound(opid.to_string()));
            }
            Err(e) => return Err(Error::OperationFile(opid.to_string(), e)),
        };
        OperationRecord::from_json(&bytes)
    }

    fn exists(&self, tenant: &str, table: &str, opid: &str) -> bool {
        self.record_path(tenant, table, opid)
            .map(|path| path.exists())
            .unwrap_or(false)
    }

    fn list(
        &self,
        tenant: &str,
        table: &str,
        op_type: Option<OperationType>,
    ) -> Result<Vec<String>> {
        check_name("tenant", tenant)?;
        check_name("table", table)?;
        let dir = self.ops_dir(tenant, table);

        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::OperationFile(format!("list {}", dir.display()), e)),
        };

        let mut opids = Vec::new();
        for entry in entries {
            let name = entry?.file_name();
            let Some(opid) = name.to_str().and_then(|n| n.strip_suffix(".json")) else {
                continue;
            };
            let matches = match op_type {
                Some(op_type) => OperationType::of_opid(opid) == Some(op_type),
                None => OperationType::of_opid(opid).is_some(),
            };
            if matches {
                opids.push(opid.to_string());
            }
        }
        opids.sort();
        Ok(opids)
    }

    fn remove(&self, tenant: &str, table: &str, opid: &str) -> Result<()> {
        let path = self.record_path(tenant, table, opid)?;
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(Error::OperationNotFound(opid.to_string()));
            }
            Err(e) => return Err(Error::OperationFile(opid.to_string(), e)),
        }

        match fs::remove_file(self.log_path(tenant, table, opid)) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(opid, error = %e, "Failed to delete operation log");
            }
        }
        Ok(())
    }

    fn log_path(&self, tenant: &str, table: &str, opid: &str) -> PathBuf {
        self.ops_dir(tenant, table).join(format!("{}.log", opid))
    }
}
