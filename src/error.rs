use std::io;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    IoError(io::Error),
    DuplicateOperation(String),
    OperationNotFound(String),
    OperationFile(String, io::Error),
    InvalidOperationFormat(String),
    InternalOperation(String),
    UnknownTenant(String),
    UnknownTable(String, String),
    LockTimeout(String),
    LockError(io::Error), // Data directory flock
    InvalidState(String),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::IoError(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::InvalidOperationFormat(err.to_string())
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::IoError(err) => write!(f, "I/O error: {}", err),
            Error::DuplicateOperation(opid) => {
                write!(f, "Operation {} already exists", opid)
            }
            Error::OperationNotFound(opid) => write!(f, "Operation {} not found", opid),
            Error::OperationFile(context, err) => {
                write!(f, "Operation file error ({}): {}", context, err)
            }
            Error::InvalidOperationFormat(msg) => write!(f, "Invalid operation format: {}", msg),
            Error::InternalOperation(msg) => write!(f, "Internal operation error: {}", msg),
            Error::UnknownTenant(tenant) => write!(f, "Unknown tenant: {}", tenant),
            Error::UnknownTable(tenant, table) => {
                write!(f, "Unknown table {} in tenant {}", table, tenant)
            }
            Error::LockTimeout(key) => write!(f, "Timed out acquiring lock {}", key),
            Error::LockError(err) => write!(f, "Lock error: {}", err),
            Error::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::IoError(err) | Error::OperationFile(_, err) | Error::LockError(err) => Some(err),
            _ => None,
        }
    }
}
