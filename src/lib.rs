pub mod background;
pub mod config;
pub mod engine;
pub mod error;
pub mod flock;
pub mod lock;
pub mod ops;
pub mod schema;

pub use config::{EngineConfig, Fairness};
pub use engine::Engine;
pub use error::{Error, Result};
pub use lock::{LockKey, LockManager, LockRegistry, LockType, ReadWriteLock};
pub use ops::{OperationRecord, OperationScheduler, OperationStatus, OperationType};
pub use schema::{MemorySchema, SchemaStore};
