//! Backup/restore orchestration engine for PostgreSQL.
//!
//! Drives the external dump/restore programs, streaming their output to
//! local disk or S3-compatible object storage without buffering whole dumps
//! in memory. Progress, logs and outcomes live on persisted backup records;
//! operations are cancellable and a periodic sweep enforces retention,
//! evicts idle temp streams and reconciles records orphaned by a crash.

pub mod admin;
pub mod config;
pub mod errors;
pub mod manager;
pub mod persistence;
pub mod process;
pub mod records;
pub mod storage;
pub mod streams;

pub use config::EngineConfig;
pub use errors::{BackupError, Result};
pub use manager::{BackupManager, SweepReport, SweeperHandle};
pub use records::{
    BackupRecord, CloudCredential, ConnectionInfo, DumpFormat, DumpOptions, DumpProgram,
    OpStatus, RestoreOptions, RestoreProgram,
};
