pub mod memory;
pub mod postgres;

pub use memory::MemoryRepo;
pub use postgres::PgBackupRepo;

use async_trait::async_trait;
use std::time::Duration;

use crate::errors::Result;
use crate::records::{BackupRecord, CloudCredential, ConnectionInfo, RestoreOptions};

/// Which side of a record an update targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Dump,
    Restore,
}

/// The persistence collaborator. The persisted record is the single source
/// of truth for "in flight", so the check-then-create of `insert_backup`
/// and `begin_restore` must be atomic against concurrent triggers.
///
/// Implementations enforce status monotonicity: progress and terminal
/// updates apply only while the targeted side is still loading, and a
/// terminal status never reverts.
#[async_trait]
pub trait BackupRepo: Send + Sync {
    /// Inserts a record, rejecting with `AlreadyInProgress` when the
    /// connection already has a live non-terminal backup or restore. A
    /// record counts as live while its `last_updated` is within `fresh`.
    async fn insert_backup(&self, record: BackupRecord, fresh: Duration) -> Result<BackupRecord>;

    async fn find_backup(&self, id: &str) -> Result<Option<BackupRecord>>;

    async fn find_active_backup(
        &self,
        connection_id: &str,
        fresh: Duration,
    ) -> Result<Option<BackupRecord>>;

    /// Newest first, optionally filtered by initiator.
    async fn list_backups(
        &self,
        connection_id: &str,
        initiator: Option<&str>,
    ) -> Result<Vec<BackupRecord>>;

    async fn update_progress(&self, id: &str, op: OpKind, loaded: u64, total: u64) -> Result<()>;

    async fn append_logs(&self, id: &str, op: OpKind, text: &str) -> Result<()>;

    /// Marks the restore side loading. Atomic with the single-flight check
    /// for the record's connection.
    async fn begin_restore(
        &self,
        id: &str,
        command: &str,
        options: &RestoreOptions,
        total: u64,
        fresh: Duration,
    ) -> Result<()>;

    /// Terminal ok for the dump side; also the only place the final object
    /// size is recorded.
    async fn complete_dump(&self, id: &str, size_in_bytes: i64) -> Result<()>;

    async fn complete_restore(&self, id: &str) -> Result<()>;

    async fn fail(&self, id: &str, op: OpKind, message: &str) -> Result<()>;

    async fn delete_backup(&self, id: &str) -> Result<()>;

    /// Non-terminal records whose `last_updated` is older than `older_than`;
    /// candidates for crash reconciliation.
    async fn stale_loading(&self, older_than: Duration) -> Result<Vec<BackupRecord>>;

    async fn find_connection(&self, id: &str) -> Result<Option<ConnectionInfo>>;

    async fn find_credential(&self, id: &str) -> Result<Option<CloudCredential>>;

    /// Connections with a configured keep-count, for the retention sweep.
    async fn connections_with_retention(&self) -> Result<Vec<ConnectionInfo>>;
}
