use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Initiator recorded on backups created by the retention scheduler's
/// automatic runs. Keep-count pruning only ever touches these.
pub const AUTO_INITIATOR: &str = "automatic_backups";

/// Which external program produces the dump.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DumpProgram {
    /// Single-database dump.
    #[default]
    PgDump,
    /// Full-cluster dump, including roles and tablespaces.
    PgDumpAll,
}

impl DumpProgram {
    pub fn tool_name(&self) -> &'static str {
        match self {
            DumpProgram::PgDump => "pg_dump",
            DumpProgram::PgDumpAll => "pg_dumpall",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DumpFormat {
    Plain,
    #[default]
    Custom,
    Tar,
}

impl DumpFormat {
    pub fn as_flag(&self) -> &'static str {
        match self {
            DumpFormat::Plain => "plain",
            DumpFormat::Custom => "custom",
            DumpFormat::Tar => "tar",
        }
    }
}

/// Options for one dump run. Flags map one-to-one onto pg_dump/pg_dumpall
/// arguments; anything not expressible as a flag stays out of here.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DumpOptions {
    pub command: DumpProgram,
    pub format: DumpFormat,
    pub clean: bool,
    pub if_exists: bool,
    pub create: bool,
    pub no_owner: bool,
    pub data_only: bool,
    pub schema_only: bool,
    /// pg_dumpall only.
    pub globals_only: bool,
    /// pg_dumpall only.
    pub roles_only: bool,
    pub encoding: Option<String>,
    pub compression_level: Option<u8>,
    pub number_of_jobs: Option<u32>,
    /// Stream stderr into the record's dump_logs while running.
    pub keep_logs: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreProgram {
    #[default]
    PgRestore,
    Psql,
}

impl RestoreProgram {
    pub fn tool_name(&self) -> &'static str {
        match self {
            RestoreProgram::PgRestore => "pg_restore",
            RestoreProgram::Psql => "psql",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RestoreOptions {
    pub command: RestoreProgram,
    pub format: DumpFormat,
    pub clean: bool,
    pub create: bool,
    pub data_only: bool,
    pub no_owner: bool,
    pub if_exists: bool,
    pub number_of_jobs: Option<u32>,
    /// Restore into a freshly created database with this name instead of the
    /// connection's database. Mutually exclusive with `create`.
    pub new_db_name: Option<String>,
    pub keep_logs: bool,
}

/// Status of a dump or restore. Transitions are monotonic: loading may move
/// to ok or err exactly once and terminal states never revert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpStatus {
    Loading { loaded: u64, total: u64 },
    Ok,
    Err(String),
}

impl OpStatus {
    pub fn is_loading(&self) -> bool {
        matches!(self, OpStatus::Loading { .. })
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_loading()
    }

    pub fn err_message(&self) -> Option<&str> {
        match self {
            OpStatus::Err(msg) => Some(msg),
            _ => None,
        }
    }
}

/// One backup record, the single source of truth for an operation's
/// lifecycle. Restore fields live on the same record as in the host schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupRecord {
    pub id: String,
    pub connection_id: String,
    /// None means the backup went to local storage.
    pub credential_id: Option<String>,
    pub destination: String,
    /// Exact invocation with secret environment values redacted.
    pub dump_command: String,
    pub options: DumpOptions,
    pub status: OpStatus,
    pub dump_logs: Option<String>,
    /// Final object size, set only after the dump process exited 0 and the
    /// upload was verified.
    pub size_in_bytes: Option<i64>,
    /// Pre-dump estimate from pg_database_size.
    pub db_size_in_bytes: i64,
    pub content_type: String,
    pub initiator: String,
    pub created: DateTime<Utc>,
    pub uploaded: Option<DateTime<Utc>>,
    pub last_updated: DateTime<Utc>,

    pub restore_command: Option<String>,
    pub restore_options: Option<RestoreOptions>,
    pub restore_status: Option<OpStatus>,
    pub restore_start: Option<DateTime<Utc>>,
    pub restore_end: Option<DateTime<Utc>>,
    pub restore_logs: Option<String>,
}

impl BackupRecord {
    /// True while either side of the record is non-terminal.
    pub fn in_flight(&self) -> bool {
        self.status.is_loading()
            || self
                .restore_status
                .as_ref()
                .is_some_and(|s| s.is_loading())
    }
}

/// Connection descriptor supplied by the persistence collaborator. The
/// password only ever travels into child processes via the environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub db_name: String,
    pub user: String,
    pub password: String,
    /// PGSSLMODE value, when the server demands one.
    pub ssl_mode: Option<String>,
    /// Keep-count for automatic backups; None disables retention pruning.
    pub backup_keep_last: Option<u32>,
}

/// Cloud access descriptor. Its absence on a backup means local storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudCredential {
    pub id: String,
    pub key_id: String,
    pub key_secret: String,
    pub bucket: String,
    pub region: String,
    /// S3-compatible providers (Spaces, MinIO) need an explicit endpoint.
    pub endpoint_url: Option<String>,
}
