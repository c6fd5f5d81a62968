use thiserror::Error;

/// Errors surfaced by the backup/restore engine.
///
/// Preflight variants are returned before any record is written or process
/// is spawned. Everything that happens after the record exists is also
/// written to the record's status/log fields, which are the outcome channel
/// the host application reads.
#[derive(Error, Debug)]
pub enum BackupError {
    #[error("cannot backup while another operation is in progress for this connection")]
    AlreadyInProgress,

    #[error("{0}")]
    InsufficientSpace(String),

    #[error("invalid cloud credential: {0}")]
    InvalidCredential(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("cannot delete: operation in progress")]
    OperationInProgress,

    #[error("invalid options: {0}")]
    InvalidOptions(String),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error("cancelled")]
    Cancelled,

    #[error("persistence error: {0}")]
    Repo(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BackupError {
    /// Message persisted into a record's err status. Cancellation keeps its
    /// short, recognisable form so the host can tell it apart from failures.
    pub fn status_message(&self) -> String {
        if self.is_cancelled() {
            "cancelled".to_string()
        } else {
            self.to_string()
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            BackupError::Cancelled
                | BackupError::Process(ProcessError::Cancelled)
                | BackupError::Storage(StorageError::Cancelled)
        )
    }
}

/// Normalized child-process failures. Raw OS and pipe errors never leave the
/// executor in their original shape.
#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("{tool} executable not found in PATH. Ensure PostgreSQL client tools are installed and in your PATH.")]
    ToolNotFound { tool: String },

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with code {code}: {stderr_tail}")]
    NonZeroExit {
        program: String,
        code: i32,
        stderr_tail: String,
    },

    #[error("I/O error while piping {program}: {source}")]
    Pipe {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cancelled")]
    Cancelled,
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("incomplete cloud credential: {0}")]
    Credential(String),

    #[error("upload failed: {0}")]
    Upload(String),

    #[error("download failed: {0}")]
    Download(String),

    #[error("delete failed: {0}")]
    Delete(String),

    #[error("object {name} landed with {stored} bytes, expected {sent}")]
    LengthMismatch { name: String, sent: u64, stored: u64 },

    #[error("object not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Unsupported(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cancelled")]
    Cancelled,
}

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("stream not found: {0}")]
    NotFound(String),

    #[error("stream closed: {0}")]
    Closed(String),
}

impl From<sqlx::Error> for BackupError {
    fn from(err: sqlx::Error) -> Self {
        BackupError::Database(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
