mod cleanup;
mod command;
mod dump;
mod restore;

pub use cleanup::{SweepReport, SweeperHandle};

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::admin::{DbAdmin, DiskSpace, PgAdmin, SpaceProbe};
use crate::config::EngineConfig;
use crate::errors::{BackupError, Result, StorageError};
use crate::persistence::{BackupRepo, OpKind};
use crate::process::{LogChunk, LogSink, ToolPaths};
use crate::records::BackupRecord;
use crate::storage::{resolve_backend, StorageBackend};
use crate::streams::StreamRegistry;

/// Minimum gap between persisted progress updates.
const PROGRESS_WRITE_INTERVAL: Duration = Duration::from_secs(1);

/// The engine instance: owns the stream registry, the active-operation
/// table and the injected collaborators. Multiple independent instances can
/// coexist, each with its own persistence and storage wiring.
///
/// Cloning yields another handle to the same instance; background pipeline
/// tasks hold such handles.
#[derive(Clone)]
pub struct BackupManager {
    repo: Arc<dyn BackupRepo>,
    db_admin: Arc<dyn DbAdmin>,
    space: Arc<dyn SpaceProbe>,
    streams: Arc<StreamRegistry>,
    tools: ToolPaths,
    config: EngineConfig,
    active: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl BackupManager {
    pub fn new(repo: Arc<dyn BackupRepo>, config: EngineConfig) -> Self {
        Self {
            repo,
            db_admin: Arc::new(PgAdmin),
            space: Arc::new(DiskSpace),
            streams: Arc::new(StreamRegistry::new()),
            tools: ToolPaths::system(),
            config,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_db_admin(mut self, db_admin: Arc<dyn DbAdmin>) -> Self {
        self.db_admin = db_admin;
        self
    }

    pub fn with_space_probe(mut self, space: Arc<dyn SpaceProbe>) -> Self {
        self.space = space;
        self
    }

    pub fn with_tools(mut self, tools: ToolPaths) -> Self {
        self.tools = tools;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The multiplexer for chunked out-of-band uploads. The remote transport
    /// collaborator talks to this directly via push/close.
    pub fn streams(&self) -> &StreamRegistry {
        &self.streams
    }

    pub fn repo(&self) -> Arc<dyn BackupRepo> {
        Arc::clone(&self.repo)
    }

    /// Requests cancellation of a running operation. Returns false when the
    /// id has no live operation in this instance.
    pub fn cancel(&self, backup_id: &str) -> bool {
        let active = self.active.lock().expect("active map lock poisoned");
        match active.get(backup_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_op_active(&self, backup_id: &str) -> bool {
        self.active
            .lock()
            .expect("active map lock poisoned")
            .contains_key(backup_id)
    }

    /// Presigned download URL for a stored backup; local backups are served
    /// by the host directly and report unsupported here.
    pub async fn signed_download_url(
        &self,
        backup_id: &str,
        ttl: Duration,
    ) -> Result<String> {
        let bkp = self
            .repo
            .find_backup(backup_id)
            .await?
            .ok_or_else(|| BackupError::NotFound(format!("backup {backup_id}")))?;
        let backend = self.backend_for(&bkp).await?;
        Ok(backend.signed_download_url(&bkp.id, ttl).await?)
    }

    /// One cancellation token per operation; an optional deadline cancels it
    /// the same way an explicit cancel would.
    fn register_operation(&self, backup_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        if let Some(deadline) = self.config.operation_timeout() {
            let watchdog = token.clone();
            let id = backup_id.to_string();
            tokio::spawn(async move {
                tokio::select! {
                    _ = watchdog.cancelled() => {}
                    _ = tokio::time::sleep(deadline) => {
                        debug!(backup_id = %id, "operation deadline exceeded");
                        watchdog.cancel();
                    }
                }
            });
        }
        self.active
            .lock()
            .expect("active map lock poisoned")
            .insert(backup_id.to_string(), token.clone());
        token
    }

    fn unregister_operation(&self, backup_id: &str) {
        self.active
            .lock()
            .expect("active map lock poisoned")
            .remove(backup_id);
    }

    /// Storage backend for an existing record, resolved from its credential.
    async fn backend_for(&self, bkp: &BackupRecord) -> Result<Arc<dyn StorageBackend>> {
        let credential = match &bkp.credential_id {
            Some(cid) => Some(self.repo.find_credential(cid).await?.ok_or_else(|| {
                BackupError::InvalidCredential(format!("credential {cid} not found"))
            })?),
            None => None,
        };
        resolve_backend(credential.as_ref(), &self.config.local_backup_dir)
            .await
            .map_err(|e| match e {
                StorageError::Credential(msg) => BackupError::InvalidCredential(msg),
                other => BackupError::Storage(other),
            })
    }

    /// Persists `{loaded, total}` from a cumulative byte counter, throttled,
    /// and always lands the final value once the counter closes.
    fn spawn_progress_writer(
        &self,
        backup_id: String,
        op: OpKind,
        total: u64,
        mut progress: watch::Receiver<u64>,
    ) -> JoinHandle<()> {
        let repo = Arc::clone(&self.repo);
        tokio::spawn(async move {
            let mut last_write: Option<Instant> = None;
            while progress.changed().await.is_ok() {
                if last_write.is_some_and(|at| at.elapsed() < PROGRESS_WRITE_INTERVAL) {
                    continue;
                }
                last_write = Some(Instant::now());
                let loaded = *progress.borrow();
                let _ = repo.update_progress(&backup_id, op, loaded, total).await;
            }
            let loaded = *progress.borrow();
            let _ = repo.update_progress(&backup_id, op, loaded, total).await;
        })
    }

    /// Streams stderr fragments into the record's log column, each line
    /// stamped with the offset from the operation start.
    fn spawn_log_writer(
        &self,
        backup_id: String,
        op: OpKind,
        started: DateTime<Utc>,
    ) -> (LogSink, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<LogChunk>();
        let repo = Arc::clone(&self.repo);
        let task = tokio::spawn(async move {
            while let Some(chunk) = rx.recv().await {
                if !chunk.is_stderr {
                    continue;
                }
                let stamped = stamp_log_lines(started, &chunk.text);
                let _ = repo.append_logs(&backup_id, op, &stamped).await;
            }
        });
        (tx, task)
    }
}

/// Prefixes every line with the elapsed time since the operation started,
/// so interleaved tool output stays readable after the fact.
fn stamp_log_lines(started: DateTime<Utc>, text: &str) -> String {
    let elapsed = Utc::now()
        .signed_duration_since(started)
        .num_seconds()
        .max(0);
    let (h, m, s) = (elapsed / 3600, (elapsed % 3600) / 60, elapsed % 60);
    let prefix = format!("T+ {h:02}:{m:02}:{s:02}");
    text.lines()
        .map(|line| format!("{prefix}   {line}\n"))
        .collect()
}
