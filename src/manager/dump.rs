use chrono::Utc;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::{command, BackupManager};
use crate::admin::bytes_to_size;
use crate::errors::{BackupError, Result, StorageError};
use crate::persistence::OpKind;
use crate::process::{self, CommandSpec};
use crate::records::{BackupRecord, DumpOptions, OpStatus};
use crate::storage::{resolve_backend, StorageBackend};

impl BackupManager {
    /// Starts a backup of `connection_id` into local storage
    /// (`credential_id` = None) or the credential's cloud bucket.
    ///
    /// All preflight checks run before any record or process exists:
    /// credential resolution, the single-flight check and the destination
    /// space check. After the record is inserted the pipeline runs in the
    /// background and the returned id is the handle for progress polling,
    /// cancellation and deletion.
    pub async fn pg_dump(
        &self,
        connection_id: &str,
        credential_id: Option<&str>,
        options: DumpOptions,
        initiator: Option<&str>,
    ) -> Result<String> {
        let con = self
            .repo
            .find_connection(connection_id)
            .await?
            .ok_or_else(|| BackupError::NotFound(format!("connection {connection_id}")))?;

        let credential = match credential_id {
            Some(cid) => Some(self.repo.find_credential(cid).await?.ok_or_else(|| {
                BackupError::InvalidCredential(format!("credential {cid} not found"))
            })?),
            None => None,
        };
        let backend = resolve_backend(credential.as_ref(), &self.config.local_backup_dir)
            .await
            .map_err(|e| match e {
                StorageError::Credential(msg) => BackupError::InvalidCredential(msg),
                other => BackupError::Storage(other),
            })?;

        let fresh = self.config.single_flight_freshness();
        if self
            .repo
            .find_active_backup(connection_id, fresh)
            .await?
            .is_some()
        {
            return Err(BackupError::AlreadyInProgress);
        }

        let estimate = self.db_admin.database_size(&con).await?;
        self.check_destination_space(credential.is_some(), estimate)?;

        let spec = command::build_dump_command(&self.tools, &con, &options)?;
        let created = Utc::now();
        let backup_id = command::backup_object_id(&con.db_name, created, &options);
        let record = BackupRecord {
            id: backup_id.clone(),
            connection_id: con.id.clone(),
            credential_id: credential.as_ref().map(|c| c.id.clone()),
            destination: if credential.is_some() { "Cloud" } else { "Local" }.to_string(),
            dump_command: command::redacted_command_string(&spec),
            options: options.clone(),
            status: OpStatus::Loading {
                loaded: 0,
                total: estimate,
            },
            dump_logs: None,
            size_in_bytes: None,
            db_size_in_bytes: estimate as i64,
            content_type: command::dump_content_type(&options).to_string(),
            initiator: initiator.unwrap_or("manual_backup").to_string(),
            created,
            uploaded: None,
            last_updated: created,
            restore_command: None,
            restore_options: None,
            restore_status: None,
            restore_start: None,
            restore_end: None,
            restore_logs: None,
        };
        let record = self.repo.insert_backup(record, fresh).await?;
        info!(
            backup_id = %backup_id,
            connection_id,
            destination = %record.destination,
            estimate_bytes = estimate,
            "backup started"
        );

        let token = self.register_operation(&backup_id);
        let manager = self.clone();
        tokio::spawn(async move {
            manager
                .run_dump_pipeline(record, spec, backend, estimate, token)
                .await;
        });

        Ok(backup_id)
    }

    /// Local destinations are checked against real free disk space with a
    /// fixed floor and headroom over the estimate. Cloud destinations have
    /// no free-space notion, so an optional configured quota stands in.
    fn check_destination_space(&self, cloud: bool, estimate: u64) -> Result<()> {
        let needed = (estimate as f64 * self.config.size_headroom) as u64;

        if cloud {
            if let Some(quota) = self.config.cloud_quota_bytes {
                if needed > quota {
                    return Err(BackupError::InsufficientSpace(format!(
                        "Configured cloud quota is too small for this database:\n\
                         Quota: {} \nRequired: {}",
                        bytes_to_size(quota),
                        bytes_to_size(needed)
                    )));
                }
            }
            return Ok(());
        }

        std::fs::create_dir_all(&self.config.local_backup_dir)?;
        let free = self.space.free_bytes(&self.config.local_backup_dir)?;
        if free < self.config.min_free_disk_bytes {
            return Err(BackupError::InsufficientSpace(format!(
                "There is not enough space on server for local backups:\n\
                 Remaining: {} \nRequired: {}",
                bytes_to_size(free),
                bytes_to_size(self.config.min_free_disk_bytes)
            )));
        }
        if free < needed {
            return Err(BackupError::InsufficientSpace(format!(
                "There is not enough space on server for local backups:\n\
                 Remaining: {} \nRequired: {} (database size plus headroom)",
                bytes_to_size(free),
                bytes_to_size(needed)
            )));
        }
        Ok(())
    }

    async fn run_dump_pipeline(
        &self,
        record: BackupRecord,
        spec: CommandSpec,
        backend: Arc<dyn StorageBackend>,
        estimate: u64,
        token: CancellationToken,
    ) {
        let backup_id = record.id.clone();
        let result = self
            .dump_pipeline_inner(&record, spec, Arc::clone(&backend), estimate, &token)
            .await;
        self.unregister_operation(&backup_id);

        match result {
            Ok(length) => {
                let _ = self.repo.complete_dump(&backup_id, length as i64).await;
                info!(backup_id = %backup_id, size_bytes = length, "backup finished");
            }
            Err(err) => {
                let message = err.status_message();
                if err.is_cancelled() {
                    warn!(backup_id = %backup_id, "backup cancelled");
                } else {
                    error!(backup_id = %backup_id, error = %err, "backup failed");
                }
                // The upload may have finished with truncated data before
                // the process failure surfaced; never leave that object
                // behind.
                match backend.delete(&backup_id).await {
                    Ok(()) | Err(StorageError::NotFound(_)) => {}
                    Err(del_err) => {
                        warn!(backup_id = %backup_id, error = %del_err, "partial object cleanup failed");
                    }
                }
                let _ = self.repo.fail(&backup_id, OpKind::Dump, &message).await;
            }
        }
    }

    async fn dump_pipeline_inner(
        &self,
        record: &BackupRecord,
        spec: CommandSpec,
        backend: Arc<dyn StorageBackend>,
        estimate: u64,
        token: &CancellationToken,
    ) -> Result<u64> {
        let (progress_tx, progress_rx) = watch::channel(0u64);
        let progress_task = self.spawn_progress_writer(
            record.id.clone(),
            OpKind::Dump,
            estimate,
            progress_rx,
        );
        let log_sink = record.options.keep_logs.then(|| {
            let (sink, _task) = self.spawn_log_writer(record.id.clone(), OpKind::Dump, record.created);
            sink
        });

        let (source_proc, stdout) = process::spawn_source(&spec, log_sink)?;
        let upload = backend.upload(
            &record.id,
            stdout,
            &record.content_type,
            &progress_tx,
            token,
        );
        let (upload_res, proc_res) = tokio::join!(upload, source_proc.finish(token));

        drop(progress_tx);
        let _ = progress_task.await;

        if token.is_cancelled() {
            return Err(BackupError::Cancelled);
        }
        // A failed process wins over an upload that "succeeded" with
        // whatever bytes arrived before the failure.
        proc_res?;
        let object = upload_res?;
        Ok(object.length)
    }
}
