use chrono::Utc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::{command, BackupManager};
use crate::errors::{BackupError, Result};
use crate::persistence::OpKind;
use crate::process::{self, CommandSpec};
use crate::records::{
    BackupRecord, ConnectionInfo, DumpFormat, DumpOptions, DumpProgram, OpStatus, RestoreOptions,
};
use crate::storage::ByteSource;

impl BackupManager {
    /// Restores a stored backup into its connection's database. With no
    /// explicit `source` the bytes come from the backup's storage backend;
    /// a caller-supplied source covers re-uploads and piping.
    pub async fn pg_restore(
        &self,
        backup_id: &str,
        source: Option<ByteSource>,
        options: RestoreOptions,
    ) -> Result<()> {
        let bkp = self
            .repo
            .find_backup(backup_id)
            .await?
            .ok_or_else(|| BackupError::NotFound(format!("backup {backup_id}")))?;
        let con = self
            .repo
            .find_connection(&bkp.connection_id)
            .await?
            .ok_or_else(|| {
                BackupError::NotFound(format!("connection {}", bkp.connection_id))
            })?;
        let total = bkp.size_in_bytes.map(|n| n.max(0) as u64).unwrap_or(0);
        self.start_restore(bkp, con, source, options, total).await
    }

    /// Restores from a live-uploaded stream, typically one registered in
    /// the stream registry. A synthetic record tracks the operation; its id
    /// is returned for progress polling.
    pub async fn pg_restore_stream(
        &self,
        file_name: &str,
        connection_id: &str,
        source: ByteSource,
        size_bytes: u64,
        options: RestoreOptions,
    ) -> Result<String> {
        let con = self
            .repo
            .find_connection(connection_id)
            .await?
            .ok_or_else(|| BackupError::NotFound(format!("connection {connection_id}")))?;
        let db_size = self.db_admin.database_size(&con).await.unwrap_or(0);

        let created = Utc::now();
        let safe_name: String = file_name
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '.' || c == '_' { c } else { '_' })
            .collect();
        let id = format!("{safe_name}_{}", uuid::Uuid::new_v4());
        let record = BackupRecord {
            id: id.clone(),
            connection_id: con.id.clone(),
            credential_id: None,
            destination: "None (temp stream)".to_string(),
            // The uploaded file was produced elsewhere; record the assumed
            // invocation for operator reference.
            dump_command: "pg_dump --format custom --clean --if-exists".to_string(),
            options: DumpOptions {
                command: DumpProgram::PgDump,
                format: DumpFormat::Custom,
                clean: true,
                ..DumpOptions::default()
            },
            status: OpStatus::Ok,
            dump_logs: None,
            size_in_bytes: Some(size_bytes as i64),
            db_size_in_bytes: db_size as i64,
            content_type: "application/gzip".to_string(),
            initiator: format!("manual_restore_from_file: {file_name}"),
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
        let record = self
            .repo
            .insert_backup(record, self.config.single_flight_freshness())
            .await?;

        self.start_restore(record, con, Some(source), options, size_bytes)
            .await?;
        Ok(id)
    }

    async fn start_restore(
        &self,
        bkp: BackupRecord,
        con: ConnectionInfo,
        source: Option<ByteSource>,
        options: RestoreOptions,
        total: u64,
    ) -> Result<()> {
        if options.new_db_name.is_some() && options.create {
            return Err(BackupError::InvalidOptions(
                "cannot use newDbName together with create: --create always restores \
                 into the database named within the dump file"
                    .to_string(),
            ));
        }

        // Surface the collision before the tool turns it into an opaque
        // mid-restore failure.
        if options.create && !options.clean && !options.if_exists {
            if self.db_admin.database_exists(&con, &con.db_name).await? {
                return Err(BackupError::InvalidOptions(format!(
                    "database \"{}\" already exists on the target server; drop it first \
                     or enable clean/ifExists",
                    con.db_name
                )));
            }
        }

        let target_db = match &options.new_db_name {
            Some(new_db) => {
                self.db_admin.create_database(&con, new_db).await?;
                info!(database = %new_db, "created restore target database");
                new_db.clone()
            }
            None => con.db_name.clone(),
        };

        let spec = command::build_restore_command(&self.tools, &con, &options, &target_db)?;
        self.repo
            .begin_restore(
                &bkp.id,
                &command::redacted_command_string(&spec),
                &options,
                total,
                self.config.single_flight_freshness(),
            )
            .await?;

        let source = match source {
            Some(source) => source,
            None => {
                let backend = self.backend_for(&bkp).await?;
                backend.download(&bkp.id).await.map_err(BackupError::Storage)?
            }
        };

        info!(backup_id = %bkp.id, target_db = %target_db, total_bytes = total, "restore started");
        let token = self.register_operation(&bkp.id);
        let manager = self.clone();
        let id = bkp.id.clone();
        let keep_logs = options.keep_logs;
        tokio::spawn(async move {
            manager
                .run_restore_pipeline(id, spec, source, total, keep_logs, token)
                .await;
        });
        Ok(())
    }

    async fn run_restore_pipeline(
        &self,
        backup_id: String,
        spec: CommandSpec,
        source: ByteSource,
        total: u64,
        keep_logs: bool,
        token: CancellationToken,
    ) {
        let (progress_tx, progress_rx) = watch::channel(0u64);
        let progress_task = self.spawn_progress_writer(
            backup_id.clone(),
            OpKind::Restore,
            total,
            progress_rx,
        );
        let log_sink = keep_logs.then(|| {
            let (sink, _task) =
                self.spawn_log_writer(backup_id.clone(), OpKind::Restore, Utc::now());
            sink
        });

        let result = process::run_sink(&spec, source, &progress_tx, log_sink, &token).await;
        drop(progress_tx);
        let _ = progress_task.await;
        self.unregister_operation(&backup_id);

        match result {
            Ok(bytes) if !token.is_cancelled() => {
                let _ = self.repo.complete_restore(&backup_id).await;
                info!(backup_id = %backup_id, piped_bytes = bytes, "restore finished");
            }
            Ok(_) => {
                warn!(backup_id = %backup_id, "restore cancelled");
                let _ = self.repo.fail(&backup_id, OpKind::Restore, "cancelled").await;
            }
            Err(err) => {
                let err = BackupError::from(err);
                let message = err.status_message();
                if err.is_cancelled() {
                    warn!(backup_id = %backup_id, "restore cancelled");
                } else {
                    error!(backup_id = %backup_id, error = %err, "restore failed");
                }
                let _ = self.repo.fail(&backup_id, OpKind::Restore, &message).await;
            }
        }
    }
}
