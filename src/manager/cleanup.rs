use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::BackupManager;
use crate::errors::{BackupError, Result, StorageError};
use crate::persistence::OpKind;
use crate::records::{ConnectionInfo, AUTO_INITIATOR};

/// What a single sweep did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub evicted_streams: usize,
    pub orphaned_records: usize,
    pub pruned_backups: usize,
}

/// Handle to the background sweeper task.
pub struct SweeperHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    pub fn stop(&self) {
        self.token.cancel();
    }

    pub async fn shutdown(self) {
        self.token.cancel();
        let _ = self.task.await;
    }
}

impl BackupManager {
    /// Deletes a backup: the storage object first, then the record.
    ///
    /// Unknown ids are a safe no-op. An in-flight operation blocks deletion
    /// unless `force` is set; under `force`, storage-side failures are
    /// logged and the record is removed regardless, which is how broken
    /// records get cleaned up.
    pub async fn bkp_delete(&self, backup_id: &str, force: bool) -> Result<()> {
        let Some(bkp) = self.repo.find_backup(backup_id).await? else {
            return Ok(());
        };

        let fresh = self.config.single_flight_freshness();
        let live = bkp.in_flight()
            && (self.is_op_active(&bkp.id)
                || Utc::now()
                    .signed_duration_since(bkp.last_updated)
                    .to_std()
                    .map_or(true, |age| age <= fresh));
        if live && !force {
            return Err(BackupError::OperationInProgress);
        }

        let deleted = match self.backend_for(&bkp).await {
            Ok(backend) => match backend.delete(&bkp.id).await {
                Ok(()) | Err(StorageError::NotFound(_)) => Ok(()),
                Err(err) => Err(BackupError::Storage(err)),
            },
            Err(err) => Err(err),
        };
        if let Err(err) = deleted {
            if !force {
                return Err(err);
            }
            warn!(backup_id = %bkp.id, error = %err, "force-deleting record despite storage failure");
        }

        self.repo.delete_backup(&bkp.id).await?;
        info!(backup_id = %bkp.id, "backup deleted");
        Ok(())
    }

    /// One pass of the fixed-interval cleanup: evict idle temp streams,
    /// reconcile orphaned loading records left by a crash, and enforce
    /// per-connection retention.
    pub async fn sweep(&self) -> Result<SweepReport> {
        let mut report = SweepReport::default();

        report.evicted_streams = self
            .streams
            .evict_idle(self.config.stream_idle_timeout())
            .len();

        // A record can look stale while its pipeline is alive but between
        // progress writes; the active-operation table is the tiebreaker.
        for rec in self
            .repo
            .stale_loading(self.config.single_flight_freshness())
            .await?
        {
            if self.is_op_active(&rec.id) {
                continue;
            }
            warn!(backup_id = %rec.id, "marking orphaned operation as failed");
            if rec.status.is_loading() {
                self.repo
                    .fail(&rec.id, OpKind::Dump, "interrupted: no live operation")
                    .await?;
            }
            if rec.restore_status.as_ref().is_some_and(|s| s.is_loading()) {
                self.repo
                    .fail(&rec.id, OpKind::Restore, "interrupted: no live operation")
                    .await?;
            }
            report.orphaned_records += 1;
        }

        for con in self.repo.connections_with_retention().await? {
            match self.run_retention(&con).await {
                Ok(pruned) => report.pruned_backups += pruned,
                Err(err) => {
                    warn!(connection_id = %con.id, error = %err, "retention pruning failed")
                }
            }
        }

        Ok(report)
    }

    /// Deletes the oldest automatic backups beyond the connection's
    /// keep-count. Manually initiated backups are never pruned.
    pub async fn run_retention(&self, con: &ConnectionInfo) -> Result<usize> {
        let Some(keep) = con.backup_keep_last else {
            return Ok(0);
        };
        let backups = self
            .repo
            .list_backups(&con.id, Some(AUTO_INITIATOR))
            .await?;
        let mut pruned = 0;
        for rec in backups.iter().skip(keep as usize) {
            match self.bkp_delete(&rec.id, false).await {
                Ok(()) => pruned += 1,
                // In-flight records age out of retention on a later sweep.
                Err(BackupError::OperationInProgress) => {}
                Err(err) => {
                    warn!(backup_id = %rec.id, error = %err, "failed to prune backup")
                }
            }
        }
        Ok(pruned)
    }

    /// Runs `sweep` on the configured interval until stopped.
    pub fn spawn_sweeper(&self) -> SweeperHandle {
        let token = CancellationToken::new();
        let stop = token.clone();
        let manager = self.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.config.sweep_interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        match manager.sweep().await {
                            Ok(report) if report != SweepReport::default() => {
                                info!(
                                    evicted_streams = report.evicted_streams,
                                    orphaned_records = report.orphaned_records,
                                    pruned_backups = report.pruned_backups,
                                    "cleanup sweep finished"
                                );
                            }
                            Ok(_) => {}
                            Err(err) => warn!(error = %err, "cleanup sweep failed"),
                        }
                    }
                }
            }
        });
        SweeperHandle { token, task }
    }
}
