use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use super::{BackupRepo, OpKind};
use crate::errors::{BackupError, Result};
use crate::records::{BackupRecord, CloudCredential, ConnectionInfo, OpStatus, RestoreOptions};

/// In-memory record store. Backs single-process embedded use and the test
/// suites; the mutex makes check-then-create naturally atomic.
#[derive(Default)]
pub struct MemoryRepo {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    backups: HashMap<String, BackupRecord>,
    connections: HashMap<String, ConnectionInfo>,
    credentials: HashMap<String, CloudCredential>,
    // Last persisted progress per (id, side), kept so callers can observe
    // the final loading numbers after the status went terminal.
    progress: HashMap<(String, bool), (u64, u64)>,
}

impl MemoryRepo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_connection(&self, con: ConnectionInfo) {
        self.lock().connections.insert(con.id.clone(), con);
    }

    pub fn add_credential(&self, cred: CloudCredential) {
        self.lock().credentials.insert(cred.id.clone(), cred);
    }

    pub fn backup_count(&self) -> usize {
        self.lock().backups.len()
    }

    /// Last `{loaded, total}` written for the given side of a record.
    pub fn last_progress(&self, id: &str, op: OpKind) -> Option<(u64, u64)> {
        self.lock()
            .progress
            .get(&(id.to_string(), matches!(op, OpKind::Restore)))
            .copied()
    }

    /// Rewrites a record's freshness stamp; lets tests age records into
    /// orphan territory without waiting.
    pub fn set_last_updated(&self, id: &str, at: DateTime<Utc>) {
        if let Some(rec) = self.lock().backups.get_mut(id) {
            rec.last_updated = at;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("memory repo lock poisoned")
    }
}

fn is_live(rec: &BackupRecord, fresh: Duration) -> bool {
    if !rec.in_flight() {
        return false;
    }
    let age = Utc::now().signed_duration_since(rec.last_updated);
    age.to_std().map_or(true, |age| age <= fresh)
}

fn active_for_connection<'a>(
    inner: &'a Inner,
    connection_id: &str,
    fresh: Duration,
) -> Option<&'a BackupRecord> {
    inner
        .backups
        .values()
        .find(|r| r.connection_id == connection_id && is_live(r, fresh))
}

#[async_trait]
impl BackupRepo for MemoryRepo {
    async fn insert_backup(&self, mut record: BackupRecord, fresh: Duration) -> Result<BackupRecord> {
        let mut inner = self.lock();
        if active_for_connection(&inner, &record.connection_id, fresh).is_some() {
            return Err(BackupError::AlreadyInProgress);
        }
        record.last_updated = Utc::now();
        inner.backups.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    async fn find_backup(&self, id: &str) -> Result<Option<BackupRecord>> {
        Ok(self.lock().backups.get(id).cloned())
    }

    async fn find_active_backup(
        &self,
        connection_id: &str,
        fresh: Duration,
    ) -> Result<Option<BackupRecord>> {
        Ok(active_for_connection(&self.lock(), connection_id, fresh).cloned())
    }

    async fn list_backups(
        &self,
        connection_id: &str,
        initiator: Option<&str>,
    ) -> Result<Vec<BackupRecord>> {
        let inner = self.lock();
        let mut list: Vec<BackupRecord> = inner
            .backups
            .values()
            .filter(|r| r.connection_id == connection_id)
            .filter(|r| initiator.is_none_or(|i| r.initiator == i))
            .cloned()
            .collect();
        list.sort_by(|a, b| b.created.cmp(&a.created));
        Ok(list)
    }

    async fn update_progress(&self, id: &str, op: OpKind, loaded: u64, total: u64) -> Result<()> {
        let mut inner = self.lock();
        let Some(rec) = inner.backups.get_mut(id) else {
            return Ok(());
        };
        let loading = OpStatus::Loading { loaded, total };
        match op {
            OpKind::Dump if rec.status.is_loading() => rec.status = loading,
            OpKind::Restore
                if rec.restore_status.as_ref().is_some_and(|s| s.is_loading()) =>
            {
                rec.restore_status = Some(loading)
            }
            _ => return Ok(()),
        }
        rec.last_updated = Utc::now();
        inner
            .progress
            .insert((id.to_string(), matches!(op, OpKind::Restore)), (loaded, total));
        Ok(())
    }

    async fn append_logs(&self, id: &str, op: OpKind, text: &str) -> Result<()> {
        let mut inner = self.lock();
        if let Some(rec) = inner.backups.get_mut(id) {
            let logs = match op {
                OpKind::Dump => &mut rec.dump_logs,
                OpKind::Restore => &mut rec.restore_logs,
            };
            logs.get_or_insert_with(String::new).push_str(text);
            rec.last_updated = Utc::now();
        }
        Ok(())
    }

    async fn begin_restore(
        &self,
        id: &str,
        command: &str,
        options: &RestoreOptions,
        total: u64,
        fresh: Duration,
    ) -> Result<()> {
        let mut inner = self.lock();
        let connection_id = inner
            .backups
            .get(id)
            .map(|r| r.connection_id.clone())
            .ok_or_else(|| BackupError::NotFound(format!("backup {id}")))?;
        if active_for_connection(&inner, &connection_id, fresh).is_some() {
            return Err(BackupError::AlreadyInProgress);
        }
        let rec = inner
            .backups
            .get_mut(id)
            .ok_or_else(|| BackupError::NotFound(format!("backup {id}")))?;
        rec.restore_command = Some(command.to_string());
        rec.restore_options = Some(options.clone());
        rec.restore_status = Some(OpStatus::Loading { loaded: 0, total });
        rec.restore_start = Some(Utc::now());
        rec.restore_end = None;
        rec.last_updated = Utc::now();
        Ok(())
    }

    async fn complete_dump(&self, id: &str, size_in_bytes: i64) -> Result<()> {
        let mut inner = self.lock();
        if let Some(rec) = inner.backups.get_mut(id) {
            if rec.status.is_loading() {
                rec.status = OpStatus::Ok;
                rec.size_in_bytes = Some(size_in_bytes);
                rec.uploaded = Some(Utc::now());
                rec.last_updated = Utc::now();
            }
        }
        Ok(())
    }

    async fn complete_restore(&self, id: &str) -> Result<()> {
        let mut inner = self.lock();
        if let Some(rec) = inner.backups.get_mut(id) {
            if rec.restore_status.as_ref().is_some_and(|s| s.is_loading()) {
                rec.restore_status = Some(OpStatus::Ok);
                rec.restore_end = Some(Utc::now());
                rec.last_updated = Utc::now();
            }
        }
        Ok(())
    }

    async fn fail(&self, id: &str, op: OpKind, message: &str) -> Result<()> {
        let mut inner = self.lock();
        if let Some(rec) = inner.backups.get_mut(id) {
            match op {
                OpKind::Dump if rec.status.is_loading() => {
                    rec.status = OpStatus::Err(message.to_string());
                }
                OpKind::Restore
                    if rec.restore_status.as_ref().is_some_and(|s| s.is_loading()) =>
                {
                    rec.restore_status = Some(OpStatus::Err(message.to_string()));
                    rec.restore_end = Some(Utc::now());
                }
                _ => return Ok(()),
            }
            rec.last_updated = Utc::now();
        }
        Ok(())
    }

    async fn delete_backup(&self, id: &str) -> Result<()> {
        self.lock().backups.remove(id);
        Ok(())
    }

    async fn stale_loading(&self, older_than: Duration) -> Result<Vec<BackupRecord>> {
        let inner = self.lock();
        let cutoff = Utc::now()
            - chrono::Duration::from_std(older_than).unwrap_or_else(|_| chrono::Duration::zero());
        Ok(inner
            .backups
            .values()
            .filter(|r| r.in_flight() && r.last_updated < cutoff)
            .cloned()
            .collect())
    }

    async fn find_connection(&self, id: &str) -> Result<Option<ConnectionInfo>> {
        Ok(self.lock().connections.get(id).cloned())
    }

    async fn find_credential(&self, id: &str) -> Result<Option<CloudCredential>> {
        Ok(self.lock().credentials.get(id).cloned())
    }

    async fn connections_with_retention(&self) -> Result<Vec<ConnectionInfo>> {
        Ok(self
            .lock()
            .connections
            .values()
            .filter(|c| c.backup_keep_last.is_some())
            .cloned()
            .collect())
    }
}
