//! End-to-end lifecycle tests running the real pipeline against stub
//! dump/restore executables, in-memory persistence and local storage.
#![cfg(unix)]

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::TempDir;

use dbbackup::admin::{DbAdmin, SpaceProbe};
use dbbackup::config::EngineConfig;
use dbbackup::errors::{BackupError, Result as EngineResult};
use dbbackup::manager::BackupManager;
use dbbackup::persistence::{BackupRepo, MemoryRepo, OpKind};
use dbbackup::process::ToolPaths;
use dbbackup::records::{
    BackupRecord, ConnectionInfo, DumpFormat, DumpOptions, OpStatus, RestoreOptions,
    RestoreProgram, AUTO_INITIATOR,
};

struct FakeDbAdmin {
    size: u64,
    existing: Mutex<HashSet<String>>,
}

impl FakeDbAdmin {
    fn new(size: u64) -> Self {
        Self {
            size,
            existing: Mutex::new(HashSet::new()),
        }
    }
}

#[async_trait]
impl DbAdmin for FakeDbAdmin {
    async fn database_size(&self, _con: &ConnectionInfo) -> EngineResult<u64> {
        Ok(self.size)
    }

    async fn database_exists(&self, _con: &ConnectionInfo, name: &str) -> EngineResult<bool> {
        Ok(self.existing.lock().unwrap().contains(name))
    }

    async fn create_database(&self, _con: &ConnectionInfo, name: &str) -> EngineResult<()> {
        self.existing.lock().unwrap().insert(name.to_string());
        Ok(())
    }
}

struct FakeSpace {
    free: u64,
}

impl SpaceProbe for FakeSpace {
    fn free_bytes(&self, _path: &Path) -> std::io::Result<u64> {
        Ok(self.free)
    }
}

struct Harness {
    manager: Arc<BackupManager>,
    repo: Arc<MemoryRepo>,
    _tools_dir: TempDir,
    storage_dir: TempDir,
}

fn write_tool(dir: &Path, name: &str, body: &str) {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write stub tool");
    let mut perms = std::fs::metadata(&path).expect("stat stub").permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).expect("chmod stub");
}

fn connection() -> ConnectionInfo {
    ConnectionInfo {
        id: "c1".into(),
        host: "localhost".into(),
        port: 5432,
        db_name: "appdb".into(),
        user: "app".into(),
        password: "s3cret-pw".into(),
        ssl_mode: None,
        backup_keep_last: None,
    }
}

/// Builds an engine wired to stub executables: `dump_body` runs in place of
/// pg_dump, `cat >/dev/null` in place of the restore tools.
fn harness(dump_body: &str, db_size: u64, free_space: u64) -> Harness {
    let tools_dir = tempfile::tempdir().expect("tools dir");
    let storage_dir = tempfile::tempdir().expect("storage dir");
    write_tool(tools_dir.path(), "pg_dump", dump_body);
    write_tool(tools_dir.path(), "pg_dumpall", dump_body);
    write_tool(tools_dir.path(), "pg_restore", "cat >/dev/null");
    write_tool(tools_dir.path(), "psql", "cat >/dev/null");

    let repo = Arc::new(MemoryRepo::new());
    repo.add_connection(connection());

    let config = EngineConfig {
        local_backup_dir: storage_dir.path().to_path_buf(),
        single_flight_freshness_secs: 5,
        ..EngineConfig::default()
    };
    let manager = Arc::new(
        BackupManager::new(Arc::clone(&repo) as Arc<dyn BackupRepo>, config)
            .with_db_admin(Arc::new(FakeDbAdmin::new(db_size)))
            .with_space_probe(Arc::new(FakeSpace { free: free_space }))
            .with_tools(ToolPaths::in_dir(tools_dir.path())),
    );

    Harness {
        manager,
        repo,
        _tools_dir: tools_dir,
        storage_dir,
    }
}

async fn wait_until_terminal(repo: &MemoryRepo, id: &str, op: OpKind) -> BackupRecord {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let rec = repo
            .find_backup(id)
            .await
            .expect("repo read")
            .expect("record exists");
        let terminal = match op {
            OpKind::Dump => rec.status.is_terminal(),
            OpKind::Restore => rec.restore_status.as_ref().is_some_and(|s| s.is_terminal()),
        };
        if terminal {
            return rec;
        }
        assert!(
            Instant::now() < deadline,
            "operation did not reach a terminal status in time"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

const GB: u64 = 1_000_000_000;

#[tokio::test]
async fn dump_transitions_loading_to_ok_with_identical_object() {
    let h = harness("printf 'pg dump payload bytes'", 1000, 10 * GB);
    let backup_id = h
        .manager
        .pg_dump(
            "c1",
            None,
            DumpOptions {
                format: DumpFormat::Plain,
                ..DumpOptions::default()
            },
            None,
        )
        .await
        .expect("backup starts");

    let rec = wait_until_terminal(&h.repo, &backup_id, OpKind::Dump).await;
    assert_eq!(rec.status, OpStatus::Ok);
    assert_eq!(rec.size_in_bytes, Some(21));
    assert!(rec.uploaded.is_some());
    assert_eq!(rec.destination, "Local");
    assert!(!rec.dump_command.contains("s3cret-pw"));
    assert!(rec.dump_command.contains("PGPASSWORD=[redacted]"));

    let stored = std::fs::read(h.storage_dir.path().join(&backup_id)).expect("object exists");
    assert_eq!(stored, b"pg dump payload bytes");
}

#[tokio::test]
async fn second_backup_while_loading_is_rejected_without_a_record() {
    let h = harness("printf 'x'; sleep 30", 1000, 10 * GB);
    let backup_id = h
        .manager
        .pg_dump("c1", None, DumpOptions::default(), None)
        .await
        .expect("first backup starts");

    let err = h
        .manager
        .pg_dump("c1", None, DumpOptions::default(), None)
        .await
        .expect_err("second backup must be rejected");
    assert!(matches!(err, BackupError::AlreadyInProgress));
    assert_eq!(h.repo.backup_count(), 1);

    assert!(h.manager.cancel(&backup_id));
    wait_until_terminal(&h.repo, &backup_id, OpKind::Dump).await;
}

#[tokio::test]
async fn insufficient_space_rejects_before_any_process_runs() {
    let h = harness("touch \"$PGHOST-dump-ran\"; printf 'x'", GB, 10);
    let _ = std::fs::remove_file("localhost-dump-ran");

    let err = h
        .manager
        .pg_dump("c1", None, DumpOptions::default(), None)
        .await
        .expect_err("no space");
    assert!(matches!(err, BackupError::InsufficientSpace(_)));
    assert_eq!(h.repo.backup_count(), 0, "no record may be created");

    // The stub would have dropped a marker file had it been spawned.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!Path::new("localhost-dump-ran").exists());
}

#[tokio::test]
async fn cancelling_mid_dump_kills_the_child_and_leaves_no_object() {
    let h = harness("printf 'x'; sleep 30", 1000, 10 * GB);
    let backup_id = h
        .manager
        .pg_dump("c1", None, DumpOptions::default(), None)
        .await
        .expect("backup starts");

    // Wait until the child demonstrably produced bytes.
    let deadline = Instant::now() + Duration::from_secs(5);
    while h.repo.last_progress(&backup_id, OpKind::Dump).is_none() {
        assert!(Instant::now() < deadline, "pipeline never started");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let started = Instant::now();
    assert!(h.manager.cancel(&backup_id));
    let rec = wait_until_terminal(&h.repo, &backup_id, OpKind::Dump).await;

    assert_eq!(rec.status.err_message(), Some("cancelled"));
    assert!(
        started.elapsed() < Duration::from_secs(10),
        "the sleeping child must have been killed, not waited for"
    );
    assert!(!h.storage_dir.path().join(&backup_id).exists());
    assert!(!h
        .storage_dir
        .path()
        .join(format!("{backup_id}.part"))
        .exists());
    assert!(!h.manager.is_op_active(&backup_id));
}

#[tokio::test]
async fn restore_stream_reports_exact_progress() {
    let h = harness("printf 'unused'", 500, 10 * GB);

    let (stream_id, source) = h.manager.streams().open("upload.dump", "admin");
    let payload: Vec<u8> = (0..=255u8).cycle().take(1000).collect();

    let manager = Arc::clone(&h.manager);
    let push_payload = payload.clone();
    let pusher = tokio::spawn(async move {
        for chunk in push_payload.chunks(77) {
            manager
                .streams()
                .push(&stream_id, Bytes::copy_from_slice(chunk))
                .await
                .expect("push");
        }
        manager.streams().close(&stream_id);
    });

    let backup_id = h
        .manager
        .pg_restore_stream(
            "upload.dump",
            "c1",
            source,
            1000,
            RestoreOptions {
                command: RestoreProgram::Psql,
                format: DumpFormat::Plain,
                ..RestoreOptions::default()
            },
        )
        .await
        .expect("restore starts");
    pusher.await.expect("pusher");

    let rec = wait_until_terminal(&h.repo, &backup_id, OpKind::Restore).await;
    assert_eq!(rec.restore_status, Some(OpStatus::Ok));
    assert!(rec.restore_start.is_some());
    assert!(rec.restore_end.is_some());
    assert_eq!(
        h.repo.last_progress(&backup_id, OpKind::Restore),
        Some((1000, 1000))
    );
    assert_eq!(rec.initiator, "manual_restore_from_file: upload.dump");
}

#[tokio::test]
async fn restore_with_create_precheck_rejects_existing_database() {
    let h = harness("printf 'unused'", 500, 10 * GB);
    let admin = Arc::new(FakeDbAdmin::new(500));
    admin.existing.lock().unwrap().insert("appdb".to_string());

    // Rebuild the manager with the primed admin.
    let manager = Arc::new(
        BackupManager::new(
            Arc::clone(&h.repo) as Arc<dyn BackupRepo>,
            h.manager.config().clone(),
        )
        .with_db_admin(admin)
        .with_space_probe(Arc::new(FakeSpace { free: 10 * GB })),
    );

    let (_, source) = manager.streams().open("f.dump", "admin");
    let err = manager
        .pg_restore_stream(
            "f.dump",
            "c1",
            source,
            10,
            RestoreOptions {
                create: true,
                ..RestoreOptions::default()
            },
        )
        .await
        .expect_err("existing target database must be rejected up front");
    assert!(matches!(err, BackupError::InvalidOptions(_)));
    assert!(err.to_string().contains("appdb"));
}

#[tokio::test]
async fn new_db_name_conflicts_with_create() {
    let h = harness("printf 'unused'", 500, 10 * GB);
    let (_, source) = h.manager.streams().open("f.dump", "admin");
    let err = h
        .manager
        .pg_restore_stream(
            "f.dump",
            "c1",
            source,
            10,
            RestoreOptions {
                create: true,
                new_db_name: Some("copy".into()),
                ..RestoreOptions::default()
            },
        )
        .await
        .expect_err("conflicting options");
    assert!(matches!(err, BackupError::InvalidOptions(_)));
}

#[tokio::test]
async fn bkp_delete_semantics() {
    let h = harness("printf 'payload'", 1000, 10 * GB);

    // Unknown id: safe no-op.
    h.manager
        .bkp_delete("does-not-exist", false)
        .await
        .expect("unknown id is a no-op");

    // Completed backup: object and record both go away.
    let backup_id = h
        .manager
        .pg_dump("c1", None, DumpOptions::default(), None)
        .await
        .expect("backup starts");
    wait_until_terminal(&h.repo, &backup_id, OpKind::Dump).await;
    assert!(h.storage_dir.path().join(&backup_id).exists());

    h.manager.bkp_delete(&backup_id, false).await.expect("delete");
    assert!(!h.storage_dir.path().join(&backup_id).exists());
    assert!(h.repo.find_backup(&backup_id).await.unwrap().is_none());
}

#[tokio::test]
async fn bkp_delete_refuses_in_flight_without_force() {
    let h = harness("printf 'x'; sleep 30", 1000, 10 * GB);
    let backup_id = h
        .manager
        .pg_dump("c1", None, DumpOptions::default(), None)
        .await
        .expect("backup starts");

    let err = h
        .manager
        .bkp_delete(&backup_id, false)
        .await
        .expect_err("in-flight backups cannot be deleted");
    assert!(matches!(err, BackupError::OperationInProgress));
    assert_eq!(err.to_string(), "cannot delete: operation in progress");

    h.manager
        .bkp_delete(&backup_id, true)
        .await
        .expect("force delete wins");
    assert!(h.repo.find_backup(&backup_id).await.unwrap().is_none());

    h.manager.cancel(&backup_id);
}

fn terminal_record(id: &str, connection_id: &str, initiator: &str, age_mins: i64) -> BackupRecord {
    BackupRecord {
        id: id.to_string(),
        connection_id: connection_id.to_string(),
        credential_id: None,
        destination: "Local".into(),
        dump_command: "pg_dump -v".into(),
        options: DumpOptions::default(),
        status: OpStatus::Ok,
        dump_logs: None,
        size_in_bytes: Some(1),
        db_size_in_bytes: 1,
        content_type: "application/gzip".into(),
        initiator: initiator.to_string(),
        created: Utc::now() - chrono::Duration::minutes(age_mins),
        uploaded: None,
        last_updated: Utc::now(),
        restore_command: None,
        restore_options: None,
        restore_status: None,
        restore_start: None,
        restore_end: None,
        restore_logs: None,
    }
}

#[tokio::test]
async fn sweep_reconciles_orphans_and_prunes_beyond_keep_count() {
    let h = harness("printf 'unused'", 1000, 10 * GB);
    let fresh = Duration::from_secs(5);

    // A crashed operation: loading, stale, not registered in-process.
    let mut orphan = terminal_record("orphan", "c1", "manual_backup", 0);
    orphan.status = OpStatus::Loading { loaded: 5, total: 10 };
    h.repo.insert_backup(orphan, fresh).await.expect("insert orphan");
    h.repo
        .set_last_updated("orphan", Utc::now() - chrono::Duration::seconds(120));

    // Retention: keep-count 1 on the connection, three automatic backups.
    let mut con = connection();
    con.id = "c2".into();
    con.backup_keep_last = Some(1);
    h.repo.add_connection(con);
    for (id, age) in [("auto-old", 30), ("auto-mid", 20), ("auto-new", 10)] {
        h.repo
            .insert_backup(terminal_record(id, "c2", AUTO_INITIATOR, age), fresh)
            .await
            .expect("insert auto backup");
    }

    let report = h.manager.sweep().await.expect("sweep");
    assert_eq!(report.orphaned_records, 1);
    assert_eq!(report.pruned_backups, 2);

    let orphan = h.repo.find_backup("orphan").await.unwrap().expect("still there");
    assert!(matches!(orphan.status, OpStatus::Err(_)));

    assert!(h.repo.find_backup("auto-new").await.unwrap().is_some());
    assert!(h.repo.find_backup("auto-mid").await.unwrap().is_none());
    assert!(h.repo.find_backup("auto-old").await.unwrap().is_none());
}

#[tokio::test]
async fn dump_failure_records_stderr_tail_and_cleans_partial_object() {
    let h = harness("printf 'partial'; echo 'dump exploded' >&2; exit 2", 1000, 10 * GB);
    let backup_id = h
        .manager
        .pg_dump("c1", None, DumpOptions::default(), None)
        .await
        .expect("backup starts");

    let rec = wait_until_terminal(&h.repo, &backup_id, OpKind::Dump).await;
    let message = rec.status.err_message().expect("failed status");
    assert!(message.contains("dump exploded"));
    assert_eq!(rec.size_in_bytes, None);
    assert!(
        !h.storage_dir.path().join(&backup_id).exists(),
        "partial object must be cleaned up"
    );
}

#[tokio::test]
async fn keep_logs_streams_stderr_into_the_record() {
    let h = harness(
        "echo 'dumping schema' >&2; printf 'bytes'; echo 'done' >&2",
        1000,
        10 * GB,
    );
    let backup_id = h
        .manager
        .pg_dump(
            "c1",
            None,
            DumpOptions {
                keep_logs: true,
                ..DumpOptions::default()
            },
            None,
        )
        .await
        .expect("backup starts");

    let rec = wait_until_terminal(&h.repo, &backup_id, OpKind::Dump).await;
    assert_eq!(rec.status, OpStatus::Ok);
    // Log delivery races completion by a hair; give it a beat.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let rec = h.repo.find_backup(&backup_id).await.unwrap().unwrap();
    let logs = rec.dump_logs.expect("logs kept");
    assert!(logs.contains("dumping schema"));
    assert!(logs.contains("T+ 00:00:0"));
}
