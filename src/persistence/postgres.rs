use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use std::time::Duration;

use super::{BackupRepo, OpKind};
use crate::errors::{BackupError, Result};
use crate::records::{BackupRecord, CloudCredential, ConnectionInfo, OpStatus, RestoreOptions};

/// Embedded schema, applied idempotently at startup.
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS connections (
    id               TEXT PRIMARY KEY,
    host             TEXT NOT NULL,
    port             INT  NOT NULL,
    db_name          TEXT NOT NULL,
    user_name        TEXT NOT NULL,
    password         TEXT NOT NULL,
    ssl_mode         TEXT,
    backup_keep_last INT
);

CREATE TABLE IF NOT EXISTS credentials (
    id           TEXT PRIMARY KEY,
    key_id       TEXT NOT NULL,
    key_secret   TEXT NOT NULL,
    bucket       TEXT NOT NULL,
    region       TEXT NOT NULL,
    endpoint_url TEXT
);

CREATE TABLE IF NOT EXISTS backups (
    id               TEXT PRIMARY KEY,
    connection_id    TEXT NOT NULL,
    credential_id    TEXT,
    destination      TEXT NOT NULL,
    dump_command     TEXT NOT NULL,
    options          JSONB NOT NULL,
    status           JSONB NOT NULL,
    dump_logs        TEXT,
    size_in_bytes    BIGINT,
    db_size_in_bytes BIGINT NOT NULL,
    content_type     TEXT NOT NULL,
    initiator        TEXT NOT NULL,
    created          TIMESTAMPTZ NOT NULL,
    uploaded         TIMESTAMPTZ,
    last_updated     TIMESTAMPTZ NOT NULL,
    restore_command  TEXT,
    restore_options  JSONB,
    restore_status   JSONB,
    restore_start    TIMESTAMPTZ,
    restore_end      TIMESTAMPTZ,
    restore_logs     TEXT
);

CREATE INDEX IF NOT EXISTS idx_backups_connection_created
    ON backups (connection_id, created DESC)
"#;

const BACKUP_COLUMNS: &str = "id, connection_id, credential_id, destination, dump_command, \
     options, status, dump_logs, size_in_bytes, db_size_in_bytes, content_type, initiator, \
     created, uploaded, last_updated, restore_command, restore_options, restore_status, \
     restore_start, restore_end, restore_logs";

/// sqlx/Postgres-backed record store.
pub struct PgBackupRepo {
    pool: PgPool,
}

impl PgBackupRepo {
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        let repo = Self { pool };
        repo.bootstrap().await?;
        Ok(repo)
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn bootstrap(&self) -> Result<()> {
        // One statement per prepared query.
        for statement in SCHEMA.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn cutoff(fresh: Duration) -> DateTime<Utc> {
        Utc::now() - chrono::Duration::from_std(fresh).unwrap_or_else(|_| chrono::Duration::zero())
    }
}

fn json<T: serde::Serialize>(value: &T) -> Result<serde_json::Value> {
    serde_json::to_value(value).map_err(|e| BackupError::Repo(e.to_string()))
}

fn from_json<T: serde::de::DeserializeOwned>(value: serde_json::Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| BackupError::Repo(e.to_string()))
}

fn record_from_row(row: &PgRow) -> Result<BackupRecord> {
    let options: serde_json::Value = row.try_get("options")?;
    let status: serde_json::Value = row.try_get("status")?;
    let restore_options: Option<serde_json::Value> = row.try_get("restore_options")?;
    let restore_status: Option<serde_json::Value> = row.try_get("restore_status")?;

    Ok(BackupRecord {
        id: row.try_get("id")?,
        connection_id: row.try_get("connection_id")?,
        credential_id: row.try_get("credential_id")?,
        destination: row.try_get("destination")?,
        dump_command: row.try_get("dump_command")?,
        options: from_json(options)?,
        status: from_json(status)?,
        dump_logs: row.try_get("dump_logs")?,
        size_in_bytes: row.try_get("size_in_bytes")?,
        db_size_in_bytes: row.try_get("db_size_in_bytes")?,
        content_type: row.try_get("content_type")?,
        initiator: row.try_get("initiator")?,
        created: row.try_get("created")?,
        uploaded: row.try_get("uploaded")?,
        last_updated: row.try_get("last_updated")?,
        restore_command: row.try_get("restore_command")?,
        restore_options: restore_options.map(from_json).transpose()?,
        restore_status: restore_status.map(from_json).transpose()?,
        restore_start: row.try_get("restore_start")?,
        restore_end: row.try_get("restore_end")?,
        restore_logs: row.try_get("restore_logs")?,
    })
}

fn connection_from_row(row: &PgRow) -> Result<ConnectionInfo> {
    Ok(ConnectionInfo {
        id: row.try_get("id")?,
        host: row.try_get("host")?,
        port: row.try_get::<i32, _>("port")? as u16,
        db_name: row.try_get("db_name")?,
        user: row.try_get("user_name")?,
        password: row.try_get("password")?,
        ssl_mode: row.try_get("ssl_mode")?,
        backup_keep_last: row
            .try_get::<Option<i32>, _>("backup_keep_last")?
            .map(|n| n.max(0) as u32),
    })
}

#[async_trait]
impl BackupRepo for PgBackupRepo {
    async fn insert_backup(&self, mut record: BackupRecord, fresh: Duration) -> Result<BackupRecord> {
        let mut tx = self.pool.begin().await?;

        // Serialize concurrent triggers for the same connection; a plain
        // SELECT cannot exclude a row another transaction is about to
        // insert.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(&record.connection_id)
            .execute(&mut *tx)
            .await?;

        let live: Option<String> = sqlx::query_scalar(
            "SELECT id FROM backups \
             WHERE connection_id = $1 \
               AND (status -> 'loading' IS NOT NULL OR restore_status -> 'loading' IS NOT NULL) \
               AND last_updated > $2 \
             LIMIT 1",
        )
        .bind(&record.connection_id)
        .bind(Self::cutoff(fresh))
        .fetch_optional(&mut *tx)
        .await?;
        if live.is_some() {
            return Err(BackupError::AlreadyInProgress);
        }

        record.last_updated = Utc::now();
        sqlx::query(
            "INSERT INTO backups (id, connection_id, credential_id, destination, dump_command, \
             options, status, dump_logs, size_in_bytes, db_size_in_bytes, content_type, \
             initiator, created, uploaded, last_updated) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)",
        )
        .bind(&record.id)
        .bind(&record.connection_id)
        .bind(&record.credential_id)
        .bind(&record.destination)
        .bind(&record.dump_command)
        .bind(json(&record.options)?)
        .bind(json(&record.status)?)
        .bind(&record.dump_logs)
        .bind(record.size_in_bytes)
        .bind(record.db_size_in_bytes)
        .bind(&record.content_type)
        .bind(&record.initiator)
        .bind(record.created)
        .bind(record.uploaded)
        .bind(record.last_updated)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(record)
    }

    async fn find_backup(&self, id: &str) -> Result<Option<BackupRecord>> {
        let row = sqlx::query(&format!("SELECT {BACKUP_COLUMNS} FROM backups WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn find_active_backup(
        &self,
        connection_id: &str,
        fresh: Duration,
    ) -> Result<Option<BackupRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {BACKUP_COLUMNS} FROM backups \
             WHERE connection_id = $1 \
               AND (status -> 'loading' IS NOT NULL OR restore_status -> 'loading' IS NOT NULL) \
               AND last_updated > $2 \
             LIMIT 1"
        ))
        .bind(connection_id)
        .bind(Self::cutoff(fresh))
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn list_backups(
        &self,
        connection_id: &str,
        initiator: Option<&str>,
    ) -> Result<Vec<BackupRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {BACKUP_COLUMNS} FROM backups \
             WHERE connection_id = $1 AND ($2::TEXT IS NULL OR initiator = $2) \
             ORDER BY created DESC"
        ))
        .bind(connection_id)
        .bind(initiator)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(record_from_row).collect()
    }

    async fn update_progress(&self, id: &str, op: OpKind, loaded: u64, total: u64) -> Result<()> {
        let status = json(&OpStatus::Loading { loaded, total })?;
        let query = match op {
            OpKind::Dump => {
                "UPDATE backups SET status = $2, last_updated = now() \
                 WHERE id = $1 AND status -> 'loading' IS NOT NULL"
            }
            OpKind::Restore => {
                "UPDATE backups SET restore_status = $2, last_updated = now() \
                 WHERE id = $1 AND restore_status -> 'loading' IS NOT NULL"
            }
        };
        sqlx::query(query).bind(id).bind(status).execute(&self.pool).await?;
        Ok(())
    }

    async fn append_logs(&self, id: &str, op: OpKind, text: &str) -> Result<()> {
        let query = match op {
            OpKind::Dump => {
                "UPDATE backups SET dump_logs = COALESCE(dump_logs, '') || $2, \
                 last_updated = now() WHERE id = $1"
            }
            OpKind::Restore => {
                "UPDATE backups SET restore_logs = COALESCE(restore_logs, '') || $2, \
                 last_updated = now() WHERE id = $1"
            }
        };
        sqlx::query(query).bind(id).bind(text).execute(&self.pool).await?;
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
        let mut tx = self.pool.begin().await?;

        let connection_id: Option<String> =
            sqlx::query_scalar("SELECT connection_id FROM backups WHERE id = $1")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;
        let connection_id =
            connection_id.ok_or_else(|| BackupError::NotFound(format!("backup {id}")))?;

        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(&connection_id)
            .execute(&mut *tx)
            .await?;

        let live: Option<String> = sqlx::query_scalar(
            "SELECT id FROM backups \
             WHERE connection_id = $1 \
               AND (status -> 'loading' IS NOT NULL OR restore_status -> 'loading' IS NOT NULL) \
               AND last_updated > $2 \
             LIMIT 1",
        )
        .bind(&connection_id)
        .bind(Self::cutoff(fresh))
        .fetch_optional(&mut *tx)
        .await?;
        if live.is_some() {
            return Err(BackupError::AlreadyInProgress);
        }

        sqlx::query(
            "UPDATE backups SET restore_command = $2, restore_options = $3, \
             restore_status = $4, restore_start = now(), restore_end = NULL, \
             last_updated = now() WHERE id = $1",
        )
        .bind(id)
        .bind(command)
        .bind(json(options)?)
        .bind(json(&OpStatus::Loading { loaded: 0, total })?)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn complete_dump(&self, id: &str, size_in_bytes: i64) -> Result<()> {
        sqlx::query(
            "UPDATE backups SET status = $2, size_in_bytes = $3, uploaded = now(), \
             last_updated = now() WHERE id = $1 AND status -> 'loading' IS NOT NULL",
        )
        .bind(id)
        .bind(json(&OpStatus::Ok)?)
        .bind(size_in_bytes)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn complete_restore(&self, id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE backups SET restore_status = $2, restore_end = now(), last_updated = now() \
             WHERE id = $1 AND restore_status -> 'loading' IS NOT NULL",
        )
        .bind(id)
        .bind(json(&OpStatus::Ok)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fail(&self, id: &str, op: OpKind, message: &str) -> Result<()> {
        let status = json(&OpStatus::Err(message.to_string()))?;
        let query = match op {
            OpKind::Dump => {
                "UPDATE backups SET status = $2, last_updated = now() \
                 WHERE id = $1 AND status -> 'loading' IS NOT NULL"
            }
            OpKind::Restore => {
                "UPDATE backups SET restore_status = $2, restore_end = now(), \
                 last_updated = now() \
                 WHERE id = $1 AND restore_status -> 'loading' IS NOT NULL"
            }
        };
        sqlx::query(query).bind(id).bind(status).execute(&self.pool).await?;
        Ok(())
    }

    async fn delete_backup(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM backups WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn stale_loading(&self, older_than: Duration) -> Result<Vec<BackupRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {BACKUP_COLUMNS} FROM backups \
             WHERE (status -> 'loading' IS NOT NULL OR restore_status -> 'loading' IS NOT NULL) \
               AND last_updated < $1"
        ))
        .bind(Self::cutoff(older_than))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(record_from_row).collect()
    }

    async fn find_connection(&self, id: &str) -> Result<Option<ConnectionInfo>> {
        let row = sqlx::query(
            "SELECT id, host, port, db_name, user_name, password, ssl_mode, backup_keep_last \
             FROM connections WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(connection_from_row).transpose()
    }

    async fn find_credential(&self, id: &str) -> Result<Option<CloudCredential>> {
        let row = sqlx::query(
            "SELECT id, key_id, key_secret, bucket, region, endpoint_url \
             FROM credentials WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(match row {
            Some(row) => Some(CloudCredential {
                id: row.try_get("id")?,
                key_id: row.try_get("key_id")?,
                key_secret: row.try_get("key_secret")?,
                bucket: row.try_get("bucket")?,
                region: row.try_get("region")?,
                endpoint_url: row.try_get("endpoint_url")?,
            }),
            None => None,
        })
    }

    async fn connections_with_retention(&self) -> Result<Vec<ConnectionInfo>> {
        let rows = sqlx::query(
            "SELECT id, host, port, db_name, user_name, password, ssl_mode, backup_keep_last \
             FROM connections WHERE backup_keep_last IS NOT NULL",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(connection_from_row).collect()
    }
}
