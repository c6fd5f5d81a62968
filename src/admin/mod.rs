use async_trait::async_trait;
use sqlx::{Connection, PgConnection};
use std::path::Path;
use url::Url;

use crate::errors::{BackupError, Result};
use crate::records::ConnectionInfo;

/// The handful of SQL statements the engine itself needs against the
/// target server: size estimation for the space preflight and database
/// management around restores.
#[async_trait]
pub trait DbAdmin: Send + Sync {
    async fn database_size(&self, con: &ConnectionInfo) -> Result<u64>;
    async fn database_exists(&self, con: &ConnectionInfo, name: &str) -> Result<bool>;
    async fn create_database(&self, con: &ConnectionInfo, name: &str) -> Result<()>;
}

/// sqlx-backed implementation talking to the connection's own server.
pub struct PgAdmin;

impl PgAdmin {
    /// Administrative statements run against the maintenance database, not
    /// the one being dumped or restored.
    const ADMIN_DB: &'static str = "postgres";

    fn connection_url(con: &ConnectionInfo, db_name: &str) -> Result<String> {
        let mut url = Url::parse("postgres://localhost")
            .map_err(|e| BackupError::Database(e.to_string()))?;
        url.set_username(&con.user)
            .map_err(|_| BackupError::Database("invalid user in connection".to_string()))?;
        if !con.password.is_empty() {
            url.set_password(Some(&con.password))
                .map_err(|_| BackupError::Database("invalid password in connection".to_string()))?;
        }
        url.set_host(Some(&con.host))
            .map_err(|e| BackupError::Database(format!("invalid host in connection: {e}")))?;
        url.set_port(Some(con.port))
            .map_err(|_| BackupError::Database("invalid port in connection".to_string()))?;
        url.set_path(&format!("/{db_name}"));
        if let Some(ssl) = &con.ssl_mode {
            url.query_pairs_mut().append_pair("sslmode", ssl);
        }
        Ok(url.to_string())
    }

    async fn connect(con: &ConnectionInfo, db_name: &str) -> Result<PgConnection> {
        let url = Self::connection_url(con, db_name)?;
        PgConnection::connect(&url)
            .await
            .map_err(|e| BackupError::Database(format!("failed to connect to {db_name}: {e}")))
    }
}

#[async_trait]
impl DbAdmin for PgAdmin {
    async fn database_size(&self, con: &ConnectionInfo) -> Result<u64> {
        let mut conn = Self::connect(con, &con.db_name).await?;
        let size: i64 = sqlx::query_scalar("SELECT pg_database_size(current_database())")
            .fetch_one(&mut conn)
            .await?;
        Ok(size.max(0) as u64)
    }

    async fn database_exists(&self, con: &ConnectionInfo, name: &str) -> Result<bool> {
        let mut conn = Self::connect(con, Self::ADMIN_DB).await?;
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM pg_database WHERE datname = $1)")
                .bind(name)
                .fetch_one(&mut conn)
                .await?;
        Ok(exists)
    }

    async fn create_database(&self, con: &ConnectionInfo, name: &str) -> Result<()> {
        let mut conn = Self::connect(con, Self::ADMIN_DB).await?;
        let mut create_sql = format!(r#"CREATE DATABASE "{}""#, quote_ident(name));
        if !con.user.is_empty() {
            create_sql.push_str(&format!(r#" OWNER "{}""#, quote_ident(&con.user)));
        }
        sqlx::query(&create_sql).execute(&mut conn).await?;
        Ok(())
    }
}

fn quote_ident(name: &str) -> String {
    name.replace('"', "\"\"")
}

/// Free-space lookup for the local destination preflight. A trait so tests
/// can simulate a full disk without filling one.
pub trait SpaceProbe: Send + Sync {
    fn free_bytes(&self, path: &Path) -> std::io::Result<u64>;
}

pub struct DiskSpace;

impl SpaceProbe for DiskSpace {
    #[cfg(unix)]
    fn free_bytes(&self, path: &Path) -> std::io::Result<u64> {
        use std::os::unix::ffi::OsStrExt;

        let c_path = std::ffi::CString::new(path.as_os_str().as_bytes())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
        let mut stats: libc::statvfs = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stats) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(stats.f_bavail as u64 * stats.f_frsize as u64)
    }

    #[cfg(not(unix))]
    fn free_bytes(&self, _path: &Path) -> std::io::Result<u64> {
        // No portable statvfs equivalent wired up; skip the check.
        Ok(u64::MAX)
    }
}

/// Human-readable byte counts for preflight error messages.
pub fn bytes_to_size(bytes: u64) -> String {
    const SIZES: [&str; 5] = ["Bytes", "KB", "MB", "GB", "TB"];
    if bytes == 0 {
        return "0 Bytes".to_string();
    }
    let i = ((bytes as f64).ln() / 1024f64.ln()).floor() as usize;
    let i = i.min(SIZES.len() - 1);
    let value = bytes as f64 / 1024f64.powi(i as i32);
    format!("{} {}", value.round(), SIZES[i])
}
