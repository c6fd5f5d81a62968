use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::records::{CloudCredential, ConnectionInfo};

/// Tunables of the engine itself. Sensible defaults mean an empty config
/// block is a working configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct EngineConfig {
    /// Root directory for local backups.
    pub local_backup_dir: PathBuf,
    /// Retention/cleanup sweep cadence.
    pub sweep_interval_secs: u64,
    /// Temp streams idle longer than this are force-evicted.
    pub stream_idle_timeout_secs: u64,
    /// Hard deadline per operation; exceeding it behaves like cancellation.
    pub operation_timeout_secs: Option<u64>,
    /// A loading record with fresher last_updated than this counts as live
    /// for the single-flight check.
    pub single_flight_freshness_secs: u64,
    /// Cloud destinations have no free-space notion; when set, the size
    /// estimate is checked against this quota instead.
    pub cloud_quota_bytes: Option<u64>,
    /// Absolute floor of free disk space required for local backups.
    pub min_free_disk_bytes: u64,
    /// Estimated size is multiplied by this before comparing to free space.
    pub size_headroom: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            local_backup_dir: PathBuf::from("./backups"),
            sweep_interval_secs: 900,
            stream_idle_timeout_secs: 60,
            operation_timeout_secs: None,
            single_flight_freshness_secs: 5,
            cloud_quota_bytes: None,
            min_free_disk_bytes: 100 * 1_000_000,
            size_headroom: 1.1,
        }
    }
}

impl EngineConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn stream_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_idle_timeout_secs)
    }

    pub fn operation_timeout(&self) -> Option<Duration> {
        self.operation_timeout_secs.map(Duration::from_secs)
    }

    pub fn single_flight_freshness(&self) -> Duration {
        Duration::from_secs(self.single_flight_freshness_secs)
    }
}

// Structs for deserializing config.json
#[derive(Debug, Clone, Deserialize)]
pub struct JsonConnectionConfig {
    pub id: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub db_name: String,
    pub user: String,
    pub password: Option<String>,
    pub ssl_mode: Option<String>,
    pub backup_keep_last: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonCloudStorageConfig {
    pub bucket_name: Option<String>,
    pub region: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub endpoint_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawJsonConfig {
    pub metadata_database_url: Option<String>,
    pub connection: Option<JsonConnectionConfig>,
    pub cloud_storage: Option<JsonCloudStorageConfig>,
    pub engine: Option<EngineConfig>,
}

/// Application configuration for the CLI wrapper around the engine.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub metadata_database_url: Option<String>,
    pub connection: Option<ConnectionInfo>,
    pub credential: Option<CloudCredential>,
    pub engine: EngineConfig,
}

impl AppConfig {
    pub fn load_from_json(config_path: &Path) -> Result<Self> {
        let config_content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file at {}", config_path.display()))?;
        let raw: RawJsonConfig = serde_json::from_str(&config_content).with_context(|| {
            format!(
                "Failed to parse JSON from config file at {}",
                config_path.display()
            )
        })?;
        Ok(Self::from_raw(raw))
    }

    pub fn from_raw(raw: RawJsonConfig) -> Self {
        let credential = raw.cloud_storage.as_ref().and_then(resolve_cloud_config);
        let connection = raw.connection.as_ref().map(|c| ConnectionInfo {
            id: c.id.clone().unwrap_or_else(|| "default".to_string()),
            host: c.host.clone().unwrap_or_else(|| "localhost".to_string()),
            port: c.port.unwrap_or(5432),
            db_name: c.db_name.clone(),
            user: c.user.clone(),
            password: c.password.clone().unwrap_or_default(),
            ssl_mode: c.ssl_mode.clone(),
            backup_keep_last: c.backup_keep_last,
        });

        AppConfig {
            metadata_database_url: raw.metadata_database_url,
            connection,
            credential,
            engine: raw.engine.unwrap_or_default(),
        }
    }
}

/// A cloud block with every required field present and non-empty yields a
/// credential; a partially filled block disables cloud storage with a
/// warning rather than failing later mid-upload.
fn resolve_cloud_config(raw: &JsonCloudStorageConfig) -> Option<CloudCredential> {
    let filled = |v: &Option<String>| v.as_ref().filter(|s| !s.is_empty()).cloned();

    if let (Some(bucket), Some(region), Some(key_id), Some(secret)) = (
        filled(&raw.bucket_name),
        filled(&raw.region),
        filled(&raw.access_key_id),
        filled(&raw.secret_access_key),
    ) {
        Some(CloudCredential {
            id: "config".to_string(),
            key_id,
            key_secret: secret,
            bucket,
            region,
            endpoint_url: filled(&raw.endpoint_url),
        })
    } else {
        if raw.bucket_name.is_some()
            || raw.region.is_some()
            || raw.access_key_id.is_some()
            || raw.secret_access_key.is_some()
        {
            tracing::warn!(
                "cloud_storage is present in config.json but some required fields \
                 (bucket_name, region, access_key_id, secret_access_key) are missing \
                 or empty. Cloud storage will be disabled."
            );
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw_from(value: serde_json::Value) -> RawJsonConfig {
        serde_json::from_value(value).expect("valid raw config")
    }

    #[test]
    fn defaults_are_usable() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.stream_idle_timeout(), Duration::from_secs(60));
        assert!(cfg.operation_timeout().is_none());
        assert!(cfg.size_headroom > 1.0);
    }

    #[test]
    fn complete_cloud_block_becomes_credential() {
        let app = AppConfig::from_raw(raw_from(json!({
            "cloud_storage": {
                "bucket_name": "bkt",
                "region": "fra1",
                "access_key_id": "AK",
                "secret_access_key": "SK",
                "endpoint_url": "https://fra1.digitaloceanspaces.com"
            }
        })));
        let cred = app.credential.expect("credential resolved");
        assert_eq!(cred.bucket, "bkt");
        assert_eq!(
            cred.endpoint_url.as_deref(),
            Some("https://fra1.digitaloceanspaces.com")
        );
    }

    #[test]
    fn incomplete_cloud_block_is_disabled() {
        let app = AppConfig::from_raw(raw_from(json!({
            "cloud_storage": { "bucket_name": "bkt", "region": "" }
        })));
        assert!(app.credential.is_none());
    }

    #[test]
    fn connection_defaults_fill_in() {
        let app = AppConfig::from_raw(raw_from(json!({
            "connection": { "db_name": "appdb", "user": "app" }
        })));
        let con = app.connection.expect("connection");
        assert_eq!(con.host, "localhost");
        assert_eq!(con.port, 5432);
        assert_eq!(con.id, "default");
    }
}
