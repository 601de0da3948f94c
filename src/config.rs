//! Service configuration
//!
//! Resolution order: built-in defaults, then an optional JSON config file,
//! then `CATALOG_SYNC_*` environment variables (a `.env` file is honoured).

use crate::remote::{FsStore, HttpStore, MemoryStore, RemoteError, RemoteStore};
use crate::sync::recovery::RetryPolicy;
use crate::sync::scheduler::{MAX_INTERVAL_SECS, MIN_INTERVAL_SECS};
use crate::sync::{SyncOptions, TieBreak};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const ENV_PREFIX: &str = "CATALOG_SYNC_";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("Invalid config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Remote store unavailable: {0}")]
    Remote(#[from] RemoteError),
}

/// Where the shared catalog lives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RemoteConfig {
    /// In-process store (single-process demos and tests)
    Memory,

    /// Shared directory (network mount)
    Fs { root: PathBuf },

    /// HTTP object store with conditional request support
    Http {
        base_url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
}

impl RemoteConfig {
    /// `memory`, `fs:<path>`, or an `http(s)://` URL
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let raw = raw.trim();
        if raw == "memory" {
            Ok(RemoteConfig::Memory)
        } else if let Some(root) = raw.strip_prefix("fs:") {
            Ok(RemoteConfig::Fs {
                root: PathBuf::from(root),
            })
        } else if raw.starts_with("http://") || raw.starts_with("https://") {
            Ok(RemoteConfig::Http {
                base_url: raw.to_string(),
                token: None,
            })
        } else {
            Err(ConfigError::InvalidValue {
                key: format!("{}REMOTE", ENV_PREFIX),
                value: raw.to_string(),
            })
        }
    }

    pub fn connect(&self, network_timeout: Duration) -> Result<Arc<dyn RemoteStore>, ConfigError> {
        Ok(match self {
            RemoteConfig::Memory => Arc::new(MemoryStore::new()),
            RemoteConfig::Fs { root } => Arc::new(FsStore::new(root.clone())?),
            RemoteConfig::Http { base_url, token } => {
                let store = HttpStore::new(base_url, network_timeout)?;
                match token {
                    Some(token) => Arc::new(store.with_token(token.clone())),
                    None => Arc::new(store),
                }
            }
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Lease owner identity; unique per running instance
    pub instance_id: String,

    pub data_dir: PathBuf,

    /// Relative paths resolve against `data_dir`
    pub db_file: PathBuf,
    pub backup_dir: PathBuf,

    /// JSON array of seed records for last-resort rebuilds
    pub seed_path: Option<PathBuf>,

    pub remote: RemoteConfig,
    pub remote_prefix: String,

    pub lease_ttl_secs: u64,
    pub lease_safety_margin_secs: u64,
    pub network_timeout_secs: u64,
    pub sync_interval_secs: u64,

    pub backup_retention: usize,
    pub history_retention: usize,
    pub max_retry_attempts: u32,
    pub retry_base_delay_ms: u64,

    pub tie_break: TieBreak,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        let data_dir = directories::ProjectDirs::from("dev", "catalog-sync", "catalog-sync")
            .map(|dirs| dirs.data_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("catalog-sync-data"));

        Self {
            instance_id: default_instance_id(),
            remote: RemoteConfig::Fs {
                root: data_dir.join("remote"),
            },
            data_dir,
            db_file: PathBuf::from("catalog.db"),
            backup_dir: PathBuf::from("backups"),
            seed_path: None,
            remote_prefix: "catalog".to_string(),
            lease_ttl_secs: 120,
            lease_safety_margin_secs: 15,
            network_timeout_secs: 30,
            sync_interval_secs: 300,
            backup_retention: 10,
            history_retention: 500,
            max_retry_attempts: 2,
            retry_base_delay_ms: 1000,
            tie_break: TieBreak::default(),
        }
    }
}

/// `<hostname>-<8 hex chars>`
fn default_instance_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "instance".to_string());

    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", host, &suffix[..8])
}

impl ServiceConfig {
    /// Defaults, optional JSON file, environment; then validated
    pub fn load(file: Option<&Path>) -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let file = file
            .map(Path::to_path_buf)
            .or_else(|| std::env::var(format!("{}CONFIG", ENV_PREFIX)).ok().map(PathBuf::from));

        let mut config = match file {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };

        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Apply `CATALOG_SYNC_*` overrides from `lookup`
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        let get = |name: &str| {
            let key = format!("{}{}", ENV_PREFIX, name);
            lookup(&key).map(|value| (key, value))
        };

        if let Some((_, v)) = get("INSTANCE_ID") {
            self.instance_id = v;
        }
        if let Some((_, v)) = get("DATA_DIR") {
            self.data_dir = PathBuf::from(v);
        }
        if let Some((_, v)) = get("DB_FILE") {
            self.db_file = PathBuf::from(v);
        }
        if let Some((_, v)) = get("BACKUP_DIR") {
            self.backup_dir = PathBuf::from(v);
        }
        if let Some((_, v)) = get("SEED_PATH") {
            self.seed_path = Some(PathBuf::from(v));
        }
        if let Some((_, v)) = get("REMOTE") {
            self.remote = RemoteConfig::parse(&v)?;
        }
        if let Some((_, v)) = get("REMOTE_TOKEN") {
            if let RemoteConfig::Http { token, .. } = &mut self.remote {
                *token = Some(v);
            }
        }
        if let Some((_, v)) = get("REMOTE_PREFIX") {
            self.remote_prefix = v;
        }
        if let Some((k, v)) = get("TIE_BREAK") {
            self.tie_break =
                TieBreak::from_str(&v).map_err(|_| ConfigError::InvalidValue { key: k, value: v })?;
        }

        if let Some(kv) = get("LEASE_TTL_SECS") {
            self.lease_ttl_secs = parse_number(kv)?;
        }
        if let Some(kv) = get("LEASE_SAFETY_MARGIN_SECS") {
            self.lease_safety_margin_secs = parse_number(kv)?;
        }
        if let Some(kv) = get("NETWORK_TIMEOUT_SECS") {
            self.network_timeout_secs = parse_number(kv)?;
        }
        if let Some(kv) = get("SYNC_INTERVAL_SECS") {
            self.sync_interval_secs = parse_number(kv)?;
        }
        if let Some(kv) = get("BACKUP_RETENTION") {
            self.backup_retention = parse_number(kv)?;
        }
        if let Some(kv) = get("HISTORY_RETENTION") {
            self.history_retention = parse_number(kv)?;
        }
        if let Some(kv) = get("MAX_RETRY_ATTEMPTS") {
            self.max_retry_attempts = parse_number(kv)?;
        }
        if let Some(kv) = get("RETRY_BASE_DELAY_MS") {
            self.retry_base_delay_ms = parse_number(kv)?;
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.instance_id.trim().is_empty() {
            return Err(ConfigError::Invalid("instance_id must not be empty".to_string()));
        }

        if self.remote_prefix.is_empty()
            || self.remote_prefix.starts_with('/')
            || self.remote_prefix.ends_with('/')
        {
            return Err(ConfigError::Invalid(format!(
                "remote_prefix must be a relative key without trailing slash, got {:?}",
                self.remote_prefix
            )));
        }

        if self.network_timeout_secs == 0 {
            return Err(ConfigError::Invalid("network_timeout_secs must be positive".to_string()));
        }

        // A cycle makes at least two bounded remote round trips before renewing
        let minimum_ttl = 2 * self.network_timeout_secs + self.lease_safety_margin_secs;
        if self.lease_ttl_secs < minimum_ttl {
            return Err(ConfigError::Invalid(format!(
                "lease_ttl_secs ({}) must be at least 2 x network_timeout_secs + lease_safety_margin_secs ({})",
                self.lease_ttl_secs, minimum_ttl
            )));
        }

        if !(MIN_INTERVAL_SECS..=MAX_INTERVAL_SECS).contains(&self.sync_interval_secs) {
            return Err(ConfigError::Invalid(format!(
                "sync_interval_secs must be {}-{}, got {}",
                MIN_INTERVAL_SECS, MAX_INTERVAL_SECS, self.sync_interval_secs
            )));
        }

        if self.backup_retention == 0 || self.history_retention == 0 {
            return Err(ConfigError::Invalid(
                "backup_retention and history_retention must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(&self.db_file)
    }

    pub fn backup_path(&self) -> PathBuf {
        self.data_dir.join(&self.backup_dir)
    }

    pub fn network_timeout(&self) -> Duration {
        Duration::from_secs(self.network_timeout_secs)
    }

    pub fn sync_options(&self) -> SyncOptions {
        SyncOptions {
            instance_id: self.instance_id.clone(),
            remote_prefix: self.remote_prefix.clone(),
            lease_ttl: Duration::from_secs(self.lease_ttl_secs),
            network_timeout: self.network_timeout(),
            tie_break: self.tie_break,
            retry: RetryPolicy {
                max_attempts: self.max_retry_attempts,
                base_delay: Duration::from_millis(self.retry_base_delay_ms),
                ..RetryPolicy::default()
            },
            seed_path: self.seed_path.clone(),
            history_retention: self.history_retention,
        }
    }
}

fn parse_number<T: std::str::FromStr>((key, value): (String, String)) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidValue { key, value })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = ServiceConfig::default();
        config.validate().unwrap();
        assert!(!config.instance_id.is_empty());
        assert_eq!(config.db_path(), config.data_dir.join("catalog.db"));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = ServiceConfig::default();
        config
            .apply_env(env(&[
                ("CATALOG_SYNC_INSTANCE_ID", "node-7"),
                ("CATALOG_SYNC_REMOTE", "https://objects.example.com/catalog"),
                ("CATALOG_SYNC_REMOTE_TOKEN", "secret"),
                ("CATALOG_SYNC_LEASE_TTL_SECS", "300"),
                ("CATALOG_SYNC_TIE_BREAK", "newest_timestamp"),
            ]))
            .unwrap();

        assert_eq!(config.instance_id, "node-7");
        assert_eq!(config.lease_ttl_secs, 300);
        assert_eq!(config.tie_break, TieBreak::NewestTimestamp);
        assert_eq!(
            config.remote,
            RemoteConfig::Http {
                base_url: "https://objects.example.com/catalog".to_string(),
                token: Some("secret".to_string()),
            }
        );
    }

    #[test]
    fn test_bad_env_value_is_rejected() {
        let mut config = ServiceConfig::default();
        let err = config
            .apply_env(env(&[("CATALOG_SYNC_NETWORK_TIMEOUT_SECS", "soon")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));

        let err = config
            .apply_env(env(&[("CATALOG_SYNC_REMOTE", "ftp://nope")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_lease_ttl_must_cover_network_round_trips() {
        let config = ServiceConfig {
            lease_ttl_secs: 60,
            network_timeout_secs: 30,
            lease_safety_margin_secs: 15,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_file_config_with_partial_fields() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("config.json");
        std::fs::write(
            &path,
            r#"{ "instance_id": "from-file", "remote": { "type": "fs", "root": "/mnt/shared" } }"#,
        )
        .unwrap();

        let config = ServiceConfig::from_file(&path).unwrap();
        assert_eq!(config.instance_id, "from-file");
        assert_eq!(
            config.remote,
            RemoteConfig::Fs {
                root: PathBuf::from("/mnt/shared")
            }
        );
        assert_eq!(config.sync_interval_secs, 300);
    }

    #[test]
    fn test_sync_options_mapping() {
        let config = ServiceConfig {
            max_retry_attempts: 4,
            retry_base_delay_ms: 250,
            ..Default::default()
        };
        let options = config.sync_options();

        assert_eq!(options.retry.max_attempts, 4);
        assert_eq!(options.retry.base_delay, Duration::from_millis(250));
        assert_eq!(options.lease_ttl, Duration::from_secs(120));
        assert_eq!(options.catalog_key(), "catalog/catalog.json.gz");
    }
}
