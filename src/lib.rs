//! Catalog Sync - lease-coordinated synchronization of a shared tool catalog
//!
//! Each instance keeps a local SQLite copy of the catalog and periodically
//! reconciles it with a single remote copy. See [`sync`] for the cycle itself.

pub mod config;
pub mod db;
pub mod remote;
pub mod sync;

use config::{ConfigError, ServiceConfig};
use db::Database;
use std::sync::Arc;
use sync::{BackgroundScheduler, BackupManager, Synchronizer};

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to create data directory {path}: {source}")]
    DataDir {
        path: String,
        source: std::io::Error,
    },

    #[error("Database initialization failed: {0}")]
    Database(#[from] db::DbError),

    #[error("Backup directory unavailable: {0}")]
    Backup(#[from] sync::BackupError),
}

/// Wired-up service components for one instance
pub struct AppState {
    pub config: ServiceConfig,
    pub db: Arc<Database>,
    pub sync: Synchronizer,
    pub scheduler: BackgroundScheduler,
}

impl AppState {
    pub fn open(config: ServiceConfig) -> Result<Self, StartupError> {
        std::fs::create_dir_all(&config.data_dir).map_err(|source| StartupError::DataDir {
            path: config.data_dir.display().to_string(),
            source,
        })?;

        let db_path = config.db_path();
        log::info!("Database path: {:?}", db_path);
        let db = Arc::new(Database::new(db_path)?);

        let backups = Arc::new(BackupManager::new(
            db.clone(),
            config.backup_path(),
            config.backup_retention,
        )?);

        let store = config.remote.connect(config.network_timeout())?;
        let sync = Synchronizer::new(db.clone(), store, backups, config.sync_options());
        let scheduler = BackgroundScheduler::new(db.clone());

        log::info!(
            "Instance {} ready (remote prefix: {})",
            config.instance_id,
            config.remote_prefix
        );

        Ok(Self {
            config,
            db,
            sync,
            scheduler,
        })
    }
}

/// `RUST_LOG` aware logger, `info` by default
pub fn init_logging() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
}
