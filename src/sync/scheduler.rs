//! Background Sync Scheduler
//!
//! Runs a sync cycle at a configurable interval in a Tokio task.
//! Operator-triggered cycles share the synchronizer's gate, so a tick that
//! lands during a manual cycle is simply dropped.

use super::manager::Synchronizer;
use super::models::CycleResult;
use crate::db::Database;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

const SETTINGS_KEY: &str = "scheduler_config";

pub const MIN_INTERVAL_SECS: u64 = 10;
pub const MAX_INTERVAL_SECS: u64 = 86_400;

/// Scheduler configuration stored in settings table
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub last_run: Option<String>, // ISO 8601 timestamp
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 300,
            last_run: None,
        }
    }
}

/// Background scheduler for periodic sync cycles
#[derive(Clone)]
pub struct BackgroundScheduler {
    db: Arc<Database>,
    config: Arc<RwLock<SchedulerConfig>>,
    running: Arc<AtomicBool>,
    task_handle: Arc<StdMutex<Option<JoinHandle<()>>>>,
}

/// Scheduler errors
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Scheduler is already running")]
    AlreadyRunning,

    #[error("Scheduler is not running")]
    NotRunning,

    #[error("Invalid interval: {0}")]
    InvalidInterval(String),
}

fn validate_interval(interval_secs: u64) -> Result<(), SchedulerError> {
    if !(MIN_INTERVAL_SECS..=MAX_INTERVAL_SECS).contains(&interval_secs) {
        return Err(SchedulerError::InvalidInterval(format!(
            "Interval must be {}-{} seconds, got {}",
            MIN_INTERVAL_SECS, MAX_INTERVAL_SECS, interval_secs
        )));
    }
    Ok(())
}

impl BackgroundScheduler {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            config: Arc::new(RwLock::new(SchedulerConfig::default())),
            running: Arc::new(AtomicBool::new(false)),
            task_handle: Arc::new(StdMutex::new(None)),
        }
    }

    /// Load configuration from database settings table; `default_interval`
    /// applies when nothing was saved yet
    pub async fn load_config(&self, default_interval_secs: u64) -> Result<(), SchedulerError> {
        let config: SchedulerConfig = self
            .db
            .get_setting(SETTINGS_KEY)
            .map_err(|e| SchedulerError::Database(e.to_string()))?
            .unwrap_or(SchedulerConfig {
                interval_secs: default_interval_secs,
                ..Default::default()
            });

        *self.config.write().await = config;
        Ok(())
    }

    /// Save configuration to database settings table
    pub async fn save_config(&self) -> Result<(), SchedulerError> {
        let config = self.config.read().await.clone();
        self.db
            .set_setting(SETTINGS_KEY, &config)
            .map_err(|e| SchedulerError::Database(e.to_string()))?;
        Ok(())
    }

    /// Start background scheduler task
    pub async fn start(&self, sync: Synchronizer) -> Result<(), SchedulerError> {
        if self.running.load(Ordering::Relaxed) {
            return Err(SchedulerError::AlreadyRunning);
        }

        let interval_secs = self.config.read().await.interval_secs;
        validate_interval(interval_secs)?;

        self.running.store(true, Ordering::Relaxed);

        let running = self.running.clone();
        let db = self.db.clone();
        let config = self.config.clone();

        let handle = tokio::spawn(async move {
            Self::scheduler_loop(running, db, config, sync).await;
        });

        *self.task_handle.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);

        log::info!("Background scheduler started (interval: {}s)", interval_secs);
        Ok(())
    }

    /// Stop background scheduler task
    pub async fn stop(&self) -> Result<(), SchedulerError> {
        if !self.running.load(Ordering::Relaxed) {
            return Err(SchedulerError::NotRunning);
        }

        self.running.store(false, Ordering::Relaxed);

        let handle = self
            .task_handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }

        log::info!("Background scheduler stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub async fn get_config(&self) -> SchedulerConfig {
        self.config.read().await.clone()
    }

    /// Update configuration and restart scheduler if needed
    pub async fn update_config(
        &self,
        enabled: bool,
        interval_secs: u64,
        sync: Synchronizer,
    ) -> Result<(), SchedulerError> {
        validate_interval(interval_secs)?;

        {
            let mut config = self.config.write().await;
            config.enabled = enabled;
            config.interval_secs = interval_secs;
        }

        self.save_config().await?;

        if self.is_running() {
            // Ignore error if not running (race condition)
            let _ = self.stop().await;
        }

        if enabled {
            self.start(sync).await?;
        }

        log::info!(
            "Scheduler config updated: enabled={}, interval={}s",
            enabled,
            interval_secs
        );
        Ok(())
    }

    /// Background scheduler loop (runs in spawned task)
    async fn scheduler_loop(
        running: Arc<AtomicBool>,
        db: Arc<Database>,
        config: Arc<RwLock<SchedulerConfig>>,
        sync: Synchronizer,
    ) {
        let interval_secs = config.read().await.interval_secs;
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(interval_secs));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let shutdown = sync.shutdown_token();

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.cancelled() => {
                    log::info!("Scheduler loop: shutdown requested");
                    break;
                }
            }

            if !running.load(Ordering::Relaxed) {
                log::info!("Scheduler loop: stopping (running flag is false)");
                break;
            }

            log::debug!("Sync cycle triggered by scheduler");

            match sync.run_cycle().await {
                CycleResult::AlreadyRunning => continue,
                CycleResult::Failed { kind, reason, .. } => {
                    log::warn!("Scheduled sync failed ({}): {}", kind.as_str(), reason);
                }
                result => {
                    log::debug!("Scheduled sync finished: {}", result.as_str());
                }
            }

            let snapshot = {
                let mut cfg = config.write().await;
                cfg.last_run = Some(Utc::now().to_rfc3339());
                cfg.clone()
            };
            if let Err(e) = db.set_setting(SETTINGS_KEY, &snapshot) {
                log::error!("Failed to save last_run timestamp: {}", e);
            }
        }

        running.store(false, Ordering::Relaxed);
        log::info!("Scheduler loop exited");
    }
}

// ============================================================================
// Tests
// ============================================================================
