//! Configuration for Newsletter Sync
//!
//! - `SyncSettings`: server credentials and sync toggles, stored as JSON in
//!   the settings table
//! - `AppPaths`: where the replica database lives

use crate::db::{Database, DbError};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

/// Settings key for the sync configuration
pub const SYNC_SETTINGS_KEY: &str = "sync_settings";

/// Environment override for the data directory
pub const DATA_DIR_ENV: &str = "NEWSLETTER_SYNC_DATA_DIR";

pub const DATABASE_FILE: &str = "newsletter-sync.db";

pub const DEFAULT_API_URL: &str = "https://api.newsletter-cli.apps.paas-01.pulseflow.cloud";

const DEFAULT_INTERVAL_MINUTES: u64 = 5;
const MIN_INTERVAL_MINUTES: u64 = 1;
const MAX_INTERVAL_MINUTES: u64 = 1440;

// ============================================================================
// Sync Settings
// ============================================================================

/// Sync configuration stored in settings table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Whether sync is enabled
    pub enabled: bool,

    pub api_url: String,

    /// Bearer access token
    pub token: Option<String>,
    pub refresh_token: Option<String>,

    /// Account email on the sync server
    pub email: Option<String>,

    /// Pull newer remote state on startup
    pub auto_sync_on_startup: bool,

    pub periodic_sync_enabled: bool,
    pub periodic_sync_interval_minutes: u64,

    /// Selective sync toggles
    pub sync_accounts: bool,
    pub sync_unsubscribed: bool,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            api_url: DEFAULT_API_URL.to_string(),
            token: None,
            refresh_token: None,
            email: None,
            auto_sync_on_startup: true,
            periodic_sync_enabled: true,
            periodic_sync_interval_minutes: DEFAULT_INTERVAL_MINUTES,
            sync_accounts: true,
            sync_unsubscribed: true,
        }
    }
}

impl SyncSettings {
    /// Load settings from database, falling back to defaults
    pub fn load(db: &Database) -> Result<Self, ConfigError> {
        let mut settings: SyncSettings = db.get_setting(SYNC_SETTINGS_KEY)?.unwrap_or_default();
        settings.normalize();
        Ok(settings)
    }

    /// Validate and save settings to database
    pub fn save(&self, db: &Database) -> Result<(), ConfigError> {
        self.validate()?;
        db.set_setting(SYNC_SETTINGS_KEY, self)?;
        Ok(())
    }

    /// Records written before the toggles existed have every toggle off;
    /// treat those as defaults rather than "sync nothing".
    pub fn normalize(&mut self) {
        let legacy = !self.auto_sync_on_startup
            && !self.periodic_sync_enabled
            && self.periodic_sync_interval_minutes == 0
            && !self.sync_accounts
            && !self.sync_unsubscribed;

        if legacy {
            log::info!("Normalizing legacy sync settings to defaults");
            let defaults = Self::default();
            self.auto_sync_on_startup = defaults.auto_sync_on_startup;
            self.periodic_sync_enabled = defaults.periodic_sync_enabled;
            self.periodic_sync_interval_minutes = defaults.periodic_sync_interval_minutes;
            self.sync_accounts = defaults.sync_accounts;
            self.sync_unsubscribed = defaults.sync_unsubscribed;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let interval = self.periodic_sync_interval_minutes;
        if !(MIN_INTERVAL_MINUTES..=MAX_INTERVAL_MINUTES).contains(&interval) {
            return Err(ConfigError::InvalidInterval(interval));
        }

        let url = Url::parse(&self.api_url)
            .map_err(|e| ConfigError::InvalidApiUrl(format!("{}: {}", self.api_url, e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidApiUrl(format!(
                "{}: unsupported scheme {}",
                self.api_url,
                url.scheme()
            )));
        }

        Ok(())
    }

    /// Sync is enabled and has a token to talk to the server with
    pub fn is_active(&self) -> bool {
        self.enabled && self.token.as_deref().is_some_and(|t| !t.is_empty())
    }

    pub fn periodic_interval(&self) -> Duration {
        let minutes = self
            .periodic_sync_interval_minutes
            .clamp(MIN_INTERVAL_MINUTES, MAX_INTERVAL_MINUTES);
        Duration::from_secs(minutes * 60)
    }
}

// ============================================================================
// Paths
// ============================================================================

/// Filesystem locations used by the application
#[derive(Debug, Clone)]
pub struct AppPaths {
    pub data_dir: PathBuf,
}

impl AppPaths {
    /// Resolve from `NEWSLETTER_SYNC_DATA_DIR`, else the platform data directory
    pub fn resolve() -> Result<Self, ConfigError> {
        if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
            if !dir.trim().is_empty() {
                return Ok(Self::at(dir));
            }
        }

        let dirs = ProjectDirs::from("cloud", "pulseflow", "newsletter-cli")
            .ok_or(ConfigError::NoDataDir)?;
        Ok(Self::at(dirs.data_dir()))
    }

    pub fn at(dir: impl AsRef<Path>) -> Self {
        Self {
            data_dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn database(&self) -> PathBuf {
        self.data_dir.join(DATABASE_FILE)
    }

    /// Create the data directory if missing
    pub fn ensure(&self) -> Result<(), ConfigError> {
        std::fs::create_dir_all(&self.data_dir)?;
        Ok(())
    }
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Invalid interval: must be 1-1440 minutes, got {0}")]
    InvalidInterval(u64),

    #[error("Invalid API URL: {0}")]
    InvalidApiUrl(String),

    #[error("Could not determine a data directory")]
    NoDataDir,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
