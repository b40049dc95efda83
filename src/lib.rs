//! Newsletter Sync - account and unsubscribe history replication
//!
//! Wires the local replica database, the sync server client, the retry
//! queue and the background scheduler into one application state:
//! - `config`: settings and data paths
//! - `db`: SQLite replica storage
//! - `sync`: merge, push/pull orchestration and scheduling

pub mod config;
pub mod db;
pub mod sync;

use config::{AppPaths, ConfigError, SyncSettings};
use db::{Database, DbError};
use std::sync::Arc;
use sync::api::TokenRefreshHook;
use sync::{AuthTokens, BackgroundScheduler, QueueError, RetryQueue, SyncApiClient, SyncApiError, SyncManager};

/// Application state shared by every command
pub struct AppState {
    pub db: Arc<Database>,
    pub manager: SyncManager,
    pub scheduler: BackgroundScheduler,
}

impl AppState {
    /// Open the replica database under `paths` and build the sync stack
    pub fn open(paths: &AppPaths) -> Result<Self, AppError> {
        paths.ensure()?;

        let db_path = paths.database();
        log::info!("Opening database at {:?}", db_path);
        let db = Arc::new(Database::new(db_path)?);

        let settings = SyncSettings::load(&db)?;
        let queue = Arc::new(RetryQueue::new(db.clone())?);

        let tokens = AuthTokens {
            token: settings.token.clone(),
            refresh_token: settings.refresh_token.clone(),
        };
        let client = SyncApiClient::new(&settings.api_url, tokens)?
            .with_token_refresh_hook(persist_tokens(db.clone()));

        let manager = SyncManager::new(db.clone(), Arc::new(client), queue, settings);

        Ok(Self {
            db,
            manager,
            scheduler: BackgroundScheduler::new(),
        })
    }
}

/// Store refreshed tokens so the next run starts with them
fn persist_tokens(db: Arc<Database>) -> TokenRefreshHook {
    Arc::new(move |tokens: &AuthTokens| {
        let result = SyncSettings::load(&db).and_then(|mut settings| {
            settings.token = tokens.token.clone();
            settings.refresh_token = tokens.refresh_token.clone();
            settings.save(&db)
        });

        match result {
            Ok(()) => log::debug!("Persisted refreshed sync tokens"),
            Err(e) => log::error!("Failed to persist refreshed tokens: {}", e),
        }
    })
}

/// Initialize logging from `RUST_LOG`, defaulting to info
pub fn init_logging() {
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
}

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("API client error: {0}")]
    Api(#[from] SyncApiError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_creates_database() {
        let dir = tempfile::tempdir().unwrap();
        let paths = AppPaths::at(dir.path().join("data"));

        let state = AppState::open(&paths).unwrap();
        assert!(paths.database().exists());
        assert!(!state.manager.settings().await.is_active());
        assert!(!state.scheduler.is_running());
    }

    #[test]
    fn test_refresh_hook_persists_tokens() {
        let db = Arc::new(Database::in_memory().unwrap());
        SyncSettings {
            enabled: true,
            token: Some("old".to_string()),
            ..SyncSettings::default()
        }
        .save(&db)
        .unwrap();

        let hook = persist_tokens(db.clone());
        hook(&AuthTokens {
            token: Some("new".to_string()),
            refresh_token: Some("refresh".to_string()),
        });

        let settings = SyncSettings::load(&db).unwrap();
        assert!(settings.enabled);
        assert_eq!(settings.token.as_deref(), Some("new"));
        assert_eq!(settings.refresh_token.as_deref(), Some("refresh"));
    }
}
