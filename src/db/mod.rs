//! Database module for Newsletter Sync
//!
//! Provides SQLite storage for the local replica: accounts, unsubscribed
//! senders, per-collection sync metadata, the retry queue and settings.
//! Whole-collection replacements run inside a single transaction so a failed
//! write never leaves a half-written collection behind.

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

// Connection pooling
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;

use crate::sync::models::{Account, CollectionKind, SyncMetadata, UnsubscribedEntry};
use crate::sync::queue::PendingSyncOperation;

/// Database error types
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type DbResult<T> = Result<T, DbError>;

/// Parse an RFC3339 column value
fn parse_timestamp(idx: usize, value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_optional_timestamp(idx: usize, value: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    value.map(|s| parse_timestamp(idx, &s)).transpose()
}

fn parse_kind(idx: usize, value: &str) -> rusqlite::Result<CollectionKind> {
    CollectionKind::parse(value).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Text,
            format!("unknown collection kind: {}", value).into(),
        )
    })
}

/// Database manager for thread-safe SQLite access
#[derive(Clone)]
pub struct Database {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl Database {
    /// Create a new database connection pool
    pub fn new(db_path: PathBuf) -> DbResult<Self> {
        let manager = SqliteConnectionManager::file(&db_path);

        let pool = Pool::builder()
            .max_size(8)
            .min_idle(Some(1))
            .connection_timeout(std::time::Duration::from_secs(10))
            .build(manager)?;

        let conn = pool.get()?;

        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = FULL;
            PRAGMA busy_timeout = 5000;
        "#,
        )?;

        conn.execute_batch(include_str!("schema.sql"))?;
        Self::run_migrations(&conn)?;
        drop(conn);

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    /// Create an in-memory database (for testing)
    ///
    /// Every pooled in-memory connection is its own database, so the pool is
    /// pinned to a single connection.
    pub fn in_memory() -> DbResult<Self> {
        let manager = SqliteConnectionManager::memory();

        let pool = Pool::builder().max_size(1).build(manager)?;

        let conn = pool.get()?;
        conn.execute_batch(include_str!("schema.sql"))?;
        Self::run_migrations(&conn)?;
        drop(conn);

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    /// Get a connection from the pool
    #[inline]
    pub fn get_conn(&self) -> DbResult<PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    // =========================================================================
    // MIGRATIONS
    // =========================================================================

    /// Run migrations for existing databases
    fn run_migrations(conn: &Connection) -> DbResult<()> {
        // Migration 1: databases created before accounts tracked edits lack updated_at
        let has_updated_at: bool = conn
            .query_row(
                "SELECT COUNT(*) > 0 FROM pragma_table_info('accounts') WHERE name = 'updated_at'",
                [],
                |row| row.get(0),
            )
            .unwrap_or(false);

        if !has_updated_at {
            log::info!("Running migration: Adding updated_at column to accounts");
            conn.execute("ALTER TABLE accounts ADD COLUMN updated_at TEXT", [])?;
        }

        Ok(())
    }

    // =========================================================================
    // ACCOUNTS
    // =========================================================================

    /// Load all accounts in their stored order
    pub fn get_accounts(&self) -> DbResult<Vec<Account>> {
        let conn = self.get_conn()?;

        let mut stmt = conn.prepare(
            r#"
            SELECT id, name, email, server, password, created_at, updated_at
            FROM accounts
            ORDER BY position ASC
            "#,
        )?;

        let accounts = stmt
            .query_map([], |row| {
                Ok(Account {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    email: row.get(2)?,
                    server: row.get(3)?,
                    password: row.get(4)?,
                    created_at: parse_timestamp(5, &row.get::<_, String>(5)?)?,
                    updated_at: parse_optional_timestamp(6, row.get(6)?)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(accounts)
    }

    /// Replace the whole accounts collection atomically
    pub fn replace_accounts(&self, accounts: &[Account]) -> DbResult<()> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;

        tx.execute("DELETE FROM accounts", [])?;
        {
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO accounts (id, position, name, email, server, password, created_at, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                "#,
            )?;

            for (position, account) in accounts.iter().enumerate() {
                stmt.execute(params![
                    account.id,
                    position as i64,
                    account.name,
                    account.email,
                    account.server,
                    account.password,
                    account.created_at.to_rfc3339(),
                    account.updated_at.map(|dt| dt.to_rfc3339()),
                ])?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    // =========================================================================
    // UNSUBSCRIBED SENDERS
    // =========================================================================

    /// Load all unsubscribed senders in their stored order
    pub fn get_unsubscribed(&self) -> DbResult<Vec<UnsubscribedEntry>> {
        let conn = self.get_conn()?;

        let mut stmt = conn.prepare(
            "SELECT sender, unsubscribed_at FROM unsubscribed ORDER BY position ASC",
        )?;

        let entries = stmt
            .query_map([], |row| {
                Ok(UnsubscribedEntry {
                    sender: row.get(0)?,
                    unsubscribed_at: parse_timestamp(1, &row.get::<_, String>(1)?)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(entries)
    }

    /// Replace the whole unsubscribed collection atomically
    pub fn replace_unsubscribed(&self, entries: &[UnsubscribedEntry]) -> DbResult<()> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;

        tx.execute("DELETE FROM unsubscribed", [])?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO unsubscribed (sender, position, unsubscribed_at) VALUES (?1, ?2, ?3)",
            )?;

            for (position, entry) in entries.iter().enumerate() {
                stmt.execute(params![
                    entry.sender,
                    position as i64,
                    entry.unsubscribed_at.to_rfc3339(),
                ])?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    // =========================================================================
    // SETTINGS
    // =========================================================================

    /// Get a setting value
    pub fn get_setting<T: serde::de::DeserializeOwned>(&self, key: &str) -> DbResult<Option<T>> {
        let conn = self.get_conn()?;
        let result: Result<String, _> = conn.query_row(
            "SELECT value FROM settings WHERE key = ?1",
            [key],
            |row| row.get(0),
        );

        match result {
            Ok(json) => {
                let value: T = serde_json::from_str(&json)
                    .map_err(|e| DbError::Serialization(e.to_string()))?;
                Ok(Some(value))
            }
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Set a setting value
    pub fn set_setting<T: Serialize>(&self, key: &str, value: &T) -> DbResult<()> {
        let conn = self.get_conn()?;
        let json = serde_json::to_string(value)
            .map_err(|e| DbError::Serialization(e.to_string()))?;

        conn.execute(
            "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
            params![key, json],
        )?;

        Ok(())
    }

    // =========================================================================
    // RETRY QUEUE
    // =========================================================================

    /// Load pending sync operations in enqueue order
    pub fn get_queue(&self) -> DbResult<Vec<PendingSyncOperation>> {
        let conn = self.get_conn()?;

        let mut stmt = conn.prepare(
            r#"
            SELECT id, data_type, payload, checksum, item_count, queued_at, retries, last_error
            FROM sync_queue
            ORDER BY position ASC
            "#,
        )?;

        let items = stmt
            .query_map([], |row| {
                let id: String = row.get(0)?;
                Ok(PendingSyncOperation {
                    id: uuid::Uuid::parse_str(&id).map_err(|e| {
                        rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e))
                    })?,
                    kind: parse_kind(1, &row.get::<_, String>(1)?)?,
                    payload: row.get(2)?,
                    checksum: row.get(3)?,
                    item_count: row.get(4)?,
                    queued_at: parse_timestamp(5, &row.get::<_, String>(5)?)?,
                    retries: row.get(6)?,
                    last_error: row.get(7)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(items)
    }

    /// Rewrite the whole queue atomically
    pub fn replace_queue(&self, items: &[PendingSyncOperation]) -> DbResult<()> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;

        tx.execute("DELETE FROM sync_queue", [])?;
        {
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO sync_queue (
                    id, position, data_type, payload, checksum, item_count,
                    queued_at, retries, last_error
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                "#,
            )?;

            for (position, item) in items.iter().enumerate() {
                stmt.execute(params![
                    item.id.to_string(),
                    position as i64,
                    item.kind.as_str(),
                    item.payload,
                    item.checksum,
                    item.item_count,
                    item.queued_at.to_rfc3339(),
                    item.retries,
                    item.last_error,
                ])?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    // =========================================================================
    // SYNC METADATA
    // =========================================================================

    /// Get sync metadata for a collection
    pub fn get_sync_metadata(&self, kind: CollectionKind) -> DbResult<SyncMetadata> {
        let conn = self.get_conn()?;

        let result = conn.query_row(
            r#"
            SELECT local_version, last_sync_at, last_pushed_checksum, items_synced, last_error
            FROM sync_metadata
            WHERE data_type = ?1
            "#,
            params![kind.as_str()],
            |row| {
                Ok(SyncMetadata {
                    kind,
                    local_version: row.get(0)?,
                    last_sync_at: parse_optional_timestamp(1, row.get(1)?)?,
                    last_pushed_checksum: row.get(2)?,
                    items_synced: row.get(3)?,
                    last_error: row.get(4)?,
                })
            },
        );

        match result {
            Ok(metadata) => Ok(metadata),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(SyncMetadata::empty(kind)),
            Err(e) => Err(e.into()),
        }
    }

    /// Update sync metadata after a successful push or pull.
    ///
    /// `None` arguments keep the stored value. Clears `last_error`.
    pub fn update_sync_metadata(
        &self,
        kind: CollectionKind,
        version: Option<i64>,
        checksum: Option<&str>,
        items_synced: Option<i64>,
    ) -> DbResult<()> {
        let conn = self.get_conn()?;

        let updated = conn.execute(
            r#"
            UPDATE sync_metadata
            SET local_version = COALESCE(?1, local_version),
                last_pushed_checksum = COALESCE(?2, last_pushed_checksum),
                items_synced = COALESCE(?3, items_synced),
                last_sync_at = ?4,
                last_error = NULL
            WHERE data_type = ?5
            "#,
            params![version, checksum, items_synced, Utc::now().to_rfc3339(), kind.as_str()],
        )?;

        if updated == 0 {
            return Err(DbError::NotFound(format!("sync metadata for {}", kind)));
        }

        Ok(())
    }

    /// Record (or clear) the last sync error for a collection
    pub fn set_sync_error(&self, kind: CollectionKind, error: Option<&str>) -> DbResult<()> {
        let conn = self.get_conn()?;

        conn.execute(
            "UPDATE sync_metadata SET last_error = ?1 WHERE data_type = ?2",
            params![error, kind.as_str()],
        )?;

        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn account(id: &str, name: &str) -> Account {
        Account {
            id: id.to_string(),
            name: name.to_string(),
            email: id.to_string(),
            server: "imap.example.com:993".to_string(),
            password: "enc".to_string(),
            created_at: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
            updated_at: None,
        }
    }

    #[test]
    fn test_accounts_replace_preserves_order() {
        let db = Database::in_memory().unwrap();

        let accounts = vec![account("b@x.com", "B"), account("a@x.com", "A")];
        db.replace_accounts(&accounts).unwrap();

        assert_eq!(db.get_accounts().unwrap(), accounts);

        db.replace_accounts(&accounts[1..]).unwrap();
        assert_eq!(db.get_accounts().unwrap().len(), 1);
    }

    #[test]
    fn test_failed_replace_keeps_previous_collection() {
        let db = Database::in_memory().unwrap();
        db.replace_accounts(&[account("a@x.com", "A")]).unwrap();

        // Duplicate primary key aborts the transaction midway
        let result = db.replace_accounts(&[account("b@x.com", "B"), account("b@x.com", "B2")]);
        assert!(result.is_err());

        let stored = db.get_accounts().unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id, "a@x.com");
    }

    #[test]
    fn test_unsubscribed_round_trip() {
        let db = Database::in_memory().unwrap();
        let entries = vec![UnsubscribedEntry {
            sender: "news@shop.com".to_string(),
            unsubscribed_at: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
        }];

        db.replace_unsubscribed(&entries).unwrap();
        assert_eq!(db.get_unsubscribed().unwrap(), entries);
    }

    #[test]
    fn test_sync_metadata_defaults_and_update() {
        let db = Database::in_memory().unwrap();

        let meta = db.get_sync_metadata(CollectionKind::Accounts).unwrap();
        assert_eq!(meta.local_version, 0);
        assert!(meta.last_sync_at.is_none());

        db.set_sync_error(CollectionKind::Accounts, Some("timeout")).unwrap();
        db.update_sync_metadata(CollectionKind::Accounts, Some(4), Some("abc"), Some(2))
            .unwrap();

        let meta = db.get_sync_metadata(CollectionKind::Accounts).unwrap();
        assert_eq!(meta.local_version, 4);
        assert_eq!(meta.last_pushed_checksum.as_deref(), Some("abc"));
        assert!(meta.last_sync_at.is_some());
        assert!(meta.last_error.is_none());

        // None keeps stored values
        db.update_sync_metadata(CollectionKind::Accounts, None, None, None).unwrap();
        let meta = db.get_sync_metadata(CollectionKind::Accounts).unwrap();
        assert_eq!(meta.local_version, 4);
        assert_eq!(meta.items_synced, 2);
    }

    #[test]
    fn test_settings_round_trip() {
        let db = Database::in_memory().unwrap();
        assert_eq!(db.get_setting::<bool>("missing").unwrap(), None);

        db.set_setting("flag", &true).unwrap();
        assert_eq!(db.get_setting::<bool>("flag").unwrap(), Some(true));
    }

    #[test]
    fn test_fresh_schema_has_updated_at() {
        let db = Database::in_memory().unwrap();
        let conn = db.get_conn().unwrap();
        let has_updated_at: bool = conn
            .query_row(
                "SELECT COUNT(*) > 0 FROM pragma_table_info('accounts') WHERE name = 'updated_at'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert!(has_updated_at);
    }

    #[test]
    fn test_migration_adds_updated_at_to_old_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("old.db");

        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(
                r#"
                CREATE TABLE accounts (
                    id TEXT PRIMARY KEY CHECK (id <> ''),
                    position INTEGER NOT NULL,
                    name TEXT NOT NULL,
                    email TEXT NOT NULL,
                    server TEXT NOT NULL,
                    password TEXT NOT NULL DEFAULT '',
                    created_at TEXT NOT NULL
                );
                INSERT INTO accounts (id, position, name, email, server, created_at)
                VALUES ('a@x.com', 0, 'A', 'a@x.com', 'imap.example.com:993', '2025-01-01T00:00:00+00:00');
            "#,
            )
            .unwrap();
        }

        let db = Database::new(path).unwrap();
        let accounts = db.get_accounts().unwrap();
        assert_eq!(accounts.len(), 1);
        assert!(accounts[0].updated_at.is_none());

        let mut edited = accounts[0].clone();
        edited.updated_at = Some(Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap());
        db.replace_accounts(&[edited.clone()]).unwrap();
        assert_eq!(db.get_accounts().unwrap(), vec![edited]);
    }

    #[test]
    fn test_file_database_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("replica.db");

        {
            let db = Database::new(path.clone()).unwrap();
            db.replace_accounts(&[account("a@x.com", "A")]).unwrap();
        }

        let db = Database::new(path).unwrap();
        assert_eq!(db.get_accounts().unwrap().len(), 1);
    }
}
