//! Replica Store - the local copy of the synchronized collections
//!
//! Wraps the database with collection-level operations the sync engine and
//! the user-facing commands share:
//! - whole-collection load/save (atomic)
//! - account and unsubscribe mutations
//! - per-collection sync metadata bookkeeping

use super::merge::validate_ids;
use super::models::{Account, CollectionKind, SyncEntity, SyncMetadata, UnsubscribedEntry};
use crate::db::{Database, DbError};
use std::sync::Arc;

/// Collection types the replica can persist as a whole
pub trait ReplicaCollection: SyncEntity {
    fn load(db: &Database) -> Result<Vec<Self>, DbError>;
    fn save(db: &Database, items: &[Self]) -> Result<(), DbError>;
}

impl ReplicaCollection for Account {
    fn load(db: &Database) -> Result<Vec<Self>, DbError> {
        db.get_accounts()
    }

    fn save(db: &Database, items: &[Self]) -> Result<(), DbError> {
        db.replace_accounts(items)
    }
}

impl ReplicaCollection for UnsubscribedEntry {
    fn load(db: &Database) -> Result<Vec<Self>, DbError> {
        db.get_unsubscribed()
    }

    fn save(db: &Database, items: &[Self]) -> Result<(), DbError> {
        db.replace_unsubscribed(items)
    }
}

/// Local replica of accounts and unsubscribed senders
#[derive(Clone)]
pub struct ReplicaStore {
    db: Arc<Database>,
}

impl ReplicaStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Load a whole collection
    pub fn load<E: ReplicaCollection>(&self) -> Result<Vec<E>, ReplicaError> {
        Ok(E::load(&self.db)?)
    }

    /// Replace a whole collection; entries without an identity are rejected
    pub fn save<E: ReplicaCollection>(&self, items: &[E]) -> Result<(), ReplicaError> {
        if let Err(positions) = validate_ids(items) {
            return Err(ReplicaError::InvalidIdentity {
                kind: E::KIND,
                positions,
            });
        }
        E::save(&self.db, items)?;
        Ok(())
    }

    pub fn accounts(&self) -> Result<Vec<Account>, ReplicaError> {
        self.load()
    }

    pub fn unsubscribed(&self) -> Result<Vec<UnsubscribedEntry>, ReplicaError> {
        self.load()
    }

    // =========================================================================
    // Accounts
    // =========================================================================

    /// Add an account, or update the existing one with the same address
    pub fn add_account(
        &self,
        email: &str,
        server: &str,
        password: &str,
        name: &str,
    ) -> Result<Account, ReplicaError> {
        let email = email.trim();
        if email.is_empty() {
            return Err(ReplicaError::InvalidIdentity {
                kind: CollectionKind::Accounts,
                positions: Vec::new(),
            });
        }

        let mut accounts = self.accounts()?;
        let account = match accounts.iter().position(|a| a.id == email) {
            Some(idx) => {
                let existing = &mut accounts[idx];
                existing.server = server.to_string();
                existing.password = password.to_string();
                if !name.is_empty() {
                    existing.name = name.to_string();
                }
                existing.touch();
                log::info!("Updated account {}", email);
                existing.clone()
            }
            None => {
                let account = Account::new(email, server, password, name);
                accounts.push(account.clone());
                log::info!("Added account {}", email);
                account
            }
        };

        self.save(&accounts)?;
        Ok(account)
    }

    /// Remove an account; returns false if it did not exist
    pub fn delete_account(&self, id: &str) -> Result<bool, ReplicaError> {
        let mut accounts = self.accounts()?;
        let before = accounts.len();
        accounts.retain(|a| a.id != id);

        if accounts.len() == before {
            return Ok(false);
        }

        self.save(&accounts)?;
        log::info!("Deleted account {}", id);
        Ok(true)
    }

    // =========================================================================
    // Unsubscribed senders
    // =========================================================================

    /// Record an unsubscribe; re-adding a sender refreshes its timestamp
    pub fn add_unsubscribed(&self, sender: &str) -> Result<UnsubscribedEntry, ReplicaError> {
        let sender = sender.trim();
        if sender.is_empty() {
            return Err(ReplicaError::InvalidIdentity {
                kind: CollectionKind::Unsubscribed,
                positions: Vec::new(),
            });
        }

        let mut entries = self.unsubscribed()?;
        let entry = UnsubscribedEntry::new(sender);
        match entries.iter().position(|e| e.sender == sender) {
            Some(idx) => entries[idx].unsubscribed_at = entry.unsubscribed_at,
            None => entries.push(entry.clone()),
        }

        self.save(&entries)?;
        Ok(entry)
    }

    pub fn is_unsubscribed(&self, sender: &str) -> Result<bool, ReplicaError> {
        Ok(self.unsubscribed()?.iter().any(|e| e.sender == sender))
    }

    /// Senders in stored order
    pub fn unsubscribed_senders(&self) -> Result<Vec<String>, ReplicaError> {
        Ok(self.unsubscribed()?.into_iter().map(|e| e.sender).collect())
    }

    // =========================================================================
    // Sync metadata
    // =========================================================================

    pub fn metadata(&self, kind: CollectionKind) -> Result<SyncMetadata, ReplicaError> {
        Ok(self.db.get_sync_metadata(kind)?)
    }

    /// The server accepted a snapshot with this fingerprint
    pub fn record_push(
        &self,
        kind: CollectionKind,
        version: i64,
        checksum: &str,
        items: usize,
    ) -> Result<(), ReplicaError> {
        self.db
            .update_sync_metadata(kind, Some(version), Some(checksum), Some(items as i64))?;
        Ok(())
    }

    /// A remote snapshot at `version` was merged into the replica.
    ///
    /// `remote_checksum` is the fingerprint of what the server holds, so an
    /// unchanged replica is not pushed straight back.
    pub fn record_pull(
        &self,
        kind: CollectionKind,
        version: i64,
        remote_checksum: &str,
        items: usize,
    ) -> Result<(), ReplicaError> {
        self.db.update_sync_metadata(
            kind,
            Some(version),
            Some(remote_checksum),
            Some(items as i64),
        )?;
        Ok(())
    }

    pub fn record_error(&self, kind: CollectionKind, error: Option<&str>) -> Result<(), ReplicaError> {
        self.db.set_sync_error(kind, error)?;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReplicaError {
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("{kind} entries without an identity at positions {positions:?}")]
    InvalidIdentity {
        kind: CollectionKind,
        positions: Vec<usize>,
    },
}
