//! Sync Data Models - Replica Structures
//!
//! Defines the two synchronized collections and the metadata the engine
//! keeps about them.
//!
//! Data Categories:
//! - Account: configured mailbox (credential blob is opaque)
//! - UnsubscribedEntry: sender the user unsubscribed from
//! - SyncMetadata: last remote version seen, last push fingerprint
//! - SyncConflict / SyncResult: merge and sync reporting

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Collection Kinds
// ============================================================================

/// Synchronized collection identifier
///
/// The string form is the wire tag used by the remote API and the
/// persisted retry queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectionKind {
    Accounts,
    Unsubscribed,
}

impl CollectionKind {
    pub const ALL: [CollectionKind; 2] = [CollectionKind::Accounts, CollectionKind::Unsubscribed];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accounts => "accounts",
            Self::Unsubscribed => "unsubscribed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "accounts" => Some(Self::Accounts),
            "unsubscribed" => Some(Self::Unsubscribed),
            _ => None,
        }
    }

    /// Entity label used in conflict reports
    pub fn entity(&self) -> &'static str {
        match self {
            Self::Accounts => "account",
            Self::Unsubscribed => "unsubscribed",
        }
    }
}

impl fmt::Display for CollectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A record that belongs to one synchronized collection.
///
/// Identity is `key()`; every other field is mutable data that the merge
/// engine compares and the fingerprint covers.
pub trait SyncEntity: Clone + PartialEq + fmt::Debug + Serialize + DeserializeOwned + Send + Sync {
    const KIND: CollectionKind;

    fn key(&self) -> &str;

    /// Canonical synced field values (identity excluded), in a fixed order.
    fn fingerprint_fields(&self) -> Vec<String>;

    /// Encode a collection snapshot into the remote wire payload.
    fn to_payload(items: &[Self]) -> Result<serde_json::Value, serde_json::Error>;

    /// Decode a remote wire payload. `null` decodes to an empty collection.
    fn from_payload(payload: serde_json::Value) -> Result<Vec<Self>, serde_json::Error>;
}

// ============================================================================
// Accounts
// ============================================================================

/// Individual mailbox account
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Account {
    /// Unique identifier (the mailbox address)
    pub id: String,

    /// User-friendly name (defaults to the address)
    pub name: String,

    pub email: String,

    /// Mailbox server endpoint
    pub server: String,

    /// Encrypted credential blob, never interpreted here
    #[serde(default)]
    pub password: String,

    pub created_at: DateTime<Utc>,

    /// Last local edit (for conflict resolution)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Account {
    /// Create a new account; the id is derived from the address
    pub fn new(email: &str, server: &str, password: &str, name: &str) -> Self {
        let name = if name.is_empty() { email } else { name };
        Self {
            id: email.to_string(),
            name: name.to_string(),
            email: email.to_string(),
            server: server.to_string(),
            password: password.to_string(),
            created_at: Utc::now(),
            updated_at: None,
        }
    }

    /// Update timestamp to now
    pub fn touch(&mut self) {
        self.updated_at = Some(Utc::now());
    }

    /// Timestamp used for last-writer tie-breaks
    pub fn last_modified(&self) -> DateTime<Utc> {
        self.updated_at.unwrap_or(self.created_at)
    }
}

impl SyncEntity for Account {
    const KIND: CollectionKind = CollectionKind::Accounts;

    fn key(&self) -> &str {
        &self.id
    }

    fn fingerprint_fields(&self) -> Vec<String> {
        vec![
            self.name.clone(),
            self.email.clone(),
            self.server.clone(),
            self.password.clone(),
        ]
    }

    fn to_payload(items: &[Self]) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(items)
    }

    fn from_payload(payload: serde_json::Value) -> Result<Vec<Self>, serde_json::Error> {
        if payload.is_null() {
            return Ok(Vec::new());
        }
        serde_json::from_value(payload)
    }
}

// ============================================================================
// Unsubscribed Senders
// ============================================================================

/// One unsubscribe action
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UnsubscribedEntry {
    pub sender: String,
    pub unsubscribed_at: DateTime<Utc>,
}

impl UnsubscribedEntry {
    pub fn new(sender: &str) -> Self {
        Self {
            sender: sender.to_string(),
            unsubscribed_at: Utc::now(),
        }
    }
}

/// Wire shape of the unsubscribed collection
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UnsubscribedStore {
    #[serde(default)]
    pub newsletters: Vec<UnsubscribedEntry>,
}

/// Older clients pushed the bare list instead of the wrapped store.
#[derive(Deserialize)]
#[serde(untagged)]
enum UnsubscribedPayload {
    Store(UnsubscribedStore),
    List(Vec<UnsubscribedEntry>),
}

impl SyncEntity for UnsubscribedEntry {
    const KIND: CollectionKind = CollectionKind::Unsubscribed;

    fn key(&self) -> &str {
        &self.sender
    }

    fn fingerprint_fields(&self) -> Vec<String> {
        vec![self.unsubscribed_at.to_rfc3339()]
    }

    fn to_payload(items: &[Self]) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(UnsubscribedStore {
            newsletters: items.to_vec(),
        })
    }

    fn from_payload(payload: serde_json::Value) -> Result<Vec<Self>, serde_json::Error> {
        if payload.is_null() {
            return Ok(Vec::new());
        }
        Ok(match serde_json::from_value(payload)? {
            UnsubscribedPayload::Store(store) => store.newsletters,
            UnsubscribedPayload::List(list) => list,
        })
    }
}

// ============================================================================
// Sync Metadata & Status
// ============================================================================

/// Replica bookkeeping for one collection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMetadata {
    pub kind: CollectionKind,

    /// Last version observed from the remote store
    pub local_version: i64,

    pub last_sync_at: Option<DateTime<Utc>>,

    /// Fingerprint of the last snapshot the remote accepted
    pub last_pushed_checksum: Option<String>,

    pub items_synced: i64,
    pub last_error: Option<String>,
}

impl SyncMetadata {
    pub fn empty(kind: CollectionKind) -> Self {
        Self {
            kind,
            local_version: 0,
            last_sync_at: None,
            last_pushed_checksum: None,
            items_synced: 0,
            last_error: None,
        }
    }
}

/// Per-collection replica state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    InSync,
    /// Local edits not yet accepted by the remote store
    Dirty,
    /// Remote store reported a newer version than we hold
    Stale,
    /// A failed push is waiting in the retry queue
    PendingRetry,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::InSync => "in_sync",
            SyncState::Dirty => "dirty",
            SyncState::Stale => "stale",
            SyncState::PendingRetry => "pending_retry",
        }
    }
}

/// Status for a specific collection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionStatus {
    pub kind: CollectionKind,
    pub state: SyncState,
    pub local_version: i64,
    pub remote_version: Option<i64>,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub pending_retries: usize,
    pub last_error: Option<String>,
}

// ============================================================================
// Conflicts & Results
// ============================================================================

/// A field-level disagreement detected during merge.
///
/// Conflicts never block: the merge has already picked a winner.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncConflict {
    /// "account" or "unsubscribed"
    pub entity: String,
    pub id: String,
    pub field: String,
    pub local: serde_json::Value,
    pub remote: serde_json::Value,
    pub local_time: DateTime<Utc>,
    pub remote_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct SyncResult {
    pub accounts_added: usize,
    pub accounts_updated: usize,
    pub unsubscribed_added: usize,
    pub pulled: Vec<CollectionKind>,
    pub pushed: Vec<CollectionKind>,
    pub conflicts: Vec<SyncConflict>,
    pub errors: Vec<String>,
}

impl SyncResult {
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn has_conflicts(&self) -> bool {
        !self.conflicts.is_empty()
    }
}

// ============================================================================
// Tests
// ============================================================================
