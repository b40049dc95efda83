//! Retry Queue Module - Handles failed pushes with retry logic
//!
//! When a push fails for a transient reason (network issues, server down,
//! rate limiting), the snapshot is queued locally and retried later with
//! exponential backoff.
//!
//! Features:
//! - SQLite-backed persistent queue, rewritten atomically on every change
//! - At most one queued snapshot per collection; a newer one replaces it
//! - Exponential backoff capped at a few seconds
//! - Items that failed 3+ times stay queued and are reported as exhausted
//! - Authorization failures drop the item instead of retrying forever
//! - Network I/O never runs while the queue lock is held

use super::api::{SyncApiError, SyncRemote};
use super::checksum::fingerprint;
use super::models::{CollectionKind, SyncEntity};
use crate::db::{Database, DbError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

// ============================================================================
// Constants
// ============================================================================

const BASE_DELAY_SECS: u64 = 1; // Initial retry delay: 1 second
const MAX_DELAY_SECS: u64 = 5; // Max retry delay: 5 seconds

/// Retries after which an item is reported as exhausted (it is still retried)
pub const MAX_VISIBLE_RETRIES: u32 = 3;

// ============================================================================
// Data Types
// ============================================================================

/// A push that failed and waits for retry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingSyncOperation {
    pub id: Uuid,
    pub kind: CollectionKind,
    /// Serialized collection snapshot (JSON text)
    pub payload: String,
    /// Fingerprint of the snapshot
    pub checksum: String,
    pub item_count: i64,
    pub queued_at: DateTime<Utc>,
    pub retries: u32,
    pub last_error: Option<String>,
}

impl PendingSyncOperation {
    /// Check if the item has failed often enough to be shown to the user
    pub fn is_exhausted(&self) -> bool {
        self.retries >= MAX_VISIBLE_RETRIES
    }
}

/// Backoff schedule between retry attempts
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(BASE_DELAY_SECS),
            max: Duration::from_secs(MAX_DELAY_SECS),
        }
    }
}

impl RetryPolicy {
    /// No waiting at all (tests)
    pub fn immediate() -> Self {
        Self {
            base: Duration::ZERO,
            max: Duration::ZERO,
        }
    }

    /// `min(base * 2^retries, max)`
    pub fn delay_for(&self, retries: u32) -> Duration {
        let factor = 1u32.checked_shl(retries).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }
}

/// Queue statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending_count: usize,
    pub exhausted_count: usize,
    pub last_error: Option<String>,
}

/// A queued snapshot the server accepted during a drain
#[derive(Debug, Clone, PartialEq)]
pub struct PushSuccess {
    pub kind: CollectionKind,
    pub version: i64,
    pub checksum: String,
    pub item_count: i64,
    pub queued_at: DateTime<Utc>,
}

/// Outcome of one `process_queue` pass
#[derive(Debug, Default)]
pub struct ProcessQueueReport {
    pub processed: usize,
    pub succeeded: Vec<PushSuccess>,
    pub dropped: usize,
    pub failed: usize,
    pub last_error: Option<SyncApiError>,
}

enum Outcome {
    Succeeded,
    Dropped,
    Failed(String),
}

// ============================================================================
// Retry Queue
// ============================================================================

/// Durable queue of pushes waiting for retry
pub struct RetryQueue {
    db: Arc<Database>,
    pending: Mutex<Vec<PendingSyncOperation>>,
    /// Serializes drains; held for the whole pass, unlike `pending`
    drain: Mutex<()>,
    policy: RetryPolicy,
}

impl RetryQueue {
    /// Create queue and load persisted items
    pub fn new(db: Arc<Database>) -> Result<Self, QueueError> {
        Self::with_policy(db, RetryPolicy::default())
    }

    pub fn with_policy(db: Arc<Database>, policy: RetryPolicy) -> Result<Self, QueueError> {
        let pending = db.get_queue()?;
        if !pending.is_empty() {
            log::info!("Loaded {} pending sync operations", pending.len());
        }

        Ok(Self {
            db,
            pending: Mutex::new(pending),
            drain: Mutex::new(()),
            policy,
        })
    }

    /// Queue a snapshot for retry.
    ///
    /// Only the newest snapshot per collection is kept: an older queued item
    /// of the same kind is replaced, and its retry count and last error carry
    /// over. The result reflects persistence only; on failure the in-memory
    /// queue is left as it was.
    pub async fn enqueue<E: SyncEntity>(&self, items: &[E]) -> Result<Uuid, QueueError> {
        let payload = E::to_payload(items)?;
        let mut op = PendingSyncOperation {
            id: Uuid::new_v4(),
            kind: E::KIND,
            payload: serde_json::to_string(&payload)?,
            checksum: fingerprint(items),
            item_count: items.len() as i64,
            queued_at: Utc::now(),
            retries: 0,
            last_error: None,
        };
        let id = op.id;

        let mut pending = self.pending.lock().await;
        let mut next = Vec::with_capacity(pending.len() + 1);
        let mut replaced = 0;
        for existing in pending.iter() {
            if existing.kind == op.kind {
                op.retries = op.retries.max(existing.retries);
                if existing.last_error.is_some() {
                    op.last_error = existing.last_error.clone();
                }
                replaced += 1;
            } else {
                next.push(existing.clone());
            }
        }
        next.push(op);

        if let Err(e) = self.db.replace_queue(&next) {
            log::error!("Failed to persist sync queue: {}", e);
            return Err(e.into());
        }
        *pending = next;

        if replaced > 0 {
            log::debug!("Replaced {} older queued {} snapshots", replaced, E::KIND);
        }
        log::info!("Queued {} push for retry ({} pending)", E::KIND, pending.len());
        Ok(id)
    }

    /// Retry every queued push in enqueue order.
    ///
    /// Success removes the item, a retryable failure increments its retry
    /// count, a non-retryable failure drops it. Only persistence failures
    /// are returned as `Err`.
    pub async fn process_queue(&self, remote: &dyn SyncRemote) -> Result<ProcessQueueReport, QueueError> {
        let _drain = self.drain.lock().await;

        let snapshot: Vec<PendingSyncOperation> = self.pending.lock().await.clone();
        let mut report = ProcessQueueReport::default();
        if snapshot.is_empty() {
            return Ok(report);
        }

        log::info!("Processing {} pending sync operations", snapshot.len());

        let mut outcomes: HashMap<Uuid, Outcome> = HashMap::new();
        for op in &snapshot {
            let delay = self.policy.delay_for(op.retries);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            report.processed += 1;

            let payload: serde_json::Value = match serde_json::from_str(&op.payload) {
                Ok(payload) => payload,
                Err(e) => {
                    log::error!("Dropping unreadable {} queue item {}: {}", op.kind, op.id, e);
                    report.dropped += 1;
                    outcomes.insert(op.id, Outcome::Dropped);
                    continue;
                }
            };

            match remote.push(op.kind, payload).await {
                Ok(version) => {
                    log::info!("Queued {} push succeeded (version {})", op.kind, version);
                    report.succeeded.push(PushSuccess {
                        kind: op.kind,
                        version,
                        checksum: op.checksum.clone(),
                        item_count: op.item_count,
                        queued_at: op.queued_at,
                    });
                    outcomes.insert(op.id, Outcome::Succeeded);
                }
                Err(e) if e.is_retryable() => {
                    log::warn!("Queued {} push failed (retry {}): {}", op.kind, op.retries + 1, e);
                    report.failed += 1;
                    outcomes.insert(op.id, Outcome::Failed(e.to_string()));
                    report.last_error = Some(e);
                }
                Err(e) => {
                    log::warn!("Dropping queued {} push: {}", op.kind, e);
                    report.dropped += 1;
                    outcomes.insert(op.id, Outcome::Dropped);
                    report.last_error = Some(e);
                }
            }
        }

        // Commit by id so items enqueued during the drain are preserved
        let mut pending = self.pending.lock().await;
        let mut next = Vec::with_capacity(pending.len());
        for op in pending.iter() {
            match outcomes.get(&op.id) {
                None => next.push(op.clone()),
                Some(Outcome::Failed(message)) => {
                    let mut op = op.clone();
                    op.retries += 1;
                    op.last_error = Some(message.clone());
                    next.push(op);
                }
                Some(Outcome::Succeeded) | Some(Outcome::Dropped) => {}
            }
        }

        self.db.replace_queue(&next).map_err(|e| {
            log::error!("Failed to persist sync queue: {}", e);
            QueueError::from(e)
        })?;
        *pending = next;

        Ok(report)
    }

    /// Drop queued pushes of `kind` that were queued before `before`.
    ///
    /// Used after a fresh push succeeds so an older snapshot can never
    /// overwrite it on a later drain.
    pub async fn supersede(&self, kind: CollectionKind, before: DateTime<Utc>) -> Result<usize, QueueError> {
        let mut pending = self.pending.lock().await;
        let next: Vec<PendingSyncOperation> = pending
            .iter()
            .filter(|op| op.kind != kind || op.queued_at > before)
            .cloned()
            .collect();

        let removed = pending.len() - next.len();
        if removed == 0 {
            return Ok(0);
        }

        self.db.replace_queue(&next)?;
        *pending = next;

        log::debug!("Superseded {} queued {} pushes", removed, kind);
        Ok(removed)
    }

    /// Number of queued pushes
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Queued pushes of one collection
    pub async fn pending_for(&self, kind: CollectionKind) -> usize {
        self.pending.lock().await.iter().filter(|op| op.kind == kind).count()
    }

    /// Copy of the queue contents
    pub async fn pending(&self) -> Vec<PendingSyncOperation> {
        self.pending.lock().await.clone()
    }

    /// Get queue statistics
    pub async fn stats(&self) -> QueueStats {
        let pending = self.pending.lock().await;
        QueueStats {
            pending_count: pending.len(),
            exhausted_count: pending.iter().filter(|op| op.is_exhausted()).count(),
            last_error: pending.iter().rev().find_map(|op| op.last_error.clone()),
        }
    }

    /// Remove every queued push
    pub async fn clear(&self) -> Result<usize, QueueError> {
        let _drain = self.drain.lock().await;
        let mut pending = self.pending.lock().await;

        self.db.replace_queue(&[])?;
        let removed = pending.len();
        pending.clear();

        log::info!("Cleared {} queued sync operations", removed);
        Ok(removed)
    }
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

// ============================================================================
// Tests
// ============================================================================
