//! Sync Manager - Orchestrates synchronization operations
//!
//! Coordinates between the replica store, the retry queue and the remote API.
//! Handles:
//! - Startup check (pull newer remote state, never push)
//! - Periodic push (drain retry queue, then push changed collections)
//! - Manual push, pull and bidirectional sync
//! - Pre-exit sync (wait for in-flight tasks, then push)
//! - Auto-sync after local edits, as a supervised task
//!
//! Collections are synced independently: a failure in one never stops the
//! other. Transient push failures land in the retry queue; authorization and
//! subscription failures are surfaced to the caller and never retried.

use super::api::{SyncApiError, SyncRemote};
use super::checksum::fingerprint;
use super::merge::{drop_invalid, three_way_merge, Mergeable};
use super::models::{
    Account, CollectionKind, CollectionStatus, SyncConflict, SyncResult, SyncState,
    UnsubscribedEntry,
};
use super::queue::{ProcessQueueReport, QueueError, QueueStats, RetryQueue};
use super::replica::{ReplicaCollection, ReplicaError, ReplicaStore};
use super::scheduler::TaskSupervisor;
use crate::config::{ConfigError, SyncSettings};
use crate::db::Database;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Sync manager - main orchestrator
#[derive(Clone)]
pub struct SyncManager {
    db: Arc<Database>,
    replica: ReplicaStore,
    remote: Arc<dyn SyncRemote>,
    queue: Arc<RetryQueue>,
    settings: Arc<RwLock<SyncSettings>>,
    /// Latest version seen from the server, per collection
    remote_versions: Arc<RwLock<HashMap<CollectionKind, i64>>>,
    supervisor: TaskSupervisor,
}

impl SyncManager {
    pub fn new(
        db: Arc<Database>,
        remote: Arc<dyn SyncRemote>,
        queue: Arc<RetryQueue>,
        settings: SyncSettings,
    ) -> Self {
        Self {
            replica: ReplicaStore::new(db.clone()),
            db,
            remote,
            queue,
            settings: Arc::new(RwLock::new(settings)),
            remote_versions: Arc::new(RwLock::new(HashMap::new())),
            supervisor: TaskSupervisor::new(),
        }
    }

    pub fn replica(&self) -> &ReplicaStore {
        &self.replica
    }

    pub fn supervisor(&self) -> &TaskSupervisor {
        &self.supervisor
    }

    // ========================================================================
    // Configuration
    // ========================================================================

    pub async fn settings(&self) -> SyncSettings {
        self.settings.read().await.clone()
    }

    /// Validate, persist and apply new settings
    pub async fn update_settings(&self, settings: SyncSettings) -> Result<(), SyncManagerError> {
        settings.save(&self.db)?;
        *self.settings.write().await = settings;
        log::info!("Sync settings updated");
        Ok(())
    }

    // ========================================================================
    // Sync Operations
    // ========================================================================

    /// Pull collections whose remote version is newer than ours.
    ///
    /// Never pushes. Failures are collected per collection.
    pub async fn startup_check(&self) -> Result<SyncResult, SyncManagerError> {
        let settings = self.settings().await;
        let mut result = SyncResult::default();

        if !settings.is_active() || !settings.auto_sync_on_startup {
            log::debug!("Startup sync check skipped");
            return Ok(result);
        }

        log::info!("Running startup sync check");

        for kind in enabled_kinds(&settings) {
            match self.pull_kind(kind, false).await {
                Ok(Some(summary)) => summary.apply_to(&mut result),
                Ok(None) => log::debug!("{} already up to date", kind),
                Err(e) => {
                    log::warn!("Startup check for {} failed: {}", kind, e);
                    result.errors.push(format!("{}: {}", kind, e));
                }
            }
        }

        Ok(result)
    }

    /// Drain the retry queue, then push every enabled collection that changed
    /// since its last successful push.
    pub async fn periodic_push(&self) -> Result<PushReport, SyncManagerError> {
        let settings = self.settings().await;
        if !settings.is_active() {
            log::debug!("Periodic push skipped: sync not active");
            return Ok(PushReport::default());
        }

        self.push_collections(enabled_kinds(&settings), false).await
    }

    /// Push both collections unconditionally
    pub async fn manual_sync(&self) -> Result<PushReport, SyncManagerError> {
        if !self.settings().await.is_active() {
            return Err(SyncManagerError::SyncDisabled);
        }

        log::info!("Manual sync requested");
        self.push_collections(CollectionKind::ALL.to_vec(), true).await
    }

    /// Pull and merge both collections regardless of version
    pub async fn pull_sync(&self) -> Result<SyncResult, SyncManagerError> {
        if !self.settings().await.is_active() {
            return Err(SyncManagerError::SyncDisabled);
        }

        log::info!("Pulling remote collections");

        let mut result = SyncResult::default();
        let mut upgrade = None;

        for kind in CollectionKind::ALL {
            match self.pull_kind(kind, true).await {
                Ok(Some(summary)) => summary.apply_to(&mut result),
                Ok(None) => {}
                Err(SyncManagerError::UpgradeRequired(message)) => {
                    result.errors.push(format!("{}: {}", kind, message));
                    upgrade = Some(message);
                }
                Err(e) => {
                    log::warn!("Pull of {} failed: {}", kind, e);
                    result.errors.push(format!("{}: {}", kind, e));
                }
            }
        }

        match upgrade {
            Some(message) => Err(SyncManagerError::UpgradeRequired(message)),
            None => Ok(result),
        }
    }

    /// Bidirectional sync: pull and merge each enabled collection, then push
    /// the merged result when the merge produced no conflicts.
    pub async fn sync_all(&self) -> Result<SyncResult, SyncManagerError> {
        let settings = self.settings().await;
        if !settings.is_active() {
            return Err(SyncManagerError::SyncDisabled);
        }

        log::info!("Starting bidirectional sync");

        let mut result = SyncResult::default();
        let mut upgrade = None;

        for kind in enabled_kinds(&settings) {
            let conflicts_before = result.conflicts.len();

            match self.pull_kind(kind, true).await {
                Ok(Some(summary)) => summary.apply_to(&mut result),
                Ok(None) => {}
                Err(e) => {
                    if let SyncManagerError::UpgradeRequired(message) = &e {
                        upgrade = Some(message.clone());
                    }
                    log::warn!("Sync of {} failed during pull: {}", kind, e);
                    result.errors.push(format!("{}: {}", kind, e));
                    continue;
                }
            }

            if result.conflicts.len() > conflicts_before {
                log::warn!(
                    "{} has {} conflicts, not pushing merged result",
                    kind,
                    result.conflicts.len() - conflicts_before
                );
                continue;
            }

            match self.push_kind(kind, false).await {
                Ok(PushOutcome::Pushed { .. }) => result.pushed.push(kind),
                Ok(PushOutcome::Skipped) => {}
                Ok(PushOutcome::Queued { error }) => {
                    result.errors.push(format!("{}: queued for retry: {}", kind, error));
                }
                Err(e) => {
                    if let SyncManagerError::UpgradeRequired(message) = &e {
                        upgrade = Some(message.clone());
                    }
                    result.errors.push(format!("{}: {}", kind, e));
                }
            }
        }

        log::info!(
            "Bidirectional sync finished: accounts +{} ~{}, unsubscribed +{}, conflicts={}, errors={}",
            result.accounts_added,
            result.accounts_updated,
            result.unsubscribed_added,
            result.conflicts.len(),
            result.errors.len()
        );

        match upgrade {
            Some(message) => Err(SyncManagerError::UpgradeRequired(message)),
            None => Ok(result),
        }
    }

    /// Wait for in-flight sync tasks, then push everything
    pub async fn pre_exit_sync(&self) -> Result<PushReport, SyncManagerError> {
        self.supervisor.wait_all().await;

        if !self.settings().await.is_active() {
            return Ok(PushReport::default());
        }

        self.manual_sync().await
    }

    /// Push enabled collections in the background after a local edit.
    ///
    /// Silently does nothing while sync is not active.
    pub async fn auto_sync(&self) {
        let settings = self.settings().await;
        if !settings.is_active() {
            return;
        }

        let manager = self.clone();
        let kinds = enabled_kinds(&settings);
        self.supervisor.spawn("auto-sync", async move {
            match manager.push_collections(kinds, false).await {
                Ok(report) if !report.errors.is_empty() => {
                    log::warn!("Auto-sync finished with errors: {:?}", report.errors);
                }
                Ok(_) => log::debug!("Auto-sync finished"),
                Err(e) => log::warn!("Auto-sync failed: {}", e),
            }
        });
    }

    // ========================================================================
    // Local Edits
    // ========================================================================

    /// Add or update an account and schedule an auto-sync
    pub async fn add_account(
        &self,
        email: &str,
        server: &str,
        password: &str,
        name: &str,
    ) -> Result<Account, SyncManagerError> {
        let account = self.replica.add_account(email, server, password, name)?;
        self.auto_sync().await;
        Ok(account)
    }

    /// Remove an account and schedule an auto-sync
    pub async fn delete_account(&self, id: &str) -> Result<bool, SyncManagerError> {
        let removed = self.replica.delete_account(id)?;
        if removed {
            self.auto_sync().await;
        }
        Ok(removed)
    }

    /// Record an unsubscribe and schedule an auto-sync
    pub async fn add_unsubscribed(&self, sender: &str) -> Result<UnsubscribedEntry, SyncManagerError> {
        let entry = self.replica.add_unsubscribed(sender)?;
        self.auto_sync().await;
        Ok(entry)
    }

    // ========================================================================
    // Queue & Status
    // ========================================================================

    /// Retry queued pushes and record the ones the server accepted
    pub async fn process_queue(&self) -> Result<ProcessQueueReport, SyncManagerError> {
        let report = self.queue.process_queue(self.remote.as_ref()).await?;

        for success in &report.succeeded {
            self.replica.record_push(
                success.kind,
                success.version,
                &success.checksum,
                success.item_count.max(0) as usize,
            )?;
            self.note_remote_version(success.kind, success.version).await;
        }

        Ok(report)
    }

    pub async fn queue_stats(&self) -> QueueStats {
        self.queue.stats().await
    }

    pub async fn clear_queue(&self) -> Result<usize, SyncManagerError> {
        Ok(self.queue.clear().await?)
    }

    /// Current state of each collection
    pub async fn status(&self) -> Result<Vec<CollectionStatus>, SyncManagerError> {
        let mut statuses = Vec::with_capacity(CollectionKind::ALL.len());

        for kind in CollectionKind::ALL {
            let meta = self.replica.metadata(kind)?;
            let remote_version = self.remote_versions.read().await.get(&kind).copied();
            let pending_retries = self.queue.pending_for(kind).await;

            let (checksum, is_empty) = match kind {
                CollectionKind::Accounts => {
                    let items = self.replica.load::<Account>()?;
                    (fingerprint(&items), items.is_empty())
                }
                CollectionKind::Unsubscribed => {
                    let items = self.replica.load::<UnsubscribedEntry>()?;
                    (fingerprint(&items), items.is_empty())
                }
            };

            let state = if pending_retries > 0 {
                SyncState::PendingRetry
            } else if remote_version.is_some_and(|v| v > meta.local_version) {
                SyncState::Stale
            } else {
                match meta.last_pushed_checksum.as_deref() {
                    Some(last) if last == checksum => SyncState::InSync,
                    None if is_empty => SyncState::InSync,
                    _ => SyncState::Dirty,
                }
            };

            statuses.push(CollectionStatus {
                kind,
                state,
                local_version: meta.local_version,
                remote_version,
                last_sync_at: meta.last_sync_at,
                pending_retries,
                last_error: meta.last_error,
            });
        }

        Ok(statuses)
    }

    // ========================================================================
    // Internal
    // ========================================================================

    async fn note_remote_version(&self, kind: CollectionKind, version: i64) {
        let mut versions = self.remote_versions.write().await;
        let entry = versions.entry(kind).or_insert(version);
        *entry = (*entry).max(version);
    }

    /// Drain the queue (best effort), then push `kinds` independently.
    ///
    /// Entitlement failures are returned after every collection was tried.
    async fn push_collections(
        &self,
        kinds: Vec<CollectionKind>,
        force: bool,
    ) -> Result<PushReport, SyncManagerError> {
        let mut report = PushReport::default();

        if self.queue.pending_count().await > 0 {
            match self.process_queue().await {
                Ok(drained) => {
                    report.drained = drained.succeeded.len();
                    if let Some(e) = drained.last_error {
                        log::warn!("Retry queue drain left errors: {}", e);
                    }
                }
                Err(e) => log::error!("Retry queue drain failed: {}", e),
            }
        }

        let mut upgrade = None;
        for kind in kinds {
            match self.push_kind(kind, force).await {
                Ok(outcome) => report.outcomes.push((kind, outcome)),
                Err(SyncManagerError::UpgradeRequired(message)) => {
                    report.errors.push(format!("{}: {}", kind, message));
                    upgrade = Some(message);
                }
                Err(e) => {
                    log::warn!("Push of {} failed: {}", kind, e);
                    report.errors.push(format!("{}: {}", kind, e));
                }
            }
        }

        match upgrade {
            Some(message) => Err(SyncManagerError::UpgradeRequired(message)),
            None => Ok(report),
        }
    }

    async fn push_kind(&self, kind: CollectionKind, force: bool) -> Result<PushOutcome, SyncManagerError> {
        match kind {
            CollectionKind::Accounts => self.push_collection::<Account>(force).await,
            CollectionKind::Unsubscribed => self.push_collection::<UnsubscribedEntry>(force).await,
        }
    }

    async fn pull_kind(&self, kind: CollectionKind, force: bool) -> Result<Option<PullSummary>, SyncManagerError> {
        match kind {
            CollectionKind::Accounts => self.pull_collection::<Account>(force).await,
            CollectionKind::Unsubscribed => self.pull_collection::<UnsubscribedEntry>(force).await,
        }
    }

    /// Push the local snapshot of one collection.
    ///
    /// Without `force`, an unchanged fingerprint skips the network call.
    async fn push_collection<E: ReplicaCollection>(&self, force: bool) -> Result<PushOutcome, SyncManagerError> {
        let kind = E::KIND;
        let items = self.replica.load::<E>()?;
        let checksum = fingerprint(&items);

        if !force {
            let meta = self.replica.metadata(kind)?;
            if meta.last_pushed_checksum.as_deref() == Some(checksum.as_str()) {
                log::debug!("{} unchanged since last push, skipping", kind);
                return Ok(PushOutcome::Skipped);
            }
        }

        let payload = E::to_payload(&items)?;
        let started = Utc::now();
        log::debug!("Pushing {} ({} items)", kind, items.len());

        match self.remote.push(kind, payload).await {
            Ok(version) => {
                self.replica.record_push(kind, version, &checksum, items.len())?;
                self.note_remote_version(kind, version).await;

                // An older queued snapshot must not overwrite this one later
                if let Err(e) = self.queue.supersede(kind, started).await {
                    log::error!("Failed to prune superseded {} pushes: {}", kind, e);
                }

                log::info!("Pushed {} (version {})", kind, version);
                Ok(PushOutcome::Pushed { version })
            }
            Err(e) if e.is_retryable() => {
                log::warn!("Push of {} failed, queueing for retry: {}", kind, e);
                let message = e.to_string();
                self.record_error(kind, &message);
                self.queue.enqueue(&items).await?;
                Ok(PushOutcome::Queued { error: message })
            }
            Err(e) => {
                self.record_error(kind, &e.to_string());
                Err(classify(e))
            }
        }
    }

    /// Fetch one collection and merge it into the replica.
    ///
    /// Without `force`, nothing happens unless the remote version is newer.
    /// Returns `None` when the replica was already current.
    async fn pull_collection<E>(&self, force: bool) -> Result<Option<PullSummary>, SyncManagerError>
    where
        E: ReplicaCollection + Mergeable,
    {
        let kind = E::KIND;
        let remote = self.remote.fetch(kind).await.map_err(classify)?;
        self.note_remote_version(kind, remote.version).await;

        let meta = self.replica.metadata(kind)?;
        if !force && remote.version <= meta.local_version {
            return Ok(None);
        }

        let (remote_items, dropped) = drop_invalid(E::from_payload(remote.payload)?);
        if dropped > 0 {
            log::warn!("Ignored {} remote {} entries without an identity", dropped, kind);
        }

        let local = self.replica.load::<E>()?;
        // Base snapshots are not persisted; merge against an empty base
        let outcome = three_way_merge(&local, &remote_items, &[]);

        self.replica.save(&outcome.merged)?;
        self.replica.record_pull(
            kind,
            remote.version,
            &fingerprint(&remote_items),
            outcome.merged.len(),
        )?;

        log::info!(
            "Pulled {} version {}: {} added, {} updated, {} conflicts",
            kind,
            remote.version,
            outcome.added_from_remote,
            outcome.updated_from_remote,
            outcome.conflicts.len()
        );

        Ok(Some(PullSummary {
            kind,
            added: outcome.added_from_remote,
            updated: outcome.updated_from_remote,
            conflicts: outcome.conflicts,
        }))
    }

    fn record_error(&self, kind: CollectionKind, message: &str) {
        if let Err(e) = self.replica.record_error(kind, Some(message)) {
            log::error!("Failed to record {} sync error: {}", kind, e);
        }
    }
}

/// Collections enabled by the selective sync toggles
fn enabled_kinds(settings: &SyncSettings) -> Vec<CollectionKind> {
    CollectionKind::ALL
        .into_iter()
        .filter(|kind| match kind {
            CollectionKind::Accounts => settings.sync_accounts,
            CollectionKind::Unsubscribed => settings.sync_unsubscribed,
        })
        .collect()
}

/// Map an API error to the error callers act on
fn classify(e: SyncApiError) -> SyncManagerError {
    if e.is_entitlement() {
        SyncManagerError::UpgradeRequired(e.to_string())
    } else {
        SyncManagerError::Api(e)
    }
}

// ============================================================================
// Result Types
// ============================================================================

/// What happened to one collection push
#[derive(Debug, Clone, PartialEq)]
pub enum PushOutcome {
    /// Server accepted the snapshot
    Pushed { version: i64 },
    /// Fingerprint unchanged since the last push
    Skipped,
    /// Transient failure; snapshot is in the retry queue
    Queued { error: String },
}

#[derive(Debug, Clone, Default)]
pub struct PushReport {
    pub outcomes: Vec<(CollectionKind, PushOutcome)>,
    /// Queued pushes the server accepted before the fresh pushes
    pub drained: usize,
    pub errors: Vec<String>,
}

impl PushReport {
    fn kinds_where(&self, pred: impl Fn(&PushOutcome) -> bool) -> Vec<CollectionKind> {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| pred(outcome))
            .map(|(kind, _)| *kind)
            .collect()
    }

    pub fn pushed(&self) -> Vec<CollectionKind> {
        self.kinds_where(|o| matches!(o, PushOutcome::Pushed { .. }))
    }

    pub fn skipped(&self) -> Vec<CollectionKind> {
        self.kinds_where(|o| matches!(o, PushOutcome::Skipped))
    }

    pub fn queued(&self) -> Vec<CollectionKind> {
        self.kinds_where(|o| matches!(o, PushOutcome::Queued { .. }))
    }

    pub fn outcome(&self, kind: CollectionKind) -> Option<&PushOutcome> {
        self.outcomes.iter().find(|(k, _)| *k == kind).map(|(_, o)| o)
    }
}

/// Merge statistics for one pulled collection
#[derive(Debug, Clone)]
struct PullSummary {
    kind: CollectionKind,
    added: usize,
    updated: usize,
    conflicts: Vec<SyncConflict>,
}

impl PullSummary {
    fn apply_to(self, result: &mut SyncResult) {
        match self.kind {
            CollectionKind::Accounts => {
                result.accounts_added += self.added;
                result.accounts_updated += self.updated;
            }
            CollectionKind::Unsubscribed => result.unsubscribed_added += self.added,
        }
        result.pulled.push(self.kind);
        result.conflicts.extend(self.conflicts);
    }
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum SyncManagerError {
    #[error("Sync is disabled")]
    SyncDisabled,

    #[error("Upgrade required: {0}")]
    UpgradeRequired(String),

    #[error("API error: {0}")]
    Api(#[from] SyncApiError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Replica error: {0}")]
    Replica(#[from] ReplicaError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Payload error: {0}")]
    Payload(#[from] serde_json::Error),
}

impl SyncManagerError {
    /// The user must upgrade their subscription before sync can work
    pub fn is_upgrade_required(&self) -> bool {
        matches!(self, Self::UpgradeRequired(_))
    }
}
