//! Sync Module - Cross-Device Account and Unsubscribe History Sync
//!
//! Keeps mailbox accounts and the unsubscribed-sender history identical
//! across installations through a central store:
//! - Accounts (mailbox configs, credential blob passed through untouched)
//! - Unsubscribed senders
//!
//! Architecture:
//! - Versioned replicas: the server assigns a version per collection
//! - Three-way merge: deterministic, conflicts reported but never blocking
//! - Durable retry queue: transient push failures are retried with backoff

pub mod api;
pub mod checksum;
pub mod manager;
pub mod merge;
pub mod models;
pub mod queue;
pub mod replica;
pub mod scheduler;


// Re-export commonly used types
pub use api::{AuthTokens, RemoteCollection, SyncApiClient, SyncApiError, SyncRemote};
pub use checksum::fingerprint;
pub use manager::{PushOutcome, PushReport, SyncManager, SyncManagerError};
pub use merge::{three_way_merge, validate_ids, MergeOutcome, Mergeable};
pub use models::{
    Account, CollectionKind, CollectionStatus, SyncConflict, SyncEntity, SyncMetadata,
    SyncResult, SyncState, UnsubscribedEntry, UnsubscribedStore,
};
pub use queue::{PendingSyncOperation, ProcessQueueReport, QueueError, QueueStats, RetryPolicy, RetryQueue};
pub use replica::{ReplicaError, ReplicaStore};
pub use scheduler::{BackgroundScheduler, SchedulerError, TaskSupervisor};

/// Scripted in-process remote used by the sync tests
#[cfg(test)]
pub(crate) mod testing {
    use super::api::{RemoteCollection, SyncApiError, SyncRemote};
    use super::models::CollectionKind;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::collections::{HashMap, VecDeque};
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::{Arc, Mutex};

    /// Scripted failure kinds
    #[derive(Debug, Clone, Copy)]
    pub enum Fail {
        /// Server unavailable; retryable
        Transient,
        /// Subscription missing; never retried
        Entitlement,
        /// Token rejected and no refresh token; never retried
        Unauthorized,
    }

    impl Fail {
        fn to_error(self) -> SyncApiError {
            match self {
                Fail::Transient => SyncApiError::ServerError {
                    status: 503,
                    message: "service unavailable".to_string(),
                },
                Fail::Entitlement => {
                    SyncApiError::Forbidden("active subscription required".to_string())
                }
                Fail::Unauthorized => SyncApiError::Unauthorized,
            }
        }
    }

    type PushHook = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

    #[derive(Default)]
    struct State {
        collections: HashMap<CollectionKind, RemoteCollection>,
        push_failures: HashMap<CollectionKind, VecDeque<Fail>>,
        fetch_failures: HashMap<CollectionKind, VecDeque<Fail>>,
        pushes: HashMap<CollectionKind, usize>,
        fetches: HashMap<CollectionKind, usize>,
    }

    /// In-memory remote store with scripted failures
    #[derive(Clone, Default)]
    pub struct FakeRemote {
        state: Arc<Mutex<State>>,
        on_push: Arc<Mutex<Option<PushHook>>>,
    }

    impl FakeRemote {
        pub fn new() -> Self {
            Self::default()
        }

        /// Seed the remote collection
        pub fn set_collection(&self, kind: CollectionKind, payload: Value, version: i64) {
            self.state
                .lock()
                .unwrap()
                .collections
                .insert(kind, RemoteCollection { payload, version });
        }

        pub fn collection(&self, kind: CollectionKind) -> RemoteCollection {
            self.state
                .lock()
                .unwrap()
                .collections
                .get(&kind)
                .cloned()
                .unwrap_or_else(RemoteCollection::empty)
        }

        /// Fail the next `times` pushes of `kind`
        pub fn fail_pushes(&self, kind: CollectionKind, fail: Fail, times: usize) {
            let mut state = self.state.lock().unwrap();
            let queue = state.push_failures.entry(kind).or_default();
            queue.extend(std::iter::repeat(fail).take(times));
        }

        /// Fail the next `times` fetches of `kind`
        pub fn fail_fetches(&self, kind: CollectionKind, fail: Fail, times: usize) {
            let mut state = self.state.lock().unwrap();
            let queue = state.fetch_failures.entry(kind).or_default();
            queue.extend(std::iter::repeat(fail).take(times));
        }

        /// Run `hook` inside every push, before it completes
        pub fn on_push<F>(&self, hook: F)
        where
            F: Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync + 'static,
        {
            *self.on_push.lock().unwrap() = Some(Arc::new(hook));
        }

        pub fn push_count(&self, kind: CollectionKind) -> usize {
            self.state.lock().unwrap().pushes.get(&kind).copied().unwrap_or(0)
        }

        pub fn fetch_count(&self, kind: CollectionKind) -> usize {
            self.state.lock().unwrap().fetches.get(&kind).copied().unwrap_or(0)
        }
    }

    #[async_trait]
    impl SyncRemote for FakeRemote {
        async fn fetch(&self, kind: CollectionKind) -> Result<RemoteCollection, SyncApiError> {
            let mut state = self.state.lock().unwrap();
            *state.fetches.entry(kind).or_default() += 1;

            if let Some(fail) = state.fetch_failures.get_mut(&kind).and_then(VecDeque::pop_front) {
                return Err(fail.to_error());
            }

            Ok(state
                .collections
                .get(&kind)
                .cloned()
                .unwrap_or_else(RemoteCollection::empty))
        }

        async fn push(&self, kind: CollectionKind, payload: Value) -> Result<i64, SyncApiError> {
            let hook = self.on_push.lock().unwrap().clone();
            if let Some(hook) = hook {
                hook().await;
            }

            let mut state = self.state.lock().unwrap();
            *state.pushes.entry(kind).or_default() += 1;

            if let Some(fail) = state.push_failures.get_mut(&kind).and_then(VecDeque::pop_front) {
                return Err(fail.to_error());
            }

            let version = state.collections.get(&kind).map_or(0, |c| c.version) + 1;
            state
                .collections
                .insert(kind, RemoteCollection { payload, version });
            Ok(version)
        }
    }
}
