// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Preference engine coordinator.
//!
//! The [`PreferenceEngine`] ties together all components:
//! - two-tier cache (memory TTL map over the durable local stores)
//! - per-key circuit breakers in front of the remote store
//! - request coalescing for reads, debounced/critical coalescing for writes
//! - merge-vs-replace reconciliation of partial updates
//! - the offline replay queue and the change notification bus
//!
//! # Lifecycle
//!
//! ```text
//! Running ──clear_on_sign_out──► SignedOut ──(user resolves)──► Running
//!    │                                                            │
//!    └────────────────────────── teardown ──────────────────► TornDown
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use pref_sync_engine::{EngineBackends, PreferenceEngine, PrefSyncConfig, PreferenceType};
//! use pref_sync_engine::{GetOptions, SaveOptions};
//! # use pref_sync_engine::remote::{RemoteStore, StaticIdentity};
//! use serde_json::json;
//! use std::sync::Arc;
//! use tokio::sync::watch;
//!
//! # async fn example(remote: Arc<dyn RemoteStore>) -> Result<(), pref_sync_engine::SyncError> {
//! let (_online_tx, online_rx) = watch::channel(true);
//! let identity = Arc::new(StaticIdentity::new(Some("alice")));
//! let backends = EngineBackends::in_memory(remote, identity, online_rx);
//!
//! let engine = PreferenceEngine::new(PrefSyncConfig::default(), backends).await?;
//! engine.spawn_connectivity_watcher();
//!
//! let grid = engine
//!     .get_preferences(PreferenceType::Grid, Some("orders"), GetOptions::default())
//!     .await;
//! println!("page size: {}", grid.payload["pageSize"]);
//!
//! engine
//!     .save_preferences(PreferenceType::Grid, json!({"pageSize": 50}), Some("orders"), SaveOptions::default())
//!     .await?;
//! engine.teardown().await;
//! # Ok(())
//! # }
//! ```

mod api;
mod gateway;
mod lifecycle;
mod types;

pub use types::{
    EngineBackends, EngineHealth, EngineState, GetOptions, HealthStatus, SaveOptions, SaveOutcome,
};

use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::{info, warn};

use crate::cache::{CacheHierarchy, Invalidation};
use crate::coalescing::request::RequestCoalescer;
use crate::coalescing::write::{WriteCoalescer, WriteSink};
use crate::config::PrefSyncConfig;
use crate::error::SyncError;
use crate::key::PreferenceKey;
use crate::notify::ChangeBus;
use crate::preference::PreferenceDocument;
use crate::remote::IdentityProvider;
use crate::resilience::circuit_breaker::BreakerRegistry;
use crate::resilience::offline_queue::OfflineQueue;
use crate::storage::adapter::DurableStore;

use gateway::RemoteGateway;

/// Key of the outer read coalescer: the resolved key plus `bypass_cache`.
type ReadKey = (PreferenceKey, bool);

/// Client-resident preference sync engine.
///
/// Cheap to clone; clones share all state.
///
/// # Thread Safety
///
/// The engine is `Send + Sync`. Registries are `DashMap`s and parking_lot
/// locks; no lock is held across an `.await`.
#[derive(Clone)]
pub struct PreferenceEngine {
    pub(super) inner: Arc<EngineInner>,
}

pub(super) struct EngineInner {
    pub(super) config: PrefSyncConfig,

    /// Remote access plus the cache, breakers, queue and bus it feeds
    pub(super) gateway: Arc<RemoteGateway>,

    pub(super) writes: WriteCoalescer,

    /// Shared identity lookups of concurrent callers
    pub(super) identities: RequestCoalescer<(), Option<String>>,

    /// Outer read coalescer, wraps the whole read of one resolved key
    pub(super) reads: RequestCoalescer<ReadKey, PreferenceDocument>,

    pub(super) identity: Arc<dyn IdentityProvider>,

    /// Last user the identity provider confirmed
    pub(super) last_user: RwLock<Option<String>>,

    pub(super) state: watch::Sender<EngineState>,
    pub(super) state_rx: watch::Receiver<EngineState>,

    /// Connectivity watcher task, if spawned
    pub(super) watcher: Mutex<Option<AbortHandle>>,
}

impl PreferenceEngine {
    /// Build an engine over `backends`.
    ///
    /// Opens the offline queue in the large-object store, recovering any
    /// writes left from a previous run. They are replayed by the
    /// connectivity watcher or [`drain_offline_queue`](Self::drain_offline_queue).
    pub async fn new(config: PrefSyncConfig, backends: EngineBackends) -> Result<Self, SyncError> {
        let durable = DurableStore::new(
            backends.small_store,
            backends.large_store,
            config.small_object_max_bytes,
        );
        let queue = OfflineQueue::open(durable.large(), config.queue_prefix.clone(), config.queue_max_items).await?;
        let cache = CacheHierarchy::new(Arc::new(durable), &config);

        let gateway = Arc::new(RemoteGateway::new(
            backends.remote,
            BreakerRegistry::new(config.breaker_config()),
            cache,
            queue,
            ChangeBus::new(config.notify_tick()),
            backends.connectivity,
        ));
        let sink: Arc<dyn WriteSink> = gateway.clone();
        let writes = WriteCoalescer::new(sink, config.debounce());

        let (state, state_rx) = watch::channel(EngineState::Running);
        crate::metrics::set_engine_state(EngineState::Running.as_str());
        info!(
            debounce_ms = config.debounce_ms,
            memory_ttl_ms = config.memory_ttl_ms,
            queue_max_items = config.queue_max_items,
            "Preference engine created"
        );

        Ok(Self {
            inner: Arc::new(EngineInner {
                config,
                gateway,
                writes,
                identities: RequestCoalescer::new(),
                reads: RequestCoalescer::new(),
                identity: backends.identity,
                last_user: RwLock::new(None),
                state,
                state_rx,
                watcher: Mutex::new(None),
            }),
        })
    }

    #[must_use]
    pub fn config(&self) -> &PrefSyncConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn state(&self) -> EngineState {
        *self.inner.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.inner.state_rx.clone()
    }

    #[must_use]
    pub fn is_online(&self) -> bool {
        self.inner.gateway.is_online()
    }

    /// Debounced writes not yet persisted.
    #[must_use]
    pub fn pending_writes(&self) -> usize {
        self.inner.writes.pending_count()
    }

    /// The last user confirmed by the identity provider.
    #[must_use]
    pub fn current_user(&self) -> Option<String> {
        self.inner.last_user.read().clone()
    }
}

impl EngineInner {
    pub(super) fn set_state(&self, state: EngineState) {
        let _ = self.state.send(state);
        crate::metrics::set_engine_state(state.as_str());
    }

    /// [`resolve_user`](Self::resolve_user), shared with concurrent callers.
    pub(super) async fn confirmed_user(self: &Arc<Self>) -> Option<String> {
        let inner = Arc::clone(self);
        self.identities
            .get_or_fetch((), move || async move { inner.resolve_user().await })
            .await
    }

    /// Ask the identity provider who is signed in, handling a change of
    /// user. Falls back to the last confirmed user if the provider fails.
    pub(super) async fn resolve_user(&self) -> Option<String> {
        match self.identity.current_user().await {
            Ok(Some(user)) => {
                self.observe_user(&user).await;
                Some(user)
            }
            Ok(None) => None,
            Err(e) => {
                let fallback = self.last_user.read().clone();
                warn!(error = %e, fallback = ?fallback, "Identity lookup failed, using last known user");
                fallback
            }
        }
    }

    async fn observe_user(&self, user: &str) {
        let previous = {
            let mut last = self.last_user.write();
            if last.as_deref() == Some(user) {
                return;
            }
            last.replace(user.to_string())
        };

        if *self.state_rx.borrow() == EngineState::SignedOut {
            self.set_state(EngineState::Running);
        }
        if let Some(previous) = previous {
            info!(from = %previous, to = %user, "Signed-in user changed");
            self.forget_user(&previous).await;
        }
    }

    /// Drop everything cached for `user_id`. Pending debounced writes carry
    /// their own key and still flush.
    pub(super) async fn forget_user(&self, user_id: &str) {
        let gateway = &self.gateway;
        gateway.cache.clear_memory();
        gateway
            .cache
            .invalidate(&Invalidation::Prefix(PreferenceKey::user_prefix(user_id)))
            .await;
        gateway.fetches.clear();
        gateway.breakers.clear_user(user_id);
        self.reads.clear();
        self.writes.forget_user(user_id);
    }
}
