//! Consumer API: reads, saves, change listeners, health.

use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::cache::CacheTier;
use crate::coalescing::write::{WriteOutcome, WriteUrgency};
use crate::error::SyncError;
use crate::key::PreferenceKey;
use crate::merge;
use crate::notify::{ChangeEvent, ChangeSource, ListenerId};
use crate::preference::{PreferenceDocument, PreferenceType};

use super::{
    EngineHealth, EngineInner, EngineState, GetOptions, HealthStatus, PreferenceEngine, SaveOptions,
    SaveOutcome,
};

impl PreferenceEngine {
    // ═══════════════════════════════════════════════════════════════════════════
    // API: Reads
    // ═══════════════════════════════════════════════════════════════════════════

    /// Get the document for `(signed-in user, pref_type, scope)`.
    ///
    /// Never fails. Resolution order:
    /// 1. fresh cache hit (memory, then durable)
    /// 2. remote fetch (a missing document resolves to defaults)
    /// 3. stale cache hit
    /// 4. newest queued write for the key
    /// 5. the type's defaults
    ///
    /// Concurrent calls share one identity lookup, and calls for the same
    /// `(user, type, scope, bypass)` then share one read.
    #[tracing::instrument(skip(self), fields(pref_type = %pref_type))]
    pub async fn get_preferences(
        &self,
        pref_type: PreferenceType,
        scope: Option<&str>,
        options: GetOptions,
    ) -> PreferenceDocument {
        if self.state() == EngineState::TornDown {
            return PreferenceDocument::defaults(pref_type);
        }

        let Some(user) = self.inner.confirmed_user().await else {
            debug!(pref_type = %pref_type, "No signed-in user, returning defaults");
            crate::metrics::record_read_source("defaults");
            return PreferenceDocument::defaults(pref_type);
        };

        let key = PreferenceKey::new(user, pref_type, scope);
        let inner = Arc::clone(&self.inner);
        let read_key = (key.clone(), options.bypass_cache);
        self.inner
            .reads
            .get_or_fetch(read_key, move || async move { inner.read(&key, options.bypass_cache).await })
            .await
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // API: Saves
    // ═══════════════════════════════════════════════════════════════════════════

    /// Reconcile `update` against the current document and save the result.
    ///
    /// The reconciled document is cached and announced immediately. It is
    /// then persisted after the debounce window, or right away when
    /// `options.critical` is set or the update touches a critical field of
    /// the type.
    ///
    /// # Errors
    ///
    /// - [`SyncError::NotSignedIn`] if no user is signed in
    /// - [`SyncError::InvalidUpdate`] if `update` is not a JSON object
    /// - for critical saves, the persist failure (the write is queued when
    ///   it can be replayed)
    #[tracing::instrument(skip(self, update), fields(pref_type = %pref_type))]
    pub async fn save_preferences(
        &self,
        pref_type: PreferenceType,
        update: Value,
        scope: Option<&str>,
        options: SaveOptions,
    ) -> Result<SaveOutcome, SyncError> {
        if self.state() == EngineState::TornDown {
            return Err(SyncError::TornDown);
        }
        if !update.is_object() {
            return Err(SyncError::InvalidUpdate(format!(
                "{} update must be a JSON object",
                pref_type
            )));
        }

        let user = self.inner.confirmed_user().await.ok_or(SyncError::NotSignedIn)?;
        let key = PreferenceKey::new(user, pref_type, scope);
        let current = self.inner.current_document(&key).await;

        let reconciled = merge::reconcile(
            pref_type,
            current.as_ref().map(|d| &d.payload),
            &update,
            options.mode,
        );
        crate::metrics::record_reconcile(reconciled.mode.as_str(), reconciled.validated);
        if !reconciled.validated {
            warn!(key = %key, "Reconciled document failed validation, saved safe subset");
        }

        if let Some(current) = &current {
            if merge::documents_equal(&current.payload, &reconciled.document) {
                crate::metrics::record_unchanged_save();
                debug!(key = %key, "Save is a no-op, skipping");
                return Ok(SaveOutcome::Unchanged);
            }
        }

        let document = PreferenceDocument::new(reconciled.document);
        let gateway = &self.inner.gateway;
        gateway.cache.write(&key, &document).await;
        gateway.bus.notify(ChangeEvent {
            user_id: key.user_id.clone(),
            pref_type,
            scope: key.scope.clone(),
            document: document.clone(),
            source: ChangeSource::Local,
        });

        let urgency = if options.critical || pref_type.rules().touches_critical(&update) {
            WriteUrgency::Critical
        } else {
            WriteUrgency::Debounced
        };
        debug!(key = %key, mode = reconciled.mode.as_str(), urgency = ?urgency, "Saving preferences");

        match self.inner.writes.schedule(&key, document, urgency).await? {
            WriteOutcome::Scheduled => Ok(SaveOutcome::Scheduled),
            // Superseded: a newer document for the key was persisted first
            WriteOutcome::Persisted | WriteOutcome::AlreadyPersisted | WriteOutcome::Superseded => {
                Ok(SaveOutcome::Persisted)
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // API: Listeners & health
    // ═══════════════════════════════════════════════════════════════════════════

    /// Subscribe to document changes, local and remote. Listeners are called
    /// at most once per `(type, scope)` per notification tick.
    pub fn add_change_listener(&self, listener: impl Fn(&ChangeEvent) + Send + Sync + 'static) -> ListenerId {
        self.inner.gateway.bus.subscribe(listener)
    }

    /// Returns false if `id` was not subscribed.
    pub fn remove_change_listener(&self, id: ListenerId) -> bool {
        self.inner.gateway.bus.unsubscribe(id)
    }

    /// Engine health from cached state (no I/O).
    #[must_use]
    pub fn health(&self) -> EngineHealth {
        let gateway = &self.inner.gateway;
        let is_online = gateway.is_online();
        let open_breaker_count = gateway.breakers.open_count();
        let pending_queue_items = gateway.queue.len();

        let status = if !is_online {
            HealthStatus::Offline
        } else if open_breaker_count > 0 || pending_queue_items > 0 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        EngineHealth {
            status,
            cache_size: gateway.cache.len(),
            open_breaker_count,
            is_online,
            pending_queue_items,
            state: self.state(),
        }
    }
}

impl EngineInner {
    async fn read(&self, key: &PreferenceKey, bypass_cache: bool) -> PreferenceDocument {
        let gateway = &self.gateway;

        let cached = if bypass_cache {
            None
        } else {
            gateway.cache.read(key).await
        };

        if let Some(hit) = &cached {
            if hit.fresh {
                if hit.tier == CacheTier::Durable {
                    self.schedule_refresh(key);
                }
                crate::metrics::record_read_source("cache");
                return hit.document.clone();
            }
        }

        match gateway.fetch(key).await {
            Ok(document) => {
                crate::metrics::record_read_source("remote");
                return document;
            }
            Err(e) => debug!(key = %key, error = %e, "Remote read unavailable, falling back"),
        }

        let stale = match cached {
            Some(hit) => Some(hit),
            None if bypass_cache => gateway.cache.read(key).await,
            None => None,
        };
        if let Some(hit) = stale {
            crate::metrics::record_read_source("stale_cache");
            return hit.document;
        }

        match gateway.queue.latest_for(key).await {
            Ok(Some(payload)) => {
                crate::metrics::record_read_source("queue");
                return PreferenceDocument::new(payload);
            }
            Ok(None) => {}
            Err(e) => warn!(key = %key, error = %e, "Failed to read offline queue"),
        }

        crate::metrics::record_read_source("defaults");
        PreferenceDocument::defaults(key.pref_type)
    }

    /// Background refresh after a durable hit: online only, throttled per
    /// key, and skipped while a local write for the key is still pending.
    fn schedule_refresh(&self, key: &PreferenceKey) {
        let gateway = &self.gateway;
        if !gateway.is_online() || self.writes.has_pending(key) || gateway.queue.has_pending() {
            return;
        }
        if !gateway.cache.claim_refresh(key) {
            return;
        }

        let gateway = Arc::clone(gateway);
        let key = key.clone();
        tokio::spawn(async move {
            if let Err(e) = gateway.fetch(&key).await {
                debug!(key = %key, error = %e, "Background refresh failed");
            }
        });
    }

    /// The document a save reconciles against: whatever is cached (fresh or
    /// stale), else the newest queued write.
    async fn current_document(&self, key: &PreferenceKey) -> Option<PreferenceDocument> {
        let gateway = &self.gateway;
        if let Some(document) = gateway.cache.peek_memory(key) {
            return Some(document);
        }
        if let Some(hit) = gateway.cache.read(key).await {
            return Some(hit.document);
        }
        match gateway.queue.latest_for(key).await {
            Ok(payload) => payload.map(PreferenceDocument::new),
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to read offline queue");
                None
            }
        }
    }
}
