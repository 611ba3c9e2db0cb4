//! Breaker- and connectivity-gated access to the remote store.
//!
//! Every remote call the engine makes goes through [`RemoteGateway`]:
//!
//! ```text
//! fetch:   coalesce(key) → online? → breaker → remote → classify → cache + notify
//! persist: online? → breaker → remote → classify → (queue on replayable failure)
//! replay:  key lock → still queued? → online? → breaker → remote → classify
//! ```
//!
//! A breaker transition to open invalidates the cache for that user+type.
//! A successful live persist drops the key's older queued writes.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::cache::{CacheHierarchy, Invalidation};
use crate::coalescing::request::RequestCoalescer;
use crate::coalescing::write::{WriteCoalescer, WriteSink};
use crate::error::SyncError;
use crate::key::PreferenceKey;
use crate::merge::{self, ReconcileMode};
use crate::notify::{ChangeBus, ChangeEvent, ChangeSource};
use crate::preference::PreferenceDocument;
use crate::remote::{ErrorClass, RemoteStore};
use crate::resilience::circuit_breaker::{BreakerRegistry, BreakerTransition};
use crate::resilience::offline_queue::{
    OfflineQueue, QueueOperation, QueueReplayer, ReplayOutcome, SyncQueueEntry,
};

type FetchResult = Result<PreferenceDocument, SyncError>;

pub(crate) struct RemoteGateway {
    remote: Arc<dyn RemoteStore>,
    pub(crate) breakers: BreakerRegistry,
    pub(crate) cache: CacheHierarchy,
    pub(crate) queue: OfflineQueue,
    pub(crate) bus: ChangeBus,
    pub(crate) fetches: RequestCoalescer<PreferenceKey, FetchResult>,
    pub(crate) connectivity: watch::Receiver<bool>,
}

impl RemoteGateway {
    pub(crate) fn new(
        remote: Arc<dyn RemoteStore>,
        breakers: BreakerRegistry,
        cache: CacheHierarchy,
        queue: OfflineQueue,
        bus: ChangeBus,
        connectivity: watch::Receiver<bool>,
    ) -> Self {
        Self {
            remote,
            breakers,
            cache,
            queue,
            bus,
            fetches: RequestCoalescer::new(),
            connectivity,
        }
    }

    pub(crate) fn is_online(&self) -> bool {
        *self.connectivity.borrow()
    }

    /// Fetch `key` from the remote store, sharing the call with any
    /// concurrent fetch of the same key.
    ///
    /// A missing document resolves to the type's defaults. Either way the
    /// result is written to both cache tiers and announced on the bus.
    pub(crate) async fn fetch(self: &Arc<Self>, key: &PreferenceKey) -> FetchResult {
        let gateway = Arc::clone(self);
        let owned = key.clone();
        self.fetches
            .get_or_fetch(key.clone(), move || async move { gateway.fetch_uncoalesced(&owned).await })
            .await
    }

    async fn fetch_uncoalesced(&self, key: &PreferenceKey) -> FetchResult {
        self.admit(key)?;

        let start = Instant::now();
        let result = self
            .remote
            .fetch_document(&key.user_id, key.pref_type, key.scope())
            .await;
        crate::metrics::record_remote_latency("fetch", start.elapsed());

        let payload = match result {
            Ok(Some(payload)) => {
                self.record_outcome(key, "fetch", None).await;
                Some(payload)
            }
            Ok(None) => {
                self.record_outcome(key, "fetch", Some(ErrorClass::DocumentNotFound)).await;
                None
            }
            Err(e) => {
                let class = e.classify();
                self.record_outcome(key, "fetch", Some(class)).await;
                if class != ErrorClass::DocumentNotFound {
                    debug!(key = %key, error = %e, class = class.as_str(), "Remote fetch failed");
                    return Err(SyncError::Remote(e));
                }
                None
            }
        };

        let document = match payload {
            Some(payload) => PreferenceDocument::new(normalize(key, &payload)),
            None => {
                debug!(key = %key, "No remote document, caching defaults");
                PreferenceDocument::defaults(key.pref_type)
            }
        };

        self.cache.write(key, &document).await;
        self.bus.notify(ChangeEvent {
            user_id: key.user_id.clone(),
            pref_type: key.pref_type,
            scope: key.scope.clone(),
            document: document.clone(),
            source: ChangeSource::Remote,
        });
        Ok(document)
    }

    /// Refuse the call up front when offline or when the breaker is open.
    fn admit(&self, key: &PreferenceKey) -> Result<(), SyncError> {
        if !self.is_online() {
            return Err(SyncError::Offline { key: key.cache_key() });
        }
        if self.breakers.is_open(key) {
            debug!(key = %key, "Circuit open, remote call refused");
            return Err(SyncError::CircuitOpen { key: key.cache_key() });
        }
        crate::metrics::record_circuit_call("allowed");
        Ok(())
    }

    /// Feed one remote outcome into the breaker. `None` is success.
    async fn record_outcome(&self, key: &PreferenceKey, op: &str, failure: Option<ErrorClass>) {
        let transition = match failure {
            None => {
                crate::metrics::record_remote_operation(op, "ok");
                self.breakers.record_success(key)
            }
            Some(class) if !class.counts_as_failure() => {
                crate::metrics::record_remote_operation(op, class.as_str());
                self.breakers.record_success(key)
            }
            Some(class) => {
                crate::metrics::record_remote_operation(op, class.as_str());
                self.breakers.record_failure(key, class)
            }
        };
        crate::metrics::set_open_breakers(self.breakers.open_count());

        if transition == BreakerTransition::Opened {
            warn!(key = %key, "Circuit opened, invalidating cached documents of this type");
            self.cache
                .invalidate(&Invalidation::Prefix(key.type_prefix()))
                .await;
        }
    }

    /// One gated persist, no queueing.
    async fn persist_remote(&self, key: &PreferenceKey, document: &PreferenceDocument) -> Result<(), SyncError> {
        self.admit(key)?;

        let start = Instant::now();
        let result = self
            .remote
            .persist_document(
                &key.user_id,
                key.pref_type,
                key.scope(),
                &document.payload,
                document.updated_at,
            )
            .await;
        crate::metrics::record_remote_latency("persist", start.elapsed());

        match result {
            Ok(()) => {
                self.record_outcome(key, "persist", None).await;
                Ok(())
            }
            Err(e) => {
                self.record_outcome(key, "persist", Some(e.classify())).await;
                Err(SyncError::Remote(e))
            }
        }
    }

    async fn enqueue(&self, key: &PreferenceKey, payload: &Value) -> Result<(), SyncError> {
        match self.queue.enqueue(key, payload, QueueOperation::Save).await {
            Ok(entry) => {
                warn!(key = %key, id = %entry.id, "Write queued for replay");
                Ok(())
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to queue write");
                Err(e.into())
            }
        }
    }
}

#[async_trait]
impl WriteSink for RemoteGateway {
    async fn persist(&self, key: &PreferenceKey, document: &PreferenceDocument) -> Result<(), SyncError> {
        match self.persist_remote(key, document).await {
            Ok(()) => {
                // Runs under the key's write lock: every queued entry for
                // the key is older than this document
                if self.queue.has_pending() {
                    self.queue.remove_key(key).await;
                }
                Ok(())
            }
            Err(err) => {
                let replayable = match &err {
                    SyncError::Remote(e) => e.classify().is_replayable(),
                    SyncError::Offline { .. } | SyncError::CircuitOpen { .. } => true,
                    _ => false,
                };
                if replayable {
                    self.enqueue(key, &document.payload).await?;
                } else {
                    warn!(key = %key, error = %err, "Write rejected by remote, not queued");
                }
                Err(err)
            }
        }
    }
}

/// Replays queued writes under the write coalescer's per-key lock, so a
/// replay never overlaps a live write of the same key.
pub(crate) struct SerializedReplayer<'a> {
    pub(crate) gateway: &'a RemoteGateway,
    pub(crate) writes: &'a WriteCoalescer,
}

#[async_trait]
impl<'a> QueueReplayer for SerializedReplayer<'a> {
    async fn replay(&self, entry: &SyncQueueEntry) -> Result<ReplayOutcome, SyncError> {
        let gateway = self.gateway;
        self.writes
            .serialize(&entry.key, async {
                // Dropped while waiting for the lock by a newer live write
                if !gateway.queue.contains(&entry.id) {
                    return Ok(ReplayOutcome::Superseded);
                }
                let document = PreferenceDocument {
                    payload: entry.payload.clone(),
                    updated_at: entry.enqueued_at,
                };
                gateway
                    .persist_remote(&entry.key, &document)
                    .await
                    .map(|()| ReplayOutcome::Replayed)
            })
            .await
    }
}

/// Fill a remote document out to the full shape of its type.
fn normalize(key: &PreferenceKey, payload: &Value) -> Value {
    merge::reconcile(key.pref_type, Some(payload), &json!({}), ReconcileMode::Merge).document
}
