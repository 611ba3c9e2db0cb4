//! Engine lifecycle: sign-out, user reset, teardown, offline queue replay.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cache::Invalidation;
use crate::error::SyncError;
use crate::key::PreferenceKey;
use crate::resilience::offline_queue::DrainReport;

use super::gateway::SerializedReplayer;
use super::{EngineInner, EngineState, PreferenceEngine};

impl PreferenceEngine {
    /// Flush pending writes, then drop every cached document and registry
    /// entry for the signed-in user.
    ///
    /// Writes that cannot be persisted right now stay in the offline queue
    /// and are replayed once connectivity returns.
    #[tracing::instrument(skip(self))]
    pub async fn clear_on_sign_out(&self) {
        let flushed = self.inner.writes.flush_pending().await;
        self.inner.gateway.bus.flush_now();

        let previous = self.inner.last_user.write().take();
        match previous {
            Some(user) => self.inner.forget_user(&user).await,
            None => {
                self.inner.gateway.cache.clear_memory();
                self.inner.reads.clear();
                self.inner.gateway.fetches.clear();
            }
        }
        self.inner.identities.clear();

        self.inner.writes.clear_history();
        self.inner.set_state(EngineState::SignedOut);
        info!(flushed, "Signed out, caches cleared");
    }

    /// Switch to `user_id` as if the identity provider had reported it.
    ///
    /// Pending writes of the previous user are flushed first.
    #[tracing::instrument(skip(self))]
    pub async fn reset_for_user(&self, user_id: &str) {
        self.inner.writes.flush_pending().await;

        let previous = self.inner.last_user.write().replace(user_id.to_string());
        if let Some(previous) = previous.filter(|p| p != user_id) {
            self.inner.forget_user(&previous).await;
        }
        // Same user: start from a clean memory tier anyway
        self.inner.gateway.cache.clear_memory();
        self.inner.identities.clear();
        self.inner.reads.clear();
        self.inner.gateway.fetches.clear();

        self.inner.set_state(EngineState::Running);
        info!(user = %user_id, "Engine reset for user");
    }

    /// Stop background work and flush what can be flushed.
    ///
    /// After teardown reads return defaults and saves fail with
    /// [`SyncError::TornDown`]. Idempotent.
    #[tracing::instrument(skip(self))]
    pub async fn teardown(&self) {
        if self.state() == EngineState::TornDown {
            return;
        }
        // Refuse new work first
        self.inner.set_state(EngineState::TornDown);

        if let Some(watcher) = self.inner.watcher.lock().take() {
            watcher.abort();
        }

        let flushed = self.inner.writes.flush_pending().await;
        self.inner.writes.cancel_all();
        self.inner.writes.clear_history();
        self.inner.gateway.bus.shutdown();
        self.inner.identities.clear();
        self.inner.reads.clear();
        self.inner.gateway.fetches.clear();

        info!(
            flushed,
            queued = self.inner.gateway.queue.len(),
            "Preference engine torn down"
        );
    }

    /// Replay queued writes now.
    ///
    /// Returns an empty report when offline, without touching the queue.
    pub async fn drain_offline_queue(&self) -> Result<DrainReport, SyncError> {
        self.inner.drain_queue().await
    }

    /// Spawn a task that drains the offline queue whenever connectivity
    /// comes back, and once at startup if already online with writes queued.
    ///
    /// Replaces any watcher spawned earlier. Stopped by [`teardown`](Self::teardown).
    pub fn spawn_connectivity_watcher(&self) {
        let weak = Arc::downgrade(&self.inner);
        let mut connectivity = self.inner.gateway.connectivity.clone();

        let task = tokio::spawn(async move {
            let mut was_online = *connectivity.borrow_and_update();
            if was_online {
                if let Some(inner) = weak.upgrade() {
                    if inner.gateway.queue.has_pending() {
                        inner.drain_logged().await;
                    }
                }
            }

            while connectivity.changed().await.is_ok() {
                let online = *connectivity.borrow_and_update();
                if online && !was_online {
                    let Some(inner) = weak.upgrade() else {
                        break;
                    };
                    info!("Connectivity restored, draining offline queue");
                    inner.drain_logged().await;
                } else if !online && was_online {
                    warn!("Connectivity lost, writes will be queued");
                }
                was_online = online;
            }
            debug!("Connectivity watcher stopped");
        });

        if let Some(previous) = self.inner.watcher.lock().replace(task.abort_handle()) {
            previous.abort();
        }
    }

    /// Drop the cached copy of one document without touching the remote store.
    pub async fn invalidate(&self, key: &PreferenceKey) {
        self.inner
            .gateway
            .cache
            .invalidate(&Invalidation::Key(key.clone()))
            .await;
    }
}

impl EngineInner {
    async fn drain_queue(&self) -> Result<DrainReport, SyncError> {
        let gateway = &self.gateway;
        if !gateway.is_online() {
            debug!(pending = gateway.queue.len(), "Offline, queue drain deferred");
            return Ok(DrainReport {
                remaining: gateway.queue.len(),
                ..Default::default()
            });
        }
        let replayer = SerializedReplayer {
            gateway: gateway.as_ref(),
            writes: &self.writes,
        };
        Ok(gateway.queue.drain(&replayer).await?)
    }

    async fn drain_logged(&self) {
        match self.drain_queue().await {
            Ok(report) if report.failed > 0 => {
                warn!(failed = report.failed, remaining = report.remaining, "Offline queue drain incomplete");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Offline queue drain failed"),
        }
    }
}
