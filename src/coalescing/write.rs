// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Write coalescing: debounced and critical persists with one writer per key.
//!
//! # Debounced writes
//!
//! Each schedule stores the latest snapshot for the key and restarts the
//! key's timer (the previous timer task is aborted). When a timer fires it
//! takes the snapshot present *at fire time*, but only if the pending entry
//! still carries that timer's generation, and persists it once. Five rapid
//! saves therefore produce one remote write carrying the fifth document.
//!
//! # Critical writes
//!
//! Persist immediately, serialized behind any in-flight write for the same
//! key through a per-key async mutex. If the write ahead of it already
//! persisted an equal document no second call is made. A successful critical
//! write cancels any debounced snapshot that was pending when it started.
//!
//! # Ordering
//!
//! Every snapshot carries the generation it was scheduled with. Under the
//! key's lock, a snapshot older than the newest one already attempted for
//! that key is dropped, so a debounced timer that lost the race for the lock
//! never lands after a newer critical write. Queued replays run under the
//! same lock via [`WriteCoalescer::serialize`].
//!
//! # Flushing
//!
//! [`WriteCoalescer::flush_pending`] persists every pending snapshot now;
//! used on sign-out and teardown.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::error::SyncError;
use crate::key::PreferenceKey;
use crate::preference::PreferenceDocument;

/// Destination of coalesced writes.
#[async_trait]
pub trait WriteSink: Send + Sync {
    async fn persist(&self, key: &PreferenceKey, document: &PreferenceDocument) -> Result<(), SyncError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteUrgency {
    Debounced,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Snapshot stored; a timer will persist it
    Scheduled,
    /// Remote write completed
    Persisted,
    /// An equal document had just been persisted; no call made
    AlreadyPersisted,
    /// A newer snapshot for the key was written first; no call made
    Superseded,
}

struct PendingWrite {
    document: PreferenceDocument,
    generation: u64,
    abort: AbortHandle,
}

/// Newest snapshot attempted for a key.
struct LastWrite {
    generation: u64,
    /// Set only when that attempt succeeded
    payload: Option<Value>,
}

struct Inner {
    sink: Arc<dyn WriteSink>,
    debounce: Duration,
    pending: DashMap<PreferenceKey, PendingWrite>,
    /// Present only while a write for the key holds or awaits the lock
    key_locks: DashMap<PreferenceKey, Arc<Mutex<()>>>,
    last_written: DashMap<PreferenceKey, LastWrite>,
    next_generation: AtomicU64,
    persist_calls: AtomicU64,
}

#[derive(Clone)]
pub struct WriteCoalescer {
    inner: Arc<Inner>,
}

impl WriteCoalescer {
    pub fn new(sink: Arc<dyn WriteSink>, debounce: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                sink,
                debounce,
                pending: DashMap::new(),
                key_locks: DashMap::new(),
                last_written: DashMap::new(),
                next_generation: AtomicU64::new(0),
                persist_calls: AtomicU64::new(0),
            }),
        }
    }

    pub async fn schedule(
        &self,
        key: &PreferenceKey,
        document: PreferenceDocument,
        urgency: WriteUrgency,
    ) -> Result<WriteOutcome, SyncError> {
        match urgency {
            WriteUrgency::Debounced => {
                self.schedule_debounced(key, document);
                Ok(WriteOutcome::Scheduled)
            }
            WriteUrgency::Critical => self.persist_critical(key, &document).await,
        }
    }

    fn schedule_debounced(&self, key: &PreferenceKey, document: PreferenceDocument) {
        let generation = self.inner.next_generation.fetch_add(1, Ordering::AcqRel);

        // Spawn while holding the entry so the timer can never observe the
        // map before its own snapshot is in it.
        match self.inner.pending.entry(key.clone()) {
            Entry::Occupied(mut existing) => {
                existing.get().abort.abort();
                let abort = self.spawn_timer(key.clone(), generation);
                existing.insert(PendingWrite {
                    document,
                    generation,
                    abort,
                });
                crate::metrics::record_coalesced_write();
                debug!(key = %key, generation, "Debounced write replaced pending snapshot");
            }
            Entry::Vacant(slot) => {
                let abort = self.spawn_timer(key.clone(), generation);
                slot.insert(PendingWrite {
                    document,
                    generation,
                    abort,
                });
                debug!(key = %key, generation, "Debounced write scheduled");
            }
        }
    }

    fn spawn_timer(&self, key: PreferenceKey, generation: u64) -> AbortHandle {
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(inner.debounce).await;
            let Some((key, pending)) = inner
                .pending
                .remove_if(&key, |_, p| p.generation == generation)
            else {
                return;
            };
            if let Err(e) = inner.persist_serialized(&key, &pending.document, generation).await {
                warn!(key = %key, error = %e, "Debounced write failed");
            }
        });
        handle.abort_handle()
    }

    async fn persist_critical(
        &self,
        key: &PreferenceKey,
        document: &PreferenceDocument,
    ) -> Result<WriteOutcome, SyncError> {
        let generation = self.inner.next_generation.fetch_add(1, Ordering::AcqRel);
        let outcome = self.inner.persist_serialized(key, document, generation).await?;

        // Anything scheduled before this write started is superseded by it
        if let Some((_, cancelled)) = self
            .inner
            .pending
            .remove_if(key, |_, p| p.generation < generation)
        {
            cancelled.abort.abort();
            debug!(key = %key, "Critical write cancelled pending debounced write");
        }
        Ok(outcome)
    }

    /// Persist every pending debounced snapshot now. Returns how many were
    /// attempted; failures are logged (and queued by the sink).
    pub async fn flush_pending(&self) -> usize {
        let keys: Vec<PreferenceKey> = self.inner.pending.iter().map(|e| e.key().clone()).collect();
        let mut flushed = 0;

        for key in keys {
            let Some((key, pending)) = self.inner.pending.remove(&key) else {
                continue;
            };
            pending.abort.abort();
            flushed += 1;
            if let Err(e) = self
                .inner
                .persist_serialized(&key, &pending.document, pending.generation)
                .await
            {
                warn!(key = %key, error = %e, "Flushed write failed");
            }
        }
        flushed
    }

    /// Drop pending snapshots without persisting them.
    pub fn cancel_all(&self) {
        self.inner.pending.retain(|_, p| {
            p.abort.abort();
            false
        });
    }

    /// Run `op` under the write lock of `key`, so it never overlaps a
    /// coalesced write of the same key.
    ///
    /// Used for queue replays. The remote copy may change underneath, so the
    /// key's persisted snapshot is forgotten afterwards.
    pub async fn serialize<T>(&self, key: &PreferenceKey, op: impl Future<Output = T>) -> T {
        let lock = self.inner.lock_for(key);
        let output = {
            let _guard = lock.lock().await;
            let output = op.await;
            if let Some(mut last) = self.inner.last_written.get_mut(key) {
                last.payload = None;
            }
            output
        };
        drop(lock);
        self.inner.release_lock(key);
        output
    }

    /// Forget persisted snapshots for `user_id`. Pending writes are kept.
    pub fn forget_user(&self, user_id: &str) {
        self.inner.last_written.retain(|k, _| k.user_id != user_id);
    }

    /// Forget every persisted snapshot and idle key lock.
    pub fn clear_history(&self) {
        self.inner.last_written.clear();
        self.inner.key_locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    /// Keys with a write holding or awaiting their lock.
    #[must_use]
    pub fn locked_keys(&self) -> usize {
        self.inner.key_locks.len()
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    #[must_use]
    pub fn has_pending(&self, key: &PreferenceKey) -> bool {
        self.inner.pending.contains_key(key)
    }

    /// Total calls made to the sink.
    #[must_use]
    pub fn persist_calls(&self) -> u64 {
        self.inner.persist_calls.load(Ordering::Relaxed)
    }
}

impl Inner {
    fn lock_for(&self, key: &PreferenceKey) -> Arc<Mutex<()>> {
        self.key_locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop the key's lock once no other writer holds a handle to it.
    fn release_lock(&self, key: &PreferenceKey) {
        self.key_locks.remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
    }

    async fn persist_serialized(
        &self,
        key: &PreferenceKey,
        document: &PreferenceDocument,
        generation: u64,
    ) -> Result<WriteOutcome, SyncError> {
        let lock = self.lock_for(key);
        let outcome = {
            let _guard = lock.lock().await;
            self.persist_locked(key, document, generation).await
        };
        drop(lock);
        self.release_lock(key);
        outcome
    }

    async fn persist_locked(
        &self,
        key: &PreferenceKey,
        document: &PreferenceDocument,
        generation: u64,
    ) -> Result<WriteOutcome, SyncError> {
        if let Some(mut last) = self.last_written.get_mut(key) {
            if last.generation > generation {
                debug!(key = %key, generation, newer = last.generation, "Snapshot superseded, skipping");
                return Ok(WriteOutcome::Superseded);
            }
            if last.payload.as_ref() == Some(&document.payload) {
                last.generation = generation;
                debug!(key = %key, "Equal document already persisted, skipping");
                return Ok(WriteOutcome::AlreadyPersisted);
            }
        }

        self.persist_calls.fetch_add(1, Ordering::Relaxed);
        let result = self.sink.persist(key, document).await;
        // A failed attempt still counts: its document was queued, and
        // anything older must not overwrite it
        let payload = result.as_ref().ok().map(|()| document.payload.clone());
        self.last_written.insert(key.clone(), LastWrite { generation, payload });
        result.map(|()| WriteOutcome::Persisted)
    }
}
