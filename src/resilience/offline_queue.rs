//! Offline sync queue.
//!
//! When a remote write cannot be attempted (offline, breaker open) or fails
//! transiently, the document is appended here. Entries are JSON blobs in the
//! large-object store under:
//!
//! ```text
//! {prefix}{enqueued_at:013}-{sequence:010}-{cache_key}
//! ```
//!
//! so a restart recovers both the entries and their order. A drain replays
//! them oldest first and removes each one only after its replay succeeds.
//!
//! This is NOT a cache tier. Entries are writes "in flight" to the remote
//! store, not a place documents are read from (except as a last-resort read
//! fallback, see [`OfflineQueue::latest_for`]).

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::error::SyncError;
use crate::key::PreferenceKey;
use crate::preference::epoch_millis;
use crate::storage::traits::{LocalStore, StorageError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueOperation {
    /// Persist the payload as the full document
    Save,
}

/// One queued write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncQueueEntry {
    pub id: String,
    pub key: PreferenceKey,
    pub payload: Value,
    pub operation: QueueOperation,
    /// Epoch millis
    pub enqueued_at: i64,
    /// Tie-breaker for entries enqueued in the same millisecond
    pub sequence: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayOutcome {
    /// Written to the remote store
    Replayed,
    /// A newer write for the key already reached the remote store
    Superseded,
}

/// Replays one queued entry against the remote store.
#[async_trait]
pub trait QueueReplayer: Send + Sync {
    async fn replay(&self, entry: &SyncQueueEntry) -> Result<ReplayOutcome, SyncError>;
}

/// Outcome of one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Replayed and removed
    pub replayed: usize,
    /// Dropped because a newer write for the key was persisted first
    pub superseded: usize,
    /// Replay failed, entry kept
    pub failed: usize,
    /// Not attempted: an older entry for the same key failed this pass
    pub skipped: usize,
    /// Rejected as never-replayable and removed
    pub discarded: usize,
    /// Entries left after the pass
    pub remaining: usize,
    /// Another drain was already running; nothing was attempted
    pub already_draining: bool,
}

/// Queue state for observability
#[derive(Debug, Clone, Copy)]
pub struct QueueStats {
    /// Number of entries currently queued
    pub pending_items: u64,
    /// Total entries enqueued since startup
    pub total_enqueued: u64,
    /// Total entries replayed since startup
    pub total_replayed: u64,
    /// Whether drain is currently in progress
    pub draining: bool,
}

pub struct OfflineQueue {
    store: Arc<dyn LocalStore>,
    prefix: String,
    max_items: usize,
    /// Next sequence number
    sequence: AtomicU64,
    /// Ids of entries pending replay
    index: DashMap<String, PreferenceKey>,
    total_enqueued: AtomicU64,
    total_replayed: AtomicU64,
    draining: AtomicBool,
}

impl OfflineQueue {
    /// Open the queue over `store`, recovering entries from a previous run.
    pub async fn open(
        store: Arc<dyn LocalStore>,
        prefix: impl Into<String>,
        max_items: usize,
    ) -> Result<Self, StorageError> {
        let prefix = prefix.into();
        let queue = Self {
            store,
            prefix,
            max_items,
            sequence: AtomicU64::new(0),
            index: DashMap::new(),
            total_enqueued: AtomicU64::new(0),
            total_replayed: AtomicU64::new(0),
            draining: AtomicBool::new(false),
        };

        let existing = queue.entries().await?;
        if !existing.is_empty() {
            warn!(pending = existing.len(), "Offline queue has entries from previous run, will drain");
        }
        let next_seq = existing.iter().map(|e| e.sequence + 1).max().unwrap_or(0);
        queue.sequence.store(next_seq, Ordering::Release);
        for entry in &existing {
            queue.index.insert(entry.id.clone(), entry.key.clone());
        }
        crate::metrics::set_queue_depth(existing.len());

        Ok(queue)
    }

    fn storage_key(&self, id: &str) -> String {
        format!("{}{}", self.prefix, id)
    }

    /// Append a write.
    pub async fn enqueue(
        &self,
        key: &PreferenceKey,
        payload: &Value,
        operation: QueueOperation,
    ) -> Result<SyncQueueEntry, StorageError> {
        let pending = self.index.len();
        if pending >= self.max_items {
            crate::metrics::record_enqueue("full");
            return Err(StorageError::QueueFull {
                pending,
                max: self.max_items,
            });
        }

        let enqueued_at = epoch_millis();
        let sequence = self.sequence.fetch_add(1, Ordering::AcqRel);
        let id = format!("{:013}-{:010}-{}", enqueued_at, sequence, key.cache_key());
        let entry = SyncQueueEntry {
            id,
            key: key.clone(),
            payload: payload.clone(),
            operation,
            enqueued_at,
            sequence,
        };

        let bytes = serde_json::to_vec(&entry)?;
        // Indexed before it is stored so a drain never sees an unindexed entry
        self.index.insert(entry.id.clone(), key.clone());
        if let Err(e) = self.store.set(&self.storage_key(&entry.id), &bytes).await {
            self.index.remove(&entry.id);
            return Err(e);
        }
        self.total_enqueued.fetch_add(1, Ordering::Relaxed);

        let pending = self.len();
        crate::metrics::record_enqueue("queued");
        crate::metrics::set_queue_depth(pending);
        debug!(key = %key, id = %entry.id, pending, "Write queued for replay");

        Ok(entry)
    }

    /// All queued entries, oldest first. Unreadable entries are dropped.
    pub async fn entries(&self) -> Result<Vec<SyncQueueEntry>, StorageError> {
        let keys = self.store.keys(&self.prefix).await?;
        let mut entries = Vec::with_capacity(keys.len());

        for storage_key in keys {
            let Some(bytes) = self.store.get(&storage_key).await? else {
                continue;
            };
            match serde_json::from_slice::<SyncQueueEntry>(&bytes) {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    error!(key = %storage_key, error = %e, "Dropping unreadable queue entry");
                    crate::metrics::record_corruption(&storage_key);
                    self.store.remove(&storage_key).await?;
                }
            }
        }

        entries.sort_by(|a, b| (a.enqueued_at, a.sequence).cmp(&(b.enqueued_at, b.sequence)));
        Ok(entries)
    }

    /// Newest queued payload for `key`, if any.
    pub async fn latest_for(&self, key: &PreferenceKey) -> Result<Option<Value>, StorageError> {
        if !self.has_pending() {
            return Ok(None);
        }
        Ok(self
            .entries()
            .await?
            .into_iter()
            .filter(|e| &e.key == key)
            .last()
            .map(|e| e.payload))
    }

    /// Whether entry `id` is still queued.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Drop every queued entry for `key`. Called once a newer write for the
    /// key has been persisted. Returns how many were removed.
    pub async fn remove_key(&self, key: &PreferenceKey) -> usize {
        let ids: Vec<String> = self
            .index
            .iter()
            .filter(|e| e.value() == key)
            .map(|e| e.key().clone())
            .collect();
        for id in &ids {
            self.remove_id(id).await;
        }
        if !ids.is_empty() {
            crate::metrics::set_queue_depth(self.len());
            debug!(key = %key, dropped = ids.len(), "Queued writes superseded by a newer write");
        }
        ids.len()
    }

    /// Check if the queue has entries to drain.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        !self.index.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        !self.has_pending()
    }

    /// Get current stats.
    #[must_use]
    pub fn stats(&self) -> QueueStats {
        QueueStats {
            pending_items: self.len() as u64,
            total_enqueued: self.total_enqueued.load(Ordering::Relaxed),
            total_replayed: self.total_replayed.load(Ordering::Relaxed),
            draining: self.draining.load(Ordering::Acquire),
        }
    }

    /// Replay queued entries oldest first.
    ///
    /// A failed entry stays queued, and later entries for the same key are
    /// skipped for the rest of this pass so an older write never lands after
    /// a newer one. Entries the remote rejects as never-replayable are
    /// removed.
    pub async fn drain(&self, replayer: &dyn QueueReplayer) -> Result<DrainReport, StorageError> {
        if self.draining.swap(true, Ordering::AcqRel) {
            return Ok(DrainReport {
                already_draining: true,
                remaining: self.len(),
                ..Default::default()
            });
        }

        let _guard = DrainGuard(&self.draining);

        let entries = self.entries().await?;
        if entries.is_empty() {
            return Ok(DrainReport::default());
        }

        info!(pending = entries.len(), "Starting offline queue drain");

        let mut report = DrainReport::default();
        let mut blocked: HashSet<PreferenceKey> = HashSet::new();

        for entry in &entries {
            if blocked.contains(&entry.key) {
                report.skipped += 1;
                continue;
            }

            match replayer.replay(entry).await {
                Ok(ReplayOutcome::Replayed) => {
                    self.remove_id(&entry.id).await;
                    report.replayed += 1;
                    self.total_replayed.fetch_add(1, Ordering::Relaxed);
                    debug!(key = %entry.key, id = %entry.id, "Queued write replayed");
                }
                Ok(ReplayOutcome::Superseded) => {
                    self.remove_id(&entry.id).await;
                    report.superseded += 1;
                    debug!(key = %entry.key, id = %entry.id, "Queued write superseded, not replayed");
                }
                Err(SyncError::Remote(e)) if !e.classify().is_replayable() => {
                    warn!(key = %entry.key, id = %entry.id, error = %e, "Discarding queued write rejected by remote");
                    self.remove_id(&entry.id).await;
                    report.discarded += 1;
                }
                Err(e) => {
                    warn!(key = %entry.key, id = %entry.id, error = %e, "Queued write replay failed");
                    report.failed += 1;
                    blocked.insert(entry.key.clone());
                }
            }
        }

        report.remaining = self.len();
        crate::metrics::record_queue_drain(report.replayed, report.failed);
        crate::metrics::set_queue_depth(report.remaining);
        info!(
            replayed = report.replayed,
            superseded = report.superseded,
            failed = report.failed,
            skipped = report.skipped,
            discarded = report.discarded,
            remaining = report.remaining,
            "Offline queue drain complete"
        );

        Ok(report)
    }

    async fn remove_id(&self, id: &str) {
        match self.store.remove(&self.storage_key(id)).await {
            Ok(()) => {
                self.index.remove(id);
            }
            // Replayed twice at worst; last-write-wins on the remote
            Err(e) => error!(id = %id, error = %e, "Failed to remove queue entry"),
        }
    }
}

/// RAII guard to reset draining flag.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
