// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Two-tier preference cache.
//!
//! ```text
//! read:  memory (ttl) ──miss/stale──► durable (max age) ──► populate memory
//! write: memory (sync) ──► durable (best effort)
//! ```
//!
//! Stale hits are still returned, flagged `fresh = false`, so the engine can
//! fall back to them when the remote store is unreachable.
//!
//! Durable entries carry a SHA-256 checksum of their payload. A mismatch is
//! treated as corruption: the entry is deleted and reported as absent.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::config::PrefSyncConfig;
use crate::key::PreferenceKey;
use crate::preference::{epoch_millis, PreferenceDocument};
use crate::storage::traits::LocalStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheTier {
    Memory,
    Durable,
}

impl CacheTier {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Durable => "durable",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheHit {
    pub document: PreferenceDocument,
    pub tier: CacheTier,
    pub fresh: bool,
}

/// What to drop from both tiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invalidation {
    Key(PreferenceKey),
    /// Cache-key prefix, e.g. [`PreferenceKey::type_prefix`] or [`PreferenceKey::user_prefix`]
    Prefix(String),
}

struct MemoryEntry {
    document: PreferenceDocument,
    written_at: Instant,
}

/// On-disk form of a cached document.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct DurableEntry {
    key: String,
    payload: Value,
    updated_at: i64,
    /// Epoch millis
    written_at: i64,
    checksum: String,
}

fn checksum(payload: &Value) -> String {
    let bytes = serde_json::to_vec(payload).unwrap_or_default();
    hex::encode(Sha256::digest(&bytes))
}

pub struct CacheHierarchy {
    memory: DashMap<String, MemoryEntry>,
    durable: Arc<dyn LocalStore>,
    refresh_claims: DashMap<String, Instant>,
    memory_ttl: Duration,
    durable_max_age: Duration,
    refresh_throttle: Duration,
    durable_prefix: String,
}

impl CacheHierarchy {
    pub fn new(durable: Arc<dyn LocalStore>, config: &PrefSyncConfig) -> Self {
        Self {
            memory: DashMap::new(),
            durable,
            refresh_claims: DashMap::new(),
            memory_ttl: config.memory_ttl(),
            durable_max_age: config.durable_max_age(),
            refresh_throttle: config.refresh_throttle(),
            durable_prefix: config.cache_prefix.clone(),
        }
    }

    fn durable_key(&self, cache_key: &str) -> String {
        format!("{}{}", self.durable_prefix, cache_key)
    }

    /// Look `key` up in memory, then the durable tier.
    pub async fn read(&self, key: &PreferenceKey) -> Option<CacheHit> {
        let cache_key = key.cache_key();

        let stale_memory = match self.memory.get(&cache_key) {
            Some(entry) if entry.written_at.elapsed() < self.memory_ttl => {
                crate::metrics::record_cache_read("memory", "hit");
                debug!(key = %key, "Memory hit");
                return Some(CacheHit {
                    document: entry.document.clone(),
                    tier: CacheTier::Memory,
                    fresh: true,
                });
            }
            Some(entry) => Some(entry.document.clone()),
            None => None,
        };

        if let Some(entry) = self.read_durable(&cache_key).await {
            let age_ms = epoch_millis().saturating_sub(entry.written_at).max(0) as u128;
            let document = PreferenceDocument {
                payload: entry.payload,
                updated_at: entry.updated_at,
            };
            if age_ms <= self.durable_max_age.as_millis() {
                crate::metrics::record_cache_read("durable", "hit");
                debug!(key = %key, age_ms = age_ms as u64, "Durable hit, populating memory");
                self.populate_memory(cache_key, document.clone());
                return Some(CacheHit {
                    document,
                    tier: CacheTier::Durable,
                    fresh: true,
                });
            }
            if stale_memory.is_none() {
                crate::metrics::record_cache_read("durable", "stale");
                return Some(CacheHit {
                    document,
                    tier: CacheTier::Durable,
                    fresh: false,
                });
            }
        }

        match stale_memory {
            Some(document) => {
                crate::metrics::record_cache_read("memory", "stale");
                Some(CacheHit {
                    document,
                    tier: CacheTier::Memory,
                    fresh: false,
                })
            }
            None => {
                crate::metrics::record_cache_read("durable", "miss");
                None
            }
        }
    }

    /// Only the memory tier; never touches storage.
    #[must_use]
    pub fn peek_memory(&self, key: &PreferenceKey) -> Option<PreferenceDocument> {
        self.memory.get(&key.cache_key()).map(|e| e.document.clone())
    }

    async fn read_durable(&self, cache_key: &str) -> Option<DurableEntry> {
        let durable_key = self.durable_key(cache_key);
        let bytes = match self.durable.get(&durable_key).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(e) => {
                warn!(key = %cache_key, error = %e, "Durable read failed");
                return None;
            }
        };

        let entry = match serde_json::from_slice::<DurableEntry>(&bytes) {
            Ok(entry) => entry,
            Err(e) => {
                error!(key = %cache_key, error = %e, "Unreadable durable entry, deleting");
                self.discard_corrupt(cache_key, &durable_key).await;
                return None;
            }
        };

        let actual = checksum(&entry.payload);
        if entry.checksum != actual || entry.key != cache_key {
            error!(
                key = %cache_key,
                expected = %entry.checksum,
                actual = %actual,
                "Durable entry corruption detected, deleting"
            );
            self.discard_corrupt(cache_key, &durable_key).await;
            return None;
        }
        Some(entry)
    }

    async fn discard_corrupt(&self, cache_key: &str, durable_key: &str) {
        crate::metrics::record_corruption(cache_key);
        if let Err(e) = self.durable.remove(durable_key).await {
            warn!(key = %cache_key, error = %e, "Failed to delete corrupt durable entry");
        }
    }

    fn populate_memory(&self, cache_key: String, document: PreferenceDocument) {
        self.memory.insert(
            cache_key,
            MemoryEntry {
                document,
                written_at: Instant::now(),
            },
        );
        crate::metrics::set_memory_entries(self.memory.len());
    }

    /// Write both tiers. Durable failures are logged and swallowed.
    pub async fn write(&self, key: &PreferenceKey, document: &PreferenceDocument) {
        let cache_key = key.cache_key();
        self.populate_memory(cache_key.clone(), document.clone());

        let entry = DurableEntry {
            key: cache_key.clone(),
            checksum: checksum(&document.payload),
            payload: document.payload.clone(),
            updated_at: document.updated_at,
            written_at: epoch_millis(),
        };
        let bytes = match serde_json::to_vec(&entry) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(key = %key, error = %e, "Failed to serialize durable entry");
                return;
            }
        };
        if let Err(e) = self.durable.set(&self.durable_key(&cache_key), &bytes).await {
            crate::metrics::record_durable_write_failure();
            warn!(key = %key, error = %e, "Durable cache write failed");
        }
    }

    /// Claim the right to refresh `key` from the remote store. At most one
    /// claim succeeds per key per throttle window.
    pub fn claim_refresh(&self, key: &PreferenceKey) -> bool {
        let now = Instant::now();
        match self.refresh_claims.entry(key.cache_key()) {
            Entry::Occupied(mut claimed) => {
                if now.duration_since(*claimed.get()) < self.refresh_throttle {
                    false
                } else {
                    claimed.insert(now);
                    true
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(now);
                true
            }
        }
    }

    pub async fn invalidate(&self, invalidation: &Invalidation) {
        match invalidation {
            Invalidation::Key(key) => {
                let cache_key = key.cache_key();
                self.memory.remove(&cache_key);
                self.refresh_claims.remove(&cache_key);
                if let Err(e) = self.durable.remove(&self.durable_key(&cache_key)).await {
                    warn!(key = %key, error = %e, "Durable invalidation failed");
                }
                debug!(key = %key, "Cache entry invalidated");
            }
            Invalidation::Prefix(prefix) => {
                self.memory.retain(|k, _| !k.starts_with(prefix.as_str()));
                self.refresh_claims.retain(|k, _| !k.starts_with(prefix.as_str()));
                match self.durable.remove_prefix(&self.durable_key(prefix)).await {
                    Ok(removed) => debug!(prefix = %prefix, removed, "Cache prefix invalidated"),
                    Err(e) => warn!(prefix = %prefix, error = %e, "Durable prefix invalidation failed"),
                }
            }
        }
        crate::metrics::set_memory_entries(self.memory.len());
    }

    /// Drop the whole memory tier and all refresh claims.
    pub fn clear_memory(&self) {
        self.memory.clear();
        self.refresh_claims.clear();
        crate::metrics::set_memory_entries(0);
    }

    /// Memory tier entry count.
    #[must_use]
    pub fn len(&self) -> usize {
        self.memory.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.memory.is_empty()
    }
}
