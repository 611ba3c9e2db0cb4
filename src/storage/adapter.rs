//! Size-routed durable store.
//!
//! [`DurableStore`] puts a small-object KV backend and a large-object
//! backend behind the one [`LocalStore`] contract. Writes are routed by
//! payload size; reads check the small store first. A key lives in at most
//! one backend after a successful write: the copy in the other backend is
//! removed best effort.

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, warn};

use super::traits::{LocalStore, StorageError};

pub struct DurableStore {
    small: Arc<dyn LocalStore>,
    large: Arc<dyn LocalStore>,
    threshold: usize,
}

impl DurableStore {
    /// `threshold` is clamped to the small store's own ceiling, if it has one.
    pub fn new(small: Arc<dyn LocalStore>, large: Arc<dyn LocalStore>, threshold: usize) -> Self {
        let threshold = match small.max_value_bytes() {
            Some(limit) => threshold.min(limit),
            None => threshold,
        };
        Self { small, large, threshold }
    }

    #[must_use]
    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// The large-object backend (the offline queue lives here).
    #[must_use]
    pub fn large(&self) -> Arc<dyn LocalStore> {
        Arc::clone(&self.large)
    }

    #[must_use]
    pub fn routes_large(&self, len: usize) -> bool {
        len > self.threshold
    }
}

#[async_trait]
impl LocalStore for DurableStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        match self.small.get(key).await {
            Ok(Some(value)) => return Ok(Some(value)),
            Ok(None) => {}
            Err(e) => warn!(key = %key, error = %e, "Small-object read failed, trying large store"),
        }
        self.large.get(key).await
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        if !self.routes_large(value.len()) {
            match self.small.set(key, value).await {
                Ok(()) => {
                    if let Err(e) = self.large.remove(key).await {
                        debug!(key = %key, error = %e, "Stale large copy not removed");
                    }
                    return Ok(());
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "Small-object write failed, falling back to large store");
                }
            }
        }

        self.large.set(key, value).await?;
        if let Err(e) = self.small.remove(key).await {
            debug!(key = %key, error = %e, "Stale small copy not removed");
        }
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        let small = self.small.remove(key).await;
        let large = self.large.remove(key).await;
        small.and(large)
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let mut all: BTreeSet<String> = self.small.keys(prefix).await?.into_iter().collect();
        all.extend(self.large.keys(prefix).await?);
        Ok(all.into_iter().collect())
    }

    async fn remove_prefix(&self, prefix: &str) -> Result<usize, StorageError> {
        let small = self.small.remove_prefix(prefix).await?;
        let large = self.large.remove_prefix(prefix).await?;
        Ok(small + large)
    }
}
