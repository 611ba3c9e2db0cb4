use async_trait::async_trait;
use dashmap::DashMap;
use super::traits::{LocalStore, StorageError};

/// Ephemeral [`LocalStore`], optionally enforcing a per-value size ceiling
/// the way a browser-style small-object store would.
pub struct MemoryStore {
    data: DashMap<String, Vec<u8>>,
    max_value_bytes: Option<usize>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: DashMap::new(),
            max_value_bytes: None,
        }
    }

    /// Store that rejects values larger than `limit` bytes.
    #[must_use]
    pub fn with_limit(limit: usize) -> Self {
        Self {
            data: DashMap::new(),
            max_value_bytes: Some(limit),
        }
    }

    /// Get current item count
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    /// Clear all items
    pub fn clear(&self) {
        self.data.clear();
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LocalStore for MemoryStore {
    fn max_value_bytes(&self) -> Option<usize> {
        self.max_value_bytes
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.data.get(key).map(|r| r.value().clone()))
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        if let Some(limit) = self.max_value_bytes {
            if value.len() > limit {
                return Err(StorageError::TooLarge {
                    key: key.to_string(),
                    size: value.len(),
                    limit,
                });
            }
        }
        self.data.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.data.remove(key);
        Ok(())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        Ok(self
            .data
            .iter()
            .filter(|r| r.key().starts_with(prefix))
            .map(|r| r.key().clone())
            .collect())
    }

    async fn remove_prefix(&self, prefix: &str) -> Result<usize, StorageError> {
        let before = self.data.len();
        self.data.retain(|k, _| !k.starts_with(prefix));
        Ok(before - self.data.len())
    }
}
