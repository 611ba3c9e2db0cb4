use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Value for '{key}' too large: {size} bytes (max {limit})")]
    TooLarge {
        key: String,
        size: usize,
        limit: usize,
    },
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Data corruption detected for '{key}': expected checksum {expected}, got {actual}")]
    Corruption {
        key: String,
        expected: String,
        actual: String,
    },
    #[error("Offline queue full: {pending} entries (max {max})")]
    QueueFull { pending: usize, max: usize },
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Unordered string-keyed durable storage.
///
/// Both local backends (the small-object KV store and the large-object
/// store) implement this one contract; [`super::adapter::DurableStore`]
/// picks between them by payload size.
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Hard per-value ceiling, if the platform imposes one.
    fn max_value_bytes(&self) -> Option<usize> {
        None
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;
    async fn set(&self, key: &str, value: &[u8]) -> Result<(), StorageError>;
    async fn remove(&self, key: &str) -> Result<(), StorageError>;

    /// All keys starting with `prefix`, in no particular order.
    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

    /// Remove every key starting with `prefix`. Returns how many were removed.
    /// Default implementation lists then removes one by one.
    async fn remove_prefix(&self, prefix: &str) -> Result<usize, StorageError> {
        let keys = self.keys(prefix).await?;
        for key in &keys {
            self.remove(key).await?;
        }
        Ok(keys.len())
    }
}
