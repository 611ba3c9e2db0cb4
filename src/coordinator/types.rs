//! Public types for the preference engine.

use std::sync::Arc;
use tokio::sync::watch;

use crate::merge::ReconcileMode;
use crate::remote::{IdentityProvider, RemoteStore};
use crate::storage::memory::MemoryStore;
use crate::storage::traits::LocalStore;

/// Engine lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Serving reads and writes
    Running,
    /// Caches cleared after sign-out; resumes on the next signed-in call
    SignedOut,
    /// Torn down; reads return defaults and saves are refused
    TornDown,
}

impl EngineState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::SignedOut => "signed_out",
            Self::TornDown => "torn_down",
        }
    }
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "Running"),
            Self::SignedOut => write!(f, "SignedOut"),
            Self::TornDown => write!(f, "TornDown"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    /// Online, but breakers are open or writes are waiting in the queue
    Degraded,
    Offline,
}

/// Point-in-time engine health, cheap to collect (no I/O).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineHealth {
    pub status: HealthStatus,
    /// Memory tier entries
    pub cache_size: usize,
    pub open_breaker_count: usize,
    pub is_online: bool,
    pub pending_queue_items: usize,
    pub state: EngineState,
}

/// Options for [`super::PreferenceEngine::get_preferences`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GetOptions {
    /// Skip both cache tiers and go to the remote store. The cache is still
    /// used as a fallback if the remote call fails.
    pub bypass_cache: bool,
}

impl GetOptions {
    #[must_use]
    pub fn bypass_cache() -> Self {
        Self { bypass_cache: true }
    }
}

/// Options for [`super::PreferenceEngine::save_preferences`].
///
/// # Example
///
/// ```rust
/// use pref_sync_engine::SaveOptions;
/// use pref_sync_engine::merge::ReconcileMode;
///
/// // Debounced, mode detected from the update
/// let opts = SaveOptions::default();
///
/// // Persist now, replacing the structured fields wholesale
/// let opts = SaveOptions::critical().with_mode(ReconcileMode::Replace);
/// assert!(opts.critical);
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SaveOptions {
    /// Persist immediately instead of debouncing. Saves that touch a
    /// critical field of their type are critical regardless.
    pub critical: bool,
    pub mode: ReconcileMode,
}

impl SaveOptions {
    #[must_use]
    pub fn critical() -> Self {
        Self {
            critical: true,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_mode(mut self, mode: ReconcileMode) -> Self {
        self.mode = mode;
        self
    }
}

/// What happened to a save.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    /// Reconciled document equals the current one; nothing written
    Unchanged,
    /// Cached and announced; a debounced write will persist it
    Scheduled,
    /// Cached, announced and persisted to the remote store
    Persisted,
}

/// External collaborators the engine is built over.
pub struct EngineBackends {
    pub remote: Arc<dyn RemoteStore>,
    pub identity: Arc<dyn IdentityProvider>,
    /// Small-object KV store (e.g. [`crate::storage::sqlite::SqliteStore`])
    pub small_store: Arc<dyn LocalStore>,
    /// Large-object store (e.g. [`crate::storage::fs::FsBlobStore`]); also
    /// holds the offline queue
    pub large_store: Arc<dyn LocalStore>,
    pub connectivity: watch::Receiver<bool>,
}

impl EngineBackends {
    /// Ephemeral in-memory local stores.
    pub fn in_memory(
        remote: Arc<dyn RemoteStore>,
        identity: Arc<dyn IdentityProvider>,
        connectivity: watch::Receiver<bool>,
    ) -> Self {
        Self {
            remote,
            identity,
            small_store: Arc::new(MemoryStore::new()),
            large_store: Arc::new(MemoryStore::new()),
            connectivity,
        }
    }
}
