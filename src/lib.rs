//! # Preference Sync Engine
//!
//! A client-resident sync engine for small, frequently mutated per-user
//! preference documents (grid layouts, panel state, formatting defaults).
//!
//! ## Architecture
//!
//! Documents live in three places: an in-memory cache, a durable local
//! cache, and the authoritative remote store.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     PreferenceEngine                        │
//! │  • get_preferences() never fails (cache → remote → fallback)│
//! │  • save_preferences() reconciles merge vs replace          │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Memory Tier (TTL)                         │
//! │  • DashMap keyed by user:type:scope                        │
//! │  • Stale entries kept as a fallback                        │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Durable Tier (checksummed)                 │
//! │  • SQLite for small objects, files for large ones          │
//! │  • Routed by size inside DurableStore                      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!           (coalesced reads, debounced / critical writes)
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Remote Store                            │
//! │  • Per-key circuit breakers                                │
//! │  • Offline queue replays failed writes in order            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pref_sync_engine::{EngineBackends, GetOptions, PrefSyncConfig, PreferenceEngine, PreferenceType, SaveOptions};
//! use pref_sync_engine::remote::{RemoteStore, StaticIdentity};
//! use serde_json::json;
//! use std::sync::Arc;
//! use tokio::sync::watch;
//!
//! # async fn example(remote: Arc<dyn RemoteStore>) -> Result<(), pref_sync_engine::SyncError> {
//! let (online_tx, online_rx) = watch::channel(true);
//! let identity = Arc::new(StaticIdentity::new(Some("alice")));
//! let engine = PreferenceEngine::new(
//!     PrefSyncConfig::default(),
//!     EngineBackends::in_memory(remote, identity, online_rx),
//! )
//! .await?;
//! engine.spawn_connectivity_watcher();
//!
//! engine.add_change_listener(|event| {
//!     println!("{} {:?} changed ({:?})", event.pref_type, event.scope, event.source);
//! });
//!
//! // Reordering columns is a replacement; widths of dropped columns go away
//! engine
//!     .save_preferences(
//!         PreferenceType::Grid,
//!         json!({"columnOrder": ["id", "price"]}),
//!         Some("orders"),
//!         SaveOptions::default(),
//!     )
//!     .await?;
//!
//! // Going offline queues writes; coming back online replays them
//! online_tx.send_replace(false);
//! let doc = engine
//!     .get_preferences(PreferenceType::Grid, Some("orders"), GetOptions::default())
//!     .await;
//! assert_eq!(doc.payload["columnOrder"], json!(["id", "price"]));
//!
//! engine.teardown().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - **Tiered Caching**: memory (TTL) → durable (max age, checksum) → remote
//! - **Request Coalescing**: one in-flight fetch per key
//! - **Write Coalescing**: debounced last-wins writes, critical writes serialized per key
//! - **Circuit Breakers**: per-key, exponential backoff, single half-open probe
//! - **Offline Queue**: durable, ordered replay on reconnect
//! - **Change Notifications**: coalesced per (type, scope) per tick
//!
//! ## Configuration
//!
//! See [`PrefSyncConfig`] for all configuration options.
//!
//! ## Modules
//!
//! - [`coordinator`]: The main [`PreferenceEngine`] orchestrating all components
//! - [`cache`]: Memory and durable cache tiers
//! - [`storage`]: Local backends (SQLite, filesystem, memory) and the size-routing adapter
//! - [`coalescing`]: Request and write coalescers
//! - [`merge`]: Merge-vs-replace reconciliation and validation
//! - [`resilience`]: Circuit breakers and the offline queue
//! - [`notify`]: Change notification bus
//! - [`remote`]: Remote store and identity interfaces

pub mod cache;
pub mod coalescing;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod key;
pub mod merge;
pub mod metrics;
pub mod notify;
pub mod preference;
pub mod remote;
pub mod resilience;
pub mod storage;

pub use config::PrefSyncConfig;
pub use coordinator::{
    EngineBackends, EngineHealth, EngineState, GetOptions, HealthStatus, PreferenceEngine, SaveOptions,
    SaveOutcome,
};
pub use error::SyncError;
pub use key::PreferenceKey;
pub use merge::{MergeMode, ReconcileMode};
pub use notify::{ChangeEvent, ChangeSource, ListenerId};
pub use preference::{PreferenceDocument, PreferenceType};
pub use remote::{ErrorClass, IdentityProvider, RemoteError, RemoteStore, StaticIdentity};
pub use resilience::circuit_breaker::{BreakerConfig, BreakerRegistry, CircuitState};
pub use resilience::offline_queue::{DrainReport, OfflineQueue, SyncQueueEntry};
pub use storage::traits::{LocalStore, StorageError};
