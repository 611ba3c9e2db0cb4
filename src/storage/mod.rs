//! Local storage backends.
//!
//! - [`traits`]: the [`LocalStore`](traits::LocalStore) contract and [`StorageError`](traits::StorageError)
//! - [`memory`]: ephemeral DashMap store
//! - [`sqlite`]: sqlx-backed small-object store
//! - [`fs`]: one-file-per-key large-object store
//! - [`adapter`]: size-routed [`DurableStore`](adapter::DurableStore) over a small and a large backend

pub mod adapter;
pub mod fs;
pub mod memory;
pub mod sqlite;
pub mod traits;
