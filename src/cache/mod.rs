//! Two-tier preference cache: an in-memory TTL map over the durable local
//! stores.

pub mod hierarchy;

pub use hierarchy::{CacheHierarchy, CacheHit, CacheTier, Invalidation};
