//! Deduplication of remote work.
//!
//! - [`request`]: concurrent reads of one key share a single fetch
//! - [`write`]: debounced / critical writes with one writer per key

pub mod request;
pub mod write;
