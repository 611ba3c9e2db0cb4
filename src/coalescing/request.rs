//! Request coalescing: one in-flight future per key.
//!
//! Concurrent callers asking for the same key share a single fetch. The
//! first caller registers a [`Shared`] future; everyone arriving while it is
//! pending awaits the same future and receives a clone of its output.
//!
//! Each registration carries a generation number. The shared future removes
//! its own registry entry as it settles (and before any waiter observes the
//! result), matching on generation so it can never evict a newer fetch that
//! replaced it after a [`RequestCoalescer::clear`].

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

type SharedFetch<T> = Shared<BoxFuture<'static, T>>;

struct InFlight<T: Clone> {
    generation: u64,
    future: SharedFetch<T>,
}

pub struct RequestCoalescer<K, T: Clone> {
    inflight: Arc<DashMap<K, InFlight<T>>>,
    next_generation: AtomicU64,
    joined: AtomicU64,
}

impl<K, T> RequestCoalescer<K, T>
where
    K: Eq + Hash + Clone + std::fmt::Debug + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            inflight: Arc::new(DashMap::new()),
            next_generation: AtomicU64::new(0),
            joined: AtomicU64::new(0),
        }
    }

    /// Await the in-flight fetch for `key`, or start one with `fetcher`.
    ///
    /// `fetcher` is only invoked when nothing is in flight.
    pub async fn get_or_fetch<F, Fut>(&self, key: K, fetcher: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let future = match self.inflight.entry(key.clone()) {
            Entry::Occupied(existing) => {
                self.joined.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_coalesced_read();
                debug!(key = ?key, "Joined in-flight request");
                existing.get().future.clone()
            }
            Entry::Vacant(slot) => {
                let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                let registry = Arc::clone(&self.inflight);
                let fetch = fetcher();
                let future = async move {
                    let output = fetch.await;
                    registry.remove_if(&key, |_, entry| entry.generation == generation);
                    output
                }
                .boxed()
                .shared();
                slot.insert(InFlight {
                    generation,
                    future: future.clone(),
                });
                future
            }
        };

        future.await
    }

    /// Number of keys with a fetch in flight.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.inflight.len()
    }

    /// Total callers that joined an existing fetch.
    #[must_use]
    pub fn joined(&self) -> u64 {
        self.joined.load(Ordering::Relaxed)
    }

    /// Forget every in-flight registration. Running fetches finish for the
    /// callers already awaiting them; new callers start fresh.
    pub fn clear(&self) {
        self.inflight.clear();
    }
}

impl<K, T> Default for RequestCoalescer<K, T>
where
    K: Eq + Hash + Clone + std::fmt::Debug + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
