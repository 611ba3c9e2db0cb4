//! Change notification bus.
//!
//! Events are coalesced per `(type, scope)`: the latest event for a pair
//! replaces any earlier pending one. The first pending event schedules a
//! single tick; when it fires every listener is called once per pending
//! event. A burst of saves to one grid therefore reaches listeners as one
//! notification per frame.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::AbortHandle;
use tracing::{debug, error};

use crate::preference::{PreferenceDocument, PreferenceType};

/// Where a change came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeSource {
    /// A local save (optimistic, may not be persisted yet)
    Local,
    /// Fetched from the remote store
    Remote,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub user_id: String,
    pub pref_type: PreferenceType,
    pub scope: Option<String>,
    pub document: PreferenceDocument,
    pub source: ChangeSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

pub type Listener = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

type PendingKey = (PreferenceType, Option<String>);

struct BusInner {
    tick: Duration,
    listeners: RwLock<Vec<(ListenerId, Listener)>>,
    pending: Mutex<HashMap<PendingKey, ChangeEvent>>,
    tick_task: Mutex<Option<AbortHandle>>,
    next_id: AtomicU64,
    delivered: AtomicU64,
}

#[derive(Clone)]
pub struct ChangeBus {
    inner: Arc<BusInner>,
}

impl ChangeBus {
    pub fn new(tick: Duration) -> Self {
        Self {
            inner: Arc::new(BusInner {
                tick,
                listeners: RwLock::new(Vec::new()),
                pending: Mutex::new(HashMap::new()),
                tick_task: Mutex::new(None),
                next_id: AtomicU64::new(0),
                delivered: AtomicU64::new(0),
            }),
        }
    }

    pub fn subscribe(&self, listener: impl Fn(&ChangeEvent) + Send + Sync + 'static) -> ListenerId {
        let id = ListenerId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner.listeners.write().push((id, Arc::new(listener)));
        id
    }

    /// Returns false if `id` was not subscribed.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.inner.listeners.write();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.read().len()
    }

    /// Queue `event` for the next tick.
    ///
    /// Outside a tokio runtime the event is delivered immediately.
    pub fn notify(&self, event: ChangeEvent) {
        let schedule = {
            let mut pending = self.inner.pending.lock();
            let first = pending.is_empty();
            pending.insert((event.pref_type, event.scope.clone()), event);
            first
        };
        if !schedule {
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let inner = Arc::clone(&self.inner);
                let task = handle.spawn(async move {
                    tokio::time::sleep(inner.tick).await;
                    inner.flush();
                });
                *self.inner.tick_task.lock() = Some(task.abort_handle());
            }
            Err(_) => self.inner.flush(),
        }
    }

    /// Deliver pending events now.
    pub fn flush_now(&self) {
        if let Some(task) = self.inner.tick_task.lock().take() {
            task.abort();
        }
        self.inner.flush();
    }

    /// Drop pending events and every listener.
    pub fn shutdown(&self) {
        if let Some(task) = self.inner.tick_task.lock().take() {
            task.abort();
        }
        self.inner.pending.lock().clear();
        self.inner.listeners.write().clear();
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Total listener invocations so far.
    #[must_use]
    pub fn delivered(&self) -> u64 {
        self.inner.delivered.load(Ordering::Relaxed)
    }
}

impl BusInner {
    fn flush(&self) {
        let events: Vec<ChangeEvent> = self.pending.lock().drain().map(|(_, e)| e).collect();
        if events.is_empty() {
            return;
        }
        let listeners: Vec<Listener> = self.listeners.read().iter().map(|(_, l)| Arc::clone(l)).collect();

        for event in &events {
            for listener in &listeners {
                // A panicking listener must not starve the others
                if std::panic::catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                    error!(pref_type = %event.pref_type, scope = ?event.scope, "Change listener panicked");
                }
            }
        }

        self.delivered
            .fetch_add((events.len() * listeners.len()) as u64, Ordering::Relaxed);
        crate::metrics::record_notify_flush(events.len(), listeners.len());
        debug!(events = events.len(), listeners = listeners.len(), "Change notifications flushed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(pref_type: PreferenceType, scope: Option<&str>, n: i64) -> ChangeEvent {
        ChangeEvent {
            user_id: "u1".into(),
            pref_type,
            scope: scope.map(str::to_string),
            document: PreferenceDocument::new(json!({"n": n})),
            source: ChangeSource::Local,
        }
    }

    fn recorder(bus: &ChangeBus) -> Arc<Mutex<Vec<ChangeEvent>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.subscribe(move |e| sink.lock().push(e.clone()));
        seen
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_coalesces_to_latest_per_scope() {
        let bus = ChangeBus::new(Duration::from_millis(16));
        let seen = recorder(&bus);

        for n in 0..5 {
            bus.notify(event(PreferenceType::Grid, Some("orders"), n));
        }
        bus.notify(event(PreferenceType::Grid, Some("trades"), 9));
        assert!(seen.lock().is_empty());
        assert_eq!(bus.pending_count(), 2);

        tokio::time::sleep(Duration::from_millis(20)).await;

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        let orders = seen.iter().find(|e| e.scope.as_deref() == Some("orders")).unwrap();
        assert_eq!(orders.document.payload["n"], 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_listener_called_once_per_event() {
        let bus = ChangeBus::new(Duration::from_millis(16));
        let a = recorder(&bus);
        let b = recorder(&bus);

        bus.notify(event(PreferenceType::Panel, None, 1));
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(a.lock().len(), 1);
        assert_eq!(b.lock().len(), 1);
        assert_eq!(bus.delivered(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribe() {
        let bus = ChangeBus::new(Duration::from_millis(16));
        let seen = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&seen);
        let id = bus.subscribe(move |_| *counter.lock() += 1);

        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));

        bus.notify(event(PreferenceType::Grid, None, 1));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(*seen.lock(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_listener_does_not_block_others() {
        let bus = ChangeBus::new(Duration::from_millis(16));
        bus.subscribe(|_| panic!("listener bug"));
        let seen = recorder(&bus);

        bus.notify(event(PreferenceType::Grid, None, 1));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(seen.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_now_and_shutdown() {
        let bus = ChangeBus::new(Duration::from_secs(10));
        let seen = recorder(&bus);

        bus.notify(event(PreferenceType::Grid, None, 1));
        bus.flush_now();
        assert_eq!(seen.lock().len(), 1);

        bus.notify(event(PreferenceType::Grid, None, 2));
        bus.shutdown();
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(seen.lock().len(), 1);
        assert_eq!(bus.listener_count(), 0);
    }

    #[test]
    fn test_without_runtime_delivers_immediately() {
        let bus = ChangeBus::new(Duration::from_millis(16));
        let seen = recorder(&bus);
        bus.notify(event(PreferenceType::Formatting, None, 1));
        assert_eq!(seen.lock().len(), 1);
    }
}
