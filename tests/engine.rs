//! End-to-end tests for the preference engine.
//!
//! The remote store is a [`MockRemote`] with call counters and an optional
//! delay, optionally wrapped in a [`FailingRemote`] for error injection.
//! Timers run on paused tokio time.
//!
//! Run with: `cargo test --test engine`

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use pref_sync_engine::{
    EngineBackends, EngineState, GetOptions, HealthStatus, PrefSyncConfig, PreferenceEngine, PreferenceKey,
    PreferenceType, ReconcileMode, RemoteError, RemoteStore, SaveOptions, SaveOutcome, StaticIdentity, SyncError,
};

// =============================================================================
// Mock remote store
// =============================================================================

type DocKey = (String, PreferenceType, Option<String>);

#[derive(Default)]
pub struct MockRemote {
    docs: Mutex<HashMap<DocKey, Value>>,
    persisted: Mutex<Vec<(DocKey, Value)>>,
    fetch_calls: AtomicU64,
    persist_calls: AtomicU64,
    in_flight: AtomicU64,
    max_in_flight: AtomicU64,
    delay: Duration,
}

impl MockRemote {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    pub fn seed(&self, user: &str, pref_type: PreferenceType, scope: Option<&str>, doc: Value) {
        self.docs
            .lock()
            .insert((user.to_string(), pref_type, scope.map(str::to_string)), doc);
    }

    pub fn fetches(&self) -> u64 {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    pub fn persists(&self) -> u64 {
        self.persist_calls.load(Ordering::SeqCst)
    }

    pub fn persisted(&self) -> Vec<(DocKey, Value)> {
        self.persisted.lock().clone()
    }

    async fn enter(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
    }

    fn exit(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl RemoteStore for MockRemote {
    async fn fetch_document(
        &self,
        user_id: &str,
        pref_type: PreferenceType,
        scope: Option<&str>,
    ) -> Result<Option<Value>, RemoteError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        self.enter().await;
        let doc = self
            .docs
            .lock()
            .get(&(user_id.to_string(), pref_type, scope.map(str::to_string)))
            .cloned();
        self.exit();
        Ok(doc)
    }

    async fn persist_document(
        &self,
        user_id: &str,
        pref_type: PreferenceType,
        scope: Option<&str>,
        document: &Value,
        _version: i64,
    ) -> Result<(), RemoteError> {
        self.persist_calls.fetch_add(1, Ordering::SeqCst);
        self.enter().await;
        let key = (user_id.to_string(), pref_type, scope.map(str::to_string));
        self.docs.lock().insert(key.clone(), document.clone());
        self.persisted.lock().push((key, document.clone()));
        self.exit();
        Ok(())
    }
}

// =============================================================================
// Failing wrapper - error injection
// =============================================================================

/// Fails every call with `error` until healed.
pub struct FailingRemote {
    inner: Arc<MockRemote>,
    error: RemoteError,
    failing: AtomicBool,
    failed_calls: AtomicU64,
}

impl FailingRemote {
    pub fn new(inner: Arc<MockRemote>, error: RemoteError) -> Self {
        Self {
            inner,
            error,
            failing: AtomicBool::new(true),
            failed_calls: AtomicU64::new(0),
        }
    }

    pub fn heal(&self) {
        self.failing.store(false, Ordering::SeqCst);
    }

    pub fn failed_calls(&self) -> u64 {
        self.failed_calls.load(Ordering::SeqCst)
    }

    fn maybe_fail(&self) -> Result<(), RemoteError> {
        if self.failing.load(Ordering::SeqCst) {
            self.failed_calls.fetch_add(1, Ordering::SeqCst);
            Err(self.error.clone())
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RemoteStore for FailingRemote {
    async fn fetch_document(
        &self,
        user_id: &str,
        pref_type: PreferenceType,
        scope: Option<&str>,
    ) -> Result<Option<Value>, RemoteError> {
        self.maybe_fail()?;
        self.inner.fetch_document(user_id, pref_type, scope).await
    }

    async fn persist_document(
        &self,
        user_id: &str,
        pref_type: PreferenceType,
        scope: Option<&str>,
        document: &Value,
        version: i64,
    ) -> Result<(), RemoteError> {
        self.maybe_fail()?;
        self.inner
            .persist_document(user_id, pref_type, scope, document, version)
            .await
    }
}

// =============================================================================
// Harness
// =============================================================================

struct Harness {
    engine: PreferenceEngine,
    online: watch::Sender<bool>,
    identity: Arc<StaticIdentity>,
}

fn test_config() -> PrefSyncConfig {
    PrefSyncConfig {
        breaker_initial_backoff_ms: 100,
        breaker_max_backoff_ms: 1000,
        ..Default::default()
    }
}

async fn start(remote: Arc<dyn RemoteStore>, online: bool) -> Harness {
    let (online_tx, online_rx) = watch::channel(online);
    let identity = Arc::new(StaticIdentity::new(Some("alice")));
    let backends = EngineBackends::in_memory(remote, identity.clone(), online_rx);
    let engine = PreferenceEngine::new(test_config(), backends)
        .await
        .expect("engine should build over in-memory stores");
    Harness {
        engine,
        online: online_tx,
        identity,
    }
}

const DEBOUNCE: Duration = Duration::from_millis(1100);

fn grid() -> PreferenceType {
    PreferenceType::Grid
}

// =============================================================================
// Reads
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_concurrent_reads_share_one_fetch() {
    let remote = Arc::new(MockRemote::with_delay(Duration::from_millis(50)));
    remote.seed("alice", grid(), Some("orders"), json!({"pageSize": 25}));
    let h = start(remote.clone(), true).await;

    let reads = (0..10).map(|_| {
        let engine = h.engine.clone();
        async move { engine.get_preferences(grid(), Some("orders"), GetOptions::default()).await }
    });
    let docs = futures::future::join_all(reads).await;

    assert_eq!(remote.fetches(), 1);
    assert!(docs.iter().all(|d| d.payload["pageSize"] == 25));
    assert!(remote.max_in_flight.load(Ordering::SeqCst) <= 1);

    // A different scope is a different key
    h.engine
        .get_preferences(grid(), Some("trades"), GetOptions::default())
        .await;
    assert_eq!(remote.fetches(), 2);
}

#[tokio::test]
async fn test_not_found_resolves_to_cached_defaults() {
    let remote = Arc::new(MockRemote::default());
    let h = start(remote.clone(), true).await;

    let doc = h.engine.get_preferences(grid(), None, GetOptions::default()).await;
    assert_eq!(doc.payload, PreferenceType::Grid.defaults());

    let again = h.engine.get_preferences(grid(), None, GetOptions::default()).await;
    assert_eq!(again.payload, doc.payload);
    assert_eq!(remote.fetches(), 1, "defaults should have been cached");
}

#[tokio::test]
async fn test_remote_documents_are_normalized() {
    let remote = Arc::new(MockRemote::default());
    remote.seed("alice", PreferenceType::Panel, None, json!({"width": 400}));
    let h = start(remote, true).await;

    let doc = h
        .engine
        .get_preferences(PreferenceType::Panel, None, GetOptions::default())
        .await;
    assert_eq!(doc.payload["width"], 400);
    assert_eq!(doc.payload["collapsed"], false);
    assert_eq!(doc.payload["panelOrder"], json!([]));
}

#[tokio::test]
async fn test_bypass_cache_goes_to_remote() {
    let remote = Arc::new(MockRemote::default());
    let h = start(remote.clone(), true).await;

    h.engine.get_preferences(grid(), None, GetOptions::default()).await;
    h.engine.get_preferences(grid(), None, GetOptions::bypass_cache()).await;
    assert_eq!(remote.fetches(), 2);
}

#[tokio::test]
async fn test_no_user_reads_defaults_and_refuses_saves() {
    let remote = Arc::new(MockRemote::default());
    let h = start(remote.clone(), true).await;
    h.identity.set_user(None);

    let doc = h.engine.get_preferences(grid(), None, GetOptions::default()).await;
    assert_eq!(doc.payload, PreferenceType::Grid.defaults());
    assert_eq!(remote.fetches(), 0);

    let err = h
        .engine
        .save_preferences(grid(), json!({"pageSize": 10}), None, SaveOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::NotSignedIn));
}

// =============================================================================
// Saves
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_five_debounced_saves_persist_the_fifth() {
    let remote = Arc::new(MockRemote::default());
    let h = start(remote.clone(), true).await;

    for size in 1..=5 {
        let outcome = h
            .engine
            .save_preferences(grid(), json!({"pageSize": size}), Some("orders"), SaveOptions::default())
            .await
            .unwrap();
        assert_eq!(outcome, SaveOutcome::Scheduled);
    }
    assert_eq!(remote.persists(), 0);
    assert_eq!(h.engine.pending_writes(), 1);

    tokio::time::sleep(DEBOUNCE).await;

    let persisted = remote.persisted();
    assert_eq!(persisted.len(), 1);
    assert_eq!(persisted[0].1["pageSize"], 5);
    assert_eq!(h.engine.pending_writes(), 0);
}

#[tokio::test]
async fn test_noop_save_is_suppressed() {
    let remote = Arc::new(MockRemote::default());
    let h = start(remote.clone(), true).await;
    h.engine.get_preferences(grid(), None, GetOptions::default()).await;

    let outcome = h
        .engine
        .save_preferences(grid(), json!({"pageSize": 50}), None, SaveOptions::critical())
        .await
        .unwrap();
    assert_eq!(outcome, SaveOutcome::Unchanged);
    assert_eq!(remote.persists(), 0);
}

#[tokio::test]
async fn test_critical_field_persists_immediately() {
    let remote = Arc::new(MockRemote::default());
    let h = start(remote.clone(), true).await;

    let outcome = h
        .engine
        .save_preferences(
            grid(),
            json!({"sortModel": [{"colId": "price", "sort": "desc"}]}),
            Some("orders"),
            SaveOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(outcome, SaveOutcome::Persisted);
    assert_eq!(remote.persists(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_critical_writes_serialize_per_key() {
    let remote = Arc::new(MockRemote::with_delay(Duration::from_millis(30)));
    let h = start(remote.clone(), true).await;

    let first = h.engine.save_preferences(
        grid(),
        json!({"sortModel": [{"colId": "a"}]}),
        None,
        SaveOptions::default(),
    );
    let second = h.engine.save_preferences(
        grid(),
        json!({"sortModel": [{"colId": "b"}]}),
        None,
        SaveOptions::default(),
    );
    let (a, b) = tokio::join!(first, second);
    assert!(a.is_ok() && b.is_ok());

    assert_eq!(remote.persists(), 2);
    assert_eq!(remote.max_in_flight.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_merge_drops_widths_of_removed_columns() {
    let remote = Arc::new(MockRemote::default());
    remote.seed(
        "alice",
        grid(),
        Some("orders"),
        json!({
            "columnOrder": ["id", "price", "qty"],
            "columnWidths": {"id": 80, "price": 120, "qty": 60},
        }),
    );
    let h = start(remote.clone(), true).await;
    h.engine.get_preferences(grid(), Some("orders"), GetOptions::default()).await;

    h.engine
        .save_preferences(
            grid(),
            json!({"columnOrder": ["id", "price"]}),
            Some("orders"),
            SaveOptions::critical().with_mode(ReconcileMode::Merge),
        )
        .await
        .unwrap();

    let doc = h.engine.get_preferences(grid(), Some("orders"), GetOptions::default()).await;
    assert_eq!(doc.payload["columnWidths"], json!({"id": 80, "price": 120}));
    assert_eq!(remote.persisted()[0].1["columnWidths"], json!({"id": 80, "price": 120}));
}

#[tokio::test]
async fn test_replace_takes_order_and_recomputes_hidden() {
    let remote = Arc::new(MockRemote::default());
    remote.seed(
        "alice",
        grid(),
        None,
        json!({
            "columnOrder": ["a", "b", "c"],
            "hiddenColumns": ["b", "c"],
            "density": "compact",
        }),
    );
    let h = start(remote, true).await;
    h.engine.get_preferences(grid(), None, GetOptions::default()).await;

    h.engine
        .save_preferences(grid(), json!({"columnOrder": ["c", "a"]}), None, SaveOptions::default())
        .await
        .unwrap();

    let doc = h.engine.get_preferences(grid(), None, GetOptions::default()).await;
    assert_eq!(doc.payload["columnOrder"], json!(["c", "a"]));
    assert_eq!(doc.payload["hiddenColumns"], json!(["c"]));
    assert_eq!(doc.payload["density"], "compact");
}

#[tokio::test]
async fn test_non_object_update_is_rejected() {
    let h = start(Arc::new(MockRemote::default()), true).await;
    let err = h
        .engine
        .save_preferences(grid(), json!([1, 2, 3]), None, SaveOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::InvalidUpdate(_)));
}

// =============================================================================
// Circuit breaker
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_breaker_opens_then_probes_and_closes() {
    let mock = Arc::new(MockRemote::default());
    mock.seed("alice", grid(), None, json!({"pageSize": 10}));
    let remote = Arc::new(FailingRemote::new(mock.clone(), RemoteError::server(503)));
    let h = start(remote.clone(), true).await;

    for _ in 0..3 {
        let doc = h.engine.get_preferences(grid(), None, GetOptions::bypass_cache()).await;
        assert_eq!(doc.payload, PreferenceType::Grid.defaults());
    }
    assert_eq!(remote.failed_calls(), 3);
    assert_eq!(h.engine.health().open_breaker_count, 1);
    assert_eq!(h.engine.health().status, HealthStatus::Degraded);

    // Open: no call reaches the remote
    h.engine.get_preferences(grid(), None, GetOptions::bypass_cache()).await;
    assert_eq!(remote.failed_calls(), 3);

    // Third failure: backoff is 100ms * 2^2
    remote.heal();
    tokio::time::sleep(Duration::from_millis(450)).await;

    // Probe succeeds, one more success closes
    let doc = h.engine.get_preferences(grid(), None, GetOptions::bypass_cache()).await;
    assert_eq!(doc.payload["pageSize"], 10);
    assert_eq!(h.engine.health().open_breaker_count, 1);

    h.engine.get_preferences(grid(), None, GetOptions::bypass_cache()).await;
    assert_eq!(h.engine.health().open_breaker_count, 0);
    assert_eq!(mock.fetches(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_reads_fall_back_to_stale_cache_when_remote_fails() {
    let mock = Arc::new(MockRemote::default());
    mock.seed("alice", grid(), None, json!({"pageSize": 10}));
    let h = start(mock.clone(), true).await;
    h.engine.get_preferences(grid(), None, GetOptions::default()).await;

    // Memory tier expires, remote goes away
    tokio::time::sleep(Duration::from_secs(301)).await;
    h.online.send_replace(false);

    let doc = h.engine.get_preferences(grid(), None, GetOptions::bypass_cache()).await;
    assert_eq!(doc.payload["pageSize"], 10);
}

#[tokio::test]
async fn test_bad_request_is_not_queued() {
    let mock = Arc::new(MockRemote::default());
    let remote = Arc::new(FailingRemote::new(mock, RemoteError::bad_request("schema mismatch")));
    let h = start(remote, true).await;

    let err = h
        .engine
        .save_preferences(grid(), json!({"pageSize": 10}), None, SaveOptions::critical())
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Remote(_)));
    assert_eq!(h.engine.health().pending_queue_items, 0);
    // Permanent client errors open the breaker at once
    assert_eq!(h.engine.health().open_breaker_count, 1);
}

#[tokio::test]
async fn test_transient_failure_is_queued() {
    let mock = Arc::new(MockRemote::default());
    let remote = Arc::new(FailingRemote::new(mock, RemoteError::timeout()));
    let h = start(remote, true).await;

    let err = h
        .engine
        .save_preferences(grid(), json!({"pageSize": 10}), None, SaveOptions::critical())
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Remote(_)));
    assert_eq!(h.engine.health().pending_queue_items, 1);
}

// =============================================================================
// Offline queue
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_offline_writes_replay_in_order_on_reconnect() {
    let remote = Arc::new(MockRemote::default());
    let h = start(remote.clone(), false).await;
    h.engine.spawn_connectivity_watcher();
    assert_eq!(h.engine.health().status, HealthStatus::Offline);

    let err = h
        .engine
        .save_preferences(grid(), json!({"pageSize": 11}), Some("a"), SaveOptions::critical())
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Offline { .. }));

    h.engine
        .save_preferences(grid(), json!({"pageSize": 22}), Some("b"), SaveOptions::default())
        .await
        .unwrap();
    tokio::time::sleep(DEBOUNCE).await;
    h.engine
        .save_preferences(grid(), json!({"pageSize": 33}), Some("a"), SaveOptions::default())
        .await
        .unwrap();
    tokio::time::sleep(DEBOUNCE).await;

    assert_eq!(h.engine.health().pending_queue_items, 3);
    assert_eq!(remote.persists(), 0);

    h.online.send_replace(true);
    for _ in 0..20 {
        if remote.persists() == 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let order: Vec<(Option<String>, Value)> = remote
        .persisted()
        .into_iter()
        .map(|((_, _, scope), doc)| (scope, doc["pageSize"].clone()))
        .collect();
    assert_eq!(
        order,
        vec![
            (Some("a".to_string()), json!(11)),
            (Some("b".to_string()), json!(22)),
            (Some("a".to_string()), json!(33)),
        ]
    );
    assert_eq!(h.engine.health().pending_queue_items, 0);
    assert_eq!(h.engine.health().status, HealthStatus::Healthy);
}

#[tokio::test(start_paused = true)]
async fn test_read_falls_back_to_queued_write() {
    let remote = Arc::new(MockRemote::default());
    let h = start(remote, false).await;

    h.engine
        .save_preferences(grid(), json!({"pageSize": 77}), None, SaveOptions::default())
        .await
        .unwrap();
    tokio::time::sleep(DEBOUNCE).await;
    assert_eq!(h.engine.health().pending_queue_items, 1);

    h.engine.invalidate(&PreferenceKey::global("alice", grid())).await;
    let doc = h.engine.get_preferences(grid(), None, GetOptions::default()).await;
    assert_eq!(doc.payload["pageSize"], 77);
}

#[tokio::test]
async fn test_drain_while_offline_is_deferred() {
    let h = start(Arc::new(MockRemote::default()), false).await;
    let _ = h
        .engine
        .save_preferences(grid(), json!({"pageSize": 5}), None, SaveOptions::critical())
        .await;

    let report = h.engine.drain_offline_queue().await.unwrap();
    assert_eq!(report.replayed, 0);
    assert_eq!(report.remaining, 1);
}

// =============================================================================
// Same-key write ordering
// =============================================================================

fn page_sizes(remote: &MockRemote) -> Vec<Value> {
    remote
        .persisted()
        .into_iter()
        .map(|(_, doc)| doc["pageSize"].clone())
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_debounced_write_waiting_on_critical_is_dropped() {
    let remote = Arc::new(MockRemote::with_delay(Duration::from_millis(300)));
    let h = start(remote.clone(), true).await;

    h.engine
        .save_preferences(grid(), json!({"pageSize": 1}), None, SaveOptions::default())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(900)).await;

    // In flight from 900ms to 1200ms; the debounce timer fires at 1000ms
    let outcome = h
        .engine
        .save_preferences(grid(), json!({"pageSize": 2}), None, SaveOptions::critical())
        .await
        .unwrap();
    assert_eq!(outcome, SaveOutcome::Persisted);

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(page_sizes(&remote), vec![json!(2)]);
    assert_eq!(remote.max_in_flight.load(Ordering::SeqCst), 1);
    assert_eq!(h.engine.pending_writes(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_live_write_supersedes_queued_replay() {
    let remote = Arc::new(MockRemote::with_delay(Duration::from_millis(100)));
    let h = start(remote.clone(), false).await;

    let _ = h
        .engine
        .save_preferences(grid(), json!({"pageSize": 10}), None, SaveOptions::critical())
        .await;
    assert_eq!(h.engine.health().pending_queue_items, 1);
    h.online.send_replace(true);

    let live = {
        let engine = h.engine.clone();
        tokio::spawn(async move {
            engine
                .save_preferences(grid(), json!({"pageSize": 20}), None, SaveOptions::critical())
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    let report = h.engine.drain_offline_queue().await.unwrap();
    live.await.unwrap().unwrap();

    assert_eq!(report.superseded, 1);
    assert_eq!(report.replayed, 0);
    assert_eq!(page_sizes(&remote), vec![json!(20)]);
    assert_eq!(remote.max_in_flight.load(Ordering::SeqCst), 1);
    assert_eq!(h.engine.health().pending_queue_items, 0);
}

#[tokio::test(start_paused = true)]
async fn test_live_write_waits_for_in_flight_replay() {
    let remote = Arc::new(MockRemote::with_delay(Duration::from_millis(100)));
    let h = start(remote.clone(), false).await;

    let _ = h
        .engine
        .save_preferences(grid(), json!({"pageSize": 10}), None, SaveOptions::critical())
        .await;
    h.online.send_replace(true);

    let drain = {
        let engine = h.engine.clone();
        tokio::spawn(async move { engine.drain_offline_queue().await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    h.engine
        .save_preferences(grid(), json!({"pageSize": 20}), None, SaveOptions::critical())
        .await
        .unwrap();
    let report = drain.await.unwrap().unwrap();

    assert_eq!(report.replayed, 1);
    assert_eq!(page_sizes(&remote), vec![json!(10), json!(20)]);
    assert_eq!(remote.max_in_flight.load(Ordering::SeqCst), 1);
}

// =============================================================================
// Notifications, identity, lifecycle
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_listeners_see_one_event_per_burst() {
    let h = start(Arc::new(MockRemote::default()), true).await;
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let id = h
        .engine
        .add_change_listener(move |event| sink.lock().push(event.document.payload["pageSize"].clone()));

    for size in [10, 20, 30] {
        h.engine
            .save_preferences(grid(), json!({"pageSize": size}), Some("orders"), SaveOptions::default())
            .await
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(*seen.lock(), vec![json!(30)]);

    assert!(h.engine.remove_change_listener(id));
    h.engine
        .save_preferences(grid(), json!({"pageSize": 40}), Some("orders"), SaveOptions::default())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(seen.lock().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_read_after_identity_change_never_joins_previous_user() {
    let remote = Arc::new(MockRemote::with_delay(Duration::from_millis(100)));
    remote.seed("alice", grid(), None, json!({"pageSize": 11}));
    remote.seed("bob", grid(), None, json!({"pageSize": 22}));
    let h = start(remote.clone(), true).await;

    let alice = {
        let engine = h.engine.clone();
        tokio::spawn(async move { engine.get_preferences(grid(), None, GetOptions::default()).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    h.identity.set_user(Some("bob"));
    let bob = h.engine.get_preferences(grid(), None, GetOptions::default()).await;
    let alice = alice.await.unwrap();

    assert_eq!(alice.payload["pageSize"], 11);
    assert_eq!(bob.payload["pageSize"], 22);
    assert_eq!(remote.fetches(), 2);
    assert_eq!(h.engine.current_user().as_deref(), Some("bob"));
}

#[tokio::test]
async fn test_identity_change_clears_previous_user() {
    let remote = Arc::new(MockRemote::default());
    remote.seed("alice", grid(), None, json!({"pageSize": 10}));
    remote.seed("bob", grid(), None, json!({"pageSize": 20}));
    let h = start(remote.clone(), true).await;

    let alice = h.engine.get_preferences(grid(), None, GetOptions::default()).await;
    assert_eq!(alice.payload["pageSize"], 10);

    h.identity.set_user(Some("bob"));
    let bob = h.engine.get_preferences(grid(), None, GetOptions::default()).await;
    assert_eq!(bob.payload["pageSize"], 20);
    assert_eq!(h.engine.current_user().as_deref(), Some("bob"));

    // Alice's cached copy is gone, so she is fetched again
    h.identity.set_user(Some("alice"));
    h.engine.get_preferences(grid(), None, GetOptions::default()).await;
    assert_eq!(remote.fetches(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_sign_out_flushes_pending_writes() {
    let remote = Arc::new(MockRemote::default());
    let h = start(remote.clone(), true).await;

    h.engine
        .save_preferences(grid(), json!({"pageSize": 15}), None, SaveOptions::default())
        .await
        .unwrap();
    h.engine.clear_on_sign_out().await;

    assert_eq!(remote.persists(), 1);
    assert_eq!(h.engine.state(), EngineState::SignedOut);
    assert_eq!(h.engine.health().cache_size, 0);

    // Next signed-in call resumes the engine
    let doc = h.engine.get_preferences(grid(), None, GetOptions::default()).await;
    assert_eq!(doc.payload["pageSize"], 15);
    assert_eq!(h.engine.state(), EngineState::Running);
}

#[tokio::test(start_paused = true)]
async fn test_reset_for_user_switches_identity() {
    let remote = Arc::new(MockRemote::default());
    remote.seed("carol", grid(), None, json!({"pageSize": 5}));
    let h = start(remote, true).await;
    h.engine.get_preferences(grid(), None, GetOptions::default()).await;

    h.engine.reset_for_user("carol").await;
    assert_eq!(h.engine.current_user().as_deref(), Some("carol"));
    assert_eq!(h.engine.health().cache_size, 0);
    assert_eq!(h.engine.state(), EngineState::Running);
}

#[tokio::test(start_paused = true)]
async fn test_teardown_flushes_and_refuses_new_work() {
    let remote = Arc::new(MockRemote::default());
    let h = start(remote.clone(), true).await;
    h.engine.spawn_connectivity_watcher();
    let mut states = h.engine.state_receiver();

    h.engine
        .save_preferences(grid(), json!({"pageSize": 9}), None, SaveOptions::default())
        .await
        .unwrap();
    h.engine.teardown().await;
    assert_eq!(remote.persists(), 1);
    assert_eq!(h.engine.state(), EngineState::TornDown);
    assert!(states.has_changed().unwrap());
    assert_eq!(*states.borrow_and_update(), EngineState::TornDown);

    let err = h
        .engine
        .save_preferences(grid(), json!({"pageSize": 1}), None, SaveOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::TornDown));

    let doc = h.engine.get_preferences(grid(), None, GetOptions::default()).await;
    assert_eq!(doc.payload, PreferenceType::Grid.defaults());

    // Idempotent
    h.engine.teardown().await;
}

#[tokio::test]
async fn test_queue_survives_restart() {
    use pref_sync_engine::storage::memory::MemoryStore;

    let small = Arc::new(MemoryStore::new());
    let large = Arc::new(MemoryStore::new());
    let remote = Arc::new(MockRemote::default());
    let identity = Arc::new(StaticIdentity::new(Some("alice")));

    let (_tx, offline) = watch::channel(false);
    let engine = PreferenceEngine::new(
        test_config(),
        EngineBackends {
            remote: remote.clone(),
            identity: identity.clone(),
            small_store: small.clone(),
            large_store: large.clone(),
            connectivity: offline,
        },
    )
    .await
    .unwrap();
    let _ = engine
        .save_preferences(grid(), json!({"pageSize": 12}), None, SaveOptions::critical())
        .await;
    engine.teardown().await;
    drop(engine);

    let (_tx, online) = watch::channel(true);
    let engine = PreferenceEngine::new(
        test_config(),
        EngineBackends {
            remote: remote.clone(),
            identity,
            small_store: small,
            large_store: large,
            connectivity: online,
        },
    )
    .await
    .unwrap();
    assert_eq!(engine.health().pending_queue_items, 1);

    let report = engine.drain_offline_queue().await.unwrap();
    assert_eq!(report.replayed, 1);
    assert_eq!(remote.persisted()[0].1["pageSize"], 12);
}
