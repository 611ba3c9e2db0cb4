// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Basic preference-engine usage example.
//!
//! Demonstrates:
//! 1. Opening SQLite (small objects) and filesystem (large objects) local stores
//! 2. Saving a grid layout and reading it back
//! 3. Going offline: writes land in the offline queue
//! 4. Reconnecting: the queue replays in order
//! 5. Displaying captured metrics
//! 6. Clean teardown
//!
//! # Run
//!
//! ```bash
//! cargo run --example basic_usage
//! ```

use async_trait::async_trait;
use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use pref_sync_engine::storage::fs::FsBlobStore;
use pref_sync_engine::storage::sqlite::SqliteStore;
use pref_sync_engine::{
    EngineBackends, GetOptions, PrefSyncConfig, PreferenceEngine, PreferenceType, RemoteError, RemoteStore,
    SaveOptions, StaticIdentity,
};

type DocKey = (String, PreferenceType, Option<String>);

/// Remote store that keeps documents in a map and prints every call.
#[derive(Default)]
struct InMemoryRemote {
    docs: Mutex<HashMap<DocKey, Value>>,
}

#[async_trait]
impl RemoteStore for InMemoryRemote {
    async fn fetch_document(
        &self,
        user_id: &str,
        pref_type: PreferenceType,
        scope: Option<&str>,
    ) -> Result<Option<Value>, RemoteError> {
        let key = (user_id.to_string(), pref_type, scope.map(str::to_string));
        println!("   ↳ remote fetch {}/{}/{:?}", user_id, pref_type, scope);
        Ok(self.docs.lock().get(&key).cloned())
    }

    async fn persist_document(
        &self,
        user_id: &str,
        pref_type: PreferenceType,
        scope: Option<&str>,
        document: &Value,
        version: i64,
    ) -> Result<(), RemoteError> {
        let key = (user_id.to_string(), pref_type, scope.map(str::to_string));
        println!("   ↳ remote persist {}/{}/{:?} v{}", user_id, pref_type, scope, version);
        self.docs.lock().insert(key, document.clone());
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder
        .install()
        .map_err(|_| "failed to install metrics recorder")?;

    tracing_subscriber::fmt().with_target(false).compact().init();

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║         pref-sync-engine: Basic Usage Example                 ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Open local stores and start the engine
    // ─────────────────────────────────────────────────────────────────────────
    println!("📦 Opening local stores...");
    let dir = tempfile::tempdir()?;
    let config = PrefSyncConfig {
        debounce_ms: 200,
        ..Default::default()
    };
    let small = SqliteStore::open(dir.path().join("prefs.db"), Some(config.small_object_max_bytes)).await?;
    let large = FsBlobStore::open(dir.path().join("blobs")).await?;

    let remote = Arc::new(InMemoryRemote::default());
    let identity = Arc::new(StaticIdentity::new(Some("alice")));
    let (online_tx, online_rx) = watch::channel(true);

    let engine = PreferenceEngine::new(
        config,
        EngineBackends {
            remote: remote.clone(),
            identity,
            small_store: Arc::new(small),
            large_store: Arc::new(large),
            connectivity: online_rx,
        },
    )
    .await?;
    engine.spawn_connectivity_watcher();
    engine.add_change_listener(|event| {
        println!("   🔔 {} {:?} changed ({:?})", event.pref_type, event.scope, event.source);
    });
    println!("   ✓ Engine running for {:?}\n", engine.current_user());

    // ─────────────────────────────────────────────────────────────────────────
    // 2. Save and read back
    // ─────────────────────────────────────────────────────────────────────────
    println!("📝 Saving grid layout (critical, persisted immediately)...");
    let outcome = engine
        .save_preferences(
            PreferenceType::Grid,
            json!({"columnOrder": ["id", "name", "price"], "columnWidths": {"name": 180}}),
            Some("orders"),
            SaveOptions::critical(),
        )
        .await?;
    println!("   ✓ {:?}", outcome);

    let doc = engine
        .get_preferences(PreferenceType::Grid, Some("orders"), GetOptions::default())
        .await;
    println!("   📖 columnOrder = {}\n", doc.payload["columnOrder"]);

    // ─────────────────────────────────────────────────────────────────────────
    // 3. Offline writes
    // ─────────────────────────────────────────────────────────────────────────
    println!("📴 Going offline...");
    online_tx.send_replace(false);
    engine
        .save_preferences(
            PreferenceType::Grid,
            json!({"columnOrder": ["id", "price"]}),
            Some("orders"),
            SaveOptions::critical(),
        )
        .await?;
    println!("   ✓ Queued writes: {}", engine.health().pending_queue_items);
    let doc = engine
        .get_preferences(PreferenceType::Grid, Some("orders"), GetOptions::bypass_cache())
        .await;
    println!("   📖 offline read sees columnOrder = {}\n", doc.payload["columnOrder"]);

    // ─────────────────────────────────────────────────────────────────────────
    // 4. Reconnect
    // ─────────────────────────────────────────────────────────────────────────
    println!("📶 Back online...");
    online_tx.send_replace(true);
    tokio::time::sleep(Duration::from_millis(100)).await;
    let health = engine.health();
    println!("   ✓ Status: {:?}, queued writes: {}\n", health.status, health.pending_queue_items);

    // ─────────────────────────────────────────────────────────────────────────
    // 5. Metrics
    // ─────────────────────────────────────────────────────────────────────────
    println!("📊 Metrics:");
    dump_metrics(&snapshotter);

    // ─────────────────────────────────────────────────────────────────────────
    // 6. Teardown
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🛑 Tearing down...");
    engine.teardown().await;
    println!("   ✓ State: {}", engine.state());

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║                    Example complete!                          ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    Ok(())
}

fn dump_metrics(snapshotter: &Snapshotter) {
    let mut lines: Vec<String> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, value)| {
            let (_, key) = composite_key.into_parts();
            let labels: Vec<_> = key.labels().map(|l| format!("{}={}", l.key(), l.value())).collect();
            let label_str = if labels.is_empty() {
                String::new()
            } else {
                format!("{{{}}}", labels.join(","))
            };
            let rendered = match value {
                DebugValue::Counter(v) => v.to_string(),
                DebugValue::Gauge(v) => format!("{:.2}", v.into_inner()),
                DebugValue::Histogram(samples) => format!("{} samples", samples.len()),
            };
            format!("{}{} = {}", key.name(), label_str, rendered)
        })
        .collect();
    lines.sort();
    for line in lines {
        println!("   └─ {}", line);
    }
}
