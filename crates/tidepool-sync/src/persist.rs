use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use parking_lot::Mutex;
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::engine::SyncEngine;
use crate::error::StoreError;
use crate::registry::RoomRegistry;
use crate::store::SnapshotStore;

pub const DEFAULT_SNAPSHOT_INTERVAL: Duration = Duration::from_secs(10);

pub type SharedEngine = Arc<Mutex<SyncEngine>>;

/// Load the registry from `store`. A missing or unreadable snapshot yields an
/// empty registry; startup never fails here.
pub async fn restore(store: &SnapshotStore) -> RoomRegistry {
    match store.load().await {
        Ok(states) => {
            info!(
                path = %store.path().display(),
                rooms = states.len(),
                "restored room states from snapshot"
            );
            RoomRegistry::from_states(states)
        }
        Err(err) if err.is_missing() => {
            info!(path = %store.path().display(), "no snapshot found; starting empty");
            RoomRegistry::new()
        }
        Err(err) => {
            warn!(error = %err, "failed to restore snapshot; starting empty");
            RoomRegistry::new()
        }
    }
}

/// Copy the current room states out of the engine and write them to `store`.
/// Returns the number of rooms written.
pub async fn write_snapshot(
    engine: &Mutex<SyncEngine>,
    store: &SnapshotStore,
) -> Result<usize, StoreError> {
    // The guard is released before any I/O happens.
    let states = engine.lock().states();
    store.save(&states).await?;
    Ok(states.len())
}

/// Write a snapshot now and then every `interval`, forever. Failures are
/// logged and the next tick tries again from scratch.
pub fn spawn_snapshotter(
    engine: SharedEngine,
    store: SnapshotStore,
    interval: Duration,
) -> JoinHandle<()> {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tokio::spawn(async move {
        loop {
            ticker.tick().await;
            flush(&engine, &store).await;
        }
    })
}

/// Best-effort snapshot write with logging and metrics, used by the timer and
/// at shutdown.
pub async fn flush(engine: &Mutex<SyncEngine>, store: &SnapshotStore) {
    match write_snapshot(engine, store).await {
        Ok(rooms) => {
            counter!("tidepool_snapshot_writes_total", 1, "result" => "ok");
            debug!(rooms, path = %store.path().display(), "snapshot written");
        }
        Err(err) => {
            counter!("tidepool_snapshot_writes_total", 1, "result" => "error");
            warn!(error = %err, "snapshot write failed");
        }
    }
}

/// Stop the timer task, wait for it to unwind, then write the final snapshot.
/// The timer and the final write share one staging file, so they must not overlap.
pub async fn shutdown(
    snapshotter: JoinHandle<()>,
    engine: &Mutex<SyncEngine>,
    store: &SnapshotStore,
) {
    snapshotter.abort();
    let _ = snapshotter.await;
    flush(engine, store).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::SyncConfig;
    use crate::peer::{ConnectionId, Peer, PeerHandle};
    use serde_json::json;
    use uuid::Uuid;

    struct Silent(ConnectionId);

    impl Peer for Silent {
        fn id(&self) -> ConnectionId {
            self.0
        }

        fn send(&self, _text: &str) {}

        fn is_open(&self) -> bool {
            true
        }
    }

    fn shared_engine(registry: RoomRegistry) -> SharedEngine {
        Arc::new(Mutex::new(SyncEngine::with_registry(
            SyncConfig {
                token: "t".into(),
            },
            registry,
        )))
    }

    #[tokio::test]
    async fn restore_from_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let registry = restore(&SnapshotStore::new(dir.path().join("none.json"))).await;
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn restore_from_corrupt_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rooms.json");
        std::fs::write(&path, "{ not json").unwrap();
        let registry = restore(&SnapshotStore::new(&path)).await;
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn write_snapshot_skips_unset_rooms() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("rooms.json"));
        let engine = shared_engine(RoomRegistry::new());
        let peer: PeerHandle = Arc::new(Silent(Uuid::new_v4()));
        {
            let mut guard = engine.lock();
            guard.join(&peer, "t", "set").unwrap();
            guard.join(&peer, "t", "unset").unwrap();
            guard.update(peer.id(), "set", r#"{"v":true}"#).unwrap();
        }

        assert_eq!(write_snapshot(&engine, &store).await.unwrap(), 1);
        let restored = restore(&store).await;
        assert_eq!(restored.len(), 1);
        assert_eq!(
            restored.get("set").unwrap().state(),
            Some(&json!({"v": true}))
        );
        assert!(restored.get("set").unwrap().members().is_empty());
    }

    #[tokio::test]
    async fn snapshotter_writes_immediately_and_on_every_tick() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("rooms.json"));
        let engine = shared_engine(RoomRegistry::new());
        let peer: PeerHandle = Arc::new(Silent(Uuid::new_v4()));
        engine.lock().join(&peer, "t", "r1").unwrap();
        engine.lock().update(peer.id(), "r1", "1").unwrap();

        let handle = spawn_snapshotter(engine.clone(), store.clone(), Duration::from_millis(50));
        wait_for_state(&store, json!(1)).await;

        engine.lock().update(peer.id(), "r1", "2").unwrap();
        wait_for_state(&store, json!(2)).await;

        handle.abort();
    }

    #[tokio::test]
    async fn shutdown_stops_timer_before_final_write() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("rooms.json"));
        let engine = shared_engine(RoomRegistry::new());
        let peer: PeerHandle = Arc::new(Silent(Uuid::new_v4()));
        engine.lock().join(&peer, "t", "r1").unwrap();
        engine.lock().update(peer.id(), "r1", "1").unwrap();

        let handle = spawn_snapshotter(engine.clone(), store.clone(), Duration::from_millis(1));
        wait_for_state(&store, json!(1)).await;
        engine.lock().update(peer.id(), "r1", "2").unwrap();

        shutdown(handle, &engine, &store).await;
        assert_eq!(store.load().await.unwrap().get("r1"), Some(&json!(2)));
        assert!(!dir.path().join("rooms.json.tmp").exists());

        // Nothing writes after shutdown returns.
        engine.lock().update(peer.id(), "r1", "3").unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.load().await.unwrap().get("r1"), Some(&json!(2)));
    }

    async fn wait_for_state(store: &SnapshotStore, expected: serde_json::Value) {
        for _ in 0..200 {
            if let Ok(states) = store.load().await {
                if states.get("r1") == Some(&expected) {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("snapshot never contained {expected}");
    }
}
