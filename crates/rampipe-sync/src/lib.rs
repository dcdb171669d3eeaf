//! RamPipe Reconciliation Engine
//!
//! Merges pinned items' RAM-side state back to origin storage without
//! releasing the pins. Runs on demand (client `sync`), periodically, and
//! as the shutdown handler's final pass. One broken item never aborts the
//! sync of the rest.

use rampipe_backend::BackendSet;
use rampipe_common::{PinnedItem, Result};
use rampipe_state::StateStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub struct SyncEngine {
    state: Arc<StateStore>,
    backends: Arc<BackendSet>,
}

impl SyncEngine {
    #[must_use]
    pub fn new(state: Arc<StateStore>, backends: Arc<BackendSet>) -> Self {
        Self { state, backends }
    }

    /// Backend-specific partial sync of one item, keeping the pin
    pub async fn sync_one(&self, item: &PinnedItem) -> Result<()> {
        self.backends.for_item(item).sync(item).await
    }

    /// Sync every pinned item, logging per-item failures; returns how many
    /// items failed
    pub async fn sync_all(&self) -> usize {
        let items = self.state.snapshot();
        let mut failures = 0;
        for item in &items {
            if let Err(e) = self.sync_one(item).await {
                // Item remains pinned; the next scheduled pass retries
                warn!("sync of {} failed: {e}", item.path.display());
                failures += 1;
            } else {
                debug!("synced {}", item.path.display());
            }
        }
        if !items.is_empty() {
            info!("sync pass: {} item(s), {failures} failure(s)", items.len());
        }
        failures
    }

    /// Periodic sync loop; returns when the shutdown signal fires
    pub async fn run_periodic(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick of a tokio interval fires immediately; skip it so
        // the first pass lands one full interval after startup
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sync_all().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!("periodic sync stopping");
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rampipe_backend::fake::FakeSystem;
    use rampipe_backend::sysops::SystemOps;
    use rampipe_common::{BackendMeta, Config, PinnedItem};
    use tempfile::tempdir;

    fn engine_with(fake: Arc<FakeSystem>, dir: &std::path::Path) -> SyncEngine {
        let config = Config::default();
        let state = Arc::new(StateStore::open(dir.join("state.json")).unwrap());
        let backends = Arc::new(BackendSet::new(fake as Arc<dyn SystemOps>, &config));
        SyncEngine::new(state, backends)
    }

    fn move_item(path: &str, inode: u64) -> PinnedItem {
        PinnedItem::new(
            path.into(),
            inode,
            BackendMeta::Move {
                staging_path: format!("/mnt/rampipe/{inode}-x").into(),
            },
        )
    }

    #[tokio::test]
    async fn test_sync_all_empty_state_is_quiet() {
        let dir = tempdir().unwrap();
        let fake = Arc::new(FakeSystem::new());
        let engine = engine_with(fake.clone(), dir.path());
        assert_eq!(engine.sync_all().await, 0);
        assert!(fake.calls().is_empty());
    }

    #[tokio::test]
    async fn test_sync_all_continues_past_failures() {
        let dir = tempdir().unwrap();
        let fake = Arc::new(FakeSystem::new());
        let engine = engine_with(fake.clone(), dir.path());

        // A move item that will fail its mirror, then an overlay item
        // whose sync is a no-op and must still be reached
        engine.state.insert(move_item("/a-first", 1)).unwrap();
        engine
            .state
            .insert(PinnedItem::new(
                "/b-second".into(),
                2,
                BackendMeta::Overlay {
                    overlay_id: "hot-2".into(),
                    upper_dir: "/mnt/rampipe/overlay/hot-2/upper".into(),
                    work_dir: "/mnt/rampipe/overlay/hot-2/work".into(),
                    merged_dir: "/mnt/rampipe/overlay/hot-2/merged".into(),
                },
            ))
            .unwrap();
        fake.fail_on("mirror_tree");

        let failures = engine.sync_all().await;
        assert_eq!(failures, 1);
        // Both items stay pinned regardless of the failure
        assert_eq!(engine.state.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_sync_fires_and_stops() {
        let dir = tempdir().unwrap();
        let fake = Arc::new(FakeSystem::new());
        let engine = Arc::new(engine_with(fake.clone(), dir.path()));
        engine.state.insert(move_item("/a", 1)).unwrap();

        let (tx, rx) = watch::channel(false);
        let runner = {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine.run_periodic(Duration::from_secs(60), rx).await;
            })
        };

        // Two intervals elapse -> two sync passes
        tokio::time::sleep(Duration::from_secs(130)).await;
        let passes = fake
            .calls()
            .iter()
            .filter(|c| c.starts_with("mirror_tree"))
            .count();
        assert_eq!(passes, 2);

        tx.send(true).unwrap();
        runner.await.unwrap();
    }
}
