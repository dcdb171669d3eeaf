//! Automatic mode: filesystem events in, promote/demote execution out
//!
//! A notify watcher feeds write events into the estimator from its own
//! callback thread; the consumer task executes the estimator's queued
//! decisions through the daemon, always with the snapshot backend
//! (automatic promotion is file-granularity only).

use crate::daemon::Daemon;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use rampipe_common::{Backend, Error};
use rampipe_estimator::{HeatAction, WorkloadEstimator};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Start watching the configured paths; the returned watcher must stay
/// alive for events to keep flowing
pub fn start(
    paths: &[PathBuf],
    estimator: Arc<WorkloadEstimator>,
) -> notify::Result<RecommendedWatcher> {
    let mut watcher = RecommendedWatcher::new(
        move |result: notify::Result<Event>| match result {
            Ok(event) => {
                let is_write = matches!(
                    event.kind,
                    EventKind::Modify(_) | EventKind::Create(_) | EventKind::Remove(_)
                );
                let now = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_secs_f64();
                for path in &event.paths {
                    estimator.observe(path, now, is_write);
                }
            }
            Err(e) => warn!("watch error: {e}"),
        },
        notify::Config::default(),
    )?;
    for path in paths {
        watcher.watch(path, RecursiveMode::Recursive)?;
    }
    Ok(watcher)
}

/// Execute queued promote/demote decisions until shutdown
///
/// Failures are logged, never propagated: a vanished path or a busy target
/// just leaves the sample pending until the next observation re-evaluates.
pub async fn run_actions(
    daemon: Arc<Daemon>,
    mut actions: UnboundedReceiver<HeatAction>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            action = actions.recv() => {
                let Some(action) = action else { return };
                match action {
                    HeatAction::Promote(path) => {
                        match daemon.pin(&path, Backend::Snapshot).await {
                            Ok(_) => {}
                            Err(Error::AlreadyPinned(_)) => {}
                            Err(e) => debug!(
                                "promotion of {} skipped: {e}",
                                path.display()
                            ),
                        }
                    }
                    HeatAction::Demote(path) => {
                        match daemon.unpin(&path).await {
                            Ok(_) => {}
                            Err(Error::NotPinned(_)) => {}
                            Err(e) => debug!(
                                "demotion of {} deferred: {e}",
                                path.display()
                            ),
                        }
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
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
    use rampipe_backend::BackendSet;
    use rampipe_common::Config;
    use rampipe_state::StateStore;
    use rampipe_sync::SyncEngine;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    fn daemon(state_dir: &TempDir, fake: Arc<FakeSystem>) -> (Arc<Daemon>, Arc<WorkloadEstimator>) {
        let config = Config::default();
        let state = Arc::new(StateStore::open(state_dir.path().join("state.json")).unwrap());
        let backends = Arc::new(BackendSet::new(fake as Arc<dyn SystemOps>, &config));
        let sync = Arc::new(SyncEngine::new(state.clone(), backends.clone()));
        let (estimator, _rx) = WorkloadEstimator::new(config.thresholds.clone());
        let estimator = Arc::new(estimator);
        (
            Arc::new(Daemon::new(state, backends, sync, estimator.clone())),
            estimator,
        )
    }

    #[tokio::test]
    async fn test_promote_executes_snapshot_pin() {
        let state_dir = TempDir::new().unwrap();
        let origin = TempDir::new().unwrap();
        let target = origin.path().join("hot.db");
        std::fs::write(&target, b"data").unwrap();
        let fake = Arc::new(FakeSystem::new());
        let (daemon, _est) = self::daemon(&state_dir, fake.clone());

        let (tx, rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(false);
        tx.send(HeatAction::Promote(target.clone())).unwrap();
        let consumer = tokio::spawn(run_actions(daemon.clone(), rx, stop_rx));

        tokio::task::yield_now().await;
        stop_tx.send(true).unwrap();
        consumer.await.unwrap();

        let canonical = target.canonicalize().unwrap();
        let item = daemon.status().await;
        assert!(item.items.contains_key(&canonical.display().to_string()));
        assert!(fake.calls().iter().any(|c| c.starts_with("snapshot_create")));
    }

    #[tokio::test]
    async fn test_vanished_path_promotion_is_silently_skipped() {
        let state_dir = TempDir::new().unwrap();
        let fake = Arc::new(FakeSystem::new());
        let (daemon, _est) = self::daemon(&state_dir, fake.clone());

        let (tx, rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(false);
        tx.send(HeatAction::Promote("/vanished/file".into())).unwrap();
        let consumer = tokio::spawn(run_actions(daemon.clone(), rx, stop_rx));

        tokio::task::yield_now().await;
        stop_tx.send(true).unwrap();
        consumer.await.unwrap();

        assert!(fake.calls().is_empty());
        assert!(daemon.status().await.items.is_empty());
    }
}
