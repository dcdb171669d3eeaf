//! Control-plane core: request dispatch under per-path mutual exclusion

use dashmap::DashMap;
use rampipe_backend::BackendSet;
use rampipe_common::{Backend, BackendMeta, Error, Result};
use rampipe_estimator::WorkloadEstimator;
use rampipe_proto::{Action, ItemStatus, Request, Response, StatusData};
use rampipe_state::StateStore;
use rampipe_sync::SyncEngine;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Daemon state shared by every connection worker and background task
pub struct Daemon {
    state: Arc<StateStore>,
    backends: Arc<BackendSet>,
    sync: Arc<SyncEngine>,
    estimator: Arc<WorkloadEstimator>,
    /// Serializes pin/unpin per canonical path
    locks: DashMap<PathBuf, Arc<Mutex<()>>>,
}

impl Daemon {
    #[must_use]
    pub fn new(
        state: Arc<StateStore>,
        backends: Arc<BackendSet>,
        sync: Arc<SyncEngine>,
        estimator: Arc<WorkloadEstimator>,
    ) -> Self {
        Self {
            state,
            backends,
            sync,
            estimator,
            locks: DashMap::new(),
        }
    }

    /// Dispatch one client request to a structured response; component
    /// errors never escape as panics or broken connections
    pub async fn handle(&self, request: Request) -> Response {
        match request.action {
            Action::Pin => {
                let backend = Backend::from(request.mode.unwrap_or_default());
                match request.path {
                    Some(path) => match self.pin(&path, backend).await {
                        Ok(canonical) => {
                            Response::success(format!("pinned {} ({backend})", canonical.display()))
                        }
                        Err(e) => Response::error(e.to_string()),
                    },
                    None => Response::error("pin requires a path"),
                }
            }
            Action::Unpin => match request.path {
                Some(path) => match self.unpin(&path).await {
                    Ok(canonical) => {
                        Response::success(format!("unpinned {}", canonical.display()))
                    }
                    Err(e) => Response::error(e.to_string()),
                },
                None => Response::error("unpin requires a path"),
            },
            Action::Status => Response::with_status_data(self.status().await),
            Action::Sync => {
                let failures = self.sync.sync_all().await;
                if failures == 0 {
                    Response::success("sync complete")
                } else {
                    Response::success(format!("sync complete with {failures} failure(s)"))
                }
            }
        }
    }

    /// Pin `path` with the given strategy
    ///
    /// Returns the canonical path that was pinned. Holds the per-path lock
    /// across the backend call and the state write, so concurrent requests
    /// for one path serialize and exactly one of two racing pins wins.
    pub async fn pin(&self, path: &Path, backend: Backend) -> Result<PathBuf> {
        let path = canonicalize(path)?;
        let lock = self.path_lock(&path);
        let _guard = lock.lock().await;

        if self.state.contains(&path) {
            return Err(Error::AlreadyPinned(path));
        }
        let item = self.backends.get(backend).pin(&path).await?;
        let loop_device = match &item.meta {
            BackendMeta::Snapshot { loop_device, .. } => Some(loop_device.clone()),
            _ => None,
        };
        // The response must not be sent before the mutation is durable
        self.state.insert(item)?;
        self.estimator.mark_pinned(&path, true, loop_device);
        info!("pinned {} ({backend})", path.display());
        Ok(path)
    }

    /// Reconcile and release the pin on `path`
    pub async fn unpin(&self, path: &Path) -> Result<PathBuf> {
        let path = canonicalize(path)?;
        let lock = self.path_lock(&path);
        let _guard = lock.lock().await;

        let item = self
            .state
            .get(&path)
            .ok_or_else(|| Error::NotPinned(path.clone()))?;
        self.backends.for_item(&item).unpin(&item).await?;
        self.state.remove(&path)?;
        self.estimator.mark_pinned(&path, false, None);
        info!("unpinned {}", path.display());
        Ok(path)
    }

    /// Per-item backend tag and measured RAM usage plus a total
    ///
    /// Read-only and lock-free by design: a concurrent pin or unpin may
    /// make the figures slightly stale, never block them.
    pub async fn status(&self) -> StatusData {
        let mut data = StatusData::default();
        for item in self.state.snapshot() {
            let bytes = match self.backends.for_item(&item).usage(&item).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    debug!("usage walk for {} failed: {e}", item.path.display());
                    0
                }
            };
            data.total_bytes += bytes;
            data.items.insert(
                item.path.display().to_string(),
                ItemStatus {
                    backend: item.backend(),
                    bytes,
                },
            );
        }
        data
    }

    /// Unpin everything currently recorded, logging failures; used by the
    /// `--unpin-all` recovery flag
    pub async fn unpin_all(&self) -> usize {
        let mut failures = 0;
        for item in self.state.snapshot() {
            if let Err(e) = self.unpin(&item.path).await {
                warn!("unpin of {} failed: {e}", item.path.display());
                failures += 1;
            }
        }
        failures
    }

    fn path_lock(&self, path: &Path) -> Arc<Mutex<()>> {
        self.locks
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

fn canonicalize(path: &Path) -> Result<PathBuf> {
    std::fs::canonicalize(path)
        .map_err(|e| Error::invalid_request(format!("cannot resolve {}: {e}", path.display())))
}
