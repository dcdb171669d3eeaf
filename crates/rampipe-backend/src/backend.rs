//! The pinning capability and backend dispatch

use crate::move_copy::MoveBackend;
use crate::overlay::OverlayBackend;
use crate::snapshot::SnapshotBackend;
use crate::sysops::SystemOps;
use async_trait::async_trait;
use rampipe_common::{Backend, Config, PinnedItem, Result};
use std::path::Path;
use std::sync::Arc;

/// One pinning strategy: acquire and release a RAM-resident view bound
/// over the original path
///
/// `pin` and `unpin` are not reentrant per path; the control plane holds
/// the per-path lock for the duration of either call. Both refuse targets
/// with open descriptors, and a failed multi-step `pin` unwinds every step
/// already taken before returning.
#[async_trait]
pub trait PinBackend: Send + Sync {
    /// The strategy tag this backend implements
    fn kind(&self) -> Backend;

    /// Materialize a RAM-resident view over `path`
    async fn pin(&self, path: &Path) -> Result<PinnedItem>;

    /// Reconcile RAM-side state to the origin and release the view
    async fn unpin(&self, item: &PinnedItem) -> Result<()>;

    /// Partial sync without releasing the pin; a no-op for backends with
    /// no partial-sync primitive
    async fn sync(&self, item: &PinnedItem) -> Result<()>;

    /// Measured RAM usage of the item's backing storage, in bytes
    async fn usage(&self, item: &PinnedItem) -> Result<u64>;
}

/// All three backends, dispatched on the stored strategy tag
pub struct BackendSet {
    snapshot: SnapshotBackend,
    move_copy: MoveBackend,
    overlay: OverlayBackend,
}

impl BackendSet {
    /// Build the backend set over one shared [`SystemOps`]
    #[must_use]
    pub fn new(ops: Arc<dyn SystemOps>, config: &Config) -> Self {
        Self {
            snapshot: SnapshotBackend::new(ops.clone(), &config.snapshot),
            move_copy: MoveBackend::new(ops.clone(), &config.staging),
            overlay: OverlayBackend::new(ops, &config.staging),
        }
    }

    /// Backend implementing the given strategy
    #[must_use]
    pub fn get(&self, kind: Backend) -> &dyn PinBackend {
        match kind {
            Backend::Snapshot => &self.snapshot,
            Backend::Move => &self.move_copy,
            Backend::Overlay => &self.overlay,
        }
    }

    /// Backend for an existing item's stored strategy tag
    #[must_use]
    pub fn for_item(&self, item: &PinnedItem) -> &dyn PinBackend {
        self.get(item.backend())
    }
}
