//! Overlay backend: copy-up overlay with a RAM-backed upper layer
//!
//! Directories only. The origin stays on disk as the read-only lower
//! layer; only modified and added entries occupy RAM, and unpin merges
//! just the upper layer back, far cheaper than a whole-tree mirror.

use crate::backend::PinBackend;
use crate::sysops::SystemOps;
use crate::usage::tree_size;
use async_trait::async_trait;
use rampipe_common::config::StagingConfig;
use rampipe_common::{Backend, BackendMeta, Error, PinnedItem, Result};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

pub struct OverlayBackend {
    ops: Arc<dyn SystemOps>,
    overlay_dir: PathBuf,
}

impl OverlayBackend {
    #[must_use]
    pub fn new(ops: Arc<dyn SystemOps>, config: &StagingConfig) -> Self {
        Self {
            ops,
            overlay_dir: config.overlay_dir.clone(),
        }
    }

    /// A nested submount cannot be safely hidden under an overlay lower
    /// layer; refuse before touching anything
    fn check_no_nested_mounts(&self, path: &Path) -> Result<()> {
        for entry in self.ops.list_mounts()? {
            if entry.target != path && entry.target.starts_with(path) {
                return Err(Error::precondition(format!(
                    "{} has a mount point nested at {}",
                    path.display(),
                    entry.target.display()
                )));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl PinBackend for OverlayBackend {
    fn kind(&self) -> Backend {
        Backend::Overlay
    }

    async fn pin(&self, path: &Path) -> Result<PinnedItem> {
        let meta = std::fs::metadata(path)?;
        if !meta.is_dir() {
            return Err(Error::NotSupported(format!(
                "overlay backend pins directories only: {}",
                path.display()
            )));
        }
        self.check_no_nested_mounts(path)?;
        if self.ops.path_in_use(path) {
            return Err(Error::InUse { path: path.into() });
        }
        let inode = meta.ino();
        let overlay_id = format!("hot-{inode}");
        let base = self.overlay_dir.join(&overlay_id);
        let upper_dir = base.join("upper");
        let work_dir = base.join("work");
        let merged_dir = base.join("merged");
        for dir in [&upper_dir, &work_dir, &merged_dir] {
            self.ops.create_dir_all(dir)?;
        }

        if let Err(e) = self
            .ops
            .mount_overlay(path, &upper_dir, &work_dir, &merged_dir)
            .await
        {
            if let Err(remove) = self.ops.remove_tree(&base) {
                warn!("unwind of failed pin left overlay dirs behind: {remove}");
            }
            return Err(e);
        }
        if let Err(e) = self.ops.bind_mount(&merged_dir, path).await {
            if let Err(unmount) = self.ops.unmount(&merged_dir).await {
                warn!("unwind of failed pin left overlay mounted: {unmount}");
            }
            if let Err(remove) = self.ops.remove_tree(&base) {
                warn!("unwind of failed pin left overlay dirs behind: {remove}");
            }
            return Err(e);
        }

        debug!("overlay pin: {} as {overlay_id}", path.display());
        Ok(PinnedItem::new(
            path.into(),
            inode,
            BackendMeta::Overlay {
                overlay_id,
                upper_dir,
                work_dir,
                merged_dir,
            },
        ))
    }

    async fn unpin(&self, item: &PinnedItem) -> Result<()> {
        let BackendMeta::Overlay {
            overlay_id,
            upper_dir,
            merged_dir,
            ..
        } = &item.meta
        else {
            return Err(Error::State(format!(
                "overlay backend asked to unpin a {} item",
                item.backend()
            )));
        };
        if self.ops.path_in_use(&item.path) {
            return Err(Error::InUse {
                path: item.path.clone(),
            });
        }
        self.ops.unmount(&item.path).await?;
        self.ops.unmount(merged_dir).await?;
        // Only the upper layer diverged from the origin
        self.ops.merge_upper(upper_dir, &item.path).await?;
        self.ops.remove_tree(&self.overlay_dir.join(overlay_id))?;
        debug!("overlay unpin: {} merged {overlay_id}", item.path.display());
        Ok(())
    }

    async fn sync(&self, item: &PinnedItem) -> Result<()> {
        // Changes are live at the path through the mounted view; the
        // durable merge happens at unpin
        debug!("overlay item {} syncs at unpin only", item.path.display());
        Ok(())
    }

    async fn usage(&self, item: &PinnedItem) -> Result<u64> {
        let BackendMeta::Overlay { upper_dir, .. } = &item.meta else {
            return Ok(0);
        };
        tree_size(upper_dir).map_err(Into::into)
    }
}
