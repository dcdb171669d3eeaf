//! Move backend: full copy into RAM staging, bind-mounted over the origin
//!
//! Works for any file or directory; pin and unpin cost is proportional to
//! the full tree size. While pinned, the origin is shadowed by the bind
//! mount, so sync reaches it through a temporary bind of the parent
//! directory (a plain bind does not replicate child mounts).

use crate::backend::PinBackend;
use crate::sysops::SystemOps;
use crate::usage::tree_size;
use async_trait::async_trait;
use rampipe_common::config::StagingConfig;
use rampipe_common::{Backend, BackendMeta, Error, PinnedItem, Result};
use std::ffi::OsStr;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

pub struct MoveBackend {
    ops: Arc<dyn SystemOps>,
    ramdisk_dir: PathBuf,
}

impl MoveBackend {
    #[must_use]
    pub fn new(ops: Arc<dyn SystemOps>, config: &StagingConfig) -> Self {
        Self {
            ops,
            ramdisk_dir: config.ramdisk_dir.clone(),
        }
    }

    fn split(path: &Path) -> Result<(&Path, &OsStr)> {
        match (path.parent(), path.file_name()) {
            (Some(parent), Some(name)) => Ok((parent, name)),
            _ => Err(Error::invalid_request(format!(
                "cannot pin {}",
                path.display()
            ))),
        }
    }
}

#[async_trait]
impl PinBackend for MoveBackend {
    fn kind(&self) -> Backend {
        Backend::Move
    }

    async fn pin(&self, path: &Path) -> Result<PinnedItem> {
        let meta = std::fs::metadata(path)?;
        if self.ops.path_in_use(path) {
            return Err(Error::InUse { path: path.into() });
        }
        let (_, name) = Self::split(path)?;
        let inode = meta.ino();
        let staging_path = self
            .ramdisk_dir
            .join(format!("{inode}-{}", name.to_string_lossy()));
        if staging_path.exists() {
            return Err(Error::precondition(format!(
                "staging path already exists: {}",
                staging_path.display()
            )));
        }

        if let Err(e) = self.ops.copy_tree(path, &staging_path).await {
            if let Err(remove) = self.ops.remove_tree(&staging_path) {
                warn!("unwind of failed pin left staging behind: {remove}");
            }
            return Err(e);
        }
        if let Err(e) = self.ops.bind_mount(&staging_path, path).await {
            if let Err(remove) = self.ops.remove_tree(&staging_path) {
                warn!("unwind of failed pin left staging behind: {remove}");
            }
            return Err(e);
        }

        debug!("move pin: {} staged at {}", path.display(), staging_path.display());
        Ok(PinnedItem::new(
            path.into(),
            inode,
            BackendMeta::Move { staging_path },
        ))
    }

    async fn unpin(&self, item: &PinnedItem) -> Result<()> {
        let BackendMeta::Move { staging_path } = &item.meta else {
            return Err(Error::State(format!(
                "move backend asked to unpin a {} item",
                item.backend()
            )));
        };
        if self.ops.path_in_use(&item.path) {
            return Err(Error::InUse {
                path: item.path.clone(),
            });
        }
        self.ops.unmount(&item.path).await?;
        // Origin is visible again; propagate RAM-side deletions too
        self.ops.mirror_tree(staging_path, &item.path).await?;
        self.ops.remove_tree(staging_path)?;
        debug!("move unpin: {} restored", item.path.display());
        Ok(())
    }

    async fn sync(&self, item: &PinnedItem) -> Result<()> {
        let BackendMeta::Move { staging_path } = &item.meta else {
            return Err(Error::State(format!(
                "move backend asked to sync a {} item",
                item.backend()
            )));
        };
        let (parent, name) = Self::split(&item.path)?;
        // The shadowed origin is reachable through a fresh bind of the
        // parent: child mounts are not replicated into a non-recursive bind
        let scratch = self
            .ramdisk_dir
            .join(format!(".origin-{}", item.original_inode));
        self.ops.create_dir_all(&scratch)?;
        self.ops.bind_mount(parent, &scratch).await?;
        let result = self
            .ops
            .mirror_tree(staging_path, &scratch.join(name))
            .await;
        if let Err(e) = self.ops.unmount(&scratch).await {
            warn!("sync scratch unmount failed: {e}");
        }
        if let Err(e) = self.ops.remove_tree(&scratch) {
            warn!("sync scratch cleanup failed: {e}");
        }
        result
    }

    async fn usage(&self, item: &PinnedItem) -> Result<u64> {
        let BackendMeta::Move { staging_path } = &item.meta else {
            return Ok(0);
        };
        tree_size(staging_path).map_err(Into::into)
    }
}
