//! Snapshot backend: loop device + device-mapper thin snapshot
//!
//! Best suited to single regular files. The origin and the snapshot share
//! blocks until writes diverge them; RAM-side changes reach the origin
//! only at unpin, through the snapshot merge.

use crate::backend::PinBackend;
use crate::staging::pool_device;
use crate::sysops::SystemOps;
use crate::usage::tree_size;
use async_trait::async_trait;
use rampipe_common::config::SnapshotConfig;
use rampipe_common::{Backend, BackendMeta, Error, PinnedItem, Result};
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct SnapshotBackend {
    ops: Arc<dyn SystemOps>,
    pool: String,
}

impl SnapshotBackend {
    #[must_use]
    pub fn new(ops: Arc<dyn SystemOps>, _config: &SnapshotConfig) -> Self {
        Self {
            ops,
            pool: pool_device(),
        }
    }

    fn mapping_names(inode: u64) -> (String, String) {
        (format!("hot-{inode}"), format!("hot-{inode}-cow"))
    }
}

#[async_trait]
impl PinBackend for SnapshotBackend {
    fn kind(&self) -> Backend {
        Backend::Snapshot
    }

    async fn pin(&self, path: &Path) -> Result<PinnedItem> {
        let meta = std::fs::metadata(path)?;
        if !meta.is_file() {
            return Err(Error::NotSupported(format!(
                "snapshot backend pins regular files only: {}",
                path.display()
            )));
        }
        if self.ops.path_in_use(path) {
            return Err(Error::InUse { path: path.into() });
        }
        let inode = meta.ino();
        let (origin_name, cow_name) = Self::mapping_names(inode);

        let loop_device = self.ops.loop_attach(path).await?;

        if let Err(e) = self
            .ops
            .snapshot_create(&loop_device, &self.pool, &origin_name, &cow_name)
            .await
        {
            if let Err(detach) = self.ops.loop_detach(&loop_device).await {
                warn!("unwind of failed pin left {loop_device} attached: {detach}");
            }
            return Err(e);
        }

        let cow_device = format!("/dev/mapper/{cow_name}");
        if let Err(e) = self.ops.bind_mount(Path::new(&cow_device), path).await {
            if let Err(remove) = self
                .ops
                .mapping_remove(&[&cow_name, &origin_name])
                .await
            {
                warn!("unwind of failed pin left mappings behind: {remove}");
            }
            if let Err(detach) = self.ops.loop_detach(&loop_device).await {
                warn!("unwind of failed pin left {loop_device} attached: {detach}");
            }
            return Err(e);
        }

        debug!(
            "snapshot pin: {} via {loop_device} as {cow_name}",
            path.display()
        );
        Ok(PinnedItem::new(
            path.into(),
            inode,
            BackendMeta::Snapshot {
                loop_device,
                origin_name,
                cow_name,
            },
        ))
    }

    async fn unpin(&self, item: &PinnedItem) -> Result<()> {
        let BackendMeta::Snapshot {
            loop_device,
            origin_name,
            cow_name,
        } = &item.meta
        else {
            return Err(Error::State(format!(
                "snapshot backend asked to unpin a {} item",
                item.backend()
            )));
        };
        if self.ops.path_in_use(&item.path) {
            return Err(Error::InUse {
                path: item.path.clone(),
            });
        }
        self.ops.unmount(&item.path).await?;
        self.ops.snapshot_merge(cow_name).await?;
        self.ops.mapping_remove(&[cow_name, origin_name]).await?;
        self.ops.loop_detach(loop_device).await?;
        debug!("snapshot unpin: {} merged back", item.path.display());
        Ok(())
    }

    async fn sync(&self, item: &PinnedItem) -> Result<()> {
        // No partial-sync primitive; data reaches the origin at unpin
        // through the snapshot merge
        debug!("snapshot item {} syncs at unpin only", item.path.display());
        Ok(())
    }

    async fn usage(&self, item: &PinnedItem) -> Result<u64> {
        tree_size(&item.path).map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeSystem;
    use rampipe_common::Config;

    fn backend(fake: &Arc<FakeSystem>) -> SnapshotBackend {
        let config = Config::default();
        SnapshotBackend::new(fake.clone() as Arc<dyn SystemOps>, &config.snapshot)
    }

    fn write_target(dir: &tempfile::TempDir) -> std::path::PathBuf {
        let path = dir.path().join("hot.db");
        std::fs::write(&path, b"hot data").unwrap();
        path
    }

    #[tokio::test]
    async fn test_pin_sequences_device_then_mount() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_target(&dir);
        let fake = Arc::new(FakeSystem::new());

        let item = backend(&fake).pin(&path).await.unwrap();

        let BackendMeta::Snapshot {
            loop_device,
            origin_name,
            cow_name,
        } = &item.meta
        else {
            panic!("wrong meta variant");
        };
        assert_eq!(loop_device, "/dev/loop0");
        assert_eq!(origin_name, &format!("hot-{}", item.original_inode));
        assert_eq!(cow_name, &format!("hot-{}-cow", item.original_inode));
        assert!(fake.is_mounted(&path));
        let calls = fake.calls();
        assert!(calls[0].starts_with("loop_attach"));
        assert!(calls[1].starts_with("snapshot_create"));
        assert!(calls[2].starts_with("bind_mount"));
    }

    #[tokio::test]
    async fn test_pin_refuses_directory() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeSystem::new());
        let err = backend(&fake).pin(dir.path()).await.unwrap_err();
        assert!(matches!(err, Error::NotSupported(_)));
        assert!(fake.calls().is_empty());
    }

    #[tokio::test]
    async fn test_pin_refuses_open_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_target(&dir);
        let fake = Arc::new(FakeSystem::new());
        fake.set_in_use(&path);

        let err = backend(&fake).pin(&path).await.unwrap_err();
        assert!(matches!(err, Error::InUse { .. }));
        assert!(fake.calls().is_empty());
    }

    #[tokio::test]
    async fn test_failed_bind_mount_unwinds_device_steps() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_target(&dir);
        let fake = Arc::new(FakeSystem::new());
        fake.fail_on("bind_mount");

        let err = backend(&fake).pin(&path).await.unwrap_err();
        assert!(matches!(err, Error::Mount { .. }));
        let calls = fake.calls();
        assert!(calls.iter().any(|c| c.starts_with("mapping_remove")));
        assert!(calls.iter().any(|c| c.starts_with("loop_detach")));
        assert!(!fake.is_mounted(&path));
    }

    #[tokio::test]
    async fn test_unpin_reverses_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_target(&dir);
        let fake = Arc::new(FakeSystem::new());
        let b = backend(&fake);

        let item = b.pin(&path).await.unwrap();
        fake.clear_calls();
        b.unpin(&item).await.unwrap();

        let calls = fake.calls();
        assert!(calls[0].starts_with("unmount"));
        assert!(calls[1].starts_with("snapshot_merge"));
        assert!(calls[2].starts_with("mapping_remove"));
        assert!(calls[3].starts_with("loop_detach"));
        assert!(!fake.is_mounted(&path));
    }
}
