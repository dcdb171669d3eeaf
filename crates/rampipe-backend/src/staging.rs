//! RAM staging provisioning run once at daemon startup
//!
//! Mounts the tmpfs backing the move/overlay staging area and builds the
//! thin pool the snapshot backend cuts its copy-on-write snapshots from.

use crate::sysops::SystemOps;
use rampipe_common::config::{parse_size, SnapshotConfig, StagingConfig};
use rampipe_common::{Error, Result};
use std::path::Path;
use tracing::{debug, info};

/// Device-mapper name of the snapshot thin pool
pub const POOL_NAME: &str = "rampipe-pool";

/// Size of the thin pool's metadata file
const POOL_META_BYTES: u64 = 4 * 1024 * 1024;

/// Device path the snapshot backend cuts snapshots against
#[must_use]
pub fn pool_device() -> String {
    format!("/dev/mapper/{POOL_NAME}")
}

fn is_tmpfs_mounted(ops: &dyn SystemOps, target: &Path) -> Result<bool> {
    Ok(ops
        .list_mounts()?
        .iter()
        .any(|m| m.target == target && m.fstype == "tmpfs"))
}

/// Mount the RAM-backed staging filesystem and create the overlay base
/// directory, skipping whatever already exists from a previous run
pub async fn ensure_ramdisk(ops: &dyn SystemOps, staging: &StagingConfig) -> Result<()> {
    ops.create_dir_all(&staging.ramdisk_dir)?;
    if is_tmpfs_mounted(ops, &staging.ramdisk_dir)? {
        debug!("ramdisk already mounted at {}", staging.ramdisk_dir.display());
    } else {
        ops.mount_tmpfs(&staging.ramdisk_dir, &staging.tmpfs_size)
            .await?;
        info!(
            "mounted {} ramdisk at {}",
            staging.tmpfs_size,
            staging.ramdisk_dir.display()
        );
    }
    ops.create_dir_all(&staging.overlay_dir)?;
    Ok(())
}

/// Build the tmpfs-backed thin pool for the snapshot backend
///
/// The meta and data files are sparse; tmpfs pages are only consumed as
/// snapshots diverge.
pub async fn ensure_thinpool(ops: &dyn SystemOps, snapshot: &SnapshotConfig) -> Result<()> {
    if ops.mapping_exists(POOL_NAME).await {
        debug!("thin pool {POOL_NAME} already exists");
        return Ok(());
    }
    let pool_bytes = parse_size(&snapshot.thinpool_size).map_err(Error::configuration)?;
    ops.create_dir_all(&snapshot.thinpool_dir)?;
    if !is_tmpfs_mounted(ops, &snapshot.thinpool_dir)? {
        ops.mount_tmpfs(&snapshot.thinpool_dir, &snapshot.thinpool_size)
            .await?;
    }
    let meta = snapshot.thinpool_dir.join("meta");
    let data = snapshot.thinpool_dir.join("data");
    ops.allocate_file(&meta, POOL_META_BYTES)?;
    ops.allocate_file(&data, pool_bytes)?;
    ops.thin_pool_create(POOL_NAME, &meta, &data).await?;
    info!(
        "created thin pool {POOL_NAME} ({}) at {}",
        snapshot.thinpool_size,
        snapshot.thinpool_dir.display()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeSystem;
    use crate::sysops::MountEntry;

    #[tokio::test]
    async fn test_ensure_ramdisk_mounts_once() {
        let fake = FakeSystem::new();
        let staging = StagingConfig::default();

        ensure_ramdisk(&fake, &staging).await.unwrap();
        assert!(fake.is_mounted(&staging.ramdisk_dir));

        // Second run is idempotent
        ensure_ramdisk(&fake, &staging).await.unwrap();
        let tmpfs_mounts = fake
            .calls()
            .iter()
            .filter(|c| c.starts_with("mount_tmpfs"))
            .count();
        assert_eq!(tmpfs_mounts, 1);
    }

    #[tokio::test]
    async fn test_ensure_ramdisk_respects_existing_mount() {
        let fake = FakeSystem::new();
        let staging = StagingConfig::default();
        fake.add_mount(MountEntry {
            source: "tmpfs".to_string(),
            target: staging.ramdisk_dir.clone(),
            fstype: "tmpfs".to_string(),
        });

        ensure_ramdisk(&fake, &staging).await.unwrap();
        assert!(!fake.calls().iter().any(|c| c.starts_with("mount_tmpfs")));
    }

    #[tokio::test]
    async fn test_ensure_thinpool_builds_pool() {
        let fake = FakeSystem::new();
        let snapshot = SnapshotConfig::default();

        ensure_thinpool(&fake, &snapshot).await.unwrap();

        let calls = fake.calls();
        assert!(calls.iter().any(|c| c.starts_with("mount_tmpfs")));
        assert_eq!(
            calls
                .iter()
                .filter(|c| c.starts_with("allocate_file"))
                .count(),
            2
        );
        assert!(calls.iter().any(|c| c.starts_with("thin_pool_create")));

        // Pool now exists; nothing more to do
        fake.clear_calls();
        ensure_thinpool(&fake, &snapshot).await.unwrap();
        assert!(fake.calls().is_empty());
    }
}
