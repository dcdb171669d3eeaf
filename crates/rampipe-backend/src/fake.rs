//! Recording in-memory [`SystemOps`] double for tests
//!
//! Records every mutating operation in call order, maintains a pretend
//! mount table, and lets tests inject per-operation failures and busy
//! paths. No real filesystem or device state is touched.

use crate::sysops::{MountEntry, SystemOps};
use async_trait::async_trait;
use parking_lot::Mutex;
use rampipe_common::{Error, Result};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

#[derive(Default)]
pub struct FakeSystem {
    calls: Mutex<Vec<String>>,
    mounts: Mutex<Vec<MountEntry>>,
    in_use: Mutex<HashSet<PathBuf>>,
    fail_ops: Mutex<HashSet<&'static str>>,
    mappings: Mutex<HashSet<String>>,
    next_loop: Mutex<u32>,
}

impl FakeSystem {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All mutating operations performed so far, in order
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    /// Make the named operation fail from now on
    pub fn fail_on(&self, op: &'static str) {
        self.fail_ops.lock().insert(op);
    }

    /// Mark a path as held open by some process
    pub fn set_in_use(&self, path: &Path) {
        self.in_use.lock().insert(path.to_path_buf());
    }

    /// Seed a mount-table entry
    pub fn add_mount(&self, entry: MountEntry) {
        self.mounts.lock().push(entry);
    }

    /// True if something is currently mounted at `target`
    #[must_use]
    pub fn is_mounted(&self, target: &Path) -> bool {
        self.mounts.lock().iter().any(|m| m.target == target)
    }

    fn record(&self, op: &'static str, detail: String) -> Result<()> {
        self.calls.lock().push(format!("{op} {detail}"));
        if self.fail_ops.lock().contains(op) {
            return Err(match op {
                "bind_mount" | "unmount" | "mount_tmpfs" | "mount_overlay" => {
                    Error::mount(op, "injected failure")
                }
                "copy_tree" | "mirror_tree" | "merge_upper" => {
                    Error::Sync(format!("{op}: injected failure"))
                }
                _ => Error::device(op, "injected failure"),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl SystemOps for FakeSystem {
    async fn bind_mount(&self, source: &Path, target: &Path) -> Result<()> {
        self.record(
            "bind_mount",
            format!("{} {}", source.display(), target.display()),
        )?;
        self.mounts.lock().push(MountEntry {
            source: source.display().to_string(),
            target: target.to_path_buf(),
            fstype: "bind".to_string(),
        });
        Ok(())
    }

    async fn unmount(&self, target: &Path) -> Result<()> {
        self.record("unmount", target.display().to_string())?;
        let mut mounts = self.mounts.lock();
        match mounts.iter().rposition(|m| m.target == target) {
            Some(idx) => {
                mounts.remove(idx);
                Ok(())
            }
            None => Err(Error::mount(
                format!("umount {}", target.display()),
                "not mounted",
            )),
        }
    }

    async fn mount_tmpfs(&self, target: &Path, size: &str) -> Result<()> {
        self.record("mount_tmpfs", format!("{} {size}", target.display()))?;
        self.mounts.lock().push(MountEntry {
            source: "tmpfs".to_string(),
            target: target.to_path_buf(),
            fstype: "tmpfs".to_string(),
        });
        Ok(())
    }

    async fn mount_overlay(
        &self,
        lower: &Path,
        upper: &Path,
        _work: &Path,
        target: &Path,
    ) -> Result<()> {
        self.record(
            "mount_overlay",
            format!(
                "{} {} {}",
                lower.display(),
                upper.display(),
                target.display()
            ),
        )?;
        self.mounts.lock().push(MountEntry {
            source: "overlay".to_string(),
            target: target.to_path_buf(),
            fstype: "overlay".to_string(),
        });
        Ok(())
    }

    async fn loop_attach(&self, file: &Path) -> Result<String> {
        self.record("loop_attach", file.display().to_string())?;
        let mut next = self.next_loop.lock();
        let device = format!("/dev/loop{}", *next);
        *next += 1;
        Ok(device)
    }

    async fn loop_detach(&self, device: &str) -> Result<()> {
        self.record("loop_detach", device.to_string())
    }

    async fn snapshot_create(
        &self,
        loop_device: &str,
        pool: &str,
        origin_name: &str,
        cow_name: &str,
    ) -> Result<()> {
        self.record(
            "snapshot_create",
            format!("{loop_device} {pool} {origin_name} {cow_name}"),
        )?;
        let mut mappings = self.mappings.lock();
        mappings.insert(origin_name.to_string());
        mappings.insert(cow_name.to_string());
        Ok(())
    }

    async fn snapshot_merge(&self, cow_name: &str) -> Result<()> {
        self.record("snapshot_merge", cow_name.to_string())
    }

    async fn mapping_remove(&self, names: &[&str]) -> Result<()> {
        self.record("mapping_remove", names.join(" "))?;
        let mut mappings = self.mappings.lock();
        for name in names {
            mappings.remove(*name);
        }
        Ok(())
    }

    async fn mapping_exists(&self, name: &str) -> bool {
        self.mappings.lock().contains(name)
    }

    async fn thin_pool_create(&self, name: &str, meta: &Path, data: &Path) -> Result<()> {
        self.record(
            "thin_pool_create",
            format!("{name} {} {}", meta.display(), data.display()),
        )?;
        self.mappings.lock().insert(name.to_string());
        Ok(())
    }

    async fn copy_tree(&self, source: &Path, target: &Path) -> Result<()> {
        self.record(
            "copy_tree",
            format!("{} {}", source.display(), target.display()),
        )
    }

    async fn mirror_tree(&self, source: &Path, target: &Path) -> Result<()> {
        self.record(
            "mirror_tree",
            format!("{} {}", source.display(), target.display()),
        )
    }

    async fn merge_upper(&self, upper: &Path, origin: &Path) -> Result<()> {
        self.record(
            "merge_upper",
            format!("{} {}", upper.display(), origin.display()),
        )
    }

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        self.record("create_dir_all", path.display().to_string())
    }

    fn remove_tree(&self, path: &Path) -> Result<()> {
        self.record("remove_tree", path.display().to_string())
    }

    fn allocate_file(&self, path: &Path, size: u64) -> Result<()> {
        self.record("allocate_file", format!("{} {size}", path.display()))
    }

    fn list_mounts(&self) -> Result<Vec<MountEntry>> {
        Ok(self.mounts.lock().clone())
    }

    fn path_in_use(&self, path: &Path) -> bool {
        self.in_use
            .lock()
            .iter()
            .any(|p| p == path || p.starts_with(path))
    }
}
