//! Narrow system-operations interface
//!
//! Every mount, device-mapper, loop-device, and tree-copy step the backends
//! take goes through [`SystemOps`], so tests can substitute a fake and the
//! backends never shell out directly. [`HostSystem`] is the one real
//! implementation, invoking the standard OS utilities.

use async_trait::async_trait;
use rampipe_common::{Error, Result};
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};
use std::process::Output;
use tokio::process::Command;
use tracing::{debug, warn};

/// One line of the live mount table
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MountEntry {
    pub source: String,
    pub target: PathBuf,
    pub fstype: String,
}

/// The OS operations the pinning backends are built from
#[async_trait]
pub trait SystemOps: Send + Sync {
    /// Bind-mount `source` over `target`
    async fn bind_mount(&self, source: &Path, target: &Path) -> Result<()>;

    /// Unmount the filesystem mounted at `target`
    async fn unmount(&self, target: &Path) -> Result<()>;

    /// Mount a tmpfs of the given size (e.g. "512M") at `target`
    async fn mount_tmpfs(&self, target: &Path, size: &str) -> Result<()>;

    /// Mount an overlay (read-only `lower`, writable `upper`/`work`) at `target`
    async fn mount_overlay(
        &self,
        lower: &Path,
        upper: &Path,
        work: &Path,
        target: &Path,
    ) -> Result<()>;

    /// Attach a loop device over `file`, returning the device path
    async fn loop_attach(&self, file: &Path) -> Result<String>;

    /// Detach a loop device
    async fn loop_detach(&self, device: &str) -> Result<()>;

    /// Create a thin-provisioned snapshot of `loop_device` against `pool`,
    /// registering the origin and copy-on-write mappings under the given names
    async fn snapshot_create(
        &self,
        loop_device: &str,
        pool: &str,
        origin_name: &str,
        cow_name: &str,
    ) -> Result<()>;

    /// Merge a copy-on-write snapshot back into its origin
    async fn snapshot_merge(&self, cow_name: &str) -> Result<()>;

    /// Remove device-mapper mappings by name
    async fn mapping_remove(&self, names: &[&str]) -> Result<()>;

    /// True if a device-mapper mapping with this name exists
    async fn mapping_exists(&self, name: &str) -> bool;

    /// Create a thin-pool mapping over the given metadata and data files
    async fn thin_pool_create(&self, name: &str, meta: &Path, data: &Path) -> Result<()>;

    /// Recursively copy `source` to the not-yet-existing `target`,
    /// preserving timestamps, ownership, and permissions
    async fn copy_tree(&self, source: &Path, target: &Path) -> Result<()>;

    /// Mirror `source` onto the existing `target` with delete propagation:
    /// entries absent from `source` are removed from `target`
    async fn mirror_tree(&self, source: &Path, target: &Path) -> Result<()>;

    /// Merge an overlay upper layer onto `origin`: whiteouts apply as
    /// deletions, everything else is copied over (last writer wins)
    async fn merge_upper(&self, upper: &Path, origin: &Path) -> Result<()>;

    /// Create a directory and all missing parents
    fn create_dir_all(&self, path: &Path) -> Result<()>;

    /// Recursively delete a file or directory tree
    fn remove_tree(&self, path: &Path) -> Result<()>;

    /// Create or resize a (sparse) file to exactly `size` bytes
    fn allocate_file(&self, path: &Path, size: u64) -> Result<()>;

    /// Parse the live mount table
    fn list_mounts(&self) -> Result<Vec<MountEntry>>;

    /// True if any process holds an open descriptor on `path` or anything
    /// beneath it
    fn path_in_use(&self, path: &Path) -> bool;
}

/// Real [`SystemOps`] implementation shelling to the OS utilities
#[derive(Debug, Default)]
pub struct HostSystem;

impl HostSystem {
    /// Run a command, capturing the diagnostic on failure
    async fn run(program: &str, args: &[&str]) -> std::result::Result<String, String> {
        let output: Output = Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|e| format!("failed to execute {program}: {e}"))?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(format!(
                "{program} exited with {}: {}",
                output.status,
                stderr.trim()
            ))
        }
    }

    async fn run_mount(op: &str, program: &str, args: &[&str]) -> Result<String> {
        Self::run(program, args)
            .await
            .map_err(|detail| Error::mount(op, detail))
    }

    async fn run_device(op: &str, program: &str, args: &[&str]) -> Result<String> {
        Self::run(program, args)
            .await
            .map_err(|detail| Error::device(op, detail))
    }

    /// Decode the octal escapes /proc/self/mounts uses for whitespace
    fn unescape_mount_field(field: &str) -> String {
        let mut out = String::with_capacity(field.len());
        let mut chars = field.chars();
        while let Some(c) = chars.next() {
            if c == '\\' {
                let code: String = chars.by_ref().take(3).collect();
                match u8::from_str_radix(&code, 8) {
                    Ok(byte) => out.push(byte as char),
                    Err(_) => {
                        out.push(c);
                        out.push_str(&code);
                    }
                }
            } else {
                out.push(c);
            }
        }
        out
    }

    /// Copy everything under an overlay upper layer onto the origin after
    /// whiteouts have been applied and stripped
    async fn copy_upper_contents(upper: &Path, origin: &Path) -> Result<()> {
        let src = format!("{}/", upper.display());
        let dst = format!("{}/", origin.display());
        match Self::run("rsync", &["-a", &src, &dst]).await {
            Ok(_) => Ok(()),
            Err(detail) if detail.starts_with("failed to execute") => {
                debug!("rsync unavailable, falling back to full copy: {detail}");
                let src_dot = format!("{}/.", upper.display());
                Self::run("cp", &["-a", &src_dot, &dst])
                    .await
                    .map(|_| ())
                    .map_err(Error::Sync)
            }
            Err(detail) => Err(Error::Sync(detail)),
        }
    }

    /// Walk the upper layer, deleting origin entries shadowed by whiteouts
    /// and removing the whiteout markers themselves
    fn apply_whiteouts(upper: &Path, origin: &Path) -> Result<()> {
        let entries = std::fs::read_dir(upper)?;
        for entry in entries {
            let entry = entry?;
            let meta = entry.metadata()?;
            let origin_path = origin.join(entry.file_name());
            // An overlayfs whiteout is a 0:0 character device
            if meta.file_type().is_char_device() && meta.rdev() == 0 {
                match std::fs::metadata(&origin_path) {
                    Ok(m) if m.is_dir() => std::fs::remove_dir_all(&origin_path)?,
                    Ok(_) => std::fs::remove_file(&origin_path)?,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
                std::fs::remove_file(entry.path())?;
            } else if meta.is_dir() {
                Self::apply_whiteouts(&entry.path(), &origin_path)?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SystemOps for HostSystem {
    async fn bind_mount(&self, source: &Path, target: &Path) -> Result<()> {
        let src = source.display().to_string();
        let dst = target.display().to_string();
        Self::run_mount(
            &format!("mount --bind {src} {dst}"),
            "mount",
            &["--bind", &src, &dst],
        )
        .await
        .map(|_| ())
    }

    async fn unmount(&self, target: &Path) -> Result<()> {
        let dst = target.display().to_string();
        Self::run_mount(&format!("umount {dst}"), "umount", &[&dst])
            .await
            .map(|_| ())
    }

    async fn mount_tmpfs(&self, target: &Path, size: &str) -> Result<()> {
        let dst = target.display().to_string();
        let opts = format!("size={size}");
        Self::run_mount(
            &format!("mount tmpfs {dst}"),
            "mount",
            &["-t", "tmpfs", "-o", &opts, "tmpfs", &dst],
        )
        .await
        .map(|_| ())
    }

    async fn mount_overlay(
        &self,
        lower: &Path,
        upper: &Path,
        work: &Path,
        target: &Path,
    ) -> Result<()> {
        let dst = target.display().to_string();
        let opts = format!(
            "lowerdir={},upperdir={},workdir={}",
            lower.display(),
            upper.display(),
            work.display()
        );
        Self::run_mount(
            &format!("mount overlay {dst}"),
            "mount",
            &["-t", "overlay", "overlay", "-o", &opts, &dst],
        )
        .await
        .map(|_| ())
    }

    async fn loop_attach(&self, file: &Path) -> Result<String> {
        let src = file.display().to_string();
        let device = Self::run_device(
            &format!("losetup {src}"),
            "losetup",
            &["-fP", "--show", &src],
        )
        .await?;
        if device.is_empty() {
            return Err(Error::device(
                format!("losetup {src}"),
                "no device path returned",
            ));
        }
        Ok(device)
    }

    async fn loop_detach(&self, device: &str) -> Result<()> {
        Self::run_device(&format!("losetup -d {device}"), "losetup", &["-d", device])
            .await
            .map(|_| ())
    }

    async fn snapshot_create(
        &self,
        loop_device: &str,
        pool: &str,
        origin_name: &str,
        cow_name: &str,
    ) -> Result<()> {
        let origin_arg = format!("--originname={origin_name}");
        let cow_arg = format!("--cowname={cow_name}");
        Self::run_device(
            &format!("dmsetup snapshot {loop_device}"),
            "dmsetup",
            &["snapshot", loop_device, pool, &origin_arg, &cow_arg],
        )
        .await
        .map(|_| ())
    }

    async fn snapshot_merge(&self, cow_name: &str) -> Result<()> {
        Self::run_device(
            &format!("dmsetup merge {cow_name}"),
            "dmsetup",
            &["merge", cow_name],
        )
        .await
        .map(|_| ())
    }

    async fn mapping_remove(&self, names: &[&str]) -> Result<()> {
        let mut args = vec!["remove"];
        args.extend_from_slice(names);
        Self::run_device(&format!("dmsetup remove {}", names.join(" ")), "dmsetup", &args)
            .await
            .map(|_| ())
    }

    async fn mapping_exists(&self, name: &str) -> bool {
        Self::run("dmsetup", &["info", name]).await.is_ok()
    }

    async fn thin_pool_create(&self, name: &str, meta: &Path, data: &Path) -> Result<()> {
        let data_len = std::fs::metadata(data)?.len();
        let sectors = data_len / 512;
        let table = format!(
            "0 {sectors} thin-pool {} {} 128 32768",
            meta.display(),
            data.display()
        );
        Self::run_device(
            &format!("dmsetup create {name}"),
            "dmsetup",
            &["create", name, "--table", &table],
        )
        .await
        .map(|_| ())
    }

    async fn copy_tree(&self, source: &Path, target: &Path) -> Result<()> {
        let src = source.display().to_string();
        let dst = target.display().to_string();
        Self::run("cp", &["-a", &src, &dst])
            .await
            .map(|_| ())
            .map_err(Error::Sync)
    }

    async fn mirror_tree(&self, source: &Path, target: &Path) -> Result<()> {
        // Trailing slashes make rsync mirror contents rather than nesting
        // the source directory inside the target
        let (src, dst) = if source.is_dir() {
            (
                format!("{}/", source.display()),
                format!("{}/", target.display()),
            )
        } else {
            (
                source.display().to_string(),
                target.display().to_string(),
            )
        };
        Self::run("rsync", &["-a", "--delete", &src, &dst])
            .await
            .map(|_| ())
            .map_err(Error::Sync)
    }

    async fn merge_upper(&self, upper: &Path, origin: &Path) -> Result<()> {
        Self::apply_whiteouts(upper, origin)?;
        Self::copy_upper_contents(upper, origin).await
    }

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        std::fs::create_dir_all(path).map_err(Into::into)
    }

    fn remove_tree(&self, path: &Path) -> Result<()> {
        match std::fs::metadata(path) {
            Ok(m) if m.is_dir() => std::fs::remove_dir_all(path).map_err(Into::into),
            Ok(_) => std::fs::remove_file(path).map_err(Into::into),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn allocate_file(&self, path: &Path, size: u64) -> Result<()> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path)?;
        file.set_len(size)?;
        Ok(())
    }

    fn list_mounts(&self) -> Result<Vec<MountEntry>> {
        let table = std::fs::read_to_string("/proc/self/mounts")?;
        let mut entries = Vec::new();
        for line in table.lines() {
            let mut fields = line.split_whitespace();
            let (Some(source), Some(target), Some(fstype)) =
                (fields.next(), fields.next(), fields.next())
            else {
                continue;
            };
            entries.push(MountEntry {
                source: Self::unescape_mount_field(source),
                target: PathBuf::from(Self::unescape_mount_field(target)),
                fstype: fstype.to_string(),
            });
        }
        Ok(entries)
    }

    fn path_in_use(&self, path: &Path) -> bool {
        let target = match std::fs::canonicalize(path) {
            Ok(p) => p,
            Err(_) => return false,
        };
        let proc = match std::fs::read_dir("/proc") {
            Ok(d) => d,
            Err(e) => {
                warn!("cannot scan /proc for open descriptors: {e}");
                return false;
            }
        };
        for pid_dir in proc.flatten() {
            if !pid_dir
                .file_name()
                .to_string_lossy()
                .bytes()
                .all(|b| b.is_ascii_digit())
            {
                continue;
            }
            let fd_dir = pid_dir.path().join("fd");
            let Ok(fds) = std::fs::read_dir(&fd_dir) else {
                continue;
            };
            for fd in fds.flatten() {
                // Processes come and go mid-scan; a vanished link is not a hit
                let Ok(resolved) = std::fs::read_link(fd.path()) else {
                    continue;
                };
                if resolved == target || resolved.starts_with(&target) {
                    return true;
                }
            }
        }
        false
    }
}
