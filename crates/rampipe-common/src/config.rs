//! Configuration types for RamPipe
//!
//! This module defines configuration structures used across components.
//! Every field has a documented default; `Config::validate` rejects
//! malformed or inconsistent values at startup instead of coercing them.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Root configuration for RamPipe
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Daemon process configuration
    #[serde(default)]
    pub daemon: DaemonConfig,
    /// RAM staging configuration (move and overlay backends)
    #[serde(default)]
    pub staging: StagingConfig,
    /// Promote/demote thresholds for the workload estimator
    #[serde(default)]
    pub thresholds: ThresholdConfig,
    /// Periodic reconciliation configuration
    #[serde(default)]
    pub sync: SyncConfig,
    /// Snapshot backend configuration
    #[serde(default)]
    pub snapshot: SnapshotConfig,
}

/// Daemon process configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Control socket path
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,
    /// Persisted pin-state file
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
    /// Seconds to wait for in-flight operations at shutdown
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    /// Paths watched for write activity (automatic mode); empty means
    /// manual pinning only
    #[serde(default)]
    pub watch_paths: Vec<PathBuf>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            state_file: default_state_file(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            watch_paths: Vec::new(),
        }
    }
}

/// RAM staging configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StagingConfig {
    /// Where move-backend copies live (a tmpfs is mounted here)
    #[serde(default = "default_ramdisk_dir")]
    pub ramdisk_dir: PathBuf,
    /// Capacity of the RAM-backed staging filesystem (e.g. "512M", "2G")
    #[serde(default = "default_tmpfs_size")]
    pub tmpfs_size: String,
    /// Where overlay upper/work directory pairs live
    #[serde(default = "default_overlay_dir")]
    pub overlay_dir: PathBuf,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            ramdisk_dir: default_ramdisk_dir(),
            tmpfs_size: default_tmpfs_size(),
            overlay_dir: default_overlay_dir(),
        }
    }
}

/// Workload estimator thresholds
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ThresholdConfig {
    /// Promote when the estimated write rate (writes/minute) exceeds this
    #[serde(default = "default_pin_writes")]
    pub pin_writes: f64,
    /// Demote when the estimated write rate drops below this
    #[serde(default = "default_unpin_writes")]
    pub unpin_writes: f64,
    /// Decay time constant of the write-rate EMA, in seconds
    #[serde(default = "default_tau_secs")]
    pub tau_secs: f64,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            pin_writes: default_pin_writes(),
            unpin_writes: default_unpin_writes(),
            tau_secs: default_tau_secs(),
        }
    }
}

/// Periodic reconciliation configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Seconds between periodic sync passes
    #[serde(default = "default_sync_interval_secs")]
    pub interval_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_sync_interval_secs(),
        }
    }
}

/// Snapshot backend configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SnapshotConfig {
    /// Size of the tmpfs backing the thin pool (e.g. "2G")
    #[serde(default = "default_thinpool_size")]
    pub thinpool_size: String,
    /// Mount point of the tmpfs backing the thin pool
    #[serde(default = "default_thinpool_dir")]
    pub thinpool_dir: PathBuf,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            thinpool_size: default_thinpool_size(),
            thinpool_dir: default_thinpool_dir(),
        }
    }
}

fn default_socket_path() -> PathBuf {
    PathBuf::from("/run/rampipe.sock")
}

fn default_state_file() -> PathBuf {
    PathBuf::from("/var/lib/rampipe/state.json")
}

fn default_shutdown_grace_secs() -> u64 {
    30
}

fn default_ramdisk_dir() -> PathBuf {
    PathBuf::from("/mnt/rampipe")
}

fn default_tmpfs_size() -> String {
    "512M".to_string()
}

fn default_overlay_dir() -> PathBuf {
    PathBuf::from("/mnt/rampipe/overlay")
}

fn default_pin_writes() -> f64 {
    10.0
}

fn default_unpin_writes() -> f64 {
    2.0
}

fn default_tau_secs() -> f64 {
    30.0
}

fn default_sync_interval_secs() -> u64 {
    300
}

fn default_thinpool_size() -> String {
    "2G".to_string()
}

fn default_thinpool_dir() -> PathBuf {
    PathBuf::from("/mnt/rampipe/thinpool")
}

impl Config {
    /// Validate the configuration, returning a diagnostic for the first
    /// inconsistent value found
    pub fn validate(&self) -> Result<()> {
        if !self.thresholds.pin_writes.is_finite() || self.thresholds.pin_writes <= 0.0 {
            return Err(Error::configuration(format!(
                "thresholds.pin_writes must be a positive number, got {}",
                self.thresholds.pin_writes
            )));
        }
        if !self.thresholds.unpin_writes.is_finite() || self.thresholds.unpin_writes < 0.0 {
            return Err(Error::configuration(format!(
                "thresholds.unpin_writes must be non-negative, got {}",
                self.thresholds.unpin_writes
            )));
        }
        // Equal thresholds oscillate on every observation near the boundary
        if self.thresholds.pin_writes <= self.thresholds.unpin_writes {
            return Err(Error::configuration(format!(
                "thresholds.pin_writes ({}) must be greater than thresholds.unpin_writes ({})",
                self.thresholds.pin_writes, self.thresholds.unpin_writes
            )));
        }
        if !self.thresholds.tau_secs.is_finite() || self.thresholds.tau_secs <= 0.0 {
            return Err(Error::configuration(format!(
                "thresholds.tau_secs must be a positive number, got {}",
                self.thresholds.tau_secs
            )));
        }
        if self.sync.interval_secs == 0 {
            return Err(Error::configuration(
                "sync.interval_secs must be at least 1",
            ));
        }
        parse_size(&self.staging.tmpfs_size)
            .map_err(|e| Error::configuration(format!("staging.tmpfs_size: {e}")))?;
        parse_size(&self.snapshot.thinpool_size)
            .map_err(|e| Error::configuration(format!("snapshot.thinpool_size: {e}")))?;
        for path in [
            &self.daemon.socket_path,
            &self.daemon.state_file,
            &self.staging.ramdisk_dir,
            &self.staging.overlay_dir,
            &self.snapshot.thinpool_dir,
        ] {
            if !path.is_absolute() {
                return Err(Error::configuration(format!(
                    "path {} must be absolute",
                    path.display()
                )));
            }
        }
        Ok(())
    }
}

/// Parse a human-readable size string ("1048576", "512K", "512M", "2G")
/// into bytes
pub fn parse_size(s: &str) -> std::result::Result<u64, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty size string".to_string());
    }
    let (digits, multiplier) = match s.as_bytes()[s.len() - 1].to_ascii_uppercase() {
        b'K' => (&s[..s.len() - 1], 1024u64),
        b'M' => (&s[..s.len() - 1], 1024 * 1024),
        b'G' => (&s[..s.len() - 1], 1024 * 1024 * 1024),
        b'T' => (&s[..s.len() - 1], 1024 * 1024 * 1024 * 1024),
        b'0'..=b'9' => (s, 1),
        other => {
            return Err(format!(
                "unrecognized size suffix '{}' in \"{s}\"",
                other as char
            ));
        }
    };
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid size \"{s}\""))?;
    if value == 0 {
        return Err(format!("size \"{s}\" must be non-zero"));
    }
    value
        .checked_mul(multiplier)
        .ok_or_else(|| format!("size \"{s}\" overflows"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.daemon.socket_path, PathBuf::from("/run/rampipe.sock"));
        assert!(config.thresholds.pin_writes > config.thresholds.unpin_writes);
    }

    #[test]
    fn test_inverted_thresholds_rejected() {
        let mut config = Config::default();
        config.thresholds.pin_writes = 1.0;
        config.thresholds.unpin_writes = 5.0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("pin_writes"));
    }

    #[test]
    fn test_zero_tau_rejected() {
        let mut config = Config::default();
        config.thresholds.tau_secs = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_malformed_size_rejected() {
        let mut config = Config::default();
        config.staging.tmpfs_size = "lots".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("4096").unwrap(), 4096);
        assert_eq!(parse_size("512K").unwrap(), 512 * 1024);
        assert_eq!(parse_size("512M").unwrap(), 512 * 1024 * 1024);
        assert_eq!(parse_size("2G").unwrap(), 2 * 1024 * 1024 * 1024);
        assert_eq!(parse_size("2g").unwrap(), 2 * 1024 * 1024 * 1024);
        assert!(parse_size("").is_err());
        assert!(parse_size("0M").is_err());
        assert!(parse_size("12Q").is_err());
    }

    #[test]
    fn test_partial_toml_falls_back_to_defaults() {
        let config: Config = toml::from_str(
            r#"
            [thresholds]
            pin_writes = 20.0
            "#,
        )
        .unwrap();
        assert_eq!(config.thresholds.pin_writes, 20.0);
        assert_eq!(config.thresholds.unpin_writes, 2.0);
        assert_eq!(config.sync.interval_secs, 300);
    }
}
