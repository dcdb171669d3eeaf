//! Core data types for RamPipe

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Pinning strategy tag
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Loop device + device-mapper thin snapshot, bind-mounted over the
    /// original file
    Snapshot,
    /// Full copy into RAM staging, bind-mounted over the original path
    Move,
    /// Overlay filesystem with a RAM-backed upper layer over the original
    /// directory
    Overlay,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Snapshot => write!(f, "snapshot"),
            Self::Move => write!(f, "move"),
            Self::Overlay => write!(f, "overlay"),
        }
    }
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "snapshot" => Ok(Self::Snapshot),
            "move" => Ok(Self::Move),
            "overlay" => Ok(Self::Overlay),
            other => Err(format!("unknown backend: {other}")),
        }
    }
}

/// Backend-specific metadata recorded at pin time
///
/// Variants are mutually exclusive and immutable once the item is created;
/// a strategy change requires unpin then re-pin.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum BackendMeta {
    Snapshot {
        /// Loop device attached over the source file
        loop_device: String,
        /// Device-mapper origin mapping name
        origin_name: String,
        /// Device-mapper copy-on-write mapping name
        cow_name: String,
    },
    Move {
        /// RAM-resident copy bind-mounted over the original path
        staging_path: PathBuf,
    },
    Overlay {
        /// Generated overlay identifier
        overlay_id: String,
        /// Writable upper layer
        upper_dir: PathBuf,
        /// Overlayfs work directory
        work_dir: PathBuf,
        /// Mount point of the merged view
        merged_dir: PathBuf,
    },
}

impl BackendMeta {
    /// Backend tag this metadata belongs to
    #[must_use]
    pub fn backend(&self) -> Backend {
        match self {
            Self::Snapshot { .. } => Backend::Snapshot,
            Self::Move { .. } => Backend::Move,
            Self::Overlay { .. } => Backend::Overlay,
        }
    }
}

/// One currently-pinned path and everything needed to release it
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinnedItem {
    /// Absolute, resolved, canonical path (the unique key)
    pub path: PathBuf,
    /// Inode of the origin at pin time
    pub original_inode: u64,
    /// Backend-specific metadata
    pub meta: BackendMeta,
    /// Seconds since the UNIX epoch when the pin was taken
    pub pinned_at: u64,
}

impl PinnedItem {
    /// Create a new pinned item stamped with the current time
    pub fn new(path: PathBuf, original_inode: u64, meta: BackendMeta) -> Self {
        let pinned_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        Self {
            path,
            original_inode,
            meta,
            pinned_at,
        }
    }

    /// Backend tag for this item
    #[must_use]
    pub fn backend(&self) -> Backend {
        self.meta.backend()
    }
}
