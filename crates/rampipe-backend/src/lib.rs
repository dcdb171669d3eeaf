//! RamPipe Pinning Backends
//!
//! This crate materializes RAM-resident views over original paths without
//! breaking path identity. It provides the narrow [`SystemOps`] interface
//! over the OS (mounts, loop devices, device-mapper, tree copies), the
//! [`PinBackend`] capability with its three strategies, and the staging
//! provisioning helpers the daemon runs at startup.

pub mod backend;
pub mod fake;
pub mod move_copy;
pub mod overlay;
pub mod snapshot;
pub mod staging;
pub mod sysops;
pub mod usage;

pub use backend::{BackendSet, PinBackend};
pub use move_copy::MoveBackend;
pub use overlay::OverlayBackend;
pub use snapshot::SnapshotBackend;
pub use sysops::{HostSystem, MountEntry, SystemOps};
pub use usage::tree_size;
