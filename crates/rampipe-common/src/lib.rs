//! RamPipe Common - Shared types and utilities
//!
//! This crate provides the error taxonomy, configuration structures, and
//! core data types used across all RamPipe components.

pub mod config;
pub mod error;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use types::*;
