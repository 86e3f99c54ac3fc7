//! SnapMesh Common - Shared types and utilities
//!
//! This crate provides the snapshot data model, error classification and
//! configuration types used across all SnapMesh components.

pub mod config;
pub mod error;
pub mod types;

pub use config::Config;
pub use error::{Error, ErrorClass, Result};
pub use types::*;
