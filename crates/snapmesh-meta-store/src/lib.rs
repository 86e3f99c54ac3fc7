//! SnapMesh Metadata Store - durable snapshot and missed-operation state
//!
//! This crate persists the snapshot inventory and the missed-operation log
//! in a local redb database. The in-memory `MemoryStore` implements the same
//! `SnapshotStore` trait for tests and ephemeral nodes.

pub mod memory;
pub mod store;
pub mod tables;

// Re-exports
pub use memory::MemoryStore;
pub use store::{MetaStore, MetaStoreError, MetaStoreResult, SnapshotStore};
