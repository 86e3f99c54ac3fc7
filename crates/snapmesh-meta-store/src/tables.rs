//! Redb table definitions for persistent metadata storage.

use redb::TableDefinition;

// Key: snapshot id, Value: bincode-encoded Snapshot
pub const SNAPSHOTS: TableDefinition<&str, &[u8]> = TableDefinition::new("snapshots");
// Key: "node_id:snapshot_id", Value: bincode-encoded MissedOpRecord
pub const MISSED_OPS: TableDefinition<&str, &[u8]> = TableDefinition::new("missed_ops");
// Single-key node state (local node id)
pub const NODE_STATE: TableDefinition<&str, &str> = TableDefinition::new("node_state");
