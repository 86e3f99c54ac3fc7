//! Persistent metadata store backed by redb.
//!
//! Provides typed put/delete/load methods for each table. All writes are
//! synchronous (write txn + commit). Reads for serving requests go through
//! the in-memory inventory and log; this module only handles persistence.

use crate::tables;
use redb::{Database, ReadableTable};
use snapmesh_common::{MissedOpRecord, NodeId, Snapshot, SnapshotId};
use std::path::Path;
use tracing::{debug, error};

/// Error type for metadata store operations
#[derive(Debug, thiserror::Error)]
pub enum MetaStoreError {
    #[error("redb error: {0}")]
    Redb(#[from] redb::DatabaseError),
    #[error("redb storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("redb table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("redb transaction error: {0}")]
    Transaction(Box<redb::TransactionError>),
    #[error("redb commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt node state: {0}")]
    NodeState(String),
}

impl From<redb::TransactionError> for MetaStoreError {
    fn from(e: redb::TransactionError) -> Self {
        Self::Transaction(Box::new(e))
    }
}

pub type MetaStoreResult<T> = Result<T, MetaStoreError>;

/// Durable storage for the snapshot inventory and the missed-operation log.
///
/// Implementations are called synchronously from every mutating inventory
/// or log operation.
pub trait SnapshotStore: Send + Sync {
    /// Insert or replace a snapshot
    fn put_snapshot(&self, snapshot: &Snapshot) -> MetaStoreResult<()>;

    /// Delete a snapshot; deleting an absent id succeeds
    fn delete_snapshot(&self, id: SnapshotId) -> MetaStoreResult<()>;

    /// Load every persisted snapshot
    fn load_snapshots(&self) -> MetaStoreResult<Vec<Snapshot>>;

    /// Insert or replace the missed-operation record of one (node, snapshot)
    fn put_missed_record(&self, record: &MissedOpRecord) -> MetaStoreResult<()>;

    /// Load every persisted missed-operation record
    fn load_missed_records(&self) -> MetaStoreResult<Vec<MissedOpRecord>>;
}

/// Persistent metadata store backed by redb.
pub struct MetaStore {
    db: Database,
}

impl MetaStore {
    /// Open (or create) the redb database at the given path.
    pub fn open(path: impl AsRef<Path>) -> MetaStoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;

        // Create all tables eagerly so later read txns don't fail
        let write_txn = db.begin_write()?;
        {
            let _t = write_txn.open_table(tables::SNAPSHOTS)?;
            let _t = write_txn.open_table(tables::MISSED_OPS)?;
            let _t = write_txn.open_table(tables::NODE_STATE)?;
        }
        write_txn.commit()?;

        debug!("Opened metadata store at {}", path.display());
        Ok(Self { db })
    }

    // ---- Node identity (string value, single key) ----

    /// Load the persisted local node id, if any
    pub fn load_node_id(&self) -> MetaStoreResult<Option<NodeId>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(tables::NODE_STATE)?;
        match table.get("node_id")? {
            Some(val) => val
                .value()
                .parse()
                .map(Some)
                .map_err(|e: snapmesh_common::Error| MetaStoreError::NodeState(e.to_string())),
            None => Ok(None),
        }
    }

    /// Persist the local node id
    pub fn put_node_id(&self, node_id: NodeId) -> MetaStoreResult<()> {
        let value = node_id.to_string();
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(tables::NODE_STATE)?;
            table.insert("node_id", value.as_str())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    // ---- Helpers ----

    fn put_bytes(
        &self,
        table_def: redb::TableDefinition<&str, &[u8]>,
        key: &str,
        value: &[u8],
    ) -> MetaStoreResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(table_def)?;
            table.insert(key, value)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn put_bincode<T: serde::Serialize>(
        &self,
        table_def: redb::TableDefinition<&str, &[u8]>,
        key: &str,
        value: &T,
    ) -> MetaStoreResult<()> {
        let bytes = bincode::serialize(value)?;
        self.put_bytes(table_def, key, &bytes)
    }

    fn delete_key<V: redb::Value>(
        &self,
        table_def: redb::TableDefinition<&str, V>,
        key: &str,
    ) -> MetaStoreResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(table_def)?;
            table.remove(key)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn load_bincode_table<T: serde::de::DeserializeOwned>(
        &self,
        table_def: redb::TableDefinition<&str, &[u8]>,
    ) -> MetaStoreResult<Vec<(String, T)>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(table_def)?;
        let mut result = Vec::new();
        for entry in table.iter()? {
            let entry = entry?;
            let key = entry.0.value().to_string();
            let bytes = entry.1.value();
            match bincode::deserialize::<T>(bytes) {
                Ok(val) => result.push((key, val)),
                Err(e) => error!("Failed to decode entry '{}': {}", key, e),
            }
        }
        Ok(result)
    }
}

impl SnapshotStore for MetaStore {
    fn put_snapshot(&self, snapshot: &Snapshot) -> MetaStoreResult<()> {
        self.put_bincode(tables::SNAPSHOTS, &snapshot.id.to_string(), snapshot)
            .inspect_err(|e| error!("Failed to persist snapshot '{}': {}", snapshot.name, e))
    }

    fn delete_snapshot(&self, id: SnapshotId) -> MetaStoreResult<()> {
        self.delete_key(tables::SNAPSHOTS, &id.to_string())
            .inspect_err(|e| error!("Failed to delete snapshot '{}': {}", id, e))
    }

    fn load_snapshots(&self) -> MetaStoreResult<Vec<Snapshot>> {
        Ok(self
            .load_bincode_table::<Snapshot>(tables::SNAPSHOTS)?
            .into_iter()
            .map(|(_, snap)| snap)
            .collect())
    }

    fn put_missed_record(&self, record: &MissedOpRecord) -> MetaStoreResult<()> {
        self.put_bincode(tables::MISSED_OPS, &record.key(), record)
            .inspect_err(|e| error!("Failed to persist missed ops '{}': {}", record.key(), e))
    }

    fn load_missed_records(&self) -> MetaStoreResult<Vec<MissedOpRecord>> {
        Ok(self
            .load_bincode_table::<MissedOpRecord>(tables::MISSED_OPS)?
            .into_iter()
            .map(|(_, record)| record)
            .collect())
    }
}
