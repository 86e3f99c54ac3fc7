//! In-memory `SnapshotStore` for tests and nodes without a data directory.

use crate::store::{MetaStoreResult, SnapshotStore};
use parking_lot::RwLock;
use snapmesh_common::{MissedOpRecord, Snapshot, SnapshotId};
use std::collections::HashMap;

#[derive(Default)]
pub struct MemoryStore {
    snapshots: RwLock<HashMap<SnapshotId, Snapshot>>,
    missed: RwLock<HashMap<String, MissedOpRecord>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of persisted snapshots
    pub fn snapshot_count(&self) -> usize {
        self.snapshots.read().len()
    }
}

impl SnapshotStore for MemoryStore {
    fn put_snapshot(&self, snapshot: &Snapshot) -> MetaStoreResult<()> {
        self.snapshots.write().insert(snapshot.id, snapshot.clone());
        Ok(())
    }

    fn delete_snapshot(&self, id: SnapshotId) -> MetaStoreResult<()> {
        self.snapshots.write().remove(&id);
        Ok(())
    }

    fn load_snapshots(&self) -> MetaStoreResult<Vec<Snapshot>> {
        Ok(self.snapshots.read().values().cloned().collect())
    }

    fn put_missed_record(&self, record: &MissedOpRecord) -> MetaStoreResult<()> {
        self.missed.write().insert(record.key(), record.clone());
        Ok(())
    }

    fn load_missed_records(&self) -> MetaStoreResult<Vec<MissedOpRecord>> {
        Ok(self.missed.read().values().cloned().collect())
    }
}
