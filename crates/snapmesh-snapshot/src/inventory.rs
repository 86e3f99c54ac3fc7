//! Snapshot inventory: the node's catalog of snapshots
//!
//! The inventory keeps snapshots in memory indexed by id and by name, and
//! writes every mutation through to the store before it becomes visible.

use crate::error::{SnapshotError, SnapshotResult};
use parking_lot::RwLock;
use snapmesh_common::{Snapshot, SnapshotId};
use snapmesh_meta_store::SnapshotStore;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Default)]
struct Catalog {
    by_id: HashMap<SnapshotId, Snapshot>,
    by_name: HashMap<String, SnapshotId>,
}

/// In-memory snapshot catalog backed by a `SnapshotStore`
pub struct SnapshotInventory {
    catalog: RwLock<Catalog>,
    store: Arc<dyn SnapshotStore>,
}

impl SnapshotInventory {
    /// Create an empty inventory
    pub fn new(store: Arc<dyn SnapshotStore>) -> Self {
        Self {
            catalog: RwLock::new(Catalog::default()),
            store,
        }
    }

    /// Replace the in-memory catalog with the store's contents
    pub fn load(&self) -> SnapshotResult<usize> {
        let snapshots = self.store.load_snapshots()?;
        let mut catalog = Catalog::default();
        for snap in snapshots {
            catalog.by_name.insert(snap.name.clone(), snap.id);
            catalog.by_id.insert(snap.id, snap);
        }
        let count = catalog.by_id.len();
        *self.catalog.write() = catalog;
        info!("Loaded {} snapshots", count);
        Ok(count)
    }

    pub fn find_by_name(&self, name: &str) -> Option<Snapshot> {
        let catalog = self.catalog.read();
        catalog
            .by_name
            .get(name)
            .and_then(|id| catalog.by_id.get(id))
            .cloned()
    }

    pub fn find_by_id(&self, id: SnapshotId) -> Option<Snapshot> {
        self.catalog.read().by_id.get(&id).cloned()
    }

    pub fn contains(&self, id: SnapshotId) -> bool {
        self.catalog.read().by_id.contains_key(&id)
    }

    /// Insert a snapshot.
    ///
    /// Returns `Ok(false)` if a snapshot with the same id is already present.
    /// A different snapshot holding the same name is an error.
    pub fn insert(&self, snapshot: Snapshot) -> SnapshotResult<bool> {
        let mut catalog = self.catalog.write();
        if catalog.by_id.contains_key(&snapshot.id) {
            debug!("Snapshot {} already present", snapshot.name);
            return Ok(false);
        }
        if catalog.by_name.contains_key(&snapshot.name) {
            return Err(SnapshotError::AlreadyExists(snapshot.name));
        }

        self.store.put_snapshot(&snapshot)?;
        catalog.by_name.insert(snapshot.name.clone(), snapshot.id);
        catalog.by_id.insert(snapshot.id, snapshot);
        Ok(true)
    }

    /// Replace an existing snapshot (same id)
    pub fn update(&self, snapshot: Snapshot) -> SnapshotResult<()> {
        let mut catalog = self.catalog.write();
        let Some(existing) = catalog.by_id.get(&snapshot.id) else {
            return Err(SnapshotError::NotFound(snapshot.name));
        };
        if existing.name != snapshot.name {
            return Err(SnapshotError::InvalidRequest(format!(
                "snapshot {} cannot be renamed to {}",
                existing.name, snapshot.name
            )));
        }

        self.store.put_snapshot(&snapshot)?;
        catalog.by_id.insert(snapshot.id, snapshot);
        Ok(())
    }

    /// Remove a snapshot; an absent id yields `Ok(None)`
    pub fn remove(&self, id: SnapshotId) -> SnapshotResult<Option<Snapshot>> {
        let mut catalog = self.catalog.write();
        if !catalog.by_id.contains_key(&id) {
            return Ok(None);
        }

        self.store.delete_snapshot(id)?;
        let removed = catalog.by_id.remove(&id);
        if let Some(snap) = &removed {
            catalog.by_name.remove(&snap.name);
        }
        Ok(removed)
    }

    /// All snapshots, oldest first
    pub fn list(&self) -> Vec<Snapshot> {
        let mut snapshots: Vec<Snapshot> = self.catalog.read().by_id.values().cloned().collect();
        snapshots.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.name.cmp(&b.name))
        });
        snapshots
    }

    /// Snapshots taken of `volume`, oldest first
    pub fn list_for_volume(&self, volume: &str) -> Vec<Snapshot> {
        self.list()
            .into_iter()
            .filter(|s| s.volume_for_parent(volume).is_some())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.catalog.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
