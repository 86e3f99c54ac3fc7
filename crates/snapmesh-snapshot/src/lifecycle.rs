//! Side effects of removing, importing and restoring a snapshot on this node
//!
//! Used by the reconciliation executor, by missed-op replay and by locally
//! initiated operations, so every path drives the backends and the service
//! controller the same way.

use crate::backend::BackendRegistry;
use crate::error::{SnapshotError, SnapshotResult};
use crate::inventory::SnapshotInventory;
use crate::service::{ServiceController, ServiceRef};
use snapmesh_common::{NodeId, Snapshot, SnapshotStatus, SnapshotVolume};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Result of one lifecycle step
#[derive(Debug, Default)]
pub struct Applied {
    /// False when the step found nothing to do
    pub changed: bool,
    /// Service controller failures, reported but not rolled back
    pub service_errors: Vec<SnapshotError>,
}

impl Applied {
    const fn unchanged() -> Self {
        Self {
            changed: false,
            service_errors: Vec::new(),
        }
    }

    const fn changed() -> Self {
        Self {
            changed: true,
            service_errors: Vec::new(),
        }
    }

    fn note(&mut self, result: SnapshotResult<()>) {
        if let Err(e) = result {
            warn!("{}", e);
            self.service_errors.push(e);
        }
    }
}

pub struct SnapshotLifecycle {
    local: NodeId,
    inventory: Arc<SnapshotInventory>,
    backends: BackendRegistry,
    services: Arc<dyn ServiceController>,
}

impl SnapshotLifecycle {
    pub fn new(
        local: NodeId,
        inventory: Arc<SnapshotInventory>,
        backends: BackendRegistry,
        services: Arc<dyn ServiceController>,
    ) -> Self {
        Self {
            local,
            inventory,
            backends,
            services,
        }
    }

    pub const fn local_node(&self) -> NodeId {
        self.local
    }

    pub const fn backends(&self) -> &BackendRegistry {
        &self.backends
    }

    /// Remove a snapshot from this node.
    ///
    /// Local bricks are handed to their backend first; if any removal fails
    /// the inventory is left untouched so the caller can retry. The backing
    /// devices are destroyed only with `remove_store`.
    pub fn remove(&self, snapshot: &Snapshot, remove_store: bool) -> SnapshotResult<Applied> {
        if !self.inventory.contains(snapshot.id) {
            debug!("Snapshot {} already absent", snapshot.name);
            return Ok(Applied::unchanged());
        }

        for volume in &snapshot.volumes {
            let backend = self.backends.get(volume.backend)?;
            for (_, brick) in volume.local_bricks(self.local) {
                if brick.snapshot_pending {
                    debug!("Brick {} has no backend snapshot, skipping", brick.path);
                    continue;
                }
                backend.remove(brick, remove_store).inspect_err(|e| {
                    error!(
                        "Failed to remove brick {} of snapshot {}: {}",
                        brick.path, snapshot.name, e
                    );
                })?;
            }
        }

        self.inventory.remove(snapshot.id)?;
        info!(
            "Removed snapshot {} ({})",
            snapshot.name,
            if remove_store {
                "metadata and backend store"
            } else {
                "metadata only"
            }
        );

        let mut applied = Applied::changed();
        for volume in &snapshot.volumes {
            if volume.hosts_bricks_of(self.local) {
                applied.note(self.services.stop(&Self::bricks_of(snapshot, volume)));
            }
        }
        Ok(applied)
    }

    /// Add a snapshot to this node and bring its services in line.
    ///
    /// Decommissioned snapshots are never imported. Importing an id that is
    /// already present does nothing.
    pub fn import(&self, snapshot: Snapshot) -> SnapshotResult<Applied> {
        if snapshot.status == SnapshotStatus::Decommissioned {
            debug!("Not importing decommissioned snapshot {}", snapshot.name);
            return Ok(Applied::unchanged());
        }
        if !self.inventory.insert(snapshot.clone())? {
            return Ok(Applied::unchanged());
        }
        info!("Imported snapshot {} ({})", snapshot.name, snapshot.id);

        let mut applied = Applied::changed();
        applied.note(self.services.regenerate(&snapshot));
        self.sync_bricks(&snapshot, &mut applied);
        Ok(applied)
    }

    /// Roll the origin volumes back to `snapshot`.
    ///
    /// The origin bricks are stopped first; if that fails nothing changes.
    /// On success the snapshot is marked restored and every volume version
    /// is bumped.
    pub fn restore(&self, snapshot: &Snapshot) -> SnapshotResult<Applied> {
        let Some(mut current) = self.inventory.find_by_id(snapshot.id) else {
            return Err(SnapshotError::NotFound(snapshot.name.clone()));
        };
        if current.restored {
            debug!("Snapshot {} already restored", current.name);
            return Ok(Applied::unchanged());
        }

        for volume in &current.volumes {
            self.services.stop(&ServiceRef::VolumeBricks {
                volume: volume.parent_volume_name.clone(),
            })?;
        }

        current.restored = true;
        current.status = SnapshotStatus::Restored;
        for volume in &mut current.volumes {
            volume.version += 1;
        }
        self.inventory.update(current.clone())?;
        info!("Restored snapshot {}", current.name);

        let mut applied = Applied::changed();
        applied.note(self.services.regenerate(&current));
        for volume in &current.volumes {
            applied.note(self.services.start(&ServiceRef::VolumeBricks {
                volume: volume.parent_volume_name.clone(),
            }));
        }
        Ok(applied)
    }

    /// Start or stop the local bricks of every volume to match its state
    pub fn sync_bricks(&self, snapshot: &Snapshot, applied: &mut Applied) {
        for volume in &snapshot.volumes {
            if !volume.hosts_bricks_of(self.local) {
                continue;
            }
            let service = Self::bricks_of(snapshot, volume);
            if volume.started {
                applied.note(self.services.start(&service));
            } else {
                applied.note(self.services.stop(&service));
            }
        }
    }

    fn bricks_of(snapshot: &Snapshot, volume: &SnapshotVolume) -> ServiceRef {
        ServiceRef::SnapshotBricks {
            snapshot: snapshot.name.clone(),
            volume: volume.name.clone(),
        }
    }
}
