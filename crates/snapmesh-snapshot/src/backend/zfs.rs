//! ZFS snapshot backend

use super::{SnapshotBackend, run, snapshot_brick, unmount};
use crate::error::{SnapshotError, SnapshotResult};
use snapmesh_common::{BackendKind, Brick, VolumeId};
use tracing::{debug, info};

/// Snapshots bricks whose device path names a ZFS dataset
#[derive(Clone, Debug, Default)]
pub struct ZfsBackend;

impl ZfsBackend {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn exists(name: &str) -> bool {
        run("zfs", &["list", "-H", "-o", "name", name]).is_ok()
    }
}

impl SnapshotBackend for ZfsBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Zfs
    }

    fn create(
        &self,
        origin: &Brick,
        snap_volume_id: VolumeId,
        brick_num: u32,
    ) -> SnapshotResult<Brick> {
        if !self.probe(origin)? {
            return Err(SnapshotError::backend(
                &origin.device_path,
                "not a ZFS dataset",
            ));
        }

        let name = super::brick_snapshot_name(snap_volume_id, brick_num);
        let snapshot = format!("{}@{}", origin.device_path, name);
        run("zfs", &["snapshot", &snapshot])?;

        info!("Created ZFS snapshot {}", snapshot);
        Ok(snapshot_brick(origin, snapshot, snap_volume_id, brick_num))
    }

    fn remove(&self, brick: &Brick, remove_store: bool) -> SnapshotResult<()> {
        unmount(&brick.mount_dir)?;
        if !remove_store {
            return Ok(());
        }

        if brick.device_path.is_empty() || !Self::exists(&brick.device_path) {
            debug!(
                "ZFS snapshot {} not found, nothing to remove",
                brick.device_path
            );
            return Ok(());
        }

        run("zfs", &["destroy", &brick.device_path])?;
        info!("Destroyed ZFS snapshot {}", brick.device_path);
        Ok(())
    }

    fn probe(&self, brick: &Brick) -> SnapshotResult<bool> {
        Ok(!brick.device_path.is_empty()
            && !brick.device_path.contains('@')
            && Self::exists(&brick.device_path))
    }
}
