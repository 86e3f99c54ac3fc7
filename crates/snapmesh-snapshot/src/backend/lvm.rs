//! LVM thin snapshot backend

use super::{SnapshotBackend, run, snapshot_brick, unmount};
use crate::error::{SnapshotError, SnapshotResult};
use snapmesh_common::{BackendKind, Brick, VolumeId};
use std::path::Path;
use tracing::{debug, info};

/// Snapshots bricks that live on thin-provisioned logical volumes
#[derive(Clone, Debug, Default)]
pub struct LvmBackend;

impl LvmBackend {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn volume_group(device: &str) -> SnapshotResult<String> {
        let output = run("lvs", &["--noheadings", "-o", "vg_name", device])?;
        let vg = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if vg.is_empty() {
            return Err(SnapshotError::backend(device, "no volume group reported"));
        }
        Ok(vg)
    }
}

impl SnapshotBackend for LvmBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Lvm
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
                "not a thinly provisioned logical volume",
            ));
        }

        let name = super::brick_snapshot_name(snap_volume_id, brick_num);
        run(
            "lvcreate",
            &[
                "-s",
                &origin.device_path,
                "--setactivationskip",
                "n",
                "--name",
                &name,
            ],
        )?;
        let vg = Self::volume_group(&origin.device_path)?;
        let device = format!("/dev/{vg}/{name}");

        info!("Created LVM snapshot {} of {}", device, origin.device_path);
        Ok(snapshot_brick(origin, device, snap_volume_id, brick_num))
    }

    fn remove(&self, brick: &Brick, remove_store: bool) -> SnapshotResult<()> {
        unmount(&brick.mount_dir)?;
        if !remove_store {
            return Ok(());
        }

        if brick.device_path.is_empty() || !Path::new(&brick.device_path).exists() {
            debug!(
                "LVM device {} not found, nothing to remove",
                brick.device_path
            );
            return Ok(());
        }

        run("lvremove", &["-f", &brick.device_path])?;
        info!("Removed LVM snapshot {}", brick.device_path);
        Ok(())
    }

    fn probe(&self, brick: &Brick) -> SnapshotResult<bool> {
        let output = run(
            "lvs",
            &["--noheadings", "-o", "pool_lv", &brick.device_path],
        )?;
        Ok(!String::from_utf8_lossy(&output.stdout).trim().is_empty())
    }
}
