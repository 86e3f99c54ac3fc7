//! Snapshot storage backend abstraction
//!
//! A backend takes, removes and inspects the per-brick point-in-time copies
//! that make up a snapshot. The kind is chosen once when a snapshot volume
//! is created and stored on it, so later removals use the same backend.
//!
//! # Backends
//!
//! - `lvm`: LVM thin logical volumes (`lvcreate -s`, `lvremove`)
//! - `zfs`: ZFS snapshots (`zfs snapshot`, `zfs destroy`)

pub mod lvm;
pub mod registry;
pub mod zfs;

pub use lvm::LvmBackend;
pub use registry::BackendRegistry;
pub use zfs::ZfsBackend;

use crate::error::{SnapshotError, SnapshotResult};
use snapmesh_common::{BackendKind, Brick, VolumeId};
use std::process::{Command, Output};
use tracing::debug;

/// Core trait for snapshot storage backends
pub trait SnapshotBackend: Send + Sync {
    /// Which backend this is
    fn kind(&self) -> BackendKind;

    /// Snapshot one origin brick.
    ///
    /// Returns the snapshot brick with its device path and mount directory
    /// filled in.
    fn create(
        &self,
        origin: &Brick,
        snap_volume_id: VolumeId,
        brick_num: u32,
    ) -> SnapshotResult<Brick>;

    /// Remove a snapshot brick.
    ///
    /// The brick is always unmounted; the backing device is destroyed only
    /// when `remove_store` is set. A device that no longer exists counts as
    /// removed.
    fn remove(&self, brick: &Brick, remove_store: bool) -> SnapshotResult<()>;

    /// Whether the brick's device can be snapshotted by this backend
    fn probe(&self, brick: &Brick) -> SnapshotResult<bool>;
}

/// Name of the backend object holding brick `brick_num` of a snapshot volume
#[must_use]
pub fn brick_snapshot_name(snap_volume_id: VolumeId, brick_num: u32) -> String {
    format!("{}_{}", snap_volume_id.as_uuid().simple(), brick_num)
}

/// Mount directory of a snapshot brick
#[must_use]
pub fn brick_mount_dir(snap_volume_id: VolumeId, brick_num: u32) -> String {
    format!(
        "/run/snapmesh/snaps/{}/brick{}",
        snap_volume_id.as_uuid().simple(),
        brick_num
    )
}

/// Snapshot brick derived from `origin`, backed by `device_path`
pub(crate) fn snapshot_brick(
    origin: &Brick,
    device_path: String,
    snap_volume_id: VolumeId,
    brick_num: u32,
) -> Brick {
    let mount_dir = brick_mount_dir(snap_volume_id, brick_num);
    let leaf = origin.path.rsplit('/').find(|p| !p.is_empty()).unwrap_or("brick");
    Brick {
        owning_node: origin.owning_node,
        path: format!("{mount_dir}/{leaf}"),
        device_path,
        fs_type: origin.fs_type.clone(),
        mount_options: origin.mount_options.clone(),
        mount_dir,
        snapshot_pending: false,
    }
}

/// Run a command and fail on non-zero exit
pub(crate) fn run(program: &str, args: &[&str]) -> SnapshotResult<Output> {
    debug!("Running {} {}", program, args.join(" "));
    let target = args.last().copied().unwrap_or(program);
    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|e| SnapshotError::backend(target, format!("failed to run {program}: {e}")))?;

    if !output.status.success() {
        return Err(SnapshotError::backend(
            target,
            format!(
                "{} failed: {}",
                program,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        ));
    }
    Ok(output)
}

/// Unmount a snapshot brick, ignoring "not mounted"
pub(crate) fn unmount(mount_dir: &str) -> SnapshotResult<()> {
    if mount_dir.is_empty() || !std::path::Path::new(mount_dir).exists() {
        return Ok(());
    }
    match run("umount", &["-f", mount_dir]) {
        Ok(_) => Ok(()),
        Err(SnapshotError::Backend { message, .. }) if message.contains("not mounted") => Ok(()),
        Err(e) => Err(e),
    }
}
