//! Builders and recording fakes shared by unit tests

use crate::backend::{SnapshotBackend, brick_mount_dir, brick_snapshot_name};
use crate::error::{SnapshotError, SnapshotResult};
use crate::service::{ServiceController, ServiceRef};
use parking_lot::Mutex;
use snapmesh_common::{
    BackendKind, Brick, NodeId, Snapshot, SnapshotId, SnapshotStatus, SnapshotVolume, VolumeId,
    VolumeLayout,
};
use std::collections::HashSet;

/// Snapshot of `vol0` with one brick per node
pub fn snapshot_on(name: &str, created_at: u64, nodes: &[NodeId]) -> Snapshot {
    let volume_id = VolumeId::new();
    let bricks = nodes
        .iter()
        .enumerate()
        .map(|(i, node)| {
            let num = u32::try_from(i + 1).unwrap();
            let mut brick = Brick::new(*node, format!("/bricks/{name}/b{num}"));
            brick.device_path = format!("/dev/vg0/{}", brick_snapshot_name(volume_id, num));
            brick.mount_dir = brick_mount_dir(volume_id, num);
            brick.fs_type = "xfs".to_string();
            brick
        })
        .collect();

    Snapshot {
        id: SnapshotId::new(),
        name: name.to_string(),
        description: None,
        created_at,
        status: SnapshotStatus::InUse,
        restored: false,
        volumes: vec![SnapshotVolume {
            volume_id,
            name: volume_id.as_uuid().simple().to_string(),
            parent_volume_name: "vol0".to_string(),
            version: 1,
            bricks,
            is_snap_volume: true,
            started: true,
            backend: BackendKind::Lvm,
            layout: VolumeLayout::Distribute,
            snap_max_hard_limit: 256,
        }],
    }
}

/// Backend call as seen by `RecordingBackend`
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BackendCall {
    Create { device: String },
    Remove { device: String, remove_store: bool },
}

/// Backend that records calls and fails on chosen devices
pub struct RecordingBackend {
    kind: BackendKind,
    calls: Mutex<Vec<BackendCall>>,
    failing: Mutex<HashSet<String>>,
}

impl RecordingBackend {
    pub fn new(kind: BackendKind) -> Self {
        Self {
            kind,
            calls: Mutex::new(Vec::new()),
            failing: Mutex::new(HashSet::new()),
        }
    }

    pub fn fail_on(&self, device: &str) {
        self.failing.lock().insert(device.to_string());
    }

    pub fn heal(&self) {
        self.failing.lock().clear();
    }

    pub fn calls(&self) -> Vec<BackendCall> {
        self.calls.lock().clone()
    }

    fn check(&self, device: &str) -> SnapshotResult<()> {
        if self.failing.lock().contains(device) {
            return Err(SnapshotError::backend(device, "injected failure"));
        }
        Ok(())
    }
}

impl SnapshotBackend for RecordingBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn create(
        &self,
        origin: &Brick,
        snap_volume_id: VolumeId,
        brick_num: u32,
    ) -> SnapshotResult<Brick> {
        self.calls.lock().push(BackendCall::Create {
            device: origin.device_path.clone(),
        });
        self.check(&origin.device_path)?;
        let name = brick_snapshot_name(snap_volume_id, brick_num);
        Ok(crate::backend::snapshot_brick(
            origin,
            format!("/dev/vg0/{name}"),
            snap_volume_id,
            brick_num,
        ))
    }

    fn remove(&self, brick: &Brick, remove_store: bool) -> SnapshotResult<()> {
        self.calls.lock().push(BackendCall::Remove {
            device: brick.device_path.clone(),
            remove_store,
        });
        self.check(&brick.device_path)
    }

    fn probe(&self, _brick: &Brick) -> SnapshotResult<bool> {
        Ok(true)
    }
}

/// Controller call as seen by `RecordingController`
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ServiceCall {
    Start(ServiceRef),
    Stop(ServiceRef),
    Regenerate(String),
}

#[derive(Default)]
pub struct RecordingController {
    calls: Mutex<Vec<ServiceCall>>,
    fail_stops: Mutex<bool>,
}

impl RecordingController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<ServiceCall> {
        self.calls.lock().clone()
    }

    pub fn fail_stops(&self, fail: bool) {
        *self.fail_stops.lock() = fail;
    }
}

impl ServiceController for RecordingController {
    fn start(&self, service: &ServiceRef) -> SnapshotResult<()> {
        self.calls.lock().push(ServiceCall::Start(service.clone()));
        Ok(())
    }

    fn stop(&self, service: &ServiceRef) -> SnapshotResult<()> {
        self.calls.lock().push(ServiceCall::Stop(service.clone()));
        if *self.fail_stops.lock() {
            return Err(SnapshotError::service(service.unit_name(), "injected failure"));
        }
        Ok(())
    }

    fn regenerate(&self, snapshot: &Snapshot) -> SnapshotResult<()> {
        self.calls
            .lock()
            .push(ServiceCall::Regenerate(snapshot.name.clone()));
        Ok(())
    }
}
