//! Shared fixtures for the snapshot integration tests.

#![allow(dead_code)]

use parking_lot::Mutex;
use snapmesh_common::{
    BackendKind, Brick, Config, NodeId, Snapshot, SnapshotId, SnapshotStatus, SnapshotVolume,
    VolumeId, VolumeLayout,
};
use snapmesh_meta_store::{MemoryStore, MetaStore, SnapshotStore};
use snapmesh_snapshot::{
    BackendRegistry, ServiceController, ServiceRef, SnapshotBackend, SnapshotError, SnapshotNode,
    SnapshotResult,
};
use std::sync::Arc;
use tempfile::TempDir;

/// One removal seen by `FakeBackend`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Removal {
    pub device: String,
    pub remove_store: bool,
}

/// Backend that records calls instead of running LVM
#[derive(Default)]
pub struct FakeBackend {
    pub creates: Mutex<Vec<String>>,
    pub removals: Mutex<Vec<Removal>>,
}

impl FakeBackend {
    pub fn removals(&self) -> Vec<Removal> {
        self.removals.lock().clone()
    }

    pub fn creates(&self) -> Vec<String> {
        self.creates.lock().clone()
    }
}

impl SnapshotBackend for FakeBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Lvm
    }

    fn create(
        &self,
        origin: &Brick,
        snap_volume_id: VolumeId,
        brick_num: u32,
    ) -> SnapshotResult<Brick> {
        self.creates.lock().push(origin.device_path.clone());
        let mut brick = origin.clone();
        brick.device_path = format!("/dev/vg0/{}_{brick_num}", snap_volume_id.as_uuid().simple());
        Ok(brick)
    }

    fn remove(&self, brick: &Brick, remove_store: bool) -> SnapshotResult<()> {
        self.removals.lock().push(Removal {
            device: brick.device_path.clone(),
            remove_store,
        });
        Ok(())
    }

    fn probe(&self, _brick: &Brick) -> SnapshotResult<bool> {
        Ok(true)
    }
}

/// Service controller that only records what it was asked to do
#[derive(Default)]
pub struct FakeServices {
    pub started: Mutex<Vec<ServiceRef>>,
    pub stopped: Mutex<Vec<ServiceRef>>,
}

impl ServiceController for FakeServices {
    fn start(&self, service: &ServiceRef) -> SnapshotResult<()> {
        self.started.lock().push(service.clone());
        Ok(())
    }

    fn stop(&self, service: &ServiceRef) -> SnapshotResult<()> {
        self.stopped.lock().push(service.clone());
        Ok(())
    }
}

/// A node under test with its fakes
pub struct TestNode {
    pub id: NodeId,
    pub node: SnapshotNode,
    pub backend: Arc<FakeBackend>,
    pub services: Arc<FakeServices>,
    pub store: Arc<dyn SnapshotStore>,
    _dir: Option<TempDir>,
}

impl TestNode {
    /// Node backed by an in-memory store
    pub fn in_memory() -> Self {
        Self::with_store(NodeId::new(), Arc::new(MemoryStore::new()), None)
    }

    /// Node backed by a redb file in a temporary directory
    pub fn on_disk() -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let store = MetaStore::open(dir.path().join("meta.redb")).expect("Failed to open store");
        Self::with_store(NodeId::new(), Arc::new(store), Some(dir))
    }

    fn with_store(id: NodeId, store: Arc<dyn SnapshotStore>, dir: Option<TempDir>) -> Self {
        let backend = Arc::new(FakeBackend::default());
        let services = Arc::new(FakeServices::default());
        let mut backends = BackendRegistry::new(BackendKind::Lvm);
        backends.register(backend.clone());
        let node = SnapshotNode::open(
            id,
            &Config::default(),
            store.clone(),
            backends,
            services.clone(),
        )
        .expect("Failed to open node");
        Self {
            id,
            node,
            backend,
            services,
            store,
            _dir: dir,
        }
    }

    /// Reopen the node on the same store, as after a restart
    pub fn restart(self) -> Self {
        Self::with_store(self.id, self.store, self._dir)
    }

    pub fn seed(&self, snapshot: &Snapshot) {
        assert!(self.node.inventory().insert(snapshot.clone()).unwrap());
    }

    pub fn snapshot_id(&self, name: &str) -> Option<SnapshotId> {
        self.node.inventory().find_by_name(name).map(|s| s.id)
    }

    /// Reconcile with `peer`'s current export
    pub fn reconcile_with(&self, peer: &Self) -> snapmesh_snapshot::ReconcileReport {
        self.node
            .reconcile(&peer.node.export())
            .expect("Reconcile failed")
    }
}

/// Snapshot of `vol0` with one brick per owner
pub fn snapshot(name: &str, created_at: u64, owners: &[NodeId]) -> Snapshot {
    let volume_id = VolumeId::new();
    let bricks = owners
        .iter()
        .enumerate()
        .map(|(i, owner)| {
            let mut brick = Brick::new(*owner, format!("/run/snapmesh/{name}/brick{}", i + 1));
            brick.device_path = format!("/dev/vg0/{name}_{}", i + 1);
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

/// Whether `err` is an identity conflict
pub fn is_conflict(err: Option<&SnapshotError>) -> bool {
    matches!(err, Some(SnapshotError::Conflict { .. }))
}
