//! Locally initiated snapshot operations
//!
//! Every entry point asks the quorum gate first and returns before touching
//! a backend or the inventory when the gate says no.

use crate::backend::{SnapshotBackend, snapshot_brick};
use crate::error::{SnapshotError, SnapshotResult};
use crate::exclusive::{Activity, ExclusiveSection};
use crate::inventory::SnapshotInventory;
use crate::lifecycle::SnapshotLifecycle;
use crate::missed::MissedOpLog;
use snapmesh_common::config::SnapshotConfig;
use snapmesh_common::{
    Brick, BrickRef, MissedOp, NodeId, QuorumPolicy, Snapshot, SnapshotId, SnapshotStatus,
    SnapshotVolume, Volume, VolumeId,
};
use snapmesh_quorum::{QuorumGate, QuorumVerdict, ReachabilitySnapshot, SnapshotOp};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

/// Parameters of a snapshot create
#[derive(Clone, Debug)]
pub struct CreateRequest {
    pub name: String,
    pub description: Option<String>,
    pub volumes: Vec<Volume>,
    /// Take the snapshot even if a replica brick is down
    pub force: bool,
}

pub struct SnapshotManager {
    local: NodeId,
    gate: QuorumGate,
    limits: SnapshotConfig,
    inventory: Arc<SnapshotInventory>,
    log: Arc<MissedOpLog>,
    lifecycle: Arc<SnapshotLifecycle>,
    exclusive: Arc<ExclusiveSection>,
}

impl SnapshotManager {
    pub fn new(
        gate: QuorumGate,
        limits: SnapshotConfig,
        inventory: Arc<SnapshotInventory>,
        log: Arc<MissedOpLog>,
        lifecycle: Arc<SnapshotLifecycle>,
        exclusive: Arc<ExclusiveSection>,
    ) -> Self {
        Self {
            local: lifecycle.local_node(),
            gate,
            limits,
            inventory,
            log,
            lifecycle,
            exclusive,
        }
    }

    /// Snapshot one or more volumes.
    ///
    /// Fails without touching the inventory if any local brick cannot be
    /// snapshotted; backend snapshots already taken are removed again.
    #[instrument(skip_all, fields(snapshot = %request.name))]
    pub fn create(
        &self,
        request: CreateRequest,
        view: &ReachabilitySnapshot,
    ) -> SnapshotResult<Snapshot> {
        admit(
            self.gate
                .check(SnapshotOp::Create { force: request.force }, &request.volumes, view),
        )?;

        if request.name.is_empty() {
            return Err(SnapshotError::InvalidRequest(
                "snapshot name is empty".to_string(),
            ));
        }
        if request.volumes.is_empty() {
            return Err(SnapshotError::InvalidRequest(format!(
                "snapshot {} names no volumes",
                request.name
            )));
        }

        let _guard = self.exclusive.enter(Activity::LocalOperation);
        if self.inventory.find_by_name(&request.name).is_some() {
            return Err(SnapshotError::AlreadyExists(request.name));
        }

        let mut over_soft_limit: Vec<String> = Vec::new();
        let mut hard_limits = Vec::with_capacity(request.volumes.len());
        for volume in &request.volumes {
            let hard_limit = self.effective_hard_limit(volume);
            let taken = self.inventory.list_for_volume(&volume.name).len() as u64;
            if taken >= hard_limit {
                return Err(SnapshotError::LimitReached {
                    volume: volume.name.clone(),
                    limit: hard_limit,
                });
            }
            let soft_limit = hard_limit * self.limits.max_soft_limit_percent / 100;
            if taken + 1 >= soft_limit {
                if self.limits.auto_delete {
                    over_soft_limit.push(volume.name.clone());
                } else {
                    warn!(
                        "Volume {} reaches the soft snapshot limit: {} of {}",
                        volume.name,
                        taken + 1,
                        hard_limit
                    );
                }
            }
            hard_limits.push(hard_limit);
        }

        let mut volumes = Vec::with_capacity(request.volumes.len());
        for (volume, hard_limit) in request.volumes.iter().zip(hard_limits) {
            match self.snapshot_volume(volume, hard_limit) {
                Ok(snap_volume) => volumes.push(snap_volume),
                Err(e) => {
                    self.discard(&volumes);
                    return Err(e);
                }
            }
        }

        let snapshot = Snapshot {
            id: SnapshotId::new(),
            name: request.name,
            description: request.description,
            created_at: u64::try_from(chrono::Utc::now().timestamp()).unwrap_or_default(),
            status: SnapshotStatus::InUse,
            restored: false,
            volumes,
        };
        let applied = match self.lifecycle.import(snapshot.clone()) {
            Ok(applied) => applied,
            Err(e) => {
                self.discard(&snapshot.volumes);
                return Err(e);
            }
        };
        for e in &applied.service_errors {
            warn!("Snapshot {} created, service error: {}", snapshot.name, e);
        }
        info!("Created snapshot {}", snapshot.name);

        for volume in over_soft_limit {
            self.delete_oldest(&volume, snapshot.id)?;
        }
        Ok(snapshot)
    }

    /// Delete a snapshot.
    ///
    /// Nodes hosting bricks of the snapshot that are missing from
    /// `confirmed` get a missed delete per brick, replayed when they
    /// reconnect. Nothing is recorded if the local delete fails.
    #[instrument(skip(self, confirmed, view))]
    pub fn delete(
        &self,
        name: &str,
        confirmed: &[NodeId],
        view: &ReachabilitySnapshot,
    ) -> SnapshotResult<Snapshot> {
        admit(self.gate.check(SnapshotOp::Delete, &[], view))?;
        let _guard = self.exclusive.enter(Activity::LocalOperation);
        let snapshot = self.find(name)?;

        self.lifecycle.remove(&snapshot, true)?;
        self.record_missed(&snapshot, MissedOp::Delete, confirmed)?;
        Ok(snapshot)
    }

    /// Restore the origin volumes to a snapshot
    #[instrument(skip(self, confirmed, view))]
    pub fn restore(
        &self,
        name: &str,
        confirmed: &[NodeId],
        view: &ReachabilitySnapshot,
    ) -> SnapshotResult<Snapshot> {
        admit(self.gate.check(SnapshotOp::Restore, &[], view))?;
        let _guard = self.exclusive.enter(Activity::LocalOperation);
        let snapshot = self.find(name)?;
        if snapshot.status == SnapshotStatus::Decommissioned {
            return Err(SnapshotError::InvalidRequest(format!(
                "snapshot {name} is decommissioned"
            )));
        }

        self.lifecycle.restore(&snapshot)?;
        self.record_missed(&snapshot, MissedOp::Restore, confirmed)?;
        self.find(name)
    }

    /// Create a writable volume from a single-volume snapshot
    #[instrument(skip(self, view))]
    pub fn clone(
        &self,
        name: &str,
        clone_name: &str,
        view: &ReachabilitySnapshot,
    ) -> SnapshotResult<Volume> {
        admit(self.gate.check(SnapshotOp::Clone, &[], view))?;
        if clone_name.is_empty() {
            return Err(SnapshotError::InvalidRequest(
                "clone name is empty".to_string(),
            ));
        }
        let snapshot = self.find(name)?;
        let [source] = snapshot.volumes.as_slice() else {
            return Err(SnapshotError::InvalidRequest(format!(
                "snapshot {name} spans {} volumes, clone needs exactly one",
                snapshot.volumes.len()
            )));
        };

        let id = VolumeId::new();
        let backend = self.lifecycle.backends().get(source.backend)?;
        let mut bricks = Vec::with_capacity(source.bricks.len());
        for (i, brick) in source.bricks.iter().enumerate() {
            let num = brick_num(i);
            if brick.owning_node == self.local && !brick.snapshot_pending {
                bricks.push(backend.create(brick, id, num)?);
            } else {
                bricks.push(deferred_brick(brick, id, num));
            }
        }

        info!("Cloned snapshot {} as volume {}", name, clone_name);
        Ok(Volume {
            id,
            name: clone_name.to_string(),
            layout: source.layout,
            quorum: QuorumPolicy::Auto,
            bricks,
            snap_max_hard_limit: None,
            started: false,
        })
    }

    fn find(&self, name: &str) -> SnapshotResult<Snapshot> {
        self.inventory
            .find_by_name(name)
            .ok_or_else(|| SnapshotError::NotFound(name.to_string()))
    }

    fn effective_hard_limit(&self, volume: &Volume) -> u64 {
        volume
            .snap_max_hard_limit
            .map_or(self.limits.max_hard_limit, |limit| {
                limit.min(self.limits.max_hard_limit)
            })
    }

    /// Take backend snapshots of the local bricks of `volume`
    fn snapshot_volume(&self, volume: &Volume, hard_limit: u64) -> SnapshotResult<SnapshotVolume> {
        let id = VolumeId::new();
        let kind = volume
            .bricks
            .first()
            .map_or(self.limits.default_backend, |b| self.lifecycle.backends().select(b));
        let backend = self.lifecycle.backends().get(kind)?;

        let mut bricks = Vec::with_capacity(volume.bricks.len());
        for (i, origin) in volume.bricks.iter().enumerate() {
            let num = brick_num(i);
            if origin.owning_node != self.local {
                bricks.push(deferred_brick(origin, id, num));
                continue;
            }
            match backend.create(origin, id, num) {
                Ok(brick) => bricks.push(brick),
                Err(e) => {
                    error!("Snapshot of brick {} failed: {}", origin.path, e);
                    self.discard_bricks(backend.as_ref(), &bricks);
                    return Err(e);
                }
            }
        }

        Ok(SnapshotVolume {
            volume_id: id,
            name: id.as_uuid().simple().to_string(),
            parent_volume_name: volume.name.clone(),
            version: 1,
            bricks,
            is_snap_volume: true,
            started: true,
            backend: kind,
            layout: volume.layout,
            snap_max_hard_limit: hard_limit,
        })
    }

    /// Remove the backend snapshots of a create that did not complete
    fn discard(&self, volumes: &[SnapshotVolume]) {
        for volume in volumes {
            match self.lifecycle.backends().get(volume.backend) {
                Ok(backend) => self.discard_bricks(backend.as_ref(), &volume.bricks),
                Err(e) => warn!("Cannot discard bricks of {}: {}", volume.name, e),
            }
        }
    }

    fn discard_bricks(&self, backend: &dyn SnapshotBackend, bricks: &[Brick]) {
        for brick in bricks {
            if brick.owning_node != self.local || brick.snapshot_pending {
                continue;
            }
            if let Err(e) = backend.remove(brick, true) {
                warn!("Failed to discard brick snapshot {}: {}", brick.device_path, e);
            }
        }
    }

    fn record_missed(
        &self,
        snapshot: &Snapshot,
        op: MissedOp,
        confirmed: &[NodeId],
    ) -> SnapshotResult<()> {
        for volume in &snapshot.volumes {
            for (i, brick) in volume.bricks.iter().enumerate() {
                if brick.owning_node == self.local || confirmed.contains(&brick.owning_node) {
                    continue;
                }
                self.log.record(
                    brick.owning_node,
                    snapshot.id,
                    op,
                    BrickRef {
                        snap_volume_id: volume.volume_id,
                        brick_num: brick_num(i),
                        brick_path: brick.path.clone(),
                    },
                )?;
            }
        }
        Ok(())
    }

    fn delete_oldest(&self, volume: &str, keep: SnapshotId) -> SnapshotResult<()> {
        let Some(oldest) = self
            .inventory
            .list_for_volume(volume)
            .into_iter()
            .find(|s| s.id != keep)
        else {
            return Ok(());
        };
        info!(
            "Soft snapshot limit reached on {}, deleting oldest snapshot {}",
            volume, oldest.name
        );
        self.lifecycle.remove(&oldest, true)?;
        Ok(())
    }
}

fn admit(verdict: QuorumVerdict) -> SnapshotResult<()> {
    match verdict {
        QuorumVerdict::Admitted => Ok(()),
        QuorumVerdict::Rejected { reason, class } => {
            Err(SnapshotError::QuorumNotMet { reason, class })
        }
    }
}

fn brick_num(index: usize) -> u32 {
    u32::try_from(index + 1).unwrap_or(u32::MAX)
}

/// Snapshot brick whose backend copy is taken elsewhere or later
fn deferred_brick(origin: &Brick, id: VolumeId, num: u32) -> Brick {
    let mut brick = snapshot_brick(origin, String::new(), id, num);
    brick.snapshot_pending = true;
    brick
}
