//! Reconciliation executor
//!
//! Applies resolver decisions inside the exclusive section: removals first,
//! then imports, then a replay of this node's pending missed operations.

use crate::error::{SnapshotError, SnapshotResult};
use crate::exclusive::{Activity, ExclusiveSection};
use crate::inventory::SnapshotInventory;
use crate::lifecycle::{Applied, SnapshotLifecycle};
use crate::missed::{MissedOpLog, PendingOp};
use crate::resolver::{ReconciliationDecision, peer_is_newer};
use snapmesh_common::MissedOp;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

/// What one `apply` or replay did
#[derive(Debug, Default)]
pub struct ApplyReport {
    pub removed: usize,
    pub imported: usize,
    /// Imports skipped because the removal of the same decision failed
    pub skipped: Vec<String>,
    /// Decisions dropped because the local copy changed after they were made
    pub stale: Vec<String>,
    pub replayed: usize,
    /// Failed decisions and replays, in order
    pub errors: Vec<SnapshotError>,
    /// Service controller failures
    pub service_errors: Vec<SnapshotError>,
}

impl ApplyReport {
    #[must_use]
    pub fn first_error(&self) -> Option<&SnapshotError> {
        self.errors.first()
    }

    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty() && self.service_errors.is_empty()
    }

    fn absorb(&mut self, applied: Applied) {
        self.service_errors.extend(applied.service_errors);
    }
}

/// Outcome of restarting every local snapshot brick
#[derive(Debug, Default)]
pub struct RestartReport {
    pub snapshots: usize,
    pub service_errors: Vec<SnapshotError>,
}

pub struct ReconciliationExecutor {
    inventory: Arc<SnapshotInventory>,
    log: Arc<MissedOpLog>,
    lifecycle: Arc<SnapshotLifecycle>,
    exclusive: Arc<ExclusiveSection>,
}

impl ReconciliationExecutor {
    pub fn new(
        inventory: Arc<SnapshotInventory>,
        log: Arc<MissedOpLog>,
        lifecycle: Arc<SnapshotLifecycle>,
        exclusive: Arc<ExclusiveSection>,
    ) -> Self {
        Self {
            inventory,
            log,
            lifecycle,
            exclusive,
        }
    }

    /// Apply a batch of decisions, then replay missed operations.
    ///
    /// A failed decision does not stop the ones after it, and a decision the
    /// inventory has moved past is dropped. Blocks while another
    /// reconciliation, a brick restart or a local operation is running.
    #[instrument(skip_all, fields(decisions = decisions.len()))]
    pub fn apply(&self, decisions: &[ReconciliationDecision]) -> ApplyReport {
        let _guard = self.exclusive.enter(Activity::Reconciliation);
        let mut report = ApplyReport::default();
        let mut failed_removals: HashSet<usize> = HashSet::new();
        let mut dropped: HashSet<usize> = HashSet::new();

        for (idx, decision) in decisions.iter().enumerate() {
            if let Some(reason) = self.outdated(decision) {
                info!("Dropping decision for {}: {}", decision.snapshot_name, reason);
                dropped.insert(idx);
                report.stale.push(decision.snapshot_name.clone());
                continue;
            }
            if !decision.remove_local_data {
                continue;
            }
            let Some(local) = self.inventory.find_by_name(&decision.snapshot_name) else {
                debug!("Nothing local to remove for {}", decision.snapshot_name);
                continue;
            };
            match self.lifecycle.remove(&local, decision.remove_backend_store) {
                Ok(applied) => {
                    if applied.changed {
                        report.removed += 1;
                    }
                    report.absorb(applied);
                }
                Err(e) => {
                    error!("Failed to remove local copy of {}: {}", decision.snapshot_name, e);
                    failed_removals.insert(idx);
                    report.errors.push(e);
                }
            }
        }

        for (idx, decision) in decisions.iter().enumerate() {
            if !decision.accept_peer_data || dropped.contains(&idx) {
                continue;
            }
            if failed_removals.contains(&idx) {
                warn!(
                    "Not importing {}: local copy could not be removed",
                    decision.snapshot_name
                );
                report.skipped.push(decision.snapshot_name.clone());
                continue;
            }
            match self.lifecycle.import(decision.peer_snapshot.clone()) {
                Ok(applied) => {
                    if applied.changed {
                        report.imported += 1;
                    }
                    report.absorb(applied);
                }
                Err(e) => {
                    error!("Failed to import {}: {}", decision.snapshot_name, e);
                    report.errors.push(e);
                }
            }
        }

        self.replay_locked(&mut report);

        info!(
            "Reconciliation applied: {} removed, {} imported, {} replayed, {} failed",
            report.removed,
            report.imported,
            report.replayed,
            report.errors.len()
        );
        report
    }

    /// Replay this node's pending missed operations on their own
    pub fn replay_missed(&self) -> ApplyReport {
        let _guard = self.exclusive.enter(Activity::Reconciliation);
        let mut report = ApplyReport::default();
        self.replay_locked(&mut report);
        report
    }

    /// Start or stop every local snapshot brick to match its volume state
    pub fn restart_all_bricks(&self) -> RestartReport {
        let _guard = self.exclusive.enter(Activity::BrickRestart);
        let local = self.lifecycle.local_node();
        let mut applied = Applied::default();
        let mut snapshots = 0;

        for snapshot in self.inventory.list() {
            if !snapshot.hosts_bricks_of(local) {
                continue;
            }
            snapshots += 1;
            self.lifecycle.sync_bricks(&snapshot, &mut applied);
        }

        info!("Restarted bricks of {} snapshots", snapshots);
        RestartReport {
            snapshots,
            service_errors: applied.service_errors,
        }
    }

    /// Why `decision` no longer fits the inventory, if it does not.
    ///
    /// Decisions are made without the exclusive section, so another
    /// exchange may have changed the local copy in between.
    fn outdated(&self, decision: &ReconciliationDecision) -> Option<&'static str> {
        let current = self.inventory.find_by_name(&decision.snapshot_name)?;
        match &decision.local_snapshot {
            Some(expected) if current.id != expected.id => Some("local copy was replaced"),
            Some(_)
                if !decision.remove_backend_store
                    && !peer_is_newer(&current, &decision.peer_snapshot) =>
            {
                Some("local copy is already as new")
            }
            Some(_) => None,
            None if current.id != decision.peer_snapshot.id => {
                Some("another snapshot took the name")
            }
            None => None,
        }
    }

    fn replay_locked(&self, report: &mut ApplyReport) {
        let local = self.log.local_node();
        for pending in self.log.drain_local_pending() {
            match self.replay_one(&pending, report) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    error!(
                        "Replay of missed {} on {} failed, will retry: {}",
                        pending.op, pending.snapshot_id, e
                    );
                    report.errors.push(e);
                    continue;
                }
            }

            let settled = std::iter::once(pending.op).chain(pending.superseded.iter().copied());
            for op in settled {
                if let Err(e) = self.log.mark_done(local, pending.snapshot_id, op) {
                    error!("Failed to mark missed {} done: {}", op, e);
                    report.errors.push(e);
                }
            }
            report.replayed += 1;
        }
    }

    /// Run one missed operation. `Ok(false)` when the snapshot is not here.
    fn replay_one(&self, pending: &PendingOp, report: &mut ApplyReport) -> SnapshotResult<bool> {
        // Left pending: the snapshot may still be imported from a peer
        let Some(snapshot) = self.inventory.find_by_id(pending.snapshot_id) else {
            debug!(
                "Snapshot {} not present, missed {} stays pending",
                pending.snapshot_id, pending.op
            );
            return Ok(false);
        };

        info!("Replaying missed {} of snapshot {}", pending.op, snapshot.name);
        let applied = match pending.op {
            MissedOp::Delete => self.lifecycle.remove(&snapshot, true)?,
            MissedOp::Restore => self.lifecycle.restore(&snapshot)?,
        };
        report.absorb(applied);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendRegistry;
    use crate::test_support::{RecordingBackend, RecordingController, snapshot_on};
    use snapmesh_common::{BackendKind, BrickRef, NodeId, Snapshot};
    use snapmesh_meta_store::MemoryStore;

    struct Fixture {
        local: NodeId,
        inventory: Arc<SnapshotInventory>,
        log: Arc<MissedOpLog>,
        backend: Arc<RecordingBackend>,
        exclusive: Arc<ExclusiveSection>,
        executor: ReconciliationExecutor,
    }

    fn fixture() -> Fixture {
        let local = NodeId::new();
        let store = Arc::new(MemoryStore::new());
        let inventory = Arc::new(SnapshotInventory::new(store.clone()));
        let log = Arc::new(MissedOpLog::new(local, store));
        let backend = Arc::new(RecordingBackend::new(BackendKind::Lvm));
        let mut backends = BackendRegistry::new(BackendKind::Lvm);
        backends.register(backend.clone());
        let lifecycle = Arc::new(SnapshotLifecycle::new(
            local,
            inventory.clone(),
            backends,
            Arc::new(RecordingController::new()),
        ));
        let exclusive = Arc::new(ExclusiveSection::new());
        Fixture {
            local,
            executor: ReconciliationExecutor::new(
                inventory.clone(),
                log.clone(),
                lifecycle,
                exclusive.clone(),
            ),
            inventory,
            log,
            backend,
            exclusive,
        }
    }

    fn brick_ref(snap: &Snapshot) -> BrickRef {
        BrickRef {
            snap_volume_id: snap.volumes[0].volume_id,
            brick_num: 1,
            brick_path: snap.volumes[0].bricks[0].path.clone(),
        }
    }

    #[test]
    fn test_failed_removal_skips_import() {
        let f = fixture();
        let peer = NodeId::new();
        let ours = snapshot_on("s1", 10, &[f.local]);
        f.inventory.insert(ours.clone()).unwrap();
        f.backend.fail_on(&ours.volumes[0].bricks[0].device_path);
        let theirs = snapshot_on("s1", 11, &[peer]);
        let other = snapshot_on("s2", 12, &[peer]);

        let report = f.executor.apply(&[
            ReconciliationDecision::replace(peer, &theirs, ours.clone()),
            ReconciliationDecision::accept(peer, &other),
        ]);

        assert_eq!(report.removed, 0);
        assert_eq!(report.imported, 1);
        assert_eq!(report.skipped, vec!["s1".to_string()]);
        assert_eq!(
            report.first_error().unwrap().class(),
            snapmesh_common::ErrorClass::Backend
        );
        assert_eq!(f.inventory.find_by_name("s1").unwrap().id, ours.id);
        assert!(f.inventory.find_by_name("s2").is_some());
    }

    #[test]
    fn test_apply_twice_is_idempotent() {
        let f = fixture();
        let peer = NodeId::new();
        let theirs = snapshot_on("s1", 10, &[peer]);
        let decisions = vec![ReconciliationDecision::accept(peer, &theirs)];

        let first = f.executor.apply(&decisions);
        let second = f.executor.apply(&decisions);
        assert_eq!(first.imported, 1);
        assert_eq!(second.imported, 0);
        assert!(second.is_clean());
        assert_eq!(f.inventory.len(), 1);
    }

    #[test]
    fn test_replay_settles_superseded_entries() {
        let f = fixture();
        let snap = snapshot_on("s1", 10, &[f.local]);
        f.inventory.insert(snap.clone()).unwrap();
        f.log
            .record(f.local, snap.id, MissedOp::Delete, brick_ref(&snap))
            .unwrap();
        f.log
            .record(f.local, snap.id, MissedOp::Restore, brick_ref(&snap))
            .unwrap();

        let report = f.executor.replay_missed();
        assert_eq!(report.replayed, 1);
        assert!(f.inventory.is_empty());
        assert_eq!(f.log.pending_count(), 0);
        assert_eq!(f.backend.calls().len(), 1);

        // Nothing left to replay
        assert_eq!(f.executor.replay_missed().replayed, 0);
        assert_eq!(f.backend.calls().len(), 1);
    }

    #[test]
    fn test_failed_replay_stays_pending() {
        let f = fixture();
        let snap = snapshot_on("s1", 10, &[f.local]);
        f.inventory.insert(snap.clone()).unwrap();
        f.log
            .record(f.local, snap.id, MissedOp::Delete, brick_ref(&snap))
            .unwrap();
        f.backend.fail_on(&snap.volumes[0].bricks[0].device_path);

        let report = f.executor.replay_missed();
        assert_eq!(report.replayed, 0);
        assert_eq!(report.errors.len(), 1);
        assert!(f.log.has_pending_delete_or_restore(f.local, snap.id));

        f.backend.heal();
        assert_eq!(f.executor.replay_missed().replayed, 1);
        assert!(!f.log.has_pending_delete_or_restore(f.local, snap.id));
    }

    #[test]
    fn test_replay_ignores_peer_entries() {
        let f = fixture();
        let peer = NodeId::new();
        let snap = snapshot_on("s1", 10, &[peer]);
        f.inventory.insert(snap.clone()).unwrap();
        f.log
            .record(peer, snap.id, MissedOp::Delete, brick_ref(&snap))
            .unwrap();

        assert_eq!(f.executor.replay_missed().replayed, 0);
        assert!(f.inventory.contains(snap.id));
    }

    #[test]
    fn test_outdated_supersede_keeps_newer_copy() {
        let f = fixture();
        let (b, c) = (NodeId::new(), NodeId::new());
        let mut ours = snapshot_on("s1", 10, &[f.local]);
        ours.volumes[0].version = 3;
        f.inventory.insert(ours.clone()).unwrap();
        let at_version = |version| {
            let mut snap = ours.clone();
            snap.volumes[0].version = version;
            snap
        };
        // Both resolved against version 3 before either was applied
        let from_b = ReconciliationDecision::supersede(b, &at_version(5), ours.clone());
        let from_c = ReconciliationDecision::supersede(c, &at_version(6), ours.clone());

        let first = f.executor.apply(&[from_c]);
        assert_eq!(first.imported, 1);
        let calls = f.backend.calls().len();

        let second = f.executor.apply(&[from_b]);
        assert_eq!(second.stale, vec!["s1".to_string()]);
        assert_eq!(second.removed, 0);
        assert_eq!(second.imported, 0);
        assert!(second.is_clean());
        assert_eq!(f.backend.calls().len(), calls);
        assert_eq!(f.inventory.find_by_name("s1").unwrap().volumes[0].version, 6);
    }

    #[test]
    fn test_replace_dropped_when_local_copy_changed() {
        let f = fixture();
        let peer = NodeId::new();
        let resolved_against = snapshot_on("s1", 10, &[peer]);
        let current = snapshot_on("s1", 11, &[f.local]);
        f.inventory.insert(current.clone()).unwrap();
        let theirs = snapshot_on("s1", 12, &[peer]);

        let report = f
            .executor
            .apply(&[ReconciliationDecision::replace(peer, &theirs, resolved_against)]);

        assert_eq!(report.stale, vec!["s1".to_string()]);
        assert!(f.backend.calls().is_empty());
        assert_eq!(f.inventory.find_by_name("s1").unwrap().id, current.id);
    }

    #[test]
    fn test_accept_dropped_when_name_taken() {
        let f = fixture();
        let peer = NodeId::new();
        let current = snapshot_on("s1", 10, &[f.local]);
        f.inventory.insert(current.clone()).unwrap();

        let report = f.executor.apply(&[ReconciliationDecision::accept(
            peer,
            &snapshot_on("s1", 11, &[peer]),
        )]);

        assert_eq!(report.stale, vec!["s1".to_string()]);
        assert!(report.is_clean());
        assert_eq!(f.inventory.find_by_name("s1").unwrap().id, current.id);
    }

    #[test]
    fn test_missed_restore_waits_for_snapshot() {
        let f = fixture();
        let snap = snapshot_on("s1", 10, &[f.local]);
        f.log
            .record(f.local, snap.id, MissedOp::Restore, brick_ref(&snap))
            .unwrap();

        let report = f.executor.replay_missed();
        assert_eq!(report.replayed, 0);
        assert!(report.is_clean());
        assert!(f.log.has_pending_delete_or_restore(f.local, snap.id));

        f.inventory.insert(snap.clone()).unwrap();
        assert_eq!(f.executor.replay_missed().replayed, 1);
        assert!(f.inventory.find_by_id(snap.id).unwrap().restored);
        assert!(!f.log.has_pending_delete_or_restore(f.local, snap.id));
    }

    #[test]
    fn test_restart_only_hosted_snapshots() {
        let f = fixture();
        f.inventory
            .insert(snapshot_on("s1", 10, &[f.local]))
            .unwrap();
        f.inventory
            .insert(snapshot_on("remote", 11, &[NodeId::new()]))
            .unwrap();

        assert!(f.exclusive.holder().is_none());
        let report = f.executor.restart_all_bricks();
        assert_eq!(report.snapshots, 1);
        assert!(report.service_errors.is_empty());
        assert!(f.exclusive.holder().is_none());
    }
}
