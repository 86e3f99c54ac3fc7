//! Handshake reconciliation between two nodes.

mod common;

use common::{Removal, TestNode, is_conflict, snapshot};
use rand::seq::SliceRandom;
use snapmesh_common::{
    Brick, BrickRef, ErrorClass, MissedOp, QuorumPolicy, Volume, VolumeId, VolumeLayout,
};
use snapmesh_quorum::{PeerQuorumState, ReachabilitySnapshot};
use snapmesh_snapshot::{CreateRequest, NoOpReason, SnapshotError};

#[test]
fn test_accept_missing_snapshot() {
    let a = TestNode::in_memory();
    let b = TestNode::in_memory();
    let snap = snapshot("s1", 100, &[b.id]);
    b.seed(&snap);

    let report = a.reconcile_with(&b);

    assert!(report.first_error().is_none());
    assert_eq!(report.applied.imported, 1);
    assert_eq!(a.snapshot_id("s1"), Some(snap.id));
    assert!(a.backend.removals().is_empty());
}

#[test]
fn test_version_supersession_keeps_backend_store() {
    let a = TestNode::in_memory();
    let b = TestNode::in_memory();
    let snap = snapshot("s1", 100, &[a.id, b.id]);
    a.seed(&snap);
    let mut newer = snap.clone();
    newer.volumes[0].version = 2;
    newer.restored = true;
    b.seed(&newer);

    let report = a.reconcile_with(&b);

    assert_eq!(report.applied.removed, 1);
    assert_eq!(report.applied.imported, 1);
    assert_eq!(
        a.backend.removals(),
        vec![Removal {
            device: snap.volumes[0].bricks[0].device_path.clone(),
            remove_store: false,
        }]
    );
    let local = a.node.inventory().find_by_name("s1").unwrap();
    assert_eq!(local.id, snap.id);
    assert_eq!(local.volumes[0].version, 2);
    assert!(local.restored);
}

#[test]
fn test_identity_conflict_replaces_unhosted_copy() {
    let a = TestNode::in_memory();
    let b = TestNode::in_memory();
    // A holds a copy it does not host bricks for, B hosts its own
    let ours = snapshot("s1", 100, &[b.id]);
    a.seed(&ours);
    let theirs = snapshot("s1", 105, &[b.id]);
    b.seed(&theirs);

    let report = a.reconcile_with(&b);

    assert!(report.first_error().is_none());
    assert_eq!(a.snapshot_id("s1"), Some(theirs.id));
    // No local bricks, so nothing for the backend to do
    assert!(a.backend.removals().is_empty());
}

#[test]
fn test_pending_local_brick_counts_as_hosting() {
    let a = TestNode::in_memory();
    let b = TestNode::in_memory();
    let mut ours = snapshot("s1", 100, &[b.id]);
    // A carries a brick of its own but it was never snapshotted
    let mut stray = Brick::new(a.id, "/run/snapmesh/s1/stray");
    stray.snapshot_pending = true;
    ours.volumes[0].bricks.push(stray);
    a.seed(&ours);
    b.seed(&snapshot("s1", 105, &[b.id]));

    // A hosts a brick of its copy and B hosts bricks of its own: conflict
    let report = a.reconcile_with(&b);
    assert!(is_conflict(report.first_error()));
    assert_eq!(a.snapshot_id("s1"), Some(ours.id));
}

#[test]
fn test_local_hosted_copy_wins() {
    let a = TestNode::in_memory();
    let b = TestNode::in_memory();
    let ours = snapshot("s1", 100, &[a.id]);
    a.seed(&ours);
    b.seed(&snapshot("s1", 105, &[a.id]));

    let report = a.reconcile_with(&b);

    assert!(report.first_error().is_none());
    assert_eq!(
        report.noops,
        vec![("s1".to_string(), NoOpReason::LocalHostsBricks)]
    );
    assert_eq!(a.snapshot_id("s1"), Some(ours.id));
    assert!(a.backend.removals().is_empty());
}

#[test]
fn test_symmetric_conflict_rejected_on_both_sides() {
    let a = TestNode::in_memory();
    let b = TestNode::in_memory();
    let on_a = snapshot("s1", 100, &[a.id]);
    let on_b = snapshot("s1", 100, &[b.id]);
    a.seed(&on_a);
    b.seed(&on_b);

    let from_a = a.reconcile_with(&b);
    let from_b = b.reconcile_with(&a);

    for report in [&from_a, &from_b] {
        let err = report.first_error().unwrap();
        assert_eq!(err.class(), ErrorClass::Conflict);
        assert_eq!(report.applied.imported, 0);
        assert_eq!(report.applied.removed, 0);
    }
    assert_eq!(a.snapshot_id("s1"), Some(on_a.id));
    assert_eq!(b.snapshot_id("s1"), Some(on_b.id));
}

#[test]
fn test_hosting_tie_break_is_symmetric() {
    let a = TestNode::in_memory();
    let b = TestNode::in_memory();
    let on_a = snapshot("s1", 100, &[b.id]);
    let on_b = snapshot("s1", 100, &[b.id]);
    a.seed(&on_a);
    b.seed(&on_b);

    let from_b = b.reconcile_with(&a);
    let from_a = a.reconcile_with(&b);

    // B hosts, A does not: both sides settle on B's copy
    assert_eq!(
        from_b.noops,
        vec![("s1".to_string(), NoOpReason::LocalHostsBricks)]
    );
    assert_eq!(from_a.applied.imported, 1);
    assert_eq!(a.snapshot_id("s1"), b.snapshot_id("s1"));
}

#[test]
fn test_replica3_brick_down_rejected_before_backend() {
    let a = TestNode::in_memory();
    let b = TestNode::in_memory();
    let c = TestNode::in_memory();
    let bricks: Vec<Brick> = [a.id, b.id, c.id]
        .iter()
        .enumerate()
        .map(|(i, node)| {
            let mut brick = Brick::new(*node, format!("/data/brick{i}/vol0"));
            brick.device_path = format!("/dev/vg0/lv{i}");
            brick
        })
        .collect();
    let volume = Volume {
        id: VolumeId::new(),
        name: "vol0".to_string(),
        layout: VolumeLayout::Replicate { replica_count: 3 },
        quorum: QuorumPolicy::Auto,
        bricks: bricks.clone(),
        snap_max_hard_limit: None,
        started: true,
    };
    let mut view = ReachabilitySnapshot::new(a.id)
        .with_peer(b.id, PeerQuorumState::Up)
        .with_peer(c.id, PeerQuorumState::Up);
    view.set_brick_online(a.id, bricks[0].path.clone(), true);
    view.set_brick_online(b.id, bricks[1].path.clone(), true);

    let err = a
        .node
        .manager()
        .create(
            CreateRequest {
                name: "s1".to_string(),
                description: None,
                volumes: vec![volume],
                force: false,
            },
            &view,
        )
        .unwrap_err();

    assert!(matches!(
        err,
        SnapshotError::QuorumNotMet {
            class: ErrorClass::BrickDown,
            ..
        }
    ));
    assert!(a.backend.creates().is_empty());
    assert!(a.node.inventory().is_empty());
}

#[test]
fn test_reconcile_is_idempotent() {
    let a = TestNode::in_memory();
    let b = TestNode::in_memory();
    b.seed(&snapshot("s1", 100, &[b.id]));
    b.seed(&snapshot("s2", 200, &[a.id, b.id]));

    let first = a.reconcile_with(&b);
    let second = a.reconcile_with(&b);

    assert_eq!(first.applied.imported, 2);
    assert_eq!(second.applied.imported, 0);
    assert_eq!(second.applied.removed, 0);
    assert!(second.applied.is_clean());
    assert_eq!(a.node.inventory().len(), 2);
}

#[test]
fn test_missed_delete_replayed_once() {
    let a = TestNode::in_memory();
    let b = TestNode::in_memory();
    let snap = snapshot("s1", 100, &[a.id, b.id]);
    a.seed(&snap);
    b.seed(&snap);

    // B deletes without A confirming
    let view = ReachabilitySnapshot::new(b.id).with_peer(a.id, PeerQuorumState::Up);
    b.node.manager().delete("s1", &[], &view).unwrap();
    assert!(b.node.missed_log().has_pending_delete_or_restore(a.id, snap.id));

    let first = a.reconcile_with(&b);
    assert_eq!(first.applied.replayed, 1);
    assert!(a.node.inventory().is_empty());
    assert_eq!(a.backend.removals().len(), 1);
    assert!(a.backend.removals()[0].remove_store);

    // B still reports the entry pending; A must not act on it again
    let second = a.reconcile_with(&b);
    assert_eq!(second.applied.replayed, 0);
    assert_eq!(a.backend.removals().len(), 1);

    // B learns the entry is done from A
    b.reconcile_with(&a);
    assert!(!b.node.missed_log().has_pending_delete_or_restore(a.id, snap.id));
}

#[test]
fn test_stale_peer_copy_not_reimported() {
    let a = TestNode::in_memory();
    let b = TestNode::in_memory();
    let snap = snapshot("s1", 100, &[a.id, b.id]);
    b.seed(&snap);
    // A already deleted s1 and knows B has not caught up
    a.node
        .missed_log()
        .record(
            b.id,
            snap.id,
            MissedOp::Delete,
            BrickRef {
                snap_volume_id: snap.volumes[0].volume_id,
                brick_num: 2,
                brick_path: snap.volumes[0].bricks[1].path.clone(),
            },
        )
        .unwrap();

    let report = a.reconcile_with(&b);

    assert_eq!(
        report.noops,
        vec![("s1".to_string(), NoOpReason::StalePeerData)]
    );
    assert!(a.node.inventory().is_empty());
}

#[test]
fn test_conflict_keeps_earlier_decisions_in_any_export_order() {
    let a = TestNode::in_memory();
    let b = TestNode::in_memory();
    a.seed(&snapshot("clash", 300, &[a.id]));
    for (i, name) in ["s1", "s2", "s3", "clash", "s4", "s5"].iter().enumerate() {
        let owner = if *name == "clash" { b.id } else { a.id };
        b.seed(&snapshot(name, (i as u64 + 1) * 100, &[owner]));
    }

    let mut export = b.node.export();
    export.snapshots.shuffle(&mut rand::thread_rng());
    let report = a.node.reconcile(&export).unwrap();

    assert!(is_conflict(report.first_error()));
    assert_eq!(report.applied.imported, 3);
    for name in ["s1", "s2", "s3"] {
        assert!(a.snapshot_id(name).is_some(), "{name} should be imported");
    }
    for name in ["s4", "s5"] {
        assert!(a.snapshot_id(name).is_none(), "{name} comes after the conflict");
    }
}

#[test]
fn test_state_survives_restart() {
    let a = TestNode::on_disk();
    let b = TestNode::in_memory();
    let snap = snapshot("s1", 100, &[b.id]);
    b.seed(&snap);
    a.reconcile_with(&b);

    let a = a.restart();
    assert_eq!(a.snapshot_id("s1"), Some(snap.id));
    let report = a.reconcile_with(&b);
    assert_eq!(report.applied.imported, 0);
}

#[test]
fn test_own_export_refused() {
    let a = TestNode::in_memory();
    assert!(a.node.reconcile(&a.node.export()).is_err());
}
