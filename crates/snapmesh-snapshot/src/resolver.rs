//! Conflict resolution between the local inventory and a peer's export
//!
//! The resolver is a pure decision pass. It reads the inventory and the
//! missed-op log but never mutates them and never calls a backend or the
//! service controller; the executor applies what it decides.
//!
//! Rules, per peer snapshot in creation order:
//!
//! 1. The peer still has a pending delete or restore for the snapshot: its
//!    copy is stale, keep ours.
//! 2. No local snapshot of that name: take the peer's copy, unless the peer
//!    has decommissioned it.
//! 3. Same name, same id: take the peer's copy if any of its volumes carries
//!    a higher version than ours. Only our metadata is replaced, the backend
//!    data is the same.
//! 4. Same name, different id: whoever hosts bricks of the snapshot wins. If
//!    both or neither do, the exchange is rejected.

use crate::error::SnapshotError;
use crate::exchange::{PeerExport, PeerSnapshot};
use crate::inventory::SnapshotInventory;
use crate::missed::MissedOpLog;
use snapmesh_common::{NodeId, Snapshot, SnapshotStatus};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Why a peer snapshot needs no action
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NoOpReason {
    /// The peer has not yet replayed a delete or restore of this snapshot
    StalePeerData,
    /// The peer copy is decommissioned
    PeerDecommissioned,
    /// Our copy is at least as new as the peer's
    UpToDate,
    /// Identity conflict won by the local copy, which hosts bricks
    LocalHostsBricks,
}

impl fmt::Display for NoOpReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::StalePeerData => "peer data is stale",
            Self::PeerDecommissioned => "peer copy is decommissioned",
            Self::UpToDate => "local copy is up to date",
            Self::LocalHostsBricks => "local copy hosts bricks",
        })
    }
}

/// Outcome of comparing one peer snapshot
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resolution {
    NoOp(NoOpReason),
    /// Import the peer copy, nothing local to remove
    AcceptPeer,
    /// Replace local metadata with the peer copy, keep the backend store
    AcceptPeerRemoveLocalMetadata,
    /// Replace the local snapshot entirely, backend store included
    AcceptPeerRemoveLocalAll,
    /// Unresolvable identity conflict
    Reject,
}

/// What the executor must do for one snapshot
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconciliationDecision {
    pub snapshot_name: String,
    pub peer: NodeId,
    pub peer_snapshot: Snapshot,
    /// Local copy to remove, when `remove_local_data` is set
    pub local_snapshot: Option<Snapshot>,
    pub accept_peer_data: bool,
    pub remove_local_data: bool,
    pub remove_backend_store: bool,
    pub resolution: Resolution,
}

impl ReconciliationDecision {
    fn new(peer: NodeId, peer_snapshot: &Snapshot, resolution: Resolution) -> Self {
        Self {
            snapshot_name: peer_snapshot.name.clone(),
            peer,
            peer_snapshot: peer_snapshot.clone(),
            local_snapshot: None,
            accept_peer_data: false,
            remove_local_data: false,
            remove_backend_store: false,
            resolution,
        }
    }

    /// Import a snapshot missing locally
    #[must_use]
    pub fn accept(peer: NodeId, peer_snapshot: &Snapshot) -> Self {
        Self {
            accept_peer_data: true,
            ..Self::new(peer, peer_snapshot, Resolution::AcceptPeer)
        }
    }

    /// Replace local metadata with a newer version of the same snapshot
    #[must_use]
    pub fn supersede(peer: NodeId, peer_snapshot: &Snapshot, local: Snapshot) -> Self {
        Self {
            local_snapshot: Some(local),
            accept_peer_data: true,
            remove_local_data: true,
            ..Self::new(
                peer,
                peer_snapshot,
                Resolution::AcceptPeerRemoveLocalMetadata,
            )
        }
    }

    /// Replace a different local snapshot holding the same name
    #[must_use]
    pub fn replace(peer: NodeId, peer_snapshot: &Snapshot, local: Snapshot) -> Self {
        Self {
            local_snapshot: Some(local),
            accept_peer_data: true,
            remove_local_data: true,
            remove_backend_store: true,
            ..Self::new(peer, peer_snapshot, Resolution::AcceptPeerRemoveLocalAll)
        }
    }
}

/// Result of resolving one peer export
#[derive(Debug, Default)]
pub struct ResolveOutcome {
    /// Decisions to apply, in order
    pub decisions: Vec<ReconciliationDecision>,
    /// Peer snapshots left alone
    pub noops: Vec<(String, NoOpReason)>,
    /// Set when a conflict halted the pass
    pub conflict: Option<SnapshotError>,
}

pub struct ConflictResolver {
    local: NodeId,
    inventory: Arc<SnapshotInventory>,
    log: Arc<MissedOpLog>,
}

impl ConflictResolver {
    pub fn new(local: NodeId, inventory: Arc<SnapshotInventory>, log: Arc<MissedOpLog>) -> Self {
        Self {
            local,
            inventory,
            log,
        }
    }

    /// Compare every snapshot of a peer export, oldest first.
    ///
    /// Stops at the first conflict; decisions made before it are kept.
    #[instrument(skip_all, fields(peer = %export.node_id, snapshots = export.snapshots.len()))]
    pub fn resolve(&self, export: &PeerExport) -> ResolveOutcome {
        let mut ordered: Vec<&PeerSnapshot> = export.snapshots.iter().collect();
        ordered.sort_by(|a, b| {
            a.snapshot
                .created_at
                .cmp(&b.snapshot.created_at)
                .then_with(|| a.snapshot.name.cmp(&b.snapshot.name))
        });

        let mut outcome = ResolveOutcome::default();
        for peer_snap in ordered {
            let decision = match self.resolve_one(export.node_id, peer_snap) {
                Ok(decision) => decision,
                Err(e) => {
                    warn!("Halting reconciliation with {}: {}", export.node_id, e);
                    outcome.conflict = Some(e);
                    break;
                }
            };
            match decision.resolution {
                Resolution::NoOp(reason) => {
                    debug!("Snapshot {}: {}", decision.snapshot_name, reason);
                    outcome.noops.push((decision.snapshot_name, reason));
                }
                resolution => {
                    info!("Snapshot {}: {:?}", decision.snapshot_name, resolution);
                    outcome.decisions.push(decision);
                }
            }
        }
        outcome
    }

    /// Decide what to do with one peer snapshot.
    ///
    /// An identity conflict that the hosting rule cannot settle is returned
    /// as `SnapshotError::Conflict`.
    pub fn resolve_one(
        &self,
        peer: NodeId,
        peer_snap: &PeerSnapshot,
    ) -> Result<ReconciliationDecision, SnapshotError> {
        let theirs = &peer_snap.snapshot;
        let noop = |reason| ReconciliationDecision::new(peer, theirs, Resolution::NoOp(reason));

        if self.log.has_pending_delete_or_restore(peer, theirs.id) {
            return Ok(noop(NoOpReason::StalePeerData));
        }

        let Some(ours) = self.inventory.find_by_name(&theirs.name) else {
            if theirs.status == SnapshotStatus::Decommissioned {
                return Ok(noop(NoOpReason::PeerDecommissioned));
            }
            return Ok(ReconciliationDecision::accept(peer, theirs));
        };

        if ours.id == theirs.id {
            if peer_is_newer(&ours, theirs) {
                return Ok(ReconciliationDecision::supersede(peer, theirs, ours));
            }
            return Ok(noop(NoOpReason::UpToDate));
        }

        let local_hosts = ours.hosts_bricks_of(self.local);
        match (local_hosts, peer_snap.host_bricks) {
            (false, true) => Ok(ReconciliationDecision::replace(peer, theirs, ours)),
            (true, false) => Ok(noop(NoOpReason::LocalHostsBricks)),
            _ => Err(SnapshotError::Conflict {
                snapshot: theirs.name.clone(),
                peer,
            }),
        }
    }
}

/// Any peer volume ahead of the matching local volume
pub(crate) fn peer_is_newer(ours: &Snapshot, theirs: &Snapshot) -> bool {
    theirs.volumes.iter().any(|peer_vol| {
        ours.volume_for_parent(&peer_vol.parent_volume_name)
            .is_none_or(|local_vol| peer_vol.version > local_vol.version)
    })
}
