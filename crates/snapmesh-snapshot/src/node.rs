//! Per-node snapshot control plane
//!
//! `SnapshotNode` owns the inventory, the missed-op log and the components
//! built on them, and exposes the handshake entry points.

use crate::backend::BackendRegistry;
use crate::error::{SnapshotError, SnapshotResult};
use crate::exchange::PeerExport;
use crate::exclusive::ExclusiveSection;
use crate::executor::{ApplyReport, ReconciliationExecutor, RestartReport};
use crate::inventory::SnapshotInventory;
use crate::lifecycle::SnapshotLifecycle;
use crate::missed::{MergeStats, MissedOpLog};
use crate::operations::SnapshotManager;
use crate::resolver::{ConflictResolver, NoOpReason};
use crate::service::ServiceController;
use snapmesh_common::{Config, NodeId};
use snapmesh_meta_store::SnapshotStore;
use snapmesh_quorum::QuorumGate;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Outcome of reconciling with one peer
#[derive(Debug, Default)]
pub struct ReconcileReport {
    pub merged: MergeStats,
    pub noops: Vec<(String, NoOpReason)>,
    pub applied: ApplyReport,
    /// Conflict that halted the exchange
    pub conflict: Option<SnapshotError>,
}

impl ReconcileReport {
    /// The conflict if there was one, else the first failed decision
    #[must_use]
    pub fn first_error(&self) -> Option<&SnapshotError> {
        self.conflict.as_ref().or_else(|| self.applied.first_error())
    }
}

pub struct SnapshotNode {
    local: NodeId,
    inventory: Arc<SnapshotInventory>,
    log: Arc<MissedOpLog>,
    resolver: ConflictResolver,
    executor: ReconciliationExecutor,
    manager: SnapshotManager,
}

impl SnapshotNode {
    /// Load the node's state from `store` and wire up its components
    pub fn open(
        local: NodeId,
        config: &Config,
        store: Arc<dyn SnapshotStore>,
        backends: BackendRegistry,
        services: Arc<dyn ServiceController>,
    ) -> SnapshotResult<Self> {
        let inventory = Arc::new(SnapshotInventory::new(store.clone()));
        inventory.load()?;
        let log = Arc::new(MissedOpLog::new(local, store));
        log.load()?;

        let lifecycle = Arc::new(SnapshotLifecycle::new(
            local,
            inventory.clone(),
            backends,
            services,
        ));
        let exclusive = Arc::new(ExclusiveSection::new());

        info!("Snapshot node {} ready, {} snapshots", local, inventory.len());
        Ok(Self {
            local,
            resolver: ConflictResolver::new(local, inventory.clone(), log.clone()),
            executor: ReconciliationExecutor::new(
                inventory.clone(),
                log.clone(),
                lifecycle.clone(),
                exclusive.clone(),
            ),
            manager: SnapshotManager::new(
                QuorumGate::new(config.quorum.server_quorum_ratio),
                config.snapshot.clone(),
                inventory.clone(),
                log.clone(),
                lifecycle,
                exclusive,
            ),
            inventory,
            log,
        })
    }

    pub const fn local_node(&self) -> NodeId {
        self.local
    }

    pub fn inventory(&self) -> &SnapshotInventory {
        &self.inventory
    }

    pub fn missed_log(&self) -> &MissedOpLog {
        &self.log
    }

    pub const fn manager(&self) -> &SnapshotManager {
        &self.manager
    }

    /// Handshake payload describing this node
    pub fn export(&self) -> PeerExport {
        PeerExport::build(self.local, &self.inventory, &self.log)
    }

    /// Reconcile with a peer's export.
    ///
    /// Merges the peer's missed-op list, resolves every peer snapshot and
    /// applies the decisions. A conflict halts resolution but decisions made
    /// before it are still applied.
    #[instrument(skip_all, fields(peer = %export.node_id))]
    pub fn reconcile(&self, export: &PeerExport) -> SnapshotResult<ReconcileReport> {
        if export.node_id == self.local {
            return Err(SnapshotError::InvalidRequest(
                "refusing to reconcile with our own export".to_string(),
            ));
        }

        let merged = self.log.merge_peer_entries(&export.missed)?;
        let outcome = self.resolver.resolve(export);
        if let Some(conflict) = &outcome.conflict {
            warn!("Reconciliation with {} rejected: {}", export.node_id, conflict);
        }
        let applied = self.executor.apply(&outcome.decisions);

        Ok(ReconcileReport {
            merged,
            noops: outcome.noops,
            applied,
            conflict: outcome.conflict,
        })
    }

    /// Replay this node's pending missed operations
    pub fn replay(&self) -> ApplyReport {
        self.executor.replay_missed()
    }

    /// Bring every local snapshot brick in line with its volume state
    pub fn restart_bricks(&self) -> RestartReport {
        self.executor.restart_all_bricks()
    }
}
