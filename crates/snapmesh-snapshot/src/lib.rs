//! SnapMesh snapshot control plane
//!
//! Keeps every node's snapshot metadata convergent. On each peer handshake
//! the nodes swap a `PeerExport`; the [`ConflictResolver`] compares it with
//! the local [`SnapshotInventory`] and the [`ReconciliationExecutor`]
//! applies the result, then replays operations this node missed while it
//! was unreachable.
//!
//! Locally initiated create, delete, restore and clone go through the
//! [`SnapshotManager`], which consults the quorum gate first.

pub mod backend;
pub mod error;
pub mod exchange;
pub mod exclusive;
pub mod executor;
pub mod inventory;
pub mod lifecycle;
pub mod missed;
pub mod node;
pub mod operations;
pub mod resolver;
pub mod service;

#[cfg(test)]
mod test_support;

pub use backend::{BackendRegistry, LvmBackend, SnapshotBackend, ZfsBackend};
pub use error::{SnapshotError, SnapshotResult};
pub use exchange::{EXPORT_FORMAT_VERSION, PeerExport, PeerSnapshot};
pub use exclusive::{Activity, ExclusiveGuard, ExclusiveSection};
pub use executor::{ApplyReport, ReconciliationExecutor, RestartReport};
pub use inventory::SnapshotInventory;
pub use lifecycle::{Applied, SnapshotLifecycle};
pub use missed::{MergeStats, MissedOpLog, PendingOp, RecordHandle};
pub use node::{ReconcileReport, SnapshotNode};
pub use operations::{CreateRequest, SnapshotManager};
pub use resolver::{
    ConflictResolver, NoOpReason, ReconciliationDecision, Resolution, ResolveOutcome,
};
pub use service::{NoopController, ServiceController, ServiceRef, SystemdController};
