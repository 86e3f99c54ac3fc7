//! SnapMesh Quorum - admission control for mutating snapshot operations
//!
//! The gate evaluates a bounded, already-computed view of which peers and
//! bricks are reachable. It never talks to the network itself, so a verdict
//! is a pure function of the view, the volumes and the operation.
//!
//! # Rules
//!
//! - **Cluster quorum**: the local node plus its connected, contributing
//!   peers must reach the configured ratio (strict majority by default).
//! - **Brick quorum** (create only): distribute and 2-way replicate volumes
//!   need every brick; wider replica and disperse groups need their quorum
//!   count, and replica groups of 3 or more reject any down brick unless
//!   the create is forced.

pub mod gate;
pub mod reachability;

pub use gate::{QuorumGate, QuorumVerdict, SnapshotOp};
pub use reachability::{
    BrickLocation, ClusterCounts, PeerQuorumState, PeerReachability, ReachabilitySnapshot,
};
