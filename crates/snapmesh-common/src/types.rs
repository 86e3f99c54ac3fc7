//! Core type definitions for SnapMesh
//!
//! This module defines the snapshot data model shared by every component:
//! identifiers, snapshots and their per-volume sub-objects, bricks, volume
//! layouts and missed-operation records.

use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::Error;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, From, Into,
        )]
        pub struct $name(Uuid);

        impl $name {
            /// Generate a new random ID
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Create from existing UUID
            #[must_use]
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Get the underlying UUID
            #[must_use]
            pub const fn as_uuid(&self) -> Uuid {
                self.0
            }

            /// Get as bytes
            #[must_use]
            pub fn as_bytes(&self) -> &[u8; 16] {
                self.0.as_bytes()
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s)
                    .map(Self)
                    .map_err(|e| Error::invalid_argument(format!("{}: {e}", stringify!($name))))
            }
        }
    };
}

uuid_id!(
    /// Unique identifier for a cluster node
    NodeId
);

uuid_id!(
    /// Immutable identity of a snapshot; two snapshots with the same name
    /// but different ids are distinct objects
    SnapshotId
);

uuid_id!(
    /// Unique identifier for a volume (origin or snapshot volume)
    VolumeId
);

/// Lifecycle status of a snapshot
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SnapshotStatus {
    #[default]
    None,
    Init,
    InUse,
    Decommissioned,
    UnderRestore,
    Restored,
}

impl SnapshotStatus {
    /// Stable display name
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Init => "init",
            Self::InUse => "in_use",
            Self::Decommissioned => "decommissioned",
            Self::UnderRestore => "under_restore",
            Self::Restored => "restored",
        }
    }

    /// Integer code used in the handshake payload
    #[must_use]
    pub const fn code(&self) -> u8 {
        match self {
            Self::None => 0,
            Self::Init => 1,
            Self::InUse => 2,
            Self::Decommissioned => 3,
            Self::UnderRestore => 4,
            Self::Restored => 5,
        }
    }

    /// Parse a handshake status code
    pub fn from_code(code: u8) -> Result<Self, Error> {
        match code {
            0 => Ok(Self::None),
            1 => Ok(Self::Init),
            2 => Ok(Self::InUse),
            3 => Ok(Self::Decommissioned),
            4 => Ok(Self::UnderRestore),
            5 => Ok(Self::Restored),
            other => Err(Error::invalid_argument(format!(
                "unknown snapshot status code: {other}"
            ))),
        }
    }
}

impl fmt::Display for SnapshotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Storage backend that holds the per-brick snapshot data
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackendKind {
    /// LVM thin-provisioned logical volumes
    #[default]
    Lvm,
    /// ZFS datasets
    Zfs,
}

impl BackendKind {
    /// Get the backend name
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Lvm => "lvm",
            Self::Zfs => "zfs",
        }
    }

    /// Select the backend for a brick from its filesystem type
    #[must_use]
    pub fn from_fs_type(fs_type: &str) -> Self {
        if fs_type.eq_ignore_ascii_case("zfs") {
            Self::Zfs
        } else {
            Self::Lvm
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "lvm" | "lvm2" => Ok(Self::Lvm),
            "zfs" => Ok(Self::Zfs),
            _ => Err(Error::invalid_argument(format!("unknown backend: {s}"))),
        }
    }
}

/// How a volume spreads data over its bricks
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum VolumeLayout {
    /// Plain distribute, every brick holds unique data
    #[default]
    Distribute,
    /// Bricks grouped into replica sets of `replica_count`
    Replicate { replica_count: usize },
    /// Bricks grouped into erasure sets of `disperse_count`, any
    /// `redundancy` of which may be lost
    Disperse {
        disperse_count: usize,
        redundancy: usize,
    },
}

impl VolumeLayout {
    /// Number of bricks in one replica/disperse group
    #[must_use]
    pub const fn group_width(&self) -> usize {
        match self {
            Self::Distribute => 1,
            Self::Replicate { replica_count } => *replica_count,
            Self::Disperse { disperse_count, .. } => *disperse_count,
        }
    }
}

/// Brick quorum setting of a volume
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuorumPolicy {
    /// Quorum derived from the group width
    #[default]
    Auto,
    /// Operator-configured quorum count per group
    Fixed(usize),
}

/// One storage unit of a volume, owned by exactly one node
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Brick {
    /// Node that hosts this brick
    pub owning_node: NodeId,
    /// Brick directory on the owning node
    pub path: String,
    /// Block device (or dataset) backing the brick
    pub device_path: String,
    /// Filesystem type of the brick
    pub fs_type: String,
    /// Mount options
    pub mount_options: String,
    /// Mount directory of the snapshot brick
    pub mount_dir: String,
    /// The backend snapshot of this brick failed or is deferred
    pub snapshot_pending: bool,
}

impl Brick {
    /// Create a brick with empty device details
    #[must_use]
    pub fn new(owning_node: NodeId, path: impl Into<String>) -> Self {
        Self {
            owning_node,
            path: path.into(),
            device_path: String::new(),
            fs_type: String::new(),
            mount_options: String::new(),
            mount_dir: String::new(),
            snapshot_pending: false,
        }
    }
}

/// An origin volume as seen by the snapshot subsystem
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    pub id: VolumeId,
    pub name: String,
    pub layout: VolumeLayout,
    pub quorum: QuorumPolicy,
    pub bricks: Vec<Brick>,
    /// Per-volume hard limit on snapshots, if configured
    pub snap_max_hard_limit: Option<u64>,
    pub started: bool,
}

/// Per-volume sub-object of a snapshot
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotVolume {
    pub volume_id: VolumeId,
    pub name: String,
    pub parent_volume_name: String,
    /// Bumped on every accepted mutation of this lineage, never decremented
    pub version: u64,
    pub bricks: Vec<Brick>,
    pub is_snap_volume: bool,
    /// The snapshot volume is activated
    pub started: bool,
    pub backend: BackendKind,
    /// Layout of the parent volume at snapshot time
    pub layout: VolumeLayout,
    pub snap_max_hard_limit: u64,
}

impl SnapshotVolume {
    /// Whether any brick of this volume lives on `node`
    #[must_use]
    pub fn hosts_bricks_of(&self, node: NodeId) -> bool {
        self.bricks.iter().any(|b| b.owning_node == node)
    }

    /// Bricks owned by `node`, with their position in the volume
    pub fn local_bricks(&self, node: NodeId) -> impl Iterator<Item = (usize, &Brick)> {
        self.bricks
            .iter()
            .enumerate()
            .filter(move |(_, b)| b.owning_node == node)
    }
}

/// A named, point-in-time snapshot
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: SnapshotId,
    pub name: String,
    pub description: Option<String>,
    /// Unix seconds
    pub created_at: u64,
    pub status: SnapshotStatus,
    pub restored: bool,
    pub volumes: Vec<SnapshotVolume>,
}

impl Snapshot {
    /// Whether `node` hosts data for any volume of this snapshot
    #[must_use]
    pub fn hosts_bricks_of(&self, node: NodeId) -> bool {
        self.volumes.iter().any(|v| v.hosts_bricks_of(node))
    }

    /// Find the snapshot volume taken from `parent`
    #[must_use]
    pub fn volume_for_parent(&self, parent: &str) -> Option<&SnapshotVolume> {
        self.volumes.iter().find(|v| v.parent_volume_name == parent)
    }

    /// Highest lineage version across volumes
    #[must_use]
    pub fn max_version(&self) -> u64 {
        self.volumes.iter().map(|v| v.version).max().unwrap_or(0)
    }
}

/// Operation a node may have missed while unreachable.
///
/// Creates are never logged; a node that missed a create picks the snapshot
/// up through the handshake instead.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum MissedOp {
    #[display("delete")]
    Delete,
    #[display("restore")]
    Restore,
}

impl MissedOp {
    /// Integer code used in the handshake payload
    #[must_use]
    pub const fn code(&self) -> u8 {
        match self {
            Self::Delete => 2,
            Self::Restore => 3,
        }
    }

    /// Parse a handshake op code
    pub fn from_code(code: u8) -> Result<Self, Error> {
        match code {
            2 => Ok(Self::Delete),
            3 => Ok(Self::Restore),
            other => Err(Error::invalid_argument(format!(
                "unsupported missed op code: {other}"
            ))),
        }
    }
}

/// Replay status of a missed-operation entry
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum MissedOpStatus {
    #[display("pending")]
    Pending,
    #[display("done")]
    Done,
}

impl MissedOpStatus {
    /// Integer code used in the handshake payload
    #[must_use]
    pub const fn code(&self) -> u8 {
        match self {
            Self::Pending => 1,
            Self::Done => 2,
        }
    }

    /// Parse a handshake status code
    pub fn from_code(code: u8) -> Result<Self, Error> {
        match code {
            1 => Ok(Self::Pending),
            2 => Ok(Self::Done),
            other => Err(Error::invalid_argument(format!(
                "unknown missed op status code: {other}"
            ))),
        }
    }
}

/// Reference to one brick of a snapshot volume
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BrickRef {
    pub snap_volume_id: VolumeId,
    /// 1-based brick position within the snapshot volume
    pub brick_num: u32,
    pub brick_path: String,
}

/// One (operation, brick, status) entry under a missed-operation key
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissedOpEntry {
    pub op: MissedOp,
    pub brick: BrickRef,
    pub status: MissedOpStatus,
}

/// All missed operations of one node for one snapshot
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissedOpRecord {
    pub node_id: NodeId,
    pub snapshot_id: SnapshotId,
    pub entries: Vec<MissedOpEntry>,
}

impl MissedOpRecord {
    /// Persistence key, `node:snapshot`
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}:{}", self.node_id, self.snapshot_id)
    }
}
