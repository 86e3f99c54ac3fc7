//! Quorum gate for snapshot create/clone/delete/restore

use crate::reachability::ReachabilitySnapshot;
use snapmesh_common::{ErrorClass, QuorumPolicy, Volume, VolumeLayout};
use std::fmt;
use tracing::{debug, info, warn};

/// Mutating snapshot operation awaiting admission
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SnapshotOp {
    Create { force: bool },
    Clone,
    Delete,
    Restore,
}

impl fmt::Display for SnapshotOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create { force: true } => f.write_str("create (force)"),
            Self::Create { force: false } => f.write_str("create"),
            Self::Clone => f.write_str("clone"),
            Self::Delete => f.write_str("delete"),
            Self::Restore => f.write_str("restore"),
        }
    }
}

/// Outcome of a quorum check
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QuorumVerdict {
    Admitted,
    Rejected { reason: String, class: ErrorClass },
}

impl QuorumVerdict {
    #[must_use]
    pub const fn is_admitted(&self) -> bool {
        matches!(self, Self::Admitted)
    }

    fn rejected(reason: impl Into<String>, class: ErrorClass) -> Self {
        Self::Rejected {
            reason: reason.into(),
            class,
        }
    }
}

/// Brick quorum count for one group and whether it came from the default rule
struct GroupQuorum {
    count: usize,
    default_rule: bool,
}

/// Admission control for snapshot operations
#[derive(Clone, Debug, Default)]
pub struct QuorumGate {
    server_quorum_ratio: Option<u32>,
}

impl QuorumGate {
    /// Create a gate; `None` requires a strict majority of nodes
    #[must_use]
    pub const fn new(server_quorum_ratio: Option<u32>) -> Self {
        Self {
            server_quorum_ratio,
        }
    }

    /// Decide whether `op` may proceed on `volumes`.
    ///
    /// Only creates look at brick state; every operation needs cluster
    /// quorum first.
    pub fn check(
        &self,
        op: SnapshotOp,
        volumes: &[Volume],
        view: &ReachabilitySnapshot,
    ) -> QuorumVerdict {
        let verdict = self.check_cluster(view);
        if !verdict.is_admitted() {
            warn!("Quorum check failed for snapshot {}", op);
            return verdict;
        }

        if let SnapshotOp::Create { force } = op {
            for volume in volumes {
                let verdict = Self::check_volume(volume, view, force);
                if !verdict.is_admitted() {
                    warn!("Volume {} is not in quorum for snapshot {}", volume.name, op);
                    return verdict;
                }
            }
        }

        debug!("Snapshot {} admitted", op);
        QuorumVerdict::Admitted
    }

    /// Cluster-wide node quorum
    pub fn check_cluster(&self, view: &ReachabilitySnapshot) -> QuorumVerdict {
        let counts = view.cluster_counts(self.server_quorum_ratio);
        if counts.is_met() {
            debug!(
                "Cluster in quorum: {} active of {} required",
                counts.active, counts.required
            );
            QuorumVerdict::Admitted
        } else {
            QuorumVerdict::rejected(
                format!(
                    "cluster nodes are not in quorum: {} active, {} required",
                    counts.active, counts.required
                ),
                ErrorClass::NodeDown,
            )
        }
    }

    /// Brick quorum of one volume
    pub fn check_volume(volume: &Volume, view: &ReachabilitySnapshot, force: bool) -> QuorumVerdict {
        let needs_all = match volume.layout {
            VolumeLayout::Distribute => true,
            VolumeLayout::Replicate { replica_count } => replica_count < 3,
            VolumeLayout::Disperse { .. } => false,
        };

        if needs_all {
            if let Some(down) = volume.bricks.iter().find(|b| !view.is_brick_online(b)) {
                debug!("Brick {} of volume {} is down", down.path, volume.name);
                return QuorumVerdict::rejected("quorum is not met", ErrorClass::BrickDown);
            }
            return QuorumVerdict::Admitted;
        }

        let width = volume.layout.group_width();
        if width == 0 {
            return QuorumVerdict::rejected(
                format!("volume {} has an empty brick group", volume.name),
                ErrorClass::Internal,
            );
        }
        let quorum = Self::group_quorum(volume);
        let replicated = matches!(volume.layout, VolumeLayout::Replicate { .. });

        for group in volume.bricks.chunks(width) {
            let online: Vec<bool> = group.iter().map(|b| view.is_brick_online(b)).collect();
            let up = online.iter().filter(|on| **on).count();
            let first_on = online.first().copied().unwrap_or(false);

            if replicated && up < group.len() && !force {
                return QuorumVerdict::rejected(
                    "One or more bricks may be down.",
                    ErrorClass::BrickDown,
                );
            }

            let mut met = up >= quorum.count;
            if replicated && quorum.default_rule {
                met &= first_on;
            }
            if !met {
                return QuorumVerdict::rejected("quorum is not met", ErrorClass::BrickDown);
            }
        }

        debug!("Volume {} is in quorum", volume.name);
        QuorumVerdict::Admitted
    }

    fn group_quorum(volume: &Volume) -> GroupQuorum {
        match volume.layout {
            VolumeLayout::Replicate { replica_count } => match volume.quorum {
                QuorumPolicy::Fixed(count) => GroupQuorum {
                    count,
                    default_rule: false,
                },
                QuorumPolicy::Auto => GroupQuorum {
                    count: replica_count / 2 + 1,
                    default_rule: true,
                },
            },
            VolumeLayout::Disperse {
                disperse_count,
                redundancy,
            } => {
                let minimum = disperse_count.saturating_sub(redundancy);
                match volume.quorum {
                    QuorumPolicy::Fixed(count) if count >= minimum => GroupQuorum {
                        count,
                        default_rule: false,
                    },
                    QuorumPolicy::Fixed(count) => {
                        info!(
                            "Ignoring small quorum count ({}) on dispersed volume {}",
                            count, volume.name
                        );
                        GroupQuorum {
                            count: minimum,
                            default_rule: true,
                        }
                    }
                    QuorumPolicy::Auto => GroupQuorum {
                        count: minimum,
                        default_rule: true,
                    },
                }
            }
            VolumeLayout::Distribute => GroupQuorum {
                count: volume.bricks.len(),
                default_rule: true,
            },
        }
    }
}
