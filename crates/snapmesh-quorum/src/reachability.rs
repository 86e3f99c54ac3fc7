//! Point-in-time view of peer and brick reachability

use serde::{Deserialize, Serialize};
use snapmesh_common::{Brick, NodeId};

/// Quorum contribution state of a peer
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerQuorumState {
    /// Connected and counted as active
    Up,
    /// Known member, currently disconnected
    Down,
    /// Handshake in progress; not counted at all
    Waiting,
    /// Not a full cluster member
    None,
}

impl PeerQuorumState {
    /// Whether this peer counts toward the cluster size
    #[must_use]
    pub const fn contributes(&self) -> bool {
        matches!(self, Self::Up | Self::Down)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerReachability {
    pub node: NodeId,
    pub state: PeerQuorumState,
}

/// A brick identified by owner and path
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BrickLocation {
    pub node: NodeId,
    pub path: String,
}

/// Node counts used for the cluster quorum decision
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClusterCounts {
    /// Self plus peers that are up
    pub active: usize,
    /// Self plus peers that contribute to quorum
    pub contributors: usize,
    /// Active nodes needed
    pub required: usize,
}

impl ClusterCounts {
    #[must_use]
    pub const fn is_met(&self) -> bool {
        self.active >= self.required
    }
}

/// Reachability of peers and bricks, computed before the gate runs
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReachabilitySnapshot {
    pub local: NodeId,
    #[serde(default)]
    pub peers: Vec<PeerReachability>,
    #[serde(default)]
    pub online_bricks: Vec<BrickLocation>,
}

impl ReachabilitySnapshot {
    /// View with no peers and no online bricks
    #[must_use]
    pub const fn new(local: NodeId) -> Self {
        Self {
            local,
            peers: Vec::new(),
            online_bricks: Vec::new(),
        }
    }

    /// Add or replace a peer
    #[must_use]
    pub fn with_peer(mut self, node: NodeId, state: PeerQuorumState) -> Self {
        self.set_peer(node, state);
        self
    }

    pub fn set_peer(&mut self, node: NodeId, state: PeerQuorumState) {
        match self.peers.iter_mut().find(|p| p.node == node) {
            Some(peer) => peer.state = state,
            None => self.peers.push(PeerReachability { node, state }),
        }
    }

    /// Mark a brick online or offline
    pub fn set_brick_online(&mut self, node: NodeId, path: impl Into<String>, online: bool) {
        let location = BrickLocation {
            node,
            path: path.into(),
        };
        let present = self.online_bricks.contains(&location);
        if online && !present {
            self.online_bricks.push(location);
        } else if !online && present {
            self.online_bricks.retain(|b| b != &location);
        }
    }

    #[must_use]
    pub fn is_brick_online(&self, brick: &Brick) -> bool {
        self.online_bricks
            .iter()
            .any(|b| b.node == brick.owning_node && b.path == brick.path)
    }

    /// Whether `node` is reachable from here; the local node always is
    #[must_use]
    pub fn is_node_up(&self, node: NodeId) -> bool {
        node == self.local
            || self
                .peers
                .iter()
                .any(|p| p.node == node && p.state == PeerQuorumState::Up)
    }

    /// Count active and contributing nodes.
    ///
    /// With a ratio the requirement is `ceil(contributors * ratio / 100)`,
    /// otherwise a strict majority of contributors.
    #[must_use]
    pub fn cluster_counts(&self, ratio_percent: Option<u32>) -> ClusterCounts {
        let mut active = 1;
        let mut contributors = 1;
        for peer in &self.peers {
            if peer.state.contributes() {
                contributors += 1;
            }
            if peer.state == PeerQuorumState::Up {
                active += 1;
            }
        }

        let required = match ratio_percent {
            Some(ratio) => (contributors * ratio as usize).div_ceil(100),
            None => contributors * 50 / 100 + 1,
        };

        ClusterCounts {
            active,
            contributors,
            required,
        }
    }
}
