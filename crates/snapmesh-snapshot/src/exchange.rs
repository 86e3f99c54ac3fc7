//! Handshake payload exchanged between peers
//!
//! `PeerExport` is the typed form. `to_flat_map` and `from_flat_map` convert
//! it to the flat key-value layout sent over the wire:
//!
//! ```text
//! format_version, node_id, snap_count
//! snap<N>.snapname, snap<N>.snap_id, snap<N>.host_bricks, ...
//! snap<N>.vol<V>.volname, snap<N>.vol<V>.version, ...
//! snap<N>.vol<V>.brick<M>.path, ...
//! missed_snap_count, missed_snaps_<i>
//! ```
//!
//! Indexes start at 1. Missed entries are encoded as
//! `node:snapshot=snap_volume:brick_num:brick_path:op_code:status_code`.

use crate::error::{SnapshotError, SnapshotResult};
use crate::inventory::SnapshotInventory;
use crate::missed::MissedOpLog;
use serde::{Deserialize, Serialize};
use snapmesh_common::{
    BackendKind, Brick, BrickRef, MissedOp, MissedOpEntry, MissedOpRecord, MissedOpStatus, NodeId,
    Snapshot, SnapshotId, SnapshotStatus, SnapshotVolume, VolumeLayout,
};
use std::collections::BTreeMap;
use std::fmt::Display;
use std::str::FromStr;

/// Current payload layout
pub const EXPORT_FORMAT_VERSION: u32 = 1;

/// One snapshot as seen by the exporting node
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSnapshot {
    pub snapshot: Snapshot,
    /// Whether the exporting node hosts bricks of this snapshot
    pub host_bricks: bool,
}

/// Everything a node sends a peer during handshake
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerExport {
    pub format_version: u32,
    pub node_id: NodeId,
    pub snapshots: Vec<PeerSnapshot>,
    pub missed: Vec<MissedOpRecord>,
}

impl PeerExport {
    /// Snapshot the local inventory and missed-op log
    pub fn build(node_id: NodeId, inventory: &SnapshotInventory, log: &MissedOpLog) -> Self {
        let snapshots = inventory
            .list()
            .into_iter()
            .map(|snapshot| PeerSnapshot {
                host_bricks: snapshot.hosts_bricks_of(node_id),
                snapshot,
            })
            .collect();
        Self {
            format_version: EXPORT_FORMAT_VERSION,
            node_id,
            snapshots,
            missed: log.export_entries(),
        }
    }

    /// Encode into the flat wire layout
    #[must_use]
    pub fn to_flat_map(&self) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        map.insert("format_version".to_string(), self.format_version.to_string());
        map.insert("node_id".to_string(), self.node_id.to_string());
        map.insert("snap_count".to_string(), self.snapshots.len().to_string());

        for (i, peer) in self.snapshots.iter().enumerate() {
            encode_snapshot(&mut map, &format!("snap{}", i + 1), peer);
        }

        let mut count = 0;
        for record in &self.missed {
            for entry in &record.entries {
                count += 1;
                map.insert(
                    format!("missed_snaps_{count}"),
                    encode_missed(record, entry),
                );
            }
        }
        map.insert("missed_snap_count".to_string(), count.to_string());
        map
    }

    /// Decode the flat wire layout
    pub fn from_flat_map(map: &BTreeMap<String, String>) -> SnapshotResult<Self> {
        let format_version: u32 = parse(map, "format_version")?;
        if format_version != EXPORT_FORMAT_VERSION {
            return Err(SnapshotError::invalid_payload(format!(
                "format_version: unsupported version {format_version}"
            )));
        }
        let node_id: NodeId = parse(map, "node_id")?;

        let snap_count: usize = parse(map, "snap_count")?;
        let mut snapshots = Vec::new();
        for i in 1..=snap_count {
            snapshots.push(decode_snapshot(map, &format!("snap{i}"))?);
        }

        let missed_count: usize = parse(map, "missed_snap_count")?;
        let mut missed: Vec<MissedOpRecord> = Vec::new();
        for i in 1..=missed_count {
            let key = format!("missed_snaps_{i}");
            let (node_id, snapshot_id, entry) = decode_missed(&key, get(map, &key)?)?;
            match missed
                .iter_mut()
                .find(|r| r.node_id == node_id && r.snapshot_id == snapshot_id)
            {
                Some(record) => record.entries.push(entry),
                None => missed.push(MissedOpRecord {
                    node_id,
                    snapshot_id,
                    entries: vec![entry],
                }),
            }
        }

        Ok(Self {
            format_version,
            node_id,
            snapshots,
            missed,
        })
    }
}

fn encode_snapshot(map: &mut BTreeMap<String, String>, prefix: &str, peer: &PeerSnapshot) {
    let snap = &peer.snapshot;
    let mut put = |field: &str, value: String| {
        map.insert(format!("{prefix}.{field}"), value);
    };
    put("snapname", snap.name.clone());
    put("snap_id", snap.id.to_string());
    if let Some(description) = &snap.description {
        put("description", description.clone());
    }
    put("time_stamp", snap.created_at.to_string());
    put("snap_restored", u8::from(snap.restored).to_string());
    put("snap_status", snap.status.code().to_string());
    put("host_bricks", u8::from(peer.host_bricks).to_string());
    put("volcount", snap.volumes.len().to_string());

    for (v, volume) in snap.volumes.iter().enumerate() {
        encode_volume(map, &format!("{prefix}.vol{}", v + 1), volume);
    }
}

fn encode_volume(map: &mut BTreeMap<String, String>, prefix: &str, volume: &SnapshotVolume) {
    let mut put = |field: &str, value: String| {
        map.insert(format!("{prefix}.{field}"), value);
    };
    put("volname", volume.name.clone());
    put("volume_id", volume.volume_id.to_string());
    put("parent_volname", volume.parent_volume_name.clone());
    put("version", volume.version.to_string());
    put("is_snap_volume", u8::from(volume.is_snap_volume).to_string());
    put("started", u8::from(volume.started).to_string());
    put("backend", volume.backend.name().to_string());
    match volume.layout {
        VolumeLayout::Distribute => put("type", "distribute".to_string()),
        VolumeLayout::Replicate { replica_count } => {
            put("type", "replicate".to_string());
            put("replica_count", replica_count.to_string());
        }
        VolumeLayout::Disperse {
            disperse_count,
            redundancy,
        } => {
            put("type", "disperse".to_string());
            put("disperse_count", disperse_count.to_string());
            put("redundancy_count", redundancy.to_string());
        }
    }
    put("snap-max-hard-limit", volume.snap_max_hard_limit.to_string());
    put("brick_count", volume.bricks.len().to_string());

    for (b, brick) in volume.bricks.iter().enumerate() {
        let brick_prefix = format!("{prefix}.brick{}", b + 1);
        let mut put = |field: &str, value: String| {
            map.insert(format!("{brick_prefix}.{field}"), value);
        };
        put("node_id", brick.owning_node.to_string());
        put("path", brick.path.clone());
        put("device_path", brick.device_path.clone());
        put("fs_type", brick.fs_type.clone());
        put("mnt_opts", brick.mount_options.clone());
        put("mount_dir", brick.mount_dir.clone());
        put("snap_status", u8::from(brick.snapshot_pending).to_string());
    }
}

fn decode_snapshot(map: &BTreeMap<String, String>, prefix: &str) -> SnapshotResult<PeerSnapshot> {
    let key = |field: &str| format!("{prefix}.{field}");

    let status_code: u8 = parse(map, &key("snap_status"))?;
    let status = SnapshotStatus::from_code(status_code)
        .map_err(|e| SnapshotError::invalid_payload(format!("{}: {e}", key("snap_status"))))?;

    let volcount: usize = parse(map, &key("volcount"))?;
    let mut volumes = Vec::new();
    for v in 1..=volcount {
        volumes.push(decode_volume(map, &format!("{prefix}.vol{v}"))?);
    }

    Ok(PeerSnapshot {
        snapshot: Snapshot {
            id: parse(map, &key("snap_id"))?,
            name: get(map, &key("snapname"))?.to_string(),
            description: map.get(&key("description")).cloned(),
            created_at: parse(map, &key("time_stamp"))?,
            status,
            restored: parse_flag(map, &key("snap_restored"))?,
            volumes,
        },
        host_bricks: parse_flag(map, &key("host_bricks"))?,
    })
}

fn decode_volume(map: &BTreeMap<String, String>, prefix: &str) -> SnapshotResult<SnapshotVolume> {
    let key = |field: &str| format!("{prefix}.{field}");

    let layout = match get(map, &key("type"))? {
        "distribute" => VolumeLayout::Distribute,
        "replicate" => VolumeLayout::Replicate {
            replica_count: parse(map, &key("replica_count"))?,
        },
        "disperse" => VolumeLayout::Disperse {
            disperse_count: parse(map, &key("disperse_count"))?,
            redundancy: parse(map, &key("redundancy_count"))?,
        },
        other => {
            return Err(SnapshotError::invalid_payload(format!(
                "{}: unknown volume type {other}",
                key("type")
            )));
        }
    };

    let brick_count: usize = parse(map, &key("brick_count"))?;
    let mut bricks = Vec::new();
    for b in 1..=brick_count {
        let brick_key = |field: &str| format!("{prefix}.brick{b}.{field}");
        bricks.push(Brick {
            owning_node: parse(map, &brick_key("node_id"))?,
            path: get(map, &brick_key("path"))?.to_string(),
            device_path: get(map, &brick_key("device_path"))?.to_string(),
            fs_type: get(map, &brick_key("fs_type"))?.to_string(),
            mount_options: get(map, &brick_key("mnt_opts"))?.to_string(),
            mount_dir: get(map, &brick_key("mount_dir"))?.to_string(),
            snapshot_pending: parse_flag(map, &brick_key("snap_status"))?,
        });
    }

    Ok(SnapshotVolume {
        volume_id: parse(map, &key("volume_id"))?,
        name: get(map, &key("volname"))?.to_string(),
        parent_volume_name: get(map, &key("parent_volname"))?.to_string(),
        version: parse(map, &key("version"))?,
        bricks,
        is_snap_volume: parse_flag(map, &key("is_snap_volume"))?,
        started: parse_flag(map, &key("started"))?,
        backend: parse::<BackendKind>(map, &key("backend"))?,
        layout,
        snap_max_hard_limit: parse(map, &key("snap-max-hard-limit"))?,
    })
}

fn encode_missed(record: &MissedOpRecord, entry: &MissedOpEntry) -> String {
    format!(
        "{}:{}={}:{}:{}:{}:{}",
        record.node_id,
        record.snapshot_id,
        entry.brick.snap_volume_id,
        entry.brick.brick_num,
        entry.brick.brick_path,
        entry.op.code(),
        entry.status.code()
    )
}

fn decode_missed(
    key: &str,
    value: &str,
) -> SnapshotResult<(NodeId, SnapshotId, MissedOpEntry)> {
    let malformed = || SnapshotError::invalid_payload(format!("{key}: malformed entry {value}"));

    let (head, info) = value.split_once('=').ok_or_else(malformed)?;
    let (node, snap) = head.split_once(':').ok_or_else(malformed)?;

    // brick_path may contain ':', so peel the codes off the right first
    let mut tail = info.rsplitn(3, ':');
    let status = tail.next().ok_or_else(malformed)?;
    let op = tail.next().ok_or_else(malformed)?;
    let rest = tail.next().ok_or_else(malformed)?;
    let mut front = rest.splitn(3, ':');
    let snap_volume = front.next().ok_or_else(malformed)?;
    let brick_num = front.next().ok_or_else(malformed)?;
    let brick_path = front.next().ok_or_else(malformed)?;

    let op = op
        .parse::<u8>()
        .ok()
        .and_then(|code| MissedOp::from_code(code).ok())
        .ok_or_else(malformed)?;
    let status = status
        .parse::<u8>()
        .ok()
        .and_then(|code| MissedOpStatus::from_code(code).ok())
        .ok_or_else(malformed)?;

    Ok((
        node.parse().map_err(|_| malformed())?,
        snap.parse().map_err(|_| malformed())?,
        MissedOpEntry {
            op,
            brick: BrickRef {
                snap_volume_id: snap_volume.parse().map_err(|_| malformed())?,
                brick_num: brick_num.parse().map_err(|_| malformed())?,
                brick_path: brick_path.to_string(),
            },
            status,
        },
    ))
}

fn get<'a>(map: &'a BTreeMap<String, String>, key: &str) -> SnapshotResult<&'a str> {
    map.get(key)
        .map(String::as_str)
        .ok_or_else(|| SnapshotError::invalid_payload(format!("{key}: missing")))
}

fn parse<T>(map: &BTreeMap<String, String>, key: &str) -> SnapshotResult<T>
where
    T: FromStr,
    T::Err: Display,
{
    get(map, key)?
        .parse()
        .map_err(|e| SnapshotError::invalid_payload(format!("{key}: {e}")))
}

fn parse_flag(map: &BTreeMap<String, String>, key: &str) -> SnapshotResult<bool> {
    match get(map, key)? {
        "0" => Ok(false),
        "1" => Ok(true),
        other => Err(SnapshotError::invalid_payload(format!(
            "{key}: expected 0 or 1, got {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::snapshot_on;
    use snapmesh_common::VolumeId;
    use snapmesh_meta_store::MemoryStore;
    use std::sync::Arc;

    fn export_with(local: NodeId, peer: NodeId) -> PeerExport {
        let store = Arc::new(MemoryStore::new());
        let inventory = SnapshotInventory::new(store.clone());
        let log = MissedOpLog::new(local, store);

        let mut hosted = snapshot_on("hosted", 10, &[local, peer]);
        hosted.description = Some("before upgrade".to_string());
        hosted.volumes[0].layout = VolumeLayout::Replicate { replica_count: 2 };
        inventory.insert(hosted.clone()).unwrap();
        inventory.insert(snapshot_on("remote", 20, &[peer])).unwrap();

        log.record(
            peer,
            hosted.id,
            MissedOp::Delete,
            BrickRef {
                snap_volume_id: hosted.volumes[0].volume_id,
                brick_num: 2,
                brick_path: "/bricks/with:colon".to_string(),
            },
        )
        .unwrap();

        PeerExport::build(local, &inventory, &log)
    }

    #[test]
    fn test_build_marks_hosted_snapshots() {
        let local = NodeId::new();
        let export = export_with(local, NodeId::new());

        assert_eq!(export.node_id, local);
        assert_eq!(export.snapshots.len(), 2);
        assert_eq!(export.snapshots[0].snapshot.name, "hosted");
        assert!(export.snapshots[0].host_bricks);
        assert!(!export.snapshots[1].host_bricks);
        assert_eq!(export.missed.len(), 1);
    }

    #[test]
    fn test_flat_map_layout() {
        let export = export_with(NodeId::new(), NodeId::new());
        let map = export.to_flat_map();

        assert_eq!(map["snap_count"], "2");
        assert_eq!(map["snap1.snapname"], "hosted");
        assert_eq!(map["snap1.host_bricks"], "1");
        assert_eq!(map["snap1.vol1.type"], "replicate");
        assert_eq!(map["snap1.vol1.brick_count"], "2");
        assert_eq!(map["snap2.host_bricks"], "0");
        assert_eq!(map["missed_snap_count"], "1");
        assert!(map["missed_snaps_1"].ends_with(":/bricks/with:colon:2:1"));

        assert_eq!(PeerExport::from_flat_map(&map).unwrap(), export);
    }

    #[test]
    fn test_missing_key_is_named() {
        let mut map = export_with(NodeId::new(), NodeId::new()).to_flat_map();
        map.remove("snap2.vol1.version");

        let err = PeerExport::from_flat_map(&map).unwrap_err();
        assert!(matches!(err, SnapshotError::InvalidPayload(ref msg) if msg.contains("snap2.vol1.version")));
    }

    #[test]
    fn test_malformed_missed_entry() {
        let mut map = export_with(NodeId::new(), NodeId::new()).to_flat_map();
        map.insert("missed_snaps_1".to_string(), "garbage".to_string());

        let err = PeerExport::from_flat_map(&map).unwrap_err();
        assert!(matches!(err, SnapshotError::InvalidPayload(ref msg) if msg.contains("missed_snaps_1")));
    }

    #[test]
    fn test_oversized_counts_rejected() {
        let map = export_with(NodeId::new(), NodeId::new()).to_flat_map();

        for (count_key, missing) in [
            ("snap_count", "snap3.snap_status"),
            ("snap1.volcount", "snap1.vol2.type"),
            ("snap1.vol1.brick_count", "snap1.vol1.brick3.node_id"),
        ] {
            let mut map = map.clone();
            map.insert(count_key.to_string(), usize::MAX.to_string());

            let err = PeerExport::from_flat_map(&map).unwrap_err();
            assert!(
                matches!(err, SnapshotError::InvalidPayload(ref msg) if msg.contains(missing)),
                "{count_key}: {err}"
            );
        }
    }

    #[test]
    fn test_missed_create_code_rejected() {
        let value = format!(
            "{}:{}={}:1:/bricks/b1:1:1",
            NodeId::new(),
            SnapshotId::new(),
            VolumeId::new()
        );
        assert!(decode_missed("missed_snaps_1", &value).is_err());
    }

    #[test]
    fn test_unsupported_version() {
        let mut map = export_with(NodeId::new(), NodeId::new()).to_flat_map();
        map.insert("format_version".to_string(), "9".to_string());
        assert!(PeerExport::from_flat_map(&map).is_err());
    }
}
