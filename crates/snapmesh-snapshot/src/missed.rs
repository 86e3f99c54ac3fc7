//! Missed-operation log
//!
//! Records deletes and restores that a node could not confirm while it was
//! unreachable. Entries are keyed by (node, snapshot), move from Pending to
//! Done exactly once and are never removed, so the log can be merged with a
//! peer's copy without losing history.

use crate::error::SnapshotResult;
use parking_lot::RwLock;
use snapmesh_common::{
    BrickRef, MissedOp, MissedOpEntry, MissedOpRecord, MissedOpStatus, NodeId, SnapshotId,
};
use snapmesh_meta_store::SnapshotStore;
use std::sync::Arc;
use tracing::{debug, info};

/// Where a `record` call landed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecordHandle {
    pub node_id: NodeId,
    pub snapshot_id: SnapshotId,
    /// Position of the entry within its (node, snapshot) record
    pub entry_index: usize,
    /// False when the same entry was already logged
    pub inserted: bool,
}

/// A local snapshot with pending missed operations.
///
/// `op` is the first pending operation and the one to perform; `superseded`
/// lists the other pending operations for the same snapshot, which are
/// settled by the same side effect.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingOp {
    pub snapshot_id: SnapshotId,
    pub op: MissedOp,
    pub superseded: Vec<MissedOp>,
}

/// Counts from merging a peer's log
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub added: usize,
    pub upgraded: usize,
}

pub struct MissedOpLog {
    local: NodeId,
    records: RwLock<Vec<MissedOpRecord>>,
    store: Arc<dyn SnapshotStore>,
}

impl MissedOpLog {
    pub fn new(local: NodeId, store: Arc<dyn SnapshotStore>) -> Self {
        Self {
            local,
            records: RwLock::new(Vec::new()),
            store,
        }
    }

    /// Replace the in-memory log with the store's contents
    pub fn load(&self) -> SnapshotResult<usize> {
        let mut records = self.store.load_missed_records()?;
        records.sort_by_key(MissedOpRecord::key);
        let pending = records
            .iter()
            .filter(|r| r.node_id == self.local)
            .flat_map(|r| &r.entries)
            .filter(|e| e.status == MissedOpStatus::Pending)
            .count();
        let count = records.len();
        *self.records.write() = records;
        info!(
            "Loaded {} missed-op records, {} pending on this node",
            count, pending
        );
        Ok(count)
    }

    pub const fn local_node(&self) -> NodeId {
        self.local
    }

    /// Log that `node_id` missed `op` on one brick of `snapshot_id`.
    ///
    /// Recording the same (node, snapshot, op, brick) again returns the
    /// existing entry.
    pub fn record(
        &self,
        node_id: NodeId,
        snapshot_id: SnapshotId,
        op: MissedOp,
        brick: BrickRef,
    ) -> SnapshotResult<RecordHandle> {
        let mut records = self.records.write();
        let idx = Self::find_or_create(&mut records, node_id, snapshot_id);
        let record = &mut records[idx];

        if let Some(pos) = record
            .entries
            .iter()
            .position(|e| e.op == op && e.brick == brick)
        {
            return Ok(RecordHandle {
                node_id,
                snapshot_id,
                entry_index: pos,
                inserted: false,
            });
        }

        record.entries.push(MissedOpEntry {
            op,
            brick,
            status: MissedOpStatus::Pending,
        });
        if let Err(e) = self.store.put_missed_record(record) {
            record.entries.pop();
            return Err(e.into());
        }

        debug!("Recorded missed {} of {} for node {}", op, snapshot_id, node_id);
        Ok(RecordHandle {
            node_id,
            snapshot_id,
            entry_index: record.entries.len() - 1,
            inserted: true,
        })
    }

    pub fn has_pending_delete_or_restore(&self, node_id: NodeId, snapshot_id: SnapshotId) -> bool {
        self.records.read().iter().any(|r| {
            r.node_id == node_id
                && r.snapshot_id == snapshot_id
                && r.entries.iter().any(|e| e.status == MissedOpStatus::Pending)
        })
    }

    /// Iterate local snapshots with pending operations.
    ///
    /// Every call starts from the beginning of the log; the iterator takes
    /// the lock per step and never holds it between items.
    pub fn drain_local_pending(&self) -> PendingOps<'_> {
        PendingOps {
            log: self,
            cursor: 0,
        }
    }

    /// Mark every pending `op` entry of (node, snapshot) as Done
    pub fn mark_done(
        &self,
        node_id: NodeId,
        snapshot_id: SnapshotId,
        op: MissedOp,
    ) -> SnapshotResult<usize> {
        let mut records = self.records.write();
        let Some(record) = records
            .iter_mut()
            .find(|r| r.node_id == node_id && r.snapshot_id == snapshot_id)
        else {
            return Ok(0);
        };

        let before = record.clone();
        let mut changed = 0;
        for entry in &mut record.entries {
            if entry.op == op && entry.status == MissedOpStatus::Pending {
                entry.status = MissedOpStatus::Done;
                changed += 1;
            }
        }
        if changed > 0
            && let Err(e) = self.store.put_missed_record(record)
        {
            *record = before;
            return Err(e.into());
        }
        Ok(changed)
    }

    /// Fold a peer's exported log into ours.
    ///
    /// Unknown entries are appended with the peer's status; a Pending entry
    /// is upgraded when the peer reports it Done. Nothing is removed and
    /// Done is never downgraded.
    pub fn merge_peer_entries(&self, peer: &[MissedOpRecord]) -> SnapshotResult<MergeStats> {
        let mut stats = MergeStats::default();
        let mut records = self.records.write();

        for incoming in peer {
            let idx = Self::find_or_create(&mut records, incoming.node_id, incoming.snapshot_id);
            let record = &mut records[idx];
            let mut changed = false;

            for entry in &incoming.entries {
                match record
                    .entries
                    .iter_mut()
                    .find(|e| e.op == entry.op && e.brick == entry.brick)
                {
                    Some(existing) => {
                        if existing.status == MissedOpStatus::Pending
                            && entry.status == MissedOpStatus::Done
                        {
                            existing.status = MissedOpStatus::Done;
                            stats.upgraded += 1;
                            changed = true;
                        }
                    }
                    None => {
                        record.entries.push(entry.clone());
                        stats.added += 1;
                        changed = true;
                    }
                }
            }

            if changed {
                self.store.put_missed_record(record)?;
            }
        }

        if stats.added > 0 || stats.upgraded > 0 {
            info!(
                "Merged peer missed-op list: {} added, {} marked done",
                stats.added, stats.upgraded
            );
        }
        Ok(stats)
    }

    /// Copy of the whole log for the handshake payload
    pub fn export_entries(&self) -> Vec<MissedOpRecord> {
        self.records.read().clone()
    }

    /// Pending entry count across all nodes
    pub fn pending_count(&self) -> usize {
        self.records
            .read()
            .iter()
            .flat_map(|r| &r.entries)
            .filter(|e| e.status == MissedOpStatus::Pending)
            .count()
    }

    fn find_or_create(
        records: &mut Vec<MissedOpRecord>,
        node_id: NodeId,
        snapshot_id: SnapshotId,
    ) -> usize {
        if let Some(idx) = records
            .iter()
            .position(|r| r.node_id == node_id && r.snapshot_id == snapshot_id)
        {
            return idx;
        }
        records.push(MissedOpRecord {
            node_id,
            snapshot_id,
            entries: Vec::new(),
        });
        records.len() - 1
    }
}

/// Lazy cursor over local pending operations
pub struct PendingOps<'a> {
    log: &'a MissedOpLog,
    cursor: usize,
}

impl Iterator for PendingOps<'_> {
    type Item = PendingOp;

    fn next(&mut self) -> Option<Self::Item> {
        let records = self.log.records.read();
        while self.cursor < records.len() {
            let record = &records[self.cursor];
            self.cursor += 1;
            if record.node_id != self.log.local {
                continue;
            }

            let mut pending = record
                .entries
                .iter()
                .filter(|e| e.status == MissedOpStatus::Pending)
                .map(|e| e.op);
            let Some(op) = pending.next() else {
                continue;
            };
            let mut superseded: Vec<MissedOp> = Vec::new();
            for other in pending {
                if other != op && !superseded.contains(&other) {
                    superseded.push(other);
                }
            }
            return Some(PendingOp {
                snapshot_id: record.snapshot_id,
                op,
                superseded,
            });
        }
        None
    }
}
