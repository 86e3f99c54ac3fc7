//! Subcommand implementations

use anyhow::{Context, Result, anyhow, bail};
use serde::Deserialize;
use snapmesh_common::{Config, Volume};
use snapmesh_quorum::{QuorumGate, QuorumVerdict, ReachabilitySnapshot, SnapshotOp};
use snapmesh_snapshot::{ApplyReport, PeerExport, SnapshotNode};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Peer payload as found on disk
#[derive(Deserialize)]
#[serde(untagged)]
enum PeerPayload {
    Typed(PeerExport),
    Flat(BTreeMap<String, String>),
}

pub fn export(node: &SnapshotNode, output: Option<&Path>, flat: bool) -> Result<()> {
    let export = node.export();
    let json = if flat {
        serde_json::to_string_pretty(&export.to_flat_map())?
    } else {
        serde_json::to_string_pretty(&export)?
    };

    match output {
        Some(path) => {
            std::fs::write(path, json)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            info!(
                "Exported {} snapshots to {}",
                export.snapshots.len(),
                path.display()
            );
        }
        None => println!("{json}"),
    }
    Ok(())
}

pub async fn reconcile(node: Arc<SnapshotNode>, peer: &Path) -> Result<()> {
    let raw = std::fs::read_to_string(peer)
        .with_context(|| format!("Failed to read {}", peer.display()))?;
    let export = match serde_json::from_str::<PeerPayload>(&raw)
        .with_context(|| format!("Failed to parse {}", peer.display()))?
    {
        PeerPayload::Typed(export) => export,
        PeerPayload::Flat(map) => PeerExport::from_flat_map(&map)?,
    };
    info!(
        "Reconciling with {} ({} snapshots, {} missed records)",
        export.node_id,
        export.snapshots.len(),
        export.missed.len()
    );

    // Backend and service calls block on child processes
    let report = tokio::task::spawn_blocking(move || node.reconcile(&export)).await??;

    println!("Reconcile with peer");
    println!("===================");
    println!(
        "Missed entries merged: {} added, {} marked done",
        report.merged.added, report.merged.upgraded
    );
    for (name, reason) in &report.noops {
        println!("  {name}: unchanged ({reason})");
    }
    print_apply(&report.applied);

    if let Some(err) = report.first_error() {
        bail!("reconciliation incomplete: {err}");
    }
    Ok(())
}

pub async fn replay(node: Arc<SnapshotNode>) -> Result<()> {
    let report = tokio::task::spawn_blocking(move || node.replay()).await?;
    print_apply(&report);
    if let Some(err) = report.first_error() {
        bail!("replay incomplete: {err}");
    }
    Ok(())
}

pub async fn restart_bricks(node: Arc<SnapshotNode>) -> Result<()> {
    let report = tokio::task::spawn_blocking(move || node.restart_bricks()).await?;
    println!("Snapshots with local bricks: {}", report.snapshots);
    for err in &report.service_errors {
        println!("  service error: {err}");
    }
    Ok(())
}

pub fn list(node: &SnapshotNode) {
    let snapshots = node.inventory().list();
    println!("Snapshots");
    println!("=========");
    if snapshots.is_empty() {
        println!("(none)");
        return;
    }
    println!(
        "{:<24} {:<36} {:<14} {:>8} {:<6} VOLUMES",
        "NAME", "ID", "STATUS", "VERSION", "LOCAL"
    );
    for snap in snapshots {
        let volumes: Vec<&str> = snap
            .volumes
            .iter()
            .map(|v| v.parent_volume_name.as_str())
            .collect();
        println!(
            "{:<24} {:<36} {:<14} {:>8} {:<6} {}",
            snap.name,
            snap.id,
            snap.status,
            snap.max_version(),
            if snap.hosts_bricks_of(node.local_node()) {
                "yes"
            } else {
                "no"
            },
            volumes.join(",")
        );
    }
}

pub fn missed(node: &SnapshotNode) {
    let records = node.missed_log().export_entries();
    println!("Missed operations");
    println!("=================");
    if records.is_empty() {
        println!("(none)");
        return;
    }
    for record in records {
        for entry in &record.entries {
            println!(
                "{} {} {:<7} brick {} {} [{}]",
                record.node_id,
                record.snapshot_id,
                entry.op,
                entry.brick.brick_num,
                entry.brick.brick_path,
                entry.status
            );
        }
    }
    println!("Pending: {}", node.missed_log().pending_count());
}

pub fn quorum(config: &Config, view: &Path, volumes: &[PathBuf], op: SnapshotOp) -> Result<()> {
    let view: ReachabilitySnapshot = read_json(view)?;
    let volumes = volumes
        .iter()
        .map(|path| read_json::<Volume>(path))
        .collect::<Result<Vec<_>>>()?;
    if matches!(op, SnapshotOp::Create { .. }) && volumes.is_empty() {
        warn!("No volumes given, only cluster quorum is checked");
    }

    let gate = QuorumGate::new(config.quorum.server_quorum_ratio);
    match gate.check(op, &volumes, &view) {
        QuorumVerdict::Admitted => {
            println!("Snapshot {op}: admitted");
            Ok(())
        }
        QuorumVerdict::Rejected { reason, class } => {
            println!("Snapshot {op}: rejected ({class})");
            Err(anyhow!(reason))
        }
    }
}

fn print_apply(report: &ApplyReport) {
    println!("Removed:  {}", report.removed);
    println!("Imported: {}", report.imported);
    println!("Replayed: {}", report.replayed);
    for name in &report.skipped {
        println!("  {name}: import skipped, local copy still present");
    }
    for name in &report.stale {
        println!("  {name}: dropped, local copy changed since it was resolved");
    }
    for err in &report.errors {
        println!("  error: {err}");
    }
    for err in &report.service_errors {
        println!("  service error: {err}");
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Failed to parse {}", path.display()))
}
