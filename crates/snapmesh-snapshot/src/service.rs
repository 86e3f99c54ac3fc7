//! Service controller for per-snapshot daemons
//!
//! The executor and local operations call the controller after the
//! inventory has been mutated. Failures are logged and reported but never
//! roll the metadata change back.

use crate::error::{SnapshotError, SnapshotResult};
use serde::Serialize;
use snapmesh_common::{Brick, Snapshot};
use std::fmt;
use std::path::PathBuf;
use std::process::Command;
use tracing::{debug, info};

/// A daemon (or group of daemons) the controller manages
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ServiceRef {
    /// Brick processes serving one volume of a snapshot
    SnapshotBricks { snapshot: String, volume: String },
    /// Brick processes of an origin volume
    VolumeBricks { volume: String },
}

impl ServiceRef {
    /// systemd unit name
    #[must_use]
    pub fn unit_name(&self) -> String {
        match self {
            Self::SnapshotBricks { snapshot, volume } => {
                format!("snapmesh-snap-bricks@{snapshot}:{volume}.service")
            }
            Self::VolumeBricks { volume } => format!("snapmesh-bricks@{volume}.service"),
        }
    }
}

impl fmt::Display for ServiceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SnapshotBricks { snapshot, volume } => {
                write!(f, "bricks of {volume} in snapshot {snapshot}")
            }
            Self::VolumeBricks { volume } => write!(f, "bricks of volume {volume}"),
        }
    }
}

/// Starts, stops and reconfigures snapshot services
pub trait ServiceController: Send + Sync {
    fn start(&self, service: &ServiceRef) -> SnapshotResult<()>;

    fn stop(&self, service: &ServiceRef) -> SnapshotResult<()>;

    /// Rebuild configuration derived from `snapshot`
    fn regenerate(&self, _snapshot: &Snapshot) -> SnapshotResult<()> {
        Ok(())
    }
}

/// Drives services through `systemctl`
pub struct SystemdController {
    /// Where per-snapshot volume descriptors are written
    config_dir: PathBuf,
}

#[derive(Serialize)]
struct VolumeDescriptor<'a> {
    snapshot: &'a str,
    volume: &'a str,
    parent: &'a str,
    backend: &'a str,
    bricks: &'a [Brick],
}

impl SystemdController {
    pub fn new(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
        }
    }

    fn systemctl(action: &str, service: &ServiceRef) -> SnapshotResult<()> {
        let unit = service.unit_name();
        debug!("systemctl {} {}", action, unit);
        let output = Command::new("systemctl")
            .args([action, unit.as_str()])
            .output()
            .map_err(|e| SnapshotError::service(&unit, e.to_string()))?;
        if !output.status.success() {
            return Err(SnapshotError::service(
                &unit,
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(())
    }
}

impl ServiceController for SystemdController {
    fn start(&self, service: &ServiceRef) -> SnapshotResult<()> {
        Self::systemctl("start", service)
    }

    fn stop(&self, service: &ServiceRef) -> SnapshotResult<()> {
        Self::systemctl("stop", service)
    }

    fn regenerate(&self, snapshot: &Snapshot) -> SnapshotResult<()> {
        std::fs::create_dir_all(&self.config_dir)?;
        for volume in &snapshot.volumes {
            let descriptor = VolumeDescriptor {
                snapshot: &snapshot.name,
                volume: &volume.name,
                parent: &volume.parent_volume_name,
                backend: volume.backend.name(),
                bricks: &volume.bricks,
            };
            let json = serde_json::to_vec_pretty(&descriptor)
                .map_err(|e| SnapshotError::service(&volume.name, e.to_string()))?;
            let path = self
                .config_dir
                .join(format!("{}.{}.json", snapshot.name, volume.name));
            std::fs::write(&path, json)?;
            debug!("Wrote {}", path.display());
        }
        info!("Regenerated configuration for snapshot {}", snapshot.name);
        Ok(())
    }
}

/// Controller for nodes without a service manager
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopController;

impl ServiceController for NoopController {
    fn start(&self, service: &ServiceRef) -> SnapshotResult<()> {
        debug!("Not starting {}: no service manager", service);
        Ok(())
    }

    fn stop(&self, service: &ServiceRef) -> SnapshotResult<()> {
        debug!("Not stopping {}: no service manager", service);
        Ok(())
    }
}
