//! Configuration types for SnapMesh
//!
//! Every section and field carries a serde default so a partial TOML file
//! (or none at all) yields a usable configuration.

use crate::error::Error;
use crate::types::BackendKind;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Root configuration for SnapMesh
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub quorum: QuorumConfig,
    #[serde(default)]
    pub snapshot: SnapshotConfig,
    #[serde(default)]
    pub services: ServicesConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Check cross-field constraints
    pub fn validate(&self) -> Result<(), Error> {
        if let Some(ratio) = self.quorum.server_quorum_ratio
            && ratio > 100
        {
            return Err(Error::configuration(format!(
                "server_quorum_ratio must be a percentage, got {ratio}"
            )));
        }
        if self.snapshot.max_soft_limit_percent > 100 {
            return Err(Error::configuration(format!(
                "max_soft_limit_percent must be at most 100, got {}",
                self.snapshot.max_soft_limit_percent
            )));
        }
        if self.snapshot.max_hard_limit == 0 {
            return Err(Error::configuration("max_hard_limit must be positive"));
        }
        Ok(())
    }
}

/// Node identity and state directory
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node UUID; generated and persisted on first start when unset
    #[serde(default)]
    pub id: Option<String>,
    /// Directory for the metadata database
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/snapmesh")
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: None,
            data_dir: default_data_dir(),
        }
    }
}

/// Cluster quorum settings
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct QuorumConfig {
    /// Percentage of nodes that must be active; strict majority when unset
    #[serde(default)]
    pub server_quorum_ratio: Option<u32>,
}

/// Snapshot limits and backend selection
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SnapshotConfig {
    /// System-wide hard limit on snapshots per volume
    #[serde(default = "default_hard_limit")]
    pub max_hard_limit: u64,
    /// Soft limit as a percentage of the effective hard limit
    #[serde(default = "default_soft_limit_percent")]
    pub max_soft_limit_percent: u64,
    /// Delete the oldest snapshot once the soft limit is crossed
    #[serde(default)]
    pub auto_delete: bool,
    /// Backend used when a brick's filesystem type does not decide it
    #[serde(default)]
    pub default_backend: BackendKind,
}

const fn default_hard_limit() -> u64 {
    256
}

const fn default_soft_limit_percent() -> u64 {
    90
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            max_hard_limit: default_hard_limit(),
            max_soft_limit_percent: default_soft_limit_percent(),
            auto_delete: false,
            default_backend: BackendKind::default(),
        }
    }
}

/// Which service manager drives per-snapshot daemons
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceManagerKind {
    #[default]
    Systemd,
    None,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ServicesConfig {
    #[serde(default)]
    pub controller: ServiceManagerKind,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.snapshot.max_hard_limit, 256);
        assert_eq!(config.snapshot.max_soft_limit_percent, 90);
        assert!(config.quorum.server_quorum_ratio.is_none());
        assert_eq!(config.services.controller, ServiceManagerKind::Systemd);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_ratio() {
        let mut config = Config::default();
        config.quorum.server_quorum_ratio = Some(150);
        assert!(config.validate().is_err());
        config.quorum.server_quorum_ratio = Some(51);
        assert!(config.validate().is_ok());
    }
}
