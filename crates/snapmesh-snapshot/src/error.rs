//! Snapshot subsystem error types

use snapmesh_common::{ErrorClass, NodeId};
use snapmesh_meta_store::MetaStoreError;
use thiserror::Error;

/// Snapshot subsystem error
#[derive(Error, Debug)]
pub enum SnapshotError {
    /// The quorum gate refused the operation
    #[error("Quorum not met: {reason}")]
    QuorumNotMet { reason: String, class: ErrorClass },

    /// Local and peer hold different snapshots under one name and both (or
    /// neither) host bricks for it
    #[error("Snapshot {snapshot} conflicts with the copy on peer {peer}")]
    Conflict { snapshot: String, peer: NodeId },

    /// Backend snapshot command failed
    #[error("Backend error on {device}: {message}")]
    Backend { device: String, message: String },

    /// Service controller command failed
    #[error("Service error for {service}: {message}")]
    Service { service: String, message: String },

    /// Snapshot not found
    #[error("Snapshot not found: {0}")]
    NotFound(String),

    /// Snapshot already exists
    #[error("Snapshot already exists: {0}")]
    AlreadyExists(String),

    /// Hard snapshot limit of a volume reached
    #[error("Snapshot limit reached for volume {volume}: {limit}")]
    LimitReached { volume: String, limit: u64 },

    /// Handshake payload could not be decoded
    #[error("Invalid exchange payload: {0}")]
    InvalidPayload(String),

    /// Request is malformed
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Persistence failure
    #[error("Store error: {0}")]
    Store(#[from] MetaStoreError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SnapshotError {
    pub fn backend(device: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Backend {
            device: device.into(),
            message: message.into(),
        }
    }

    pub fn service(service: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Service {
            service: service.into(),
            message: message.into(),
        }
    }

    pub fn invalid_payload(msg: impl Into<String>) -> Self {
        Self::InvalidPayload(msg.into())
    }

    /// Stable category of this error
    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::QuorumNotMet { class, .. } => *class,
            Self::Conflict { .. } => ErrorClass::Conflict,
            Self::Backend { .. } => ErrorClass::Backend,
            Self::Service { .. } => ErrorClass::Service,
            Self::NotFound(_) => ErrorClass::NotFound,
            Self::AlreadyExists(_) => ErrorClass::AlreadyExists,
            Self::LimitReached { .. } => ErrorClass::LimitReached,
            Self::InvalidPayload(_) => ErrorClass::InvalidPayload,
            Self::InvalidRequest(_) => ErrorClass::Internal,
            Self::Store(_) | Self::Io(_) => ErrorClass::Store,
        }
    }

    /// Check if retrying the operation or the whole exchange may succeed
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::QuorumNotMet { .. } | Self::Backend { .. } | Self::Store(_) | Self::Io(_)
        )
    }
}

/// Result type for snapshot operations
pub type SnapshotResult<T> = Result<T, SnapshotError>;
