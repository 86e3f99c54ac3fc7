//! Error types for SnapMesh
//!
//! `Error` covers parsing and configuration failures of shared types.
//! `ErrorClass` is the stable category every subsystem error maps onto, so
//! callers can branch on the kind of failure without matching each crate's
//! error enum.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Common result type for SnapMesh operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for SnapMesh
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

/// Stable failure category surfaced to operators
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorClass {
    /// Not enough nodes are reachable
    NodeDown,
    /// One or more bricks may be down
    BrickDown,
    /// Two nodes hold different snapshots under one name
    Conflict,
    /// A storage backend command failed
    Backend,
    NotFound,
    AlreadyExists,
    LimitReached,
    InvalidPayload,
    Store,
    Service,
    Internal,
}

impl ErrorClass {
    /// Short machine-readable name
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::NodeDown => "node_down",
            Self::BrickDown => "brick_down",
            Self::Conflict => "conflict",
            Self::Backend => "backend",
            Self::NotFound => "not_found",
            Self::AlreadyExists => "already_exists",
            Self::LimitReached => "limit_reached",
            Self::InvalidPayload => "invalid_payload",
            Self::Store => "store",
            Self::Service => "service",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::invalid_argument("bad brick");
        assert_eq!(err.to_string(), "invalid argument: bad brick");
    }

    #[test]
    fn test_class_names() {
        assert_eq!(ErrorClass::NodeDown.to_string(), "node_down");
        assert_eq!(ErrorClass::BrickDown.as_str(), "brick_down");
    }
}
