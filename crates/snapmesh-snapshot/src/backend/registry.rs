//! Backend registry keyed by backend kind

use super::{LvmBackend, SnapshotBackend, ZfsBackend};
use crate::error::{SnapshotError, SnapshotResult};
use snapmesh_common::{BackendKind, Brick};
use std::collections::HashMap;
use std::sync::Arc;

/// Maps each backend kind to its implementation
#[derive(Clone, Default)]
pub struct BackendRegistry {
    backends: HashMap<BackendKind, Arc<dyn SnapshotBackend>>,
    default_kind: BackendKind,
}

impl BackendRegistry {
    /// Empty registry
    #[must_use]
    pub fn new(default_kind: BackendKind) -> Self {
        Self {
            backends: HashMap::new(),
            default_kind,
        }
    }

    /// Registry with the LVM and ZFS backends
    #[must_use]
    pub fn with_system_backends(default_kind: BackendKind) -> Self {
        let mut registry = Self::new(default_kind);
        registry.register(Arc::new(LvmBackend::new()));
        registry.register(Arc::new(ZfsBackend::new()));
        registry
    }

    /// Add or replace the backend for its kind
    pub fn register(&mut self, backend: Arc<dyn SnapshotBackend>) {
        self.backends.insert(backend.kind(), backend);
    }

    /// Look up a backend
    pub fn get(&self, kind: BackendKind) -> SnapshotResult<Arc<dyn SnapshotBackend>> {
        self.backends
            .get(&kind)
            .cloned()
            .ok_or_else(|| SnapshotError::InvalidRequest(format!("backend {kind} is not available")))
    }

    /// Backend kind for a new snapshot of `brick`
    #[must_use]
    pub fn select(&self, brick: &Brick) -> BackendKind {
        if brick.fs_type.is_empty() {
            self.default_kind
        } else {
            BackendKind::from_fs_type(&brick.fs_type)
        }
    }

    /// Registered kinds
    pub fn kinds(&self) -> Vec<BackendKind> {
        let mut kinds: Vec<BackendKind> = self.backends.keys().copied().collect();
        kinds.sort_by_key(BackendKind::name);
        kinds
    }
}
