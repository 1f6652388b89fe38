//! Object store for managed VM resources.
//!
//! The owner of a resource writes its spec with [`ObjectStore::put`]; the
//! reconciler only ever writes status with [`ObjectStore::patch_status`].
//! Every write bumps `resource_version`, and status patches are rejected
//! when the caller's version is stale so a pass never overwrites a spec
//! edit it did not see.

mod sqlite;

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;
use vmctl_id::VmId;

use crate::resource::{ManagedVm, VmStatus};

pub use sqlite::SqliteObjectStore;

/// Errors from object store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("resource not found: {0}")]
    NotFound(VmId),

    #[error("resource {id} changed: expected version {expected}, found {actual}")]
    Conflict {
        id: VmId,
        expected: u64,
        actual: u64,
    },
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// Durable storage for managed resources.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, id: VmId) -> Result<Option<ManagedVm>, StoreError>;

    /// Create or update a resource's spec and deletion marker.
    ///
    /// An existing status is preserved. Returns the stored object.
    async fn put(&self, vm: ManagedVm) -> Result<ManagedVm, StoreError>;

    /// Replace the status of the resource at `expected_version`.
    async fn patch_status(
        &self,
        id: VmId,
        expected_version: u64,
        status: VmStatus,
    ) -> Result<ManagedVm, StoreError>;

    async fn list(&self) -> Result<Vec<ManagedVm>, StoreError>;

    /// Remove a resource. Returns true if it existed.
    async fn delete(&self, id: VmId) -> Result<bool, StoreError>;
}

/// Merge an owner write into the stored object, keeping the status.
fn merge_put(existing: Option<ManagedVm>, mut incoming: ManagedVm) -> ManagedVm {
    match existing {
        Some(current) => {
            incoming.status = current.status;
            incoming.resource_version = current.resource_version + 1;
        }
        None => incoming.resource_version = 1,
    }
    incoming
}

/// In-memory object store.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: RwLock<HashMap<VmId, ManagedVm>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get(&self, id: VmId) -> Result<Option<ManagedVm>, StoreError> {
        Ok(self.objects.read().await.get(&id).cloned())
    }

    async fn put(&self, vm: ManagedVm) -> Result<ManagedVm, StoreError> {
        let mut objects = self.objects.write().await;
        let stored = merge_put(objects.get(&vm.id).cloned(), vm);
        objects.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn patch_status(
        &self,
        id: VmId,
        expected_version: u64,
        status: VmStatus,
    ) -> Result<ManagedVm, StoreError> {
        let mut objects = self.objects.write().await;
        let current = objects.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if current.resource_version != expected_version {
            return Err(StoreError::Conflict {
                id,
                expected: expected_version,
                actual: current.resource_version,
            });
        }
        current.status = status;
        current.resource_version += 1;
        Ok(current.clone())
    }

    async fn list(&self) -> Result<Vec<ManagedVm>, StoreError> {
        let mut all: Vec<ManagedVm> = self.objects.read().await.values().cloned().collect();
        all.sort_by_key(|vm| vm.id);
        Ok(all)
    }

    async fn delete(&self, id: VmId) -> Result<bool, StoreError> {
        Ok(self.objects.write().await.remove(&id).is_some())
    }
}
