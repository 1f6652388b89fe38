//! Optional behaviour supplied by the infrastructure scope that owns a VM.
//!
//! A scope advertises capabilities by returning `Some` from the matching
//! accessor on [`InfraScope`]. The reconciler checks for a capability before
//! using it and treats its absence as "nothing to do".

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use thiserror::Error;
use vmctl_id::VmId;

use crate::resource::ManagedVm;

/// Guest bootstrap payload attached to a clone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapData {
    /// Encoding understood by the guest, e.g. `cloud-config`.
    pub format: String,
    pub value: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum CapabilityError {
    #[error("bootstrap data lookup failed: {0}")]
    Lookup(String),
}

/// Resolves bootstrap data for a VM.
#[async_trait]
pub trait BootstrapDataResolver: Send + Sync {
    /// `Ok(None)` means the data is not available yet; the caller waits.
    async fn resolve(&self, vm: &ManagedVm) -> Result<Option<BootstrapData>, CapabilityError>;
}

/// Behaviour contributed by the owner of a VM.
pub trait InfraScope: Send + Sync {
    /// Scopes that bootstrap their guests return a resolver here.
    fn bootstrap_data(&self) -> Option<&dyn BootstrapDataResolver> {
        None
    }
}

/// Scope with no optional capabilities.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainScope;

impl InfraScope for PlainScope {}

/// Scope whose bootstrap data is registered per VM ahead of time.
#[derive(Debug, Default)]
pub struct StaticBootstrapScope {
    data: RwLock<HashMap<VmId, BootstrapData>>,
}

impl StaticBootstrapScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: VmId, data: BootstrapData) {
        self.data
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, data);
    }
}

#[async_trait]
impl BootstrapDataResolver for StaticBootstrapScope {
    async fn resolve(&self, vm: &ManagedVm) -> Result<Option<BootstrapData>, CapabilityError> {
        Ok(self
            .data
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&vm.id)
            .cloned())
    }
}

impl InfraScope for StaticBootstrapScope {
    fn bootstrap_data(&self) -> Option<&dyn BootstrapDataResolver> {
        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::VmSpec;

    #[test]
    fn test_plain_scope_has_no_bootstrap() {
        assert!(PlainScope.bootstrap_data().is_none());
    }

    #[tokio::test]
    async fn test_static_scope_resolves_registered_data() {
        let scope = StaticBootstrapScope::new();
        let vm = ManagedVm::new("web-0", VmSpec::default());
        let resolver = scope.bootstrap_data().unwrap();

        assert!(resolver.resolve(&vm).await.unwrap().is_none());

        scope.insert(
            vm.id,
            BootstrapData {
                format: "cloud-config".to_string(),
                value: b"#cloud-config\n".to_vec(),
            },
        );
        let data = resolver.resolve(&vm).await.unwrap().unwrap();
        assert_eq!(data.format, "cloud-config");
    }
}
