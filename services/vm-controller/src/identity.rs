//! Resolves the remote VM backing a managed resource.
//!
//! Lookup is by the instance UUID recorded at clone time, falling back to
//! the inventory path for VMs whose UUID was never recorded. A resolved VM
//! whose name differs from the resource is a hard error: acting on it would
//! mutate somebody else's machine.

use tracing::debug;

use crate::remote::{RemoteApi, RemoteError, VmProperties, VmRef};
use crate::resource::ManagedVm;

/// A resolved remote VM and its current properties.
#[derive(Debug, Clone)]
pub struct ResolvedVm {
    pub vm_ref: VmRef,
    pub props: VmProperties,
}

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("{vm_ref} is named {actual:?}, expected {expected:?}")]
    Mismatch {
        vm_ref: VmRef,
        expected: String,
        actual: String,
    },
}

/// Find the remote VM for `vm`. `Ok(None)` if it does not exist.
pub async fn resolve<R: RemoteApi + ?Sized>(
    api: &R,
    vm: &ManagedVm,
) -> Result<Option<ResolvedVm>, IdentityError> {
    let mut found = None;
    if let Some(uuid) = vm.status.bios_uuid.as_deref() {
        found = api.find_by_uuid(uuid).await?;
    }
    if found.is_none() {
        found = api.find_by_path(&vm.inventory_path()).await?;
    }
    let Some(vm_ref) = found else {
        debug!(vm_id = %vm.id, "No remote VM found");
        return Ok(None);
    };

    // The object can vanish between lookup and read.
    let Some(props) = api.properties(&vm_ref).await? else {
        return Ok(None);
    };

    if props.name != vm.name {
        return Err(IdentityError::Mismatch {
            vm_ref,
            expected: vm.name.clone(),
            actual: props.name,
        });
    }

    Ok(Some(ResolvedVm { vm_ref, props }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{CloneSpec, MockProvider, Operation};
    use crate::resource::VmSpec;

    fn managed(name: &str) -> ManagedVm {
        ManagedVm::new(
            name,
            VmSpec {
                folder: "/dc1/vm".to_string(),
                ..Default::default()
            },
        )
    }

    async fn clone(provider: &MockProvider, name: &str, uuid: &str) {
        provider
            .submit(Operation::Clone(Box::new(CloneSpec {
                name: name.to_string(),
                folder: "/dc1/vm".to_string(),
                template: "tmpl".to_string(),
                bios_uuid: uuid.to_string(),
                num_cpus: 1,
                memory_mib: 1024,
                devices: vec![],
                bootstrap: None,
            })))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_resolve_by_uuid() {
        let provider = MockProvider::new();
        clone(&provider, "web-0", "uuid-1").await;

        let mut vm = managed("web-0");
        vm.status.bios_uuid = Some("uuid-1".to_string());
        let resolved = resolve(&provider, &vm).await.unwrap().unwrap();
        assert_eq!(resolved.props.bios_uuid, "uuid-1");
    }

    #[tokio::test]
    async fn test_resolve_falls_back_to_path() {
        let provider = MockProvider::new();
        clone(&provider, "web-0", "uuid-1").await;

        let mut vm = managed("web-0");
        vm.status.bios_uuid = Some("uuid-stale".to_string());
        let resolved = resolve(&provider, &vm).await.unwrap().unwrap();
        assert_eq!(resolved.props.inventory_path, "/dc1/vm/web-0");
    }

    #[tokio::test]
    async fn test_resolve_missing() {
        let provider = MockProvider::new();
        assert!(resolve(&provider, &managed("web-0")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_resolve_name_mismatch() {
        let provider = MockProvider::new();
        clone(&provider, "web-0", "uuid-1").await;
        let vm_ref = provider.vm_named("web-0").unwrap();
        provider.rename_vm(&vm_ref, "intruder");

        let mut vm = managed("web-0");
        vm.status.bios_uuid = Some("uuid-1".to_string());
        let err = resolve(&provider, &vm).await.unwrap_err();
        assert!(matches!(err, IdentityError::Mismatch { .. }));
    }
}
