//! ID types used across the engine.

use crate::define_id;

define_id!(
    /// Identity of a managed VM resource in the object store.
    VmId,
    "vm"
);

define_id!(
    /// Identity of one background property watch or task wait.
    WatchId,
    "wat"
);

define_id!(
    /// Identity of a single reconcile pass, attached to its tracing span.
    PassId,
    "pass"
);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{IdError, Ulid};
    use proptest::prelude::*;

    #[test]
    fn test_vm_id_roundtrip() {
        let id = VmId::new();
        let parsed: VmId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!(id.to_string().starts_with("vm_"));
    }

    #[test]
    fn test_wrong_prefix_rejected() {
        let watch = WatchId::new().to_string();
        let err = VmId::parse(&watch).unwrap_err();
        assert!(err.is_prefix_error());
    }

    #[test]
    fn test_malformed_ids() {
        assert_eq!(VmId::parse(""), Err(IdError::Empty));
        assert_eq!(
            VmId::parse("vm01HV4Z2WQXKJNM8GPQY6VBKC3D"),
            Err(IdError::MissingSeparator)
        );
        assert!(matches!(
            VmId::parse("vm_not-a-ulid"),
            Err(IdError::InvalidUlid(_))
        ));
    }

    #[test]
    fn test_json_is_plain_string() {
        let id = PassId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
        let parsed: PassId = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_prefixes_unique() {
        let prefixes = [VmId::PREFIX, WatchId::PREFIX, PassId::PREFIX];
        let unique: std::collections::HashSet<_> = prefixes.iter().collect();
        assert_eq!(unique.len(), prefixes.len());
    }

    proptest! {
        #[test]
        fn prop_any_ulid_roundtrips(raw in any::<u128>()) {
            let id = VmId::from_ulid(Ulid(raw));
            let parsed = VmId::parse(&id.to_string()).unwrap();
            prop_assert_eq!(parsed.ulid(), id.ulid());
        }
    }
}
