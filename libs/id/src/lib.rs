//! # vmctl-id
//!
//! Typed identifiers for the vmctl reconciliation engine.
//!
//! Every identifier renders as `{prefix}_{ulid}`:
//!
//! - `vm_01HV4Z2WQXKJNM8GPQY6VBKC3D` names a managed VM resource
//! - `wat_01HV4Z3MXNKPQR9HSTZ7WCLD4E` names one background property watch
//! - `pass_01HV4Z4NYPLTRS0JTUA8XDME5F` names a single reconcile pass
//!
//! The prefix keeps log lines readable and stops a watch ID from being
//! handed to an API that expects a resource ID. Remote task identifiers are
//! assigned by the provider and are deliberately *not* modelled here.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
