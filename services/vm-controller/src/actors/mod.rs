//! Actor framework for the VM controller.
//!
//! ## Design Principles
//!
//! - **One actor per resource**: each actor owns the reconcile passes for a
//!   single managed VM, so passes for one VM never run concurrently
//! - **Message coalescing**: a mailbox of one collapses bursts of triggers
//!   into a single pass
//! - **Crash isolation**: an actor that fails stops alone; the controller
//!   spawns a fresh one on the next trigger. A trigger that reached the
//!   mailbox during the final pass is sent back to the controller
//!
//! ## Actor Types
//!
//! - `ResourceActor`: runs reconcile passes for one VM and schedules its
//!   requeue timer

mod framework;
mod resource;

pub use framework::{ActorError, ActorHandle, Supervisor};
pub use resource::{ResourceActor, ResourceMessage, Trigger, RESOURCE_MAILBOX_SIZE};
