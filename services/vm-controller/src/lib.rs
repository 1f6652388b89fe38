//! vmctl VM Controller Library
//!
//! Drives remotely managed virtual machines through their lifecycle
//! (create, configure, power on, power off, destroy) when every backing
//! operation is a long-running provider task that can only be observed by
//! polling or by property-change notifications.
//!
//! ## Architecture
//!
//! ```text
//! Controller ── requeue channel ──┐
//! ├── ResourceActor(vm)           │   one per resource, mailbox of one
//! │   └── Reconciler::reconcile   │
//! │       ├── task poller         │
//! │       ├── backoff gate        │
//! │       └── CompletionNotifier ─┤   background waits
//! │            ├── wait_for_task  │
//! │            └── watch_until    │
//! └── Dispatcher ─────────────────┘
//! ```
//!
//! ## Modules
//!
//! - `reconciler`: the lifecycle state machine
//! - `task`: task polling
//! - `watch`: property-watch multiplexing and completion predicates
//! - `notifier`: background waits and the completion dispatcher
//! - `controller`, `actors`: work queue and per-resource actors
//! - `store`: object store (memory and SQLite)
//! - `remote`: provider interface and simulated provider

pub mod actors;
pub mod capability;
pub mod config;
pub mod controller;
pub mod identity;
pub mod notifier;
pub mod reconciler;
pub mod remote;
pub mod resource;
pub mod session;
pub mod store;
pub mod task;
pub mod watch;

// Re-export commonly used types
pub use controller::Controller;
pub use notifier::{CompletionNotifier, Dispatcher, RequeueSink};
pub use reconciler::{ReconcileError, Reconciler, ReconcilerConfig};
pub use remote::MockProvider;
pub use resource::{ManagedVm, VmPhase, VmSpec, VmStatus};
pub use store::{MemoryObjectStore, ObjectStore, SqliteObjectStore};
