//! Shared fixtures for the controller integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use vmctl_controller::capability::{InfraScope, PlainScope};
use vmctl_controller::notifier::{CompletionNotifier, Dispatcher};
use vmctl_controller::remote::{MockProvider, TaskMode, VmRef};
use vmctl_controller::resource::NetworkDeviceSpec;
use vmctl_controller::session::{SessionCache, SharedConnector};
use vmctl_controller::{
    ManagedVm, MemoryObjectStore, ObjectStore, ReconcileError, Reconciler, ReconcilerConfig,
    VmSpec,
};
use vmctl_id::VmId;
use vmctl_reconcile::{Action, ManualClock};

pub const POLL: Duration = Duration::from_secs(10);
pub const BACKOFF: Duration = Duration::from_secs(60);

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

pub fn test_spec() -> VmSpec {
    VmSpec {
        server: "vcenter.test".to_string(),
        template: "ubuntu-2204".to_string(),
        folder: "/dc1/vm".to_string(),
        num_cpus: 2,
        memory_mib: 4096,
        network: vmctl_controller::resource::NetworkSpec {
            devices: vec![NetworkDeviceSpec {
                network_name: "vm-net".to_string(),
                dhcp4: true,
                ..Default::default()
            }],
        },
        ..Default::default()
    }
}

/// A reconciler wired to a simulated provider, an in-memory store and a
/// manual clock. The dispatcher is held but never run, so background waits
/// stay registered as in flight.
pub struct Harness {
    pub provider: Arc<MockProvider>,
    pub store: Arc<MemoryObjectStore>,
    pub sessions: Arc<SessionCache>,
    pub clock: Arc<ManualClock>,
    pub notifier: CompletionNotifier,
    pub reconciler: Reconciler,
    _dispatcher: Dispatcher,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_scope(Arc::new(PlainScope))
    }

    pub fn with_scope(scope: Arc<dyn InfraScope>) -> Self {
        let provider = Arc::new(MockProvider::new());
        let store = Arc::new(MemoryObjectStore::new());
        let sessions = Arc::new(SessionCache::new(Arc::new(SharedConnector::new(
            provider.clone(),
        ))));
        let clock = Arc::new(ManualClock::new(t0()));
        let (notifier, dispatcher) = CompletionNotifier::new();

        let reconciler = Reconciler::new(
            store.clone(),
            Arc::clone(&sessions),
            notifier.clone(),
            scope,
            clock.clone(),
            ReconcilerConfig {
                retry_backoff: BACKOFF,
                task_poll_interval: POLL,
                soft_power_off_timeout: Duration::from_secs(300),
            },
        );

        Self {
            provider,
            store,
            sessions,
            clock,
            notifier,
            reconciler,
            _dispatcher: dispatcher,
        }
    }

    pub fn manual(self) -> Self {
        self.provider.set_task_mode(TaskMode::Manual);
        self
    }

    pub async fn create(&self, name: &str, spec: VmSpec) -> ManagedVm {
        self.store.put(ManagedVm::new(name, spec)).await.unwrap()
    }

    pub async fn get(&self, id: VmId) -> ManagedVm {
        self.store.get(id).await.unwrap().expect("resource exists")
    }

    pub async fn pass(&self, id: VmId) -> Result<Action, ReconcileError> {
        self.reconciler.reconcile(id).await
    }

    pub async fn pass_ok(&self, id: VmId) -> Action {
        self.pass(id).await.expect("pass succeeds")
    }

    /// Request deletion the way an owner would.
    pub async fn request_deletion(&self, id: VmId) {
        let mut vm = self.get(id).await;
        vm.deletion_requested_at = Some(self.clock_now());
        self.store.put(vm).await.unwrap();
    }

    pub fn clock_now(&self) -> DateTime<Utc> {
        use vmctl_reconcile::Clock;
        self.clock.now()
    }

    pub fn vm_ref(&self, name: &str) -> VmRef {
        self.provider.vm_named(name).expect("remote VM exists")
    }

    /// Run passes with immediate tasks until the resource is ready.
    pub async fn drive_to_ready(&self, id: VmId) -> ManagedVm {
        for _ in 0..10 {
            self.pass_ok(id).await;
            let vm = self.get(id).await;
            if vm.status.ready {
                return vm;
            }
        }
        panic!("resource did not become ready");
    }

    /// Run passes until the pass reports `Done`.
    pub async fn drive_to_done(&self, id: VmId) -> ManagedVm {
        for _ in 0..10 {
            if self.pass_ok(id).await.is_done() {
                return self.get(id).await;
            }
        }
        panic!("resource did not finish");
    }
}
