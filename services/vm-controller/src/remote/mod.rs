//! Remote provider interface.
//!
//! The provider exposes two collaborator surfaces:
//!
//! - [`RemoteApi`]: task submission and lookup, identity lookup, and
//!   property reads.
//! - [`PropertyCollector`]: long-lived property-change subscriptions.
//!
//! A [`Session`] is anything that implements both. A simulated provider is
//! provided for development and tests.

mod mock;

use std::net::IpAddr;

use async_trait::async_trait;
use thiserror::Error;

use crate::capability::BootstrapData;
use crate::resource::NetworkDeviceSpec;

pub use mock::{MockProvider, TaskMode};

/// Errors returned by the remote provider.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    /// Transport or API call failure; retried on the next pass.
    #[error("transport error: {0}")]
    Transport(String),

    /// The session is no longer authenticated.
    #[error("session not authenticated")]
    Unauthenticated,

    /// The provider rejected the call.
    #[error("remote fault: {0}")]
    Fault(String),

    /// A property watch ended without satisfying its predicate.
    #[error("property watch closed: {0}")]
    WatchClosed(String),
}

impl RemoteError {
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Unauthenticated)
    }
}

/// Opaque provider reference to a VM object (the Remote VM Handle).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VmRef(String);

impl VmRef {
    pub fn new(moref: impl Into<String>) -> Self {
        Self(moref.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for VmRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    PoweredOn,
    PoweredOff,
    Suspended,
}

/// Guest tools reachability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolsStatus {
    Running,
    NotRunning,
}

/// A virtual NIC as configured on the VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NicInfo {
    pub device_key: i32,
    pub network_name: String,
    /// Empty until the provider assigns one.
    pub mac_addr: String,
}

/// Guest-reported addresses for one NIC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestNicInfo {
    pub mac_addr: String,
    pub ip_addrs: Vec<IpAddr>,
}

/// Point-in-time VM properties.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmProperties {
    pub name: String,
    pub bios_uuid: String,
    pub inventory_path: String,
    pub power_state: PowerState,
    pub tools: ToolsStatus,
    pub hardware_version: String,
    pub pci_devices: Vec<String>,
    pub storage_policy: Option<String>,
    pub tags: Vec<String>,
    pub nics: Vec<NicInfo>,
    pub guest_net: Vec<GuestNicInfo>,
}

/// Raw task state as reported by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteTaskState {
    Queued,
    Running,
    Success,
    Error,
    /// Anything the provider reports that this engine does not understand.
    Other(String),
}

/// Error payload of a failed task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFault {
    pub fault_type: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInfo {
    pub id: String,
    pub state: RemoteTaskState,
    pub error: Option<TaskFault>,
}

/// Parameters for cloning a VM from a template.
#[derive(Debug, Clone, PartialEq)]
pub struct CloneSpec {
    pub name: String,
    pub folder: String,
    pub template: String,
    /// Chosen by the engine so the VM can be found by UUID afterwards.
    pub bios_uuid: String,
    pub num_cpus: u32,
    pub memory_mib: u64,
    pub devices: Vec<NetworkDeviceSpec>,
    pub bootstrap: Option<BootstrapData>,
}

/// In-place configuration changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconfiguration {
    AddPciDevices(Vec<String>),
    SetStoragePolicy(String),
    AttachTags(Vec<String>),
}

/// A long-running operation that yields a task.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Clone(Box<CloneSpec>),
    UpgradeHardware { vm: VmRef, version: String },
    Reconfigure { vm: VmRef, change: Reconfiguration },
    PowerOn { vm: VmRef },
    PowerOff { vm: VmRef },
    Destroy { vm: VmRef },
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Self::Clone(_) => OperationKind::Clone,
            Self::UpgradeHardware { .. } => OperationKind::UpgradeHardware,
            Self::Reconfigure { .. } => OperationKind::Reconfigure,
            Self::PowerOn { .. } => OperationKind::PowerOn,
            Self::PowerOff { .. } => OperationKind::PowerOff,
            Self::Destroy { .. } => OperationKind::Destroy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Clone,
    UpgradeHardware,
    Reconfigure,
    PowerOn,
    PowerOff,
    Destroy,
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Clone => "clone",
            Self::UpgradeHardware => "upgrade_hardware",
            Self::Reconfigure => "reconfigure",
            Self::PowerOn => "power_on",
            Self::PowerOff => "power_off",
            Self::Destroy => "destroy",
        };
        f.write_str(s)
    }
}

/// Task and inventory API.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Fetch a task by ID. `None` if the provider no longer knows it.
    async fn get_task(&self, task_id: &str) -> Result<Option<TaskInfo>, RemoteError>;

    /// Submit a long-running operation and return its task ID.
    async fn submit(&self, op: Operation) -> Result<String, RemoteError>;

    async fn find_by_uuid(&self, bios_uuid: &str) -> Result<Option<VmRef>, RemoteError>;

    async fn find_by_path(&self, inventory_path: &str) -> Result<Option<VmRef>, RemoteError>;

    /// Read current properties. `None` if the object vanished.
    async fn properties(&self, vm: &VmRef) -> Result<Option<VmProperties>, RemoteError>;

    /// Ask guest tools to shut the guest down. There is no task handle.
    async fn shutdown_guest(&self, vm: &VmRef) -> Result<(), RemoteError>;
}

/// Watched property paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropertyPath {
    PowerState,
    Nics,
    GuestNet,
}

impl PropertyPath {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PowerState => "runtime.powerState",
            Self::Nics => "config.hardware.device",
            Self::GuestNet => "guest.net",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyValue {
    PowerState(PowerState),
    Nics(Vec<NicInfo>),
    GuestNet(Vec<GuestNicInfo>),
}

/// New value for one watched property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyChange {
    pub value: PropertyValue,
}

impl PropertyChange {
    pub fn path(&self) -> PropertyPath {
        match self.value {
            PropertyValue::PowerState(_) => PropertyPath::PowerState,
            PropertyValue::Nics(_) => PropertyPath::Nics,
            PropertyValue::GuestNet(_) => PropertyPath::GuestNet,
        }
    }
}

/// Callback invoked per change batch; returning true ends the wait.
pub type ChangeCallback<'a> = dyn FnMut(&[PropertyChange]) -> bool + Send + 'a;

/// Property-change subscription transport.
///
/// Delivery is at-least-once and may batch or reorder changes. The first
/// batch carries the current value of every requested path.
#[async_trait]
pub trait PropertyCollector: Send + Sync {
    async fn wait(
        &self,
        vm: &VmRef,
        paths: &[PropertyPath],
        on_change: &mut ChangeCallback<'_>,
    ) -> Result<(), RemoteError>;
}

/// A connected provider session.
pub trait Session: RemoteApi + PropertyCollector {}

impl<T: RemoteApi + PropertyCollector> Session for T {}
