//! Managed VM resource: desired spec plus observed status.
//!
//! The resource is owned by a higher-level controller. The lifecycle
//! reconciler only ever mutates [`VmStatus`]; the spec is read-only here.

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use vmctl_id::VmId;
use vmctl_reconcile::{Conditions, SpecHash};

/// Condition types and reasons written by the reconciler.
pub mod conditions {
    pub const READY: &str = "Ready";
    pub const VM_PROVISIONED: &str = "VmProvisioned";
    pub const TASK_SUCCEEDED: &str = "TaskSucceeded";
    pub const BOOTSTRAP_DATA_READY: &str = "BootstrapDataReady";
    pub const NETWORK_READY: &str = "NetworkReady";
    pub const GUEST_SOFT_POWER_OFF_SUCCEEDED: &str = "GuestSoftPowerOffSucceeded";
    pub const IDENTITY_VERIFIED: &str = "IdentityVerified";
    pub const CONFIGURATION_APPLIED: &str = "ConfigurationApplied";

    pub const REASON_CLONING: &str = "Cloning";
    pub const REASON_RECONFIGURING: &str = "Reconfiguring";
    pub const REASON_HARDWARE_UPGRADE_PENDING: &str = "HardwareUpgradePending";
    pub const REASON_POWERING_ON: &str = "PoweringOn";
    pub const REASON_NOT_FOUND: &str = "NotFound";
    pub const REASON_TASK_FAILED: &str = "TaskFailed";
    pub const REASON_UNEXPECTED_TASK_STATE: &str = "UnexpectedTaskState";
    pub const REASON_WAITING_FOR_BOOTSTRAP_DATA: &str = "WaitingForBootstrapData";
    pub const REASON_WAITING_FOR_MAC: &str = "WaitingForMacAddress";
    pub const REASON_WAITING_FOR_IP: &str = "WaitingForIpAddress";
    pub const REASON_INVALID_STATIC_ADDRESS: &str = "InvalidStaticAddress";
    pub const REASON_IDENTITY_MISMATCH: &str = "IdentityMismatch";
    pub const REASON_SOFT_POWER_OFF_IN_PROGRESS: &str = "GuestSoftPowerOffInProgress";
    pub const REASON_SOFT_POWER_OFF_FAILED: &str = "GuestSoftPowerOffFailed";
    pub const REASON_GUEST_TOOLS_NOT_RUNNING: &str = "GuestToolsNotRunning";
    pub const REASON_POWERING_OFF: &str = "PoweringOff";
    pub const REASON_DELETING: &str = "Deleting";
}

/// A managed virtual machine declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagedVm {
    pub id: VmId,

    /// VM name on the provider side.
    pub name: String,

    pub spec: VmSpec,

    #[serde(default)]
    pub status: VmStatus,

    /// Set by the owner to request teardown.
    #[serde(default)]
    pub deletion_requested_at: Option<DateTime<Utc>>,

    /// Bumped by the object store on every write.
    #[serde(default)]
    pub resource_version: u64,
}

impl ManagedVm {
    pub fn new(name: impl Into<String>, spec: VmSpec) -> Self {
        Self {
            id: VmId::new(),
            name: name.into(),
            spec,
            status: VmStatus::default(),
            deletion_requested_at: None,
            resource_version: 0,
        }
    }

    pub fn is_deleting(&self) -> bool {
        self.deletion_requested_at.is_some()
    }

    /// Inventory path used as the fallback lookup key.
    pub fn inventory_path(&self) -> String {
        format!("{}/{}", self.spec.folder.trim_end_matches('/'), self.name)
    }
}

/// Desired VM configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct VmSpec {
    /// Provider endpoint; also the session cache key.
    pub server: String,

    /// Template the VM is cloned from.
    pub template: String,

    /// Inventory folder.
    pub folder: String,

    pub num_cpus: u32,

    pub memory_mib: u64,

    /// Minimum virtual hardware version, e.g. `vmx-19`.
    #[serde(default)]
    pub hardware_version: Option<String>,

    /// PCI passthrough device identifiers.
    #[serde(default)]
    pub pci_devices: Vec<String>,

    #[serde(default)]
    pub storage_policy: Option<String>,

    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default)]
    pub network: NetworkSpec,

    #[serde(default)]
    pub power_off_mode: PowerOffMode,

    /// Overrides the configured guest shutdown timeout.
    #[serde(default)]
    pub guest_soft_power_off_timeout_secs: Option<u64>,
}

impl VmSpec {
    /// Hash of the settings applied by reconfiguration steps.
    pub fn reconfigurable_hash(&self) -> SpecHash {
        SpecHash::from_json(&serde_json::json!({
            "hardwareVersion": self.hardware_version,
            "pciDevices": self.pci_devices,
            "storagePolicy": self.storage_policy,
            "tags": self.tags,
        }))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct NetworkSpec {
    #[serde(default)]
    pub devices: Vec<NetworkDeviceSpec>,
}

/// One virtual NIC and the addresses it must acquire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct NetworkDeviceSpec {
    pub network_name: String,

    /// Fixed MAC; assigned by the provider when absent.
    #[serde(default)]
    pub mac_addr: Option<String>,

    /// Static addresses in CIDR notation.
    #[serde(default)]
    pub ip_addrs: Vec<String>,

    #[serde(default)]
    pub dhcp4: bool,

    #[serde(default)]
    pub dhcp6: bool,
}

impl NetworkDeviceSpec {
    /// Static addresses with the prefix length stripped. Entries that do
    /// not parse are listed by [`Self::invalid_ips`].
    pub fn static_ips(&self) -> Vec<IpAddr> {
        self.ip_addrs
            .iter()
            .filter_map(|cidr| parse_static_ip(cidr))
            .collect()
    }

    /// Static entries that are not a valid address or CIDR.
    pub fn invalid_ips(&self) -> Vec<&str> {
        self.ip_addrs
            .iter()
            .filter(|cidr| parse_static_ip(cidr).is_none())
            .map(String::as_str)
            .collect()
    }

    /// True if the device has nothing to wait for.
    pub fn has_no_address_requirement(&self) -> bool {
        self.ip_addrs.is_empty() && !self.dhcp4 && !self.dhcp6
    }
}

/// How a running VM is shut down before deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum PowerOffMode {
    /// Forced power-off task.
    #[default]
    Hard,
    /// Guest-initiated shutdown only.
    Soft,
    /// Guest shutdown, falling back to a forced power-off on timeout or
    /// when guest tools are unreachable.
    TrySoft,
}

/// Lifecycle phase recorded on the status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum VmPhase {
    #[default]
    NotFound,
    Creating,
    Updating,
    PoweringOn,
    AwaitingNetwork,
    Ready,
    PoweringOff,
    Destroying,
    Gone,
}

impl std::fmt::Display for VmPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NotFound => "notFound",
            Self::Creating => "creating",
            Self::Updating => "updating",
            Self::PoweringOn => "poweringOn",
            Self::AwaitingNetwork => "awaitingNetwork",
            Self::Ready => "ready",
            Self::PoweringOff => "poweringOff",
            Self::Destroying => "destroying",
            Self::Gone => "gone",
        };
        f.write_str(s)
    }
}

/// Observed state, persisted after every pass that changes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct VmStatus {
    /// Identifier of the outstanding remote task, if any.
    #[serde(default)]
    pub task_ref: Option<String>,

    /// Retry backoff gate.
    #[serde(default)]
    pub retry_after: Option<DateTime<Utc>>,

    #[serde(default)]
    pub phase: VmPhase,

    /// Instance UUID assigned at clone time; primary lookup key.
    #[serde(default)]
    pub bios_uuid: Option<String>,

    #[serde(default)]
    pub ready: bool,

    /// Routable addresses across all devices.
    #[serde(default)]
    pub addresses: Vec<String>,

    #[serde(default)]
    pub network: Vec<NetworkDeviceStatus>,

    #[serde(default)]
    pub applied_spec_hash: Option<String>,

    #[serde(default)]
    pub conditions: Conditions,
}

/// Per-device observed network state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct NetworkDeviceStatus {
    pub network_name: String,
    pub mac_addr: String,
    #[serde(default)]
    pub ip_addrs: Vec<String>,
}

fn parse_static_ip(cidr: &str) -> Option<IpAddr> {
    let (addr, prefix) = match cidr.split_once('/') {
        Some((addr, prefix)) => (addr, Some(prefix)),
        None => (cidr, None),
    };
    let ip: IpAddr = addr.parse().ok()?;
    if let Some(prefix) = prefix {
        let len: u8 = prefix.parse().ok()?;
        let max = if ip.is_ipv4() { 32 } else { 128 };
        if len > max {
            return None;
        }
    }
    Some(ip)
}

/// Parses `vmx-19` into 19.
pub fn parse_hardware_version(s: &str) -> Option<u32> {
    s.strip_prefix("vmx-")?.parse().ok()
}
