//! Simulated provider for development and testing.
//!
//! Keeps an in-memory inventory, hands out task IDs `t1`, `t2`, ... in
//! submission order, and publishes property changes to watchers through a
//! broadcast channel. Tasks either finish at submission time
//! ([`TaskMode::Immediate`]) or stay running until a test completes or fails
//! them ([`TaskMode::Manual`]).

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::{debug, info};

use super::{
    ChangeCallback, CloneSpec, GuestNicInfo, NicInfo, Operation, OperationKind, PowerState,
    PropertyChange, PropertyCollector, PropertyPath, PropertyValue, Reconfiguration, RemoteApi,
    RemoteError, RemoteTaskState, TaskFault, TaskInfo, ToolsStatus, VmProperties, VmRef,
};
use crate::resource::NetworkDeviceSpec;

const BASE_HARDWARE_VERSION: &str = "vmx-15";

/// When submitted tasks reach a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TaskMode {
    /// Tasks succeed (or fail, if scripted) at submission.
    #[default]
    Immediate,
    /// Tasks stay running until completed explicitly.
    Manual,
}

#[derive(Debug, Clone)]
struct PropertyUpdate {
    moref: String,
    removed: bool,
    changes: Vec<PropertyChange>,
}

#[derive(Debug, Clone)]
struct MockVm {
    props: VmProperties,
    devices: Vec<NetworkDeviceSpec>,
    index: u64,
}

#[derive(Debug, Default)]
struct MockState {
    vms: HashMap<String, MockVm>,
    tasks: HashMap<String, TaskInfo>,
    pending: HashMap<String, Operation>,
    submissions: Vec<OperationKind>,
    scripted_failures: Vec<(OperationKind, String)>,
    next_task: u64,
    next_vm: u64,
    next_mac: u64,
    task_mode: TaskMode,
    tools_running: bool,
    auto_guest_network: bool,
    defer_macs: bool,
    guest_shutdown_completes: bool,
    transport_down: bool,
    auth_failures: u32,
    shutdown_requests: u32,
}

/// In-process simulated provider.
pub struct MockProvider {
    state: Mutex<MockState>,
    updates: broadcast::Sender<PropertyUpdate>,
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MockProvider {
    /// Immediate tasks, tools running, addresses reported on power-on.
    pub fn new() -> Self {
        let (updates, _) = broadcast::channel(256);
        Self {
            state: Mutex::new(MockState {
                tools_running: true,
                auto_guest_network: true,
                guest_shutdown_completes: true,
                ..Default::default()
            }),
            updates,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // -------------------------------------------------------------------------
    // Scripting
    // -------------------------------------------------------------------------

    pub fn set_task_mode(&self, mode: TaskMode) {
        self.lock().task_mode = mode;
    }

    pub fn set_tools_running(&self, running: bool) {
        let mut state = self.lock();
        state.tools_running = running;
        let tools = if running {
            ToolsStatus::Running
        } else {
            ToolsStatus::NotRunning
        };
        for vm in state.vms.values_mut() {
            vm.props.tools = tools;
        }
    }

    /// Report guest addresses automatically after power-on.
    pub fn set_auto_guest_network(&self, enabled: bool) {
        self.lock().auto_guest_network = enabled;
    }

    /// Leave MACs empty after clone until [`MockProvider::assign_macs`].
    pub fn set_defer_macs(&self, defer: bool) {
        self.lock().defer_macs = defer;
    }

    /// Whether a guest shutdown request actually powers the VM off.
    pub fn set_guest_shutdown_completes(&self, completes: bool) {
        self.lock().guest_shutdown_completes = completes;
    }

    /// Fail every call with a transport error while set.
    pub fn set_transport_down(&self, down: bool) {
        self.lock().transport_down = down;
    }

    /// Fail the next `n` calls as unauthenticated.
    pub fn fail_auth(&self, n: u32) {
        self.lock().auth_failures = n;
    }

    /// The next submitted operation of `kind` ends in error with `message`.
    pub fn fail_next(&self, kind: OperationKind, message: impl Into<String>) {
        self.lock().scripted_failures.push((kind, message.into()));
    }

    /// Finish a running task successfully, applying its effect.
    pub fn complete_task(&self, task_id: &str) {
        let mut state = self.lock();
        let Some(op) = state.pending.remove(task_id) else {
            return;
        };
        let updates = apply_operation(&mut state, op);
        if let Some(task) = state.tasks.get_mut(task_id) {
            task.state = RemoteTaskState::Success;
        }
        drop(state);
        self.publish(updates);
    }

    /// Finish a running task with an error.
    pub fn fail_task(&self, task_id: &str, message: impl Into<String>) {
        let mut state = self.lock();
        state.pending.remove(task_id);
        if let Some(task) = state.tasks.get_mut(task_id) {
            task.state = RemoteTaskState::Error;
            task.error = Some(TaskFault {
                fault_type: "SystemError".to_string(),
                message: message.into(),
            });
        }
    }

    /// Overwrite a task's raw state.
    pub fn set_task_state(&self, task_id: &str, task_state: RemoteTaskState) {
        if let Some(task) = self.lock().tasks.get_mut(task_id) {
            task.state = task_state;
        }
    }

    /// Forget a task, as if it expired or was purged by an operator.
    pub fn forget_task(&self, task_id: &str) {
        let mut state = self.lock();
        state.tasks.remove(task_id);
        state.pending.remove(task_id);
    }

    /// Delete a VM behind the engine's back.
    pub fn remove_vm_out_of_band(&self, name: &str) {
        let mut state = self.lock();
        let moref = state
            .vms
            .iter()
            .find(|(_, vm)| vm.props.name == name)
            .map(|(k, _)| k.clone());
        if let Some(moref) = moref {
            state.vms.remove(&moref);
            drop(state);
            self.publish(vec![PropertyUpdate {
                moref,
                removed: true,
                changes: vec![],
            }]);
        }
    }

    /// Rename a VM while keeping its UUID and inventory path.
    pub fn rename_vm(&self, vm: &VmRef, name: &str) {
        if let Some(entry) = self.lock().vms.get_mut(vm.as_str()) {
            entry.props.name = name.to_string();
        }
    }

    /// Change the power state behind the engine's back.
    pub fn set_power_state(&self, vm: &VmRef, power_state: PowerState) {
        let mut state = self.lock();
        let Some(entry) = state.vms.get_mut(vm.as_str()) else {
            return;
        };
        entry.props.power_state = power_state;
        drop(state);
        self.publish(vec![PropertyUpdate {
            moref: vm.to_string(),
            removed: false,
            changes: vec![PropertyChange {
                value: PropertyValue::PowerState(power_state),
            }],
        }]);
    }

    /// Assign MACs to every NIC that lacks one.
    pub fn assign_macs(&self, vm: &VmRef) {
        let mut state = self.lock();
        let mut next_mac = state.next_mac;
        let Some(entry) = state.vms.get_mut(vm.as_str()) else {
            return;
        };
        for nic in entry.props.nics.iter_mut().filter(|n| n.mac_addr.is_empty()) {
            nic.mac_addr = generate_mac(next_mac);
            next_mac += 1;
        }
        let nics = entry.props.nics.clone();
        state.next_mac = next_mac;
        drop(state);
        self.publish(vec![PropertyUpdate {
            moref: vm.to_string(),
            removed: false,
            changes: vec![PropertyChange {
                value: PropertyValue::Nics(nics),
            }],
        }]);
    }

    /// Replace the guest-reported addresses for one MAC.
    pub fn set_guest_addresses(&self, vm: &VmRef, mac: &str, ips: &[&str]) {
        let parsed: Vec<IpAddr> = ips.iter().filter_map(|s| s.parse().ok()).collect();
        let mut state = self.lock();
        let Some(entry) = state.vms.get_mut(vm.as_str()) else {
            return;
        };
        match entry
            .props
            .guest_net
            .iter_mut()
            .find(|g| g.mac_addr.eq_ignore_ascii_case(mac))
        {
            Some(guest) => guest.ip_addrs = parsed,
            None => entry.props.guest_net.push(GuestNicInfo {
                mac_addr: mac.to_string(),
                ip_addrs: parsed,
            }),
        }
        let guest_net = entry.props.guest_net.clone();
        drop(state);
        self.publish(vec![PropertyUpdate {
            moref: vm.to_string(),
            removed: false,
            changes: vec![PropertyChange {
                value: PropertyValue::GuestNet(guest_net),
            }],
        }]);
    }

    // -------------------------------------------------------------------------
    // Inspection
    // -------------------------------------------------------------------------

    /// Kinds of every submitted operation, in order.
    pub fn submissions(&self) -> Vec<OperationKind> {
        self.lock().submissions.clone()
    }

    pub fn submission_count(&self) -> usize {
        self.lock().submissions.len()
    }

    pub fn shutdown_requests(&self) -> u32 {
        self.lock().shutdown_requests
    }

    pub fn vm_named(&self, name: &str) -> Option<VmRef> {
        self.lock()
            .vms
            .iter()
            .find(|(_, vm)| vm.props.name == name)
            .map(|(k, _)| VmRef::new(k.clone()))
    }

    pub fn snapshot(&self, vm: &VmRef) -> Option<VmProperties> {
        self.lock().vms.get(vm.as_str()).map(|v| v.props.clone())
    }

    pub fn vm_count(&self) -> usize {
        self.lock().vms.len()
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn check_transport(&self) -> Result<(), RemoteError> {
        let mut state = self.lock();
        if state.transport_down {
            return Err(RemoteError::Transport("connection refused".to_string()));
        }
        if state.auth_failures > 0 {
            state.auth_failures -= 1;
            return Err(RemoteError::Unauthenticated);
        }
        Ok(())
    }

    fn publish(&self, updates: Vec<PropertyUpdate>) {
        for update in updates {
            // No receivers is fine: nobody is watching.
            let _ = self.updates.send(update);
        }
    }

    fn current_values(&self, moref: &str, paths: &[PropertyPath]) -> Option<Vec<PropertyChange>> {
        let state = self.lock();
        let vm = state.vms.get(moref)?;
        Some(paths.iter().map(|p| value_of(&vm.props, *p)).collect())
    }
}

fn value_of(props: &VmProperties, path: PropertyPath) -> PropertyChange {
    let value = match path {
        PropertyPath::PowerState => PropertyValue::PowerState(props.power_state),
        PropertyPath::Nics => PropertyValue::Nics(props.nics.clone()),
        PropertyPath::GuestNet => PropertyValue::GuestNet(props.guest_net.clone()),
    };
    PropertyChange { value }
}

fn generate_mac(n: u64) -> String {
    format!(
        "00:50:56:{:02x}:{:02x}:{:02x}",
        (n >> 16) & 0xff,
        (n >> 8) & 0xff,
        n & 0xff
    )
}

/// Apply a successful operation to the inventory and return the property
/// updates it produced.
fn apply_operation(state: &mut MockState, op: Operation) -> Vec<PropertyUpdate> {
    match op {
        Operation::Clone(spec) => {
            clone_vm(state, *spec);
            vec![]
        }
        Operation::UpgradeHardware { vm, version } => {
            if let Some(entry) = state.vms.get_mut(vm.as_str()) {
                entry.props.hardware_version = version;
            }
            vec![]
        }
        Operation::Reconfigure { vm, change } => {
            if let Some(entry) = state.vms.get_mut(vm.as_str()) {
                match change {
                    Reconfiguration::AddPciDevices(devices) => {
                        entry.props.pci_devices.extend(devices)
                    }
                    Reconfiguration::SetStoragePolicy(policy) => {
                        entry.props.storage_policy = Some(policy)
                    }
                    Reconfiguration::AttachTags(tags) => entry.props.tags.extend(tags),
                }
            }
            vec![]
        }
        Operation::PowerOn { vm } => power_on(state, &vm),
        Operation::PowerOff { vm } => power_off(state, &vm),
        Operation::Destroy { vm } => {
            state.vms.remove(vm.as_str());
            vec![PropertyUpdate {
                moref: vm.to_string(),
                removed: true,
                changes: vec![],
            }]
        }
    }
}

fn clone_vm(state: &mut MockState, spec: CloneSpec) {
    state.next_vm += 1;
    let index = state.next_vm;
    let moref = format!("vm-{}", 100 + index);

    let mut nics = Vec::with_capacity(spec.devices.len());
    for (i, device) in spec.devices.iter().enumerate() {
        let mac_addr = match &device.mac_addr {
            Some(mac) => mac.clone(),
            None if state.defer_macs => String::new(),
            None => {
                state.next_mac += 1;
                generate_mac(state.next_mac)
            }
        };
        nics.push(NicInfo {
            device_key: 4000 + i as i32,
            network_name: device.network_name.clone(),
            mac_addr,
        });
    }

    let tools = if state.tools_running {
        ToolsStatus::Running
    } else {
        ToolsStatus::NotRunning
    };

    info!(
        moref = %moref,
        name = %spec.name,
        template = %spec.template,
        bootstrap = spec.bootstrap.is_some(),
        "[MOCK] Cloned VM"
    );

    state.vms.insert(
        moref,
        MockVm {
            props: VmProperties {
                inventory_path: format!("{}/{}", spec.folder.trim_end_matches('/'), spec.name),
                name: spec.name,
                bios_uuid: spec.bios_uuid,
                power_state: PowerState::PoweredOff,
                tools,
                hardware_version: BASE_HARDWARE_VERSION.to_string(),
                pci_devices: vec![],
                storage_policy: None,
                tags: vec![],
                nics,
                guest_net: vec![],
            },
            devices: spec.devices,
            index,
        },
    );
}

fn power_on(state: &mut MockState, vm: &VmRef) -> Vec<PropertyUpdate> {
    let auto_network = state.auto_guest_network;
    let Some(entry) = state.vms.get_mut(vm.as_str()) else {
        return vec![];
    };
    entry.props.power_state = PowerState::PoweredOn;
    let mut changes = vec![PropertyChange {
        value: PropertyValue::PowerState(PowerState::PoweredOn),
    }];

    if auto_network {
        let index = entry.index;
        let mut guest_net = Vec::new();
        for (i, (nic, device)) in entry.props.nics.iter().zip(&entry.devices).enumerate() {
            if nic.mac_addr.is_empty() {
                continue;
            }
            let mut ips = device.static_ips();
            if device.dhcp4 {
                if let Ok(ip) = format!("10.{}.{}.{}", i, index % 250, 10 + index % 200).parse() {
                    ips.push(ip);
                }
            }
            if device.dhcp6 {
                if let Ok(ip) = format!("2001:db8:{:x}::{:x}", i, index).parse() {
                    ips.push(ip);
                }
            }
            if let Ok(ip) = format!("fe80::250:56ff:fe00:{:x}", index).parse() {
                ips.push(ip);
            }
            guest_net.push(GuestNicInfo {
                mac_addr: nic.mac_addr.clone(),
                ip_addrs: ips,
            });
        }
        entry.props.guest_net = guest_net.clone();
        changes.push(PropertyChange {
            value: PropertyValue::GuestNet(guest_net),
        });
    }

    debug!(moref = %vm, "[MOCK] Powered on");
    vec![PropertyUpdate {
        moref: vm.to_string(),
        removed: false,
        changes,
    }]
}

fn power_off(state: &mut MockState, vm: &VmRef) -> Vec<PropertyUpdate> {
    let Some(entry) = state.vms.get_mut(vm.as_str()) else {
        return vec![];
    };
    entry.props.power_state = PowerState::PoweredOff;
    entry.props.guest_net.clear();
    debug!(moref = %vm, "[MOCK] Powered off");
    vec![PropertyUpdate {
        moref: vm.to_string(),
        removed: false,
        changes: vec![
            PropertyChange {
                value: PropertyValue::PowerState(PowerState::PoweredOff),
            },
            PropertyChange {
                value: PropertyValue::GuestNet(vec![]),
            },
        ],
    }]
}

#[async_trait]
impl RemoteApi for MockProvider {
    async fn get_task(&self, task_id: &str) -> Result<Option<TaskInfo>, RemoteError> {
        self.check_transport()?;
        Ok(self.lock().tasks.get(task_id).cloned())
    }

    async fn submit(&self, op: Operation) -> Result<String, RemoteError> {
        self.check_transport()?;

        let mut state = self.lock();
        state.next_task += 1;
        let task_id = format!("t{}", state.next_task);
        let kind = op.kind();
        state.submissions.push(kind);

        info!(task_id = %task_id, operation = %kind, "[MOCK] Task submitted");

        let position = state.scripted_failures.iter().position(|(k, _)| *k == kind);
        let scripted = position.map(|i| state.scripted_failures.remove(i).1);

        let mut updates = Vec::new();
        let task = match (scripted, state.task_mode) {
            (Some(message), _) => TaskInfo {
                id: task_id.clone(),
                state: RemoteTaskState::Error,
                error: Some(TaskFault {
                    fault_type: "SystemError".to_string(),
                    message,
                }),
            },
            (None, TaskMode::Immediate) => {
                updates = apply_operation(&mut state, op);
                TaskInfo {
                    id: task_id.clone(),
                    state: RemoteTaskState::Success,
                    error: None,
                }
            }
            (None, TaskMode::Manual) => {
                state.pending.insert(task_id.clone(), op);
                TaskInfo {
                    id: task_id.clone(),
                    state: RemoteTaskState::Running,
                    error: None,
                }
            }
        };
        state.tasks.insert(task_id.clone(), task);
        drop(state);

        self.publish(updates);
        Ok(task_id)
    }

    async fn find_by_uuid(&self, bios_uuid: &str) -> Result<Option<VmRef>, RemoteError> {
        self.check_transport()?;
        Ok(self
            .lock()
            .vms
            .iter()
            .find(|(_, vm)| vm.props.bios_uuid == bios_uuid)
            .map(|(k, _)| VmRef::new(k.clone())))
    }

    async fn find_by_path(&self, inventory_path: &str) -> Result<Option<VmRef>, RemoteError> {
        self.check_transport()?;
        Ok(self
            .lock()
            .vms
            .iter()
            .find(|(_, vm)| vm.props.inventory_path == inventory_path)
            .map(|(k, _)| VmRef::new(k.clone())))
    }

    async fn properties(&self, vm: &VmRef) -> Result<Option<VmProperties>, RemoteError> {
        self.check_transport()?;
        Ok(self.snapshot(vm))
    }

    async fn shutdown_guest(&self, vm: &VmRef) -> Result<(), RemoteError> {
        self.check_transport()?;
        let mut state = self.lock();
        state.shutdown_requests += 1;
        let completes = state.guest_shutdown_completes;
        let Some(entry) = state.vms.get(vm.as_str()) else {
            return Err(RemoteError::Fault(format!("{vm} not found")));
        };
        if entry.props.tools != ToolsStatus::Running {
            return Err(RemoteError::Fault("guest tools not running".to_string()));
        }
        let updates = if completes {
            power_off(&mut state, vm)
        } else {
            vec![]
        };
        drop(state);
        self.publish(updates);
        Ok(())
    }
}

#[async_trait]
impl PropertyCollector for MockProvider {
    async fn wait(
        &self,
        vm: &VmRef,
        paths: &[PropertyPath],
        on_change: &mut ChangeCallback<'_>,
    ) -> Result<(), RemoteError> {
        self.check_transport()?;

        // Subscribe before reading current values so nothing falls between.
        let mut rx = self.updates.subscribe();

        let Some(initial) = self.current_values(vm.as_str(), paths) else {
            return Err(RemoteError::WatchClosed(format!("{vm} not found")));
        };
        if on_change(&initial) {
            return Ok(());
        }

        loop {
            match rx.recv().await {
                Ok(update) if update.moref == vm.as_str() => {
                    if update.removed {
                        return Err(RemoteError::WatchClosed(format!("{vm} was deleted")));
                    }
                    let batch: Vec<PropertyChange> = update
                        .changes
                        .into_iter()
                        .filter(|c| paths.contains(&c.path()))
                        .collect();
                    if !batch.is_empty() && on_change(&batch) {
                        return Ok(());
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    let Some(full) = self.current_values(vm.as_str(), paths) else {
                        return Err(RemoteError::WatchClosed(format!("{vm} not found")));
                    };
                    if on_change(&full) {
                        return Ok(());
                    }
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(RemoteError::WatchClosed("provider shut down".to_string()));
                }
            }
        }
    }
}
