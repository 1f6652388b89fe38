//! Create, configure, power on, and wait for the network.

use std::time::Duration;

use tracing::{debug, info, warn};
use uuid::Uuid;
use vmctl_reconcile::{Action, Severity};

use super::{Pass, ReconcileError, Reconciler};
use crate::identity::ResolvedVm;
use crate::notifier::WaitConcern;
use crate::remote::{CloneSpec, Operation, PowerState, Reconfiguration, VmProperties};
use crate::resource::conditions::*;
use crate::resource::{parse_hardware_version, NetworkDeviceStatus, VmPhase};
use crate::watch::{AddressesReady, CompletionPredicate, MacsAssigned, WatchSnapshot};

/// Outcome of comparing the VM's configuration with the spec.
enum NextChange {
    Apply(Operation),
    /// Only changes that cannot run in the current power state remain.
    Deferred(String),
    InSync,
}

impl Reconciler {
    pub(super) async fn provision(&self, pass: &mut Pass<'_>) -> Result<Action, ReconcileError> {
        if let Some(action) = self.guard_task(pass).await? {
            return Ok(action);
        }

        let Some(resolved) = self.resolve(pass).await? else {
            return self.handle_missing(pass).await;
        };

        pass.status.bios_uuid = Some(resolved.props.bios_uuid.clone());
        pass.status
            .conditions
            .mark_true(VM_PROVISIONED, pass.now);

        let desired_hash = pass.vm.spec.reconfigurable_hash();
        if pass.status.applied_spec_hash.as_deref() != Some(desired_hash.as_str()) {
            match self.next_reconfiguration(pass, &resolved) {
                NextChange::Apply(op) => return self.reconfigure(pass, op).await,
                // The hash stays unapplied so the step is retried on later passes.
                NextChange::Deferred(message) => self.defer_configuration(pass, message),
                NextChange::InSync => {
                    info!(spec_hash = %desired_hash, "Configuration applied");
                    pass.status.applied_spec_hash = Some(desired_hash.to_string());
                    pass.status
                        .conditions
                        .mark_true(CONFIGURATION_APPLIED, pass.now);
                }
            }
        }

        if resolved.props.power_state != PowerState::PoweredOn {
            self.set_not_ready(pass, VmPhase::PoweringOn, REASON_POWERING_ON);
            return self
                .submit(
                    pass,
                    Operation::PowerOn {
                        vm: resolved.vm_ref.clone(),
                    },
                )
                .await;
        }

        self.await_network(pass, &resolved)
    }

    /// No remote VM exists for the resource.
    async fn handle_missing(&self, pass: &mut Pass<'_>) -> Result<Action, ReconcileError> {
        if pass.status.conditions.is_true(VM_PROVISIONED) {
            warn!("Provisioned VM is gone, recreating");
            pass.status.conditions.mark_false(
                VM_PROVISIONED,
                REASON_NOT_FOUND,
                Severity::Warning,
                "VM was deleted outside of the controller",
                pass.now,
            );
            pass.status.bios_uuid = None;
            pass.status.applied_spec_hash = None;
            pass.status.network.clear();
            pass.status.addresses.clear();
            self.set_not_ready(pass, VmPhase::NotFound, REASON_NOT_FOUND);
            return Ok(Action::requeue(Duration::ZERO));
        }

        self.create(pass).await
    }

    async fn create(&self, pass: &mut Pass<'_>) -> Result<Action, ReconcileError> {
        let bootstrap = match self.scope.bootstrap_data() {
            None => None,
            Some(resolver) => match resolver.resolve(pass.vm).await? {
                Some(data) => {
                    pass.status
                        .conditions
                        .mark_true(BOOTSTRAP_DATA_READY, pass.now);
                    Some(data)
                }
                None => {
                    debug!("Bootstrap data not available yet");
                    pass.status.conditions.mark_false(
                        BOOTSTRAP_DATA_READY,
                        REASON_WAITING_FOR_BOOTSTRAP_DATA,
                        Severity::Info,
                        "waiting for bootstrap data",
                        pass.now,
                    );
                    return Ok(Action::requeue(self.config.task_poll_interval));
                }
            },
        };

        // Reused across retries so a clone that did land is found by UUID.
        let bios_uuid = pass
            .status
            .bios_uuid
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let spec = &pass.vm.spec;
        let clone = CloneSpec {
            name: pass.vm.name.clone(),
            folder: spec.folder.clone(),
            template: spec.template.clone(),
            bios_uuid: bios_uuid.clone(),
            num_cpus: spec.num_cpus,
            memory_mib: spec.memory_mib,
            devices: spec.network.devices.clone(),
            bootstrap,
        };

        info!(template = %spec.template, bios_uuid = %bios_uuid, "Cloning VM");
        pass.status.bios_uuid = Some(bios_uuid);
        pass.status.conditions.mark_false(
            VM_PROVISIONED,
            REASON_CLONING,
            Severity::Info,
            format!("cloning from {}", spec.template),
            pass.now,
        );
        self.set_not_ready(pass, VmPhase::Creating, REASON_CLONING);
        self.submit(pass, Operation::Clone(Box::new(clone))).await
    }

    async fn reconfigure(
        &self,
        pass: &mut Pass<'_>,
        op: Operation,
    ) -> Result<Action, ReconcileError> {
        if pass.status.ready {
            info!("Spec drift detected, reconfiguring");
        }
        self.set_not_ready(pass, VmPhase::Updating, REASON_RECONFIGURING);
        self.submit(pass, op).await
    }

    fn defer_configuration(&self, pass: &mut Pass<'_>, message: String) {
        let already = pass
            .status
            .conditions
            .get(CONFIGURATION_APPLIED)
            .is_some_and(|c| c.reason == REASON_HARDWARE_UPGRADE_PENDING);
        if !already {
            warn!(reason = %message, "Configuration change deferred");
        }
        pass.status.conditions.mark_false(
            CONFIGURATION_APPLIED,
            REASON_HARDWARE_UPGRADE_PENDING,
            Severity::Warning,
            message,
            pass.now,
        );
    }

    /// First outstanding configuration change.
    ///
    /// A hardware upgrade needs the VM powered off. While it is running the
    /// upgrade is deferred and the remaining changes still go ahead.
    fn next_reconfiguration(&self, pass: &Pass<'_>, resolved: &ResolvedVm) -> NextChange {
        let spec = &pass.vm.spec;
        let props: &VmProperties = &resolved.props;
        let vm = resolved.vm_ref.clone();
        let mut deferred = None;

        if let Some(desired) = spec.hardware_version.as_deref() {
            let want = parse_hardware_version(desired);
            let have = parse_hardware_version(&props.hardware_version);
            if want > have {
                if props.power_state == PowerState::PoweredOff {
                    return NextChange::Apply(Operation::UpgradeHardware {
                        vm,
                        version: desired.to_string(),
                    });
                }
                deferred = Some(format!(
                    "upgrade from {} to {desired} waits for the VM to be powered off",
                    props.hardware_version
                ));
            }
        }

        let missing_pci: Vec<String> = spec
            .pci_devices
            .iter()
            .filter(|d| !props.pci_devices.contains(d))
            .cloned()
            .collect();
        if !missing_pci.is_empty() {
            return NextChange::Apply(Operation::Reconfigure {
                vm,
                change: Reconfiguration::AddPciDevices(missing_pci),
            });
        }

        if let Some(policy) = &spec.storage_policy {
            if props.storage_policy.as_ref() != Some(policy) {
                return NextChange::Apply(Operation::Reconfigure {
                    vm,
                    change: Reconfiguration::SetStoragePolicy(policy.clone()),
                });
            }
        }

        let missing_tags: Vec<String> = spec
            .tags
            .iter()
            .filter(|t| !props.tags.contains(t))
            .cloned()
            .collect();
        if !missing_tags.is_empty() {
            return NextChange::Apply(Operation::Reconfigure {
                vm,
                change: Reconfiguration::AttachTags(missing_tags),
            });
        }

        match deferred {
            Some(message) => NextChange::Deferred(message),
            None => NextChange::InSync,
        }
    }

    /// Check MACs and guest addresses; launch watches for whatever is missing.
    fn await_network(
        &self,
        pass: &mut Pass<'_>,
        resolved: &ResolvedVm,
    ) -> Result<Action, ReconcileError> {
        let props = &resolved.props;
        let devices = &pass.vm.spec.network.devices;
        let snapshot = WatchSnapshot::from_properties(props);

        let invalid: Vec<&str> = devices.iter().flat_map(|d| d.invalid_ips()).collect();
        if !invalid.is_empty() {
            let reported = pass
                .status
                .conditions
                .get(NETWORK_READY)
                .is_some_and(|c| c.reason == REASON_INVALID_STATIC_ADDRESS);
            if !reported {
                warn!(addresses = ?invalid, "Static addresses are not valid");
            }
            pass.status.conditions.mark_false(
                NETWORK_READY,
                REASON_INVALID_STATIC_ADDRESS,
                Severity::Error,
                format!("invalid static addresses: {}", invalid.join(", ")),
                pass.now,
            );
            self.set_not_ready(pass, VmPhase::AwaitingNetwork, REASON_INVALID_STATIC_ADDRESS);
            return Ok(Action::AwaitChange);
        }

        let macs = MacsAssigned {
            expected: devices.len(),
        };
        if !macs.is_complete(&snapshot) {
            debug!("Waiting for MAC addresses");
            self.set_waiting_for_network(pass, REASON_WAITING_FOR_MAC, "waiting for MAC addresses");
            self.launch_watch(pass, &resolved.vm_ref, WaitConcern::Macs, macs);
            return Ok(Action::AwaitChange);
        }

        let addresses = AddressesReady::for_devices(devices, &props.nics);
        pass.status.network = addresses
            .devices
            .iter()
            .zip(devices)
            .map(|(req, spec)| NetworkDeviceStatus {
                network_name: spec.network_name.clone(),
                mac_addr: req.mac.clone(),
                ip_addrs: snapshot
                    .routable_addresses(&req.mac)
                    .iter()
                    .map(ToString::to_string)
                    .collect(),
            })
            .collect();
        let mut all: Vec<String> = Vec::new();
        for ip in pass.status.network.iter().flat_map(|d| d.ip_addrs.iter()) {
            if !all.contains(ip) {
                all.push(ip.clone());
            }
        }
        pass.status.addresses = all;

        if !addresses.is_complete(&snapshot) {
            debug!("Waiting for guest addresses");
            self.set_waiting_for_network(pass, REASON_WAITING_FOR_IP, "waiting for IP addresses");
            let concern = WaitConcern::Addresses(addresses.fingerprint().to_string());
            self.launch_watch(pass, &resolved.vm_ref, concern, addresses);
            return Ok(Action::AwaitChange);
        }

        if !pass.status.ready {
            info!(addresses = ?pass.status.addresses, "VM is ready");
        }
        pass.status.phase = VmPhase::Ready;
        pass.status.ready = true;
        pass.status
            .conditions
            .mark_true(NETWORK_READY, pass.now);
        pass.status.conditions.mark_true(READY, pass.now);
        Ok(Action::AwaitChange)
    }

    fn set_waiting_for_network(&self, pass: &mut Pass<'_>, reason: &str, message: &str) {
        pass.status.conditions.mark_false(
            NETWORK_READY,
            reason,
            Severity::Info,
            message,
            pass.now,
        );
        self.set_not_ready(pass, VmPhase::AwaitingNetwork, reason);
    }

    pub(super) fn set_not_ready(&self, pass: &mut Pass<'_>, phase: VmPhase, reason: &str) {
        pass.status.phase = phase;
        pass.status.ready = false;
        pass.status.conditions.mark_false(
            READY,
            reason,
            Severity::Info,
            format!("VM is {phase}"),
            pass.now,
        );
    }
}
