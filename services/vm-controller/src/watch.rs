//! Property-watch multiplexer.
//!
//! A watch subscribes to a set of property paths on one VM, folds every
//! change batch into a [`WatchSnapshot`], and evaluates a
//! [`CompletionPredicate`] against the whole snapshot after each batch.
//! Delivery may be batched, duplicated or reordered; since the predicate
//! never sees a delta, none of that changes the outcome.

use std::collections::HashSet;
use std::net::IpAddr;

use serde::Serialize;
use vmctl_reconcile::SpecHash;

use crate::remote::{
    GuestNicInfo, NicInfo, PowerState, PropertyChange, PropertyCollector, PropertyPath,
    PropertyValue, RemoteError, VmProperties, VmRef,
};
use crate::resource::NetworkDeviceSpec;

/// Aggregate state of the watched properties.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchSnapshot {
    pub power_state: Option<PowerState>,
    pub nics: Option<Vec<NicInfo>>,
    pub guest_net: Option<Vec<GuestNicInfo>>,
}

impl WatchSnapshot {
    pub fn from_properties(props: &VmProperties) -> Self {
        Self {
            power_state: Some(props.power_state),
            nics: Some(props.nics.clone()),
            guest_net: Some(props.guest_net.clone()),
        }
    }

    /// Fold one change into the snapshot.
    pub fn apply(&mut self, change: &PropertyChange) {
        match &change.value {
            PropertyValue::PowerState(state) => self.power_state = Some(*state),
            PropertyValue::Nics(nics) => self.nics = Some(nics.clone()),
            PropertyValue::GuestNet(net) => self.guest_net = Some(net.clone()),
        }
    }

    /// Routable addresses the guest reports for `mac`.
    pub fn routable_addresses(&self, mac: &str) -> Vec<IpAddr> {
        self.guest_net
            .iter()
            .flatten()
            .filter(|g| g.mac_addr.eq_ignore_ascii_case(mac))
            .flat_map(|g| g.ip_addrs.iter().copied())
            .filter(is_routable)
            .collect()
    }
}

/// Decides when a watch is done.
pub trait CompletionPredicate: Send + Sync {
    /// Properties the predicate reads.
    fn paths(&self) -> &'static [PropertyPath];

    fn is_complete(&self, snapshot: &WatchSnapshot) -> bool;
}

/// Every declared NIC has a MAC address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacsAssigned {
    pub expected: usize,
}

impl CompletionPredicate for MacsAssigned {
    fn paths(&self) -> &'static [PropertyPath] {
        &[PropertyPath::Nics]
    }

    fn is_complete(&self, snapshot: &WatchSnapshot) -> bool {
        snapshot.nics.as_ref().is_some_and(|nics| {
            nics.len() >= self.expected && nics.iter().all(|n| !n.mac_addr.is_empty())
        })
    }
}

/// Addresses one device must acquire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRequirement {
    pub mac: String,
    pub static_ips: Vec<IpAddr>,
    /// Declared static entries that are not addresses. Never satisfied.
    pub invalid_static: Vec<String>,
    pub dhcp4: bool,
    pub dhcp6: bool,
}

impl DeviceRequirement {
    pub fn from_spec(spec: &NetworkDeviceSpec, mac: impl Into<String>) -> Self {
        Self {
            mac: mac.into(),
            static_ips: spec.static_ips(),
            invalid_static: spec.invalid_ips().into_iter().map(String::from).collect(),
            dhcp4: spec.dhcp4,
            dhcp6: spec.dhcp6,
        }
    }

    /// Each requested kind of address has at least one match in `observed`.
    pub fn is_satisfied(&self, observed: &[IpAddr]) -> bool {
        if !self.invalid_static.is_empty() {
            return false;
        }
        let static_ok =
            self.static_ips.is_empty() || observed.iter().any(|ip| self.static_ips.contains(ip));
        let dhcp4_ok = !self.dhcp4 || observed.iter().any(IpAddr::is_ipv4);
        let dhcp6_ok = !self.dhcp6 || observed.iter().any(IpAddr::is_ipv6);
        static_ok && dhcp4_ok && dhcp6_ok
    }
}

/// Every device requirement is met by routable guest addresses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AddressesReady {
    pub devices: Vec<DeviceRequirement>,
}

impl AddressesReady {
    /// Declared static entries that can never match, across all devices.
    pub fn invalid_static(&self) -> Vec<&str> {
        self.devices
            .iter()
            .flat_map(|d| d.invalid_static.iter().map(String::as_str))
            .collect()
    }

    /// Stable hash of the requirements, used to tell waits for different
    /// requirement sets apart.
    pub fn fingerprint(&self) -> SpecHash {
        SpecHash::from_json(&serde_json::json!(self))
    }

    /// Pair device specs with the MACs of the VM's NICs, in order. A spec's
    /// fixed MAC wins over the observed one.
    pub fn for_devices(specs: &[NetworkDeviceSpec], nics: &[NicInfo]) -> Self {
        let devices = specs
            .iter()
            .enumerate()
            .map(|(i, spec)| {
                let mac = spec
                    .mac_addr
                    .clone()
                    .or_else(|| nics.get(i).map(|n| n.mac_addr.clone()))
                    .unwrap_or_default();
                DeviceRequirement::from_spec(spec, mac)
            })
            .collect();
        Self { devices }
    }
}

impl CompletionPredicate for AddressesReady {
    fn paths(&self) -> &'static [PropertyPath] {
        &[PropertyPath::GuestNet]
    }

    fn is_complete(&self, snapshot: &WatchSnapshot) -> bool {
        self.devices
            .iter()
            .all(|d| d.is_satisfied(&snapshot.routable_addresses(&d.mac)))
    }
}

/// Power state reached a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PowerStateIs(pub PowerState);

impl CompletionPredicate for PowerStateIs {
    fn paths(&self) -> &'static [PropertyPath] {
        &[PropertyPath::PowerState]
    }

    fn is_complete(&self, snapshot: &WatchSnapshot) -> bool {
        snapshot.power_state == Some(self.0)
    }
}

/// Progress observed while a watch runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    MacAssigned { mac: String },
    AddressDiscovered { mac: String, address: IpAddr },
    PowerStateChanged(PowerState),
}

/// False for link-local, loopback, unspecified and multicast addresses.
pub fn is_routable(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            !(v4.is_link_local()
                || v4.is_loopback()
                || v4.is_unspecified()
                || v4.is_multicast()
                || v4.is_broadcast())
        }
        IpAddr::V6(v6) => {
            let link_local = (v6.segments()[0] & 0xffc0) == 0xfe80;
            !(link_local || v6.is_loopback() || v6.is_unspecified() || v6.is_multicast())
        }
    }
}

/// Tracks what has already been reported so each discovery fires once.
#[derive(Debug, Default)]
struct Discovery {
    macs: HashSet<String>,
    addresses: HashSet<(String, IpAddr)>,
    power_state: Option<PowerState>,
}

impl Discovery {
    fn diff(&mut self, snapshot: &WatchSnapshot) -> Vec<WatchEvent> {
        let mut events = Vec::new();

        if let Some(state) = snapshot.power_state {
            if self.power_state != Some(state) {
                self.power_state = Some(state);
                events.push(WatchEvent::PowerStateChanged(state));
            }
        }

        for nic in snapshot.nics.iter().flatten() {
            if !nic.mac_addr.is_empty() && self.macs.insert(nic.mac_addr.clone()) {
                events.push(WatchEvent::MacAssigned {
                    mac: nic.mac_addr.clone(),
                });
            }
        }

        for guest in snapshot.guest_net.iter().flatten() {
            for ip in guest.ip_addrs.iter().filter(|ip| is_routable(ip)) {
                if self.addresses.insert((guest.mac_addr.clone(), *ip)) {
                    events.push(WatchEvent::AddressDiscovered {
                        mac: guest.mac_addr.clone(),
                        address: *ip,
                    });
                }
            }
        }

        events
    }
}

/// Watch `vm` until `predicate` holds on the aggregate state.
///
/// `progress` is called for every newly observed MAC, routable address and
/// power state. Transport errors end the watch and are returned as-is.
pub async fn watch_until<C, P, F>(
    collector: &C,
    vm: &VmRef,
    predicate: &P,
    mut progress: F,
) -> Result<WatchSnapshot, RemoteError>
where
    C: PropertyCollector + ?Sized,
    P: CompletionPredicate + ?Sized,
    F: FnMut(WatchEvent) + Send,
{
    let mut snapshot = WatchSnapshot::default();
    let mut discovery = Discovery::default();

    {
        let mut on_change = |batch: &[PropertyChange]| -> bool {
            for change in batch {
                snapshot.apply(change);
            }
            for event in discovery.diff(&snapshot) {
                progress(event);
            }
            predicate.is_complete(&snapshot)
        };
        collector
            .wait(vm, predicate.paths(), &mut on_change)
            .await?;
    }

    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use rstest::rstest;

    use crate::remote::{CloneSpec, MockProvider, Operation, RemoteApi};

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn guest(mac: &str, ips: &[&str]) -> WatchSnapshot {
        WatchSnapshot {
            guest_net: Some(vec![GuestNicInfo {
                mac_addr: mac.to_string(),
                ip_addrs: ips.iter().map(|s| ip(s)).collect(),
            }]),
            ..Default::default()
        }
    }

    #[rstest]
    #[case("10.0.0.5", true)]
    #[case("2001:db8::1", true)]
    #[case("fd00::1", true)]
    #[case("169.254.10.1", false)]
    #[case("fe80::1", false)]
    #[case("febf::1", false)]
    #[case("127.0.0.1", false)]
    #[case("::1", false)]
    #[case("0.0.0.0", false)]
    #[case("ff02::1", false)]
    fn test_is_routable(#[case] addr: &str, #[case] expected: bool) {
        assert_eq!(is_routable(&ip(addr)), expected);
    }

    #[test]
    fn test_link_local_only_does_not_satisfy_dhcp6() {
        let pred = AddressesReady {
            devices: vec![DeviceRequirement {
                mac: "00:50:56:00:00:01".to_string(),
                static_ips: vec![],
                invalid_static: vec![],
                dhcp4: false,
                dhcp6: true,
            }],
        };
        assert!(!pred.is_complete(&guest("00:50:56:00:00:01", &["fe80::1"])));
        assert!(pred.is_complete(&guest("00:50:56:00:00:01", &["fe80::1", "2001:db8::7"])));
    }

    #[test]
    fn test_static_requirement_needs_match() {
        let pred = AddressesReady {
            devices: vec![DeviceRequirement {
                mac: "00:50:56:00:00:01".to_string(),
                static_ips: vec![ip("10.0.0.5")],
                invalid_static: vec![],
                dhcp4: false,
                dhcp6: false,
            }],
        };
        assert!(!pred.is_complete(&guest("00:50:56:00:00:01", &["10.0.0.6"])));
        assert!(pred.is_complete(&guest("00:50:56:00:00:01", &["10.0.0.5"])));
        // Addresses on a different NIC do not count.
        assert!(!pred.is_complete(&guest("00:50:56:00:00:02", &["10.0.0.5"])));
    }

    #[test]
    fn test_unparseable_static_address_is_never_satisfied() {
        let pred = AddressesReady::for_devices(
            &[NetworkDeviceSpec {
                network_name: "vm-net".to_string(),
                mac_addr: Some("00:50:56:00:00:01".to_string()),
                ip_addrs: vec!["10.20.0.300/24".to_string()],
                ..Default::default()
            }],
            &[],
        );
        assert!(pred.devices[0].static_ips.is_empty());
        assert_eq!(pred.invalid_static(), vec!["10.20.0.300/24"]);
        assert!(!pred.is_complete(&WatchSnapshot::default()));
        assert!(!pred.is_complete(&guest("00:50:56:00:00:01", &["10.20.0.30"])));
    }

    #[test]
    fn test_fingerprint_tracks_requirements() {
        let device = |ips: &[&str]| NetworkDeviceSpec {
            network_name: "vm-net".to_string(),
            mac_addr: Some("00:50:56:00:00:01".to_string()),
            ip_addrs: ips.iter().map(ToString::to_string).collect(),
            ..Default::default()
        };
        let a = AddressesReady::for_devices(&[device(&["10.0.0.5/24"])], &[]);
        let b = AddressesReady::for_devices(&[device(&["10.0.0.5/24"])], &[]);
        let c = AddressesReady::for_devices(&[device(&["10.0.0.6/24"])], &[]);
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn test_mac_comparison_ignores_case() {
        let pred = AddressesReady {
            devices: vec![DeviceRequirement {
                mac: "00:50:56:AA:BB:CC".to_string(),
                static_ips: vec![],
                invalid_static: vec![],
                dhcp4: true,
                dhcp6: false,
            }],
        };
        assert!(pred.is_complete(&guest("00:50:56:aa:bb:cc", &["10.1.2.3"])));
    }

    #[test]
    fn test_device_without_requirements_is_satisfied() {
        let pred = AddressesReady::for_devices(
            &[NetworkDeviceSpec {
                network_name: "mgmt".to_string(),
                ..Default::default()
            }],
            &[],
        );
        assert!(pred.is_complete(&WatchSnapshot::default()));
    }

    #[test]
    fn test_macs_assigned() {
        let pred = MacsAssigned { expected: 2 };
        let nic = |mac: &str| NicInfo {
            device_key: 4000,
            network_name: "n".to_string(),
            mac_addr: mac.to_string(),
        };

        let mut snapshot = WatchSnapshot::default();
        assert!(!pred.is_complete(&snapshot));
        snapshot.nics = Some(vec![nic("00:50:56:00:00:01"), nic("")]);
        assert!(!pred.is_complete(&snapshot));
        snapshot.nics = Some(vec![nic("00:50:56:00:00:01"), nic("00:50:56:00:00:02")]);
        assert!(pred.is_complete(&snapshot));
    }

    #[test]
    fn test_discovery_reports_each_address_once() {
        let mut discovery = Discovery::default();
        let first = discovery.diff(&guest("m1", &["10.0.0.5", "fe80::1"]));
        assert_eq!(
            first,
            vec![WatchEvent::AddressDiscovered {
                mac: "m1".to_string(),
                address: ip("10.0.0.5"),
            }]
        );

        // Redelivery of the same state reports nothing.
        assert!(discovery.diff(&guest("m1", &["10.0.0.5"])).is_empty());

        let second = discovery.diff(&guest("m1", &["10.0.0.5", "2001:db8::5"]));
        assert_eq!(second.len(), 1);
    }

    #[tokio::test]
    async fn test_watch_until_addresses_arrive() {
        let provider = Arc::new(MockProvider::new());
        provider.set_auto_guest_network(false);
        provider
            .submit(Operation::Clone(Box::new(CloneSpec {
                name: "web-0".to_string(),
                folder: "/dc1/vm".to_string(),
                template: "tmpl".to_string(),
                bios_uuid: "uuid-1".to_string(),
                num_cpus: 1,
                memory_mib: 1024,
                devices: vec![NetworkDeviceSpec {
                    network_name: "vm-net".to_string(),
                    dhcp4: true,
                    ..Default::default()
                }],
                bootstrap: None,
            })))
            .await
            .unwrap();
        let vm = provider.vm_named("web-0").unwrap();
        let props = provider.properties(&vm).await.unwrap().unwrap();
        let mac = props.nics[0].mac_addr.clone();
        let pred = AddressesReady::for_devices(
            &[NetworkDeviceSpec {
                network_name: "vm-net".to_string(),
                dhcp4: true,
                ..Default::default()
            }],
            &props.nics,
        );

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let watcher = tokio::spawn({
            let provider = Arc::clone(&provider);
            let vm = vm.clone();
            async move {
                watch_until(provider.as_ref(), &vm, &pred, |e| {
                    let _ = tx.send(e);
                })
                .await
            }
        });

        tokio::task::yield_now().await;
        provider.set_guest_addresses(&vm, &mac, &["fe80::250:56ff:fe00:1"]);
        provider.set_guest_addresses(&vm, &mac, &["fe80::250:56ff:fe00:1", "10.0.0.9"]);

        let snapshot = watcher.await.unwrap().unwrap();
        assert_eq!(snapshot.routable_addresses(&mac), vec![ip("10.0.0.9")]);

        let mut events = Vec::new();
        while let Ok(e) = rx.try_recv() {
            events.push(e);
        }
        assert_eq!(
            events,
            vec![WatchEvent::AddressDiscovered {
                mac,
                address: ip("10.0.0.9"),
            }]
        );
    }

    #[tokio::test]
    async fn test_watch_until_forwards_deletion() {
        let provider = Arc::new(MockProvider::new());
        provider
            .submit(Operation::Clone(Box::new(CloneSpec {
                name: "web-0".to_string(),
                folder: "/dc1/vm".to_string(),
                template: "tmpl".to_string(),
                bios_uuid: "uuid-1".to_string(),
                num_cpus: 1,
                memory_mib: 1024,
                devices: vec![],
                bootstrap: None,
            })))
            .await
            .unwrap();
        let vm = provider.vm_named("web-0").unwrap();

        let watcher = tokio::spawn({
            let provider = Arc::clone(&provider);
            let vm = vm.clone();
            async move {
                watch_until(
                    provider.as_ref(),
                    &vm,
                    &PowerStateIs(PowerState::PoweredOn),
                    |_| {},
                )
                .await
            }
        });

        tokio::task::yield_now().await;
        provider.remove_vm_out_of_band("web-0");

        let err = watcher.await.unwrap().unwrap_err();
        assert!(matches!(err, RemoteError::WatchClosed(_)));
    }
}
