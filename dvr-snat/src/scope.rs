//! Address scope marks.
//!
//! Traffic entering a device is tagged with the mark of the device's address
//! scope; traffic leaving a device with a different mark is dropped. Marks
//! are recomputed on every call and never persisted.

use std::collections::BTreeMap;

use dvr::{AddressScopes, IpVersion, Port};

use crate::naming::DeviceNamer;

/// Scope of ports that belong to no address scope.
pub const DEFAULT_ADDRESS_SCOPE: &str = "noscope";
const SCOPE_ID_START: u32 = 1024;
const SCOPE_MASK: &str = "0xffff0000";

/// Maps address scope ids to firewall marks.
///
/// The same scope always gets the same mark for the lifetime of the
/// allocator.
#[derive(Debug, Default)]
pub struct ScopeMarkAllocator {
    ids: BTreeMap<String, u32>,
}

impl ScopeMarkAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// `"<hex(id << 16)>/0xffff0000"` for `scope` (default scope when `None`).
    pub fn mark(&mut self, scope: Option<&str>) -> String {
        let scope = scope.unwrap_or(DEFAULT_ADDRESS_SCOPE);
        let next = SCOPE_ID_START + u32::try_from(self.ids.len()).unwrap_or(u32::MAX >> 17);
        let id = *self.ids.entry(scope.to_string()).or_insert(next);
        format!("{:#x}/{SCOPE_MASK}", id << 16)
    }
}

/// A device of the SNAT namespace that carries internal traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnatInterface {
    pub device: String,
    pub scopes: AddressScopes,
}

/// Device name to mark, per IP version.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScopeMark {
    pub v4: BTreeMap<String, String>,
    pub v6: BTreeMap<String, String>,
}

impl ScopeMark {
    pub fn get(&self, version: IpVersion) -> &BTreeMap<String, String> {
        match version {
            IpVersion::V4 => &self.v4,
            IpVersion::V6 => &self.v6,
        }
    }

    fn get_mut(&mut self, version: IpVersion) -> &mut BTreeMap<String, String> {
        match version {
            IpVersion::V4 => &mut self.v4,
            IpVersion::V6 => &mut self.v6,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.v4.is_empty() && self.v6.is_empty()
    }
}

/// Merge the marks of every internal port, SNAT interface and the external port.
///
/// Internal ports are keyed by their `qr-` device. SNAT interfaces are merged
/// in under their own device; when several share one device the first keeps
/// it. The external port's IPv4 mark is written last and wins.
pub fn compute(
    marks: &mut ScopeMarkAllocator,
    internal_ports: &[Port],
    snat_interfaces: &[SnatInterface],
    external_port: Option<&Port>,
    namer: &DeviceNamer,
) -> ScopeMark {
    let mut result = ScopeMark::default();

    for port in internal_ports {
        let device = namer.internal(&port.id);
        for version in [IpVersion::V4, IpVersion::V6] {
            let mark = marks.mark(port.address_scopes.get(version));
            result.get_mut(version).insert(device.clone(), mark);
        }
    }

    for iface in snat_interfaces {
        for version in [IpVersion::V4, IpVersion::V6] {
            let mark = marks.mark(iface.scopes.get(version));
            result
                .get_mut(version)
                .entry(iface.device.clone())
                .or_insert(mark);
        }
    }

    if let Some(port) = external_port {
        let device = namer.external(&port.id);
        let mark = marks.mark(port.address_scopes.get(IpVersion::V4));
        result.v4.insert(device, mark);
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn port(id: &str, v4: Option<&str>, v6: Option<&str>) -> Port {
        Port {
            id: id.into(),
            network_id: "net".into(),
            mac_address: "fa:16:3e:00:00:01".into(),
            fixed_ips: Vec::new(),
            mtu: None,
            subnets: Vec::new(),
            address_scopes: AddressScopes {
                v4: v4.map(String::from),
                v6: v6.map(String::from),
            },
        }
    }

    #[test]
    fn marks_start_at_1024_and_are_stable() {
        let mut marks = ScopeMarkAllocator::new();
        assert_eq!(marks.mark(None), "0x4000000/0xffff0000");
        assert_eq!(marks.mark(Some("scope-a")), "0x4010000/0xffff0000");
        assert_eq!(marks.mark(Some(DEFAULT_ADDRESS_SCOPE)), "0x4000000/0xffff0000");
        assert_eq!(marks.mark(Some("scope-a")), "0x4010000/0xffff0000");
    }

    #[test]
    fn internal_ports_keyed_by_device() {
        let mut marks = ScopeMarkAllocator::new();
        let namer = DeviceNamer::default();
        let ports = [port("p1", Some("a"), None), port("p2", None, Some("b"))];
        let result = compute(&mut marks, &ports, &[], None, &namer);

        assert_eq!(result.v4.len(), 2);
        assert_eq!(result.v6.len(), 2);
        assert_ne!(result.v4["qr-p1"], result.v4["qr-p2"]);
        assert_eq!(result.v6["qr-p1"], marks.mark(None));
    }

    #[test]
    fn external_overrides_v4_only() {
        let mut marks = ScopeMarkAllocator::new();
        let namer = DeviceNamer::default();
        let snat = [SnatInterface {
            device: "qg-gw".into(),
            scopes: AddressScopes::default(),
        }];
        let gw = port("gw", Some("public"), Some("public6"));
        let result = compute(&mut marks, &[], &snat, Some(&gw), &namer);

        assert_eq!(result.v4["qg-gw"], marks.mark(Some("public")));
        assert_eq!(result.v6["qg-gw"], marks.mark(None));
    }

    #[test]
    fn shared_snat_device_keeps_first_mark() {
        let mut marks = ScopeMarkAllocator::new();
        let namer = DeviceNamer::default();
        let snat = [
            SnatInterface {
                device: "snat2r-r1".into(),
                scopes: AddressScopes {
                    v4: Some("a".into()),
                    v6: None,
                },
            },
            SnatInterface {
                device: "snat2r-r1".into(),
                scopes: AddressScopes {
                    v4: Some("b".into()),
                    v6: None,
                },
            },
        ];
        let result = compute(&mut marks, &[], &snat, None, &namer);
        assert_eq!(result.v4["snat2r-r1"], marks.mark(Some("a")));
    }

    #[test]
    fn nothing_in_nothing_out() {
        let mut marks = ScopeMarkAllocator::new();
        let result = compute(&mut marks, &[], &[], None, &DeviceNamer::default());
        assert!(result.is_empty());
    }
}
