//! Router and port snapshots as delivered by the control plane.
//!
//! The core treats these as read-mostly values for the duration of one
//! event. Field names follow the control-plane payloads so snapshots can be
//! deserialized directly.

use std::net::IpAddr;

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};

use crate::error::{DvrError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum IpVersion {
    V4,
    V6,
}

impl IpVersion {
    pub fn of(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => Self::V4,
            IpAddr::V6(_) => Self::V6,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixedIp {
    pub subnet_id: String,
    pub ip_address: IpAddr,
    pub prefixlen: u8,
}

impl FixedIp {
    /// The address with its prefix, e.g. `10.0.0.5/24`.
    pub fn cidr(&self) -> Result<IpNetwork> {
        IpNetwork::new(self.ip_address, self.prefixlen)
            .map_err(|e| DvrError::InvalidAddress(format!("{}/{}: {e}", self.ip_address, self.prefixlen)))
    }

    /// The network the address lives in, e.g. `10.0.0.0/24`.
    pub fn network(&self) -> Result<IpNetwork> {
        let cidr = self.cidr()?;
        IpNetwork::new(cidr.network(), cidr.prefix())
            .map_err(|e| DvrError::InvalidAddress(format!("{cidr}: {e}")))
    }

    pub fn version(&self) -> IpVersion {
        IpVersion::of(self.ip_address)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subnet {
    pub id: String,
    pub cidr: IpNetwork,
    #[serde(default)]
    pub gateway_ip: Option<IpAddr>,
}

/// Address scope ids of a port, per IP version.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressScopes {
    #[serde(default)]
    pub v4: Option<String>,
    #[serde(default)]
    pub v6: Option<String>,
}

impl AddressScopes {
    pub fn get(&self, version: IpVersion) -> Option<&str> {
        match version {
            IpVersion::V4 => self.v4.as_deref(),
            IpVersion::V6 => self.v6.as_deref(),
        }
    }
}

/// Per-version gateway addresses of a port's subnets.
///
/// Used to detect whether an external gateway update actually moved the
/// gateway, as opposed to touching unrelated port fields.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GatewayIps {
    pub v4: Option<IpAddr>,
    pub v6: Option<IpAddr>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Port {
    pub id: String,
    pub network_id: String,
    pub mac_address: String,
    #[serde(default)]
    pub fixed_ips: Vec<FixedIp>,
    #[serde(default)]
    pub mtu: Option<u32>,
    #[serde(default)]
    pub subnets: Vec<Subnet>,
    #[serde(default)]
    pub address_scopes: AddressScopes,
}

impl Port {
    /// All fixed IPs with their prefix length.
    pub fn ip_cidrs(&self) -> Result<Vec<IpNetwork>> {
        self.fixed_ips.iter().map(FixedIp::cidr).collect()
    }

    /// Subnet id of the first fixed IP; this is what SNAT ports are matched on.
    pub fn first_subnet_id(&self) -> Option<&str> {
        self.fixed_ips.first().map(|ip| ip.subnet_id.as_str())
    }

    pub fn first_ip(&self, version: IpVersion) -> Option<&FixedIp> {
        self.fixed_ips.iter().find(|ip| ip.version() == version)
    }

    pub fn gateway_ips(&self) -> GatewayIps {
        let mut ips = GatewayIps::default();
        for gw in self.subnets.iter().filter_map(|s| s.gateway_ip) {
            let slot = match IpVersion::of(gw) {
                IpVersion::V4 => &mut ips.v4,
                IpVersion::V6 => &mut ips.v6,
            };
            if slot.is_none() {
                *slot = Some(gw);
            }
        }
        ips
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub destination: IpNetwork,
    pub nexthop: IpAddr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Router {
    pub id: String,
    /// Host the router is scheduled to.
    #[serde(default)]
    pub host: Option<String>,
    /// Host currently carrying the gateway port, i.e. the SNAT host.
    #[serde(default)]
    pub gw_port_host: Option<String>,
    #[serde(default)]
    pub routes: Vec<Route>,
    #[serde(default)]
    pub interfaces: Vec<Port>,
    #[serde(default)]
    pub gw_port: Option<Port>,
    /// Centralized SNAT ports, one per internal subnet.
    #[serde(default)]
    pub snat_router_interfaces: Vec<Port>,
}

impl Router {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            host: None,
            gw_port_host: None,
            routes: Vec::new(),
            interfaces: Vec::new(),
            gw_port: None,
            snat_router_interfaces: Vec::new(),
        }
    }

    /// The SNAT port serving the subnet of `port`, matched on the first fixed IP.
    pub fn snat_port_for_internal_port(&self, port: &Port) -> Option<&Port> {
        let subnet_id = port.first_subnet_id()?;
        self.snat_router_interfaces
            .iter()
            .find(|sn| sn.first_subnet_id() == Some(subnet_id))
    }

    /// Internal port attached to `subnet_id`, if any.
    pub fn internal_port_for_subnet(&self, subnet_id: &str) -> Option<&Port> {
        self.interfaces
            .iter()
            .find(|p| p.fixed_ips.iter().any(|ip| ip.subnet_id == subnet_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed(subnet: &str, ip: &str, prefix: u8) -> FixedIp {
        FixedIp {
            subnet_id: subnet.into(),
            ip_address: ip.parse().unwrap(),
            prefixlen: prefix,
        }
    }

    fn port(id: &str, ips: Vec<FixedIp>) -> Port {
        Port {
            id: id.into(),
            network_id: "net".into(),
            mac_address: "fa:16:3e:00:00:01".into(),
            fixed_ips: ips,
            mtu: None,
            subnets: Vec::new(),
            address_scopes: AddressScopes::default(),
        }
    }

    #[test]
    fn fixed_ip_network_masks_host_bits() {
        let ip = fixed("s1", "10.0.0.5", 24);
        assert_eq!(ip.cidr().unwrap().to_string(), "10.0.0.5/24");
        assert_eq!(ip.network().unwrap().to_string(), "10.0.0.0/24");
    }

    #[test]
    fn fixed_ip_rejects_bad_prefix() {
        let ip = fixed("s1", "10.0.0.5", 40);
        assert!(matches!(ip.cidr(), Err(DvrError::InvalidAddress(_))));
    }

    #[test]
    fn gateway_ips_takes_first_per_version() {
        let mut p = port("p", vec![]);
        p.subnets = vec![
            Subnet {
                id: "a".into(),
                cidr: "10.0.0.0/24".parse().unwrap(),
                gateway_ip: Some("10.0.0.1".parse().unwrap()),
            },
            Subnet {
                id: "b".into(),
                cidr: "10.1.0.0/24".parse().unwrap(),
                gateway_ip: Some("10.1.0.1".parse().unwrap()),
            },
            Subnet {
                id: "c".into(),
                cidr: "2001:db8::/64".parse().unwrap(),
                gateway_ip: Some("2001:db8::1".parse().unwrap()),
            },
        ];
        let gw = p.gateway_ips();
        assert_eq!(gw.v4, Some("10.0.0.1".parse().unwrap()));
        assert_eq!(gw.v6, Some("2001:db8::1".parse().unwrap()));
    }

    #[test]
    fn snat_port_matched_on_first_subnet() {
        let mut router = Router::new("r1");
        router.snat_router_interfaces = vec![
            port("sn-a", vec![fixed("a", "10.0.0.3", 24)]),
            port("sn-b", vec![fixed("b", "10.1.0.3", 24)]),
        ];
        let internal = port("p", vec![fixed("b", "10.1.0.1", 24)]);
        let sn = router.snat_port_for_internal_port(&internal).unwrap();
        assert_eq!(sn.id, "sn-b");

        let orphan = port("q", vec![fixed("z", "10.9.0.1", 24)]);
        assert!(router.snat_port_for_internal_port(&orphan).is_none());
    }

    #[test]
    fn router_deserializes_with_defaults() {
        let router: Router = serde_json::from_str(r#"{"id": "r1"}"#).unwrap();
        assert_eq!(router, Router::new("r1"));
    }

    #[test]
    fn scheduled_host_is_kept_apart_from_gateway_host() {
        let router: Router =
            serde_json::from_str(r#"{"id": "r1", "host": "compute-1", "gw_port_host": "network-1"}"#)
                .unwrap();
        assert_eq!(router.host.as_deref(), Some("compute-1"));
        assert_eq!(router.gw_port_host.as_deref(), Some("network-1"));
    }
}
