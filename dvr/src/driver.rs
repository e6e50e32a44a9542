use std::net::IpAddr;

use async_trait::async_trait;
use ipnetwork::IpNetwork;

use crate::error::Result;

/// Longest interface name the kernel accepts, minus room for driver suffixes.
pub const DEV_NAME_LEN: usize = 14;

/// A network device as seen inside a namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub name: String,
    pub mac_address: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteScope {
    Link,
    Global,
}

/// Everything needed to attach a port's device to a namespace.
#[derive(Debug, Clone, Copy)]
pub struct PlugRequest<'a> {
    pub network_id: &'a str,
    pub port_id: &'a str,
    pub device_name: &'a str,
    pub mac_address: &'a str,
    pub bridge: Option<&'a str>,
    pub namespace: &'a str,
    pub prefix: &'a str,
    pub mtu: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RouteEntry {
    pub destination: IpNetwork,
    pub via: Option<IpAddr>,
    pub device: Option<String>,
    pub table: Option<u32>,
    pub scope: Option<RouteScope>,
}

impl RouteEntry {
    /// A plain `destination via nexthop` route in the main table.
    pub fn via(destination: IpNetwork, nexthop: IpAddr) -> Self {
        Self {
            destination,
            via: Some(nexthop),
            device: None,
            table: None,
            scope: None,
        }
    }
}

/// A policy routing rule: `from <from> lookup <table> priority <priority>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IpRule {
    pub from: IpNetwork,
    pub table: u32,
    pub priority: u32,
}

/// Namespace, device, route and neighbour operations.
///
/// Every call targets an explicit namespace. Existence queries never fail:
/// an absent namespace or device is simply reported as absent.
#[async_trait]
pub trait InterfaceDriver: Send + Sync {
    /// Maximum device name length accepted by this driver.
    fn dev_name_len(&self) -> usize {
        DEV_NAME_LEN
    }

    // -- namespaces --
    async fn namespace_exists(&self, name: &str) -> bool;
    async fn create_namespace(&self, name: &str) -> Result<()>;
    async fn delete_namespace(&self, name: &str) -> Result<()>;

    // -- ports --
    async fn plug(&self, request: &PlugRequest<'_>) -> Result<()>;
    async fn unplug(
        &self,
        device: &str,
        bridge: Option<&str>,
        namespace: &str,
        prefix: &str,
    ) -> Result<()>;
    /// Set the device's addresses to exactly `cidrs`.
    ///
    /// With `clean_connections`, conntrack state of removed addresses is flushed.
    async fn init_l3(
        &self,
        device: &str,
        cidrs: &[IpNetwork],
        namespace: &str,
        clean_connections: bool,
    ) -> Result<()>;

    // -- devices --
    async fn device_exists(&self, device: &str, namespace: &str) -> bool;
    /// Devices in `namespace`, loopback excluded.
    async fn list_devices(&self, namespace: &str) -> Result<Vec<Device>>;
    async fn add_veth(
        &self,
        device: &str,
        namespace: &str,
        peer: &str,
        peer_namespace: &str,
    ) -> Result<()>;
    async fn delete_veth(&self, device: &str, namespace: &str) -> Result<()>;
    async fn add_address(&self, device: &str, namespace: &str, cidr: IpNetwork) -> Result<()>;
    /// Addresses on `device`, optionally only those equal to `to`.
    async fn list_addresses(
        &self,
        device: &str,
        namespace: &str,
        to: Option<IpNetwork>,
    ) -> Result<Vec<IpNetwork>>;
    async fn set_mtu(&self, device: &str, namespace: &str, mtu: u32) -> Result<()>;
    async fn set_up(&self, device: &str, namespace: &str) -> Result<()>;

    // -- routes --
    /// Add or replace a route.
    async fn add_route(&self, namespace: &str, route: &RouteEntry) -> Result<()>;
    async fn delete_route(&self, namespace: &str, route: &RouteEntry) -> Result<()>;
    /// Replace the default route of `table` (main table when `None`).
    async fn add_gateway(
        &self,
        namespace: &str,
        device: &str,
        gateway: IpAddr,
        table: Option<u32>,
    ) -> Result<()>;
    async fn delete_gateway(
        &self,
        namespace: &str,
        device: &str,
        gateway: IpAddr,
        table: Option<u32>,
    ) -> Result<()>;

    // -- policy rules --
    /// Callers never add an identical rule twice. A kernel-backed driver still
    /// accepts a rule left by a previous run without error.
    async fn add_ip_rule(&self, namespace: &str, rule: &IpRule) -> Result<()>;
    async fn delete_ip_rule(&self, namespace: &str, rule: &IpRule) -> Result<()>;

    // -- neighbours --
    async fn add_neighbor(&self, namespace: &str, device: &str, ip: IpAddr, mac: &str)
    -> Result<()>;
    async fn delete_neighbor(
        &self,
        namespace: &str,
        device: &str,
        ip: IpAddr,
        mac: &str,
    ) -> Result<()>;

    // -- in-namespace processes --
    async fn set_sysctl(&self, namespace: &str, key: &str, value: &str) -> Result<()>;
    /// Send an unsolicited ARP (IPv4) or neighbour advertisement (IPv6) for `ip`.
    async fn send_address_advertisement(
        &self,
        namespace: &str,
        device: &str,
        ip: IpAddr,
    ) -> Result<()>;
}
