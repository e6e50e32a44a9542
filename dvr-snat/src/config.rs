/// Where a router's SNAT namespace lives relative to its router namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EdgeMode {
    /// SNAT namespace on one designated host, reached through SNAT ports.
    #[default]
    Centralized,
    /// SNAT namespace co-located with the router, wired by a veth link.
    Local,
}

#[derive(Debug, Clone)]
pub struct SnatConfig {
    /// Name of the local host, compared against `gw_port_host`.
    pub host: String,
    pub mode: EdgeMode,
    /// Bridge external gateway devices are attached to.
    pub external_network_bridge: Option<String>,
    /// MTU for agent-created devices. Falls back to the gateway port's MTU.
    pub network_device_mtu: Option<u32>,
    /// Also manage IPv6 forwarding and IPv6 firewall rules.
    pub use_ipv6: bool,
}

impl SnatConfig {
    pub fn new(host: impl Into<String>, mode: EdgeMode) -> Self {
        Self {
            host: host.into(),
            mode,
            external_network_bridge: None,
            network_device_mtu: None,
            use_ipv6: true,
        }
    }
}
