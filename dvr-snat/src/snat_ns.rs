//! The per-router SNAT namespace.
//!
//! ```text
//!   qrouter-<id>                          snat-<id>
//!  ┌──────────────────┐                 ┌──────────────────────┐
//!  │ qr-* (internal)  │                 │ sg-* (SNAT ports)    │
//!  │                  │  rfp-  snat2r-  │                      │
//!  │  table 18 ───────┼── .128 ── .129 ─┤ qg-* (gateway) ──────┼──> external
//!  └──────────────────┘                 └──────────────────────┘
//! ```
//!
//! Existence is always asked of the OS. The only cached state is the last
//! applied gateway addresses, used to skip redundant gateway updates.

use std::net::IpAddr;
use std::sync::Arc;

use dvr::{
    FirewallBackend, FixedIp, GatewayIps, InterfaceDriver, IpNetwork, IpVersion, PlugRequest,
    Port, Result, RouteEntry, RouteScope,
};
use tracing::{debug, info, warn};

use crate::config::SnatConfig;
use crate::link_local::{LinkLocalAddressPair, SNAT_RT_TBL};
use crate::nat::NatRuleManager;
use crate::naming::{
    DeviceNamer, EXTERNAL_DEV_PREFIX, SNAT_2_ROUTER_DEV_PREFIX, SNAT_INT_DEV_PREFIX, snat_ns_name,
};
use crate::priority::PriorityAllocator;

/// Subnet id reported for the synthetic link-local port.
pub const LINK_LOCAL_SUBNET_ID: &str = "0000-0000";

/// Whether a gateway update touched the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayChange {
    Applied,
    Unchanged,
}

pub struct SnatNamespace {
    router_id: String,
    name: String,
    driver: Arc<dyn InterfaceDriver>,
    config: Arc<SnatConfig>,
    namer: DeviceNamer,
    link: LinkLocalAddressPair,
    priorities: PriorityAllocator,
    nat: NatRuleManager,
    destroyed: bool,
    gateway_ips: Option<GatewayIps>,
}

impl std::fmt::Debug for SnatNamespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnatNamespace")
            .field("name", &self.name)
            .field("link", &self.link)
            .field("destroyed", &self.destroyed)
            .field("gateway_ips", &self.gateway_ips)
            .finish_non_exhaustive()
    }
}

impl SnatNamespace {
    pub fn new(
        router_id: &str,
        driver: Arc<dyn InterfaceDriver>,
        firewall: Arc<dyn FirewallBackend>,
        config: Arc<SnatConfig>,
        link: LinkLocalAddressPair,
    ) -> Self {
        let name = snat_ns_name(router_id);
        let namer = DeviceNamer::new(driver.dev_name_len());
        let nat = NatRuleManager::new(name.clone(), firewall, config.use_ipv6);
        Self {
            router_id: router_id.to_string(),
            name,
            driver,
            config,
            namer,
            link,
            priorities: PriorityAllocator::default(),
            nat,
            destroyed: false,
            gateway_ips: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn link(&self) -> LinkLocalAddressPair {
        self.link
    }

    pub fn nat(&self) -> &NatRuleManager {
        &self.nat
    }

    pub fn priorities(&self) -> &PriorityAllocator {
        &self.priorities
    }

    pub fn priorities_mut(&mut self) -> &mut PriorityAllocator {
        &mut self.priorities
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// Gateway addresses applied by the last gateway update, if any.
    pub fn recorded_gateway(&self) -> Option<GatewayIps> {
        self.gateway_ips
    }

    /// Router end of the router/SNAT link.
    pub fn router_to_snat_device(&self) -> String {
        self.namer.router_to_snat(&self.router_id)
    }

    /// SNAT end of the router/SNAT link.
    pub fn snat_to_router_device(&self) -> String {
        self.namer.snat_to_router(&self.router_id)
    }

    pub async fn exists(&self) -> bool {
        self.driver.namespace_exists(&self.name).await
    }

    /// Create the namespace with forwarding enabled. No-op if it exists.
    pub async fn create(&mut self) -> Result<()> {
        self.destroyed = false;
        if self.exists().await {
            debug!(namespace = %self.name, "SNAT namespace already exists");
            return Ok(());
        }
        self.driver.create_namespace(&self.name).await?;
        self.driver
            .set_sysctl(&self.name, "net.ipv4.ip_forward", "1")
            .await?;
        if self.config.use_ipv6 {
            self.driver
                .set_sysctl(&self.name, "net.ipv6.conf.all.forwarding", "1")
                .await?;
        }
        info!(namespace = %self.name, "SNAT namespace created");
        Ok(())
    }

    /// Wire the router namespace to this one with a veth pair.
    ///
    /// The pair is only created when the router end is missing; addresses and
    /// the table-18 default route are (re)applied either way so a partially
    /// built link is completed on retry.
    pub async fn create_rtr_2_snat_link(&self, router_ns: &str, gw_mtu: Option<u32>) -> Result<()> {
        let rtr_dev = self.router_to_snat_device();
        let snat_dev = self.snat_to_router_device();
        let (rtr_cidr, snat_cidr) = self.link.get_pair()?;
        debug!(router_id = %self.router_id, device = %rtr_dev, peer = %snat_dev, "creating SNAT link");

        if !self.driver.device_exists(&rtr_dev, router_ns).await {
            self.driver
                .add_veth(&rtr_dev, router_ns, &snat_dev, &self.name)
                .await?;
            if let Some(mtu) = self.config.network_device_mtu.or(gw_mtu) {
                self.driver.set_mtu(&rtr_dev, router_ns, mtu).await?;
                self.driver.set_mtu(&snat_dev, &self.name, mtu).await?;
            }
            self.driver.set_up(&rtr_dev, router_ns).await?;
            self.driver.set_up(&snat_dev, &self.name).await?;
        }

        self.add_cidr_to_device(&rtr_dev, router_ns, rtr_cidr).await?;
        self.add_cidr_to_device(&snat_dev, &self.name, snat_cidr)
            .await?;

        self.driver
            .add_gateway(
                router_ns,
                &rtr_dev,
                IpAddr::V4(self.link.snat_side()),
                Some(SNAT_RT_TBL),
            )
            .await
    }

    async fn add_cidr_to_device(&self, device: &str, namespace: &str, cidr: IpNetwork) -> Result<()> {
        let present = self
            .driver
            .list_addresses(device, namespace, Some(cidr))
            .await?;
        if present.is_empty() {
            self.driver.add_address(device, namespace, cidr).await?;
        }
        Ok(())
    }

    /// Plug the external gateway device into this namespace and configure it.
    pub async fn create_gateway_port(&mut self, port: &Port, device: &str) -> Result<()> {
        self.create().await?;
        self.plug_gateway(port, device).await?;

        let devices = self.driver.list_devices(&self.name).await?;
        for stale in devices
            .iter()
            .filter(|d| d.name.starts_with(EXTERNAL_DEV_PREFIX) && d.name != device)
        {
            info!(namespace = %self.name, device = %stale.name, "removing stale gateway device");
            if let Err(e) = self
                .driver
                .unplug(
                    &stale.name,
                    self.config.external_network_bridge.as_deref(),
                    &self.name,
                    EXTERNAL_DEV_PREFIX,
                )
                .await
            {
                warn!(device = %stale.name, error = %e, "failed to unplug stale gateway device");
            }
        }

        self.driver
            .init_l3(device, &port.ip_cidrs()?, &self.name, true)
            .await?;
        let key = format!("net.ipv4.conf.{device}.proxy_arp");
        self.driver.set_sysctl(&self.name, &key, "1").await?;

        self.gateway_ips = None;
        self.update_gateway_port(port, device).await?;
        Ok(())
    }

    /// Re-plumb the gateway in place, keeping every address already configured.
    pub async fn refresh_gateway_port(&mut self, port: &Port, device: &str) -> Result<GatewayChange> {
        self.plug_gateway(port, device).await?;
        for cidr in port.ip_cidrs()? {
            self.add_cidr_to_device(device, &self.name, cidr).await?;
        }
        self.update_gateway_port(port, device).await
    }

    /// Apply the gateway addresses of `port` unless they match the last applied ones.
    pub async fn update_gateway_port(&mut self, port: &Port, device: &str) -> Result<GatewayChange> {
        let gateway_ips = port.gateway_ips();
        if self.gateway_ips == Some(gateway_ips) {
            debug!(namespace = %self.name, "gateway addresses unchanged");
            return Ok(GatewayChange::Unchanged);
        }

        for fixed in &port.fixed_ips {
            self.advertise(device, fixed).await;
        }

        for subnet in &port.subnets {
            let Some(gateway) = subnet.gateway_ip else {
                continue;
            };
            if !subnet.cidr.contains(gateway) {
                let prefix = match IpVersion::of(gateway) {
                    IpVersion::V4 => 32,
                    IpVersion::V6 => 128,
                };
                let destination = IpNetwork::new(gateway, prefix)
                    .map_err(|e| dvr::DvrError::InvalidAddress(format!("{gateway}: {e}")))?;
                let route = RouteEntry {
                    destination,
                    via: None,
                    device: Some(device.to_string()),
                    table: None,
                    scope: Some(RouteScope::Link),
                };
                self.driver.add_route(&self.name, &route).await?;
            }
            self.driver
                .add_gateway(&self.name, device, gateway, None)
                .await?;
        }

        info!(namespace = %self.name, device = %device, "gateway configured");
        self.gateway_ips = Some(gateway_ips);
        Ok(GatewayChange::Applied)
    }

    async fn advertise(&self, device: &str, fixed: &FixedIp) {
        if let Err(e) = self
            .driver
            .send_address_advertisement(&self.name, device, fixed.ip_address)
            .await
        {
            warn!(device = %device, ip = %fixed.ip_address, error = %e, "address advertisement failed");
        }
    }

    async fn plug_gateway(&self, port: &Port, device: &str) -> Result<()> {
        self.driver
            .plug(&PlugRequest {
                network_id: &port.network_id,
                port_id: &port.id,
                device_name: device,
                mac_address: &port.mac_address,
                bridge: self.config.external_network_bridge.as_deref(),
                namespace: &self.name,
                prefix: EXTERNAL_DEV_PREFIX,
                mtu: self.config.network_device_mtu.or(port.mtu),
            })
            .await
    }

    /// The SNAT-side link address as a port, so internal traffic can be
    /// redirected to it like to any SNAT port.
    pub async fn local_snat_port(&self) -> Port {
        let snat_dev = self.snat_to_router_device();
        let mac = match self.driver.list_devices(&self.name).await {
            Ok(devices) => devices
                .into_iter()
                .find(|d| d.name == snat_dev)
                .and_then(|d| d.mac_address),
            Err(e) => {
                debug!(namespace = %self.name, error = %e, "cannot list SNAT devices");
                None
            }
        };
        Port {
            id: self.router_to_snat_device(),
            network_id: String::new(),
            mac_address: mac.unwrap_or_default(),
            fixed_ips: vec![FixedIp {
                subnet_id: LINK_LOCAL_SUBNET_ID.to_string(),
                ip_address: IpAddr::V4(self.link.snat_side()),
                prefixlen: 31,
            }],
            mtu: None,
            subnets: Vec::new(),
            address_scopes: Default::default(),
        }
    }

    /// Tear the namespace down. Every step is best effort.
    pub async fn delete(&mut self) {
        if self.destroyed && !self.exists().await {
            debug!(namespace = %self.name, "SNAT namespace already destroyed");
            return;
        }
        self.destroyed = true;
        self.gateway_ips = None;
        self.priorities.clear();

        if !self.exists().await {
            debug!(namespace = %self.name, "SNAT namespace does not exist");
            return;
        }

        match self.driver.list_devices(&self.name).await {
            Ok(devices) => {
                for device in devices {
                    let name = device.name.as_str();
                    let result = if name.starts_with(SNAT_INT_DEV_PREFIX) {
                        self.driver
                            .unplug(name, None, &self.name, SNAT_INT_DEV_PREFIX)
                            .await
                    } else if name.starts_with(EXTERNAL_DEV_PREFIX) {
                        self.driver
                            .unplug(
                                name,
                                self.config.external_network_bridge.as_deref(),
                                &self.name,
                                EXTERNAL_DEV_PREFIX,
                            )
                            .await
                    } else if name.starts_with(SNAT_2_ROUTER_DEV_PREFIX) {
                        self.driver.delete_veth(name, &self.name).await
                    } else {
                        Ok(())
                    };
                    if let Err(e) = result {
                        warn!(namespace = %self.name, device = %name, error = %e, "failed to remove device");
                    }
                }
            }
            Err(e) => warn!(namespace = %self.name, error = %e, "failed to list devices"),
        }

        match self.driver.delete_namespace(&self.name).await {
            Ok(()) => info!(namespace = %self.name, "SNAT namespace destroyed"),
            Err(e) => warn!(namespace = %self.name, error = %e, "failed to delete SNAT namespace"),
        }
    }
}

#[cfg(test)]
mod tests {
    use dvr::{AddressScopes, Subnet};

    use super::*;
    use crate::config::EdgeMode;
    use crate::testing::{FakeDriver, RecordingFirewall};

    const ROUTER_NS: &str = "qrouter-R1";

    fn setup(config: SnatConfig) -> (Arc<FakeDriver>, SnatNamespace) {
        let driver = Arc::new(FakeDriver::new());
        driver.seed_namespace(ROUTER_NS);
        let ns = SnatNamespace::new(
            "R1",
            driver.clone(),
            Arc::new(RecordingFirewall::new()),
            Arc::new(config),
            LinkLocalAddressPair::default(),
        );
        (driver, ns)
    }

    fn gw_port(mac: &str, gateway: &str) -> Port {
        Port {
            id: "gw1".into(),
            network_id: "ext".into(),
            mac_address: mac.into(),
            fixed_ips: vec![FixedIp {
                subnet_id: "ext4".into(),
                ip_address: "203.0.113.5".parse().unwrap(),
                prefixlen: 24,
            }],
            mtu: Some(1500),
            subnets: vec![Subnet {
                id: "ext4".into(),
                cidr: "203.0.113.0/24".parse().unwrap(),
                gateway_ip: Some(gateway.parse().unwrap()),
            }],
            address_scopes: AddressScopes::default(),
        }
    }

    #[tokio::test]
    async fn create_is_idempotent() {
        let (driver, mut ns) = setup(SnatConfig::new("hostA", EdgeMode::Local));
        ns.create().await.unwrap();
        let once = driver.state();
        ns.create().await.unwrap();
        let twice = driver.state();

        assert!(ns.exists().await);
        assert_eq!(once.namespaces, twice.namespaces);
        assert_eq!(once.sysctls, twice.sysctls);
        assert_eq!(twice.count_calls("create_namespace"), 1);
        assert_eq!(
            twice.sysctls[&("snat-R1".to_string(), "net.ipv6.conf.all.forwarding".to_string())],
            "1"
        );
    }

    #[tokio::test]
    async fn delete_twice_is_noop() {
        let (driver, mut ns) = setup(SnatConfig::new("hostA", EdgeMode::Local));
        ns.create().await.unwrap();
        ns.delete().await;
        let once = driver.state();
        ns.delete().await;
        let twice = driver.state();

        assert!(!ns.exists().await);
        assert!(ns.is_destroyed());
        assert_eq!(once.namespaces, twice.namespaces);
        assert_eq!(twice.count_calls("delete_namespace"), 1);
    }

    #[tokio::test]
    async fn delete_of_never_created_namespace_is_quiet() {
        let (driver, mut ns) = setup(SnatConfig::new("hostA", EdgeMode::Local));
        ns.delete().await;
        assert_eq!(driver.state().count_calls("delete_namespace"), 0);
    }

    #[tokio::test]
    async fn link_is_built_once() {
        let (driver, mut ns) = setup(SnatConfig::new("hostA", EdgeMode::Local));
        ns.create().await.unwrap();
        ns.create_rtr_2_snat_link(ROUTER_NS, Some(1450)).await.unwrap();
        ns.create_rtr_2_snat_link(ROUTER_NS, Some(1450)).await.unwrap();

        let state = driver.state();
        assert_eq!(state.count_calls("add_veth"), 1);
        assert_eq!(state.count_calls("add_address"), 2);

        let rfp = state.device(ROUTER_NS, "rfp-R1").unwrap();
        assert_eq!(rfp.addresses, vec!["169.254.128.128/31".parse::<IpNetwork>().unwrap()]);
        assert_eq!(rfp.mtu, Some(1450));
        assert!(rfp.up);
        let snat2r = state.device("snat-R1", "snat2r-R1").unwrap();
        assert_eq!(snat2r.addresses, vec!["169.254.128.129/31".parse::<IpNetwork>().unwrap()]);

        let gw = state
            .gateway(ROUTER_NS, Some(SNAT_RT_TBL), IpVersion::V4)
            .unwrap();
        assert_eq!(gw.0, "rfp-R1");
        assert_eq!(gw.1, IpAddr::V4(LinkLocalAddressPair::default().snat_side()));
    }

    #[tokio::test]
    async fn configured_mtu_wins_over_gateway_mtu() {
        let mut config = SnatConfig::new("hostA", EdgeMode::Local);
        config.network_device_mtu = Some(9000);
        let (driver, mut ns) = setup(config);
        ns.create().await.unwrap();
        ns.create_rtr_2_snat_link(ROUTER_NS, Some(1450)).await.unwrap();
        assert_eq!(driver.state().device("snat-R1", "snat2r-R1").unwrap().mtu, Some(9000));
    }

    #[tokio::test]
    async fn link_failure_propagates() {
        let (driver, mut ns) = setup(SnatConfig::new("hostA", EdgeMode::Local));
        ns.create().await.unwrap();
        driver.fail_on("add_veth");
        assert!(ns.create_rtr_2_snat_link(ROUTER_NS, None).await.is_err());
    }

    #[tokio::test]
    async fn gateway_port_replaces_stale_device() {
        let (driver, mut ns) = setup(SnatConfig::new("hostA", EdgeMode::Local));
        driver.seed_device("snat-R1", "qg-oldport");
        ns.create_gateway_port(&gw_port("fa:16:3e:00:00:10", "203.0.113.1"), "qg-gw1")
            .await
            .unwrap();

        let state = driver.state();
        assert!(state.device("snat-R1", "qg-oldport").is_none());
        let qg = state.device("snat-R1", "qg-gw1").unwrap();
        assert_eq!(qg.addresses, vec!["203.0.113.5/24".parse::<IpNetwork>().unwrap()]);
        assert_eq!(
            state.sysctls[&("snat-R1".to_string(), "net.ipv4.conf.qg-gw1.proxy_arp".to_string())],
            "1"
        );
        assert_eq!(
            state.gateway("snat-R1", None, IpVersion::V4).unwrap().1,
            "203.0.113.1".parse::<IpAddr>().unwrap()
        );
        assert_eq!(state.advertisements.len(), 1);
    }

    #[tokio::test]
    async fn unchanged_gateway_skips_all_work() {
        let (driver, mut ns) = setup(SnatConfig::new("hostA", EdgeMode::Local));
        ns.create_gateway_port(&gw_port("fa:16:3e:00:00:10", "203.0.113.1"), "qg-gw1")
            .await
            .unwrap();
        driver.clear_calls();

        let change = ns
            .update_gateway_port(&gw_port("fa:16:3e:00:00:99", "203.0.113.1"), "qg-gw1")
            .await
            .unwrap();
        assert_eq!(change, GatewayChange::Unchanged);
        let state = driver.state();
        assert_eq!(state.count_calls("add_gateway"), 0);
        assert_eq!(state.count_calls("add_route"), 0);
        assert_eq!(state.count_calls("send_address_advertisement"), 0);
    }

    #[tokio::test]
    async fn gateway_outside_subnet_gets_link_route() {
        let (driver, mut ns) = setup(SnatConfig::new("hostA", EdgeMode::Local));
        ns.create_gateway_port(&gw_port("fa:16:3e:00:00:10", "198.51.100.1"), "qg-gw1")
            .await
            .unwrap();

        let state = driver.state();
        let (_, route) = state
            .routes
            .iter()
            .find(|(ns, _)| ns == "snat-R1")
            .unwrap();
        assert_eq!(route.destination.to_string(), "198.51.100.1/32");
        assert_eq!(route.scope, Some(RouteScope::Link));
        assert_eq!(route.device.as_deref(), Some("qg-gw1"));
    }

    #[tokio::test]
    async fn refresh_keeps_existing_addresses() {
        let (driver, mut ns) = setup(SnatConfig::new("hostA", EdgeMode::Local));
        ns.create_gateway_port(&gw_port("fa:16:3e:00:00:10", "203.0.113.1"), "qg-gw1")
            .await
            .unwrap();
        driver
            .add_address("qg-gw1", "snat-R1", "203.0.113.77/24".parse().unwrap())
            .await
            .unwrap();

        let change = ns
            .refresh_gateway_port(&gw_port("fa:16:3e:00:00:10", "203.0.113.254"), "qg-gw1")
            .await
            .unwrap();
        assert_eq!(change, GatewayChange::Applied);
        let qg = driver.state().device("snat-R1", "qg-gw1").unwrap().clone();
        assert_eq!(qg.addresses.len(), 2);
    }

    #[tokio::test]
    async fn delete_removes_devices_and_peer() {
        let (driver, mut ns) = setup(SnatConfig::new("hostA", EdgeMode::Local));
        ns.create_gateway_port(&gw_port("fa:16:3e:00:00:10", "203.0.113.1"), "qg-gw1")
            .await
            .unwrap();
        ns.create_rtr_2_snat_link(ROUTER_NS, None).await.unwrap();
        driver.seed_device("snat-R1", "sg-port1");

        ns.delete().await;

        let state = driver.state();
        assert!(!state.namespaces.contains("snat-R1"));
        assert!(state.device(ROUTER_NS, "rfp-R1").is_none());
        assert_eq!(state.count_calls("delete_veth"), 1);
        assert!(ns.recorded_gateway().is_none());
    }

    #[tokio::test]
    async fn delete_survives_device_failures() {
        let (driver, mut ns) = setup(SnatConfig::new("hostA", EdgeMode::Local));
        ns.create().await.unwrap();
        ns.create_rtr_2_snat_link(ROUTER_NS, None).await.unwrap();
        driver.fail_on("delete_veth");

        ns.delete().await;
        assert!(!ns.exists().await);
    }

    #[tokio::test]
    async fn local_snat_port_points_at_link() {
        let (_driver, mut ns) = setup(SnatConfig::new("hostA", EdgeMode::Local));
        ns.create().await.unwrap();
        ns.create_rtr_2_snat_link(ROUTER_NS, None).await.unwrap();

        let port = ns.local_snat_port().await;
        assert_eq!(port.id, "rfp-R1");
        assert!(!port.mac_address.is_empty());
        assert_eq!(
            port.first_ip(IpVersion::V4).unwrap().ip_address,
            IpAddr::V4(ns.link().snat_side())
        );
    }
}
