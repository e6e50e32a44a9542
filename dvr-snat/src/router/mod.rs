//! The DVR edge router: gateway transitions and internal port plumbing.
//!
//! One [`DvrEdgeRouter`] exists per router per host. Its operations must be
//! serialized by the caller; the router itself holds no locks. Placement
//! decisions are re-derived on every event from the router snapshot and
//! from namespace existence on the host.

mod centralized;
mod local_edge;
mod transition;

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use dvr::{
    FirewallBackend, InterfaceDriver, PlugRequest, Port, Result, Route, Router, RouterAgent,
};
use tracing::{Instrument, Span, debug, error, info, info_span, warn};

use crate::arp::{ArpCache, ArpEntry, ArpOperation, ArpUpdate};
use crate::config::{EdgeMode, SnatConfig};
use crate::host;
use crate::link_local::LinkLocalAddressPair;
use crate::nat::NatRuleManager;
use crate::naming::{
    DeviceNamer, EXTERNAL_DEV_PREFIX, INTERNAL_DEV_PREFIX, SNAT_INT_DEV_PREFIX, router_ns_name,
};
use crate::redirect::{self, RedirectTarget, SnatRedirect};
use crate::routes::{self, RouteOperation, RouteTargets};
use crate::scope::{self, ScopeMark, ScopeMarkAllocator, SnatInterface};
use crate::snat_ns::SnatNamespace;

pub use centralized::CentralizedEdge;
pub use local_edge::LocalEdge;
pub use transition::{GatewayPlan, plan_gateway_update};

/// Where SNAT for a router currently lives, seen from this host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayState {
    NoGateway,
    CentralizedRemote,
    CentralizedLocal,
    LocalRemote,
    LocalLocal,
}

/// Behaviour that differs between the centralized-edge and local-edge deployments.
#[async_trait]
pub trait SnatVariant: Send + Sync {
    fn mode(&self) -> EdgeMode;

    /// Build SNAT on this host for a new gateway.
    async fn create_gateway(&self, ctx: &mut RouterContext, port: &Port, device: &str) -> Result<()>;

    /// Re-plumb an existing local SNAT gateway in place.
    async fn update_gateway(&self, ctx: &mut RouterContext, port: &Port, device: &str) -> Result<()>;

    /// Tear down local SNAT for the gateway.
    async fn remove_gateway(&self, ctx: &mut RouterContext, port: &Port, device: &str) -> Result<()>;

    async fn internal_port_added(&self, ctx: &mut RouterContext, port: &Port) -> Result<()>;

    async fn internal_port_removed(&self, ctx: &mut RouterContext, port: &Port) -> Result<()>;

    /// SNAT namespace devices that carry internal traffic.
    fn snat_interfaces_for(&self, ctx: &RouterContext) -> Vec<SnatInterface>;

    /// SNAT next hop for `port`, if it has one.
    async fn redirect_target(&self, ctx: &RouterContext, port: &Port) -> Option<RedirectTarget>;
}

/// Per-router state shared by both deployment variants.
pub struct RouterContext {
    router: Router,
    ns_name: String,
    config: Arc<SnatConfig>,
    driver: Arc<dyn InterfaceDriver>,
    agent: Arc<dyn RouterAgent>,
    namer: DeviceNamer,
    snat_ns: SnatNamespace,
    router_rules: NatRuleManager,
    scope_marks: ScopeMarkAllocator,
    arp_cache: ArpCache,
    redirects: BTreeMap<String, Vec<SnatRedirect>>,
}

impl RouterContext {
    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn namespace(&self) -> &str {
        &self.ns_name
    }

    pub fn snat_namespace(&self) -> &SnatNamespace {
        &self.snat_ns
    }

    /// Evaluated against the current snapshot on every call.
    pub fn is_snat_host(&self) -> bool {
        host::is_snat_host(&self.router, &self.config.host)
    }

    fn remote_target(&self, port: &Port) -> Option<RedirectTarget> {
        self.router
            .snat_port_for_internal_port(port)
            .cloned()
            .map(RedirectTarget::Remote)
    }

    fn gw_mtu(&self) -> Option<u32> {
        self.router.gw_port.as_ref().and_then(|p| p.mtu)
    }

    /// Plug `port`'s device into `namespace` and set its addresses.
    async fn plug_port(&self, port: &Port, device: &str, namespace: &str, prefix: &str) -> Result<()> {
        self.driver
            .plug(&PlugRequest {
                network_id: &port.network_id,
                port_id: &port.id,
                device_name: device,
                mac_address: &port.mac_address,
                bridge: None,
                namespace,
                prefix,
                mtu: port.mtu,
            })
            .await?;
        self.driver
            .init_l3(device, &port.ip_cidrs()?, namespace, true)
            .await
    }

    /// Plug the SNAT port serving `port` into the SNAT namespace.
    async fn plug_snat_port(&self, snat_port: &Port) -> Result<()> {
        let device = self.namer.snat_internal(&snat_port.id);
        self.plug_port(snat_port, &device, self.snat_ns.name(), SNAT_INT_DEV_PREFIX)
            .await
    }

    /// Bring every port's redirect in line with `variant`'s current target.
    ///
    /// Without a gateway no port has a redirect. A port whose redirect
    /// changes has the old one removed before the new one is installed.
    async fn sync_redirects(&mut self, variant: &dyn SnatVariant) -> Result<()> {
        let ports = self.router.interfaces.clone();
        let stale: Vec<String> = self
            .redirects
            .keys()
            .filter(|id| !ports.iter().any(|p| &p.id == *id))
            .cloned()
            .collect();
        for port_id in stale {
            self.remove_port_redirects(&port_id).await;
        }
        for port in &ports {
            let target = if self.router.gw_port.is_some() {
                variant.redirect_target(self, port).await
            } else {
                None
            };
            self.set_port_redirects(port, target.as_ref()).await?;
        }
        Ok(())
    }

    /// Whether `port`'s installed redirects already match `target`.
    ///
    /// Plans against a copy of the priority allocator, so nothing is taken.
    fn redirects_current(&self, port: &Port, target: Option<&RedirectTarget>) -> bool {
        let current = self.redirects.get(&port.id).map(Vec::as_slice).unwrap_or_default();
        let Some(target) = target else {
            return current.is_empty();
        };
        let mut priorities = self.snat_ns.priorities().clone();
        let internal = self.namer.internal(&port.id);
        let link = self.snat_ns.router_to_snat_device();
        redirect::plan(port, target, &internal, &link, &mut priorities)
            .is_ok_and(|planned| planned.as_slice() == current)
    }

    /// Replace `port`'s redirects with those of `target`.
    ///
    /// Redirects installed before a failure stay recorded, so a retry or a
    /// later teardown removes them.
    async fn set_port_redirects(&mut self, port: &Port, target: Option<&RedirectTarget>) -> Result<()> {
        if self.redirects_current(port, target) {
            return Ok(());
        }
        self.remove_port_redirects(&port.id).await;
        let Some(target) = target else {
            return Ok(());
        };

        let internal = self.namer.internal(&port.id);
        let link = self.snat_ns.router_to_snat_device();
        let desired = redirect::plan(port, target, &internal, &link, self.snat_ns.priorities_mut())?;

        let mut installed = Vec::with_capacity(desired.len());
        let mut outcome = Ok(());
        let mut pending = desired.into_iter();
        for r in pending.by_ref() {
            match redirect::install(self.driver.as_ref(), &self.ns_name, &r).await {
                Ok(()) => installed.push(r),
                Err(e) => {
                    redirect::release(&r, self.snat_ns.priorities_mut());
                    outcome = Err(e);
                    break;
                }
            }
        }
        for r in pending {
            redirect::release(&r, self.snat_ns.priorities_mut());
        }
        if !installed.is_empty() {
            self.redirects.insert(port.id.clone(), installed);
        }
        if outcome.is_ok() {
            debug!(port_id = %port.id, local = target.is_local(), "SNAT redirect set");
        }
        outcome
    }

    async fn remove_port_redirects(&mut self, port_id: &str) {
        let Some(installed) = self.redirects.remove(port_id) else {
            return;
        };
        for r in &installed {
            redirect::remove(self.driver.as_ref(), &self.ns_name, r, self.snat_ns.priorities_mut()).await;
        }
    }

    /// Remove every redirect, ahead of a change of SNAT locality.
    async fn clear_redirects(&mut self) {
        let ports: Vec<String> = self.redirects.keys().cloned().collect();
        for port_id in ports {
            self.remove_port_redirects(&port_id).await;
        }
    }

    /// Scope marks of the SNAT namespace devices and the external gateway.
    fn snat_scope_marks(&mut self, variant: &dyn SnatVariant) -> ScopeMark {
        let interfaces = variant.snat_interfaces_for(self);
        scope::compute(
            &mut self.scope_marks,
            &[],
            &interfaces,
            self.router.gw_port.as_ref(),
            &self.namer,
        )
    }

    /// Rebuild the SNAT namespace's rules in one batch.
    ///
    /// Only runs on the SNAT host of a router with a gateway whose SNAT
    /// namespace exists.
    async fn apply_snat_rules(&mut self, variant: &dyn SnatVariant) -> Result<()> {
        let gw_port = match &self.router.gw_port {
            Some(port) if self.is_snat_host() => port.clone(),
            _ => {
                debug!("no SNAT rules to be handled");
                return Ok(());
            }
        };
        if !self.snat_ns.exists().await {
            debug!(namespace = %self.snat_ns.name(), "no SNAT rules to be handled, namespace missing");
            return Ok(());
        }
        let marks = self.snat_scope_marks(variant);
        let device = self.namer.external(&gw_port.id);

        let mut batch = self.snat_ns.nat().begin();
        batch.empty_snat_chains();
        batch.add_scope_marks(&marks);
        batch.add_snat_rules(&device, &gw_port);
        batch.commit().await
    }

    async fn notify_ready(&self) {
        self.agent
            .notify_router_ready_for_rules(&self.router.id, self.snat_ns.name())
            .await;
    }

    /// Unplug the gateway from wherever it is plumbed, then drop the SNAT namespace.
    async fn teardown_gateway(&mut self, device: &str) {
        let bridge = self.config.external_network_bridge.as_deref();
        let namespace = if self.snat_ns.exists().await {
            Some(self.snat_ns.name().to_string())
        } else if self.driver.device_exists(device, &self.ns_name).await {
            Some(self.ns_name.clone())
        } else {
            None
        };
        if let Some(namespace) = namespace {
            if let Err(e) = self
                .driver
                .unplug(device, bridge, &namespace, EXTERNAL_DEV_PREFIX)
                .await
            {
                warn!(device = %device, namespace = %namespace, error = %e, "failed to unplug gateway");
            }
        } else {
            debug!(device = %device, "gateway not plumbed on this host");
        }
        if self.snat_ns.exists().await {
            self.snat_ns.delete().await;
        }
    }

    /// Routes of the snapshot, replayed into a freshly built SNAT namespace.
    async fn replay_routes(&self) {
        let routes = self.router.routes.clone();
        for route in &routes {
            self.update_routing_table(RouteOperation::Replace, route).await;
        }
    }

    async fn update_routing_table(&self, operation: RouteOperation, route: &Route) {
        let snat_ns = (self.router.gw_port.is_some() && self.is_snat_host()).then(|| self.snat_ns.name());
        let targets = RouteTargets {
            router_ns: &self.ns_name,
            snat_ns,
        };
        routes::update_routing_table(self.driver.as_ref(), targets, operation, route).await;
    }
}

pub struct DvrEdgeRouter {
    ctx: RouterContext,
    variant: Box<dyn SnatVariant>,
    span: Span,
}

/// Collaborators shared by every router on the host.
#[derive(Clone)]
pub struct RouterDeps {
    pub config: Arc<SnatConfig>,
    pub driver: Arc<dyn InterfaceDriver>,
    pub firewall: Arc<dyn FirewallBackend>,
    pub agent: Arc<dyn RouterAgent>,
}

impl DvrEdgeRouter {
    /// Router for `snapshot`; the variant follows the configured edge mode.
    pub fn new(snapshot: Router, deps: RouterDeps, link: LinkLocalAddressPair) -> Self {
        let variant: Box<dyn SnatVariant> = match deps.config.mode {
            EdgeMode::Centralized => Box::new(CentralizedEdge),
            EdgeMode::Local => Box::new(LocalEdge),
        };
        let span = info_span!("dvr_router", router_id = %snapshot.id, host = %deps.config.host);
        let ns_name = router_ns_name(&snapshot.id);
        let snat_ns = SnatNamespace::new(
            &snapshot.id,
            deps.driver.clone(),
            deps.firewall.clone(),
            deps.config.clone(),
            link,
        );
        let router_rules = NatRuleManager::new(ns_name.clone(), deps.firewall, deps.config.use_ipv6);
        let namer = DeviceNamer::new(deps.driver.dev_name_len());
        Self {
            ctx: RouterContext {
                router: snapshot,
                ns_name,
                config: deps.config,
                driver: deps.driver,
                agent: deps.agent,
                namer,
                snat_ns,
                router_rules,
                scope_marks: ScopeMarkAllocator::new(),
                arp_cache: ArpCache::new(),
                redirects: BTreeMap::new(),
            },
            variant,
            span,
        }
    }

    pub fn router(&self) -> &Router {
        &self.ctx.router
    }

    pub fn mode(&self) -> EdgeMode {
        self.variant.mode()
    }

    pub fn snat_namespace(&self) -> &SnatNamespace {
        &self.ctx.snat_ns
    }

    /// Name of the gateway device for `port`.
    pub fn external_device_name(&self, port: &Port) -> String {
        self.ctx.namer.external(&port.id)
    }

    /// Redirects currently installed for `port_id`.
    pub fn redirects(&self, port_id: &str) -> &[SnatRedirect] {
        self.ctx
            .redirects
            .get(port_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// The SNAT port internal traffic of `port` is sent to.
    pub async fn snat_port_for(&self, port: &Port) -> Option<Port> {
        self.variant
            .redirect_target(&self.ctx, port)
            .await
            .map(|t| t.port().clone())
    }

    /// ARP entries waiting for their internal device to be plumbed.
    pub fn pending_arp_entries(&self) -> usize {
        self.ctx.arp_cache.len()
    }

    /// Replace the router snapshot ahead of the next event.
    pub fn update_snapshot(&mut self, snapshot: Router) {
        self.ctx.router = snapshot;
    }

    pub async fn state(&self) -> GatewayState {
        if self.ctx.router.gw_port.is_none() {
            return GatewayState::NoGateway;
        }
        let local = self.ctx.snat_ns.exists().await;
        match (self.variant.mode(), local) {
            (EdgeMode::Centralized, false) => GatewayState::CentralizedRemote,
            (EdgeMode::Centralized, true) => GatewayState::CentralizedLocal,
            (EdgeMode::Local, false) => GatewayState::LocalRemote,
            (EdgeMode::Local, true) => GatewayState::LocalLocal,
        }
    }

    /// Create the router namespace if it is missing.
    pub async fn initialize(&mut self) -> Result<()> {
        let span = self.span.clone();
        self.create_router_namespace().instrument(span).await
    }

    pub async fn external_gateway_added(&mut self, port: &Port, device: &str) -> Result<()> {
        let span = self.span.clone();
        self.gateway_added(port, device).instrument(span).await
    }

    pub async fn external_gateway_updated(&mut self, port: &Port, device: &str) -> Result<()> {
        let span = self.span.clone();
        self.gateway_updated(port, device).instrument(span).await
    }

    pub async fn external_gateway_removed(&mut self, port: &Port, device: &str) -> Result<()> {
        let span = self.span.clone();
        self.gateway_removed(port, device).instrument(span).await
    }

    pub async fn internal_network_added(&mut self, port: &Port) -> Result<()> {
        let span = self.span.clone();
        self.add_internal_port(port).instrument(span).await
    }

    pub async fn internal_network_removed(&mut self, port: &Port) -> Result<()> {
        let span = self.span.clone();
        self.remove_internal_port(port).instrument(span).await
    }

    /// Apply the difference between `old` and `new` static routes.
    pub async fn routes_updated(&mut self, old: &[Route], new: &[Route]) {
        let span = self.span.clone();
        self.apply_route_diff(old, new).instrument(span).await
    }

    /// Recompute address scope marks for the router and, on the SNAT host,
    /// for the SNAT namespace.
    pub async fn process_address_scope(&mut self) -> Result<()> {
        let span = self.span.clone();
        self.apply_address_scopes().instrument(span).await
    }

    /// Add or delete the neighbour entry of `ip` on the port of `subnet_id`.
    pub async fn update_arp_entry(
        &mut self,
        ip: IpAddr,
        mac: &str,
        subnet_id: &str,
        operation: ArpOperation,
    ) -> ArpUpdate {
        let span = self.span.clone();
        self.arp_entry(ip, mac, subnet_id, operation)
            .instrument(span)
            .await
    }

    /// Tear down everything this host holds for the router. Best effort.
    pub async fn delete(&mut self) {
        let span = self.span.clone();
        self.teardown().instrument(span).await
    }

    async fn create_router_namespace(&mut self) -> Result<()> {
        let ns = &self.ctx.ns_name;
        if self.ctx.driver.namespace_exists(ns).await {
            return Ok(());
        }
        self.ctx.driver.create_namespace(ns).await?;
        self.ctx
            .driver
            .set_sysctl(ns, "net.ipv4.ip_forward", "1")
            .await?;
        info!(namespace = %ns, "router namespace created");
        Ok(())
    }

    async fn gateway_added(&mut self, port: &Port, device: &str) -> Result<()> {
        if self.ctx.is_snat_host() {
            info!(port_id = %port.id, "hosting SNAT, building SNAT namespace");
            self.variant.create_gateway(&mut self.ctx, port, device).await?;
            self.ctx.replay_routes().await;
            Ok(())
        } else if self.ctx.snat_ns.exists().await {
            info!(
                namespace = %self.ctx.snat_ns.name(),
                gw_port_host = ?self.ctx.router.gw_port_host,
                "SNAT moved to another host, clearing stale namespace"
            );
            self.gateway_removed(port, device).await
        } else {
            debug!("not hosting SNAT");
            self.ctx.sync_redirects(self.variant.as_ref()).await
        }
    }

    async fn gateway_updated(&mut self, port: &Port, device: &str) -> Result<()> {
        let matches = self
            .ctx
            .router
            .gw_port
            .as_ref()
            .is_some_and(|gw| gw.id == port.id);
        let plan = plan_gateway_update(
            self.ctx.is_snat_host(),
            self.ctx.snat_ns.exists().await,
            matches,
        );
        debug!(?plan, "gateway update");
        match plan {
            GatewayPlan::NonSnat => self.ctx.sync_redirects(self.variant.as_ref()).await,
            GatewayPlan::Remove => {
                info!(gw_port_host = ?self.ctx.router.gw_port_host, "SNAT rescheduled, clearing namespace");
                self.gateway_removed(port, device).await
            }
            GatewayPlan::Add => {
                info!("SNAT rescheduled to this host");
                self.gateway_added(port, device).await
            }
            GatewayPlan::Refresh => self.variant.update_gateway(&mut self.ctx, port, device).await,
            GatewayPlan::Inconsistent => {
                warn!(
                    port_id = %port.id,
                    snapshot_port = ?self.ctx.router.gw_port.as_ref().map(|p| &p.id),
                    "bad request: gateway update does not match router, ignored"
                );
                Ok(())
            }
        }
    }

    async fn gateway_removed(&mut self, port: &Port, device: &str) -> Result<()> {
        self.variant.remove_gateway(&mut self.ctx, port, device).await
    }

    async fn add_internal_port(&mut self, port: &Port) -> Result<()> {
        let device = self.ctx.namer.internal(&port.id);
        self.ctx
            .plug_port(port, &device, &self.ctx.ns_name, INTERNAL_DEV_PREFIX)
            .await?;
        if !self.ctx.router.interfaces.iter().any(|p| p.id == port.id) {
            self.ctx.router.interfaces.push(port.clone());
        }
        self.replay_arp_entries(port, &device).await;
        self.variant.internal_port_added(&mut self.ctx, port).await?;
        info!(port_id = %port.id, device = %device, "internal network added");
        Ok(())
    }

    async fn remove_internal_port(&mut self, port: &Port) -> Result<()> {
        self.variant.internal_port_removed(&mut self.ctx, port).await?;
        self.ctx.router.interfaces.retain(|p| p.id != port.id);

        let device = self.ctx.namer.internal(&port.id);
        if self.ctx.driver.device_exists(&device, &self.ctx.ns_name).await {
            self.ctx
                .driver
                .unplug(&device, None, &self.ctx.ns_name, INTERNAL_DEV_PREFIX)
                .await?;
        }
        info!(port_id = %port.id, "internal network removed");
        Ok(())
    }

    async fn apply_route_diff(&mut self, old: &[Route], new: &[Route]) {
        for (operation, route) in routes::diff_routes(old, new) {
            self.ctx.update_routing_table(operation, &route).await;
        }
        self.ctx.router.routes = new.to_vec();
    }

    async fn apply_address_scopes(&mut self) -> Result<()> {
        let marks = scope::compute(
            &mut self.ctx.scope_marks,
            &self.ctx.router.interfaces,
            &[],
            None,
            &self.ctx.namer,
        );
        let mut batch = self.ctx.router_rules.begin();
        batch.add_scope_marks(&marks);
        batch.commit().await?;

        if !self.ctx.is_snat_host() || !self.ctx.snat_ns.exists().await {
            debug!("no SNAT scope rules to be handled");
            return Ok(());
        }
        let marks = self.ctx.snat_scope_marks(self.variant.as_ref());
        let mut batch = self.ctx.snat_ns.nat().begin();
        batch.add_scope_marks(&marks);
        batch.commit().await
    }

    async fn arp_entry(
        &mut self,
        ip: IpAddr,
        mac: &str,
        subnet_id: &str,
        operation: ArpOperation,
    ) -> ArpUpdate {
        let Some(port) = self.ctx.router.internal_port_for_subnet(subnet_id) else {
            debug!(subnet_id = %subnet_id, "no internal port for subnet");
            return ArpUpdate::DeviceAbsent;
        };
        let device = self.ctx.namer.internal(&port.id);
        if !self.ctx.driver.device_exists(&device, &self.ctx.ns_name).await {
            match operation {
                ArpOperation::Add => self.ctx.arp_cache.insert(ArpEntry {
                    ip,
                    mac: mac.to_string(),
                    subnet_id: subnet_id.to_string(),
                }),
                ArpOperation::Delete => self.ctx.arp_cache.remove(ip, subnet_id),
            }
            debug!(device = %device, ip = %ip, "device not ready, ARP entry deferred");
            return ArpUpdate::DeviceAbsent;
        }
        self.apply_arp(&device, ip, mac, operation).await
    }

    async fn apply_arp(&self, device: &str, ip: IpAddr, mac: &str, operation: ArpOperation) -> ArpUpdate {
        let ns = &self.ctx.ns_name;
        let result = match operation {
            ArpOperation::Add => self.ctx.driver.add_neighbor(ns, device, ip, mac).await,
            ArpOperation::Delete => self.ctx.driver.delete_neighbor(ns, device, ip, mac).await,
        };
        match result {
            Ok(()) => ArpUpdate::Applied,
            Err(e) => {
                error!(
                    device = %device,
                    ip = %ip,
                    mac = %mac,
                    ?operation,
                    error = %e,
                    "failed to update ARP entry"
                );
                ArpUpdate::Failed(e.to_string())
            }
        }
    }

    async fn replay_arp_entries(&mut self, port: &Port, device: &str) {
        if self.ctx.arp_cache.is_empty() {
            return;
        }
        for fixed in &port.fixed_ips {
            for entry in self.ctx.arp_cache.take_subnet(&fixed.subnet_id) {
                self.apply_arp(device, entry.ip, &entry.mac, ArpOperation::Add)
                    .await;
            }
        }
    }

    async fn teardown(&mut self) {
        self.ctx.clear_redirects().await;
        if let Some(gw) = self.ctx.router.gw_port.clone() {
            let device = self.ctx.namer.external(&gw.id);
            self.ctx.teardown_gateway(&device).await;
        }
        if self.ctx.snat_ns.exists().await {
            self.ctx.snat_ns.delete().await;
        }
        let ns = &self.ctx.ns_name;
        if self.ctx.driver.namespace_exists(ns).await {
            match self.ctx.driver.delete_namespace(ns).await {
                Ok(()) => info!(namespace = %ns, "router namespace destroyed"),
                Err(e) => warn!(namespace = %ns, error = %e, "failed to delete router namespace"),
            }
        }
    }
}
