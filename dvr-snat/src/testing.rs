//! In-memory stand-ins for the OS-facing collaborators.
//!
//! [`FakeDriver`] keeps namespaces, devices, addresses, routes, rules and
//! neighbours in memory and rejects the same things the kernel rejects
//! (duplicate addresses, devices in missing namespaces, deleting absent
//! routes), so idempotence can be asserted on observable state.

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use dvr::{
    Device, DvrError, FirewallBackend, InterfaceDriver, IpNetwork, IpRule, IpVersion,
    PlugRequest, Result, RouteEntry, RouterAgent, RuleBatch, Table,
};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn fail(op: &str, detail: impl std::fmt::Display) -> DvrError {
    DvrError::Command(format!("{op}: {detail}"))
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FakeDevice {
    pub mac_address: Option<String>,
    pub addresses: Vec<IpNetwork>,
    pub mtu: Option<u32>,
    pub up: bool,
    /// Other end of a veth pair: `(namespace, device)`.
    pub peer: Option<(String, String)>,
}

#[derive(Debug, Clone, Default)]
pub struct FakeState {
    pub namespaces: BTreeSet<String>,
    /// Keyed by `(namespace, device)`.
    pub devices: BTreeMap<(String, String), FakeDevice>,
    pub routes: Vec<(String, RouteEntry)>,
    /// Default routes keyed by `(namespace, table, version)`, valued `(device, gateway)`.
    pub gateways: BTreeMap<(String, Option<u32>, IpVersion), (String, IpAddr)>,
    /// Policy rules; an identical rule is rejected, as the kernel does.
    pub rules: Vec<(String, IpRule)>,
    pub neighbors: BTreeMap<(String, String, IpAddr), String>,
    pub sysctls: BTreeMap<(String, String), String>,
    pub advertisements: Vec<(String, String, IpAddr)>,
    /// Names of every mutating operation, in call order.
    pub calls: Vec<String>,
}

impl FakeState {
    pub fn device(&self, namespace: &str, device: &str) -> Option<&FakeDevice> {
        self.devices.get(&(namespace.to_string(), device.to_string()))
    }

    pub fn devices_in(&self, namespace: &str) -> Vec<String> {
        self.devices
            .keys()
            .filter(|(ns, _)| ns == namespace)
            .map(|(_, dev)| dev.clone())
            .collect()
    }

    pub fn rules_in(&self, namespace: &str) -> Vec<IpRule> {
        self.rules
            .iter()
            .filter(|(ns, _)| ns == namespace)
            .map(|(_, r)| *r)
            .collect()
    }

    pub fn gateway(&self, namespace: &str, table: Option<u32>, version: IpVersion) -> Option<&(String, IpAddr)> {
        self.gateways.get(&(namespace.to_string(), table, version))
    }

    pub fn count_calls(&self, op: &str) -> usize {
        self.calls.iter().filter(|c| c.as_str() == op).count()
    }
}

#[derive(Debug, Default)]
pub struct FakeDriver {
    state: Mutex<FakeState>,
    failing: Mutex<BTreeSet<String>>,
}

impl FakeDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the current state.
    pub fn state(&self) -> FakeState {
        lock(&self.state).clone()
    }

    /// Make every subsequent call of `op` fail.
    pub fn fail_on(&self, op: &str) {
        lock(&self.failing).insert(op.to_string());
    }

    pub fn clear_failures(&self) {
        lock(&self.failing).clear();
    }

    pub fn clear_calls(&self) {
        lock(&self.state).calls.clear();
    }

    /// Simulate a namespace left behind by a previous run.
    pub fn seed_namespace(&self, name: &str) {
        lock(&self.state).namespaces.insert(name.to_string());
    }

    /// Simulate a policy rule left behind by a previous run.
    pub fn seed_rule(&self, namespace: &str, rule: IpRule) {
        let mut state = lock(&self.state);
        state.namespaces.insert(namespace.to_string());
        state.rules.push((namespace.to_string(), rule));
    }

    /// Simulate a device created outside the agent.
    pub fn seed_device(&self, namespace: &str, device: &str) {
        let mut state = lock(&self.state);
        state.namespaces.insert(namespace.to_string());
        state
            .devices
            .insert((namespace.to_string(), device.to_string()), FakeDevice::default());
    }

    /// Record `op` and fail it if requested.
    fn begin(&self, op: &str) -> Result<MutexGuard<'_, FakeState>> {
        if lock(&self.failing).contains(op) {
            return Err(fail(op, "injected failure"));
        }
        let mut state = lock(&self.state);
        state.calls.push(op.to_string());
        Ok(state)
    }
}

fn require_ns(state: &FakeState, op: &str, namespace: &str) -> Result<()> {
    if state.namespaces.contains(namespace) {
        Ok(())
    } else {
        Err(fail(op, format!("namespace {namespace} not found")))
    }
}

fn device_mut<'a>(
    state: &'a mut FakeState,
    op: &str,
    namespace: &str,
    device: &str,
) -> Result<&'a mut FakeDevice> {
    state
        .devices
        .get_mut(&(namespace.to_string(), device.to_string()))
        .ok_or_else(|| fail(op, format!("device {device} not found in {namespace}")))
}

fn same_route(a: &RouteEntry, b: &RouteEntry) -> bool {
    a.destination == b.destination && a.table == b.table
}

#[async_trait]
impl InterfaceDriver for FakeDriver {
    async fn namespace_exists(&self, name: &str) -> bool {
        lock(&self.state).namespaces.contains(name)
    }

    async fn create_namespace(&self, name: &str) -> Result<()> {
        let mut state = self.begin("create_namespace")?;
        if !state.namespaces.insert(name.to_string()) {
            return Err(fail("create_namespace", format!("{name} already exists")));
        }
        Ok(())
    }

    async fn delete_namespace(&self, name: &str) -> Result<()> {
        let mut state = self.begin("delete_namespace")?;
        if !state.namespaces.remove(name) {
            return Err(fail("delete_namespace", format!("{name} not found")));
        }
        let peers: Vec<(String, String)> = state
            .devices
            .iter()
            .filter(|((ns, _), _)| ns == name)
            .filter_map(|(_, d)| d.peer.clone())
            .collect();
        state.devices.retain(|(ns, _), _| ns != name);
        for peer in peers {
            state.devices.remove(&peer);
        }
        state.routes.retain(|(ns, _)| ns != name);
        state.gateways.retain(|(ns, _, _), _| ns != name);
        state.rules.retain(|(ns, _)| ns != name);
        state.neighbors.retain(|(ns, _, _), _| ns != name);
        state.sysctls.retain(|(ns, _), _| ns != name);
        Ok(())
    }

    async fn plug(&self, request: &PlugRequest<'_>) -> Result<()> {
        let mut state = self.begin("plug")?;
        require_ns(&state, "plug", request.namespace)?;
        let key = (request.namespace.to_string(), request.device_name.to_string());
        state.devices.entry(key).or_insert_with(|| FakeDevice {
            mac_address: Some(request.mac_address.to_string()),
            mtu: request.mtu,
            up: true,
            ..FakeDevice::default()
        });
        Ok(())
    }

    async fn unplug(
        &self,
        device: &str,
        _bridge: Option<&str>,
        namespace: &str,
        _prefix: &str,
    ) -> Result<()> {
        let mut state = self.begin("unplug")?;
        state
            .devices
            .remove(&(namespace.to_string(), device.to_string()));
        Ok(())
    }

    async fn init_l3(
        &self,
        device: &str,
        cidrs: &[IpNetwork],
        namespace: &str,
        _clean_connections: bool,
    ) -> Result<()> {
        let mut state = self.begin("init_l3")?;
        device_mut(&mut state, "init_l3", namespace, device)?.addresses = cidrs.to_vec();
        Ok(())
    }

    async fn device_exists(&self, device: &str, namespace: &str) -> bool {
        lock(&self.state)
            .devices
            .contains_key(&(namespace.to_string(), device.to_string()))
    }

    async fn list_devices(&self, namespace: &str) -> Result<Vec<Device>> {
        let state = lock(&self.state);
        require_ns(&state, "list_devices", namespace)?;
        Ok(state
            .devices
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|((_, name), d)| Device {
                name: name.clone(),
                mac_address: d.mac_address.clone(),
            })
            .collect())
    }

    async fn add_veth(
        &self,
        device: &str,
        namespace: &str,
        peer: &str,
        peer_namespace: &str,
    ) -> Result<()> {
        let mut state = self.begin("add_veth")?;
        require_ns(&state, "add_veth", namespace)?;
        require_ns(&state, "add_veth", peer_namespace)?;
        let local = (namespace.to_string(), device.to_string());
        let remote = (peer_namespace.to_string(), peer.to_string());
        if state.devices.contains_key(&local) || state.devices.contains_key(&remote) {
            return Err(fail("add_veth", format!("{device} or {peer} already exists")));
        }
        let mac = |n: usize| Some(format!("fa:16:3e:00:00:{n:02x}"));
        let count = state.devices.len();
        state.devices.insert(
            local.clone(),
            FakeDevice {
                mac_address: mac(count),
                peer: Some(remote.clone()),
                ..FakeDevice::default()
            },
        );
        state.devices.insert(
            remote,
            FakeDevice {
                mac_address: mac(count + 1),
                peer: Some(local),
                ..FakeDevice::default()
            },
        );
        Ok(())
    }

    async fn delete_veth(&self, device: &str, namespace: &str) -> Result<()> {
        let mut state = self.begin("delete_veth")?;
        let removed = state
            .devices
            .remove(&(namespace.to_string(), device.to_string()))
            .ok_or_else(|| fail("delete_veth", format!("{device} not found")))?;
        if let Some(peer) = removed.peer {
            state.devices.remove(&peer);
        }
        Ok(())
    }

    async fn add_address(&self, device: &str, namespace: &str, cidr: IpNetwork) -> Result<()> {
        let mut state = self.begin("add_address")?;
        let dev = device_mut(&mut state, "add_address", namespace, device)?;
        if dev.addresses.contains(&cidr) {
            return Err(fail("add_address", format!("{cidr} already on {device}")));
        }
        dev.addresses.push(cidr);
        Ok(())
    }

    async fn list_addresses(
        &self,
        device: &str,
        namespace: &str,
        to: Option<IpNetwork>,
    ) -> Result<Vec<IpNetwork>> {
        let mut state = lock(&self.state);
        let dev = device_mut(&mut state, "list_addresses", namespace, device)?;
        Ok(dev
            .addresses
            .iter()
            .filter(|a| to.is_none_or(|t| **a == t))
            .copied()
            .collect())
    }

    async fn set_mtu(&self, device: &str, namespace: &str, mtu: u32) -> Result<()> {
        let mut state = self.begin("set_mtu")?;
        device_mut(&mut state, "set_mtu", namespace, device)?.mtu = Some(mtu);
        Ok(())
    }

    async fn set_up(&self, device: &str, namespace: &str) -> Result<()> {
        let mut state = self.begin("set_up")?;
        device_mut(&mut state, "set_up", namespace, device)?.up = true;
        Ok(())
    }

    async fn add_route(&self, namespace: &str, route: &RouteEntry) -> Result<()> {
        let mut state = self.begin("add_route")?;
        require_ns(&state, "add_route", namespace)?;
        state
            .routes
            .retain(|(ns, r)| !(ns == namespace && same_route(r, route)));
        state.routes.push((namespace.to_string(), route.clone()));
        Ok(())
    }

    async fn delete_route(&self, namespace: &str, route: &RouteEntry) -> Result<()> {
        let mut state = self.begin("delete_route")?;
        let before = state.routes.len();
        state
            .routes
            .retain(|(ns, r)| !(ns == namespace && same_route(r, route)));
        if state.routes.len() == before {
            return Err(fail("delete_route", format!("{} not found", route.destination)));
        }
        Ok(())
    }

    async fn add_gateway(
        &self,
        namespace: &str,
        device: &str,
        gateway: IpAddr,
        table: Option<u32>,
    ) -> Result<()> {
        let mut state = self.begin("add_gateway")?;
        require_ns(&state, "add_gateway", namespace)?;
        state.gateways.insert(
            (namespace.to_string(), table, IpVersion::of(gateway)),
            (device.to_string(), gateway),
        );
        Ok(())
    }

    async fn delete_gateway(
        &self,
        namespace: &str,
        _device: &str,
        gateway: IpAddr,
        table: Option<u32>,
    ) -> Result<()> {
        let mut state = self.begin("delete_gateway")?;
        state
            .gateways
            .remove(&(namespace.to_string(), table, IpVersion::of(gateway)))
            .map(|_| ())
            .ok_or_else(|| fail("delete_gateway", format!("no default route in table {table:?}")))
    }

    async fn add_ip_rule(&self, namespace: &str, rule: &IpRule) -> Result<()> {
        let mut state = self.begin("add_ip_rule")?;
        require_ns(&state, "add_ip_rule", namespace)?;
        if state.rules.iter().any(|(ns, r)| ns == namespace && r == rule) {
            return Err(fail("add_ip_rule", format!("rule from {} exists", rule.from)));
        }
        state.rules.push((namespace.to_string(), *rule));
        Ok(())
    }

    async fn delete_ip_rule(&self, namespace: &str, rule: &IpRule) -> Result<()> {
        let mut state = self.begin("delete_ip_rule")?;
        let pos = state
            .rules
            .iter()
            .position(|(ns, r)| ns == namespace && r == rule)
            .ok_or_else(|| fail("delete_ip_rule", format!("rule from {} not found", rule.from)))?;
        state.rules.remove(pos);
        Ok(())
    }

    async fn add_neighbor(&self, namespace: &str, device: &str, ip: IpAddr, mac: &str) -> Result<()> {
        let mut state = self.begin("add_neighbor")?;
        device_mut(&mut state, "add_neighbor", namespace, device)?;
        state
            .neighbors
            .insert((namespace.to_string(), device.to_string(), ip), mac.to_string());
        Ok(())
    }

    async fn delete_neighbor(
        &self,
        namespace: &str,
        device: &str,
        ip: IpAddr,
        _mac: &str,
    ) -> Result<()> {
        let mut state = self.begin("delete_neighbor")?;
        state
            .neighbors
            .remove(&(namespace.to_string(), device.to_string(), ip))
            .map(|_| ())
            .ok_or_else(|| fail("delete_neighbor", format!("{ip} not found")))
    }

    async fn set_sysctl(&self, namespace: &str, key: &str, value: &str) -> Result<()> {
        let mut state = self.begin("set_sysctl")?;
        require_ns(&state, "set_sysctl", namespace)?;
        state
            .sysctls
            .insert((namespace.to_string(), key.to_string()), value.to_string());
        Ok(())
    }

    async fn send_address_advertisement(
        &self,
        namespace: &str,
        device: &str,
        ip: IpAddr,
    ) -> Result<()> {
        let mut state = self.begin("send_address_advertisement")?;
        device_mut(&mut state, "send_address_advertisement", namespace, device)?;
        state
            .advertisements
            .push((namespace.to_string(), device.to_string(), ip));
        Ok(())
    }
}

/// Records committed batches and replays them into per-chain rule lists.
#[derive(Debug, Default)]
pub struct RecordingFirewall {
    batches: Mutex<Vec<(String, RuleBatch)>>,
    failing: Mutex<bool>,
}

/// `(version, table, chain)` to the rules currently in that chain.
pub type ChainContents = BTreeMap<(IpVersion, Table, String), Vec<String>>;

impl RecordingFirewall {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        *lock(&self.failing) = failing;
    }

    pub fn batches(&self) -> Vec<(String, RuleBatch)> {
        lock(&self.batches).clone()
    }

    /// Chain contents of `namespace` after replaying every committed batch.
    pub fn chains(&self, namespace: &str) -> ChainContents {
        let mut contents = ChainContents::new();
        for (_, batch) in lock(&self.batches).iter().filter(|(ns, _)| ns == namespace) {
            for chain in batch.chains() {
                contents.insert((chain.version, chain.table, chain.name.clone()), Vec::new());
            }
            for rule in batch.rules() {
                contents
                    .entry((rule.version, rule.table, rule.chain.clone()))
                    .or_default()
                    .push(rule.spec.clone());
            }
        }
        contents
    }
}

#[async_trait]
impl FirewallBackend for RecordingFirewall {
    async fn apply(&self, namespace: &str, batch: &RuleBatch) -> Result<()> {
        if *lock(&self.failing) {
            return Err(DvrError::Firewall(format!("{namespace}: injected failure")));
        }
        lock(&self.batches).push((namespace.to_string(), batch.clone()));
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct RecordingAgent {
    notified: Mutex<Vec<(String, String)>>,
}

impl RecordingAgent {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(router_id, snat_namespace)` pairs in notification order.
    pub fn notified(&self) -> Vec<(String, String)> {
        lock(&self.notified).clone()
    }
}

#[async_trait]
impl RouterAgent for RecordingAgent {
    async fn notify_router_ready_for_rules(&self, router_id: &str, snat_namespace: &str) {
        lock(&self.notified).push((router_id.to_string(), snat_namespace.to_string()));
    }
}
