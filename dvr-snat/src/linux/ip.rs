//! [`InterfaceDriver`] on top of iproute2.
//!
//! Every operation runs `ip netns exec <namespace> <program> ...`, so the
//! agent itself never changes namespace. Output parsing is kept in pure
//! functions below the driver.

use std::net::IpAddr;

use async_trait::async_trait;
use dvr::{
    Device, DvrError, InterfaceDriver, IpNetwork, IpRule, IpVersion, PlugRequest, Result,
    RouteEntry, RouteScope,
};
use tracing::{debug, info};

use crate::command::{Privilege, exec, exec_ignore_errors};
use crate::naming::DeviceNamer;

/// Prefix of the root-namespace end of a plugged port.
pub const TAP_DEV_PREFIX: &str = "tap";

#[derive(Debug, Clone)]
pub struct IpDriver {
    privilege: Privilege,
    namer: DeviceNamer,
}

impl IpDriver {
    pub fn new(privilege: Privilege) -> Self {
        Self {
            privilege,
            namer: DeviceNamer::default(),
        }
    }

    /// `ip <args>` in the agent's own namespace.
    async fn ip(&self, args: &[String]) -> Result<String> {
        Ok(exec("ip", &as_strs(args), self.privilege).await?)
    }

    /// `<program> <args>` inside `namespace`.
    async fn netns(&self, namespace: &str, program: &str, args: &[String]) -> Result<String> {
        let mut full = vec![
            "netns".to_string(),
            "exec".to_string(),
            namespace.to_string(),
            program.to_string(),
        ];
        full.extend_from_slice(args);
        self.ip(&full).await
    }

    async fn netns_ip(&self, namespace: &str, args: &[String]) -> Result<String> {
        self.netns(namespace, "ip", args).await
    }

    fn tap_name(&self, port_id: &str) -> String {
        self.namer.name(TAP_DEV_PREFIX, port_id)
    }

    /// Drop conntrack entries of addresses removed from a device.
    async fn flush_conntrack(&self, namespace: &str, removed: &[IpNetwork]) {
        for cidr in removed {
            let ip = cidr.ip().to_string();
            exec_ignore_errors(
                "ip",
                &["netns", "exec", namespace, "conntrack", "-D", "-d", &ip],
                self.privilege,
            )
            .await;
        }
    }
}

fn as_strs(args: &[String]) -> Vec<&str> {
    args.iter().map(String::as_str).collect()
}

fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

fn family(version: IpVersion) -> &'static str {
    match version {
        IpVersion::V4 => "-4",
        IpVersion::V6 => "-6",
    }
}

// ---------------------------------------------------------------------------
// Argument builders (pure functions)
// ---------------------------------------------------------------------------

fn route_args(op: &str, route: &RouteEntry) -> Vec<String> {
    let version = IpVersion::of(route.destination.ip());
    let mut args = strings(&[family(version), "route", op]);
    args.push(route.destination.to_string());
    if let Some(via) = route.via {
        args.extend(["via".to_string(), via.to_string()]);
    }
    if let Some(device) = &route.device {
        args.extend(["dev".to_string(), device.clone()]);
    }
    if let Some(table) = route.table {
        args.extend(["table".to_string(), table.to_string()]);
    }
    if let Some(scope) = route.scope {
        let scope = match scope {
            RouteScope::Link => "link",
            RouteScope::Global => "global",
        };
        args.extend(["scope".to_string(), scope.to_string()]);
    }
    args
}

fn gateway_args(op: &str, device: &str, gateway: IpAddr, table: Option<u32>) -> Vec<String> {
    let mut args = strings(&[family(IpVersion::of(gateway)), "route", op, "default", "via"]);
    args.push(gateway.to_string());
    args.extend(["dev".to_string(), device.to_string()]);
    if let Some(table) = table {
        args.extend(["table".to_string(), table.to_string()]);
    }
    args
}

fn rule_args(op: &str, rule: &IpRule) -> Vec<String> {
    let version = IpVersion::of(rule.from.ip());
    let mut args = strings(&[family(version), "rule", op, "from"]);
    args.push(rule.from.to_string());
    args.extend([
        "table".to_string(),
        rule.table.to_string(),
        "priority".to_string(),
        rule.priority.to_string(),
    ]);
    args
}

// ---------------------------------------------------------------------------
// Output parsers (pure functions)
// ---------------------------------------------------------------------------

/// Names from `ip netns list`, whose lines look like `snat-r1 (id: 3)`.
fn parse_netns_list(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .map(String::from)
        .collect()
}

/// Devices from `ip -o link show`, loopback excluded.
///
/// Lines look like
/// `7: qg-1@if8: <BROADCAST,UP> mtu 1500 ... link/ether fa:16:3e:00:00:01 brd ...`.
fn parse_link_list(output: &str) -> Vec<Device> {
    output
        .lines()
        .filter_map(|line| {
            let mut tokens = line.split_whitespace();
            let name = tokens.nth(1)?.trim_end_matches(':');
            let name = name.split('@').next().unwrap_or(name);
            if name == "lo" {
                return None;
            }
            let mac_address = tokens
                .skip_while(|t| *t != "link/ether")
                .nth(1)
                .map(String::from);
            Some(Device {
                name: name.to_string(),
                mac_address,
            })
        })
        .collect()
}

/// Addresses from `ip -o addr show`.
///
/// With `global_only`, link-scoped addresses (e.g. IPv6 `fe80::/64`) are skipped.
fn parse_addresses(output: &str, global_only: bool) -> Vec<IpNetwork> {
    output
        .lines()
        .filter_map(|line| {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            let pos = tokens.iter().position(|t| *t == "inet" || *t == "inet6")?;
            let cidr: IpNetwork = tokens.get(pos + 1)?.parse().ok()?;
            if global_only {
                let scope = tokens
                    .iter()
                    .position(|t| *t == "scope")
                    .and_then(|i| tokens.get(i + 1));
                if scope.is_some_and(|s| *s != "global") {
                    return None;
                }
            }
            Some(cidr)
        })
        .collect()
}

/// Whether `ip rule show` output holds `rule`.
///
/// Lines look like `32768:\tfrom 10.0.0.0/24 lookup 18`; a full-length
/// source is printed without its prefix.
fn rule_listed(output: &str, rule: &IpRule) -> bool {
    let priority = format!("{}:", rule.priority);
    let table = rule.table.to_string();
    output.lines().any(|line| {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let after = |key: &str| {
            tokens
                .iter()
                .position(|t| *t == key)
                .and_then(|i| tokens.get(i + 1))
                .copied()
        };
        tokens.first() == Some(&priority.as_str())
            && after("from").and_then(|f| f.parse::<IpNetwork>().ok()) == Some(rule.from)
            && after("lookup") == Some(table.as_str())
    })
}

// ---------------------------------------------------------------------------
// InterfaceDriver
// ---------------------------------------------------------------------------

#[async_trait]
impl InterfaceDriver for IpDriver {
    async fn namespace_exists(&self, name: &str) -> bool {
        match self.ip(&strings(&["netns", "list"])).await {
            Ok(output) => parse_netns_list(&output).iter().any(|ns| ns == name),
            Err(e) => {
                debug!(namespace = %name, error = %e, "cannot list namespaces");
                false
            }
        }
    }

    async fn create_namespace(&self, name: &str) -> Result<()> {
        self.ip(&strings(&["netns", "add", name])).await?;
        self.netns_ip(name, &strings(&["link", "set", "lo", "up"]))
            .await?;
        info!(namespace = %name, "namespace created");
        Ok(())
    }

    async fn delete_namespace(&self, name: &str) -> Result<()> {
        self.ip(&strings(&["netns", "delete", name])).await?;
        Ok(())
    }

    async fn plug(&self, request: &PlugRequest<'_>) -> Result<()> {
        if self
            .device_exists(request.device_name, request.namespace)
            .await
        {
            debug!(device = %request.device_name, "device already plugged");
            return Ok(());
        }
        let tap = self.tap_name(request.port_id);
        let mut args = strings(&["link", "add", request.device_name, "address", request.mac_address]);
        if let Some(mtu) = request.mtu {
            args.extend(["mtu".to_string(), mtu.to_string()]);
        }
        args.extend(strings(&["type", "veth", "peer", "name", &tap]));
        self.ip(&args).await?;
        self.ip(&strings(&["link", "set", request.device_name, "netns", request.namespace]))
            .await?;
        if let Some(bridge) = request.bridge {
            self.ip(&strings(&["link", "set", &tap, "master", bridge]))
                .await?;
        }
        self.ip(&strings(&["link", "set", &tap, "up"])).await?;
        self.netns_ip(request.namespace, &strings(&["link", "set", request.device_name, "up"]))
            .await?;
        debug!(
            device = %request.device_name,
            namespace = %request.namespace,
            network_id = %request.network_id,
            "port plugged"
        );
        Ok(())
    }

    async fn unplug(
        &self,
        device: &str,
        bridge: Option<&str>,
        namespace: &str,
        prefix: &str,
    ) -> Result<()> {
        self.netns_ip(namespace, &strings(&["link", "delete", device]))
            .await?;
        debug!(device = %device, namespace = %namespace, bridge = ?bridge, prefix = %prefix, "port unplugged");
        Ok(())
    }

    async fn init_l3(
        &self,
        device: &str,
        cidrs: &[IpNetwork],
        namespace: &str,
        clean_connections: bool,
    ) -> Result<()> {
        let output = self
            .netns_ip(namespace, &strings(&["-o", "addr", "show", "dev", device]))
            .await?;
        let current = parse_addresses(&output, true);

        let removed: Vec<IpNetwork> = current
            .iter()
            .filter(|c| !cidrs.contains(c))
            .copied()
            .collect();
        for cidr in &removed {
            self.netns_ip(namespace, &strings(&["addr", "del", &cidr.to_string(), "dev", device]))
                .await?;
        }
        for cidr in cidrs.iter().filter(|c| !current.contains(c)) {
            self.add_address(device, namespace, *cidr).await?;
        }
        if clean_connections {
            self.flush_conntrack(namespace, &removed).await;
        }
        Ok(())
    }

    async fn device_exists(&self, device: &str, namespace: &str) -> bool {
        self.netns_ip(namespace, &strings(&["link", "show", "dev", device]))
            .await
            .is_ok()
    }

    async fn list_devices(&self, namespace: &str) -> Result<Vec<Device>> {
        let output = self
            .netns_ip(namespace, &strings(&["-o", "link", "show"]))
            .await?;
        Ok(parse_link_list(&output))
    }

    async fn add_veth(
        &self,
        device: &str,
        namespace: &str,
        peer: &str,
        peer_namespace: &str,
    ) -> Result<()> {
        self.netns_ip(
            namespace,
            &strings(&["link", "add", device, "type", "veth", "peer", "name", peer, "netns", peer_namespace]),
        )
        .await?;
        Ok(())
    }

    async fn delete_veth(&self, device: &str, namespace: &str) -> Result<()> {
        self.netns_ip(namespace, &strings(&["link", "delete", device]))
            .await?;
        Ok(())
    }

    async fn add_address(&self, device: &str, namespace: &str, cidr: IpNetwork) -> Result<()> {
        let mut args = strings(&["addr", "add", &cidr.to_string(), "dev", device]);
        if cidr.is_ipv4() {
            args.extend(["brd".to_string(), "+".to_string()]);
        }
        self.netns_ip(namespace, &args).await?;
        Ok(())
    }

    async fn list_addresses(
        &self,
        device: &str,
        namespace: &str,
        to: Option<IpNetwork>,
    ) -> Result<Vec<IpNetwork>> {
        let mut args = strings(&["-o", "addr", "show", "dev", device]);
        if let Some(to) = to {
            args.extend(["to".to_string(), to.to_string()]);
        }
        let output = self.netns_ip(namespace, &args).await?;
        let addresses = parse_addresses(&output, false);
        Ok(match to {
            Some(to) => addresses.into_iter().filter(|a| *a == to).collect(),
            None => addresses,
        })
    }

    async fn set_mtu(&self, device: &str, namespace: &str, mtu: u32) -> Result<()> {
        self.netns_ip(namespace, &strings(&["link", "set", device, "mtu", &mtu.to_string()]))
            .await?;
        Ok(())
    }

    async fn set_up(&self, device: &str, namespace: &str) -> Result<()> {
        self.netns_ip(namespace, &strings(&["link", "set", device, "up"]))
            .await?;
        Ok(())
    }

    async fn add_route(&self, namespace: &str, route: &RouteEntry) -> Result<()> {
        self.netns_ip(namespace, &route_args("replace", route))
            .await?;
        Ok(())
    }

    async fn delete_route(&self, namespace: &str, route: &RouteEntry) -> Result<()> {
        self.netns_ip(namespace, &route_args("del", route)).await?;
        Ok(())
    }

    async fn add_gateway(
        &self,
        namespace: &str,
        device: &str,
        gateway: IpAddr,
        table: Option<u32>,
    ) -> Result<()> {
        self.netns_ip(namespace, &gateway_args("replace", device, gateway, table))
            .await?;
        Ok(())
    }

    async fn delete_gateway(
        &self,
        namespace: &str,
        device: &str,
        gateway: IpAddr,
        table: Option<u32>,
    ) -> Result<()> {
        self.netns_ip(namespace, &gateway_args("del", device, gateway, table))
            .await?;
        Ok(())
    }

    async fn add_ip_rule(&self, namespace: &str, rule: &IpRule) -> Result<()> {
        let version = IpVersion::of(rule.from.ip());
        let listed = self
            .netns_ip(namespace, &strings(&[family(version), "rule", "show"]))
            .await?;
        if rule_listed(&listed, rule) {
            debug!(namespace = %namespace, from = %rule.from, priority = rule.priority, "ip rule already present");
            return Ok(());
        }
        self.netns_ip(namespace, &rule_args("add", rule)).await?;
        Ok(())
    }

    async fn delete_ip_rule(&self, namespace: &str, rule: &IpRule) -> Result<()> {
        self.netns_ip(namespace, &rule_args("del", rule)).await?;
        Ok(())
    }

    async fn add_neighbor(&self, namespace: &str, device: &str, ip: IpAddr, mac: &str) -> Result<()> {
        let ip = ip.to_string();
        self.netns_ip(
            namespace,
            &strings(&["neigh", "replace", &ip, "lladdr", mac, "dev", device, "nud", "permanent"]),
        )
        .await?;
        Ok(())
    }

    async fn delete_neighbor(
        &self,
        namespace: &str,
        device: &str,
        ip: IpAddr,
        mac: &str,
    ) -> Result<()> {
        let ip = ip.to_string();
        self.netns_ip(namespace, &strings(&["neigh", "del", &ip, "lladdr", mac, "dev", device]))
            .await?;
        Ok(())
    }

    async fn set_sysctl(&self, namespace: &str, key: &str, value: &str) -> Result<()> {
        let setting = format!("{key}={value}");
        self.netns(namespace, "sysctl", &strings(&["-w", &setting]))
            .await?;
        Ok(())
    }

    async fn send_address_advertisement(
        &self,
        namespace: &str,
        device: &str,
        ip: IpAddr,
    ) -> Result<()> {
        match ip {
            IpAddr::V4(_) => {
                let ip = ip.to_string();
                self.netns(namespace, "arping", &strings(&["-U", "-I", device, "-c", "1", &ip]))
                    .await
                    .map_err(|e| DvrError::Command(format!("arping {ip} on {device}: {e}")))?;
            }
            IpAddr::V6(_) => {
                debug!(device = %device, ip = %ip, "IPv6 advertisement left to the kernel");
            }
        }
        Ok(())
    }
}
