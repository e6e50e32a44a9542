//! Policy routes steering an internal subnet's traffic to its SNAT next hop.
//!
//! Each redirect is an `ip rule from <port cidr> lookup <table>` plus a
//! default route in that table. Remote redirects use a table derived from
//! the port's CIDR and own their default route. Local redirects share the
//! router/SNAT link's table, whose default route belongs to the link.

use std::net::IpAddr;

use dvr::{DvrError, FixedIp, InterfaceDriver, IpNetwork, IpRule, IpVersion, Port, Result};
use tracing::{debug, warn};

use crate::link_local::SNAT_RT_TBL;
use crate::priority::PriorityAllocator;

const MASK_30: u32 = 0x3fff_ffff;
const MIN_V6_IDX: u32 = 32768;

/// Routing table (and rule priority) for a remote redirect of `cidr`.
///
/// IPv4 uses the address itself. IPv6 folds the CRC32 of the CIDR text into
/// 30 bits and keeps it clear of the low priorities.
pub fn snat_idx(cidr: &IpNetwork) -> u32 {
    match cidr.ip() {
        IpAddr::V4(ip) => u32::from(ip),
        IpAddr::V6(_) => {
            let crc = crc32fast::hash(cidr.to_string().as_bytes());
            let idx = (crc >> 30) ^ (crc & MASK_30);
            if idx < MIN_V6_IDX { idx + MASK_30 } else { idx }
        }
    }
}

/// Where an internal port's SNAT traffic is sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedirectTarget {
    /// A SNAT port on another host, reached over the internal network.
    Remote(Port),
    /// The local SNAT namespace, reached over the router/SNAT link.
    Local(Port),
}

impl RedirectTarget {
    pub fn port(&self) -> &Port {
        match self {
            Self::Remote(port) | Self::Local(port) => port,
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local(_))
    }
}

/// One installed redirect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnatRedirect {
    pub rule: IpRule,
    pub device: String,
    pub gateway: IpAddr,
    /// Whether the default route in `rule.table` was installed for this redirect.
    pub owns_route: bool,
}

impl SnatRedirect {
    pub fn is_local(&self) -> bool {
        !self.owns_route
    }
}

fn priority_key(cidr: &IpNetwork) -> String {
    cidr.to_string()
}

/// Redirects for every fixed IP of `port` that `target` has a gateway for.
///
/// `internal_device` is the port's `qr-` device; `link_device` the router
/// end of the SNAT link. Local redirects take their priority from
/// `priorities`.
pub fn plan(
    port: &Port,
    target: &RedirectTarget,
    internal_device: &str,
    link_device: &str,
    priorities: &mut PriorityAllocator,
) -> Result<Vec<SnatRedirect>> {
    let mut redirects = Vec::new();
    for fixed in &port.fixed_ips {
        let Some(gateway) = target.port().first_ip(fixed.version()).map(|ip| ip.ip_address) else {
            continue;
        };
        match plan_one(fixed, target, gateway, internal_device, link_device, priorities) {
            Ok(redirect) => redirects.push(redirect),
            Err(e) => {
                for planned in &redirects {
                    release(planned, priorities);
                }
                return Err(e);
            }
        }
    }
    Ok(redirects)
}

fn plan_one(
    fixed: &FixedIp,
    target: &RedirectTarget,
    gateway: IpAddr,
    internal_device: &str,
    link_device: &str,
    priorities: &mut PriorityAllocator,
) -> Result<SnatRedirect> {
    let cidr = fixed.cidr()?;
    let from = fixed.network()?;
    match target {
        RedirectTarget::Remote(_) => {
            let idx = snat_idx(&cidr);
            Ok(SnatRedirect {
                rule: IpRule {
                    from,
                    table: idx,
                    priority: idx,
                },
                device: internal_device.to_string(),
                gateway,
                owns_route: true,
            })
        }
        RedirectTarget::Local(_) => {
            let priority = priorities.allocate(&priority_key(&from)).ok_or_else(|| {
                DvrError::InvalidConfig(format!("no rule priority left for {from}"))
            })?;
            Ok(SnatRedirect {
                rule: IpRule {
                    from,
                    table: SNAT_RT_TBL,
                    priority,
                },
                device: link_device.to_string(),
                gateway,
                owns_route: false,
            })
        }
    }
}

/// Install `redirect` in `namespace`.
///
/// The rule goes in last. When it fails, a route added for the redirect is
/// taken out again, so a failed install leaves nothing to track.
pub async fn install(driver: &dyn InterfaceDriver, namespace: &str, redirect: &SnatRedirect) -> Result<()> {
    if IpVersion::of(redirect.gateway) == IpVersion::V4 {
        let key = format!("net.ipv4.conf.{}.send_redirects", redirect.device);
        driver.set_sysctl(namespace, &key, "0").await?;
    }
    if redirect.owns_route {
        driver
            .add_gateway(namespace, &redirect.device, redirect.gateway, Some(redirect.rule.table))
            .await?;
    }
    if let Err(e) = driver.add_ip_rule(namespace, &redirect.rule).await {
        if redirect.owns_route {
            drop_route(driver, namespace, redirect).await;
        }
        return Err(e);
    }
    debug!(
        namespace = %namespace,
        from = %redirect.rule.from,
        table = redirect.rule.table,
        via = %redirect.gateway,
        "SNAT redirect added"
    );
    Ok(())
}

async fn drop_route(driver: &dyn InterfaceDriver, namespace: &str, redirect: &SnatRedirect) {
    if let Err(e) = driver
        .delete_gateway(namespace, &redirect.device, redirect.gateway, Some(redirect.rule.table))
        .await
    {
        debug!(namespace = %namespace, table = redirect.rule.table, error = %e, "SNAT redirect route already gone");
    }
}

/// Give back the priority a local redirect holds. Remote redirects hold none.
pub fn release(redirect: &SnatRedirect, priorities: &mut PriorityAllocator) {
    if redirect.is_local() {
        priorities.release(&priority_key(&redirect.rule.from));
    }
}

/// Remove `redirect` from `namespace`, logging what could not be removed.
pub async fn remove(
    driver: &dyn InterfaceDriver,
    namespace: &str,
    redirect: &SnatRedirect,
    priorities: &mut PriorityAllocator,
) {
    if let Err(e) = driver.delete_ip_rule(namespace, &redirect.rule).await {
        warn!(namespace = %namespace, from = %redirect.rule.from, error = %e, "failed to remove SNAT redirect rule");
    }
    if redirect.owns_route {
        drop_route(driver, namespace, redirect).await;
    }
    release(redirect, priorities);
}
