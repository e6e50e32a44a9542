//! Static route synchronization between the router and SNAT namespaces.

use dvr::{InterfaceDriver, Route, RouteEntry};
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOperation {
    /// Add or replace.
    Replace,
    Remove,
}

/// Operations turning `old` into `new`.
///
/// Routes only in `new` are replaced in. Routes only in `old` are removed,
/// unless a route in `new` has the same destination and already replaces it.
pub fn diff_routes(old: &[Route], new: &[Route]) -> Vec<(RouteOperation, Route)> {
    let mut ops = Vec::new();
    for route in old.iter().filter(|r| !new.contains(r)) {
        if new.iter().any(|n| n.destination == route.destination) {
            continue;
        }
        ops.push((RouteOperation::Remove, route.clone()));
    }
    for route in new.iter().filter(|r| !old.contains(r)) {
        ops.push((RouteOperation::Replace, route.clone()));
    }
    ops
}

/// Where a route update must land.
#[derive(Debug, Clone, Copy)]
pub struct RouteTargets<'a> {
    pub router_ns: &'a str,
    /// SNAT namespace, when this host hosts SNAT for a router with a gateway.
    pub snat_ns: Option<&'a str>,
}

/// Apply `operation` to the router namespace and, when expected, the SNAT namespace.
///
/// A missing SNAT namespace is logged; the router namespace is still
/// updated. Failures are logged, never returned.
pub async fn update_routing_table(
    driver: &dyn InterfaceDriver,
    targets: RouteTargets<'_>,
    operation: RouteOperation,
    route: &Route,
) {
    if let Some(snat_ns) = targets.snat_ns {
        if driver.namespace_exists(snat_ns).await {
            apply(driver, snat_ns, operation, route).await;
        } else {
            error!(namespace = %snat_ns, "SNAT namespace does not exist for the router");
        }
    }
    apply(driver, targets.router_ns, operation, route).await;
}

async fn apply(driver: &dyn InterfaceDriver, namespace: &str, operation: RouteOperation, route: &Route) {
    let entry = RouteEntry::via(route.destination, route.nexthop);
    let result = match operation {
        RouteOperation::Replace => driver.add_route(namespace, &entry).await,
        RouteOperation::Remove => driver.delete_route(namespace, &entry).await,
    };
    match result {
        Ok(()) => debug!(
            namespace = %namespace,
            destination = %route.destination,
            nexthop = %route.nexthop,
            ?operation,
            "route updated"
        ),
        Err(e) => warn!(
            namespace = %namespace,
            destination = %route.destination,
            ?operation,
            error = %e,
            "route update failed"
        ),
    }
}
