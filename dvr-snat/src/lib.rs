//! DVR edge router SNAT management.
//!
//! [`DvrEdgeRouter`] drives the placement of a router's SNAT namespace
//! through gateway events, on top of the collaborator traits of the `dvr`
//! crate. [`linux`] implements those traits with iproute2 and iptables.

mod arp;
mod command;
mod config;
mod host;
mod link_local;
pub mod linux;
mod naming;
mod nat;
mod prerequisites;
mod priority;
mod redirect;
mod router;
mod routes;
mod scope;
mod snat_ns;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use arp::{ArpOperation, ArpUpdate};
pub use command::{CommandError, Privilege};
pub use config::{EdgeMode, SnatConfig};
pub use host::is_snat_host;
pub use link_local::{
    LinkLocalAddressPair, LinkLocalAllocator, ROUTER_2_SNAT_IP, SNAT_2_ROUTER_IP, SNAT_LL_SUBNET,
    SNAT_RT_TBL,
};
pub use naming::{DeviceNamer, router_ns_name, snat_ns_name};
pub use nat::{DeferredBatch, NatRuleManager};
pub use prerequisites::check_prerequisites;
pub use redirect::{RedirectTarget, SnatRedirect, snat_idx};
pub use router::{
    CentralizedEdge, DvrEdgeRouter, GatewayPlan, GatewayState, LocalEdge, RouterContext,
    RouterDeps, SnatVariant, plan_gateway_update,
};
pub use routes::{RouteOperation, diff_routes};
pub use scope::{ScopeMark, ScopeMarkAllocator};
pub use snat_ns::{GatewayChange, SnatNamespace};
