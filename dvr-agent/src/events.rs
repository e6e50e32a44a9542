//! Router events as delivered by the control plane, one JSON object per line.
//!
//! ```json
//! {"router": {"id": "r1", ...}, "event": "external_gateway_added", "port": {...}}
//! ```

use std::net::IpAddr;

use dvr::{DvrError, Port, Router};
use dvr_snat::{ArpOperation, ArpUpdate, DvrEdgeRouter};
use serde::{Deserialize, Serialize};

use crate::error::{AgentError, AgentResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouterEvent {
    /// Router snapshot current as of this event.
    pub router: Router,
    #[serde(flatten)]
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventKind {
    ExternalGatewayAdded { port: Port },
    ExternalGatewayUpdated { port: Port },
    ExternalGatewayRemoved { port: Port },
    InternalNetworkAdded { port: Port },
    InternalNetworkRemoved { port: Port },
    /// The snapshot's routes replace the ones currently applied.
    RoutesUpdated,
    AddressScopeChanged,
    ArpEntryAdded { ip: IpAddr, mac: String, subnet_id: String },
    ArpEntryDeleted { ip: IpAddr, mac: String, subnet_id: String },
    RouterDeleted,
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ExternalGatewayAdded { .. } => "external_gateway_added",
            Self::ExternalGatewayUpdated { .. } => "external_gateway_updated",
            Self::ExternalGatewayRemoved { .. } => "external_gateway_removed",
            Self::InternalNetworkAdded { .. } => "internal_network_added",
            Self::InternalNetworkRemoved { .. } => "internal_network_removed",
            Self::RoutesUpdated => "routes_updated",
            Self::AddressScopeChanged => "address_scope_changed",
            Self::ArpEntryAdded { .. } => "arp_entry_added",
            Self::ArpEntryDeleted { .. } => "arp_entry_deleted",
            Self::RouterDeleted => "router_deleted",
        }
    }
}

/// Parse a JSON-lines event stream. Blank lines and `#` comments are skipped.
pub fn parse_events(content: &str) -> AgentResult<Vec<RouterEvent>> {
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| {
            let line = line.trim();
            !line.is_empty() && !line.starts_with('#')
        })
        .map(|(idx, line)| {
            serde_json::from_str(line)
                .map_err(|e| AgentError::Event(format!("line {}: {e}", idx + 1)))
        })
        .collect()
}

/// Feed one event into `router`, after adopting the event's snapshot.
pub async fn apply_event(router: &mut DvrEdgeRouter, event: RouterEvent) -> dvr::Result<()> {
    let old_routes = router.router().routes.clone();
    let new_routes = event.router.routes.clone();
    router.update_snapshot(event.router);

    match event.kind {
        EventKind::ExternalGatewayAdded { port } => {
            let device = router.external_device_name(&port);
            router.external_gateway_added(&port, &device).await
        }
        EventKind::ExternalGatewayUpdated { port } => {
            let device = router.external_device_name(&port);
            router.external_gateway_updated(&port, &device).await
        }
        EventKind::ExternalGatewayRemoved { port } => {
            let device = router.external_device_name(&port);
            router.external_gateway_removed(&port, &device).await
        }
        EventKind::InternalNetworkAdded { port } => router.internal_network_added(&port).await,
        EventKind::InternalNetworkRemoved { port } => router.internal_network_removed(&port).await,
        EventKind::RoutesUpdated => {
            router.routes_updated(&old_routes, &new_routes).await;
            Ok(())
        }
        EventKind::AddressScopeChanged => router.process_address_scope().await,
        EventKind::ArpEntryAdded { ip, mac, subnet_id } => {
            arp_result(router.update_arp_entry(ip, &mac, &subnet_id, ArpOperation::Add).await)
        }
        EventKind::ArpEntryDeleted { ip, mac, subnet_id } => {
            arp_result(router.update_arp_entry(ip, &mac, &subnet_id, ArpOperation::Delete).await)
        }
        EventKind::RouterDeleted => {
            router.delete().await;
            Ok(())
        }
    }
}

/// A deferred ARP entry is not an error; the router replays it later.
fn arp_result(update: ArpUpdate) -> dvr::Result<()> {
    match update {
        ArpUpdate::Applied | ArpUpdate::DeviceAbsent => Ok(()),
        ArpUpdate::Failed(detail) => Err(DvrError::Command(detail)),
    }
}
