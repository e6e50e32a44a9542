use async_trait::async_trait;
use dvr::{Port, Result};
use tracing::{debug, warn};

use super::{RouterContext, SnatVariant};
use crate::config::EdgeMode;
use crate::naming::SNAT_INT_DEV_PREFIX;
use crate::redirect::RedirectTarget;
use crate::scope::SnatInterface;

/// SNAT lives in a dedicated namespace on the gateway host. Internal
/// subnets reach it through per-subnet SNAT ports, wherever it is.
#[derive(Debug, Clone, Copy, Default)]
pub struct CentralizedEdge;

impl CentralizedEdge {
    async fn plug_snat_ports(ctx: &RouterContext) -> Result<()> {
        for snat_port in &ctx.router.snat_router_interfaces {
            ctx.plug_snat_port(snat_port).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl SnatVariant for CentralizedEdge {
    fn mode(&self) -> EdgeMode {
        EdgeMode::Centralized
    }

    async fn create_gateway(&self, ctx: &mut RouterContext, port: &Port, device: &str) -> Result<()> {
        ctx.snat_ns.create().await?;
        let gw_mtu = ctx.gw_mtu().or(port.mtu);
        ctx.snat_ns
            .create_rtr_2_snat_link(&ctx.ns_name, gw_mtu)
            .await?;
        Self::plug_snat_ports(ctx).await?;
        ctx.snat_ns.create_gateway_port(port, device).await?;
        ctx.apply_snat_rules(self).await?;
        ctx.notify_ready().await;
        ctx.sync_redirects(self).await
    }

    async fn update_gateway(&self, ctx: &mut RouterContext, port: &Port, device: &str) -> Result<()> {
        Self::plug_snat_ports(ctx).await?;
        ctx.snat_ns.refresh_gateway_port(port, device).await?;
        ctx.apply_snat_rules(self).await?;
        ctx.sync_redirects(self).await
    }

    async fn remove_gateway(&self, ctx: &mut RouterContext, _port: &Port, device: &str) -> Result<()> {
        ctx.teardown_gateway(device).await;
        ctx.sync_redirects(self).await
    }

    async fn internal_port_added(&self, ctx: &mut RouterContext, port: &Port) -> Result<()> {
        if ctx.router.gw_port.is_some() {
            let target = self.redirect_target(ctx, port).await;
            ctx.set_port_redirects(port, target.as_ref()).await?;
        }
        if !ctx.is_snat_host() {
            return Ok(());
        }
        let Some(snat_port) = ctx.router.snat_port_for_internal_port(port).cloned() else {
            debug!(port_id = %port.id, "no SNAT port for internal port");
            return Ok(());
        };
        if !ctx.snat_ns.exists().await {
            return Ok(());
        }
        ctx.plug_snat_port(&snat_port).await?;
        ctx.apply_snat_rules(self).await
    }

    async fn internal_port_removed(&self, ctx: &mut RouterContext, port: &Port) -> Result<()> {
        ctx.remove_port_redirects(&port.id).await;
        if ctx.router.gw_port.is_none() || !ctx.is_snat_host() {
            return Ok(());
        }
        let Some(snat_port) = ctx.router.snat_port_for_internal_port(port) else {
            return Ok(());
        };
        let device = ctx.namer.snat_internal(&snat_port.id);
        let ns = ctx.snat_ns.name();
        if ctx.driver.device_exists(&device, ns).await {
            if let Err(e) = ctx
                .driver
                .unplug(&device, None, ns, SNAT_INT_DEV_PREFIX)
                .await
            {
                warn!(device = %device, error = %e, "failed to unplug SNAT port");
            }
        }
        Ok(())
    }

    fn snat_interfaces_for(&self, ctx: &RouterContext) -> Vec<SnatInterface> {
        ctx.router
            .interfaces
            .iter()
            .filter_map(|port| {
                let snat_port = ctx.router.snat_port_for_internal_port(port)?;
                Some(SnatInterface {
                    device: ctx.namer.snat_internal(&snat_port.id),
                    scopes: port.address_scopes.clone(),
                })
            })
            .collect()
    }

    async fn redirect_target(&self, ctx: &RouterContext, port: &Port) -> Option<RedirectTarget> {
        ctx.remote_target(port)
    }
}
