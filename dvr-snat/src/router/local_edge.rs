use async_trait::async_trait;
use dvr::{Port, Result};

use super::{RouterContext, SnatVariant};
use crate::config::EdgeMode;
use crate::redirect::RedirectTarget;
use crate::scope::SnatInterface;

/// SNAT co-located with the router on the gateway host.
///
/// While this host holds the gateway, internal traffic goes over the
/// router/SNAT link; otherwise it goes to the remote SNAT port. Moving
/// between the two removes every redirect before the namespace changes and
/// re-adds them afterwards, so no port ever has two.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalEdge;

#[async_trait]
impl SnatVariant for LocalEdge {
    fn mode(&self) -> EdgeMode {
        EdgeMode::Local
    }

    async fn create_gateway(&self, ctx: &mut RouterContext, port: &Port, device: &str) -> Result<()> {
        ctx.clear_redirects().await;
        ctx.snat_ns.create_gateway_port(port, device).await?;
        let gw_mtu = ctx.gw_mtu().or(port.mtu);
        ctx.snat_ns
            .create_rtr_2_snat_link(&ctx.ns_name, gw_mtu)
            .await?;
        ctx.apply_snat_rules(self).await?;
        ctx.notify_ready().await;
        ctx.sync_redirects(self).await
    }

    async fn update_gateway(&self, ctx: &mut RouterContext, port: &Port, device: &str) -> Result<()> {
        ctx.snat_ns.refresh_gateway_port(port, device).await?;
        let gw_mtu = ctx.gw_mtu().or(port.mtu);
        ctx.snat_ns
            .create_rtr_2_snat_link(&ctx.ns_name, gw_mtu)
            .await?;
        ctx.apply_snat_rules(self).await?;
        ctx.sync_redirects(self).await
    }

    async fn remove_gateway(&self, ctx: &mut RouterContext, _port: &Port, device: &str) -> Result<()> {
        ctx.clear_redirects().await;
        ctx.teardown_gateway(device).await;
        ctx.sync_redirects(self).await
    }

    async fn internal_port_added(&self, ctx: &mut RouterContext, port: &Port) -> Result<()> {
        if ctx.router.gw_port.is_none() {
            return Ok(());
        }
        let target = self.redirect_target(ctx, port).await;
        ctx.set_port_redirects(port, target.as_ref()).await?;
        ctx.apply_snat_rules(self).await
    }

    async fn internal_port_removed(&self, ctx: &mut RouterContext, port: &Port) -> Result<()> {
        ctx.remove_port_redirects(&port.id).await;
        Ok(())
    }

    fn snat_interfaces_for(&self, ctx: &RouterContext) -> Vec<SnatInterface> {
        let device = ctx.snat_ns.snat_to_router_device();
        ctx.router
            .interfaces
            .iter()
            .map(|port| SnatInterface {
                device: device.clone(),
                scopes: port.address_scopes.clone(),
            })
            .collect()
    }

    async fn redirect_target(&self, ctx: &RouterContext, port: &Port) -> Option<RedirectTarget> {
        if ctx.is_snat_host() && ctx.snat_ns.exists().await {
            Some(RedirectTarget::Local(ctx.snat_ns.local_snat_port().await))
        } else {
            ctx.remote_target(port)
        }
    }
}
