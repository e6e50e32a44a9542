use async_trait::async_trait;

/// Callback into the surrounding agent.
#[async_trait]
pub trait RouterAgent: Send + Sync {
    /// A SNAT namespace and its gateway device now exist for `router_id`;
    /// firewall-policy components may attach their rules to `snat_namespace`.
    async fn notify_router_ready_for_rules(&self, router_id: &str, snat_namespace: &str);
}
