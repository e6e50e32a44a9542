use async_trait::async_trait;
use dvr::RouterAgent;
use tracing::info;

/// Reports SNAT readiness in the log; no firewall-policy component is attached.
#[derive(Debug, Default)]
pub struct LoggingAgent;

#[async_trait]
impl RouterAgent for LoggingAgent {
    async fn notify_router_ready_for_rules(&self, router_id: &str, snat_namespace: &str) {
        info!(router_id = %router_id, namespace = %snat_namespace, "router ready for firewall rules");
    }
}
