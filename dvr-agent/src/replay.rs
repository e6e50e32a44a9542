use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Args;
use dvr_snat::linux::{IpDriver, IptablesBackend};
use dvr_snat::{LinkLocalAllocator, RouterDeps};
use tokio::sync::Mutex;
use tracing::{error, info};

use crate::agent::LoggingAgent;
use crate::config;
use crate::error::{AgentError, AgentResult};
use crate::events::parse_events;
use crate::workers::WorkerPool;

#[derive(Args)]
pub struct ReplayArgs {
    /// JSON-lines file of router events, applied in order per router
    pub events: PathBuf,
}

pub async fn run_replay(config_path: &Path, args: ReplayArgs) -> AgentResult<()> {
    let config = config::load(config_path).await?;
    let content = tokio::fs::read_to_string(&args.events)
        .await
        .map_err(|e| AgentError::Event(format!("read {}: {e}", args.events.display())))?;
    let events = parse_events(&content)?;

    let privilege = config.privilege();
    let deps = RouterDeps {
        config: Arc::new(config.snat_config()),
        driver: Arc::new(IpDriver::new(privilege)),
        firewall: Arc::new(IptablesBackend::new(privilege)),
        agent: Arc::new(LoggingAgent),
    };
    let allocator = Arc::new(Mutex::new(LinkLocalAllocator::new(config.link_local_pool)?));
    let mut pool = WorkerPool::new(deps, allocator, config.worker_queue_depth);

    let total = events.len();
    info!(host = %config.host, events = total, "replaying router events");
    for event in events {
        let router_id = event.router.id.clone();
        if let Err(e) = pool.dispatch(event).await {
            error!(router_id = %router_id, error = %e, "failed to dispatch event");
        }
    }
    info!(routers = pool.active(), "waiting for router workers");
    pool.drain().await;
    info!(events = total, "replay complete");
    Ok(())
}
