use std::path::Path;

use tracing::info;

use crate::config;
use crate::error::AgentResult;

/// Verify the host can run the agent with the given config.
pub async fn run_check(config_path: &Path) -> AgentResult<()> {
    let config = config::load(config_path).await?;
    dvr_snat::check_prerequisites(&config.snat_config(), config.privilege()).await?;
    info!(host = %config.host, edge_mode = ?config.edge_mode, "[OK] host prerequisites");
    Ok(())
}
