use std::path::Path;

use dvr_snat::{EdgeMode, Privilege, ROUTER_2_SNAT_IP, SNAT_LL_SUBNET, SnatConfig};
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};

use crate::error::{AgentError, AgentResult};

pub(crate) const DEFAULT_WORKER_QUEUE_DEPTH: usize = 64;

#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub host: String,
    #[serde(default)]
    pub edge_mode: EdgeModeConfig,
    #[serde(default)]
    pub external_network_bridge: Option<String>,
    #[serde(default)]
    pub network_device_mtu: Option<u32>,
    #[serde(default = "default_true")]
    pub use_ipv6: bool,
    #[serde(default = "default_link_local_pool")]
    pub link_local_pool: Ipv4Network,
    #[serde(default)]
    pub privilege: PrivilegeConfig,
    #[serde(default = "default_worker_queue_depth")]
    pub worker_queue_depth: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeModeConfig {
    #[default]
    Centralized,
    Local,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrivilegeConfig {
    #[default]
    Sudo,
    User,
}

fn default_true() -> bool {
    true
}

fn default_link_local_pool() -> Ipv4Network {
    SNAT_LL_SUBNET
        .parse()
        .unwrap_or_else(|_| Ipv4Network::from(ROUTER_2_SNAT_IP))
}

fn default_worker_queue_depth() -> usize {
    DEFAULT_WORKER_QUEUE_DEPTH
}

/// Load and validate an agent config from a YAML file.
pub async fn load(path: &Path) -> AgentResult<AgentConfig> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| AgentError::Config(format!("read {}: {e}", path.display())))?;
    let config: AgentConfig = serde_yaml_ng::from_str(&content)
        .map_err(|e| AgentError::Config(format!("parse {}: {e}", path.display())))?;
    config.validate()?;
    Ok(config)
}

impl AgentConfig {
    fn validate(&self) -> AgentResult<()> {
        if self.host.trim().is_empty() {
            return Err(AgentError::Config("host must not be empty".into()));
        }
        if self.link_local_pool.prefix() > 31 {
            return Err(AgentError::Config(format!(
                "link_local_pool {} must be a /31 or larger",
                self.link_local_pool
            )));
        }
        if self.worker_queue_depth == 0 {
            return Err(AgentError::Config("worker_queue_depth must be positive".into()));
        }
        Ok(())
    }

    /// Build the core's `SnatConfig` from this agent config.
    pub fn snat_config(&self) -> SnatConfig {
        let mode = match self.edge_mode {
            EdgeModeConfig::Centralized => EdgeMode::Centralized,
            EdgeModeConfig::Local => EdgeMode::Local,
        };
        let mut config = SnatConfig::new(self.host.clone(), mode);
        config.external_network_bridge = self.external_network_bridge.clone();
        config.network_device_mtu = self.network_device_mtu;
        config.use_ipv6 = self.use_ipv6;
        config
    }

    pub fn privilege(&self) -> Privilege {
        match self.privilege {
            PrivilegeConfig::Sudo => Privilege::Sudo,
            PrivilegeConfig::User => Privilege::User,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn write_config(yaml: &str) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dvr-agent.yaml");
        tokio::fs::write(&path, yaml).await.unwrap();
        (dir, path)
    }

    #[tokio::test]
    async fn load_full_config() {
        let (_dir, path) = write_config(
            r#"
host: compute-1
edge_mode: local
external_network_bridge: br-ex
network_device_mtu: 1450
use_ipv6: false
link_local_pool: 169.254.64.0/24
privilege: user
worker_queue_depth: 8
"#,
        )
        .await;

        let config = load(&path).await.unwrap();
        assert_eq!(config.host, "compute-1");
        assert_eq!(config.edge_mode, EdgeModeConfig::Local);
        assert_eq!(config.link_local_pool.prefix(), 24);
        assert_eq!(config.worker_queue_depth, 8);
        assert_eq!(config.privilege(), Privilege::User);

        let snat = config.snat_config();
        assert_eq!(snat.mode, EdgeMode::Local);
        assert_eq!(snat.external_network_bridge.as_deref(), Some("br-ex"));
        assert_eq!(snat.network_device_mtu, Some(1450));
        assert!(!snat.use_ipv6);
    }

    #[tokio::test]
    async fn load_applies_defaults() {
        let (_dir, path) = write_config("host: compute-2\n").await;

        let config = load(&path).await.unwrap();
        assert_eq!(config.edge_mode, EdgeModeConfig::Centralized);
        assert!(config.use_ipv6);
        assert_eq!(config.link_local_pool.to_string(), SNAT_LL_SUBNET);
        assert_eq!(config.privilege(), Privilege::Sudo);
        assert_eq!(config.worker_queue_depth, DEFAULT_WORKER_QUEUE_DEPTH);
        assert!(config.external_network_bridge.is_none());
    }

    #[tokio::test]
    async fn load_rejects_empty_host() {
        let (_dir, path) = write_config("host: ''\n").await;
        let err = load(&path).await.unwrap_err();
        assert!(err.to_string().contains("host"), "got: {err}");
    }

    #[tokio::test]
    async fn load_rejects_single_address_pool() {
        let (_dir, path) = write_config("host: h\nlink_local_pool: 169.254.0.1/32\n").await;
        let err = load(&path).await.unwrap_err();
        assert!(err.to_string().contains("link_local_pool"), "got: {err}");
    }

    #[tokio::test]
    async fn load_rejects_unknown_edge_mode() {
        let (_dir, path) = write_config("host: h\nedge_mode: sideways\n").await;
        let err = load(&path).await.unwrap_err();
        assert!(err.to_string().contains("parse"), "got: {err}");
    }

    #[tokio::test]
    async fn load_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = load(&dir.path().join("absent.yaml")).await.unwrap_err();
        assert!(matches!(err, AgentError::Config(_)));
    }
}
