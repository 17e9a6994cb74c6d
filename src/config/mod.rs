//! Configuration module for aisd.

use crate::error::{AisError, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration for an aisd node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AisConfig {
    /// Node identity and role.
    pub node: NodeConfig,
    /// Network endpoints.
    pub net: NetConfig,
    /// Control-plane and data-plane timeouts.
    pub timeouts: TimeoutConf,
    /// Local filesystem configuration.
    pub fs: FsConfig,
    /// Downloader configuration.
    pub downloader: DownloaderConfig,
    /// Rebalance configuration.
    pub rebalance: RebalanceConfig,
    /// Cloud provider credentials and endpoints.
    pub cloud: CloudConfig,
    /// Logging configuration.
    pub log: LogConfig,
}

impl AisConfig {
    /// Load configuration from a JSON file, apply environment overrides,
    /// and validate.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| AisError::BadRequest(format!("failed to read config file: {}", e)))?;
        let mut config: Self = serde_json::from_str(&content)
            .map_err(|e| AisError::BadRequest(format!("failed to parse config: {}", e)))?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Environment variables recognized by the core.
    pub fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("AIS_URL").or_else(|_| std::env::var("AIS_ENDPOINT")) {
            self.net.cluster_url = url;
        }
        if let Ok(url) = std::env::var("AUTHN_URL") {
            self.net.authn_url = Some(url);
        }
        if let Ok(project) = std::env::var("GOOGLE_CLOUD_PROJECT") {
            self.cloud.gcp_project = Some(project);
        }
        if let Ok(account) = std::env::var("AZURE_STORAGE_ACCOUNT") {
            self.cloud.azure_account = Some(account);
        }
        if let Ok(key) = std::env::var("AZURE_STORAGE_KEY") {
            self.cloud.azure_key = Some(key);
        }
        if let Ok(url) = std::env::var("AIS_AZURE_URL") {
            self.cloud.azure_url = Some(url);
        }
        if let Ok(proto) = std::env::var("AIS_AZURE_PROTO") {
            self.cloud.azure_proto = Some(proto);
        }
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.node.role == NodeRole::Target && self.fs.mountpaths.is_empty() {
            return Err(AisError::BadRequest(
                "fs.mountpaths: targets require at least one mountpath".to_string(),
            ));
        }
        if self.downloader.queue_size == 0 {
            return Err(AisError::BadRequest(
                "downloader.queue_size must be non-zero".to_string(),
            ));
        }
        if self.fs.fshc.error_limit_read == 0 || self.fs.fshc.error_limit_write == 0 {
            return Err(AisError::BadRequest(
                "fs.fshc error limits must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Minimal single-node development configuration.
    pub fn development(role: NodeRole, mountpaths: Vec<PathBuf>) -> Self {
        Self {
            node: NodeConfig {
                name: format!("dev-{}", role),
                role,
                confdir: None,
            },
            net: NetConfig {
                public_addr: "127.0.0.1:8080".parse().expect("valid socket address"),
                intra_control_addr: "127.0.0.1:9080".parse().expect("valid socket address"),
                intra_data_addr: "127.0.0.1:10080".parse().expect("valid socket address"),
                cluster_url: "http://127.0.0.1:8080".to_string(),
                authn_url: None,
            },
            fs: FsConfig {
                mountpaths,
                ..FsConfig::default()
            },
            ..Default::default()
        }
    }
}

/// Node-specific configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Human-readable node name; the node id is content-addressed at
    /// first start and persisted separately.
    pub name: String,
    /// Node role in the cluster.
    pub role: NodeRole,
    /// Directory for versioned metadata files on proxies (targets keep
    /// theirs under the first mountpath). Unset means in-memory only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confdir: Option<PathBuf>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "aisd-node".to_string(),
            role: NodeRole::Target,
            confdir: None,
        }
    }
}

/// Node role enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Stateless request router; one elected primary holds authoritative
    /// metadata.
    Proxy,
    /// Stateful data-plane node.
    Target,
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeRole::Proxy => write!(f, "proxy"),
            NodeRole::Target => write!(f, "target"),
        }
    }
}

/// Network endpoints of this node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetConfig {
    pub public_addr: SocketAddr,
    pub intra_control_addr: SocketAddr,
    pub intra_data_addr: SocketAddr,
    /// URL of any cluster proxy, used to join.
    pub cluster_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authn_url: Option<String>,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            public_addr: "0.0.0.0:8080".parse().expect("valid socket address"),
            intra_control_addr: "0.0.0.0:9080".parse().expect("valid socket address"),
            intra_data_addr: "0.0.0.0:10080".parse().expect("valid socket address"),
            cluster_url: "http://127.0.0.1:8080".to_string(),
            authn_url: None,
        }
    }
}

/// Control-plane and data-plane timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConf {
    /// Ordinary control-plane operation (begin/abort broadcasts, polls).
    #[serde(with = "humantime_serde")]
    pub cplane: Duration,
    /// Keepalive ceiling; commits borrow it for critical broadcasts.
    #[serde(with = "humantime_serde")]
    pub max_keepalive: Duration,
    /// Long broadcasts (commit phase, rebalance status sweeps).
    #[serde(with = "humantime_serde")]
    pub long: Duration,
    /// Per-transaction deadline shipped to targets with `begin`.
    #[serde(with = "humantime_serde")]
    pub txn: Duration,
}

impl Default for TimeoutConf {
    fn default() -> Self {
        Self {
            cplane: Duration::from_secs(2),
            max_keepalive: Duration::from_secs(4),
            long: Duration::from_secs(30),
            txn: Duration::from_secs(20),
        }
    }
}

/// Local filesystem configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FsConfig {
    /// Mountpath roots registered at startup.
    pub mountpaths: Vec<PathBuf>,
    /// Filesystem health checker settings.
    pub fshc: FshcConfig,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            mountpaths: Vec::new(),
            fshc: FshcConfig::default(),
        }
    }
}

/// Filesystem health checker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FshcConfig {
    pub enabled: bool,
    /// Files read / written per probe.
    pub test_file_count: usize,
    /// Size of each temporary write probe.
    pub test_file_size: usize,
    pub error_limit_read: usize,
    pub error_limit_write: usize,
}

impl Default for FshcConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            test_file_count: 4,
            test_file_size: 1024,
            error_limit_read: 2,
            error_limit_write: 2,
        }
    }
}

/// Downloader configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloaderConfig {
    /// Per-jogger queue capacity.
    pub queue_size: usize,
    /// Per-job concurrency ceiling (throttler permits).
    pub job_concurrency: usize,
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            queue_size: 1000,
            job_concurrency: 8,
            request_timeout: Duration::from_secs(60),
        }
    }
}

/// Rebalance configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebalanceConfig {
    pub enabled: bool,
    /// Interval between rebalance-status polls.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
}

impl Default for RebalanceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval: Duration::from_millis(500),
        }
    }
}

/// Cloud provider credentials and endpoints.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CloudConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gcp_project: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub azure_account: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub azure_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub azure_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub azure_proto: Option<String>,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// tracing env-filter directive, e.g. "info" or "aisd=debug".
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_requires_mountpaths() {
        let config = AisConfig {
            node: NodeConfig {
                name: "t1".into(),
                role: NodeRole::Target,
                confdir: None,
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = AisConfig::development(NodeRole::Target, vec![PathBuf::from("/tmp/mp1")]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_proxy_needs_no_mountpaths() {
        let config = AisConfig::development(NodeRole::Proxy, vec![]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_roundtrip() {
        let config = AisConfig::development(NodeRole::Target, vec![PathBuf::from("/tmp/mp1")]);
        let json = serde_json::to_string_pretty(&config).unwrap();
        let back: AisConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.node.name, config.node.name);
        assert_eq!(back.timeouts.cplane, config.timeouts.cplane);
    }
}
