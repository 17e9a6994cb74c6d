//! aisd daemon entry point.
//!
//! Usage: `aisd [config.json]`. With no argument the node starts with
//! the development configuration (role and mountpaths from environment).

use std::path::PathBuf;

use aisd::config::{AisConfig, NodeRole};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> aisd::Result<()> {
    let config = match std::env::args().nth(1) {
        Some(path) => AisConfig::from_file(&PathBuf::from(path))?,
        None => {
            let role = match std::env::var("AIS_ROLE").as_deref() {
                Ok("proxy") => NodeRole::Proxy,
                _ => NodeRole::Target,
            };
            let mountpaths = std::env::var("AIS_MOUNTPATHS")
                .map(|raw| raw.split(',').map(PathBuf::from).collect())
                .unwrap_or_else(|_| vec![PathBuf::from("/tmp/ais/mp1")]);
            let mut config = AisConfig::development(role, mountpaths);
            config.apply_env();
            config
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log.level.clone())),
        )
        .init();

    aisd::run(config).await
}
