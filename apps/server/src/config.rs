//! Server configuration.
//!
//! Supports loading from YAML files with environment variable overrides.

use std::net::IpAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Server configuration loaded from YAML with environment overrides.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the HTTP server binds to.
    /// Override: `PRISMCAST_BIND_ADDR`
    pub bind_addr: IpAddr,

    /// Port for the HTTP API.
    /// Override: `PRISMCAST_HTTP_PORT`
    pub http_port: u16,

    /// Port for the worker control plane.
    /// Override: `PRISMCAST_CONTROL_PORT`
    pub control_port: u16,

    /// Path to the channel/proxy catalog file (YAML).
    /// Override: `PRISMCAST_CATALOG`
    pub catalog: PathBuf,

    /// Directory for generated artifacts and the logo cache.
    /// Override: `PRISMCAST_DATA_DIR`
    pub data_dir: PathBuf,

    /// Core tunables (relay, coordinator, pipeline).
    pub core: prismcast_core::Config,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::from([0, 0, 0, 0]),
            http_port: 8470,
            control_port: 8471,
            catalog: PathBuf::from("catalog.yaml"),
            data_dir: PathBuf::from("data"),
            core: prismcast_core::Config::default(),
        }
    }
}

impl ServerConfig {
    /// Loads configuration from a YAML file, then applies environment
    /// overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        config
            .core
            .validate()
            .map_err(|e| anyhow::anyhow!("invalid core configuration: {e}"))?;
        Ok(config)
    }

    /// Applies environment variable overrides to the configuration.
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("PRISMCAST_BIND_ADDR") {
            if let Ok(addr) = val.parse() {
                self.bind_addr = addr;
            }
        }
        if let Ok(val) = std::env::var("PRISMCAST_HTTP_PORT") {
            if let Ok(port) = val.parse() {
                self.http_port = port;
            }
        }
        if let Ok(val) = std::env::var("PRISMCAST_CONTROL_PORT") {
            if let Ok(port) = val.parse() {
                self.control_port = port;
            }
        }
        if let Ok(val) = std::env::var("PRISMCAST_CATALOG") {
            self.catalog = PathBuf::from(val);
        }
        // Note: PRISMCAST_DATA_DIR is handled by clap via #[arg(env = ...)]
        // in main.rs.
    }

    /// Resolves the core config with data-dir-relative paths applied.
    pub fn to_core_config(&self) -> prismcast_core::Config {
        let mut core = self.core.clone();
        core.pipeline.output_dir = self.data_dir.join("output");
        core.pipeline.logo_dir = self.data_dir.join("logos");
        core
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = ServerConfig::default();
        assert!(config.core.validate().is_ok());
        assert_eq!(config.http_port, 8470);
    }

    #[test]
    fn core_paths_follow_data_dir() {
        let mut config = ServerConfig::default();
        config.data_dir = PathBuf::from("/srv/prismcast");
        let core = config.to_core_config();
        assert_eq!(core.pipeline.output_dir, PathBuf::from("/srv/prismcast/output"));
        assert_eq!(core.pipeline.logo_dir, PathBuf::from("/srv/prismcast/logos"));
    }
}
