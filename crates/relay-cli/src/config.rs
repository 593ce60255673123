//! Configuration for the relay
//!
//! Read from `relay.toml`, found in the current directory or one of its
//! parents, then `<config dir>/mcp-relay/relay.toml`. Without a file the
//! built-in defaults apply and no servers are registered.

use anyhow::{Context, Result};
use relay_core::BackendConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::agent::TurnConfig;
use crate::mcp::config::{parse_servers_from_yaml, ServerDescriptor, ServerRegistry};

pub const CONFIG_FILE_NAME: &str = "relay.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub backend: BackendConfig,

    #[serde(default)]
    pub turn: TurnConfig,

    /// Tool servers by key
    #[serde(default)]
    pub servers: BTreeMap<String, ServerDescriptor>,

    /// YAML file with an `mcp_servers:` map, merged under `servers`
    #[serde(default)]
    pub servers_file: Option<PathBuf>,

    /// File this configuration was read from
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

impl AppConfig {
    /// Load from `path`, or search the usual locations when `None`
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => Some(path.to_path_buf()),
            None => Self::find_config_path(),
        };

        match path {
            Some(path) => Self::load_from(&path),
            None => {
                debug!("No {} found; using defaults", CONFIG_FILE_NAME);
                Ok(Self::default())
            }
        }
    }

    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;

        let mut config: AppConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        config.source = Some(path.to_path_buf());

        if let Some(servers_file) = config.servers_file.clone() {
            let servers_file = match path.parent() {
                Some(dir) if servers_file.is_relative() => dir.join(servers_file),
                _ => servers_file,
            };
            config.merge_yaml_servers(&servers_file)?;
        }

        info!(
            path = %path.display(),
            servers = config.servers.len(),
            "Loaded configuration"
        );
        Ok(config)
    }

    /// Add servers from a YAML file; entries already in `servers` win
    fn merge_yaml_servers(&mut self, path: &Path) -> Result<()> {
        let yaml = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let servers = parse_servers_from_yaml(&yaml)
            .with_context(|| format!("Failed to parse {}", path.display()))?;

        for (key, descriptor) in servers {
            self.servers.entry(key).or_insert(descriptor);
        }
        Ok(())
    }

    /// Search the current directory and up to ten parents, then the user
    /// config directory
    pub fn find_config_path() -> Option<PathBuf> {
        if let Ok(mut current) = std::env::current_dir() {
            for _ in 0..10 {
                let candidate = current.join(CONFIG_FILE_NAME);
                if candidate.exists() {
                    return Some(candidate);
                }
                if !current.pop() {
                    break;
                }
            }
        }

        let candidate = dirs::config_dir()?.join("mcp-relay").join(CONFIG_FILE_NAME);
        candidate.exists().then_some(candidate)
    }

    /// Validated server registry
    pub fn registry(&self) -> Result<ServerRegistry> {
        ServerRegistry::from_map(self.servers.clone())
    }
}
