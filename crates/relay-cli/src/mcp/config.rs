//! Tool-server descriptors and the server registry
//!
//! Descriptors come from `[servers.<key>]` tables in relay.toml or from an
//! `mcp_servers:` YAML map.

use anyhow::{bail, Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use super::tools::TOOL_NAME_DELIMITER;

/// How to reach one tool server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerDescriptor {
    /// Unique key; filled in from the table/map key
    #[serde(default, skip_serializing)]
    pub key: String,
    /// Command to launch the server locally
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment overrides for the launched process (supports ${VAR})
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    /// Remote endpoint (streamable HTTP or legacy SSE)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    /// Launch this server from `start_all`
    #[serde(default = "default_auto_start")]
    pub auto_start: bool,
    /// The server cannot handle concurrent requests
    #[serde(default)]
    pub single_client: bool,
    /// Handshake and request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_auto_start() -> bool {
    true
}

fn default_timeout() -> u64 {
    30
}

impl ServerDescriptor {
    /// Descriptor for a locally launched server
    pub fn local(key: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            command: Some(command.into()),
            ..Self::empty(key)
        }
    }

    /// Descriptor for a remote server
    pub fn remote(key: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Self::empty(key)
        }
    }

    fn empty(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            command: None,
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
            url: None,
            description: String::new(),
            category: None,
            auto_start: true,
            single_client: false,
            timeout_secs: default_timeout(),
        }
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_single_client(mut self, single_client: bool) -> Self {
        self.single_client = single_client;
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    /// Expand environment variables in env values
    pub fn expand_env_vars(&mut self) -> Result<()> {
        for value in self.env.values_mut() {
            *value = expand_env_string(value)?;
        }
        Ok(())
    }

    /// Check key syntax and that there is some way to reach the server
    pub fn validate(&self) -> Result<()> {
        validate_key(&self.key)?;
        if self.command.is_none() && self.url.is_none() {
            bail!("Server '{}' needs a command or a url", self.key);
        }
        Ok(())
    }
}

/// Server keys are embedded in tool names, so they are restricted to
/// `[A-Za-z0-9_-]` and may not contain the tool-name delimiter.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        bail!("Server key must not be empty");
    }
    if !key
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        bail!("Server key '{}' may only contain letters, digits, '_' and '-'", key);
    }
    if key.contains(TOOL_NAME_DELIMITER) {
        bail!("Server key '{}' must not contain '{}'", key, TOOL_NAME_DELIMITER);
    }
    // A tail like `__mcp` would merge with the delimiter when encoded
    if format!("{}{}", key, TOOL_NAME_DELIMITER).find(TOOL_NAME_DELIMITER) != Some(key.len()) {
        bail!("Server key '{}' must not end in part of '{}'", key, TOOL_NAME_DELIMITER);
    }
    Ok(())
}

/// Expand ${VAR} patterns in a string using environment variables
pub fn expand_env_string(s: &str) -> Result<String> {
    let mut result = s.to_string();
    let re = Regex::new(r"\$\{([^}]+)\}").context("Invalid env pattern")?;

    for cap in re.captures_iter(s) {
        let var_name = &cap[1];
        let var_value = std::env::var(var_name)
            .with_context(|| format!("Environment variable {} not set", var_name))?;
        result = result.replace(&cap[0], &var_value);
    }

    Ok(result)
}

/// Immutable set of validated server descriptors, iterated in key order
#[derive(Debug, Clone, Default)]
pub struct ServerRegistry {
    servers: BTreeMap<String, ServerDescriptor>,
}

impl ServerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a key → descriptor map, rejecting invalid entries
    pub fn from_map(servers: BTreeMap<String, ServerDescriptor>) -> Result<Self> {
        let mut validated = BTreeMap::new();
        for (key, mut descriptor) in servers {
            descriptor.key = key.clone();
            descriptor
                .validate()
                .with_context(|| format!("Invalid server descriptor '{}'", key))?;
            validated.insert(key, descriptor);
        }
        Ok(Self { servers: validated })
    }

    /// Build from a list of descriptors whose keys are already set
    pub fn from_descriptors(descriptors: impl IntoIterator<Item = ServerDescriptor>) -> Result<Self> {
        let mut map = BTreeMap::new();
        for descriptor in descriptors {
            let key = descriptor.key.clone();
            if map.insert(key.clone(), descriptor).is_some() {
                bail!("Duplicate server key '{}'", key);
            }
        }
        Self::from_map(map)
    }

    pub fn get(&self, key: &str) -> Option<&ServerDescriptor> {
        self.servers.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.servers.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.servers.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ServerDescriptor> {
        self.servers.values()
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}

/// Parse an `mcp_servers:` map from a YAML document
pub fn parse_servers_from_yaml(yaml_str: &str) -> Result<BTreeMap<String, ServerDescriptor>> {
    let value: serde_yaml::Value =
        serde_yaml::from_str(yaml_str).context("Failed to parse YAML")?;

    let servers = match value.get("mcp_servers") {
        Some(servers) => servers.clone(),
        None => return Ok(BTreeMap::new()),
    };

    let servers: BTreeMap<String, ServerDescriptor> =
        serde_yaml::from_value(servers).context("Failed to parse mcp_servers configuration")?;

    Ok(servers)
}
