//! Tool-server connection lifecycle
//!
//! [`ServerConnectionManager`] owns one slot per registered server. Each slot
//! sits behind its own async mutex so concurrent connects for the same server
//! are serialized; the client handle is cloned out of the lock before any
//! tool invocation so calls from different sessions run concurrently.

use super::client::{CallToolResult, GetPromptResult, McpClient, McpPrompt, McpResource, McpToolInfo, ReadResourceResult};
use super::config::{ServerDescriptor, ServerRegistry};
use super::error::{ConnectAttempt, McpError};
use super::tools::render_content;
use super::transport::{DefaultTransportFactory, TransportFactory, TransportKind};
use futures::future::join_all;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Order in which transports are tried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectPreference {
    /// Remote transports first, launching locally as the fallback
    RemoteFirst,
    /// Launch locally first, remote transports as the fallback
    LaunchFirst,
}

/// Walks an ordered list of transports until one completes a handshake
pub struct TransportNegotiator {
    factory: Arc<dyn TransportFactory>,
}

impl TransportNegotiator {
    pub fn new(factory: Arc<dyn TransportFactory>) -> Self {
        Self { factory }
    }

    /// Transports to try for a descriptor, in order
    pub fn plan(descriptor: &ServerDescriptor, preference: ConnectPreference) -> Vec<TransportKind> {
        let remote: &[TransportKind] = if descriptor.url.is_some() {
            &[TransportKind::StreamableHttp, TransportKind::Sse]
        } else {
            &[]
        };
        let local: &[TransportKind] = if descriptor.command.is_some() {
            &[TransportKind::Stdio]
        } else {
            &[]
        };

        match preference {
            ConnectPreference::RemoteFirst => remote.iter().chain(local).copied().collect(),
            ConnectPreference::LaunchFirst => local.iter().chain(remote).copied().collect(),
        }
    }

    /// Try each planned transport; the first successful handshake wins
    pub async fn negotiate(
        &self,
        descriptor: &ServerDescriptor,
        preference: ConnectPreference,
    ) -> Result<Arc<McpClient>, McpError> {
        let mut attempts = Vec::new();

        for kind in Self::plan(descriptor, preference) {
            debug!(server = %descriptor.key, transport = %kind, "Trying transport");
            match self.attempt(kind, descriptor).await {
                Ok(client) => {
                    info!(server = %descriptor.key, transport = %kind, "MCP server connected");
                    return Ok(client);
                }
                Err(e) => {
                    debug!(server = %descriptor.key, transport = %kind, error = %format!("{:#}", e), "Transport attempt failed");
                    attempts.push(ConnectAttempt {
                        kind,
                        error: format!("{:#}", e),
                    });
                }
            }
        }

        Err(McpError::ConnectionFailed {
            server: descriptor.key.clone(),
            attempts,
        })
    }

    async fn attempt(
        &self,
        kind: TransportKind,
        descriptor: &ServerDescriptor,
    ) -> anyhow::Result<Arc<McpClient>> {
        let transport = self.factory.open(kind, descriptor).await?;
        let client = McpClient::new(
            descriptor.key.clone(),
            transport,
            Duration::from_secs(descriptor.timeout_secs),
        )
        .single_client(descriptor.single_client);

        let handshake = match client.initialize().await {
            Ok(_) => Ok(()),
            Err(e) if format!("{:#}", e).to_lowercase().contains("already") => {
                debug!(server = %descriptor.key, "Server already initialized; probing");
                client.probe().await
            }
            Err(e) => Err(e),
        };

        match handshake {
            Ok(()) => Ok(Arc::new(client)),
            Err(e) => {
                if let Err(close_err) = client.close().await {
                    debug!(server = %descriptor.key, error = %close_err, "Error closing failed transport");
                }
                Err(e)
            }
        }
    }
}

/// Connection state of one server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ServerState {
    /// No transport
    Stopped,
    /// Transport present but not (or no longer) usable
    Started,
    /// Transport present and handshake succeeded
    Connected,
    /// Last start or connect failed
    Failed,
}

impl std::fmt::Display for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ServerState::Stopped => "stopped",
            ServerState::Started => "started",
            ServerState::Connected => "connected",
            ServerState::Failed => "failed",
        })
    }
}

struct ServerSlot {
    descriptor: ServerDescriptor,
    client: Option<Arc<McpClient>>,
    connected: bool,
    last_error: Option<String>,
}

impl ServerSlot {
    fn state(&self) -> ServerState {
        match (&self.client, self.connected) {
            (Some(_), true) => ServerState::Connected,
            (Some(_), false) => ServerState::Started,
            (None, _) if self.last_error.is_some() => ServerState::Failed,
            (None, _) => ServerState::Stopped,
        }
    }

    fn connected_client(&self) -> Option<Arc<McpClient>> {
        match &self.client {
            Some(client) if self.connected && client.transport_open() => Some(client.clone()),
            _ => None,
        }
    }

    async fn close_client(&mut self) {
        self.connected = false;
        if let Some(client) = self.client.take() {
            if let Err(e) = client.close().await {
                warn!(server = %self.descriptor.key, error = %e, "Error closing MCP server");
            }
        }
    }
}

/// Summary of a server's status
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerSummary {
    pub key: String,
    pub transport: Option<TransportKind>,
    pub state: ServerState,
    pub last_error: Option<String>,
}

/// Owns every tool-server connection
pub struct ServerConnectionManager {
    registry: ServerRegistry,
    negotiator: TransportNegotiator,
    slots: HashMap<String, Arc<Mutex<ServerSlot>>>,
}

impl ServerConnectionManager {
    pub fn new(registry: ServerRegistry) -> Self {
        Self::with_factory(registry, Arc::new(DefaultTransportFactory))
    }

    pub fn with_factory(registry: ServerRegistry, factory: Arc<dyn TransportFactory>) -> Self {
        let slots = registry
            .iter()
            .map(|descriptor| {
                let slot = ServerSlot {
                    descriptor: descriptor.clone(),
                    client: None,
                    connected: false,
                    last_error: None,
                };
                (descriptor.key.clone(), Arc::new(Mutex::new(slot)))
            })
            .collect();

        Self {
            registry,
            negotiator: TransportNegotiator::new(factory),
            slots,
        }
    }

    pub fn registry(&self) -> &ServerRegistry {
        &self.registry
    }

    fn slot(&self, key: &str) -> Result<Arc<Mutex<ServerSlot>>, McpError> {
        self.slots
            .get(key)
            .cloned()
            .ok_or_else(|| McpError::UnknownServer(key.to_string()))
    }

    /// Start every auto-start server concurrently.
    ///
    /// Never fails; returns the keys of servers that could not be started.
    pub async fn start_all(&self) -> Vec<String> {
        let keys: Vec<String> = self
            .registry
            .iter()
            .filter(|d| {
                if !d.auto_start {
                    debug!(server = %d.key, "Skipping MCP server (auto_start=false)");
                }
                d.auto_start
            })
            .map(|d| d.key.clone())
            .collect();

        let results = join_all(keys.iter().map(|key| self.start_server(key))).await;

        keys.into_iter()
            .zip(results)
            .filter_map(|(key, result)| match result {
                Ok(()) => None,
                Err(e) => {
                    warn!(server = %key, error = %e, "Failed to start MCP server");
                    Some(key)
                }
            })
            .collect()
    }

    /// Launch-first negotiation for one server
    pub async fn start_server(&self, key: &str) -> Result<(), McpError> {
        let slot = self.slot(key)?;
        let mut slot = slot.lock().await;

        if slot.connected_client().is_some() {
            return Ok(());
        }
        slot.close_client().await;

        let preference = if slot.descriptor.command.is_some() {
            ConnectPreference::LaunchFirst
        } else {
            ConnectPreference::RemoteFirst
        };
        info!(server = %key, "Starting MCP server");
        self.establish(&mut slot, preference).await
    }

    /// Make sure a server is connected, reusing an open transport when it
    /// still answers.
    pub async fn connect(&self, key: &str) -> Result<(), McpError> {
        let slot = self.slot(key)?;
        let mut slot = slot.lock().await;

        if slot.connected_client().is_some() {
            return Ok(());
        }

        if let Some(client) = slot.client.clone() {
            if client.transport_open() {
                match client.probe().await {
                    Ok(()) => {
                        debug!(server = %key, "Existing transport re-validated");
                        slot.connected = true;
                        slot.last_error = None;
                        return Ok(());
                    }
                    Err(e) => debug!(server = %key, error = %e, "Probe failed; reconnecting"),
                }
            }
            slot.close_client().await;
        }

        self.establish(&mut slot, ConnectPreference::RemoteFirst).await
    }

    async fn establish(&self, slot: &mut ServerSlot, preference: ConnectPreference) -> Result<(), McpError> {
        match self.negotiator.negotiate(&slot.descriptor, preference).await {
            Ok(client) => {
                slot.client = Some(client);
                slot.connected = true;
                slot.last_error = None;
                Ok(())
            }
            Err(e) => {
                slot.last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    /// Client handle for a connected server, cloned out of the slot lock
    pub async fn client(&self, key: &str) -> Result<Arc<McpClient>, McpError> {
        let slot = self.slot(key)?;
        let slot = slot.lock().await;
        slot.connected_client()
            .ok_or_else(|| McpError::NotConnected(key.to_string()))
    }

    pub async fn list_tools(&self, key: &str) -> Result<Vec<McpToolInfo>, McpError> {
        let client = self.client(key).await?;
        Ok(client.list_tools().await?)
    }

    /// Invoke a tool once. A result flagged `isError` becomes
    /// [`McpError::ToolExecution`].
    pub async fn call_tool(&self, key: &str, tool: &str, arguments: Value) -> Result<CallToolResult, McpError> {
        let client = self.client(key).await?;
        let result = client.call_tool(tool, arguments).await?;

        if result.is_error {
            return Err(McpError::ToolExecution {
                server: key.to_string(),
                tool: tool.to_string(),
                message: render_content(&result.content),
            });
        }
        Ok(result)
    }

    pub async fn list_resources(&self, key: &str) -> Result<Vec<McpResource>, McpError> {
        let client = self.client(key).await?;
        Ok(client.list_resources().await?)
    }

    pub async fn read_resource(&self, key: &str, uri: &str) -> Result<ReadResourceResult, McpError> {
        let client = self.client(key).await?;
        Ok(client.read_resource(uri).await?)
    }

    pub async fn list_prompts(&self, key: &str) -> Result<Vec<McpPrompt>, McpError> {
        let client = self.client(key).await?;
        Ok(client.list_prompts().await?)
    }

    pub async fn get_prompt(&self, key: &str, name: &str, arguments: Value) -> Result<GetPromptResult, McpError> {
        let client = self.client(key).await?;
        Ok(client.get_prompt(name, arguments).await?)
    }

    /// Close a server's transport. Never fails for a registered server.
    pub async fn disconnect(&self, key: &str) -> Result<(), McpError> {
        let slot = self.slot(key)?;
        let mut slot = slot.lock().await;
        if slot.client.is_some() {
            debug!(server = %key, "Disconnecting MCP server");
        }
        slot.close_client().await;
        Ok(())
    }

    /// Disconnect and forget the last error
    pub async fn stop_server(&self, key: &str) -> Result<(), McpError> {
        let slot = self.slot(key)?;
        let mut slot = slot.lock().await;
        if slot.client.is_some() {
            info!(server = %key, "Stopping MCP server");
        }
        slot.close_client().await;
        slot.last_error = None;
        Ok(())
    }

    pub async fn stop_all(&self) {
        let keys: Vec<&str> = self.registry.keys().collect();
        join_all(keys.into_iter().map(|key| self.stop_server(key))).await;
    }

    /// Servers with a transport, connected or not
    pub async fn running_servers(&self) -> Vec<String> {
        self.keys_where(|slot| slot.client.is_some()).await
    }

    pub async fn connected_servers(&self) -> Vec<String> {
        self.keys_where(|slot| slot.connected_client().is_some()).await
    }

    async fn keys_where(&self, predicate: impl Fn(&ServerSlot) -> bool) -> Vec<String> {
        let mut keys = Vec::new();
        for key in self.registry.keys() {
            if let Some(slot) = self.slots.get(key) {
                if predicate(&*slot.lock().await) {
                    keys.push(key.to_string());
                }
            }
        }
        keys
    }

    pub async fn summary(&self) -> Vec<ServerSummary> {
        let mut summaries = Vec::new();
        for key in self.registry.keys() {
            if let Some(slot) = self.slots.get(key) {
                let slot = slot.lock().await;
                summaries.push(ServerSummary {
                    key: key.to_string(),
                    transport: slot.client.as_ref().map(|c| c.transport_kind()),
                    state: slot.state(),
                    last_error: slot.last_error.clone(),
                });
            }
        }
        summaries
    }

    /// Ping every connected server. A failed ping marks the server not
    /// connected but keeps its transport for a later probe.
    pub async fn health_check(&self) -> BTreeMap<String, bool> {
        let mut results = BTreeMap::new();

        for key in self.registry.keys() {
            let client = match self.client(key).await {
                Ok(client) => client,
                Err(_) => {
                    results.insert(key.to_string(), false);
                    continue;
                }
            };

            let error = match timeout(HEALTH_CHECK_TIMEOUT, client.ping()).await {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(_) => Some("Health check timed out".to_string()),
            };

            match error {
                None => {
                    results.insert(key.to_string(), true);
                }
                Some(error) => {
                    warn!(server = %key, error = %error, "MCP server health check failed");
                    if let Some(slot) = self.slots.get(key) {
                        let mut slot = slot.lock().await;
                        slot.connected = false;
                        slot.last_error = Some(error);
                    }
                    client.invalidate();
                    results.insert(key.to_string(), false);
                }
            }
        }

        results
    }
}
