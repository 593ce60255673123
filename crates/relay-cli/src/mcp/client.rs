//! MCP client implementation
//!
//! Speaks the Model Context Protocol over any [`McpTransport`]. A client is
//! shared behind an `Arc` and may be used from several tasks at once unless
//! the server was declared single-client.

use super::transport::{JsonRpcRequest, JsonRpcResponse, McpTransport, TransportKind};
use anyhow::{bail, Context, Result};
use parking_lot::Mutex as SyncMutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// MCP protocol version
pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

/// Client capabilities
#[derive(Debug, Clone, Default, Serialize)]
pub struct ClientCapabilities {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub roots: Option<RootsCapability>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RootsCapability {
    pub list_changed: bool,
}

/// Client info for initialization
#[derive(Debug, Clone, Serialize)]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
}

impl Default for ClientInfo {
    fn default() -> Self {
        Self {
            name: "mcp-relay".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Server capabilities returned during initialization
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerCapabilities {
    #[serde(default)]
    pub tools: Option<Value>,
    #[serde(default)]
    pub resources: Option<Value>,
    #[serde(default)]
    pub prompts: Option<Value>,
    #[serde(default)]
    pub logging: Option<Value>,
}

/// Server info returned during initialization
#[derive(Debug, Clone, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    pub protocol_version: String,
    #[serde(default)]
    pub capabilities: ServerCapabilities,
    pub server_info: ServerInfo,
}

/// MCP Tool definition from server
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct McpToolInfo {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub input_schema: Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListToolsResult {
    tools: Vec<McpToolInfo>,
    #[serde(default)]
    next_cursor: Option<String>,
}

/// One content block of a tool result or prompt message
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentBlock {
    #[serde(rename = "type")]
    pub content_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// Embedded resource (`type: "resource"`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<ResourceContent>,
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content_type: "text".to_string(),
            text: Some(text.into()),
            data: None,
            mime_type: None,
            resource: None,
        }
    }
}

/// Tool call result
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallToolResult {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
    #[serde(default)]
    pub is_error: bool,
}

/// MCP Resource definition from server
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct McpResource {
    pub uri: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListResourcesResult {
    resources: Vec<McpResource>,
    #[serde(default)]
    next_cursor: Option<String>,
}

/// Resource content
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceContent {
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blob: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReadResourceResult {
    pub contents: Vec<ResourceContent>,
}

/// Prompt template offered by a server
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct McpPrompt {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub arguments: Vec<PromptArgument>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PromptArgument {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub required: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListPromptsResult {
    prompts: Vec<McpPrompt>,
    #[serde(default)]
    next_cursor: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PromptMessage {
    pub role: String,
    pub content: ContentBlock,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GetPromptResult {
    #[serde(default)]
    pub description: Option<String>,
    pub messages: Vec<PromptMessage>,
}

/// MCP Client
pub struct McpClient {
    server: String,
    transport: Arc<dyn McpTransport>,
    request_id: AtomicU64,
    timeout: Duration,
    /// Held around every request when the server is single-client
    serial: Option<Mutex<()>>,
    server_info: SyncMutex<Option<ServerInfo>>,
    server_capabilities: SyncMutex<Option<ServerCapabilities>>,
    initialized: AtomicBool,
}

impl McpClient {
    pub fn new(server: impl Into<String>, transport: Arc<dyn McpTransport>, timeout: Duration) -> Self {
        Self {
            server: server.into(),
            transport,
            request_id: AtomicU64::new(1),
            timeout,
            serial: None,
            server_info: SyncMutex::new(None),
            server_capabilities: SyncMutex::new(None),
            initialized: AtomicBool::new(false),
        }
    }

    /// Serialize all requests to this server
    pub fn single_client(mut self, single: bool) -> Self {
        self.serial = single.then(|| Mutex::new(()));
        self
    }

    fn next_id(&self) -> u64 {
        self.request_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.transport.kind()
    }

    /// Send a request and get the result
    async fn request<T: for<'de> Deserialize<'de>>(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<T> {
        let request = JsonRpcRequest::new(self.next_id(), method, params);

        let _serial = match &self.serial {
            Some(lock) => Some(lock.lock().await),
            None => None,
        };

        let response: JsonRpcResponse =
            tokio::time::timeout(self.timeout, self.transport.send_request(request))
                .await
                .with_context(|| {
                    format!("MCP request {} to '{}' timed out after {:?}", method, self.server, self.timeout)
                })??;

        if let Some(error) = response.error {
            bail!("MCP error: {}", error);
        }

        let result = response.result.context("MCP response missing result")?;
        let typed_result: T =
            serde_json::from_value(result).context("Failed to parse MCP result")?;

        Ok(typed_result)
    }

    fn ensure_initialized(&self) -> Result<()> {
        if !self.is_initialized() {
            bail!("MCP client for '{}' not initialized", self.server);
        }
        Ok(())
    }

    /// Perform the `initialize` handshake
    pub async fn initialize(&self) -> Result<InitializeResult> {
        let params = serde_json::json!({
            "protocolVersion": MCP_PROTOCOL_VERSION,
            "capabilities": ClientCapabilities::default(),
            "clientInfo": ClientInfo::default()
        });

        let result: InitializeResult = self
            .request("initialize", Some(params))
            .await
            .context("Failed to initialize MCP connection")?;

        self.transport
            .send_notification("notifications/initialized", None)
            .await?;

        tracing::debug!(
            server = %self.server,
            remote = %result.server_info.name,
            protocol = %result.protocol_version,
            "MCP handshake complete"
        );

        *self.server_info.lock() = Some(result.server_info.clone());
        *self.server_capabilities.lock() = Some(result.capabilities.clone());
        self.initialized.store(true, Ordering::SeqCst);

        Ok(result)
    }

    /// Check whether an already-running server answers without a handshake.
    ///
    /// Used when a server reports it was initialized by an earlier client, and
    /// to re-validate a transport that is still open. Success marks the
    /// client as initialized.
    pub async fn probe(&self) -> Result<()> {
        let _: ListToolsResult = self
            .request("tools/list", None)
            .await
            .context("Probe request failed")?;
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Mark the session unusable until the next probe or handshake
    pub fn invalidate(&self) {
        self.initialized.store(false, Ordering::SeqCst);
    }

    pub fn server_info(&self) -> Option<ServerInfo> {
        self.server_info.lock().clone()
    }

    pub fn server_capabilities(&self) -> Option<ServerCapabilities> {
        self.server_capabilities.lock().clone()
    }

    /// List available tools, following pagination cursors
    pub async fn list_tools(&self) -> Result<Vec<McpToolInfo>> {
        self.ensure_initialized()?;

        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let params = cursor.as_ref().map(|c| serde_json::json!({ "cursor": c }));

            let result: ListToolsResult = self
                .request("tools/list", params)
                .await
                .context("Failed to list MCP tools")?;

            tools.extend(result.tools);

            match result.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        Ok(tools)
    }

    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<CallToolResult> {
        self.ensure_initialized()?;

        let params = serde_json::json!({
            "name": name,
            "arguments": arguments
        });

        let result: CallToolResult = self
            .request("tools/call", Some(params))
            .await
            .with_context(|| format!("Failed to call MCP tool: {}", name))?;

        Ok(result)
    }

    /// List available resources
    pub async fn list_resources(&self) -> Result<Vec<McpResource>> {
        self.ensure_initialized()?;

        if let Some(caps) = self.server_capabilities() {
            if caps.resources.is_none() {
                return Ok(Vec::new());
            }
        }

        let mut resources = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let params = cursor.as_ref().map(|c| serde_json::json!({ "cursor": c }));

            let result: ListResourcesResult = self
                .request("resources/list", params)
                .await
                .context("Failed to list MCP resources")?;

            resources.extend(result.resources);

            match result.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        Ok(resources)
    }

    /// Read a resource by URI
    pub async fn read_resource(&self, uri: &str) -> Result<ReadResourceResult> {
        self.ensure_initialized()?;

        let result: ReadResourceResult = self
            .request("resources/read", Some(serde_json::json!({ "uri": uri })))
            .await
            .with_context(|| format!("Failed to read MCP resource: {}", uri))?;

        Ok(result)
    }

    pub async fn list_prompts(&self) -> Result<Vec<McpPrompt>> {
        self.ensure_initialized()?;

        if let Some(caps) = self.server_capabilities() {
            if caps.prompts.is_none() {
                return Ok(Vec::new());
            }
        }

        let mut prompts = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let params = cursor.as_ref().map(|c| serde_json::json!({ "cursor": c }));

            let result: ListPromptsResult = self
                .request("prompts/list", params)
                .await
                .context("Failed to list MCP prompts")?;

            prompts.extend(result.prompts);

            match result.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        Ok(prompts)
    }

    pub async fn get_prompt(&self, name: &str, arguments: Value) -> Result<GetPromptResult> {
        self.ensure_initialized()?;

        let params = serde_json::json!({
            "name": name,
            "arguments": arguments
        });

        self.request("prompts/get", Some(params))
            .await
            .with_context(|| format!("Failed to get MCP prompt: {}", name))
    }

    /// Ping the server
    pub async fn ping(&self) -> Result<()> {
        self.ensure_initialized()?;

        let _: Value = self.request("ping", None).await?;
        Ok(())
    }

    /// Close the connection
    pub async fn close(&self) -> Result<()> {
        self.invalidate();
        self.transport.close().await
    }

    /// Handshake done and transport still open
    pub fn is_connected(&self) -> bool {
        self.is_initialized() && self.transport.is_connected()
    }

    pub fn transport_open(&self) -> bool {
        self.transport.is_connected()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    /// Answers every request from a fixed table, recording method names
    struct TableTransport {
        calls: SyncMutex<Vec<String>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl TableTransport {
        fn new() -> Self {
            Self {
                calls: SyncMutex::new(Vec::new()),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl McpTransport for TableTransport {
        fn kind(&self) -> TransportKind {
            TransportKind::Stdio
        }

        async fn send_request(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse> {
            self.calls.lock().push(request.method.clone());
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let cursor = request
                .params
                .as_ref()
                .and_then(|p| p.get("cursor"))
                .and_then(Value::as_str)
                .map(str::to_string);

            let result = match (request.method.as_str(), cursor.as_deref()) {
                ("initialize", _) => serde_json::json!({
                    "protocolVersion": MCP_PROTOCOL_VERSION,
                    "capabilities": {"tools": {}},
                    "serverInfo": {"name": "table"}
                }),
                ("tools/list", None) => serde_json::json!({
                    "tools": [{"name": "a", "inputSchema": {"type": "object"}}],
                    "nextCursor": "page2"
                }),
                ("tools/list", Some(_)) => serde_json::json!({
                    "tools": [{"name": "b"}]
                }),
                ("resources/list", _) => serde_json::json!({"resources": []}),
                _ => serde_json::json!({}),
            };

            Ok(JsonRpcResponse {
                jsonrpc: "2.0".to_string(),
                id: Some(request.id),
                result: Some(result),
                error: None,
            })
        }

        async fn send_notification(&self, method: &str, _params: Option<Value>) -> Result<()> {
            self.calls.lock().push(method.to_string());
            Ok(())
        }

        fn is_connected(&self) -> bool {
            true
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_client_info_default() {
        let info = ClientInfo::default();
        assert_eq!(info.name, "mcp-relay");
    }

    #[tokio::test]
    async fn test_requires_handshake() {
        let client = McpClient::new("t", Arc::new(TableTransport::new()), Duration::from_secs(1));
        assert!(client.list_tools().await.is_err());
        assert!(client.ping().await.is_err());
    }

    #[tokio::test]
    async fn test_initialize_and_paginated_tools() {
        let transport = Arc::new(TableTransport::new());
        let client = McpClient::new("t", transport.clone(), Duration::from_secs(1));

        client.initialize().await.unwrap();
        assert!(client.is_connected());

        let tools = client.list_tools().await.unwrap();
        let names: Vec<_> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);

        // No resources capability advertised: no request made
        assert!(client.list_resources().await.unwrap().is_empty());

        let calls = transport.calls.lock().clone();
        assert_eq!(
            calls,
            vec!["initialize", "notifications/initialized", "tools/list", "tools/list"]
        );
    }

    #[tokio::test]
    async fn test_probe_marks_initialized() {
        let client = McpClient::new("t", Arc::new(TableTransport::new()), Duration::from_secs(1));
        client.probe().await.unwrap();
        assert!(client.is_initialized());
    }

    #[tokio::test]
    async fn test_single_client_serializes_requests() {
        let transport = Arc::new(TableTransport::new());
        let client = Arc::new(
            McpClient::new("t", transport.clone(), Duration::from_secs(1)).single_client(true),
        );
        client.probe().await.unwrap();

        let a = tokio::spawn({
            let client = client.clone();
            async move { client.ping().await }
        });
        let b = tokio::spawn({
            let client = client.clone();
            async move { client.ping().await }
        });
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        assert_eq!(transport.max_in_flight.load(Ordering::SeqCst), 1);
    }
}
