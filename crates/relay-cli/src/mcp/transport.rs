//! MCP transport layer
//!
//! Three transports carry JSON-RPC messages to a tool server: a launched
//! child process over stdio, streamable HTTP, and the legacy SSE transport.
//! All methods take `&self` so one transport can serve concurrent requests;
//! responses are matched to requests by id.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex as SyncMutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use url::Url;

use relay_core::sse::SseDecoder;

use super::config::ServerDescriptor;

/// Header carrying the streamable HTTP session
pub const SESSION_ID_HEADER: &str = "mcp-session-id";

/// JSON-RPC 2.0 request
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method: method.into(),
            params,
        }
    }
}

/// JSON-RPC 2.0 response
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub jsonrpc: String,
    pub id: Option<u64>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    /// Parse a message as a response; requests and notifications yield `None`
    pub fn from_value(value: Value) -> Option<Self> {
        if value.get("method").is_some() {
            return None;
        }
        if value.get("result").is_none() && value.get("error").is_none() {
            return None;
        }
        serde_json::from_value(value).ok()
    }
}

/// JSON-RPC 2.0 error
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

impl std::fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JSON-RPC error {}: {}", self.code, self.message)
    }
}

/// Which wire transport a connection uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum TransportKind {
    Stdio,
    StreamableHttp,
    Sse,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            TransportKind::Stdio => "stdio",
            TransportKind::StreamableHttp => "streamable-http",
            TransportKind::Sse => "sse",
        })
    }
}

/// Transport trait for MCP communication
#[async_trait]
pub trait McpTransport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Send a request and wait for its response
    async fn send_request(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse>;

    /// Send a notification (no response expected)
    async fn send_notification(&self, method: &str, params: Option<Value>) -> Result<()>;

    /// Check if transport is still usable
    fn is_connected(&self) -> bool;

    async fn close(&self) -> Result<()>;
}

fn notification(method: &str, params: Option<Value>) -> Value {
    match params {
        Some(params) => serde_json::json!({ "jsonrpc": "2.0", "method": method, "params": params }),
        None => serde_json::json!({ "jsonrpc": "2.0", "method": method }),
    }
}

type PendingMap = Arc<SyncMutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>>;

/// Route an incoming message to the request waiting for it
fn dispatch(pending: &PendingMap, server: &str, value: Value) {
    match JsonRpcResponse::from_value(value.clone()) {
        Some(response) => {
            let waiter = response.id.and_then(|id| pending.lock().remove(&id));
            match waiter {
                Some(tx) => {
                    let _ = tx.send(response);
                }
                None => tracing::debug!(server = %server, id = ?response.id, "Response for unknown request"),
            }
        }
        None => {
            let method = value.get("method").and_then(Value::as_str).unwrap_or("?");
            tracing::debug!(server = %server, method = %method, "Ignoring server message");
        }
    }
}

/// A registered waiter; dropping it unregisters the id, so a request that is
/// abandoned (timed out, cancelled) leaves nothing behind in the map
struct PendingRequest {
    pending: PendingMap,
    id: u64,
    rx: Option<oneshot::Receiver<JsonRpcResponse>>,
}

impl PendingRequest {
    fn register(pending: &PendingMap, id: u64) -> Self {
        let (tx, rx) = oneshot::channel();
        pending.lock().insert(id, tx);
        Self {
            pending: pending.clone(),
            id,
            rx: Some(rx),
        }
    }

    async fn response(mut self, server: &str) -> Result<JsonRpcResponse> {
        let rx = self.rx.take().context("Response already awaited")?;
        rx.await.with_context(|| {
            format!("MCP server '{}' closed before answering request {}", server, self.id)
        })
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.id);
    }
}

/// Stdio transport for MCP servers running as child processes
pub struct StdioTransport {
    server: String,
    stdin: Mutex<ChildStdin>,
    child: Mutex<Child>,
    pending: PendingMap,
    connected: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<()>>,
}

impl StdioTransport {
    /// Spawn the server process and start reading its output
    pub fn spawn(descriptor: &ServerDescriptor) -> Result<Self> {
        let command = descriptor
            .command
            .as_deref()
            .with_context(|| format!("Server '{}' has no command", descriptor.key))?;

        let mut cmd = Command::new(command);
        cmd.args(&descriptor.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        for (key, value) in &descriptor.env {
            cmd.env(key, value);
        }

        if let Some(dir) = &descriptor.cwd {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn MCP server: {}", command))?;

        let stdin = child
            .stdin
            .take()
            .context("Failed to capture stdin of MCP server")?;
        let stdout = child
            .stdout
            .take()
            .context("Failed to capture stdout of MCP server")?;
        let stderr = child.stderr.take();

        let server = descriptor.key.clone();
        let pending: PendingMap = Arc::new(SyncMutex::new(HashMap::new()));
        let connected = Arc::new(AtomicBool::new(true));
        let mut tasks = Vec::new();

        let reader = {
            let server = server.clone();
            let pending = pending.clone();
            let connected = connected.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                loop {
                    match lines.next_line().await {
                        Ok(Some(line)) => {
                            let line = line.trim();
                            if line.is_empty() {
                                continue;
                            }
                            match serde_json::from_str::<Value>(line) {
                                Ok(value) => dispatch(&pending, &server, value),
                                Err(e) => {
                                    tracing::debug!(server = %server, error = %e, "Non-JSON output from MCP server")
                                }
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            tracing::warn!(server = %server, error = %e, "Failed to read from MCP server");
                            break;
                        }
                    }
                }
                tracing::debug!(server = %server, "MCP server stdout closed");
                connected.store(false, Ordering::SeqCst);
                // Dropping the senders fails every waiting request
                pending.lock().clear();
            })
        };
        tasks.push(reader);

        if let Some(stderr) = stderr {
            let server = server.clone();
            tasks.push(tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(server = %server, "stderr: {}", line);
                }
            }));
        }

        Ok(Self {
            server,
            stdin: Mutex::new(stdin),
            child: Mutex::new(child),
            pending,
            connected,
            tasks,
        })
    }

    async fn write_message(&self, value: &Value) -> Result<()> {
        let mut stdin = self.stdin.lock().await;
        let json = serde_json::to_string(value)?;

        stdin.write_all(json.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;

        Ok(())
    }
}

#[async_trait]
impl McpTransport for StdioTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
    }

    async fn send_request(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse> {
        if !self.is_connected() {
            bail!("MCP server '{}' is not running", self.server);
        }

        let waiter = PendingRequest::register(&self.pending, request.id);

        let value = serde_json::to_value(&request)?;
        self.write_message(&value)
            .await
            .context("Failed to write to MCP server")?;

        waiter.response(&self.server).await
    }

    async fn send_notification(&self, method: &str, params: Option<Value>) -> Result<()> {
        self.write_message(&notification(method, params)).await
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        self.pending.lock().clear();

        let mut child = self.child.lock().await;
        let _ = child.kill().await;

        Ok(())
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Streamable HTTP transport: every message is a POST to one endpoint
pub struct StreamableHttpTransport {
    url: String,
    client: reqwest::Client,
    session_id: SyncMutex<Option<String>>,
    connected: AtomicBool,
}

impl StreamableHttpTransport {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            url: url.into(),
            client,
            session_id: SyncMutex::new(None),
            connected: AtomicBool::new(true),
        })
    }

    pub fn session_id(&self) -> Option<String> {
        self.session_id.lock().clone()
    }

    async fn post(&self, body: &Value) -> Result<reqwest::Response> {
        let mut builder = self
            .client
            .post(&self.url)
            .header(reqwest::header::ACCEPT, "application/json, text/event-stream")
            .json(body);
        if let Some(session) = self.session_id() {
            builder = builder.header(SESSION_ID_HEADER, session);
        }

        let response = builder
            .send()
            .await
            .with_context(|| format!("Failed to send HTTP request to {}", self.url))?;

        if let Some(session) = response
            .headers()
            .get(SESSION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            *self.session_id.lock() = Some(session.to_string());
        }

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            bail!("MCP server returned error status {}: {}", status, text);
        }

        Ok(response)
    }
}

/// Find the response to `id` among the messages of one event or JSON body
fn match_response(data: &str, id: u64) -> Option<JsonRpcResponse> {
    let value: Value = serde_json::from_str(data).ok()?;
    let candidates = match value {
        Value::Array(items) => items,
        other => vec![other],
    };
    candidates
        .into_iter()
        .filter_map(JsonRpcResponse::from_value)
        .find(|r| r.id == Some(id))
}

#[async_trait]
impl McpTransport for StreamableHttpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::StreamableHttp
    }

    async fn send_request(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse> {
        let id = request.id;
        let response = self.post(&serde_json::to_value(&request)?).await?;

        let is_event_stream = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with("text/event-stream"));

        if !is_event_stream {
            let text = response
                .text()
                .await
                .context("Failed to read MCP response body")?;
            return match_response(&text, id)
                .with_context(|| format!("No JSON-RPC response to request {} in body", id));
        }

        let mut bytes = response.bytes_stream();
        let mut decoder = SseDecoder::new();
        while let Some(chunk) = bytes.next().await {
            let chunk = chunk.context("Failed to read MCP event stream")?;
            for event in decoder.push(&chunk) {
                if let Some(response) = match_response(&event.data, id) {
                    return Ok(response);
                }
            }
        }
        if let Some(response) = decoder
            .finish()
            .and_then(|event| match_response(&event.data, id))
        {
            return Ok(response);
        }

        bail!("Event stream ended without a response to request {}", id)
    }

    async fn send_notification(&self, method: &str, params: Option<Value>) -> Result<()> {
        self.post(&notification(method, params)).await?;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);

        let session = self.session_id.lock().take();
        if let Some(session) = session {
            let result = self
                .client
                .delete(&self.url)
                .header(SESSION_ID_HEADER, session)
                .send()
                .await;
            if let Err(e) = result {
                tracing::debug!(url = %self.url, error = %e, "Session DELETE failed");
            }
        }
        Ok(())
    }
}

/// Legacy SSE transport: a long-lived GET stream carries responses, requests
/// are POSTed to the endpoint announced by the first `endpoint` event
pub struct SseTransport {
    endpoint: Url,
    client: reqwest::Client,
    pending: PendingMap,
    connected: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl SseTransport {
    /// Open the event stream and wait for the endpoint announcement
    pub async fn connect(url: &str, timeout: Duration) -> Result<Self> {
        let base = Url::parse(url).with_context(|| format!("Invalid server URL: {}", url))?;
        let client = reqwest::Client::new();

        let response = tokio::time::timeout(
            timeout,
            client
                .get(base.clone())
                .header(reqwest::header::ACCEPT, "text/event-stream")
                .send(),
        )
        .await
        .with_context(|| format!("Timed out opening event stream at {}", url))?
        .with_context(|| format!("Failed to open event stream at {}", url))?;

        if !response.status().is_success() {
            bail!("Event stream request failed with status {}", response.status());
        }

        let pending: PendingMap = Arc::new(SyncMutex::new(HashMap::new()));
        let connected = Arc::new(AtomicBool::new(true));
        let (endpoint_tx, endpoint_rx) = oneshot::channel::<String>();

        let reader = {
            let pending = pending.clone();
            let connected = connected.clone();
            let server = url.to_string();
            tokio::spawn(async move {
                let mut endpoint_tx = Some(endpoint_tx);
                let mut bytes = response.bytes_stream();
                let mut decoder = SseDecoder::new();

                while let Some(chunk) = bytes.next().await {
                    let chunk = match chunk {
                        Ok(chunk) => chunk,
                        Err(e) => {
                            tracing::warn!(server = %server, error = %e, "Event stream read failed");
                            break;
                        }
                    };
                    for event in decoder.push(&chunk) {
                        let name = event.name().to_string();
                        match name.as_str() {
                            "endpoint" => {
                                if let Some(tx) = endpoint_tx.take() {
                                    let _ = tx.send(event.data);
                                }
                            }
                            "message" => match serde_json::from_str::<Value>(&event.data) {
                                Ok(value) => dispatch(&pending, &server, value),
                                Err(e) => {
                                    tracing::debug!(server = %server, error = %e, "Unparsable event data")
                                }
                            },
                            other => tracing::debug!(server = %server, event = %other, "Ignoring event"),
                        }
                    }
                }

                connected.store(false, Ordering::SeqCst);
                pending.lock().clear();
            })
        };

        let endpoint = match tokio::time::timeout(timeout, endpoint_rx).await {
            Ok(Ok(endpoint)) => endpoint,
            Ok(Err(_)) => {
                reader.abort();
                bail!("Event stream closed before announcing an endpoint");
            }
            Err(_) => {
                reader.abort();
                bail!("No endpoint event received within {:?}", timeout);
            }
        };

        let endpoint = match base.join(endpoint.trim()) {
            Ok(endpoint) => endpoint,
            Err(e) => {
                reader.abort();
                return Err(e).context("Invalid endpoint announced by server");
            }
        };
        tracing::debug!(endpoint = %endpoint, "SSE endpoint announced");

        Ok(Self {
            endpoint,
            client,
            pending,
            connected,
            reader,
        })
    }

    async fn post(&self, body: &Value) -> Result<()> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(body)
            .send()
            .await
            .with_context(|| format!("Failed to POST to {}", self.endpoint))?;

        if !response.status().is_success() {
            bail!("MCP server returned error status {}", response.status());
        }
        Ok(())
    }
}

#[async_trait]
impl McpTransport for SseTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Sse
    }

    async fn send_request(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse> {
        if !self.is_connected() {
            bail!("Event stream is closed");
        }

        let waiter = PendingRequest::register(&self.pending, request.id);
        self.post(&serde_json::to_value(&request)?).await?;

        waiter.response(self.endpoint.as_str()).await
    }

    async fn send_notification(&self, method: &str, params: Option<Value>) -> Result<()> {
        self.post(&notification(method, params)).await
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        self.reader.abort();
        self.pending.lock().clear();
        Ok(())
    }
}

impl Drop for SseTransport {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Opens transports for the negotiator; tests substitute in-memory fakes
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn open(
        &self,
        kind: TransportKind,
        descriptor: &ServerDescriptor,
    ) -> Result<Arc<dyn McpTransport>>;
}

/// Builds the real stdio, streamable HTTP and SSE transports
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultTransportFactory;

#[async_trait]
impl TransportFactory for DefaultTransportFactory {
    async fn open(
        &self,
        kind: TransportKind,
        descriptor: &ServerDescriptor,
    ) -> Result<Arc<dyn McpTransport>> {
        let timeout = Duration::from_secs(descriptor.timeout_secs);
        let url = || {
            descriptor
                .url
                .as_deref()
                .with_context(|| format!("Server '{}' has no url", descriptor.key))
        };

        let transport: Arc<dyn McpTransport> = match kind {
            TransportKind::Stdio => {
                let mut descriptor = descriptor.clone();
                descriptor.expand_env_vars()?;
                Arc::new(StdioTransport::spawn(&descriptor)?)
            }
            TransportKind::StreamableHttp => Arc::new(StreamableHttpTransport::new(url()?, timeout)?),
            TransportKind::Sse => Arc::new(SseTransport::connect(url()?, timeout).await?),
        };
        Ok(transport)
    }
}
