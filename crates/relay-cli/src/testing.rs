//! In-memory doubles for tool servers and model backends used by unit tests

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use relay_core::{BackendCapabilities, BackendError, ChatRequest, Fragment, FragmentStream, ModelBackend};

use crate::mcp::config::ServerDescriptor;
use crate::mcp::transport::{
    JsonRpcError, JsonRpcRequest, JsonRpcResponse, McpTransport, TransportFactory, TransportKind,
};

/// Scripted tool server. Clones share call counters and switches.
#[derive(Clone)]
pub struct FakeServer {
    tools: Arc<Vec<String>>,
    failing: Vec<TransportKind>,
    already_initialized: bool,
    call_delay: Option<Duration>,
    ping_fails: Arc<AtomicBool>,
    handshakes: Arc<AtomicUsize>,
    calls: Arc<Mutex<Vec<(String, Value)>>>,
}

impl FakeServer {
    pub fn new(tools: &[&str]) -> Self {
        Self {
            tools: Arc::new(tools.iter().map(|t| t.to_string()).collect()),
            failing: Vec::new(),
            already_initialized: false,
            call_delay: None,
            ping_fails: Arc::new(AtomicBool::new(false)),
            handshakes: Arc::new(AtomicUsize::new(0)),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Refuse to open over `kind`
    pub fn failing_on(mut self, kind: TransportKind) -> Self {
        self.failing.push(kind);
        self
    }

    /// Reject `initialize` the way a server that was started elsewhere does
    pub fn already_initialized(mut self) -> Self {
        self.already_initialized = true;
        self
    }

    /// Sleep before answering every `tools/call`
    pub fn with_call_delay(mut self, delay: Duration) -> Self {
        self.call_delay = Some(delay);
        self
    }

    pub fn set_ping_fails(&self, fails: bool) {
        self.ping_fails.store(fails, Ordering::SeqCst);
    }

    pub fn handshakes(&self) -> usize {
        self.handshakes.load(Ordering::SeqCst)
    }

    /// `(tool, arguments)` for every `tools/call` received
    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().clone()
    }

    async fn answer(&self, method: &str, params: Option<Value>) -> Result<Value, JsonRpcError> {
        let params = params.unwrap_or(Value::Null);
        match method {
            "initialize" => {
                self.handshakes.fetch_add(1, Ordering::SeqCst);
                if self.already_initialized {
                    return Err(rpc_error(-32600, "Server already initialized"));
                }
                Ok(json!({
                    "protocolVersion": "2024-11-05",
                    "capabilities": {"tools": {}, "resources": {}, "prompts": {}},
                    "serverInfo": {"name": "fake", "version": "0.0.0"}
                }))
            }
            "tools/list" => {
                let tools: Vec<Value> = self
                    .tools
                    .iter()
                    .map(|name| {
                        json!({
                            "name": name,
                            "description": format!("fake {}", name),
                            "inputSchema": {"type": "object", "properties": {}}
                        })
                    })
                    .collect();
                Ok(json!({ "tools": tools }))
            }
            "tools/call" => {
                let name = params["name"].as_str().unwrap_or_default().to_string();
                let arguments = params.get("arguments").cloned().unwrap_or(Value::Null);
                self.calls.lock().push((name.clone(), arguments.clone()));

                if let Some(delay) = self.call_delay {
                    tokio::time::sleep(delay).await;
                }
                if !self.tools.contains(&name) {
                    return Err(rpc_error(-32602, &format!("Unknown tool: {}", name)));
                }
                if name == "fail" {
                    return Ok(json!({
                        "content": [{"type": "text", "text": "failed on purpose"}],
                        "isError": true
                    }));
                }
                Ok(json!({
                    "content": [{"type": "text", "text": format!("{}: {}", name, arguments)}]
                }))
            }
            "ping" => {
                if self.ping_fails.load(Ordering::SeqCst) {
                    Err(rpc_error(-32000, "not responding"))
                } else {
                    Ok(json!({}))
                }
            }
            "resources/list" => Ok(json!({
                "resources": [{"uri": "fake://readme", "name": "readme", "mimeType": "text/plain"}]
            })),
            "resources/read" => Ok(json!({
                "contents": [{"uri": params["uri"], "mimeType": "text/plain", "text": "fake contents"}]
            })),
            "prompts/list" => Ok(json!({
                "prompts": [{"name": "greet", "arguments": [{"name": "who", "required": true}]}]
            })),
            other => Err(rpc_error(-32601, &format!("Method not found: {}", other))),
        }
    }
}

fn rpc_error(code: i64, message: &str) -> JsonRpcError {
    JsonRpcError {
        code,
        message: message.to_string(),
        data: None,
    }
}

struct FakeTransport {
    server: FakeServer,
    kind: TransportKind,
    open: AtomicBool,
}

#[async_trait]
impl McpTransport for FakeTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    async fn send_request(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse> {
        if !self.open.load(Ordering::SeqCst) {
            bail!("transport closed");
        }
        let (result, error) = match self.server.answer(&request.method, request.params).await {
            Ok(result) => (Some(result), None),
            Err(error) => (None, Some(error)),
        };
        Ok(JsonRpcResponse {
            jsonrpc: "2.0".to_string(),
            id: Some(request.id),
            result,
            error,
        })
    }

    async fn send_notification(&self, _method: &str, _params: Option<Value>) -> Result<()> {
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<()> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// Transport factory backed by [`FakeServer`]s, recording every open attempt
#[derive(Default)]
pub struct ScriptedFactory {
    servers: HashMap<String, FakeServer>,
    opened: Mutex<Vec<(String, TransportKind)>>,
}

impl ScriptedFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_server(mut self, key: &str, server: FakeServer) -> Self {
        self.servers.insert(key.to_string(), server);
        self
    }

    pub fn opened(&self) -> Vec<(String, TransportKind)> {
        self.opened.lock().clone()
    }

    /// `initialize` requests seen across all servers
    pub fn handshakes(&self) -> usize {
        self.servers.values().map(FakeServer::handshakes).sum()
    }
}

#[async_trait]
impl TransportFactory for ScriptedFactory {
    async fn open(
        &self,
        kind: TransportKind,
        descriptor: &ServerDescriptor,
    ) -> Result<Arc<dyn McpTransport>> {
        self.opened.lock().push((descriptor.key.clone(), kind));

        let Some(server) = self.servers.get(&descriptor.key) else {
            bail!("no scripted server '{}'", descriptor.key);
        };
        if server.failing.contains(&kind) {
            bail!("{} refused", kind);
        }
        Ok(Arc::new(FakeTransport {
            server: server.clone(),
            kind,
            open: AtomicBool::new(true),
        }))
    }
}

/// One scripted reply of a [`ScriptedBackend`]
pub enum Reply {
    /// Stream these fragments and end
    Fragments(Vec<Fragment>),
    /// Stream these fragments and then never end
    Stall(Vec<Fragment>),
    /// Reject the request as too large
    Overflow,
    /// Fail as if the endpoint were down
    Unreachable,
}

/// Model backend that answers requests from a queue of replies
pub struct ScriptedBackend {
    replies: Mutex<VecDeque<Reply>>,
    requests: Mutex<Vec<ChatRequest>>,
    capabilities: BackendCapabilities,
}

impl ScriptedBackend {
    pub fn new(replies: Vec<Reply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
            capabilities: BackendCapabilities::default(),
        }
    }

    pub fn with_capabilities(mut self, capabilities: BackendCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Every request received, in order
    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl ModelBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    fn default_model(&self) -> &str {
        "scripted-model"
    }

    fn capabilities(&self, _model: &str) -> BackendCapabilities {
        self.capabilities
    }

    async fn stream_chat(
        &self,
        request: ChatRequest,
        _cancel: CancellationToken,
    ) -> Result<FragmentStream, BackendError> {
        self.requests.lock().push(request);
        let reply = self.replies.lock().pop_front();

        match reply {
            Some(Reply::Fragments(fragments)) => {
                Ok(futures::stream::iter(fragments.into_iter().map(Ok)).boxed())
            }
            Some(Reply::Stall(fragments)) => Ok(futures::stream::iter(fragments.into_iter().map(Ok))
                .chain(futures::stream::pending())
                .boxed()),
            Some(Reply::Overflow) => Err(BackendError::from_status(
                400,
                "This model's maximum context length is 8192 tokens".to_string(),
            )),
            Some(Reply::Unreachable) => Err(BackendError::Other(anyhow::anyhow!("connection refused"))),
            None => Err(BackendError::Other(anyhow::anyhow!("no scripted reply left"))),
        }
    }
}

/// `ToolCall` fragment shorthand
pub fn call_fragment(index: usize, id: Option<&str>, name: Option<&str>, arguments: Option<&str>) -> Fragment {
    Fragment::ToolCall {
        index,
        id: id.map(str::to_string),
        name: name.map(str::to_string),
        arguments: arguments.map(str::to_string),
    }
}
