//! relay-echo-server: a small MCP server over stdio
//!
//! Offers `echo`, `add` and `fail` tools, one resource and one prompt.
//! Useful for trying the relay without any external server and used by the
//! integration tests.

use std::io::Write;

use anyhow::Result;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

const PROTOCOL_VERSION: &str = "2024-11-05";
const GREETING_URI: &str = "echo://greeting";

const PARSE_ERROR: i64 = -32700;
const METHOD_NOT_FOUND: i64 = -32601;
const INVALID_PARAMS: i64 = -32602;

#[derive(Debug, Deserialize)]
struct Request {
    #[serde(default)]
    id: Option<Value>,
    method: String,
    #[serde(default)]
    params: Value,
}

struct RpcError {
    code: i64,
    message: String,
}

impl RpcError {
    fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

fn tool_definitions() -> Value {
    json!([
        {
            "name": "echo",
            "description": "Echo the given text back",
            "inputSchema": {
                "type": "object",
                "properties": {"text": {"type": "string"}},
                "required": ["text"]
            }
        },
        {
            "name": "add",
            "description": "Add two numbers",
            "inputSchema": {
                "type": "object",
                "properties": {"a": {"type": "number"}, "b": {"type": "number"}},
                "required": ["a", "b"]
            }
        },
        {
            "name": "fail",
            "description": "Always fails",
            "inputSchema": {"type": "object", "properties": {}}
        }
    ])
}

fn text_result(text: impl Into<String>, is_error: bool) -> Value {
    json!({
        "content": [{"type": "text", "text": text.into()}],
        "isError": is_error
    })
}

fn call_tool(params: &Value) -> Result<Value, RpcError> {
    let name = params["name"]
        .as_str()
        .ok_or_else(|| RpcError::new(INVALID_PARAMS, "Missing 'name' parameter"))?;
    let arguments = &params["arguments"];
    debug!(tool = %name, arguments = %arguments, "Tool call");

    match name {
        "echo" => {
            let text = arguments["text"].as_str().unwrap_or_default();
            Ok(text_result(text, false))
        }
        "add" => match (arguments["a"].as_f64(), arguments["b"].as_f64()) {
            (Some(a), Some(b)) => Ok(text_result((a + b).to_string(), false)),
            _ => Ok(text_result("add needs numeric 'a' and 'b'", true)),
        },
        "fail" => Ok(text_result("this tool always fails", true)),
        other => Err(RpcError::new(INVALID_PARAMS, format!("Unknown tool: {}", other))),
    }
}

fn handle(method: &str, params: &Value) -> Result<Value, RpcError> {
    match method {
        "initialize" => Ok(json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {"tools": {}, "resources": {}, "prompts": {}},
            "serverInfo": {"name": "relay-echo-server", "version": env!("CARGO_PKG_VERSION")}
        })),
        "ping" => Ok(json!({})),
        "tools/list" => Ok(json!({ "tools": tool_definitions() })),
        "tools/call" => call_tool(params),
        "resources/list" => Ok(json!({
            "resources": [{
                "uri": GREETING_URI,
                "name": "greeting",
                "description": "A friendly greeting",
                "mimeType": "text/plain"
            }]
        })),
        "resources/read" => match params["uri"].as_str() {
            Some(GREETING_URI) => Ok(json!({
                "contents": [{"uri": GREETING_URI, "mimeType": "text/plain", "text": "Hello from relay-echo-server"}]
            })),
            Some(uri) => Err(RpcError::new(INVALID_PARAMS, format!("Unknown resource: {}", uri))),
            None => Err(RpcError::new(INVALID_PARAMS, "Missing 'uri' parameter")),
        },
        "prompts/list" => Ok(json!({
            "prompts": [{
                "name": "shout",
                "description": "Ask for text in capitals",
                "arguments": [{"name": "text", "required": true}]
            }]
        })),
        "prompts/get" => match params["name"].as_str() {
            Some("shout") => {
                let text = params["arguments"]["text"].as_str().unwrap_or_default();
                Ok(json!({
                    "description": "Ask for text in capitals",
                    "messages": [{
                        "role": "user",
                        "content": {"type": "text", "text": format!("Repeat in capitals: {}", text)}
                    }]
                }))
            }
            _ => Err(RpcError::new(INVALID_PARAMS, "Unknown prompt")),
        },
        other => Err(RpcError::new(METHOD_NOT_FOUND, format!("Method not found: {}", other))),
    }
}

fn respond(out: &mut impl Write, id: Value, result: Result<Value, RpcError>) -> Result<()> {
    let message = match result {
        Ok(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
        Err(e) => json!({"jsonrpc": "2.0", "id": id, "error": {"code": e.code, "message": e.message}}),
    };
    writeln!(out, "{}", serde_json::to_string(&message)?)?;
    out.flush()?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let stdout = std::io::stdout();
    let mut out = stdout.lock();

    info!("relay-echo-server ready");

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let request: Request = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "Unparsable message");
                respond(&mut out, Value::Null, Err(RpcError::new(PARSE_ERROR, e.to_string())))?;
                continue;
            }
        };

        let result = handle(&request.method, &request.params);
        match request.id {
            Some(id) => respond(&mut out, id, result)?,
            // Notifications get no response
            None => debug!(method = %request.method, "Notification"),
        }
    }

    info!("stdin closed; exiting");
    Ok(())
}
