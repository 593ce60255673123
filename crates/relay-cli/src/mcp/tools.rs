//! Tool catalog
//!
//! Tools from every connected server are exposed to the model under an
//! encoded name `<serverKey>__mcp__<rawName>`, so one flat namespace can be
//! routed back to the owning server.

use super::client::{CallToolResult, ContentBlock, McpPrompt, McpResource, McpToolInfo};
use super::error::McpError;
use super::lifecycle::ServerConnectionManager;
use futures::future::join_all;
use relay_core::ToolDefinition;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

/// Separator between server key and raw tool name
pub const TOOL_NAME_DELIMITER: &str = "__mcp__";

/// Encode a server key and raw tool name into a catalog name
pub fn encode_tool_name(server: &str, tool: &str) -> Result<String, McpError> {
    if tool.contains(TOOL_NAME_DELIMITER) {
        return Err(McpError::InvalidName(tool.to_string()));
    }
    if server.is_empty() || server.contains(TOOL_NAME_DELIMITER) {
        return Err(McpError::InvalidName(server.to_string()));
    }
    let encoded = format!("{}{}{}", server, TOOL_NAME_DELIMITER, tool);
    if encoded.find(TOOL_NAME_DELIMITER) != Some(server.len()) {
        return Err(McpError::InvalidName(server.to_string()));
    }
    Ok(encoded)
}

/// Split an encoded name into `(server, tool)`
pub fn decode_tool_name(encoded: &str) -> Result<(&str, &str), McpError> {
    match encoded.split_once(TOOL_NAME_DELIMITER) {
        Some((server, tool)) if !server.is_empty() && !tool.is_empty() => Ok((server, tool)),
        _ => Err(McpError::InvalidName(encoded.to_string())),
    }
}

/// A tool as exposed to the model
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    /// Encoded name
    pub name: String,
    pub description: String,
    pub parameters: Value,
    pub server: String,
    pub raw_name: String,
}

impl ToolDescriptor {
    pub fn from_info(server: &str, info: McpToolInfo) -> Result<Self, McpError> {
        let name = encode_tool_name(server, &info.name)?;
        Ok(Self {
            name,
            description: info
                .description
                .filter(|d| !d.is_empty())
                .unwrap_or_else(|| format!("{} tool from {}", info.name, server)),
            parameters: normalize_schema(info.input_schema),
            server: server.to_string(),
            raw_name: info.name,
        })
    }

    pub fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.parameters.clone(),
        }
    }
}

/// Backends expect an object schema; fill in what servers leave out
fn normalize_schema(schema: Value) -> Value {
    match schema {
        Value::Object(mut map) => {
            map.entry("type").or_insert_with(|| json!("object"));
            if map.get("type") == Some(&json!("object")) {
                map.entry("properties").or_insert_with(|| json!({}));
            }
            Value::Object(map)
        }
        _ => json!({ "type": "object", "properties": {} }),
    }
}

/// Resource tagged with the server that offers it
#[derive(Debug, Clone, Serialize)]
pub struct ServerResource {
    pub server: String,
    #[serde(flatten)]
    pub resource: McpResource,
}

/// Prompt tagged with the server that offers it
#[derive(Debug, Clone, Serialize)]
pub struct ServerPrompt {
    pub server: String,
    #[serde(flatten)]
    pub prompt: McpPrompt,
}

/// Tools available for a turn
#[derive(Debug, Clone, Default)]
pub struct ToolCatalog {
    tools: Vec<ToolDescriptor>,
}

impl ToolCatalog {
    pub fn new(tools: Vec<ToolDescriptor>) -> Self {
        Self { tools }
    }

    /// Connect every running-but-unconnected server, then gather tools from
    /// every connected one. Failing servers contribute nothing.
    pub async fn build(manager: &ServerConnectionManager) -> Self {
        let running = manager.running_servers().await;
        let connected = manager.connected_servers().await;
        let pending: Vec<&String> = running.iter().filter(|k| !connected.contains(k)).collect();

        let results = join_all(pending.iter().map(|key| manager.connect(key))).await;
        for (key, result) in pending.iter().zip(results) {
            if let Err(e) = result {
                warn!(server = %key, error = %e, "Server left out of tool catalog");
            }
        }

        let connected = manager.connected_servers().await;
        let listings = join_all(connected.iter().map(|key| manager.list_tools(key))).await;

        let mut tools = Vec::new();
        for (key, listing) in connected.iter().zip(listings) {
            let infos = match listing {
                Ok(infos) => infos,
                Err(e) => {
                    warn!(server = %key, error = %e, "Failed to list tools");
                    continue;
                }
            };
            debug!(server = %key, count = infos.len(), "Discovered tools");
            for info in infos {
                let raw = info.name.clone();
                match ToolDescriptor::from_info(key, info) {
                    Ok(descriptor) => tools.push(descriptor),
                    Err(e) => warn!(server = %key, tool = %raw, error = %e, "Skipping tool"),
                }
            }
        }

        Self { tools }
    }

    /// Subset for one turn. Entries may be encoded tool names or server keys;
    /// `None` keeps everything.
    pub fn select(&self, filter: Option<&[String]>) -> Self {
        let filter = match filter {
            Some(filter) => filter,
            None => return self.clone(),
        };

        let tools = self
            .tools
            .iter()
            .filter(|t| filter.iter().any(|f| *f == t.name || *f == t.server))
            .cloned()
            .collect();
        Self { tools }
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.iter().map(ToolDescriptor::definition).collect()
    }

    pub fn get(&self, encoded: &str) -> Option<&ToolDescriptor> {
        self.tools.iter().find(|t| t.name == encoded)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ToolDescriptor> {
        self.tools.iter()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub async fn resources(manager: &ServerConnectionManager) -> Vec<ServerResource> {
        let connected = manager.connected_servers().await;
        let listings = join_all(connected.iter().map(|key| manager.list_resources(key))).await;

        let mut resources = Vec::new();
        for (key, listing) in connected.into_iter().zip(listings) {
            match listing {
                Ok(list) => resources.extend(list.into_iter().map(|resource| ServerResource {
                    server: key.clone(),
                    resource,
                })),
                Err(e) => warn!(server = %key, error = %e, "Failed to list resources"),
            }
        }
        resources
    }

    pub async fn prompts(manager: &ServerConnectionManager) -> Vec<ServerPrompt> {
        let connected = manager.connected_servers().await;
        let listings = join_all(connected.iter().map(|key| manager.list_prompts(key))).await;

        let mut prompts = Vec::new();
        for (key, listing) in connected.into_iter().zip(listings) {
            match listing {
                Ok(list) => prompts.extend(list.into_iter().map(|prompt| ServerPrompt {
                    server: key.clone(),
                    prompt,
                })),
                Err(e) => warn!(server = %key, error = %e, "Failed to list prompts"),
            }
        }
        prompts
    }
}

/// Flatten content blocks into plain text
pub fn render_content(content: &[ContentBlock]) -> String {
    let mut parts = Vec::new();

    for block in content {
        match block.content_type.as_str() {
            "text" => {
                if let Some(text) = &block.text {
                    parts.push(text.clone());
                }
            }
            "image" | "audio" => {
                let mime = block.mime_type.as_deref().unwrap_or("unknown");
                parts.push(format!("[{} data: {}]", block.content_type, mime));
            }
            "resource" => match &block.resource {
                Some(resource) => match &resource.text {
                    Some(text) => parts.push(text.clone()),
                    None => parts.push(format!("[Resource: {}]", resource.uri)),
                },
                None => {
                    if let Some(text) = &block.text {
                        parts.push(format!("[Resource: {}]", text));
                    }
                }
            },
            _ => {
                if let Some(text) = &block.text {
                    parts.push(text.clone());
                }
            }
        }
    }

    parts.join("\n")
}

/// Tool-result message text for a successful call
pub fn render_result(result: &CallToolResult) -> String {
    render_content(&result.content)
}
