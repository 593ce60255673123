//! Chat message types shared by backends and the turn orchestrator

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Message author
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tool call requested by the model.
///
/// `arguments` stays the raw text the backend streamed; it is only parsed
/// when the call is executed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallRequest {
    pub id: String,
    /// Encoded `<serverKey><delimiter><rawName>` tool name
    pub name: String,
    #[serde(default)]
    pub arguments: String,
}

impl ToolCallRequest {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments: String::new(),
        }
    }

    pub fn with_arguments(mut self, arguments: impl Into<String>) -> Self {
        self.arguments = arguments.into();
        self
    }

    /// Parse the argument buffer into a JSON object.
    ///
    /// An empty buffer, invalid JSON or a non-object value all yield an
    /// empty object.
    pub fn parse_arguments(&self) -> Value {
        let trimmed = self.arguments.trim();
        if trimmed.is_empty() {
            return Value::Object(Map::new());
        }

        match serde_json::from_str::<Value>(trimmed) {
            Ok(Value::Object(map)) => Value::Object(map),
            Ok(other) => {
                tracing::debug!(tool = %self.name, value = %other, "Tool arguments are not an object");
                Value::Object(Map::new())
            }
            Err(e) => {
                tracing::debug!(tool = %self.name, error = %e, "Unparsable tool arguments");
                Value::Object(Map::new())
            }
        }
    }
}

/// A single conversation message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallRequest>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    fn plain(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            reasoning_content: None,
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(Role::User, content)
    }

    /// Assistant reply; empty reasoning and tool call lists are stored as `None`
    pub fn assistant(
        content: impl Into<String>,
        reasoning: Option<String>,
        tool_calls: Vec<ToolCallRequest>,
    ) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            reasoning_content: reasoning.filter(|r| !r.is_empty()),
            tool_calls: if tool_calls.is_empty() {
                None
            } else {
                Some(tool_calls)
            },
            tool_call_id: None,
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            reasoning_content: None,
            tool_calls: None,
            tool_call_id: Some(tool_call_id.into()),
        }
    }

    pub fn has_tool_calls(&self) -> bool {
        self.tool_calls.as_ref().is_some_and(|c| !c.is_empty())
    }
}

/// Tool definition handed to a model backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_arguments_object() {
        let call = ToolCallRequest::new("1", "fs__mcp__read").with_arguments(r#"{"path": "a.txt"}"#);
        assert_eq!(call.parse_arguments(), json!({"path": "a.txt"}));
    }

    #[test]
    fn test_parse_arguments_empty_or_invalid() {
        let empty = ToolCallRequest::new("1", "x");
        assert_eq!(empty.parse_arguments(), json!({}));

        let broken = ToolCallRequest::new("1", "x").with_arguments("{\"path\": ");
        assert_eq!(broken.parse_arguments(), json!({}));

        let array = ToolCallRequest::new("1", "x").with_arguments("[1, 2]");
        assert_eq!(array.parse_arguments(), json!({}));
    }

    #[test]
    fn test_assistant_drops_empty_parts() {
        let msg = Message::assistant("hi", Some(String::new()), Vec::new());
        assert!(msg.reasoning_content.is_none());
        assert!(msg.tool_calls.is_none());
        assert!(!msg.has_tool_calls());
    }

    #[test]
    fn test_message_serialization_is_camel_case() {
        let msg = Message::tool_result("call_1", "ok");
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"toolCallId\":\"call_1\""));
        assert!(json.contains("\"role\":\"tool\""));
    }
}
