//! Ollama chat backend (`/api/chat`, newline-delimited JSON)

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::backend::{
    BackendCapabilities, BackendError, ChatRequest, Fragment, FragmentStream, ModelBackend,
};
use crate::chat::{Message, Role, ToolCallRequest};
use crate::config::BackendConfig;

/// Ollama API client implementing [`ModelBackend`]
#[derive(Debug, Clone)]
pub struct OllamaBackend {
    base_url: String,
    client: reqwest::Client,
    model: String,
    repeats_tool_names: bool,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct ChatBody<'a> {
    model: &'a str,
    messages: Vec<Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<Value>,
    stream: bool,
    options: ChatOptions,
}

#[derive(Debug, Serialize)]
struct ChatOptions {
    temperature: f32,
    num_predict: u32,
}

/// One NDJSON line of a streamed reply
#[derive(Debug, Deserialize)]
struct ChatChunk {
    #[serde(default)]
    message: Option<ChunkMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChunkMessage {
    #[serde(default)]
    content: String,
    #[serde(default)]
    thinking: Option<String>,
    #[serde(default)]
    tool_calls: Vec<OllamaToolCall>,
}

#[derive(Debug, Deserialize)]
struct OllamaToolCall {
    function: OllamaFunction,
}

#[derive(Debug, Deserialize)]
struct OllamaFunction {
    name: String,
    #[serde(default)]
    arguments: Value,
}

impl OllamaBackend {
    pub fn new(config: &BackendConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            base_url: config.base_url(),
            client,
            model: config.model(),
            repeats_tool_names: config.repeats_tool_names,
            max_tokens: config.max_tokens,
            temperature: config.temperature,
        })
    }

    fn build_body<'a>(&self, request: &'a ChatRequest) -> ChatBody<'a> {
        let tools = request
            .tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    }
                })
            })
            .collect();

        ChatBody {
            model: &request.model,
            messages: request.messages.iter().map(wire_message).collect(),
            tools,
            stream: true,
            options: ChatOptions {
                temperature: request.temperature.unwrap_or(self.temperature),
                num_predict: request.max_tokens.unwrap_or(self.max_tokens),
            },
        }
    }
}

fn wire_message(message: &Message) -> Value {
    let mut value = json!({
        "role": message.role.as_str(),
        "content": message.content,
    });

    if message.role == Role::Assistant {
        if let Some(calls) = &message.tool_calls {
            let calls: Vec<Value> = calls.iter().map(wire_tool_call).collect();
            value["tool_calls"] = Value::Array(calls);
        }
    }
    value
}

// Ollama wants arguments as an object, not a string
fn wire_tool_call(call: &ToolCallRequest) -> Value {
    json!({
        "function": {
            "name": call.name,
            "arguments": call.parse_arguments(),
        }
    })
}

/// Decode one NDJSON line.
///
/// `next_index` numbers tool calls across the whole reply since Ollama
/// sends each call whole and without an index.
fn decode_line(line: &str, next_index: &mut usize) -> Result<(Vec<Fragment>, bool), BackendError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok((Vec::new(), false));
    }

    let chunk: ChatChunk = serde_json::from_str(line)
        .with_context(|| format!("Failed to parse chat chunk: {}", line))?;

    if let Some(error) = chunk.error {
        return Err(BackendError::from_status(400, error));
    }

    let mut fragments = Vec::new();
    if let Some(message) = chunk.message {
        if let Some(thinking) = message.thinking.filter(|t| !t.is_empty()) {
            fragments.push(Fragment::Reasoning(thinking));
        }
        if !message.content.is_empty() {
            fragments.push(Fragment::Content(message.content));
        }
        for call in message.tool_calls {
            let arguments = match call.function.arguments {
                Value::Null => String::new(),
                Value::String(s) => s,
                other => other.to_string(),
            };
            fragments.push(Fragment::ToolCall {
                index: *next_index,
                id: None,
                name: Some(call.function.name),
                arguments: Some(arguments),
            });
            *next_index += 1;
        }
    }

    Ok((fragments, chunk.done))
}

#[async_trait]
impl ModelBackend for OllamaBackend {
    fn name(&self) -> &str {
        "ollama"
    }

    fn default_model(&self) -> &str {
        &self.model
    }

    fn capabilities(&self, _model: &str) -> BackendCapabilities {
        BackendCapabilities {
            supports_tools: true,
            repeats_tool_names: self.repeats_tool_names,
        }
    }

    async fn stream_chat(
        &self,
        request: ChatRequest,
        cancel: CancellationToken,
    ) -> Result<FragmentStream, BackendError> {
        let url = format!("{}/api/chat", self.base_url);
        let body = self.build_body(&request);

        tracing::debug!(
            model = %request.model,
            messages = body.messages.len(),
            tools = body.tools.len(),
            "Opening Ollama chat stream"
        );

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(BackendError::Aborted),
            response = self.client.post(&url).json(&body).send() => response
                .context("Failed to connect to Ollama")?,
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::from_status(status.as_u16(), body));
        }

        let mut bytes = response.bytes_stream();
        let stream = async_stream::stream! {
            let mut buffer: Vec<u8> = Vec::new();
            let mut next_index = 0usize;
            'read: loop {
                let chunk = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break 'read,
                    chunk = bytes.next() => chunk,
                };

                let mut lines = Vec::new();
                let finished = match chunk {
                    Some(Ok(chunk)) => {
                        buffer.extend_from_slice(&chunk);
                        false
                    }
                    Some(Err(e)) => {
                        yield Err(BackendError::Other(
                            anyhow::Error::new(e).context("Ollama stream read failed"),
                        ));
                        break 'read;
                    }
                    None => true,
                };

                while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=pos).collect();
                    lines.push(String::from_utf8_lossy(&line).into_owned());
                }
                if finished && !buffer.is_empty() {
                    lines.push(String::from_utf8_lossy(&std::mem::take(&mut buffer)).into_owned());
                }

                for line in lines {
                    match decode_line(&line, &mut next_index) {
                        Ok((fragments, done)) => {
                            for fragment in fragments {
                                yield Ok(fragment);
                            }
                            if done {
                                break 'read;
                            }
                        }
                        Err(e) => {
                            yield Err(e);
                            break 'read;
                        }
                    }
                }

                if finished {
                    break 'read;
                }
            }
        };

        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendKind;

    #[test]
    fn test_decode_content_and_thinking() {
        let mut index = 0;
        let (fragments, done) = decode_line(
            r#"{"model":"qwen3","message":{"role":"assistant","content":"Hi","thinking":"hmm"},"done":false}"#,
            &mut index,
        )
        .unwrap();
        assert!(!done);
        assert_eq!(
            fragments,
            vec![
                Fragment::Reasoning("hmm".to_string()),
                Fragment::Content("Hi".to_string())
            ]
        );
    }

    #[test]
    fn test_whole_tool_calls_get_sequential_indices() {
        let mut index = 0;
        let line = r#"{"message":{"role":"assistant","content":"","tool_calls":[
            {"function":{"name":"fs__mcp__read","arguments":{"path":"a"}}},
            {"function":{"name":"fs__mcp__list","arguments":{}}}
        ]},"done":false}"#
            .replace('\n', "");
        let (fragments, _) = decode_line(&line, &mut index).unwrap();
        assert_eq!(index, 2);
        assert_eq!(
            fragments[0],
            Fragment::ToolCall {
                index: 0,
                id: None,
                name: Some("fs__mcp__read".to_string()),
                arguments: Some(r#"{"path":"a"}"#.to_string()),
            }
        );
        assert!(matches!(fragments[1], Fragment::ToolCall { index: 1, .. }));
    }

    #[test]
    fn test_decode_done_and_error() {
        let mut index = 0;
        let (_, done) = decode_line(r#"{"message":{"content":""},"done":true}"#, &mut index).unwrap();
        assert!(done);

        let err = decode_line(r#"{"error":"model not found"}"#, &mut index).unwrap_err();
        assert!(matches!(err, BackendError::Http { status: 400, .. }));
    }

    #[test]
    fn test_tool_call_arguments_sent_as_object() {
        let backend = OllamaBackend::new(&BackendConfig::for_kind(BackendKind::Ollama)).unwrap();
        let call = ToolCallRequest::new("c1", "fs__mcp__read").with_arguments(r#"{"path":"a"}"#);
        let request = ChatRequest::new(
            "llama3.2",
            vec![Message::user("go"), Message::assistant("", None, vec![call])],
        );
        let body = backend.build_body(&request);
        assert_eq!(
            body.messages[1]["tool_calls"][0]["function"]["arguments"],
            json!({"path": "a"})
        );
        assert_eq!(body.options.num_predict, 8192);
    }
}
