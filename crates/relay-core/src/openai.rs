//! OpenAI-compatible chat completions backend (OpenAI, DeepSeek)

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
use crate::chat::{Message, Role};
use crate::config::{BackendConfig, BackendKind};
use crate::sse::SseDecoder;

/// Streaming `/chat/completions` client
#[derive(Debug, Clone)]
pub struct OpenAiBackend {
    kind: BackendKind,
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    repeats_tool_names: bool,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: Vec<Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<Value>,
    stream: bool,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct CompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct ToolCallDelta {
    #[serde(default)]
    index: Option<usize>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<FunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct FunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

impl OpenAiBackend {
    pub fn new(config: &BackendConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to create HTTP client")?;

        let api_key = config.api_key();
        if api_key.is_none() {
            tracing::warn!(backend = ?config.kind, "No API key configured");
        }

        Ok(Self {
            kind: config.kind,
            client,
            base_url: config.base_url(),
            api_key,
            model: config.model(),
            repeats_tool_names: config.repeats_tool_names,
            max_tokens: config.max_tokens,
            temperature: config.temperature,
        })
    }

    fn build_body<'a>(&self, request: &'a ChatRequest) -> CompletionRequest<'a> {
        let caps = self.capabilities(&request.model);

        let messages = request
            .messages
            .iter()
            .filter(|m| caps.supports_tools || m.role != Role::Tool)
            .map(|m| wire_message(m, caps.supports_tools))
            .collect();

        let tools = if caps.supports_tools {
            request
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
                .collect()
        } else {
            if !request.tools.is_empty() {
                tracing::debug!(model = %request.model, "Model does not accept tools; dropping definitions");
            }
            Vec::new()
        };

        CompletionRequest {
            model: &request.model,
            messages,
            tools,
            stream: true,
            max_tokens: request.max_tokens.unwrap_or(self.max_tokens),
            temperature: request.temperature.unwrap_or(self.temperature),
        }
    }
}

/// Convert a session message to the wire format.
///
/// Reasoning text is never sent back; DeepSeek rejects it as input.
fn wire_message(message: &Message, with_tools: bool) -> Value {
    match message.role {
        Role::Tool => json!({
            "role": "tool",
            "tool_call_id": message.tool_call_id,
            "content": message.content,
        }),
        Role::Assistant => {
            let mut value = json!({
                "role": "assistant",
                "content": message.content,
            });
            if let (true, Some(calls)) = (with_tools, &message.tool_calls) {
                let calls: Vec<Value> = calls
                    .iter()
                    .map(|c| {
                        json!({
                            "id": c.id,
                            "type": "function",
                            "function": { "name": c.name, "arguments": c.arguments },
                        })
                    })
                    .collect();
                value["tool_calls"] = Value::Array(calls);
            }
            value
        }
        role => json!({
            "role": role.as_str(),
            "content": message.content,
        }),
    }
}

/// Decode one `data:` payload into fragments.
///
/// Returns `Ok(None)` for the `[DONE]` sentinel.
fn decode_chunk(data: &str) -> Result<Option<Vec<Fragment>>, BackendError> {
    let data = data.trim();
    if data == "[DONE]" {
        return Ok(None);
    }
    if data.is_empty() {
        return Ok(Some(Vec::new()));
    }

    let chunk: CompletionChunk = serde_json::from_str(data)
        .with_context(|| format!("Failed to parse completion chunk: {}", data))?;

    if let Some(error) = chunk.error {
        return Err(BackendError::from_status(400, error.to_string()));
    }

    let mut fragments = Vec::new();
    for choice in chunk.choices {
        let delta = choice.delta;
        if let Some(reasoning) = delta.reasoning_content.filter(|r| !r.is_empty()) {
            fragments.push(Fragment::Reasoning(reasoning));
        }
        if let Some(content) = delta.content.filter(|c| !c.is_empty()) {
            fragments.push(Fragment::Content(content));
        }
        for call in delta.tool_calls.unwrap_or_default() {
            let (name, arguments) = match call.function {
                Some(f) => (f.name.filter(|n| !n.is_empty()), f.arguments),
                None => (None, None),
            };
            fragments.push(Fragment::ToolCall {
                index: call.index.unwrap_or(0),
                id: call.id.filter(|id| !id.is_empty()),
                name,
                arguments,
            });
        }
    }
    Ok(Some(fragments))
}

#[async_trait]
impl ModelBackend for OpenAiBackend {
    fn name(&self) -> &str {
        match self.kind {
            BackendKind::DeepSeek => "deepseek",
            _ => "openai",
        }
    }

    fn default_model(&self) -> &str {
        &self.model
    }

    fn capabilities(&self, model: &str) -> BackendCapabilities {
        BackendCapabilities {
            supports_tools: !model.contains("reasoner"),
            repeats_tool_names: self.repeats_tool_names,
        }
    }

    async fn stream_chat(
        &self,
        request: ChatRequest,
        cancel: CancellationToken,
    ) -> Result<FragmentStream, BackendError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.build_body(&request);

        tracing::debug!(
            backend = self.name(),
            model = %request.model,
            messages = body.messages.len(),
            tools = body.tools.len(),
            "Opening chat stream"
        );

        let mut builder = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(BackendError::Aborted),
            response = builder.send() => response
                .with_context(|| format!("Failed to reach {}", url))?,
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::from_status(status.as_u16(), body));
        }

        let mut bytes = response.bytes_stream();
        let stream = async_stream::stream! {
            let mut decoder = SseDecoder::new();
            'read: loop {
                let chunk = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break 'read,
                    chunk = bytes.next() => chunk,
                };

                let (events, finished) = match chunk {
                    Some(Ok(chunk)) => (decoder.push(&chunk), false),
                    Some(Err(e)) => {
                        yield Err(BackendError::Other(
                            anyhow::Error::new(e).context("Chat stream read failed"),
                        ));
                        break 'read;
                    }
                    None => (decoder.finish().into_iter().collect(), true),
                };

                for event in events {
                    match decode_chunk(&event.data) {
                        Ok(Some(fragments)) => {
                            for fragment in fragments {
                                yield Ok(fragment);
                            }
                        }
                        Ok(None) => break 'read,
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
