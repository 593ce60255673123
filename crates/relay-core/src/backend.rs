//! Model backend abstraction
//!
//! A backend turns a chat request into an ordered stream of [`Fragment`]s.
//! One implementation exists per vendor API; the implementation is chosen once
//! from configuration by [`build_backend`].

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::chat::{Message, ToolDefinition};
use crate::config::{BackendConfig, BackendKind};
use crate::ollama::OllamaBackend;
use crate::openai::OpenAiBackend;

/// One incremental unit of a streamed assistant reply
#[derive(Debug, Clone, PartialEq)]
pub enum Fragment {
    /// Reply text
    Content(String),
    /// Reasoning text
    Reasoning(String),
    /// A piece of the tool call at `index`
    ToolCall {
        index: usize,
        id: Option<String>,
        name: Option<String>,
        arguments: Option<String>,
    },
}

/// Stream of fragments for one assistant reply
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<Fragment, BackendError>> + Send>>;

/// Behaviour flags that differ between backends (and sometimes models)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendCapabilities {
    /// The model accepts tool definitions
    pub supports_tools: bool,
    /// Every fragment of a tool call repeats the function name
    pub repeats_tool_names: bool,
}

impl Default for BackendCapabilities {
    fn default() -> Self {
        Self {
            supports_tools: true,
            repeats_tool_names: false,
        }
    }
}

/// Request for a single streamed assistant reply
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            tools: Vec::new(),
            max_tokens: None,
            temperature: None,
        }
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// The request was rejected because the history is too large
    #[error("context length exceeded: {0}")]
    ContextOverflow(String),

    /// The cancellation token fired while the request was in flight
    #[error("request aborted")]
    Aborted,

    #[error("backend returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BackendError {
    /// Classify an error response body
    pub fn from_status(status: u16, body: String) -> Self {
        if looks_like_context_overflow(status, &body) {
            BackendError::ContextOverflow(body)
        } else {
            BackendError::Http { status, body }
        }
    }
}

fn looks_like_context_overflow(status: u16, body: &str) -> bool {
    if status != 400 && status != 413 {
        return false;
    }
    let body = body.to_lowercase();
    body.contains("context_length_exceeded")
        || body.contains("maximum context length")
        || body.contains("context length")
        || body.contains("too many tokens")
}

#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Short backend name for logs
    fn name(&self) -> &str;

    /// Default model when the caller does not pick one
    fn default_model(&self) -> &str;

    /// Capabilities for a given model
    fn capabilities(&self, model: &str) -> BackendCapabilities;

    /// Open a streamed reply. The stream ends early once `cancel` fires.
    async fn stream_chat(
        &self,
        request: ChatRequest,
        cancel: CancellationToken,
    ) -> Result<FragmentStream, BackendError>;

    /// Non-streamed completion built on [`ModelBackend::stream_chat`]
    async fn complete(&self, request: ChatRequest) -> Result<String, BackendError> {
        let mut stream = self
            .stream_chat(request, CancellationToken::new())
            .await?;

        let mut content = String::new();
        while let Some(fragment) = stream.next().await {
            if let Fragment::Content(text) = fragment? {
                content.push_str(&text);
            }
        }
        Ok(content)
    }
}

/// Build the backend selected by configuration
pub fn build_backend(config: &BackendConfig) -> anyhow::Result<Arc<dyn ModelBackend>> {
    let backend: Arc<dyn ModelBackend> = match config.kind {
        BackendKind::OpenAi | BackendKind::DeepSeek => Arc::new(OpenAiBackend::new(config)?),
        BackendKind::Ollama => Arc::new(OllamaBackend::new(config)?),
    };
    tracing::info!(
        backend = backend.name(),
        model = backend.default_model(),
        "Model backend configured"
    );
    Ok(backend)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_overflow_classification() {
        let err = BackendError::from_status(
            400,
            r#"{"error":{"code":"context_length_exceeded","message":"..."}}"#.to_string(),
        );
        assert!(matches!(err, BackendError::ContextOverflow(_)));

        let err = BackendError::from_status(500, "maximum context length".to_string());
        assert!(matches!(err, BackendError::Http { status: 500, .. }));

        let err = BackendError::from_status(400, "invalid model".to_string());
        assert!(matches!(err, BackendError::Http { status: 400, .. }));
    }

    #[test]
    fn test_default_capabilities() {
        let caps = BackendCapabilities::default();
        assert!(caps.supports_tools);
        assert!(!caps.repeats_tool_names);
    }
}
