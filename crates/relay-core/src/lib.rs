//! relay-core: model-backend side of mcp-relay
//!
//! Provides:
//! - Chat message types shared with the orchestrator
//! - Backend configuration (`[backend]` in relay.toml)
//! - The `ModelBackend` trait with OpenAI-compatible and Ollama implementations
//! - Server-Sent Events decoding
//! - History summarization and token estimation

pub mod backend;
pub mod chat;
pub mod config;
pub mod ollama;
pub mod openai;
pub mod sse;
pub mod summarizer;

pub use backend::{
    build_backend, BackendCapabilities, BackendError, ChatRequest, Fragment, FragmentStream,
    ModelBackend,
};
pub use chat::{Message, Role, ToolCallRequest, ToolDefinition};
pub use config::{BackendConfig, BackendKind};
pub use ollama::OllamaBackend;
pub use openai::OpenAiBackend;
pub use summarizer::HistorySummarizer;
