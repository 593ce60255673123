//! Model backend configuration (`[backend]` section of relay.toml)

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// Which backend implementation to build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// OpenAI chat completions API
    OpenAi,
    /// DeepSeek (OpenAI-compatible, with reasoning content)
    DeepSeek,
    /// Local Ollama server
    Ollama,
}

impl BackendKind {
    pub fn default_base_url(&self) -> &'static str {
        match self {
            BackendKind::OpenAi => "https://api.openai.com/v1",
            BackendKind::DeepSeek => "https://api.deepseek.com",
            BackendKind::Ollama => "http://127.0.0.1:11434",
        }
    }

    pub fn default_model(&self) -> &'static str {
        match self {
            BackendKind::OpenAi => "gpt-4.1",
            BackendKind::DeepSeek => "deepseek-chat",
            BackendKind::Ollama => "llama3.2",
        }
    }

    pub fn default_api_key_env(&self) -> Option<&'static str> {
        match self {
            BackendKind::OpenAi => Some("OPENAI_API_KEY"),
            BackendKind::DeepSeek => Some("DEEPSEEK_API_KEY"),
            BackendKind::Ollama => None,
        }
    }
}

impl std::str::FromStr for BackendKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "openai" => Ok(BackendKind::OpenAi),
            "deepseek" => Ok(BackendKind::DeepSeek),
            "ollama" => Ok(BackendKind::Ollama),
            other => bail!("Unknown backend kind: {}", other),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub kind: BackendKind,
    /// Base URL; defaults per backend kind
    #[serde(default)]
    pub base_url: Option<String>,
    /// Model name; defaults per backend kind
    #[serde(default)]
    pub model: Option<String>,
    /// Environment variable holding the API key
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// Request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// The backend resends the function name on every fragment of a tool call
    #[serde(default)]
    pub repeats_tool_names: bool,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

fn default_timeout_secs() -> u64 {
    180
}

fn default_max_tokens() -> u32 {
    8192
}

fn default_temperature() -> f32 {
    0.7
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self::for_kind(BackendKind::OpenAi)
    }
}

impl BackendConfig {
    /// Defaults for a backend kind
    pub fn for_kind(kind: BackendKind) -> Self {
        Self {
            kind,
            base_url: None,
            model: None,
            api_key_env: None,
            timeout_secs: default_timeout_secs(),
            repeats_tool_names: false,
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
        }
    }

    pub fn base_url(&self) -> String {
        self.base_url
            .clone()
            .unwrap_or_else(|| self.kind.default_base_url().to_string())
            .trim_end_matches('/')
            .to_string()
    }

    pub fn model(&self) -> String {
        self.model
            .clone()
            .unwrap_or_else(|| self.kind.default_model().to_string())
    }

    /// Read the API key from the configured environment variable.
    ///
    /// Returns `None` when no variable is configured or it is unset.
    pub fn api_key(&self) -> Option<String> {
        let var = self
            .api_key_env
            .as_deref()
            .or_else(|| self.kind.default_api_key_env())?;
        std::env::var(var).ok().filter(|v| !v.is_empty())
    }
}
