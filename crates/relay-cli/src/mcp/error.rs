//! Error taxonomy for tool-server operations

use super::transport::TransportKind;

/// One failed transport attempt during negotiation
#[derive(Debug, Clone)]
pub struct ConnectAttempt {
    pub kind: TransportKind,
    pub error: String,
}

impl std::fmt::Display for ConnectAttempt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.error)
    }
}

fn describe_attempts(attempts: &[ConnectAttempt]) -> String {
    if attempts.is_empty() {
        return "no usable transport".to_string();
    }
    attempts
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, thiserror::Error)]
pub enum McpError {
    #[error("unknown server '{0}'")]
    UnknownServer(String),

    #[error("could not connect to server '{server}' ({})", describe_attempts(.attempts))]
    ConnectionFailed {
        server: String,
        attempts: Vec<ConnectAttempt>,
    },

    #[error("server '{0}' is not connected")]
    NotConnected(String),

    #[error("tool '{tool}' on server '{server}' failed: {message}")]
    ToolExecution {
        server: String,
        tool: String,
        message: String,
    },

    #[error("invalid tool name '{0}'")]
    InvalidName(String),

    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

impl McpError {
    /// Short machine-readable kind used in tool-result payloads
    pub fn kind(&self) -> &'static str {
        match self {
            McpError::UnknownServer(_) => "unknownServer",
            McpError::ConnectionFailed { .. } => "connectionFailed",
            McpError::NotConnected(_) => "notConnected",
            McpError::ToolExecution { .. } => "toolExecution",
            McpError::InvalidName(_) => "invalidName",
            McpError::Transport(_) => "transport",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_failed_names_every_attempt() {
        let err = McpError::ConnectionFailed {
            server: "weather".to_string(),
            attempts: vec![
                ConnectAttempt {
                    kind: TransportKind::StreamableHttp,
                    error: "404".to_string(),
                },
                ConnectAttempt {
                    kind: TransportKind::Sse,
                    error: "refused".to_string(),
                },
            ],
        };
        let text = err.to_string();
        assert!(text.contains("weather"));
        assert!(text.contains("streamable-http: 404"));
        assert!(text.contains("sse: refused"));
        assert_eq!(err.kind(), "connectionFailed");
    }
}
