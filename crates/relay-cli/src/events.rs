//! Push events emitted while a turn runs

use relay_core::ToolCallRequest;
use serde::Serialize;
use tokio::sync::mpsc;

/// One event for the client of a turn, serialized as one camelCase JSON
/// object. Only the fields that apply are present.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnEvent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call: Option<ToolCallRequest>,
    /// The session history changed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_message_update: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aborted: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub done: Option<bool>,
}

impl TurnEvent {
    pub fn content(text: impl Into<String>) -> Self {
        Self {
            content: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn reasoning(text: impl Into<String>) -> Self {
        Self {
            reasoning_content: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn tool_call(call: ToolCallRequest) -> Self {
        Self {
            tool_call: Some(call),
            ..Default::default()
        }
    }

    pub fn message_update() -> Self {
        Self {
            is_message_update: Some(true),
            ..Default::default()
        }
    }

    pub fn error(kind: &str, message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            error_kind: Some(kind.to_string()),
            ..Default::default()
        }
    }

    /// Terminal event for a history that no longer fits the model
    pub fn context_overflow(message: impl Into<String>, summary: Option<String>) -> Self {
        Self {
            summary,
            ..Self::error("contextOverflow", message)
        }
    }

    pub fn done() -> Self {
        Self {
            done: Some(true),
            ..Default::default()
        }
    }

    /// Terminal event for a stopped turn
    pub fn aborted() -> Self {
        Self {
            aborted: Some(true),
            ..Self::done()
        }
    }

    /// `done` or `error`; exactly one per turn
    pub fn is_terminal(&self) -> bool {
        self.done == Some(true) || self.error.is_some()
    }
}

pub type EventSender = mpsc::Sender<TurnEvent>;
pub type EventReceiver = mpsc::Receiver<TurnEvent>;

/// Bounded event channel for one turn
pub fn channel() -> (EventSender, EventReceiver) {
    mpsc::channel(256)
}
