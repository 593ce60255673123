//! Conversation history summarization
//!
//! When a history no longer fits the model's context, older messages are
//! condensed into a single summary produced by the model itself.

use std::sync::Arc;

use crate::backend::{BackendError, ChatRequest, ModelBackend};
use crate::chat::{Message, Role};

const SUMMARY_PROMPT: &str = "Summarize the following conversation between a user and an AI \
assistant. Keep every fact, decision, file name and open question that later turns may \
depend on. Write the summary in the language of the conversation.\n\nConversation:\n";

/// Fallback text when the model returns an empty summary
const EMPTY_SUMMARY: &str = "(no summary available)";

pub struct HistorySummarizer {
    backend: Arc<dyn ModelBackend>,
    model: String,
    max_tokens: u32,
    temperature: f32,
}

impl HistorySummarizer {
    pub fn new(backend: Arc<dyn ModelBackend>) -> Self {
        let model = backend.default_model().to_string();
        Self {
            backend,
            model,
            max_tokens: 4096,
            temperature: 0.2,
        }
    }

    /// Use a different model for summaries
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Render the history as a plain transcript (system messages skipped)
    pub fn transcript(messages: &[Message]) -> String {
        let mut text = String::new();
        for message in messages {
            let prefix = match message.role {
                Role::System => continue,
                Role::User => "User",
                Role::Assistant => "AI",
                Role::Tool => "Tool",
            };
            text.push_str(prefix);
            text.push_str(": ");
            text.push_str(&message.content);
            text.push('\n');
        }
        text
    }

    /// Produce a summary of `messages`
    pub async fn summarize(&self, messages: &[Message]) -> Result<String, BackendError> {
        let prompt = format!("{}{}", SUMMARY_PROMPT, Self::transcript(messages));

        tracing::info!(messages = messages.len(), model = %self.model, "Summarizing history");

        let mut request = ChatRequest::new(&self.model, vec![Message::user(prompt)]);
        request.max_tokens = Some(self.max_tokens);
        request.temperature = Some(self.temperature);

        let summary = self.backend.complete(request).await?;
        let summary = summary.trim();
        tracing::debug!(chars = summary.len(), "Summary generated");

        if summary.is_empty() {
            Ok(EMPTY_SUMMARY.to_string())
        } else {
            Ok(summary.to_string())
        }
    }

    /// Replace all but the `keep_recent` newest messages with one summary
    /// system message. On failure the history is returned unchanged.
    pub async fn compress(&self, messages: &[Message], keep_recent: usize) -> Vec<Message> {
        if messages.len() <= keep_recent {
            return messages.to_vec();
        }

        let split = messages.len() - keep_recent;
        let (older, recent) = messages.split_at(split);

        match self.summarize(older).await {
            Ok(summary) => {
                let mut compressed = Vec::with_capacity(recent.len() + 1);
                compressed.push(Message::system(format!("Conversation summary: {}", summary)));
                compressed.extend_from_slice(recent);
                tracing::info!(
                    before = messages.len(),
                    after = compressed.len(),
                    "History compressed"
                );
                compressed
            }
            Err(e) => {
                tracing::warn!(error = %e, "History compression failed");
                messages.to_vec()
            }
        }
    }
}

/// Rough token estimate for a message list.
///
/// Each message costs 4 tokens of structure; CJK ideographs count 0.6,
/// every other character 0.3. Tool calls and reasoning text are included.
pub fn estimate_tokens(messages: &[Message]) -> usize {
    let total: f64 = messages
        .iter()
        .map(|message| {
            let mut cost = 4.0 + text_cost(&message.content);
            if let Some(reasoning) = &message.reasoning_content {
                cost += text_cost(reasoning);
            }
            for call in message.tool_calls.iter().flatten() {
                cost += text_cost(&call.name) + text_cost(&call.arguments);
            }
            cost
        })
        .sum();
    total.ceil() as usize
}

fn text_cost(text: &str) -> f64 {
    let cjk = text.chars().filter(|c| is_cjk(*c)).count();
    let other = text.chars().count() - cjk;
    cjk as f64 * 0.6 + other as f64 * 0.3
}

fn is_cjk(c: char) -> bool {
    ('\u{4e00}'..='\u{9fa5}').contains(&c)
}

/// Whether the estimated size of `messages` is above `limit`
pub fn exceeds_limit(messages: &[Message], limit: usize) -> bool {
    estimate_tokens(messages) > limit
}
