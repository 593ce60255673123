//! Turn state machine and repeated-failure detection

use serde::Serialize;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use tracing::{trace, warn};

/// Where a turn currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum TurnState {
    /// A backend stream is open and fragments are arriving
    StreamingModel,
    /// The stream ended with tool calls queued
    ToolsPending,
    /// Tool calls are being executed one at a time
    ExecutingTools,
    /// The stream ended without tool calls; the turn is complete
    NoToolsComplete,
    /// Cancelled by the caller, an idle timeout or a closed event channel
    Aborted,
    /// Fatal failure
    Error,
}

impl TurnState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TurnState::NoToolsComplete | TurnState::Aborted | TurnState::Error)
    }

    fn allows(self, next: TurnState) -> bool {
        use TurnState::*;
        match (self, next) {
            (_, Aborted) | (_, Error) => !self.is_terminal(),
            (StreamingModel, NoToolsComplete) | (StreamingModel, ToolsPending) => true,
            (ToolsPending, ExecutingTools) => true,
            (ExecutingTools, StreamingModel) => true,
            // max_cycles reached after a tool batch
            (ExecutingTools, NoToolsComplete) => true,
            _ => false,
        }
    }
}

/// Current state plus every state the turn went through
#[derive(Debug, Clone)]
pub struct TurnProgress {
    history: Vec<TurnState>,
}

impl Default for TurnProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl TurnProgress {
    /// A turn always starts by streaming the model
    pub fn new() -> Self {
        Self {
            history: vec![TurnState::StreamingModel],
        }
    }

    pub fn state(&self) -> TurnState {
        // history is never empty
        self.history.last().copied().unwrap_or(TurnState::StreamingModel)
    }

    /// Move to `next`. Transitions out of a terminal state are ignored.
    pub fn advance(&mut self, next: TurnState) {
        let current = self.state();
        if !current.allows(next) {
            warn!(from = ?current, to = ?next, "Ignoring invalid turn transition");
            return;
        }
        trace!(from = ?current, to = ?next, "Turn transition");
        self.history.push(next);
    }

    pub fn history(&self) -> &[TurnState] {
        &self.history
    }

    /// Completed stream-then-execute cycles so far
    pub fn cycles(&self) -> usize {
        self.history
            .iter()
            .filter(|s| **s == TurnState::ExecutingTools)
            .count()
    }
}

/// Counts consecutive failures of identical tool calls so a model that keeps
/// retrying the same broken call can be stopped
#[derive(Debug, Default)]
pub struct FailureTracker {
    failures: HashMap<String, Failure>,
    last_signature: Option<String>,
    max_consecutive: usize,
}

#[derive(Debug, Clone)]
struct Failure {
    count: usize,
    last_error: String,
}

impl FailureTracker {
    pub fn new(max_consecutive: usize) -> Self {
        Self {
            failures: HashMap::new(),
            last_signature: None,
            max_consecutive: max_consecutive.max(1),
        }
    }

    /// Encoded tool name plus a hash of its arguments
    pub fn signature(tool: &str, arguments: &serde_json::Value) -> String {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        arguments.to_string().hash(&mut hasher);
        format!("{}:{:x}", tool, hasher.finish())
    }

    pub fn record_success(&mut self, signature: &str) {
        self.failures.remove(signature);
        self.last_signature = Some(signature.to_string());
    }

    /// Record a failure. Returns the reason to give up once the same call
    /// has failed `max_consecutive` times in a row.
    pub fn record_failure(&mut self, signature: &str, error: &str) -> Option<String> {
        let failure = self
            .failures
            .entry(signature.to_string())
            .or_insert_with(|| Failure {
                count: 0,
                last_error: String::new(),
            });
        failure.count += 1;
        failure.last_error = error.to_string();
        self.last_signature = Some(signature.to_string());

        (failure.count >= self.max_consecutive).then(|| {
            format!(
                "tool call failed {} consecutive times: {}",
                failure.count, failure.last_error
            )
        })
    }

    /// The previous call had this signature and it failed
    pub fn is_repeated_call(&self, signature: &str) -> bool {
        self.last_signature.as_deref() == Some(signature) && self.failures.contains_key(signature)
    }

    pub fn failure_count(&self, signature: &str) -> usize {
        self.failures.get(signature).map_or(0, |f| f.count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_progress_records_cycle() {
        let mut progress = TurnProgress::new();
        progress.advance(TurnState::ToolsPending);
        progress.advance(TurnState::ExecutingTools);
        progress.advance(TurnState::StreamingModel);
        progress.advance(TurnState::NoToolsComplete);

        assert_eq!(
            progress.history(),
            &[
                TurnState::StreamingModel,
                TurnState::ToolsPending,
                TurnState::ExecutingTools,
                TurnState::StreamingModel,
                TurnState::NoToolsComplete,
            ]
        );
        assert_eq!(progress.cycles(), 1);
        assert!(progress.state().is_terminal());
    }

    #[test]
    fn test_terminal_state_is_final() {
        let mut progress = TurnProgress::new();
        progress.advance(TurnState::Aborted);
        progress.advance(TurnState::Error);
        progress.advance(TurnState::StreamingModel);
        assert_eq!(progress.state(), TurnState::Aborted);
        assert_eq!(progress.history().len(), 2);
    }

    #[test]
    fn test_invalid_transition_ignored() {
        let mut progress = TurnProgress::new();
        progress.advance(TurnState::ExecutingTools);
        assert_eq!(progress.state(), TurnState::StreamingModel);
    }

    #[test]
    fn test_failure_tracker_success_resets() {
        let mut tracker = FailureTracker::new(3);
        let sig = FailureTracker::signature("fs__mcp__read", &json!({"path": "a"}));

        assert!(tracker.record_failure(&sig, "boom").is_none());
        assert!(tracker.record_failure(&sig, "boom").is_none());
        assert_eq!(tracker.failure_count(&sig), 2);
        assert!(tracker.is_repeated_call(&sig));

        tracker.record_success(&sig);
        assert_eq!(tracker.failure_count(&sig), 0);
        assert!(!tracker.is_repeated_call(&sig));
    }

    #[test]
    fn test_failure_tracker_gives_up() {
        let mut tracker = FailureTracker::new(2);
        let sig = FailureTracker::signature("fs__mcp__read", &json!({}));
        let other = FailureTracker::signature("fs__mcp__read", &json!({"path": "b"}));
        assert_ne!(sig, other);

        assert!(tracker.record_failure(&sig, "first").is_none());
        assert!(tracker.record_failure(&other, "other").is_none());
        let reason = tracker.record_failure(&sig, "second").unwrap();
        assert!(reason.contains("2 consecutive times"));
        assert!(reason.contains("second"));
    }
}
