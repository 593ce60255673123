//! Streaming turn orchestration
//!
//! One turn takes a user prompt, streams the model reply, executes every
//! requested tool call in order against the tool servers, and continues the
//! conversation until the model answers without tools. All history changes
//! go through the session guard the turn holds for its whole lifetime.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use relay_core::summarizer::exceeds_limit;
use relay_core::{
    BackendCapabilities, BackendError, ChatRequest, Fragment, FragmentStream, HistorySummarizer,
    Message, ModelBackend, ToolCallRequest, ToolDefinition,
};

use super::assembler::ToolCallAssembler;
use super::cancellation::{AbortReason, TurnCancellation};
use super::state::{FailureTracker, TurnProgress, TurnState};
use crate::events::{EventSender, TurnEvent};
use crate::mcp::{decode_tool_name, render_result, McpError, ServerConnectionManager, ToolCatalog};
use crate::session::{Session, SessionContext};

/// Limits and policies for a turn
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TurnConfig {
    /// Tool batches allowed before the turn is ended
    pub max_cycles: usize,
    /// Longest wait for the next fragment before the stream is abandoned
    pub idle_timeout_secs: u64,
    /// Reconnect-and-retry attempts when a tool's server is not connected
    pub tool_retries: usize,
    /// Identical failing calls tolerated before the turn stops calling tools
    pub max_consecutive_failures: usize,
    /// Estimated-token ceiling for the history sent to the model
    pub context_token_limit: Option<usize>,
    /// System prompt for new sessions
    pub system_prompt: Option<String>,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            max_cycles: 25,
            idle_timeout_secs: 120,
            tool_retries: 1,
            max_consecutive_failures: 3,
            context_token_limit: None,
            system_prompt: None,
        }
    }
}

impl TurnConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs.max(1))
    }
}

/// Fatal turn failures
#[derive(Debug, thiserror::Error)]
pub enum TurnError {
    #[error("model backend failed: {0}")]
    Backend(#[source] BackendError),

    #[error("conversation exceeds the model context window")]
    ContextOverflow { summary: Option<String> },

    #[error("failed to serialize tool result: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl TurnError {
    pub fn kind(&self) -> &'static str {
        match self {
            TurnError::Backend(_) => "backend",
            TurnError::ContextOverflow { .. } => "contextOverflow",
            TurnError::Serialization(_) => "serialization",
        }
    }
}

/// How a turn ended
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub state: TurnState,
    pub transitions: Vec<TurnState>,
    /// Tool batches executed
    pub cycles: usize,
    /// Tool results appended
    pub tool_calls: usize,
    pub abort_reason: Option<AbortReason>,
}

/// Everything one running turn owns
struct Turn<'a> {
    session: &'a mut Session,
    cancel: TurnCancellation,
    events: EventSender,
    tools: Vec<ToolDefinition>,
    capabilities: BackendCapabilities,
    progress: TurnProgress,
    failures: FailureTracker,
    tool_calls: usize,
    /// Set once tool use is over for this turn; the model gets one last
    /// stream without tools to answer from the results it has
    tools_stopped: bool,
}

impl Turn<'_> {
    /// Send an event; a closed channel cancels the turn
    async fn emit(&self, event: TurnEvent) {
        if self.events.send(event).await.is_err() && !self.cancel.is_cancelled() {
            warn!("Event receiver dropped");
            self.cancel.cancel(AbortReason::ChannelClosed);
        }
    }

    async fn append(&mut self, message: Message) {
        self.session.add_message(message);
        self.emit(TurnEvent::message_update()).await;
    }
}

/// Text and calls collected from one model stream
#[derive(Debug, Default)]
struct StreamedReply {
    content: String,
    reasoning: String,
    calls: Vec<ToolCallRequest>,
}

enum Step {
    Completed,
    /// Tool use stopped early; the turn still needs a final answer
    ToolsStopped,
    Aborted,
}

pub struct TurnOrchestrator {
    backend: Arc<dyn ModelBackend>,
    manager: Arc<ServerConnectionManager>,
    config: TurnConfig,
    model: String,
    max_tokens: Option<u32>,
    temperature: Option<f32>,
}

impl TurnOrchestrator {
    pub fn new(
        backend: Arc<dyn ModelBackend>,
        manager: Arc<ServerConnectionManager>,
        config: TurnConfig,
    ) -> Self {
        let model = backend.default_model().to_string();
        Self {
            backend,
            manager,
            config,
            model,
            max_tokens: None,
            temperature: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_sampling(mut self, max_tokens: u32, temperature: f32) -> Self {
        self.max_tokens = Some(max_tokens);
        self.temperature = Some(temperature);
        self
    }

    pub fn config(&self) -> &TurnConfig {
        &self.config
    }

    pub fn manager(&self) -> &Arc<ServerConnectionManager> {
        &self.manager
    }

    /// Run one turn on `context`. Waits for any other turn on the same
    /// session to finish first. Exactly one terminal event (`done` or
    /// `error`) is sent on `events`.
    #[instrument(skip_all, fields(session_id = %context.id(), model = %self.model))]
    pub async fn run_turn(
        &self,
        context: &SessionContext,
        prompt: impl Into<String>,
        catalog: &ToolCatalog,
        events: EventSender,
    ) -> Result<TurnOutcome, TurnError> {
        let mut session = context.lock().await;
        let cancel = context.begin_turn();

        let capabilities = self.backend.capabilities(&self.model);
        let tools = if capabilities.supports_tools {
            catalog.definitions()
        } else {
            debug!("Model does not accept tools");
            Vec::new()
        };

        let mut turn = Turn {
            session: &mut *session,
            cancel,
            events,
            tools,
            capabilities,
            progress: TurnProgress::new(),
            failures: FailureTracker::new(self.config.max_consecutive_failures),
            tool_calls: 0,
            tools_stopped: false,
        };

        info!(tools = turn.tools.len(), "Turn started");
        turn.append(Message::user(prompt)).await;

        let result = self.drive(&mut turn).await;

        let result = match result {
            Ok(Step::Completed | Step::ToolsStopped) => {
                turn.emit(TurnEvent::done()).await;
                Ok(())
            }
            Ok(Step::Aborted) => {
                turn.progress.advance(TurnState::Aborted);
                turn.emit(TurnEvent::aborted()).await;
                Ok(())
            }
            Err(e) => {
                turn.progress.advance(TurnState::Error);
                let removed = turn.session.truncate_from_last_user();
                warn!(error = %e, removed, "Turn failed");
                let event = match &e {
                    TurnError::ContextOverflow { summary } => {
                        TurnEvent::context_overflow(e.to_string(), summary.clone())
                    }
                    other => TurnEvent::error(other.kind(), other.to_string()),
                };
                turn.emit(event).await;
                Err(e)
            }
        };

        let outcome = TurnOutcome {
            state: turn.progress.state(),
            transitions: turn.progress.history().to_vec(),
            cycles: turn.progress.cycles(),
            tool_calls: turn.tool_calls,
            abort_reason: turn.cancel.reason(),
        };
        context.end_turn();

        info!(
            state = ?outcome.state,
            cycles = outcome.cycles,
            tool_calls = outcome.tool_calls,
            "Turn finished"
        );
        result.map(|()| outcome)
    }

    async fn drive(&self, turn: &mut Turn<'_>) -> Result<Step, TurnError> {
        loop {
            if turn.cancel.is_cancelled() {
                return Ok(Step::Aborted);
            }

            if let Some(limit) = self.config.context_token_limit {
                if exceeds_limit(turn.session.messages(), limit) {
                    warn!(limit, "History exceeds context limit");
                    return Err(self.overflow(turn.session.messages()).await);
                }
            }

            let reply = match self.stream_reply(turn).await {
                Ok(reply) => reply,
                Err(BackendError::Aborted) => return Ok(Step::Aborted),
                Err(BackendError::ContextOverflow(body)) => {
                    warn!(body = %body, "Backend rejected history as too long");
                    return Err(self.overflow(turn.session.messages()).await);
                }
                Err(e) => return Err(TurnError::Backend(e)),
            };

            if turn.cancel.is_cancelled() {
                // Keep what was streamed; unexecuted calls are dropped
                if !reply.content.is_empty() || !reply.reasoning.is_empty() {
                    turn.append(Message::assistant(reply.content, Some(reply.reasoning), Vec::new()))
                        .await;
                }
                return Ok(Step::Aborted);
            }

            if turn.tools_stopped && !reply.calls.is_empty() {
                warn!(calls = reply.calls.len(), "Ignoring tool calls after tool use stopped");
            }
            if reply.calls.is_empty() || turn.tools_stopped {
                turn.progress.advance(TurnState::NoToolsComplete);
                turn.append(Message::assistant(reply.content, Some(reply.reasoning), Vec::new()))
                    .await;
                return Ok(Step::Completed);
            }

            turn.progress.advance(TurnState::ToolsPending);
            let calls = reply.calls.clone();
            turn.append(Message::assistant(reply.content, Some(reply.reasoning), reply.calls))
                .await;

            turn.progress.advance(TurnState::ExecutingTools);
            let mut stop_tools = match self.execute_calls(turn, calls).await? {
                Step::Aborted => return Ok(Step::Aborted),
                Step::ToolsStopped => true,
                Step::Completed => false,
            };
            if turn.cancel.is_cancelled() {
                return Ok(Step::Aborted);
            }

            if !stop_tools && turn.progress.cycles() >= self.config.max_cycles {
                warn!(max_cycles = self.config.max_cycles, "Turn reached maximum tool cycles");
                stop_tools = true;
            }
            if stop_tools {
                // One more stream, without tools, so the turn ends on an answer
                turn.tools_stopped = true;
                turn.tools.clear();
            }

            turn.progress.advance(TurnState::StreamingModel);
        }
    }

    /// Open a stream and consume it, racing every read against cancellation
    /// and the idle timeout
    async fn stream_reply(&self, turn: &mut Turn<'_>) -> Result<StreamedReply, BackendError> {
        let mut request = ChatRequest::new(&self.model, turn.session.messages().to_vec())
            .with_tools(turn.tools.clone());
        request.max_tokens = self.max_tokens;
        request.temperature = self.temperature;

        debug!(messages = request.messages.len(), "Opening model stream");
        let mut stream: FragmentStream = tokio::select! {
            biased;
            _ = turn.cancel.cancelled() => return Err(BackendError::Aborted),
            opened = self.backend.stream_chat(request, turn.cancel.token()) => opened?,
        };

        let idle = self.config.idle_timeout();
        let mut reply = StreamedReply::default();
        let mut assembler = ToolCallAssembler::new(turn.capabilities.repeats_tool_names);

        loop {
            let next = tokio::select! {
                biased;
                _ = turn.cancel.cancelled() => break,
                _ = tokio::time::sleep(idle) => {
                    warn!(idle_secs = idle.as_secs(), "No fragment within idle timeout");
                    turn.cancel.cancel(AbortReason::IdleTimeout);
                    break;
                }
                next = stream.next() => next,
            };

            let fragment = match next {
                None => break,
                Some(Ok(fragment)) => fragment,
                Some(Err(BackendError::Aborted)) => break,
                Some(Err(e)) => return Err(e),
            };

            match fragment {
                Fragment::Content(text) => {
                    reply.content.push_str(&text);
                    turn.emit(TurnEvent::content(text)).await;
                }
                Fragment::Reasoning(text) => {
                    reply.reasoning.push_str(&text);
                    turn.emit(TurnEvent::reasoning(text)).await;
                }
                Fragment::ToolCall {
                    index,
                    id,
                    name,
                    arguments,
                } => {
                    if let Some(call) = assembler.push(index, id, name, arguments) {
                        turn.emit(TurnEvent::tool_call(call)).await;
                    }
                }
            }
        }

        if turn.cancel.is_cancelled() {
            return Ok(reply);
        }
        if let Some(call) = assembler.finish() {
            turn.emit(TurnEvent::tool_call(call)).await;
        }
        reply.calls = assembler.into_calls();
        debug!(
            content_chars = reply.content.len(),
            tool_calls = reply.calls.len(),
            "Model stream finished"
        );
        Ok(reply)
    }

    /// Execute calls strictly in order, appending one result per call
    async fn execute_calls(
        &self,
        turn: &mut Turn<'_>,
        calls: Vec<ToolCallRequest>,
    ) -> Result<Step, TurnError> {
        debug!(count = calls.len(), "Executing tool calls");
        let mut calls = calls.into_iter();

        while let Some(call) = calls.next() {
            if turn.cancel.is_cancelled() {
                debug!(skipped = calls.len() + 1, "Skipping tool calls after cancellation");
                return Ok(Step::Aborted);
            }

            let arguments = call.parse_arguments();
            let signature = FailureTracker::signature(&call.name, &arguments);
            if turn.failures.is_repeated_call(&signature) {
                debug!(
                    tool = %call.name,
                    failures = turn.failures.failure_count(&signature),
                    "Model repeated a failing call"
                );
            }

            let (text, succeeded) = match self.invoke(&call.name, arguments).await {
                Ok(text) => (text, true),
                Err(e) => {
                    warn!(tool = %call.name, error = %e, "Tool call failed");
                    let payload = json!({ "error": e.to_string(), "errorKind": e.kind() });
                    (serde_json::to_string(&payload)?, false)
                }
            };

            let give_up = if succeeded {
                turn.failures.record_success(&signature);
                None
            } else {
                turn.failures.record_failure(&signature, &text)
            };

            turn.append(Message::tool_result(&call.id, text)).await;
            turn.tool_calls += 1;

            if let Some(reason) = give_up {
                warn!(tool = %call.name, reason = %reason, "Stopping repeated failing tool call");
                // Every requested call still gets a result so the history stays valid
                for skipped in calls.by_ref() {
                    let payload = json!({ "error": "skipped after repeated tool failures" });
                    turn.append(Message::tool_result(&skipped.id, serde_json::to_string(&payload)?))
                        .await;
                    turn.tool_calls += 1;
                }
                return Ok(Step::ToolsStopped);
            }

            if turn.cancel.is_cancelled() {
                debug!(skipped = calls.len(), "Turn cancelled between tool calls");
                return Ok(Step::Aborted);
            }
        }
        Ok(Step::Completed)
    }

    /// Decode and call one tool. A server that is not connected is
    /// reconnected and the call retried up to `tool_retries` times.
    async fn invoke(&self, encoded: &str, arguments: serde_json::Value) -> Result<String, McpError> {
        let (server, tool) = decode_tool_name(encoded)?;

        let mut retries = 0;
        loop {
            match self.manager.call_tool(server, tool, arguments.clone()).await {
                Ok(result) => return Ok(render_result(&result)),
                Err(McpError::NotConnected(_)) if retries < self.config.tool_retries => {
                    retries += 1;
                    info!(server = %server, tool = %tool, attempt = retries, "Reconnecting for tool call");
                    self.manager.connect(server).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn overflow(&self, messages: &[Message]) -> TurnError {
        let summarizer = HistorySummarizer::new(self.backend.clone()).with_model(&self.model);
        let summary = match summarizer.summarize(messages).await {
            Ok(summary) => Some(summary),
            Err(e) => {
                warn!(error = %e, "Could not summarize overflowing history");
                None
            }
        };
        TurnError::ContextOverflow { summary }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events;
    use crate::mcp::{ServerDescriptor, ServerRegistry};
    use crate::session::SessionRegistry;
    use crate::testing::{call_fragment, FakeServer, Reply, ScriptedBackend, ScriptedFactory};
    use relay_core::Role;

    struct Harness {
        backend: Arc<ScriptedBackend>,
        server: FakeServer,
        manager: Arc<ServerConnectionManager>,
        sessions: SessionRegistry,
    }

    async fn harness(replies: Vec<Reply>, server: FakeServer, connect: bool) -> Harness {
        let backend = Arc::new(ScriptedBackend::new(replies));
        let factory = Arc::new(ScriptedFactory::new().with_server("fs", server.clone()));
        let registry = ServerRegistry::from_descriptors(vec![ServerDescriptor::local("fs", "x")]).unwrap();
        let manager = Arc::new(ServerConnectionManager::with_factory(registry, factory));
        if connect {
            manager.connect("fs").await.unwrap();
        }
        Harness {
            backend,
            server,
            manager,
            sessions: SessionRegistry::new(),
        }
    }

    impl Harness {
        fn orchestrator(&self, config: TurnConfig) -> TurnOrchestrator {
            TurnOrchestrator::new(self.backend.clone(), self.manager.clone(), config)
        }

        async fn catalog(&self) -> ToolCatalog {
            ToolCatalog::build(&self.manager).await
        }
    }

    fn drain(mut rx: events::EventReceiver) -> Vec<TurnEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    fn two_reads() -> Vec<Fragment> {
        vec![
            call_fragment(0, Some("c1"), Some("fs__mcp__read"), Some("")),
            call_fragment(0, None, None, Some("{\"path\":")),
            call_fragment(0, None, None, Some("\"a\"}")),
            call_fragment(1, Some("c2"), Some("fs__mcp__read"), Some("{\"path\":\"b\"}")),
        ]
    }

    #[tokio::test]
    async fn test_plain_answer_completes() {
        let h = harness(
            vec![Reply::Fragments(vec![
                Fragment::Reasoning("hmm".into()),
                Fragment::Content("Hel".into()),
                Fragment::Content("lo".into()),
            ])],
            FakeServer::new(&["read"]),
            true,
        )
        .await;
        let context = h.sessions.create(Some("sys"));
        let (tx, rx) = events::channel();

        let outcome = h
            .orchestrator(TurnConfig::default())
            .run_turn(&context, "hi", &h.catalog().await, tx)
            .await
            .unwrap();

        assert_eq!(
            outcome.transitions,
            vec![TurnState::StreamingModel, TurnState::NoToolsComplete]
        );
        let session = context.lock().await;
        let last = session.messages().last().unwrap();
        assert_eq!(last.content, "Hello");
        assert_eq!(last.reasoning_content.as_deref(), Some("hmm"));

        let events = drain(rx);
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
        assert_eq!(events.last().unwrap(), &TurnEvent::done());
        // tools were offered
        assert_eq!(h.backend.requests()[0].tools[0].name, "fs__mcp__read");
    }

    #[tokio::test]
    async fn test_two_calls_one_continuation() {
        let h = harness(
            vec![
                Reply::Fragments(two_reads()),
                Reply::Fragments(vec![Fragment::Content("both read".into())]),
            ],
            FakeServer::new(&["read"]),
            true,
        )
        .await;
        let context = h.sessions.create(None);
        let (tx, rx) = events::channel();

        let outcome = h
            .orchestrator(TurnConfig::default())
            .run_turn(&context, "read a and b", &h.catalog().await, tx)
            .await
            .unwrap();

        assert_eq!(outcome.cycles, 1);
        assert_eq!(outcome.tool_calls, 2);
        let requests = h.backend.requests();
        assert_eq!(requests.len(), 2);

        // user, assistant(calls), tool c1, tool c2
        let history = &requests[1].messages;
        assert_eq!(history.len(), 4);
        let calls = history[1].tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].arguments, r#"{"path":"a"}"#);
        assert_eq!(history[2].tool_call_id.as_deref(), Some("c1"));
        assert_eq!(history[3].tool_call_id.as_deref(), Some("c2"));

        let executed: Vec<_> = h.server.calls().into_iter().map(|(_, args)| args["path"].clone()).collect();
        assert_eq!(executed, vec![json!("a"), json!("b")]);

        let events = drain(rx);
        let announced: Vec<_> = events
            .iter()
            .filter_map(|e| e.tool_call.as_ref().map(|c| c.id.clone()))
            .collect();
        assert_eq!(announced, vec!["c1", "c2"]);
        assert_eq!(events.last().unwrap(), &TurnEvent::done());
    }

    #[tokio::test]
    async fn test_tool_errors_become_results() {
        let h = harness(
            vec![
                Reply::Fragments(vec![
                    call_fragment(0, Some("c1"), Some("fs__mcp__fail"), None),
                    call_fragment(1, Some("c2"), Some("nodelimiter"), None),
                    call_fragment(2, Some("c3"), Some("ghost__mcp__x"), None),
                ]),
                Reply::Fragments(vec![Fragment::Content("sorry".into())]),
            ],
            FakeServer::new(&["fail"]),
            true,
        )
        .await;
        let context = h.sessions.create(None);
        let (tx, _rx) = events::channel();

        h.orchestrator(TurnConfig::default())
            .run_turn(&context, "go", &h.catalog().await, tx)
            .await
            .unwrap();

        let session = context.lock().await;
        let results: Vec<serde_json::Value> = session
            .messages()
            .iter()
            .filter(|m| m.role == Role::Tool)
            .map(|m| serde_json::from_str(&m.content).unwrap())
            .collect();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0]["errorKind"], "toolExecution");
        assert_eq!(results[1]["errorKind"], "invalidName");
        assert_eq!(results[2]["errorKind"], "unknownServer");
    }

    #[tokio::test]
    async fn test_not_connected_is_reconnected_and_retried() {
        let h = harness(
            vec![
                Reply::Fragments(vec![call_fragment(0, Some("c1"), Some("fs__mcp__read"), Some("{}"))]),
                Reply::Fragments(vec![Fragment::Content("ok".into())]),
            ],
            FakeServer::new(&["read"]),
            false,
        )
        .await;
        let context = h.sessions.create(None);
        let (tx, _rx) = events::channel();

        h.orchestrator(TurnConfig::default())
            .run_turn(&context, "go", &ToolCatalog::default(), tx)
            .await
            .unwrap();

        assert_eq!(h.server.calls().len(), 1);
        let session = context.lock().await;
        assert_eq!(session.messages()[2].content, "read: {}");
    }

    #[tokio::test]
    async fn test_cancel_between_tools_skips_rest() {
        let h = harness(
            vec![Reply::Fragments(two_reads())],
            FakeServer::new(&["read"]).with_call_delay(Duration::from_millis(200)),
            true,
        )
        .await;
        let context = h.sessions.create(None);
        let (tx, rx) = events::channel();

        let stopper = {
            let context = context.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                context.cancel_turn(AbortReason::Caller)
            })
        };

        let outcome = h
            .orchestrator(TurnConfig::default())
            .run_turn(&context, "read", &h.catalog().await, tx)
            .await
            .unwrap();
        assert!(stopper.await.unwrap());

        assert_eq!(outcome.state, TurnState::Aborted);
        assert_eq!(outcome.abort_reason, Some(AbortReason::Caller));
        assert_eq!(outcome.tool_calls, 1);
        assert_eq!(h.server.calls().len(), 1);
        assert_eq!(h.backend.requests().len(), 1);

        // Nothing already appended is removed by the abort itself
        let session = context.lock().await;
        assert_eq!(session.len(), 3);
        assert_eq!(session.messages()[2].tool_call_id.as_deref(), Some("c1"));
        assert_eq!(drain(rx).last().unwrap(), &TurnEvent::aborted());
    }

    #[tokio::test]
    async fn test_idle_stream_keeps_partial_content() {
        let h = harness(
            vec![Reply::Stall(vec![
                Fragment::Content("partial".into()),
                call_fragment(0, Some("c1"), Some("fs__mcp__read"), None),
            ])],
            FakeServer::new(&["read"]),
            true,
        )
        .await;
        let context = h.sessions.create(None);
        let (tx, _rx) = events::channel();
        let config = TurnConfig {
            idle_timeout_secs: 1,
            ..TurnConfig::default()
        };

        let outcome = h
            .orchestrator(config)
            .run_turn(&context, "go", &h.catalog().await, tx)
            .await
            .unwrap();

        assert_eq!(outcome.abort_reason, Some(AbortReason::IdleTimeout));
        assert!(h.server.calls().is_empty());
        let session = context.lock().await;
        let last = session.messages().last().unwrap();
        assert_eq!(last.content, "partial");
        assert!(!last.has_tool_calls());
    }

    #[tokio::test]
    async fn test_closed_channel_cancels() {
        let h = harness(
            vec![Reply::Fragments(vec![Fragment::Content("nobody hears".into())])],
            FakeServer::new(&["read"]),
            true,
        )
        .await;
        let context = h.sessions.create(None);
        let (tx, rx) = events::channel();
        drop(rx);

        let outcome = h
            .orchestrator(TurnConfig::default())
            .run_turn(&context, "go", &ToolCatalog::default(), tx)
            .await
            .unwrap();
        assert_eq!(outcome.abort_reason, Some(AbortReason::ChannelClosed));
        assert_eq!(outcome.state, TurnState::Aborted);
    }

    #[tokio::test]
    async fn test_context_overflow_summarizes_and_truncates() {
        let h = harness(
            vec![
                Reply::Overflow,
                Reply::Fragments(vec![Fragment::Content("user asked about x".into())]),
            ],
            FakeServer::new(&[]),
            false,
        )
        .await;
        let context = h.sessions.create(Some("sys"));
        let (tx, rx) = events::channel();

        let err = h
            .orchestrator(TurnConfig::default())
            .run_turn(&context, "huge", &ToolCatalog::default(), tx)
            .await
            .unwrap_err();

        match err {
            TurnError::ContextOverflow { summary } => {
                assert_eq!(summary.as_deref(), Some("user asked about x"))
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(context.lock().await.len(), 1);

        let last = drain(rx).pop().unwrap();
        assert_eq!(last.error_kind.as_deref(), Some("contextOverflow"));
        assert_eq!(last.summary.as_deref(), Some("user asked about x"));
    }

    #[tokio::test]
    async fn test_local_token_limit_triggers_overflow() {
        let h = harness(
            vec![Reply::Fragments(vec![Fragment::Content("summary".into())])],
            FakeServer::new(&[]),
            false,
        )
        .await;
        let context = h.sessions.create(None);
        let (tx, _rx) = events::channel();
        let config = TurnConfig {
            context_token_limit: Some(5),
            ..TurnConfig::default()
        };

        let err = h
            .orchestrator(config)
            .run_turn(&context, "a prompt long enough to exceed five tokens", &ToolCatalog::default(), tx)
            .await
            .unwrap_err();
        assert!(matches!(err, TurnError::ContextOverflow { .. }));
        // Only the summary request reached the backend
        assert_eq!(h.backend.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_fatal() {
        let h = harness(vec![Reply::Unreachable], FakeServer::new(&[]), false).await;
        let context = h.sessions.create(None);
        let (tx, rx) = events::channel();

        let err = h
            .orchestrator(TurnConfig::default())
            .run_turn(&context, "hello", &ToolCatalog::default(), tx)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "backend");
        assert!(context.lock().await.is_empty());

        let events = drain(rx);
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
        assert_eq!(events.last().unwrap().error_kind.as_deref(), Some("backend"));
    }

    #[tokio::test]
    async fn test_max_cycles_completes_turn() {
        let looping = || Reply::Fragments(vec![call_fragment(0, None, Some("fs__mcp__read"), Some("{}"))]);
        let h = harness(
            vec![
                looping(),
                looping(),
                Reply::Fragments(vec![Fragment::Content("Stopping here.".to_string())]),
            ],
            FakeServer::new(&["read"]),
            true,
        )
        .await;
        let context = h.sessions.create(None);
        let (tx, rx) = events::channel();
        let config = TurnConfig {
            max_cycles: 2,
            ..TurnConfig::default()
        };

        let outcome = h
            .orchestrator(config)
            .run_turn(&context, "loop", &h.catalog().await, tx)
            .await
            .unwrap();

        assert_eq!(outcome.cycles, 2);
        assert_eq!(outcome.tool_calls, 2);
        assert_eq!(outcome.state, TurnState::NoToolsComplete);

        // The last stream is offered no tools and closes the turn with an answer
        let requests = h.backend.requests();
        assert_eq!(requests.len(), 3);
        assert!(!requests[1].tools.is_empty());
        assert!(requests[2].tools.is_empty());
        let session = context.lock().await;
        let last = session.messages().last().unwrap();
        assert_eq!(last.role, Role::Assistant);
        assert_eq!(last.content, "Stopping here.");
        assert_eq!(drain(rx).last().unwrap(), &TurnEvent::done());
    }

    #[tokio::test]
    async fn test_repeated_failures_stop_tool_calls() {
        let fails = |id: &str| call_fragment(0, Some(id), Some("fs__mcp__fail"), Some("{}"));
        let h = harness(
            vec![
                Reply::Fragments(vec![fails("c1")]),
                Reply::Fragments(vec![
                    fails("c2"),
                    call_fragment(1, Some("c3"), Some("fs__mcp__fail"), Some("{\"other\":1}")),
                ]),
                Reply::Fragments(vec![Fragment::Content("The tool keeps failing.".to_string())]),
            ],
            FakeServer::new(&["fail"]),
            true,
        )
        .await;
        let context = h.sessions.create(None);
        let (tx, _rx) = events::channel();
        let config = TurnConfig {
            max_consecutive_failures: 2,
            ..TurnConfig::default()
        };

        let outcome = h
            .orchestrator(config)
            .run_turn(&context, "retry forever", &h.catalog().await, tx)
            .await
            .unwrap();

        assert_eq!(outcome.state, TurnState::NoToolsComplete);
        // c3 was never executed but still has a result
        assert_eq!(h.server.calls().len(), 2);

        let requests = h.backend.requests();
        assert_eq!(requests.len(), 3);
        assert!(requests[2].tools.is_empty());

        let session = context.lock().await;
        let messages = session.messages();
        let skipped = &messages[messages.len() - 2];
        assert_eq!(skipped.tool_call_id.as_deref(), Some("c3"));
        assert!(skipped.content.contains("skipped after repeated tool failures"));
        let last = messages.last().unwrap();
        assert_eq!(last.role, Role::Assistant);
        assert_eq!(last.content, "The tool keeps failing.");
    }
}
