//! Conversation sessions
//!
//! A session is an ordered message history. Sessions live in a
//! [`SessionRegistry`]; each one is wrapped in a [`SessionContext`] that
//! serializes turns (one at a time per session) and holds the cancellation
//! handle of the turn in flight.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex as SyncMutex;
use relay_core::{Message, Role};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::agent::{AbortReason, TurnCancellation};

pub type SessionId = String;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub messages: Vec<Message>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            messages: Vec::new(),
        }
    }

    /// New session opening with a system message
    pub fn with_system_prompt(prompt: impl Into<String>) -> Self {
        let mut session = Self::new();
        session.add_message(Message::system(prompt));
        session
    }

    pub fn add_message(&mut self, message: Message) {
        self.messages.push(message);
        self.updated_at = Utc::now();
    }

    pub fn add_user(&mut self, content: impl Into<String>) {
        self.add_message(Message::user(content));
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Messages excluding system messages
    pub fn message_count(&self) -> usize {
        self.messages.iter().filter(|m| m.role != Role::System).count()
    }

    /// Remove the most recent user message and everything after it.
    /// Returns how many messages were removed.
    pub fn truncate_from_last_user(&mut self) -> usize {
        let Some(position) = self.messages.iter().rposition(|m| m.role == Role::User) else {
            return 0;
        };
        let removed = self.messages.len() - position;
        self.messages.truncate(position);
        self.updated_at = Utc::now();
        debug!(session_id = %self.id, removed, "Truncated session from last user message");
        removed
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("Failed to serialize session")?;
        fs::write(path, json)
            .with_context(|| format!("Failed to write session file {}", path.display()))?;
        info!(session_id = %self.id, path = %path.display(), "Saved session");
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path)
            .with_context(|| format!("Failed to read session file {}", path.display()))?;
        let session: Session = serde_json::from_str(&json).context("Failed to parse session")?;
        debug!(session_id = %session.id, messages = session.messages.len(), "Loaded session");
        Ok(session)
    }
}

/// A registered session plus its turn bookkeeping
#[derive(Debug)]
pub struct SessionContext {
    id: SessionId,
    session: Mutex<Session>,
    in_flight: SyncMutex<Option<TurnCancellation>>,
}

impl SessionContext {
    pub fn new(session: Session) -> Self {
        Self {
            id: session.id.clone(),
            session: Mutex::new(session),
            in_flight: SyncMutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Exclusive access to the history; a running turn holds this guard
    pub async fn lock(&self) -> MutexGuard<'_, Session> {
        self.session.lock().await
    }

    /// Install a fresh cancellation handle for the turn that now owns the session
    pub fn begin_turn(&self) -> TurnCancellation {
        let cancel = TurnCancellation::new();
        *self.in_flight.lock() = Some(cancel.clone());
        cancel
    }

    pub fn end_turn(&self) {
        self.in_flight.lock().take();
    }

    /// Cancel the turn in flight, if any
    pub fn cancel_turn(&self, reason: AbortReason) -> bool {
        match self.in_flight.lock().as_ref() {
            Some(cancel) => {
                cancel.cancel(reason);
                true
            }
            None => false,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.lock().is_some()
    }
}

/// All live sessions by id
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<SessionContext>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new session, optionally opening with a system prompt
    pub fn create(&self, system_prompt: Option<&str>) -> Arc<SessionContext> {
        let session = match system_prompt {
            Some(prompt) => Session::with_system_prompt(prompt),
            None => Session::new(),
        };
        self.insert(session)
    }

    /// Register an existing session (e.g. one loaded from disk)
    pub fn insert(&self, session: Session) -> Arc<SessionContext> {
        let context = Arc::new(SessionContext::new(session));
        self.sessions.insert(context.id().to_string(), context.clone());
        debug!(session_id = %context.id(), "Session registered");
        context
    }

    pub fn get(&self, id: &str) -> Option<Arc<SessionContext>> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, id: &str) -> Option<Arc<SessionContext>> {
        self.sessions.remove(id).map(|(_, context)| context)
    }

    pub fn ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<_> = self.sessions.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Stop the turn in flight for `id`, wait for it to release the session,
    /// then drop the last user message and everything after it.
    /// Returns the number of messages removed.
    pub async fn stop_generation(&self, id: &str) -> Result<usize> {
        let context = self
            .get(id)
            .with_context(|| format!("Unknown session '{}'", id))?;

        let was_running = context.cancel_turn(AbortReason::Caller);
        let mut session = context.lock().await;
        let removed = session.truncate_from_last_user();
        info!(session_id = %id, was_running, removed, "Generation stopped");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::ToolCallRequest;
    use std::time::Duration;
    use tempfile::TempDir;

    fn exchange(session: &mut Session, prompt: &str) {
        session.add_user(prompt);
        session.add_message(Message::assistant(
            "",
            None,
            vec![ToolCallRequest::new("c1", "fs__mcp__read")],
        ));
        session.add_message(Message::tool_result("c1", "ok"));
        session.add_message(Message::assistant("answer", None, Vec::new()));
    }

    #[test]
    fn test_truncate_from_last_user() {
        let mut session = Session::with_system_prompt("be brief");
        exchange(&mut session, "first");
        exchange(&mut session, "second");
        assert_eq!(session.len(), 9);

        assert_eq!(session.truncate_from_last_user(), 4);
        assert_eq!(session.len(), 5);
        assert_eq!(session.messages().last().unwrap().content, "answer");

        assert_eq!(session.truncate_from_last_user(), 4);
        assert_eq!(session.truncate_from_last_user(), 0);
        assert_eq!(session.messages().len(), 1);
        assert_eq!(session.message_count(), 0);
    }

    #[test]
    fn test_save_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("session.json");

        let mut session = Session::new();
        exchange(&mut session, "hello");
        session.save(&path).unwrap();

        let loaded = Session::load(&path).unwrap();
        assert_eq!(loaded.id, session.id);
        assert_eq!(loaded.messages, session.messages);
    }

    #[test]
    fn test_registry() {
        let registry = SessionRegistry::new();
        let a = registry.create(Some("sys"));
        let b = registry.create(None);
        assert_ne!(a.id(), b.id());
        assert_eq!(registry.len(), 2);
        assert!(registry.get(a.id()).is_some());

        registry.remove(b.id());
        assert_eq!(registry.ids(), vec![a.id().to_string()]);
    }

    #[tokio::test]
    async fn test_stop_generation_waits_for_turn() {
        let registry = SessionRegistry::new();
        let context = registry.create(None);
        let id = context.id().to_string();

        let turn = {
            let context = context.clone();
            tokio::spawn(async move {
                let mut session = context.lock().await;
                let cancel = context.begin_turn();
                session.add_user("question");
                cancel.cancelled().await;
                session.add_message(Message::assistant("partial", None, Vec::new()));
                context.end_turn();
            })
        };

        // Let the turn take the session
        while !context.is_busy() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let removed = registry.stop_generation(&id).await.unwrap();
        assert_eq!(removed, 2);
        turn.await.unwrap();
        assert!(context.lock().await.is_empty());
        assert!(!context.is_busy());
    }

    #[tokio::test]
    async fn test_stop_generation_unknown_session() {
        let registry = SessionRegistry::new();
        assert!(registry.stop_generation("nope").await.is_err());
    }
}
