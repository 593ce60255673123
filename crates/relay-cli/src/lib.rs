//! relay-cli: tool-server connections and streaming turn orchestration
//!
//! - [`mcp`]: server registry, transports, MCP client, connection manager
//!   and tool catalog
//! - [`agent`]: the turn orchestrator with delta assembly and cancellation
//! - [`session`]: conversation sessions and stop-generation
//! - [`events`]: push events emitted during a turn

pub mod agent;
pub mod config;
pub mod events;
pub mod mcp;
pub mod session;

#[cfg(test)]
pub mod testing;

pub use agent::{AbortReason, TurnConfig, TurnError, TurnOrchestrator, TurnOutcome};
pub use config::AppConfig;
pub use events::TurnEvent;
pub use session::{Session, SessionContext, SessionRegistry};
