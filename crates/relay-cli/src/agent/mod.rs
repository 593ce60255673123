//! Turn orchestration
//!
//! A turn streams a model reply, assembles tool-call fragments, runs the
//! calls against the tool servers and loops until the model is done.

pub mod assembler;
pub mod cancellation;
pub mod orchestrator;
pub mod state;

pub use assembler::ToolCallAssembler;
pub use cancellation::{AbortReason, TurnCancellation};
pub use orchestrator::{TurnConfig, TurnError, TurnOrchestrator, TurnOutcome};
pub use state::{FailureTracker, TurnProgress, TurnState};
