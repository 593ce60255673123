//! Per-turn cancellation

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Why a turn was cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum AbortReason {
    /// Stop-generation request
    Caller,
    /// No fragment arrived within the idle timeout
    IdleTimeout,
    /// Nobody is listening for events any more
    ChannelClosed,
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            AbortReason::Caller => "stopped by caller",
            AbortReason::IdleTimeout => "model stream idle",
            AbortReason::ChannelClosed => "event channel closed",
        })
    }
}

/// Cancellation token for one in-flight turn. Clones share state; the first
/// reason recorded wins.
#[derive(Debug, Clone, Default)]
pub struct TurnCancellation {
    token: CancellationToken,
    reason: Arc<Mutex<Option<AbortReason>>>,
}

impl TurnCancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self, reason: AbortReason) {
        {
            let mut slot = self.reason.lock();
            if slot.is_none() {
                *slot = Some(reason);
            }
        }
        debug!(%reason, "Turn cancelled");
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<AbortReason> {
        *self.reason.lock()
    }

    /// Token handed to the model backend
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Resolves once the turn is cancelled
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}
