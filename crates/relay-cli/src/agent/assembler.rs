//! Assemble streamed tool-call fragments into whole calls
//!
//! Backends stream a tool call as a series of fragments keyed by an index:
//! the first fragment of a call carries its name (and usually its id), later
//! ones carry pieces of the JSON argument text. Some backends resend the
//! name on every fragment, others reuse an index for a second call, so the
//! meaning of a named fragment at a known index depends on
//! [`BackendCapabilities::repeats_tool_names`](relay_core::BackendCapabilities).

use relay_core::ToolCallRequest;
use tracing::{debug, warn};

#[derive(Debug)]
struct PendingCall {
    index: usize,
    id: Option<String>,
    name: String,
    arguments: String,
}

impl PendingCall {
    fn to_request(&self) -> ToolCallRequest {
        ToolCallRequest {
            id: self.id.clone().unwrap_or_default(),
            name: self.name.clone(),
            arguments: self.arguments.clone(),
        }
    }
}

/// Accumulates tool-call fragments for one stream.
///
/// Calls come out in the order their indexes were opened. Each call is
/// closed out exactly once: when the next call opens or the stream ends.
#[derive(Debug)]
pub struct ToolCallAssembler {
    repeats_tool_names: bool,
    calls: Vec<PendingCall>,
    /// Calls before this position have been closed out
    closed: usize,
}

impl ToolCallAssembler {
    pub fn new(repeats_tool_names: bool) -> Self {
        Self {
            repeats_tool_names,
            calls: Vec::new(),
            closed: 0,
        }
    }

    /// Feed one fragment. Returns the previously open call if this fragment
    /// opened a new one.
    pub fn push(
        &mut self,
        index: usize,
        id: Option<String>,
        name: Option<String>,
        arguments: Option<String>,
    ) -> Option<ToolCallRequest> {
        let name = name.filter(|n| !n.is_empty());
        let id = id.filter(|i| !i.is_empty());
        let known = self.calls.iter().rposition(|c| c.index == index);

        let starts_call = match (&name, known) {
            (Some(_), None) => true,
            (Some(_), Some(_)) => !self.repeats_tool_names,
            (None, _) => false,
        };

        if starts_call {
            let closed = self.close_open();
            self.calls.push(PendingCall {
                index,
                id,
                name: name.unwrap_or_default(),
                arguments: arguments.unwrap_or_default(),
            });
            return closed;
        }

        match known {
            Some(position) => {
                let call = &mut self.calls[position];
                if call.id.is_none() {
                    call.id = id;
                }
                if let Some(arguments) = arguments {
                    call.arguments.push_str(&arguments);
                }
            }
            None => {
                warn!(index, "Dropping tool-call fragment for an unknown index");
            }
        }
        None
    }

    /// Close out the last open call at stream end
    pub fn finish(&mut self) -> Option<ToolCallRequest> {
        self.close_open()
    }

    /// Every assembled call in execution order
    pub fn into_calls(mut self) -> Vec<ToolCallRequest> {
        self.close_open();
        self.calls.iter().map(PendingCall::to_request).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    fn close_open(&mut self) -> Option<ToolCallRequest> {
        if self.closed >= self.calls.len() {
            return None;
        }
        // Only the newest call can be open
        let call = self.calls.last_mut()?;
        if call.id.is_none() {
            call.id = Some(format!("call_{}", uuid::Uuid::new_v4().simple()));
        }
        debug!(index = call.index, tool = %call.name, "Tool call assembled");
        let request = call.to_request();
        self.closed = self.calls.len();
        Some(request)
    }
}
