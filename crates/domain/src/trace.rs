use serde::Serialize;

/// Structured trace events emitted by the MCP client lifecycle.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum TraceEvent {
    /// The background session reported ready.
    ClientStarted {
        server_id: String,
        startup_ms: u64,
    },

    /// `start()` gave up: setup failed or the handshake timed out.
    ClientStartFailed {
        server_id: String,
        reason: String,
    },

    /// The background context was torn down and joined.
    ClientStopped {
        server_id: String,
        joined: bool,
    },

    /// A tool call finished, successfully or not.
    ToolCallCompleted {
        server_id: String,
        tool_use_id: String,
        tool_name: String,
        is_error: bool,
        duration_ms: u64,
    },
}

impl TraceEvent {
    /// Emit this event as a tracing event.
    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();
        tracing::info!(trace_event = %json, "mb_event");
    }
}
