//! Error types for the MCP client layers.

use std::sync::Arc;
use std::time::Duration;

use crate::transport::TransportError;

/// Errors raised by a session, a transport, or the dispatch path between
/// a caller and the background context.
#[derive(Debug, thiserror::Error)]
pub enum McpError {
    #[error("MCP transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("MCP protocol error: {0}")]
    Protocol(String),

    #[error("MCP request timed out: {0}")]
    Timeout(String),

    #[error("MCP dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("MCP background context error: {0}")]
    Background(String),
}

/// Failures that happen while moving a call onto the background context
/// or while getting its result back.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("the background context shut down before the call completed")]
    ContextShutDown,

    #[error("blocking call made from the background runtime itself, use the async variant instead")]
    BlockingInAsyncContext,

    #[error("the scheduled call panicked")]
    Panicked,
}

/// Errors surfaced by the [`McpClient`](crate::McpClient) façade.
#[derive(Debug, thiserror::Error)]
pub enum McpClientError {
    /// Transport or session setup failed on the background context.
    #[error("the client initialization failed: {0}")]
    Initialization(#[source] Arc<McpError>),

    /// The background context did not report readiness in time.
    #[error("the client initialization failed: background thread did not start within {0:?}")]
    StartupTimeout(Duration),

    /// The instance was stopped (or failed to start) and cannot be reused.
    #[error("the client has been stopped and cannot be restarted")]
    Stopped,

    #[error("client session is not active, call start() first")]
    SessionNotActive,

    #[error(transparent)]
    Mcp(#[from] McpError),
}

impl McpClientError {
    /// Whether this error came out of `start()`.
    pub fn is_initialization(&self) -> bool {
        matches!(
            self,
            McpClientError::Initialization(_) | McpClientError::StartupTimeout(_)
        )
    }
}

impl From<McpClientError> for mb_domain::error::Error {
    fn from(e: McpClientError) -> Self {
        match e {
            McpClientError::StartupTimeout(_) => mb_domain::error::Error::Timeout(e.to_string()),
            other => mb_domain::error::Error::Mcp(other.to_string()),
        }
    }
}
