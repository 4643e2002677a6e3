//! The protocol-level conversation with one MCP server.
//!
//! [`McpSession`] is the seam the bridging core talks to; [`ClientSession`]
//! is the default JSON-RPC implementation over an [`McpTransport`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::McpError;
use crate::protocol::{
    self, InitializeResult, McpToolDef, ToolCallResult, ToolsListResult,
};
use crate::transport::{McpTransport, TransportError};

/// Upper bound on `tools/list` pages, in case a server keeps handing out cursors.
const MAX_LIST_PAGES: usize = 64;

/// An initialized-or-not MCP session.
///
/// Implementations are only ever driven from the background context.
#[async_trait]
pub trait McpSession: Send + Sync {
    /// Perform the capability negotiation exchange.
    async fn initialize(&self) -> Result<InitializeResult, McpError>;

    /// All tools the server offers, in the order the server reported them.
    async fn list_tools(&self) -> Result<Vec<McpToolDef>, McpError>;

    /// Invoke a tool. `read_timeout`, when set, bounds the wait for the result.
    async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        read_timeout: Option<Duration>,
    ) -> Result<ToolCallResult, McpError>;

    /// End the session. Called once during teardown, before the transport
    /// is released.
    async fn close(&self) -> Result<(), McpError> {
        Ok(())
    }
}

/// Builds a session over a freshly opened transport.
pub trait SessionFactory: Send + Sync {
    fn create(&self, transport: Arc<dyn McpTransport>) -> Arc<dyn McpSession>;
}

/// Produces [`ClientSession`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonRpcSessionFactory;

impl SessionFactory for JsonRpcSessionFactory {
    fn create(&self, transport: Arc<dyn McpTransport>) -> Arc<dyn McpSession> {
        Arc::new(ClientSession::new(transport))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ClientSession
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// JSON-RPC MCP session.
pub struct ClientSession {
    transport: Arc<dyn McpTransport>,
    initialized: AtomicBool,
}

impl ClientSession {
    pub fn new(transport: Arc<dyn McpTransport>) -> Self {
        Self {
            transport,
            initialized: AtomicBool::new(false),
        }
    }

    fn ensure_initialized(&self) -> Result<(), McpError> {
        if self.initialized.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(McpError::Protocol("session has not been initialized".into()))
        }
    }

    /// Send a request and unwrap the JSON-RPC envelope.
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, McpError> {
        self.request_with_timeout(method, params, None).await
    }

    async fn request_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value, McpError> {
        let resp = self
            .transport
            .send_request_with_timeout(method, params, timeout)
            .await?;
        resp.into_result()
            .map_err(|err| McpError::Protocol(format!("{method} failed: {err}")))
    }
}

#[async_trait]
impl McpSession for ClientSession {
    async fn initialize(&self) -> Result<InitializeResult, McpError> {
        let params = serde_json::to_value(protocol::initialize_params()).map_err(|e| {
            McpError::Protocol(format!("failed to serialize initialize params: {e}"))
        })?;

        let result = self.request("initialize", Some(params)).await?;
        let info: InitializeResult = serde_json::from_value(result).map_err(|e| {
            McpError::Protocol(format!("failed to parse initialize result: {e}"))
        })?;

        tracing::debug!(
            protocol_version = %info.protocol_version,
            server = ?info.server_info.as_ref().map(|s| s.name.as_str()),
            "MCP initialize response received"
        );

        self.transport
            .send_notification("notifications/initialized", None)
            .await?;
        self.initialized.store(true, Ordering::Release);

        Ok(info)
    }

    async fn list_tools(&self) -> Result<Vec<McpToolDef>, McpError> {
        self.ensure_initialized()?;

        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        for _ in 0..MAX_LIST_PAGES {
            let params = cursor
                .as_ref()
                .map(|c| serde_json::json!({ "cursor": c }));
            let result = self.request("tools/list", params).await?;
            let page: ToolsListResult = serde_json::from_value(result).map_err(|e| {
                McpError::Protocol(format!("failed to parse tools/list result: {e}"))
            })?;
            tools.extend(page.tools);

            match page.next_cursor {
                Some(next) if cursor.as_deref() != Some(next.as_str()) => cursor = Some(next),
                Some(_) => {
                    return Err(McpError::Protocol(
                        "tools/list returned the same cursor twice".into(),
                    ))
                }
                None => {
                    tracing::debug!(tool_count = tools.len(), "listed MCP tools");
                    return Ok(tools);
                }
            }
        }

        Err(McpError::Protocol(format!(
            "tools/list did not finish within {MAX_LIST_PAGES} pages"
        )))
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        read_timeout: Option<Duration>,
    ) -> Result<ToolCallResult, McpError> {
        self.ensure_initialized()?;

        let params = protocol::call_tool_params(name, arguments);
        let call = self.request_with_timeout("tools/call", Some(params), read_timeout);
        // The transport enforces `read_timeout` in place of its own default;
        // the outer bound covers transports that ignore the override.
        let result = match read_timeout {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(Err(McpError::Transport(TransportError::Timeout(_)))) | Err(_) => {
                    return Err(McpError::Timeout(format!(
                        "tools/call '{name}' timed out after {limit:?}"
                    )));
                }
                Ok(result) => result?,
            },
            None => call.await?,
        };

        serde_json::from_value::<ToolCallResult>(result)
            .map_err(|e| McpError::Protocol(format!("failed to parse tools/call result: {e}")))
    }
}
