//! `mb-mcp-client`: blocking-friendly MCP (Model Context Protocol) client.
//!
//! This crate provides:
//! - JSON-RPC 2.0 protocol types for communicating with MCP servers.
//! - A line-delimited stream transport, with a factory that spawns the
//!   server as a child process and talks over stdin/stdout.
//! - [`McpClient`], which runs the async session on a dedicated background
//!   thread and lets synchronous code (or code on another runtime) list and
//!   call tools.
//!
//! # Usage
//!
//! ```rust,ignore
//! use mb_mcp_client::McpClient;
//!
//! let client = McpClient::from_server_config(&server, &config.client);
//! let scope = client.enter()?;
//!
//! for tool in scope.list_tools()? {
//!     println!("{}: {}", tool.name, tool.description);
//! }
//!
//! let result = scope.call_tool("call-1", "read_file", json!({"path": "/tmp/test.txt"}), None);
//! if result.is_error() {
//!     eprintln!("{}", result.text());
//! }
//! ```

pub mod background;
pub mod client;
pub mod dispatcher;
pub mod error;
pub mod handshake;
pub mod protocol;
pub mod session;
pub mod transport;

// Re-exports for convenience.
pub use client::{ClientScope, LifecycleState, McpClient, McpClientBuilder};
pub use mb_domain::config::{ClientConfig, McpConfig, McpServerConfig, McpTransportKind};
pub use error::{DispatchError, McpClientError, McpError};
pub use protocol::{McpToolDef, ToolCallResult};
pub use session::{ClientSession, JsonRpcSessionFactory, McpSession, SessionFactory};
pub use transport::{
    McpTransport, StdioTransportFactory, StreamTransport, TransportError, TransportFactory,
};
