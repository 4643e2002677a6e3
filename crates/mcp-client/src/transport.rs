//! MCP transport layer.
//!
//! A transport carries newline-delimited JSON-RPC between the client and
//! one MCP server. [`StreamTransport`] works over any async read/write
//! pair; [`StreamTransport::spawn`] wires it to a child process's
//! stdin/stdout. A [`TransportFactory`] opens a fresh transport on the
//! background context when a client starts.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::Child;
use tokio::sync::Mutex;

use mb_domain::config::{ClientConfig, McpServerConfig, McpTransportKind};

use crate::protocol::{
    InboundMessage, JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
    ServerReply, ServerRequest, METHOD_NOT_FOUND,
};

/// Trait for MCP server transports.
#[async_trait]
pub trait McpTransport: Send + Sync {
    /// Send a JSON-RPC request and wait for the corresponding response.
    async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<JsonRpcResponse, TransportError>;

    /// Like [`send_request`](Self::send_request), but a `timeout` of `Some`
    /// replaces the transport's own response timeout for this request.
    async fn send_request_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        _timeout: Option<Duration>,
    ) -> Result<JsonRpcResponse, TransportError> {
        self.send_request(method, params).await
    }

    /// Send a JSON-RPC notification (no response expected).
    async fn send_notification(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<(), TransportError>;

    /// Check if the transport is still alive.
    fn is_alive(&self) -> bool;

    /// Release the transport. Best-effort; never fails.
    async fn shutdown(&self);
}

/// Opens a transport. Called once, on the background context, per client start.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn open(&self) -> Result<Box<dyn McpTransport>, TransportError>;

    /// Short label used in logs and trace events.
    fn label(&self) -> String {
        "mcp".into()
    }
}

/// Errors that can occur during transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("MCP server process has exited")]
    ProcessExited,

    #[error("timeout waiting for response to {0}")]
    Timeout(String),

    #[error("transport not supported: {0}")]
    Unsupported(String),
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stream transport
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Maximum number of non-JSON lines to skip before declaring the server broken.
const MAX_SKIP_LINES: usize = 1000;

/// How long a child process gets to exit after stdin is closed.
const CHILD_EXIT_GRACE: Duration = Duration::from_secs(5);

pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Newline-delimited JSON-RPC over a duplex byte stream.
///
/// The `request_lock` serializes entire request/response cycles to prevent
/// response mismatching when multiple callers use the same server.
pub struct StreamTransport {
    writer: Mutex<BoxedWriter>,
    reader: Mutex<BufReader<BoxedReader>>,
    child: Mutex<Option<Child>>,
    /// Serializes full request/response cycles to prevent response mismatching.
    request_lock: Mutex<()>,
    next_id: AtomicU64,
    alive: AtomicBool,
    response_timeout: Duration,
}

impl StreamTransport {
    /// Wrap an arbitrary read/write pair.
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            writer: Mutex::new(Box::new(writer)),
            reader: Mutex::new(BufReader::new(Box::new(reader))),
            child: Mutex::new(None),
            request_lock: Mutex::new(()),
            next_id: AtomicU64::new(1),
            alive: AtomicBool::new(true),
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
        }
    }

    /// Override how long a request waits for its response.
    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    /// Spawn a child process from the given server config and talk to it
    /// over its stdin/stdout.
    pub fn spawn(config: &McpServerConfig) -> Result<Self, TransportError> {
        let mut cmd = tokio::process::Command::new(&config.command);
        cmd.args(&config.args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::inherit())
            .kill_on_drop(true);

        for (key, value) in &config.env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn()?;

        let stdin = child.stdin.take().ok_or_else(|| {
            TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "failed to capture child stdin",
            ))
        })?;

        let stdout = child.stdout.take().ok_or_else(|| {
            TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "failed to capture child stdout",
            ))
        })?;

        tracing::debug!(
            server_id = %config.id,
            command = %config.command,
            pid = child.id(),
            "spawned MCP server process"
        );

        let transport = Self::new(stdout, stdin);
        Ok(Self {
            child: Mutex::new(Some(child)),
            ..transport
        })
    }

    /// Get the next unique request ID.
    fn next_request_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Write a line of JSON to the outbound stream.
    async fn write_line(&self, json: &str) -> Result<(), TransportError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(TransportError::ProcessExited);
        }

        let mut writer = self.writer.lock().await;
        writer.write_all(json.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        Ok(())
    }

    /// Read a line of JSON, skipping any empty or non-JSON lines.
    ///
    /// Gives up after [`MAX_SKIP_LINES`] non-JSON lines to prevent spinning
    /// on a misconfigured server that writes logging to stdout.
    async fn read_line(&self) -> Result<String, TransportError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(TransportError::ProcessExited);
        }

        let mut reader = self.reader.lock().await;
        let mut skipped = 0usize;
        loop {
            let mut line = String::new();
            let bytes_read = reader.read_line(&mut line).await?;
            if bytes_read == 0 {
                self.alive.store(false, Ordering::SeqCst);
                return Err(TransportError::ProcessExited);
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            if trimmed.starts_with('{') {
                return Ok(trimmed.to_string());
            }
            skipped += 1;
            if skipped >= MAX_SKIP_LINES {
                self.alive.store(false, Ordering::SeqCst);
                return Err(TransportError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "MCP server produced too many non-JSON lines",
                )));
            }
            tracing::debug!(line = %trimmed, "skipping non-JSON line from MCP server");
        }
    }

    /// Answer a server-initiated request. Only `ping` is supported.
    async fn reply_to_server(&self, request: ServerRequest) -> Result<(), TransportError> {
        let response = if request.method == "ping" {
            ServerReply::success(request.id, serde_json::json!({}))
        } else {
            ServerReply::failure(
                request.id,
                JsonRpcError {
                    code: METHOD_NOT_FOUND,
                    message: format!("method not supported by client: {}", request.method),
                    data: None,
                },
            )
        };
        let json = serde_json::to_string(&response)?;
        self.write_line(&json).await
    }
}

#[async_trait]
impl McpTransport for StreamTransport {
    async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<JsonRpcResponse, TransportError> {
        self.send_request_with_timeout(method, params, None).await
    }

    async fn send_request_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<JsonRpcResponse, TransportError> {
        // Serialize the entire request/response cycle so concurrent callers
        // cannot read each other's responses.
        let _guard = self.request_lock.lock().await;

        let id = self.next_request_id();
        let req = JsonRpcRequest::new(id, method, params);
        let json = serde_json::to_string(&req)?;

        tracing::debug!(id, method, "sending MCP request");
        self.write_line(&json).await?;

        let limit = timeout.unwrap_or(self.response_timeout);
        let result = tokio::time::timeout(limit, async {
            loop {
                let line = self.read_line().await?;
                match InboundMessage::parse(&line) {
                    Ok(InboundMessage::Response(resp)) if resp.id == id => return Ok(resp),
                    Ok(InboundMessage::Response(resp)) => {
                        tracing::debug!(
                            expected_id = id,
                            got_id = resp.id,
                            "received response for different request, continuing"
                        );
                    }
                    Ok(InboundMessage::Request(server_req)) => {
                        tracing::debug!(method = %server_req.method, "answering server request");
                        self.reply_to_server(server_req).await?;
                    }
                    Ok(InboundMessage::Notification(notif)) => {
                        tracing::debug!(method = %notif.method, "skipping server notification");
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, line = %line, "skipping unparseable message");
                    }
                }
            }
        })
        .await;

        match result {
            Ok(inner) => inner,
            Err(_) => Err(TransportError::Timeout(method.to_string())),
        }
    }

    async fn send_notification(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<(), TransportError> {
        let notif = JsonRpcNotification::new(method, params);
        let json = serde_json::to_string(&notif)?;
        tracing::debug!(method, "sending MCP notification");
        self.write_line(&json).await
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn shutdown(&self) {
        self.alive.store(false, Ordering::SeqCst);
        // Closing the write half signals the server to exit.
        {
            let mut writer = self.writer.lock().await;
            if let Err(e) = writer.shutdown().await {
                tracing::debug!(error = %e, "error closing MCP transport writer");
            }
        }

        let mut child = self.child.lock().await;
        let Some(child) = child.as_mut() else {
            return;
        };
        match tokio::time::timeout(CHILD_EXIT_GRACE, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(?status, "MCP server process exited");
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "error waiting for MCP server process");
            }
            Err(_) => {
                tracing::warn!("MCP server process did not exit within timeout, killing");
                if let Err(e) = child.kill().await {
                    tracing::warn!(error = %e, "failed to kill MCP server process");
                }
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stdio factory
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Opens a [`StreamTransport`] by spawning the configured server process.
#[derive(Debug, Clone)]
pub struct StdioTransportFactory {
    config: McpServerConfig,
    response_timeout: Duration,
}

impl StdioTransportFactory {
    pub fn new(config: McpServerConfig) -> Self {
        Self {
            config,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
        }
    }

    /// Factory for `server` using the request timeout from the `[client]` section.
    pub fn for_client(server: &McpServerConfig, client: &ClientConfig) -> Self {
        Self::new(server.clone()).with_response_timeout(client.request_timeout())
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }
}

#[async_trait]
impl TransportFactory for StdioTransportFactory {
    async fn open(&self) -> Result<Box<dyn McpTransport>, TransportError> {
        match self.config.transport {
            McpTransportKind::Stdio => {
                let transport = StreamTransport::spawn(&self.config)?
                    .with_response_timeout(self.response_timeout);
                Ok(Box::new(transport))
            }
            McpTransportKind::Sse => Err(TransportError::Unsupported(format!(
                "SSE transport for server '{}'",
                self.config.id
            ))),
        }
    }

    fn label(&self) -> String {
        self.config.id.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

    /// Build a transport whose peer end is handed back to the test.
    fn pair() -> (StreamTransport, BufReader<DuplexStream>, DuplexStream) {
        let (client_read, server_write) = tokio::io::duplex(4096);
        let (server_read, client_write) = tokio::io::duplex(4096);
        let transport = StreamTransport::new(client_read, client_write)
            .with_response_timeout(Duration::from_millis(500));
        (transport, BufReader::new(server_read), server_write)
    }

    async fn next_request(reader: &mut BufReader<DuplexStream>) -> JsonRpcRequest {
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        serde_json::from_str(&line).unwrap()
    }

    #[tokio::test]
    async fn request_skips_noise_and_notifications() {
        let (transport, mut server_in, mut server_out) = pair();

        let server = tokio::spawn(async move {
            let req = next_request(&mut server_in).await;
            assert_eq!(req.method, "tools/list");
            server_out.write_all(b"booting server...\n\n").await.unwrap();
            server_out
                .write_all(b"{\"jsonrpc\":\"2.0\",\"method\":\"notifications/message\"}\n")
                .await
                .unwrap();
            server_out
                .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":999,\"result\":{}}\n")
                .await
                .unwrap();
            let reply = JsonRpcResponse::success(req.id, serde_json::json!({ "tools": [] }));
            let line = serde_json::to_string(&reply).unwrap() + "\n";
            server_out.write_all(line.as_bytes()).await.unwrap();
        });

        let resp = transport.send_request("tools/list", None).await.unwrap();
        assert_eq!(resp.result.unwrap()["tools"], serde_json::json!([]));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn server_ping_is_answered_while_waiting() {
        let (transport, mut server_in, mut server_out) = pair();

        let server = tokio::spawn(async move {
            let req = next_request(&mut server_in).await;
            server_out
                .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":77,\"method\":\"ping\"}\n")
                .await
                .unwrap();
            let mut line = String::new();
            server_in.read_line(&mut line).await.unwrap();
            let pong: JsonRpcResponse = serde_json::from_str(&line).unwrap();
            assert_eq!(pong.id, 77);
            assert!(!pong.is_error());
            let reply = JsonRpcResponse::success(req.id, serde_json::json!({}));
            let line = serde_json::to_string(&reply).unwrap() + "\n";
            server_out.write_all(line.as_bytes()).await.unwrap();
        });

        transport.send_request("initialize", None).await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn string_id_server_requests_are_echoed() {
        let (transport, mut server_in, mut server_out) = pair();

        let server = tokio::spawn(async move {
            let req = next_request(&mut server_in).await;
            server_out
                .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":\"srv-ping\",\"method\":\"ping\"}\n")
                .await
                .unwrap();
            server_out
                .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":\"srv-roots\",\"method\":\"roots/list\"}\n")
                .await
                .unwrap();

            let mut line = String::new();
            server_in.read_line(&mut line).await.unwrap();
            let pong: Value = serde_json::from_str(&line).unwrap();
            assert_eq!(pong["id"], "srv-ping");
            assert_eq!(pong["result"], serde_json::json!({}));

            line.clear();
            server_in.read_line(&mut line).await.unwrap();
            let refusal: Value = serde_json::from_str(&line).unwrap();
            assert_eq!(refusal["id"], "srv-roots");
            assert_eq!(refusal["error"]["code"], METHOD_NOT_FOUND);

            let reply = JsonRpcResponse::success(req.id, serde_json::json!({}));
            let line = serde_json::to_string(&reply).unwrap() + "\n";
            server_out.write_all(line.as_bytes()).await.unwrap();
        });

        transport.send_request("initialize", None).await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn closed_stream_marks_transport_dead() {
        let (transport, server_in, server_out) = pair();
        drop(server_out);
        drop(server_in);

        let err = transport.send_request("tools/list", None).await.unwrap_err();
        assert!(matches!(
            err,
            TransportError::ProcessExited | TransportError::Io(_)
        ));
    }

    #[tokio::test]
    async fn silent_server_times_out() {
        let (transport, _server_in, _server_out) = pair();
        let err = transport.send_request("tools/call", None).await.unwrap_err();
        assert!(matches!(err, TransportError::Timeout(ref m) if m == "tools/call"));
        assert!(transport.is_alive());
    }

    #[tokio::test]
    async fn explicit_timeout_replaces_transport_default() {
        let (transport, mut server_in, mut server_out) = pair();
        let transport = transport.with_response_timeout(Duration::from_millis(200));

        let server = tokio::spawn(async move {
            let req = next_request(&mut server_in).await;
            tokio::time::sleep(Duration::from_millis(600)).await;
            let reply = JsonRpcResponse::success(req.id, serde_json::json!({ "content": [] }));
            let line = serde_json::to_string(&reply).unwrap() + "\n";
            server_out.write_all(line.as_bytes()).await.unwrap();
        });

        let resp = transport
            .send_request_with_timeout("tools/call", None, Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert!(!resp.is_error());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_rejects_further_writes() {
        let (transport, _server_in, _server_out) = pair();
        transport.shutdown().await;
        assert!(!transport.is_alive());
        let err = transport
            .send_notification("notifications/initialized", None)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::ProcessExited));
    }

    #[tokio::test]
    async fn sse_factory_is_unsupported() {
        let config: McpServerConfig = serde_json::from_value(serde_json::json!({
            "id": "remote",
            "transport": "sse",
            "url": "http://localhost:9000/sse"
        }))
        .unwrap();
        let factory = StdioTransportFactory::new(config);
        assert_eq!(factory.label(), "remote");
        let err = factory.open().await.err().unwrap();
        assert!(matches!(err, TransportError::Unsupported(_)));
    }

    #[test]
    fn client_request_timeout_becomes_response_timeout() {
        let server: McpServerConfig = serde_json::from_value(serde_json::json!({
            "id": "files",
            "command": "mcp-files"
        }))
        .unwrap();
        assert_eq!(
            StdioTransportFactory::new(server.clone()).response_timeout,
            DEFAULT_RESPONSE_TIMEOUT
        );

        let client: ClientConfig =
            serde_json::from_value(serde_json::json!({ "request_timeout_secs": 9 })).unwrap();
        let factory = StdioTransportFactory::for_client(&server, &client);
        assert_eq!(factory.response_timeout, Duration::from_secs(9));
        assert_eq!(factory.label(), "files");
    }

    #[tokio::test]
    async fn missing_command_fails_to_spawn() {
        let config: McpServerConfig = serde_json::from_value(serde_json::json!({
            "id": "ghost",
            "command": "/definitely/not/a/real/mcp-server"
        }))
        .unwrap();
        let err = StdioTransportFactory::new(config).open().await.err().unwrap();
        assert!(matches!(err, TransportError::Io(_)));
    }
}
