//! Synchronous-facing MCP client.
//!
//! [`McpClient`] owns the lifecycle of one [`BackgroundContext`] and exposes
//! the session's operations to both blocking and async callers. Listing
//! returns `Err` when something goes wrong; tool calls never do, every
//! failure comes back as a [`CallResult`] with `status = error`.

use std::ops::Deref;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mb_domain::config::{ClientConfig, McpServerConfig};
use mb_domain::trace::TraceEvent;
use mb_domain::{CallResult, ToolDescriptor};
use parking_lot::Mutex;
use serde_json::Value;

use crate::background::{default_runtime, BackgroundContext, RuntimeBuilder};
use crate::dispatcher::Dispatcher;
use crate::error::McpClientError;
use crate::protocol::ToolCallResult;
use crate::session::{JsonRpcSessionFactory, SessionFactory};
use crate::transport::{StdioTransportFactory, TransportFactory};

/// Where a client is in its one-way lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    NotStarted,
    Starting,
    Running,
    Stopped,
}

struct Inner {
    state: LifecycleState,
    background: Option<BackgroundContext>,
    dispatcher: Option<Dispatcher>,
}

/// Blocking façade over an async MCP session running on its own thread.
///
/// ```rust,ignore
/// let client = McpClient::from_server_config(&server, &config.client);
/// let scope = client.enter()?;
/// for tool in scope.list_tools()? {
///     println!("{}", tool.name);
/// }
/// let result = scope.call_tool("call-1", "echo", json!({ "msg": "hi" }), None);
/// ```
pub struct McpClient {
    label: String,
    transport_factory: Arc<dyn TransportFactory>,
    session_factory: Arc<dyn SessionFactory>,
    startup_timeout: Duration,
    shutdown_timeout: Duration,
    runtime_builder: RuntimeBuilder,
    /// Serializes `start()` / `stop()` against each other.
    transition: Mutex<()>,
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for McpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpClient")
            .field("label", &self.label)
            .field("state", &self.state())
            .field("startup_timeout", &self.startup_timeout)
            .field("shutdown_timeout", &self.shutdown_timeout)
            .finish_non_exhaustive()
    }
}

impl McpClient {
    /// A client with default timeouts and the JSON-RPC session.
    pub fn new(transport_factory: impl TransportFactory + 'static) -> Self {
        Self::builder(transport_factory).build()
    }

    pub fn builder(transport_factory: impl TransportFactory + 'static) -> McpClientBuilder {
        McpClientBuilder::new(Arc::new(transport_factory))
    }

    /// A client that spawns the configured server over stdio.
    pub fn from_server_config(server: &McpServerConfig, client: &ClientConfig) -> Self {
        Self::builder(StdioTransportFactory::for_client(server, client))
            .config(client)
            .build()
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn state(&self) -> LifecycleState {
        self.inner.lock().state
    }

    pub fn is_running(&self) -> bool {
        self.state() == LifecycleState::Running
    }

    /// Whether a background thread is currently owned and alive.
    pub fn has_background_thread(&self) -> bool {
        self.inner
            .lock()
            .background
            .as_ref()
            .is_some_and(BackgroundContext::is_thread_alive)
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Start the background context and wait for the session to initialize.
    ///
    /// No-op when already running. A failed start leaves the client
    /// `Stopped`; it cannot be started again.
    pub fn start(&self) -> Result<(), McpClientError> {
        let _transition = self.transition.lock();
        {
            let mut inner = self.inner.lock();
            match inner.state {
                LifecycleState::Running => return Ok(()),
                LifecycleState::Stopped => return Err(McpClientError::Stopped),
                LifecycleState::NotStarted | LifecycleState::Starting => {}
            }
            inner.state = LifecycleState::Starting;
        }

        tracing::debug!(server = %self.label, "starting MCP client");
        let started = Instant::now();

        let background = match BackgroundContext::spawn(
            self.label.clone(),
            self.transport_factory.clone(),
            self.session_factory.clone(),
            self.runtime_builder,
        ) {
            Ok(bg) => bg,
            Err(e) => {
                let err = McpClientError::Initialization(Arc::new(e));
                self.fail_start(&err);
                return Err(err);
            }
        };

        match background.wait_ready(self.startup_timeout) {
            Ok(dispatcher) => {
                let mut inner = self.inner.lock();
                inner.state = LifecycleState::Running;
                inner.background = Some(background);
                inner.dispatcher = Some(dispatcher);
                drop(inner);

                let startup_ms = started.elapsed().as_millis() as u64;
                tracing::info!(server = %self.label, startup_ms, "MCP client started");
                TraceEvent::ClientStarted {
                    server_id: self.label.clone(),
                    startup_ms,
                }
                .emit();
                Ok(())
            }
            Err(err) => {
                // Release whatever the context managed to acquire.
                background.shutdown(self.shutdown_timeout);
                self.fail_start(&err);
                Err(err)
            }
        }
    }

    fn fail_start(&self, err: &McpClientError) {
        self.inner.lock().state = LifecycleState::Stopped;
        tracing::warn!(server = %self.label, error = %err, "MCP client failed to start");
        TraceEvent::ClientStartFailed {
            server_id: self.label.clone(),
            reason: err.to_string(),
        }
        .emit();
    }

    /// Start the client and return a guard that stops it when dropped.
    pub fn enter(&self) -> Result<ClientScope<'_>, McpClientError> {
        match self.start() {
            Ok(()) => Ok(ClientScope { client: self }),
            Err(e) => {
                self.stop();
                Err(e)
            }
        }
    }

    /// Signal the background context to tear down and join it, bounded by
    /// the shutdown timeout. Idempotent.
    pub fn stop(&self) {
        let _transition = self.transition.lock();
        let background = {
            let mut inner = self.inner.lock();
            if inner.state == LifecycleState::NotStarted {
                return;
            }
            inner.state = LifecycleState::Stopped;
            inner.dispatcher = None;
            inner.background.take()
        };

        let Some(background) = background else {
            return;
        };

        let joined = background.shutdown(self.shutdown_timeout);
        tracing::info!(server = %self.label, joined, "MCP client stopped");
        TraceEvent::ClientStopped {
            server_id: self.label.clone(),
            joined,
        }
        .emit();
    }

    // ── Operations ──────────────────────────────────────────────────

    fn dispatcher(&self) -> Result<Dispatcher, McpClientError> {
        let inner = self.inner.lock();
        match (&inner.state, &inner.dispatcher) {
            (LifecycleState::Running, Some(d)) => Ok(d.clone()),
            _ => Err(McpClientError::SessionNotActive),
        }
    }

    /// Tools offered by the server, in the order it reported them.
    pub fn list_tools(&self) -> Result<Vec<ToolDescriptor>, McpClientError> {
        let tools = self
            .dispatcher()?
            .submit(|session| async move { session.list_tools().await })
            .wait()?;
        Ok(tools.into_iter().map(ToolDescriptor::from).collect())
    }

    pub async fn list_tools_async(&self) -> Result<Vec<ToolDescriptor>, McpClientError> {
        let handle = self
            .dispatcher()?
            .submit(|session| async move { session.list_tools().await });
        let tools = handle.wait_async().await?;
        Ok(tools.into_iter().map(ToolDescriptor::from).collect())
    }

    /// Invoke a tool, blocking until it completes.
    ///
    /// Never fails at the call site: an inactive session, a dispatch
    /// problem, or a remote error all produce an error `CallResult`
    /// carrying `tool_use_id`. `read_timeout` is forwarded to the session.
    pub fn call_tool(
        &self,
        tool_use_id: impl Into<String>,
        name: &str,
        arguments: Value,
        read_timeout: Option<Duration>,
    ) -> CallResult {
        let tool_use_id = tool_use_id.into();
        let started = Instant::now();
        let outcome = self.dispatcher().and_then(|d| {
            let tool = name.to_string();
            d.submit(move |session| async move {
                session.call_tool(&tool, arguments, read_timeout).await
            })
            .wait()
            .map_err(McpClientError::from)
        });
        self.finish_call(tool_use_id, name, started, outcome)
    }

    /// Async counterpart of [`call_tool`](Self::call_tool); awaits the
    /// result without blocking the caller's runtime.
    pub async fn call_tool_async(
        &self,
        tool_use_id: impl Into<String>,
        name: &str,
        arguments: Value,
        read_timeout: Option<Duration>,
    ) -> CallResult {
        let tool_use_id = tool_use_id.into();
        let started = Instant::now();
        let outcome = match self.dispatcher() {
            Ok(d) => {
                let tool = name.to_string();
                d.submit(move |session| async move {
                    session.call_tool(&tool, arguments, read_timeout).await
                })
                .wait_async()
                .await
                .map_err(McpClientError::from)
            }
            Err(e) => Err(e),
        };
        self.finish_call(tool_use_id, name, started, outcome)
    }

    fn finish_call(
        &self,
        tool_use_id: String,
        name: &str,
        started: Instant,
        outcome: Result<ToolCallResult, McpClientError>,
    ) -> CallResult {
        let result = match outcome {
            Ok(raw) => raw.into_call_result(tool_use_id),
            Err(e) => {
                tracing::warn!(
                    server = %self.label,
                    tool = name,
                    tool_use_id = %tool_use_id,
                    error = %e,
                    "MCP tool call failed"
                );
                CallResult::error(tool_use_id, e.to_string())
            }
        };

        TraceEvent::ToolCallCompleted {
            server_id: self.label.clone(),
            tool_use_id: result.tool_use_id.clone(),
            tool_name: name.to_string(),
            is_error: result.is_error(),
            duration_ms: started.elapsed().as_millis() as u64,
        }
        .emit();
        result
    }
}

impl Drop for McpClient {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Guard returned by [`McpClient::enter`]. Stops the client on drop.
#[derive(Debug)]
pub struct ClientScope<'a> {
    client: &'a McpClient,
}

impl Deref for ClientScope<'_> {
    type Target = McpClient;

    fn deref(&self) -> &McpClient {
        self.client
    }
}

impl Drop for ClientScope<'_> {
    fn drop(&mut self) {
        self.client.stop();
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Builder
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct McpClientBuilder {
    transport_factory: Arc<dyn TransportFactory>,
    session_factory: Arc<dyn SessionFactory>,
    startup_timeout: Duration,
    shutdown_timeout: Duration,
    label: Option<String>,
    runtime_builder: RuntimeBuilder,
}

impl McpClientBuilder {
    fn new(transport_factory: Arc<dyn TransportFactory>) -> Self {
        let defaults = ClientConfig::default();
        Self {
            transport_factory,
            session_factory: Arc::new(JsonRpcSessionFactory),
            startup_timeout: defaults.startup_timeout(),
            shutdown_timeout: defaults.shutdown_timeout(),
            label: None,
            runtime_builder: default_runtime,
        }
    }

    pub fn session_factory(mut self, factory: impl SessionFactory + 'static) -> Self {
        self.session_factory = Arc::new(factory);
        self
    }

    pub fn startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Label used in logs, trace events, and the background thread name.
    /// Defaults to the transport factory's label.
    pub fn name(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Apply the timeouts from a `[client]` config section.
    pub fn config(self, config: &ClientConfig) -> Self {
        self.startup_timeout(config.startup_timeout())
            .shutdown_timeout(config.shutdown_timeout())
    }

    pub fn runtime_builder(mut self, builder: RuntimeBuilder) -> Self {
        self.runtime_builder = builder;
        self
    }

    pub fn build(self) -> McpClient {
        let label = self
            .label
            .unwrap_or_else(|| self.transport_factory.label());
        McpClient {
            label,
            transport_factory: self.transport_factory,
            session_factory: self.session_factory,
            startup_timeout: self.startup_timeout,
            shutdown_timeout: self.shutdown_timeout,
            runtime_builder: self.runtime_builder,
            transition: Mutex::new(()),
            inner: Mutex::new(Inner {
                state: LifecycleState::NotStarted,
                background: None,
                dispatcher: None,
            }),
        }
    }
}
