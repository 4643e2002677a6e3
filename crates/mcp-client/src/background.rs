//! The background execution context: a dedicated OS thread that owns a
//! single-threaded tokio runtime, the transport, and the session.
//!
//! Lifecycle of the thread:
//!
//! 1. mark the handshake running and build the runtime,
//! 2. open the transport, build the session, run `initialize`,
//! 3. publish a [`Dispatcher`] and resolve the handshake `Ready`,
//! 4. serve scheduled calls until the shutdown token fires,
//! 5. close the session, release the transport, drop the runtime.
//!
//! Any failure before step 3 resolves the handshake `Failed` instead. If
//! the starter already gave up (startup timeout), the late outcome is only
//! logged and the context tears itself down.

use std::io;
use std::panic::AssertUnwindSafe;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::runtime::{Handle, Runtime};
use tokio_util::sync::CancellationToken;

use crate::dispatcher::Dispatcher;
use crate::error::{McpClientError, McpError};
use crate::handshake::{HandshakeState, InitHandshake, ResolveOnExit, WaitOutcome};
use crate::session::{McpSession, SessionFactory};
use crate::transport::{McpTransport, TransportFactory};

/// Builds the runtime the background thread drives.
pub type RuntimeBuilder = fn() -> io::Result<Runtime>;

/// Single-threaded runtime with IO and timers enabled.
pub fn default_runtime() -> io::Result<Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
}

type DispatcherSlot = Arc<Mutex<Option<Dispatcher>>>;

pub struct BackgroundContext {
    label: String,
    handshake: Arc<InitHandshake>,
    shutdown: CancellationToken,
    dispatcher: DispatcherSlot,
    /// Disconnects once the thread has dropped its runtime.
    exited: mpsc::Receiver<()>,
    thread: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for BackgroundContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundContext")
            .field("label", &self.label)
            .field("handshake", &self.handshake.state())
            .field("thread_alive", &self.is_thread_alive())
            .finish()
    }
}

impl BackgroundContext {
    /// Start the background thread. Returns as soon as the thread exists;
    /// use [`wait_ready`](Self::wait_ready) to wait for initialization.
    pub fn spawn(
        label: impl Into<String>,
        transport_factory: Arc<dyn TransportFactory>,
        session_factory: Arc<dyn SessionFactory>,
        runtime_builder: RuntimeBuilder,
    ) -> Result<Self, McpError> {
        let label = label.into();
        let handshake = Arc::new(InitHandshake::new());
        let shutdown = CancellationToken::new();
        let dispatcher: DispatcherSlot = Arc::new(Mutex::new(None));
        let (exited_tx, exited) = mpsc::channel::<()>();

        let thread = {
            let label = label.clone();
            let handshake = handshake.clone();
            let shutdown = shutdown.clone();
            let dispatcher = dispatcher.clone();
            std::thread::Builder::new()
                .name(format!("mcp-{label}"))
                .spawn(move || {
                    // Declaration order matters: the runtime drops first,
                    // then the handshake guard, then the exit signal.
                    let _exited = exited_tx;
                    let _resolve_guard = ResolveOnExit(handshake.clone());
                    handshake.mark_running();

                    let runtime = match runtime_builder() {
                        Ok(rt) => rt,
                        Err(e) => {
                            tracing::error!(server = %label, error = %e, "failed to build MCP runtime");
                            handshake.resolve_failed(McpError::Background(format!(
                                "failed to build runtime: {e}"
                            )));
                            return;
                        }
                    };

                    let served = std::panic::catch_unwind(AssertUnwindSafe(|| {
                        runtime.block_on(serve(
                            &label,
                            transport_factory,
                            session_factory,
                            &handshake,
                            shutdown,
                            dispatcher,
                        ))
                    }));
                    if served.is_err() {
                        tracing::error!(server = %label, "MCP background context panicked");
                    }
                })
                .map_err(|e| McpError::Background(format!("failed to spawn thread: {e}")))?
        };

        Ok(Self {
            label,
            handshake,
            shutdown,
            dispatcher,
            exited,
            thread: Some(thread),
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn handshake_state(&self) -> HandshakeState {
        self.handshake.state()
    }

    pub fn is_thread_alive(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Block until the context is ready to serve calls.
    ///
    /// On timeout the handshake is resolved as failed from this side, so a
    /// late success on the background thread is discarded rather than
    /// leaving a half-started client behind.
    pub fn wait_ready(&self, timeout: Duration) -> Result<Dispatcher, McpClientError> {
        let outcome = match self.handshake.wait(timeout) {
            WaitOutcome::TimedOut => {
                let gave_up = self.handshake.resolve_failed(McpError::Timeout(format!(
                    "initialization did not complete within {timeout:?}"
                )));
                if gave_up {
                    return Err(McpClientError::StartupTimeout(timeout));
                }
                // Lost the race; the background thread resolved first.
                match self.handshake.state() {
                    HandshakeState::Failed(err) => WaitOutcome::Failed(err),
                    _ => WaitOutcome::Ready,
                }
            }
            other => other,
        };

        match outcome {
            WaitOutcome::Ready => self.dispatcher.lock().clone().ok_or_else(|| {
                McpClientError::Initialization(Arc::new(McpError::Background(
                    "context reported ready without a session".into(),
                )))
            }),
            WaitOutcome::Failed(err) => Err(McpClientError::Initialization(err)),
            WaitOutcome::TimedOut => Err(McpClientError::StartupTimeout(timeout)),
        }
    }

    /// Signal the context to stop and wait up to `timeout` for the thread.
    ///
    /// Returns whether the thread was joined. A thread that outlives the
    /// bound is detached; it still observes the shutdown signal and exits
    /// on its own.
    pub fn shutdown(mut self, timeout: Duration) -> bool {
        self.shutdown.cancel();
        self.dispatcher.lock().take();

        let started = Instant::now();
        match self.exited.recv_timeout(timeout) {
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!(
                    server = %self.label,
                    timeout_ms = timeout.as_millis() as u64,
                    "MCP background thread did not stop in time, detaching"
                );
                self.thread.take();
                false
            }
            // The sender is never used, so any other outcome means the thread dropped it.
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if let Some(thread) = self.thread.take() {
                    if thread.join().is_err() {
                        tracing::warn!(server = %self.label, "MCP background thread panicked");
                    }
                }
                tracing::debug!(
                    server = %self.label,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "MCP background thread joined"
                );
                true
            }
        }
    }
}

impl Drop for BackgroundContext {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Everything the background thread does inside its runtime.
async fn serve(
    label: &str,
    transport_factory: Arc<dyn TransportFactory>,
    session_factory: Arc<dyn SessionFactory>,
    handshake: &InitHandshake,
    shutdown: CancellationToken,
    dispatcher: DispatcherSlot,
) {
    let setup = async {
        let transport: Arc<dyn McpTransport> = Arc::from(transport_factory.open().await?);
        let session = session_factory.create(transport.clone());
        match session.initialize().await {
            Ok(info) => Ok::<_, McpError>((transport, session, info)),
            Err(e) => {
                transport.shutdown().await;
                Err(e)
            }
        }
    };

    let (transport, session) = tokio::select! {
        _ = shutdown.cancelled() => {
            handshake.resolve_failed(McpError::Background(
                "shut down during initialization".into(),
            ));
            return;
        }
        res = setup => match res {
            Ok((transport, session, info)) => {
                tracing::info!(
                    server = %label,
                    protocol_version = %info.protocol_version,
                    "MCP session initialized"
                );
                (transport, session)
            }
            Err(e) => {
                tracing::warn!(server = %label, error = %e, "MCP session setup failed");
                if !handshake.resolve_failed(e) {
                    tracing::debug!(server = %label, "setup failure after handshake resolved, swallowed");
                }
                return;
            }
        },
    };

    *dispatcher.lock() = Some(Dispatcher::new(Handle::current(), session.clone()));
    if handshake.resolve_ready() {
        shutdown.cancelled().await;
    } else {
        tracing::warn!(server = %label, "MCP session ready after the starter gave up, tearing down");
    }
    dispatcher.lock().take();

    teardown(label, session, transport).await;
}

async fn teardown(label: &str, session: Arc<dyn McpSession>, transport: Arc<dyn McpTransport>) {
    if let Err(e) = session.close().await {
        tracing::warn!(server = %label, error = %e, "error while closing MCP session");
    }
    transport.shutdown().await;
    tracing::debug!(server = %label, "MCP transport released");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{InitializeResult, JsonRpcResponse, McpToolDef, ToolCallResult};
    use crate::transport::TransportError;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct NullTransport {
        released: Arc<AtomicBool>,
    }

    #[async_trait]
    impl McpTransport for NullTransport {
        async fn send_request(
            &self,
            _method: &str,
            _params: Option<Value>,
        ) -> Result<JsonRpcResponse, TransportError> {
            Err(TransportError::ProcessExited)
        }

        async fn send_notification(
            &self,
            _method: &str,
            _params: Option<Value>,
        ) -> Result<(), TransportError> {
            Ok(())
        }

        fn is_alive(&self) -> bool {
            !self.released.load(Ordering::SeqCst)
        }

        async fn shutdown(&self) {
            self.released.store(true, Ordering::SeqCst);
        }
    }

    struct Factory {
        fail: bool,
        open_delay: Duration,
        released: Arc<AtomicBool>,
    }

    impl Factory {
        fn ok() -> Self {
            Self {
                fail: false,
                open_delay: Duration::ZERO,
                released: Arc::default(),
            }
        }
    }

    #[async_trait]
    impl TransportFactory for Factory {
        async fn open(&self) -> Result<Box<dyn McpTransport>, TransportError> {
            tokio::time::sleep(self.open_delay).await;
            if self.fail {
                return Err(TransportError::Unsupported("test transport".into()));
            }
            Ok(Box::new(NullTransport {
                released: self.released.clone(),
            }))
        }
    }

    struct IdleSession;

    #[async_trait]
    impl McpSession for IdleSession {
        async fn initialize(&self) -> Result<InitializeResult, McpError> {
            Ok(InitializeResult::default())
        }

        async fn list_tools(&self) -> Result<Vec<McpToolDef>, McpError> {
            Ok(vec![])
        }

        async fn call_tool(
            &self,
            name: &str,
            _arguments: Value,
            _read_timeout: Option<Duration>,
        ) -> Result<ToolCallResult, McpError> {
            Ok(ToolCallResult::text(name))
        }
    }

    struct IdleSessions;

    impl SessionFactory for IdleSessions {
        fn create(&self, _transport: Arc<dyn McpTransport>) -> Arc<dyn McpSession> {
            Arc::new(IdleSession)
        }
    }

    fn broken_runtime() -> io::Result<Runtime> {
        Err(io::Error::other("no runtime for you"))
    }

    #[test]
    fn ready_then_shutdown_releases_transport() {
        let factory = Factory::ok();
        let released = factory.released.clone();
        let ctx = BackgroundContext::spawn(
            "test",
            Arc::new(factory),
            Arc::new(IdleSessions),
            default_runtime,
        )
        .unwrap();

        let dispatcher = ctx.wait_ready(Duration::from_secs(5)).unwrap();
        let result = dispatcher
            .submit(|s| async move { s.call_tool("hello", Value::Null, None).await })
            .wait()
            .unwrap();
        assert_eq!(result, ToolCallResult::text("hello"));
        assert!(ctx.is_thread_alive());

        assert!(ctx.shutdown(Duration::from_secs(5)));
        assert!(released.load(Ordering::SeqCst));
    }

    #[test]
    fn runtime_build_failure_is_an_init_error() {
        let ctx = BackgroundContext::spawn(
            "test",
            Arc::new(Factory::ok()),
            Arc::new(IdleSessions),
            broken_runtime,
        )
        .unwrap();

        let started = Instant::now();
        let err = ctx.wait_ready(Duration::from_secs(10)).unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(err.to_string().contains("no runtime for you"));
        assert!(ctx.shutdown(Duration::from_secs(5)));
    }

    #[test]
    fn transport_failure_is_an_init_error() {
        let mut factory = Factory::ok();
        factory.fail = true;
        let ctx = BackgroundContext::spawn(
            "test",
            Arc::new(factory),
            Arc::new(IdleSessions),
            default_runtime,
        )
        .unwrap();

        let err = ctx.wait_ready(Duration::from_secs(5)).unwrap_err();
        assert!(err.is_initialization());
        assert!(err.to_string().contains("test transport"));
        assert!(ctx.shutdown(Duration::from_secs(5)));
    }

    #[test]
    fn late_success_after_timeout_is_discarded() {
        let mut factory = Factory::ok();
        factory.open_delay = Duration::from_millis(200);
        let released = factory.released.clone();
        let ctx = BackgroundContext::spawn(
            "slow",
            Arc::new(factory),
            Arc::new(IdleSessions),
            default_runtime,
        )
        .unwrap();

        let err = ctx.wait_ready(Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, McpClientError::StartupTimeout(_)));

        // Let the background finish opening; its success must not flip the state.
        std::thread::sleep(Duration::from_millis(400));
        assert!(matches!(ctx.handshake_state(), HandshakeState::Failed(_)));
        assert!(released.load(Ordering::SeqCst));
        assert!(ctx.shutdown(Duration::from_secs(5)));
    }

    #[test]
    fn late_failure_after_timeout_is_swallowed() {
        let mut factory = Factory::ok();
        factory.fail = true;
        factory.open_delay = Duration::from_millis(200);
        let ctx = BackgroundContext::spawn(
            "slow-broken",
            Arc::new(factory),
            Arc::new(IdleSessions),
            default_runtime,
        )
        .unwrap();

        let err = ctx.wait_ready(Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, McpClientError::StartupTimeout(_)));

        // The setup failure lands after the starter gave up; the thread
        // must wind down on its own without replacing the recorded cause.
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while ctx.is_thread_alive() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(!ctx.is_thread_alive());
        match ctx.handshake_state() {
            HandshakeState::Failed(cause) => {
                assert!(matches!(*cause, McpError::Timeout(_)));
                assert!(cause.to_string().contains("did not complete within"));
            }
            other => panic!("expected a failed handshake, got {other:?}"),
        }
        assert!(ctx.shutdown(Duration::from_secs(5)));
    }
}
