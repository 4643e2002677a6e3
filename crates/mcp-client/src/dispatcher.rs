//! Moves session operations from caller threads onto the background context.
//!
//! Every operation is scheduled as a task on the background runtime and its
//! outcome travels back over a oneshot channel. The caller chooses how to
//! wait: [`CallHandle::wait`] parks the calling thread, [`CallHandle::wait_async`]
//! awaits from any other runtime.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::thread::{self, Thread};

use futures_util::task::{waker, ArcWake};
use futures_util::FutureExt;
use tokio::runtime::{self, Handle, RuntimeFlavor};
use tokio::sync::oneshot;

use crate::error::{DispatchError, McpError};
use crate::session::McpSession;

/// Schedules closures over the live session onto the background runtime.
#[derive(Clone)]
pub struct Dispatcher {
    handle: Handle,
    session: Arc<dyn McpSession>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher").finish_non_exhaustive()
    }
}

impl Dispatcher {
    pub fn new(handle: Handle, session: Arc<dyn McpSession>) -> Self {
        Self { handle, session }
    }

    /// Schedule `op` on the background context.
    ///
    /// A panic inside `op` is caught and reported as
    /// [`DispatchError::Panicked`]; it never takes down the runtime.
    pub fn submit<T, F, Fut>(&self, op: F) -> CallHandle<T>
    where
        T: Send + 'static,
        F: FnOnce(Arc<dyn McpSession>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, McpError>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let session = self.session.clone();

        self.handle.spawn(async move {
            let outcome = match AssertUnwindSafe(async move { op(session).await })
                .catch_unwind()
                .await
            {
                Ok(result) => result,
                Err(_) => {
                    tracing::error!("scheduled MCP call panicked");
                    Err(McpError::Dispatch(DispatchError::Panicked))
                }
            };
            // The caller may have given up waiting.
            let _ = tx.send(outcome);
        });

        CallHandle {
            rx,
            origin: self.handle.id(),
        }
    }
}

/// The pending result of a call scheduled through a [`Dispatcher`].
#[must_use = "a CallHandle does nothing unless waited on"]
pub struct CallHandle<T> {
    rx: oneshot::Receiver<Result<T, McpError>>,
    /// The runtime the call was scheduled on.
    origin: runtime::Id,
}

impl<T> CallHandle<T> {
    /// Park the current thread until the call completes.
    ///
    /// Works from plain threads, `spawn_blocking` closures and threads that
    /// merely entered a runtime handle. On a multi-thread runtime worker the
    /// wait goes through `block_in_place` so the worker's other tasks move
    /// elsewhere. Only a caller running on the background runtime itself is
    /// refused: the call could never be driven while that thread is parked.
    pub fn wait(self) -> Result<T, McpError> {
        let rx = match Handle::try_current() {
            Ok(current) if current.id() == self.origin => {
                return Err(DispatchError::BlockingInAsyncContext.into());
            }
            Ok(current) if current.runtime_flavor() == RuntimeFlavor::MultiThread => {
                tokio::task::block_in_place(|| park_on(self.rx))
            }
            _ => park_on(self.rx),
        };
        rx.map_err(|_| DispatchError::ContextShutDown)?
    }

    /// Await the call from another async context.
    pub async fn wait_async(self) -> Result<T, McpError> {
        self.rx.await.map_err(|_| DispatchError::ContextShutDown)?
    }
}

/// Wakes a parked thread.
struct ThreadWaker(Thread);

impl ArcWake for ThreadWaker {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.0.unpark();
    }
}

/// Poll `rx` on the current thread, parking between wakeups.
///
/// Unlike `Receiver::blocking_recv` this never checks for an entered
/// runtime, so it is usable under a `Handle::enter` guard. The receiver is
/// polled unconstrained; an exhausted coop budget on the caller's task
/// would otherwise spin forever.
fn park_on<T>(rx: oneshot::Receiver<T>) -> Result<T, oneshot::error::RecvError> {
    let waker = waker(Arc::new(ThreadWaker(thread::current())));
    let mut cx = Context::from_waker(&waker);
    let mut rx = pin!(tokio::task::unconstrained(rx));
    loop {
        match rx.as_mut().poll(&mut cx) {
            Poll::Ready(out) => return out,
            Poll::Pending => thread::park(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{InitializeResult, McpToolDef, ToolCallResult};
    use async_trait::async_trait;
    use serde_json::Value;
    use std::time::Duration;

    struct EchoSession;

    #[async_trait]
    impl McpSession for EchoSession {
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

    fn background_runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap()
    }

    #[test]
    fn wait_returns_operation_result() {
        let rt = background_runtime();
        let dispatcher = Dispatcher::new(rt.handle().clone(), Arc::new(EchoSession));

        let result = dispatcher
            .submit(|s| async move { s.call_tool("ping", Value::Null, None).await })
            .wait()
            .unwrap();
        assert_eq!(result, ToolCallResult::text("ping"));
    }

    #[test]
    fn panic_in_operation_is_reported() {
        let rt = background_runtime();
        let dispatcher = Dispatcher::new(rt.handle().clone(), Arc::new(EchoSession));

        let err = dispatcher
            .submit(|_s| async move {
                if true {
                    panic!("boom");
                }
                Ok(())
            })
            .wait()
            .unwrap_err();
        assert!(matches!(err, McpError::Dispatch(DispatchError::Panicked)));

        // The runtime keeps serving after a panic.
        let ok = dispatcher.submit(|_s| async move { Ok(7) }).wait().unwrap();
        assert_eq!(ok, 7);
    }

    #[test]
    fn runtime_shutdown_fails_pending_call() {
        let rt = background_runtime();
        let dispatcher = Dispatcher::new(rt.handle().clone(), Arc::new(EchoSession));

        let pending = dispatcher.submit(|_s| async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        });
        rt.shutdown_timeout(Duration::from_millis(100));

        let err = pending.wait().unwrap_err();
        assert!(matches!(err, McpError::Dispatch(DispatchError::ContextShutDown)));
    }

    #[test]
    fn blocking_wait_on_the_background_runtime_is_refused() {
        let bg = background_runtime();
        let dispatcher = Dispatcher::new(bg.handle().clone(), Arc::new(EchoSession));

        let nested = dispatcher.clone();
        let err = dispatcher
            .submit(move |_s| async move {
                Ok(nested.submit(|_s| async move { Ok(()) }).wait().unwrap_err())
            })
            .wait()
            .unwrap();
        assert!(matches!(
            err,
            McpError::Dispatch(DispatchError::BlockingInAsyncContext)
        ));
    }

    #[test]
    fn blocking_wait_inside_spawn_blocking() {
        let bg = background_runtime();
        let dispatcher = Dispatcher::new(bg.handle().clone(), Arc::new(EchoSession));

        let caller = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        let result = caller
            .block_on(async move {
                tokio::task::spawn_blocking(move || {
                    dispatcher
                        .submit(|s| async move { s.call_tool("pool", Value::Null, None).await })
                        .wait()
                })
                .await
            })
            .unwrap();
        assert_eq!(result.unwrap(), ToolCallResult::text("pool"));
    }

    #[test]
    fn blocking_wait_under_entered_handle() {
        let bg = background_runtime();
        let dispatcher = Dispatcher::new(bg.handle().clone(), Arc::new(EchoSession));

        let caller = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        let _guard = caller.enter();
        let result = dispatcher
            .submit(|s| async move { s.call_tool("entered", Value::Null, None).await })
            .wait();
        assert_eq!(result.unwrap(), ToolCallResult::text("entered"));
    }

    #[test]
    fn blocking_wait_on_foreign_worker() {
        let bg = background_runtime();
        let dispatcher = Dispatcher::new(bg.handle().clone(), Arc::new(EchoSession));

        let caller = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .build()
            .unwrap();
        let result = caller
            .block_on(caller.spawn(async move {
                dispatcher
                    .submit(|s| async move { s.call_tool("worker", Value::Null, None).await })
                    .wait()
            }))
            .unwrap();
        assert_eq!(result.unwrap(), ToolCallResult::text("worker"));
    }

    #[test]
    fn wait_async_from_foreign_runtime() {
        let bg = background_runtime();
        let dispatcher = Dispatcher::new(bg.handle().clone(), Arc::new(EchoSession));

        let caller = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let result = caller.block_on(async {
            dispatcher
                .submit(|s| async move { s.call_tool("async", Value::Null, None).await })
                .wait_async()
                .await
        });
        assert_eq!(result.unwrap(), ToolCallResult::text("async"));
    }
}
