//! One-shot readiness signal from the background context to the thread
//! that called `start()`.
//!
//! The cell is single-assignment: the first of `resolve_ready` /
//! `resolve_failed` wins and every later resolution is a no-op. Both the
//! background thread and a timed-out starter may race to resolve it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::McpError;

#[derive(Debug, Clone)]
pub enum HandshakeState {
    Pending,
    /// The background thread has begun setup.
    Running,
    Ready,
    Failed(Arc<McpError>),
}

impl HandshakeState {
    fn is_resolved(&self) -> bool {
        matches!(self, HandshakeState::Ready | HandshakeState::Failed(_))
    }
}

/// What a bounded wait observed.
#[derive(Debug, Clone)]
pub enum WaitOutcome {
    Ready,
    Failed(Arc<McpError>),
    TimedOut,
}

#[derive(Debug)]
pub struct InitHandshake {
    state: Mutex<HandshakeState>,
    resolved: Condvar,
}

impl Default for InitHandshake {
    fn default() -> Self {
        Self::new()
    }
}

impl InitHandshake {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HandshakeState::Pending),
            resolved: Condvar::new(),
        }
    }

    /// `Pending → Running`. Returns `false` if setup already began or the
    /// cell is resolved.
    pub fn mark_running(&self) -> bool {
        let mut state = self.state.lock();
        if matches!(*state, HandshakeState::Pending) {
            *state = HandshakeState::Running;
            true
        } else {
            false
        }
    }

    /// Whether nobody has resolved the cell yet.
    pub fn is_awaiting(&self) -> bool {
        !self.state.lock().is_resolved()
    }

    pub fn state(&self) -> HandshakeState {
        self.state.lock().clone()
    }

    /// Resolve to `Ready`. No-op (returns `false`) if already resolved.
    pub fn resolve_ready(&self) -> bool {
        self.resolve(HandshakeState::Ready)
    }

    /// Resolve to `Failed`. No-op (returns `false`) if already resolved.
    pub fn resolve_failed(&self, error: McpError) -> bool {
        self.resolve(HandshakeState::Failed(Arc::new(error)))
    }

    fn resolve(&self, outcome: HandshakeState) -> bool {
        let mut state = self.state.lock();
        if state.is_resolved() {
            return false;
        }
        *state = outcome;
        self.resolved.notify_all();
        true
    }

    /// Block until the cell resolves or `timeout` elapses.
    pub fn wait(&self, timeout: Duration) -> WaitOutcome {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            match &*state {
                HandshakeState::Ready => return WaitOutcome::Ready,
                HandshakeState::Failed(err) => return WaitOutcome::Failed(err.clone()),
                HandshakeState::Pending | HandshakeState::Running => {}
            }
            if self.resolved.wait_until(&mut state, deadline).timed_out() {
                return match &*state {
                    HandshakeState::Ready => WaitOutcome::Ready,
                    HandshakeState::Failed(err) => WaitOutcome::Failed(err.clone()),
                    HandshakeState::Pending | HandshakeState::Running => WaitOutcome::TimedOut,
                };
            }
        }
    }
}

/// Resolves the handshake as failed when dropped while still unresolved.
///
/// Held by the background thread for its whole life, so an early return or
/// a panic before either outcome is signalled never leaves the starter
/// waiting out the full timeout.
pub(crate) struct ResolveOnExit(pub(crate) Arc<InitHandshake>);

impl Drop for ResolveOnExit {
    fn drop(&mut self) {
        let resolved = self.0.resolve_failed(McpError::Background(
            "background context exited before initialization completed".into(),
        ));
        if resolved {
            tracing::warn!("background context exited before resolving the init handshake");
        }
    }
}
