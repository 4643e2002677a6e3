use std::time::Duration;

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Client lifecycle bounds
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// How long `start()` waits for the background session to report ready.
    #[serde(default = "d_startup_timeout_secs")]
    pub startup_timeout_secs: u64,
    /// How long `stop()` waits for the background thread to exit.
    #[serde(default = "d_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
    /// Response timeout applied by the transport to every JSON-RPC request.
    #[serde(default = "d_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            startup_timeout_secs: d_startup_timeout_secs(),
            shutdown_timeout_secs: d_shutdown_timeout_secs(),
            request_timeout_secs: d_request_timeout_secs(),
        }
    }
}

impl ClientConfig {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn d_startup_timeout_secs() -> u64 {
    30
}
fn d_shutdown_timeout_secs() -> u64 {
    5
}
fn d_request_timeout_secs() -> u64 {
    30
}
