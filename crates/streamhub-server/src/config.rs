//! Server configuration.

use std::time::Duration;

use streamhub_core::{HeartbeatConfig, PayloadPool};

/// Hub server settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Server-initiated heartbeat timing; [`HeartbeatConfig::DISABLED`] turns
    /// liveness checks off
    pub heartbeat: HeartbeatConfig,
    /// Include handler diagnostic messages in error responses
    pub expose_exception_details: bool,
    /// Frames queued per connection before senders wait (or broadcasts drop)
    pub outbox_capacity: usize,
    /// Deadline for server-to-client invocations; `None` waits until the
    /// client answers or disconnects
    pub client_invoke_timeout: Option<Duration>,
    /// Largest buffer a payload pool slot keeps between uses
    pub max_retained_payload: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            heartbeat: HeartbeatConfig::default(),
            expose_exception_details: false,
            outbox_capacity: 1024,
            client_invoke_timeout: Some(Duration::from_secs(30)),
            max_retained_payload: PayloadPool::DEFAULT_MAX_RETAINED_CAPACITY,
        }
    }
}
