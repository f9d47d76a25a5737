//! Client configuration.

use std::{fmt, sync::Arc, time::Duration};

use bytes::Bytes;
use streamhub_core::{HeartbeatConfig, PayloadPool};
use streamhub_proto::ConnectionId;

/// A server heartbeat as seen by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerHeartbeatEvent {
    /// Heartbeat sequence
    pub sequence: u32,
    /// Server wall clock at send time, Unix milliseconds
    pub sent_at_ms: i64,
    /// Metadata attached by the server (empty when absent)
    pub metadata: Bytes,
}

/// Acknowledgement of a client heartbeat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHeartbeatEvent {
    /// Acknowledged sequence
    pub sequence: u32,
    /// Round trip time, if the sequence was still remembered
    pub latency: Option<Duration>,
}

/// Callback for server heartbeats
pub type ServerHeartbeatCallback = Arc<dyn Fn(&ServerHeartbeatEvent) + Send + Sync>;

/// Callback for client heartbeat acknowledgements
pub type ClientHeartbeatCallback = Arc<dyn Fn(&ClientHeartbeatEvent) + Send + Sync>;

/// Options for one [`crate::HubConnection`].
#[derive(Clone)]
pub struct ClientOptions {
    /// Client-initiated heartbeats. Off by default; the server drives
    /// liveness.
    pub heartbeat: HeartbeatConfig,
    /// Deadline for outgoing calls; `None` waits until the connection ends
    pub call_timeout: Option<Duration>,
    /// Frames queued for sending
    pub outbox_capacity: usize,
    /// Server pushes queued for receivers.
    ///
    /// When the queue is full the connection stops reading frames until a
    /// receiver finishes, so a slow receiver holds back the server instead of
    /// growing client memory. Responses behind the stalled push wait too: a
    /// receiver that awaits a call on its own connection while the queue is
    /// full only resumes when that call times out.
    pub push_capacity: usize,
    /// Largest buffer the receiver payload pool keeps for reuse
    pub max_retained_payload: usize,
    /// Invoked for every server heartbeat, after it was acknowledged
    pub on_server_heartbeat: Option<ServerHeartbeatCallback>,
    /// Invoked for every acknowledgement of a client heartbeat
    pub on_client_heartbeat_ack: Option<ClientHeartbeatCallback>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            heartbeat: HeartbeatConfig::DISABLED,
            call_timeout: None,
            outbox_capacity: 256,
            push_capacity: 256,
            max_retained_payload: PayloadPool::DEFAULT_MAX_RETAINED_CAPACITY,
            on_server_heartbeat: None,
            on_client_heartbeat_ack: None,
        }
    }
}

impl ClientOptions {
    /// Call `f` for every server heartbeat
    #[must_use]
    pub fn on_server_heartbeat(
        mut self,
        f: impl Fn(&ServerHeartbeatEvent) + Send + Sync + 'static,
    ) -> Self {
        self.on_server_heartbeat = Some(Arc::new(f));
        self
    }

    /// Call `f` for every client heartbeat acknowledgement
    #[must_use]
    pub fn on_client_heartbeat_ack(
        mut self,
        f: impl Fn(&ClientHeartbeatEvent) + Send + Sync + 'static,
    ) -> Self {
        self.on_client_heartbeat_ack = Some(Arc::new(f));
        self
    }
}

impl fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientOptions")
            .field("heartbeat", &self.heartbeat)
            .field("call_timeout", &self.call_timeout)
            .field("outbox_capacity", &self.outbox_capacity)
            .field("push_capacity", &self.push_capacity)
            .field("max_retained_payload", &self.max_retained_payload)
            .field("on_server_heartbeat", &self.on_server_heartbeat.is_some())
            .field("on_client_heartbeat_ack", &self.on_client_heartbeat_ack.is_some())
            .finish()
    }
}

/// Delay between connection attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RetryPolicy {
    /// Same delay after every failure
    Fixed(Duration),
    /// `initial * multiplier^(attempt - 1)`, capped at `max`
    Exponential {
        /// Delay after the first failure
        initial: Duration,
        /// Upper bound
        max: Duration,
        /// Growth per failure
        multiplier: f64,
    },
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::Exponential {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after `attempt` consecutive failures (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Self::Fixed(delay) => delay,
            Self::Exponential { initial, max, multiplier } => {
                let exponent = attempt.saturating_sub(1).min(64) as i32;
                let secs = initial.as_secs_f64() * multiplier.max(1.0).powi(exponent);
                Duration::try_from_secs_f64(secs).map_or(max, |delay| delay.min(max))
            },
        }
    }
}

/// Which identity a reconnect presents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IdentityMode {
    /// Keep the first identity for the lifetime of the channel
    #[default]
    Reuse,
    /// Mint a fresh identity for every attempt
    PerAttempt,
}

/// Produces connection identities
pub type IdentityFactory = Arc<dyn Fn() -> ConnectionId + Send + Sync>;

/// Options for a [`crate::ReconnectingChannel`].
#[derive(Clone)]
pub struct ChannelOptions {
    /// Options for every underlying connection
    pub client: ClientOptions,
    /// Delay between failed attempts
    pub retry: RetryPolicy,
    /// Identity across reconnects
    pub identity: IdentityMode,
    /// Identity source; random ids from the environment when `None`
    pub identity_factory: Option<IdentityFactory>,
    /// How long the liveness probe of a fresh connection may take
    pub probe_timeout: Duration,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            client: ClientOptions::default(),
            retry: RetryPolicy::default(),
            identity: IdentityMode::Reuse,
            identity_factory: None,
            probe_timeout: Duration::from_secs(5),
        }
    }
}

impl ChannelOptions {
    /// Use `factory` to mint identities
    #[must_use]
    pub fn identity_factory(mut self, factory: impl Fn() -> ConnectionId + Send + Sync + 'static) -> Self {
        self.identity_factory = Some(Arc::new(factory));
        self
    }
}

impl fmt::Debug for ChannelOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelOptions")
            .field("client", &self.client)
            .field("retry", &self.retry)
            .field("identity", &self.identity)
            .field("identity_factory", &self.identity_factory.is_some())
            .field("probe_timeout", &self.probe_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_backoff_grows_and_caps() {
        let policy = RetryPolicy::Exponential {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(1),
            multiplier: 2.0,
        };
        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(200));
        assert_eq!(policy.delay(4), Duration::from_millis(800));
        assert_eq!(policy.delay(5), Duration::from_secs(1));
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(1));
    }

    #[test]
    fn fixed_policy_ignores_attempts() {
        let policy = RetryPolicy::Fixed(Duration::from_millis(250));
        assert_eq!(policy.delay(1), policy.delay(40));
    }
}
