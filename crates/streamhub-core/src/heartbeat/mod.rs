//! Heartbeat liveness watchdog.
//!
//! Detects half-open or unresponsive peers without relying on transport
//! keepalive. The sending side emits numbered heartbeats on an interval and a
//! watchdog checks, once per timeout period, that the *most recent*
//! heartbeat was acknowledged.
//!
//! # Dead-man's switch
//!
//! There is a single "latest acknowledged" flag, not a per-sequence table.
//! An ack sets the flag only when it names the most recently sent sequence;
//! the watchdog clears it every time it fires. A peer that answers slowly
//! enough that its acks always trail the latest heartbeat is therefore
//! treated as dead, even though every ack eventually arrives.
//!
//! ```text
//! t=0   t=1        t=2        t=3          t=4
//!  │     send #0    send #1    send #2      watchdog: flag set?  yes -> clear, re-arm
//!  │     arm watchdog (t=4)       ack #2 ──> flag = true           no  -> TimedOut
//! ```
//!
//! Latency is measured for every ack whose sequence is still remembered,
//! stale or not.
//!
//! [`HeartbeatMonitor`] is the pure state machine; [`HeartbeatHandle`] runs it
//! on a tokio task.

mod handle;
mod monitor;

use std::time::Duration;

pub use handle::HeartbeatHandle;
pub use monitor::{HeartbeatMonitor, MonitorState};

/// Heartbeat timing.
///
/// `None` disables a timer independently: no `interval` means no heartbeats
/// (and so the watchdog never arms); no `timeout` means heartbeats are sent
/// for latency measurement only.
///
/// The watchdog re-arms on its own period, so `timeout` should be at least
/// `interval`; otherwise a check can land between two heartbeats with the
/// flag already cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// Time between heartbeats
    pub interval: Option<Duration>,
    /// Time the peer has to acknowledge the latest heartbeat
    pub timeout: Option<Duration>,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self { interval: Some(Duration::from_secs(10)), timeout: Some(Duration::from_secs(30)) }
    }
}

impl HeartbeatConfig {
    /// Both timers off
    pub const DISABLED: Self = Self { interval: None, timeout: None };

    /// Whether any timer is running
    pub fn is_enabled(&self) -> bool {
        self.interval.is_some()
    }
}

/// Actions returned by the heartbeat monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    /// Send a heartbeat carrying this sequence
    SendHeartbeat {
        /// Sequence assigned to the heartbeat
        sequence: u32,
    },

    /// The latest heartbeat was not acknowledged in time; tear down the
    /// connection. Emitted at most once.
    TimedOut {
        /// Most recently sent sequence
        sequence: u32,
    },
}
