use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

use super::{HeartbeatAction, HeartbeatConfig};

/// Sent-time entries kept for latency measurement
const SENT_AT_CAPACITY: usize = 16;

/// Monitor lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    /// Timers running
    Running,
    /// Watchdog expired; no further actions
    TimedOut,
    /// Stopped by the owner
    Disposed,
}

/// Heartbeat state machine for one connection.
///
/// Pure: callers pass the current time and execute the returned actions.
/// Call [`HeartbeatMonitor::tick`] at (or after) [`HeartbeatMonitor::next_deadline`].
#[derive(Debug, Clone)]
pub struct HeartbeatMonitor {
    config: HeartbeatConfig,
    state: MonitorState,
    next_send_at: Option<Instant>,
    watchdog_at: Option<Instant>,
    next_sequence: u32,
    latest_sequence: Option<u32>,
    latest_acknowledged: bool,
    sent_at: VecDeque<(u32, Instant)>,
    latency: Option<Duration>,
    last_ack_at: Option<Instant>,
}

impl HeartbeatMonitor {
    /// Start monitoring at `now`; the first heartbeat is due one interval later.
    pub fn new(now: Instant, config: HeartbeatConfig) -> Self {
        Self {
            config,
            state: MonitorState::Running,
            next_send_at: config.interval.map(|interval| now + interval),
            watchdog_at: None,
            next_sequence: 0,
            latest_sequence: None,
            latest_acknowledged: false,
            sent_at: VecDeque::with_capacity(SENT_AT_CAPACITY),
            latency: None,
            last_ack_at: None,
        }
    }

    /// Current state
    pub fn state(&self) -> MonitorState {
        self.state
    }

    /// Most recently sent sequence
    pub fn latest_sequence(&self) -> Option<u32> {
        self.latest_sequence
    }

    /// Most recent latency measurement
    pub fn latency(&self) -> Option<Duration> {
        self.latency
    }

    /// When the last acknowledgement arrived
    pub fn last_ack_at(&self) -> Option<Instant> {
        self.last_ack_at
    }

    /// Earliest instant at which [`tick`](Self::tick) has work to do.
    ///
    /// `None` when nothing is scheduled (timers disabled, timed out, disposed).
    pub fn next_deadline(&self) -> Option<Instant> {
        if self.state != MonitorState::Running {
            return None;
        }
        match (self.next_send_at, self.watchdog_at) {
            (Some(send), Some(watchdog)) => Some(send.min(watchdog)),
            (send, watchdog) => send.or(watchdog),
        }
    }

    /// Advance timers to `now`.
    ///
    /// The watchdog is evaluated before the send timer, so a heartbeat due at
    /// the same instant as a check never rescues that check.
    pub fn tick(&mut self, now: Instant) -> Vec<HeartbeatAction> {
        let mut actions = Vec::new();
        if self.state != MonitorState::Running {
            return actions;
        }

        if let (Some(deadline), Some(timeout)) = (self.watchdog_at, self.config.timeout)
            && now >= deadline
        {
            if self.latest_acknowledged {
                self.latest_acknowledged = false;
                self.watchdog_at = Some(now + timeout);
            } else {
                self.state = MonitorState::TimedOut;
                self.next_send_at = None;
                self.watchdog_at = None;
                actions.push(HeartbeatAction::TimedOut {
                    sequence: self.latest_sequence.unwrap_or_default(),
                });
                return actions;
            }
        }

        if let (Some(due), Some(interval)) = (self.next_send_at, self.config.interval)
            && now >= due
        {
            let sequence = self.next_sequence;
            self.next_sequence = self.next_sequence.wrapping_add(1);
            self.latest_sequence = Some(sequence);

            if self.sent_at.len() == SENT_AT_CAPACITY {
                self.sent_at.pop_front();
            }
            self.sent_at.push_back((sequence, now));

            if self.watchdog_at.is_none() {
                self.watchdog_at = self.config.timeout.map(|timeout| now + timeout);
            }

            // Keep the cadence unless the driver fell a whole interval behind
            let next = due + interval;
            self.next_send_at = Some(if next > now { next } else { now + interval });

            actions.push(HeartbeatAction::SendHeartbeat { sequence });
        }

        actions
    }

    /// Record an acknowledgement of `sequence` received at `now`.
    ///
    /// Returns the round-trip latency if the sequence is still remembered.
    /// Only an ack of the most recently sent sequence counts as liveness.
    pub fn ack(&mut self, sequence: u32, now: Instant) -> Option<Duration> {
        if self.state != MonitorState::Running {
            return None;
        }

        self.last_ack_at = Some(now);
        if self.latest_sequence == Some(sequence) {
            self.latest_acknowledged = true;
        }

        let sent = self.sent_at.iter().find(|(seq, _)| *seq == sequence).map(|(_, at)| *at)?;
        let latency = now.saturating_duration_since(sent);
        self.latency = Some(latency);
        Some(latency)
    }

    /// Stop all timers and forget retained state.
    pub fn dispose(&mut self) {
        self.state = MonitorState::Disposed;
        self.next_send_at = None;
        self.watchdog_at = None;
        self.sent_at.clear();
    }
}
