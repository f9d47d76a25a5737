use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::{HeartbeatAction, HeartbeatConfig, HeartbeatMonitor};
use crate::env::Environment;

/// Runs a [`HeartbeatMonitor`] for one connection on a tokio task.
///
/// The send callback is invoked for every heartbeat and returns `false` once
/// the connection can no longer send, which stops the task. A watchdog expiry
/// cancels [`HeartbeatHandle::timeout_token`]; only the owning connection
/// observes it. Dropping the handle stops the task.
#[derive(Debug)]
pub struct HeartbeatHandle {
    monitor: Arc<Mutex<HeartbeatMonitor>>,
    timed_out: CancellationToken,
    shutdown: CancellationToken,
}

impl HeartbeatHandle {
    /// Start timers for a connection registered at `env.now()`.
    pub fn spawn<E, F>(env: E, config: HeartbeatConfig, send: F) -> Self
    where
        E: Environment,
        F: FnMut(u32) -> bool + Send + 'static,
    {
        let monitor = Arc::new(Mutex::new(HeartbeatMonitor::new(env.now(), config)));
        let timed_out = CancellationToken::new();
        let shutdown = CancellationToken::new();

        if config.is_enabled() {
            tokio::spawn(drive(
                env,
                Arc::clone(&monitor),
                send,
                timed_out.clone(),
                shutdown.clone(),
            ));
        }

        Self { monitor, timed_out, shutdown }
    }

    /// Record an acknowledgement; returns the measured latency if known.
    pub fn ack(&self, sequence: u32, now: Instant) -> Option<Duration> {
        self.monitor.lock().ack(sequence, now)
    }

    /// Most recent latency measurement
    pub fn latency(&self) -> Option<Duration> {
        self.monitor.lock().latency()
    }

    /// When the last acknowledgement arrived
    pub fn last_ack_at(&self) -> Option<Instant> {
        self.monitor.lock().last_ack_at()
    }

    /// Most recently sent sequence
    pub fn latest_sequence(&self) -> Option<u32> {
        self.monitor.lock().latest_sequence()
    }

    /// Token cancelled when the watchdog expires
    pub fn timeout_token(&self) -> CancellationToken {
        self.timed_out.clone()
    }

    /// Resolves when the watchdog expires
    pub async fn timed_out(&self) {
        self.timed_out.cancelled().await;
    }

    /// Whether the watchdog expired
    pub fn is_timed_out(&self) -> bool {
        self.timed_out.is_cancelled()
    }

    /// Stop both timers. Idempotent.
    pub fn dispose(&self) {
        self.shutdown.cancel();
        self.monitor.lock().dispose();
    }
}

impl Drop for HeartbeatHandle {
    fn drop(&mut self) {
        self.dispose();
    }
}

async fn drive<E, F>(
    env: E,
    monitor: Arc<Mutex<HeartbeatMonitor>>,
    mut send: F,
    timed_out: CancellationToken,
    shutdown: CancellationToken,
) where
    E: Environment,
    F: FnMut(u32) -> bool + Send + 'static,
{
    loop {
        let Some(deadline) = monitor.lock().next_deadline() else { return };
        let wait = deadline.saturating_duration_since(env.now());

        tokio::select! {
            () = shutdown.cancelled() => return,
            () = env.sleep(wait) => {},
        }

        let actions = monitor.lock().tick(env.now());
        for action in actions {
            match action {
                HeartbeatAction::SendHeartbeat { sequence } => {
                    if !send(sequence) {
                        tracing::debug!(sequence, "connection stopped accepting heartbeats");
                        return;
                    }
                },
                HeartbeatAction::TimedOut { sequence } => {
                    tracing::info!(sequence, "heartbeat not acknowledged in time");
                    timed_out.cancel();
                    return;
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use tokio::sync::mpsc;

    use super::*;
    use crate::env::SystemEnv;

    fn config(interval_secs: u64, timeout_secs: u64) -> HeartbeatConfig {
        HeartbeatConfig {
            interval: Some(Duration::from_secs(interval_secs)),
            timeout: Some(Duration::from_secs(timeout_secs)),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_heartbeats_time_out() {
        let start = SystemEnv.now();
        let handle = HeartbeatHandle::spawn(SystemEnv, config(1, 3), |_| true);

        tokio::time::timeout(Duration::from_secs(10), handle.timed_out())
            .await
            .expect("watchdog should fire");

        assert!(SystemEnv.now().duration_since(start) >= Duration::from_secs(4));
        assert!(handle.is_timed_out());
    }

    #[tokio::test(start_paused = true)]
    async fn answered_heartbeats_stay_alive() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = HeartbeatHandle::spawn(SystemEnv, config(1, 3), move |seq| tx.send(seq).is_ok());

        let until = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            tokio::select! {
                Some(sequence) = rx.recv() => {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    let latency = handle.ack(sequence, SystemEnv.now()).expect("sequence is known");
                    assert!(latency >= Duration::from_millis(20) && latency < Duration::from_millis(25));
                },
                () = tokio::time::sleep_until(until) => break,
            }
        }

        assert!(!handle.is_timed_out());
        assert!(handle.latest_sequence().is_some_and(|seq| seq >= 8));
    }

    #[tokio::test(start_paused = true)]
    async fn dispose_stops_sending() {
        let sent = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&sent);
        let handle = HeartbeatHandle::spawn(SystemEnv, config(1, 3), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            true
        });

        tokio::time::sleep(Duration::from_millis(2500)).await;
        handle.dispose();
        let before = sent.load(Ordering::SeqCst);
        assert_eq!(before, 2);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(sent.load(Ordering::SeqCst), before);
        assert!(!handle.is_timed_out());
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_send_stops_the_task() {
        let sent = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&sent);
        let handle = HeartbeatHandle::spawn(SystemEnv, config(1, 3), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            false
        });

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(sent.load(Ordering::SeqCst), 1);
        assert!(!handle.is_timed_out());
    }
}
