//! Environment abstraction for time and randomness.
//!
//! Hub logic never reads the clock or an RNG directly. Production uses
//! [`SystemEnv`]; the harness supplies a seeded environment so simulations
//! are reproducible.

use std::{
    future::Future,
    time::{Duration, Instant},
};

/// Source of time and randomness.
pub trait Environment: Clone + Send + Sync + 'static {
    /// Monotonic time, used for every timer and latency measurement
    fn now(&self) -> Instant;

    /// Wall clock in Unix milliseconds, only used for values sent to peers
    fn wall_clock_millis(&self) -> i64;

    /// Sleep for `duration`
    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send;

    /// Fill `buffer` with random bytes
    fn random_bytes(&self, buffer: &mut [u8]);

    /// Sixteen random bytes, the size of connection and request ids
    fn random_id_bytes(&self) -> [u8; 16] {
        let mut bytes = [0u8; 16];
        self.random_bytes(&mut bytes);
        bytes
    }
}

/// Environment backed by tokio's clock and the thread-local RNG.
///
/// `now` reads tokio's clock so paused-time tests and real time behave the
/// same way.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemEnv;

impl Environment for SystemEnv {
    fn now(&self) -> Instant {
        tokio::time::Instant::now().into_std()
    }

    #[allow(clippy::disallowed_methods)]
    fn wall_clock_millis(&self) -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_or(0, |elapsed| elapsed.as_millis() as i64)
    }

    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        use rand::RngCore;
        rand::thread_rng().fill_bytes(buffer);
    }
}
