use std::io;

use streamhub_core::CallError;
use thiserror::Error;

/// Failure of a [`crate::ReconnectingChannel`] operation or attempt.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The channel was disposed
    #[error("channel disposed")]
    Disposed,

    /// Transport connect failed
    #[error("connect failed: {0}")]
    Connect(#[source] io::Error),

    /// The fresh connection did not answer its liveness probe
    #[error("liveness probe failed: {0}")]
    Probe(#[source] CallError),
}
