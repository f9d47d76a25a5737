//! Server errors

use std::io;

use thiserror::Error;

/// Failure that stops a hub server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Listener could not be bound
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Requested address
        addr: String,
        /// Underlying error
        #[source]
        source: io::Error,
    },

    /// Transport stopped accepting connections
    #[error("transport stopped accepting connections: {0}")]
    Accept(#[source] io::Error),

    /// Method table could not be built
    #[error(transparent)]
    Table(#[from] streamhub_core::TableError),
}
