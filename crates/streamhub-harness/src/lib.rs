//! Deterministic test support for StreamHub.
//!
//! Implementations of the Environment and Transport traits for reproducible
//! tests: a seeded environment on tokio's (or turmoil's) clock, an
//! in-process network with fault injection, and turmoil TCP.

#![forbid(unsafe_code)]

pub mod memory;
pub mod sim_env;
pub mod sim_transport;

pub use memory::{MemoryConnection, MemoryConnector, MemoryListener, MemoryNetwork};
pub use sim_env::SimEnv;
pub use sim_transport::{SimConnector, SimTransport};
