//! StreamHub server
//!
//! Hosts one hub (a [`streamhub_core::MethodTable`] of hub methods) over any
//! [`streamhub_core::Transport`].
//!
//! # Architecture
//!
//! ```text
//!                  ┌──────────────────────────────────────────────┐
//!  Transport ────> │ HubServer::serve (accept loop)               │
//!                  └──────────────┬───────────────────────────────┘
//!                                 │ one task per connection
//!                  ┌──────────────▼───────────────────────────────┐
//!                  │ connection receive loop                      │
//!                  │   decode ─> dispatch ─> handler tasks        │
//!                  │   HeartbeatHandle (watchdog)                 │
//!                  │   ClientInvoker (server → client calls)      │
//!                  └──────────────┬───────────────────────────────┘
//!                                 │ encoded frames
//!                  ┌──────────────▼───────┐      ┌───────────────┐
//!                  │ Outbox (writer task) │ <─── │ GroupRegistry │
//!                  └──────────────────────┘      └───────────────┘
//! ```
//!
//! Connections are independent: a malformed frame, a transport error or a
//! missed heartbeat tears down that connection only. Teardown order is fixed:
//! heartbeat stopped, client invokes cancelled, `on_disconnect` run, group
//! memberships removed, outbox drained and closed.
//!
//! # Components
//!
//! - [`server`]: [`HubServer`], accept loop and connection table
//! - [`context`]: [`HubContext`] handed to every hub method
//! - [`client_invoke`]: [`ClientInvoker`] for server-to-client calls
//! - [`lifecycle`]: connect/disconnect hooks and heartbeat metadata
//! - [`config`]: [`ServerConfig`]
//! - [`chat`]: demo chat hub used by the binary

pub mod chat;
pub mod client_invoke;
pub mod config;
mod connection;
pub mod context;
pub mod error;
pub mod lifecycle;
pub mod server;

pub use client_invoke::ClientInvoker;
pub use config::ServerConfig;
pub use context::{HeartbeatView, HubContext};
pub use error::ServerError;
pub use lifecycle::{HeartbeatMetadataProvider, HubLifecycle, NoLifecycle};
pub use server::{HubServer, HubServerBuilder};
