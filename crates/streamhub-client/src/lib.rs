//! StreamHub client
//!
//! Two layers:
//!
//! - [`HubConnection`]: one transport connection. Correlates calls with
//!   responses, delivers server pushes to receivers in order, answers
//!   server-to-client invocations, echoes server heartbeats and optionally
//!   sends its own.
//! - [`ReconnectingChannel`]: supervises successive connections behind one
//!   identity, retrying with a [`RetryPolicy`] and probing every fresh
//!   connection before reporting it connected.
//!
//! # Architecture
//!
//! ```text
//!                         ┌─────────────────────┐
//!  typed client ────────> │ ReconnectingChannel │── state (watch), callbacks
//!  (HubClient)            └──────────┬──────────┘
//!                                    │ current
//!                         ┌──────────▼──────────┐   Receivers
//!  invoke / fnf ────────> │    HubConnection    │──────────────> push worker
//!                         └──────────┬──────────┘                handler tasks
//!                                    │ Outbox / receive loop
//!                               Connector
//! ```

mod channel;
mod connection;
mod context;
mod error;
mod options;

pub use channel::{ChannelState, DisconnectInfo, DisconnectRegistration, HubClient, ReconnectingChannel};
pub use connection::{HubConnection, PROBE_SEQUENCE_BASE, Receivers};
pub use context::ClientContext;
pub use error::ChannelError;
pub use options::{
    ChannelOptions, ClientHeartbeatCallback, ClientHeartbeatEvent, ClientOptions, IdentityFactory,
    IdentityMode, RetryPolicy, ServerHeartbeatCallback, ServerHeartbeatEvent,
};
