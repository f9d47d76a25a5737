//! StreamHub connection building blocks
//!
//! Everything a hub connection needs that is not specific to the server or
//! the client side: liveness tracking, group fan-out, the method table,
//! per-connection send serialization, and the transport abstraction.
//!
//! # Architecture
//!
//! Protocol decisions live in small state machines that take time as a
//! parameter ([`heartbeat::HeartbeatMonitor`], [`pending::PendingCalls`]).
//! Thin async drivers ([`heartbeat::HeartbeatHandle`], [`outbox::Outbox`])
//! run them on tokio using an [`env::Environment`] for time and randomness,
//! so the same logic runs under real time, tokio's paused clock, and
//! turmoil simulations.
//!
//! ```text
//!            ┌────────────┐   Bytes    ┌──────────┐   Frame   ┌─────────────┐
//! transport ─│  Receiver  │──────────> │  decode  │─────────> │ dispatcher  │
//!            └────────────┘            └──────────┘           └─────────────┘
//!                                                               │   │   │
//!            ┌────────────┐   Bytes    ┌──────────┐  enqueue    │   │   │
//! transport <│   Sender   │<───────────│  Outbox  │<────────────┘   │   │
//!            └────────────┘  (1 task)  └──────────┘   heartbeat ────┘   │
//!                                           ▲          group fan-out ───┘
//! ```
//!
//! # Components
//!
//! - [`mod@env`]: Environment abstraction (time, RNG)
//! - [`transport`]: Message transport traits
//! - [`framed`]: Length-delimited adapter over byte streams, TCP transport
//! - [`outbox`]: Per-connection single-writer send queue
//! - [`payload`]: Generation-stamped payload buffer pool
//! - [`heartbeat`]: Liveness watchdog
//! - [`pending`]: Outstanding call registry
//! - [`group`]: Broadcast groups and the group registry
//! - [`method`]: Method table binding ids to handlers
//! - [`error`]: Error types

pub mod env;
pub mod error;
pub mod framed;
pub mod group;
pub mod heartbeat;
pub mod method;
pub mod outbox;
pub mod payload;
pub mod pending;
pub mod transport;

pub use env::{Environment, SystemEnv};
pub use error::{CallError, DeliveryError, DisconnectReason, HubError, MethodError, PoolError, TableError};
pub use group::{BroadcastGroup, DeliveryReport, GroupMember, GroupRegistry, Target};
pub use heartbeat::{HeartbeatAction, HeartbeatConfig, HeartbeatHandle, HeartbeatMonitor};
pub use method::{HandlerFuture, MethodEntry, MethodHandler, MethodTable, MethodTableBuilder, decode_args};
pub use outbox::{Outbox, OutboxError};
pub use payload::{PayloadHandle, PayloadPool, PoolStats, PooledPayload};
pub use pending::{PendingCall, PendingCalls};
pub use transport::{
    Connector, IncomingConnection, MessageReceiver, MessageSender, Transport, TransportConnection,
};
