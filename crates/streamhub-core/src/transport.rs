//! Transport abstraction for message-oriented duplex connections.
//!
//! A hub connection needs exactly one thing from its transport: an ordered,
//! reliable stream of discrete messages in each direction, plus the peer's
//! connection identity. Production uses [`crate::framed`] over TCP; tests use
//! the harness's in-memory network or turmoil TCP.

use std::io;

use async_trait::async_trait;
use bytes::Bytes;
use streamhub_proto::ConnectionId;

/// Server side of a transport: yields accepted connections.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Accepted connection, before its identity handshake
    type Incoming: IncomingConnection;

    /// Accept the next incoming connection.
    ///
    /// Returns as soon as the peer is accepted. The identity handshake runs
    /// later through [`IncomingConnection::handshake`], so a peer that never
    /// presents an identity cannot hold up the listener.
    async fn accept(&self) -> io::Result<Self::Incoming>;
}

/// An accepted connection that has not yet presented its identity.
#[async_trait]
pub trait IncomingConnection: Send + 'static {
    /// Connection produced by a completed handshake
    type Connection: TransportConnection;

    /// Read the peer's identity.
    async fn handshake(self) -> io::Result<Self::Connection>;
}

/// Client side of a transport: opens connections presenting an identity.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Connection type produced by this connector
    type Connection: TransportConnection;

    /// Open a connection, presenting `identity` to the server.
    async fn connect(&self, identity: ConnectionId) -> io::Result<Self::Connection>;
}

/// An established connection, before it is split into halves.
pub trait TransportConnection: Send + 'static {
    /// Sending half
    type Sender: MessageSender;

    /// Receiving half
    type Receiver: MessageReceiver;

    /// Identity presented by the client
    fn identity(&self) -> ConnectionId;

    /// Split into independently owned halves
    fn into_split(self) -> (Self::Sender, Self::Receiver);
}

/// Sending half of a connection.
#[async_trait]
pub trait MessageSender: Send + 'static {
    /// Send one message
    async fn send(&mut self, message: Bytes) -> io::Result<()>;

    /// Flush and close the sending direction
    async fn close(&mut self) -> io::Result<()>;
}

/// Receiving half of a connection.
#[async_trait]
pub trait MessageReceiver: Send + 'static {
    /// Receive the next message.
    ///
    /// `Ok(None)` means the peer closed the connection cleanly.
    async fn recv(&mut self) -> io::Result<Option<Bytes>>;
}
