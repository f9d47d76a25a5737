//! Turmoil TCP transport.
//!
//! The production framed adapter running over turmoil's simulated TCP, so
//! hub servers and clients can be exercised under latency, loss and
//! partitions.

use std::io;

use async_trait::async_trait;
use streamhub_core::{
    Connector, Transport,
    framed::{FramedConfig, FramedConnection, FramedIncoming},
};
use streamhub_proto::ConnectionId;
use turmoil::net::{TcpListener, TcpStream};

/// Simulated TCP listener producing framed connections.
pub struct SimTransport {
    listener: TcpListener,
    config: FramedConfig,
}

impl SimTransport {
    /// Bind within the current turmoil host
    pub async fn bind(addr: &str) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, config: FramedConfig::default() })
    }
}

#[async_trait]
impl Transport for SimTransport {
    type Incoming = FramedIncoming<TcpStream>;

    async fn accept(&self) -> io::Result<Self::Incoming> {
        let (stream, peer) = self.listener.accept().await?;
        tracing::debug!(%peer, "accepted simulated connection");
        Ok(FramedIncoming::new(stream, self.config.clone()))
    }
}

/// Simulated TCP connector.
#[derive(Debug, Clone)]
pub struct SimConnector {
    addr: String,
    config: FramedConfig,
}

impl SimConnector {
    /// Connector for `host:port` inside the simulation
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into(), config: FramedConfig::default() }
    }
}

#[async_trait]
impl Connector for SimConnector {
    type Connection = FramedConnection<TcpStream>;

    async fn connect(&self, identity: ConnectionId) -> io::Result<Self::Connection> {
        let stream = TcpStream::connect(self.addr.as_str()).await?;
        FramedConnection::connect(stream, identity, &self.config).await
    }
}
