//! Length-delimited message framing over byte streams.
//!
//! Each message is a 4-byte big-endian length followed by the message bytes
//! (`tokio_util`'s `LengthDelimitedCodec`). The first message a client sends
//! is its 16-byte [`ConnectionId`]; the server reads it before handing the
//! connection to the hub. Works over anything that is `AsyncRead +
//! AsyncWrite`: TCP in production, turmoil TCP in simulation.

use std::{io, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use streamhub_proto::ConnectionId;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpListener, TcpStream, ToSocketAddrs},
};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::transport::{
    Connector, IncomingConnection, MessageReceiver, MessageSender, Transport, TransportConnection,
};

/// Framing limits.
#[derive(Debug, Clone)]
pub struct FramedConfig {
    /// Largest accepted message
    pub max_frame_length: usize,
    /// Time allowed for the client to present its identity
    pub handshake_timeout: Duration,
}

impl Default for FramedConfig {
    fn default() -> Self {
        Self { max_frame_length: 16 * 1024 * 1024, handshake_timeout: Duration::from_secs(10) }
    }
}

impl FramedConfig {
    fn codec(&self) -> LengthDelimitedCodec {
        LengthDelimitedCodec::builder().max_frame_length(self.max_frame_length).new_codec()
    }
}

/// A framed connection whose identity handshake has completed.
pub struct FramedConnection<S> {
    identity: ConnectionId,
    framed: Framed<S, LengthDelimitedCodec>,
}

impl<S> FramedConnection<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    /// Client side: present `identity` on a freshly opened stream.
    pub async fn connect(stream: S, identity: ConnectionId, config: &FramedConfig) -> io::Result<Self> {
        let mut framed = Framed::new(stream, config.codec());
        framed.send(Bytes::copy_from_slice(identity.as_bytes())).await?;
        Ok(Self { identity, framed })
    }

    /// Server side: read the client's identity from a freshly accepted stream.
    pub async fn accept(stream: S, config: &FramedConfig) -> io::Result<Self> {
        let mut framed = Framed::new(stream, config.codec());
        let first = tokio::time::timeout(config.handshake_timeout, framed.next())
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "identity handshake timed out"))?;

        let preamble = match first {
            Some(result) => result?,
            None => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed before identity handshake",
                ));
            },
        };

        let bytes: [u8; ConnectionId::SIZE] = preamble.as_ref().try_into().map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("identity preamble must be {} bytes, got {}", ConnectionId::SIZE, preamble.len()),
            )
        })?;

        Ok(Self { identity: ConnectionId::from_bytes(bytes), framed })
    }
}

impl<S> TransportConnection for FramedConnection<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    type Sender = FramedSender<S>;
    type Receiver = FramedReceiver<S>;

    fn identity(&self) -> ConnectionId {
        self.identity
    }

    fn into_split(self) -> (Self::Sender, Self::Receiver) {
        let (sink, stream) = self.framed.split();
        (FramedSender { sink }, FramedReceiver { stream })
    }
}

/// A freshly accepted stream whose identity has not been read yet.
pub struct FramedIncoming<S> {
    stream: S,
    config: FramedConfig,
}

impl<S> FramedIncoming<S> {
    /// Wrap an accepted stream
    pub fn new(stream: S, config: FramedConfig) -> Self {
        Self { stream, config }
    }
}

#[async_trait]
impl<S> IncomingConnection for FramedIncoming<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    type Connection = FramedConnection<S>;

    async fn handshake(self) -> io::Result<Self::Connection> {
        FramedConnection::accept(self.stream, &self.config).await
    }
}

/// Sending half of a [`FramedConnection`]
pub struct FramedSender<S> {
    sink: SplitSink<Framed<S, LengthDelimitedCodec>, Bytes>,
}

#[async_trait]
impl<S> MessageSender for FramedSender<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    async fn send(&mut self, message: Bytes) -> io::Result<()> {
        self.sink.send(message).await
    }

    async fn close(&mut self) -> io::Result<()> {
        self.sink.close().await
    }
}

/// Receiving half of a [`FramedConnection`]
pub struct FramedReceiver<S> {
    stream: SplitStream<Framed<S, LengthDelimitedCodec>>,
}

#[async_trait]
impl<S> MessageReceiver for FramedReceiver<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    async fn recv(&mut self) -> io::Result<Option<Bytes>> {
        match self.stream.next().await {
            Some(Ok(message)) => Ok(Some(message.freeze())),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }
}

/// TCP listener producing framed connections.
pub struct TcpTransport {
    listener: TcpListener,
    config: FramedConfig,
}

impl TcpTransport {
    /// Bind to `addr`
    pub async fn bind(addr: impl ToSocketAddrs, config: FramedConfig) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, config })
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }
}

#[async_trait]
impl Transport for TcpTransport {
    type Incoming = FramedIncoming<TcpStream>;

    async fn accept(&self) -> io::Result<Self::Incoming> {
        let (stream, peer) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        tracing::debug!(%peer, "accepted tcp connection");
        Ok(FramedIncoming::new(stream, self.config.clone()))
    }
}

/// TCP connector producing framed connections.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
    config: FramedConfig,
}

impl TcpConnector {
    /// Connector for `addr` (`host:port`)
    pub fn new(addr: impl Into<String>, config: FramedConfig) -> Self {
        Self { addr: addr.into(), config }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    type Connection = FramedConnection<TcpStream>;

    async fn connect(&self, identity: ConnectionId) -> io::Result<Self::Connection> {
        let stream = TcpStream::connect(self.addr.as_str()).await?;
        stream.set_nodelay(true)?;
        FramedConnection::connect(stream, identity, &self.config).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn identity_handshake_over_duplex() {
        let (client_io, server_io) = tokio::io::duplex(1024);
        let identity = ConnectionId::from_random_bytes([9; 16]);
        let config = FramedConfig::default();

        let client = FramedConnection::connect(client_io, identity, &config).await.unwrap();
        let server = FramedConnection::accept(server_io, &config).await.unwrap();
        assert_eq!(server.identity(), identity);

        let (mut client_tx, _client_rx) = client.into_split();
        let (_server_tx, mut server_rx) = server.into_split();
        client_tx.send(Bytes::from_static(b"\x92\x01\xc0")).await.unwrap();
        let received = server_rx.recv().await.unwrap().unwrap();
        assert_eq!(received.as_ref(), b"\x92\x01\xc0");
    }

    #[tokio::test]
    async fn accept_does_not_wait_for_the_identity() {
        let config = FramedConfig { handshake_timeout: Duration::from_secs(30), ..FramedConfig::default() };
        let transport = TcpTransport::bind("127.0.0.1:0", config.clone()).await.unwrap();
        let addr = transport.local_addr().unwrap();

        let _silent = TcpStream::connect(addr).await.unwrap();
        let silent = tokio::time::timeout(Duration::from_secs(5), transport.accept()).await.unwrap().unwrap();

        let identity = ConnectionId::from_random_bytes([4; 16]);
        let client = TcpConnector::new(addr.to_string(), config);
        let _client = client.connect(identity).await.unwrap();
        let incoming = tokio::time::timeout(Duration::from_secs(5), transport.accept()).await.unwrap().unwrap();
        let connection = tokio::time::timeout(Duration::from_secs(5), incoming.handshake()).await.unwrap().unwrap();
        assert_eq!(connection.identity(), identity);
        drop(silent);
    }

    #[tokio::test]
    async fn short_preamble_is_rejected() {
        let (client_io, server_io) = tokio::io::duplex(1024);
        let mut framed = Framed::new(client_io, LengthDelimitedCodec::new());
        framed.send(Bytes::from_static(b"short")).await.unwrap();

        let err = FramedConnection::accept(server_io, &FramedConfig::default()).await.err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn closed_stream_reports_clean_end() {
        let (client_io, server_io) = tokio::io::duplex(1024);
        let identity = ConnectionId::from_random_bytes([1; 16]);
        let config = FramedConfig::default();

        let client = FramedConnection::connect(client_io, identity, &config).await.unwrap();
        let server = FramedConnection::accept(server_io, &config).await.unwrap();
        let (mut client_tx, client_rx) = client.into_split();
        client_tx.close().await.unwrap();
        drop(client_tx);
        drop(client_rx);

        let (_tx, mut rx) = server.into_split();
        assert!(rx.recv().await.unwrap().is_none());
    }
}
