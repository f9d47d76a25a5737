//! In-process message network with fault injection.
//!
//! Connections are pairs of unbounded channels, so message order and
//! delivery are exact unless a fault is injected:
//!
//! - [`MemoryNetwork::refuse_connections`]: new connects fail
//! - [`MemoryNetwork::sever_all`] / [`MemoryNetwork::sever`]: live links break
//!   abruptly; both ends see `ConnectionReset`
//! - [`MemoryNetwork::mute_clients`]: client-to-server messages are silently
//!   discarded while the link stays up (an unresponsive peer)
//! - [`MemoryNetwork::shutdown`]: the listener stops accepting

use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use streamhub_core::{
    Connector, IncomingConnection, MessageReceiver, MessageSender, Transport, TransportConnection,
};
use streamhub_proto::ConnectionId;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Default)]
struct NetworkState {
    incoming: Mutex<Option<mpsc::UnboundedSender<MemoryConnection>>>,
    links: Mutex<Vec<(ConnectionId, CancellationToken)>>,
    refuse: AtomicBool,
    mute_clients: AtomicBool,
    attempts: AtomicUsize,
    established: AtomicUsize,
}

/// An in-process network with one listener.
#[derive(Debug, Clone)]
pub struct MemoryNetwork {
    state: Arc<NetworkState>,
}

impl MemoryNetwork {
    /// Create the network and its listener
    pub fn new() -> (Self, MemoryListener) {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = Arc::new(NetworkState::default());
        *state.incoming.lock() = Some(tx);
        (Self { state }, MemoryListener { incoming: tokio::sync::Mutex::new(rx) })
    }

    /// Connector for clients of this network
    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector { state: Arc::clone(&self.state) }
    }

    /// Fail every new connect with `ConnectionRefused` while `refuse` is set
    pub fn refuse_connections(&self, refuse: bool) {
        self.state.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Break every live link. Returns how many were severed.
    pub fn sever_all(&self) -> usize {
        let links = std::mem::take(&mut *self.state.links.lock());
        for (_, severed) in &links {
            severed.cancel();
        }
        links.len()
    }

    /// Break the live links of `identity`
    pub fn sever(&self, identity: ConnectionId) -> usize {
        let mut links = self.state.links.lock();
        let before = links.len();
        links.retain(|(id, severed)| {
            if *id == identity {
                severed.cancel();
                false
            } else {
                true
            }
        });
        before - links.len()
    }

    /// Discard client-to-server messages while `mute` is set
    pub fn mute_clients(&self, mute: bool) {
        self.state.mute_clients.store(mute, Ordering::SeqCst);
    }

    /// Stop accepting; the listener reports `ConnectionAborted`
    pub fn shutdown(&self) {
        self.state.incoming.lock().take();
    }

    /// Connect calls made so far, including refused ones
    pub fn connect_attempts(&self) -> usize {
        self.state.attempts.load(Ordering::SeqCst)
    }

    /// Connections established so far
    pub fn connections_established(&self) -> usize {
        self.state.established.load(Ordering::SeqCst)
    }

    /// Links currently up
    pub fn live_links(&self) -> usize {
        self.state.links.lock().iter().filter(|(_, severed)| !severed.is_cancelled()).count()
    }
}

/// Server side of a [`MemoryNetwork`].
#[derive(Debug)]
pub struct MemoryListener {
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<MemoryConnection>>,
}

#[async_trait]
impl Transport for MemoryListener {
    type Incoming = MemoryConnection;

    async fn accept(&self) -> io::Result<MemoryConnection> {
        self.incoming.lock().await.recv().await.ok_or_else(|| {
            io::Error::new(io::ErrorKind::ConnectionAborted, "memory network shut down")
        })
    }
}

/// Client side of a [`MemoryNetwork`].
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    state: Arc<NetworkState>,
}

#[async_trait]
impl Connector for MemoryConnector {
    type Connection = MemoryConnection;

    async fn connect(&self, identity: ConnectionId) -> io::Result<MemoryConnection> {
        self.state.attempts.fetch_add(1, Ordering::SeqCst);
        if self.state.refuse.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused"));
        }

        let (to_server, from_client) = mpsc::unbounded_channel();
        let (to_client, from_server) = mpsc::unbounded_channel();
        let severed = CancellationToken::new();

        let server_side = MemoryConnection {
            identity,
            tx: to_client,
            rx: from_client,
            severed: severed.clone(),
            muted: None,
        };
        let client_side = MemoryConnection {
            identity,
            tx: to_server,
            rx: from_server,
            severed: severed.clone(),
            muted: Some(Arc::clone(&self.state)),
        };

        let incoming = self.state.incoming.lock().clone();
        let Some(incoming) = incoming else {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "no listener"));
        };
        incoming
            .send(server_side)
            .map_err(|_| io::Error::new(io::ErrorKind::ConnectionRefused, "listener dropped"))?;

        self.state.links.lock().push((identity, severed));
        self.state.established.fetch_add(1, Ordering::SeqCst);
        tracing::trace!(%identity, "memory link established");
        Ok(client_side)
    }
}

/// One end of an in-memory link.
#[derive(Debug)]
pub struct MemoryConnection {
    identity: ConnectionId,
    tx: mpsc::UnboundedSender<Bytes>,
    rx: mpsc::UnboundedReceiver<Bytes>,
    severed: CancellationToken,
    muted: Option<Arc<NetworkState>>,
}

impl TransportConnection for MemoryConnection {
    type Sender = MemorySender;
    type Receiver = MemoryReceiver;

    fn identity(&self) -> ConnectionId {
        self.identity
    }

    fn into_split(self) -> (MemorySender, MemoryReceiver) {
        (
            MemorySender { tx: Some(self.tx), severed: self.severed.clone(), muted: self.muted },
            MemoryReceiver { rx: self.rx, severed: self.severed },
        )
    }
}

// The identity travels with the link, so there is nothing to read.
#[async_trait]
impl IncomingConnection for MemoryConnection {
    type Connection = Self;

    async fn handshake(self) -> io::Result<Self> {
        Ok(self)
    }
}

/// Sending half of a [`MemoryConnection`]
#[derive(Debug)]
pub struct MemorySender {
    tx: Option<mpsc::UnboundedSender<Bytes>>,
    severed: CancellationToken,
    muted: Option<Arc<NetworkState>>,
}

#[async_trait]
impl MessageSender for MemorySender {
    async fn send(&mut self, message: Bytes) -> io::Result<()> {
        if self.severed.is_cancelled() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "link severed"));
        }
        if self.muted.as_ref().is_some_and(|state| state.mute_clients.load(Ordering::SeqCst)) {
            return Ok(());
        }
        let Some(tx) = &self.tx else {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "sender closed"));
        };
        tx.send(message).map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer gone"))
    }

    async fn close(&mut self) -> io::Result<()> {
        self.tx = None;
        Ok(())
    }
}

/// Receiving half of a [`MemoryConnection`]
#[derive(Debug)]
pub struct MemoryReceiver {
    rx: mpsc::UnboundedReceiver<Bytes>,
    severed: CancellationToken,
}

#[async_trait]
impl MessageReceiver for MemoryReceiver {
    async fn recv(&mut self) -> io::Result<Option<Bytes>> {
        tokio::select! {
            biased;
            () = self.severed.cancelled() => {
                Err(io::Error::new(io::ErrorKind::ConnectionReset, "link severed"))
            },
            message = self.rx.recv() => Ok(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(byte: u8) -> ConnectionId {
        ConnectionId::from_random_bytes([byte; 16])
    }

    #[tokio::test]
    async fn messages_flow_both_ways_in_order() {
        let (network, listener) = MemoryNetwork::new();
        let client = network.connector().connect(id(1)).await.unwrap();
        let server = listener.accept().await.unwrap();
        assert_eq!(server.identity(), id(1));

        let (mut client_tx, mut client_rx) = client.into_split();
        let (mut server_tx, mut server_rx) = server.into_split();

        for i in 0..3u8 {
            client_tx.send(Bytes::from(vec![i])).await.unwrap();
        }
        server_tx.send(Bytes::from_static(b"pong")).await.unwrap();

        for i in 0..3u8 {
            assert_eq!(server_rx.recv().await.unwrap().unwrap().as_ref(), &[i]);
        }
        assert_eq!(client_rx.recv().await.unwrap().unwrap().as_ref(), b"pong");

        client_tx.close().await.unwrap();
        assert_eq!(server_rx.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn severed_links_fail_both_ends() {
        let (network, listener) = MemoryNetwork::new();
        let client = network.connector().connect(id(2)).await.unwrap();
        let server = listener.accept().await.unwrap();
        let (mut client_tx, _client_rx) = client.into_split();
        let (_server_tx, mut server_rx) = server.into_split();

        assert_eq!(network.sever(id(2)), 1);
        assert_eq!(server_rx.recv().await.unwrap_err().kind(), io::ErrorKind::ConnectionReset);
        assert_eq!(client_tx.send(Bytes::new()).await.unwrap_err().kind(), io::ErrorKind::BrokenPipe);
        assert_eq!(network.live_links(), 0);
    }

    #[tokio::test]
    async fn refused_and_muted() {
        let (network, listener) = MemoryNetwork::new();
        network.refuse_connections(true);
        let refused = network.connector().connect(id(3)).await.unwrap_err();
        assert_eq!(refused.kind(), io::ErrorKind::ConnectionRefused);
        network.refuse_connections(false);

        let client = network.connector().connect(id(3)).await.unwrap();
        let server = listener.accept().await.unwrap();
        let (mut client_tx, _client_rx) = client.into_split();
        let (_server_tx, mut server_rx) = server.into_split();

        network.mute_clients(true);
        client_tx.send(Bytes::from_static(b"lost")).await.unwrap();
        network.mute_clients(false);
        client_tx.send(Bytes::from_static(b"kept")).await.unwrap();
        assert_eq!(server_rx.recv().await.unwrap().unwrap().as_ref(), b"kept");

        assert_eq!(network.connect_attempts(), 2);
        assert_eq!(network.connections_established(), 1);
    }

    #[tokio::test]
    async fn shutdown_stops_the_listener() {
        let (network, listener) = MemoryNetwork::new();
        network.shutdown();
        assert_eq!(listener.accept().await.unwrap_err().kind(), io::ErrorKind::ConnectionAborted);
        assert!(network.connector().connect(id(4)).await.is_err());
    }
}
