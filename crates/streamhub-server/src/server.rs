//! Hub server: accept loop and connection table.

use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use dashmap::DashMap;
use streamhub_core::{
    DisconnectReason, Environment, GroupRegistry, HeartbeatConfig, IncomingConnection, MethodTable,
    PayloadPool, Transport, TransportConnection,
};
use streamhub_proto::{CborSerializer, ConnectionId, Serializer};
use tokio_util::sync::CancellationToken;

use crate::{
    config::ServerConfig,
    connection,
    context::HubContext,
    error::ServerError,
    lifecycle::{HeartbeatMetadataProvider, HubLifecycle, NoLifecycle},
};

/// Pause after an accept failure that is not specific to one client
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

pub(crate) struct HubShared<S> {
    pub(crate) methods: MethodTable<HubContext<S>>,
    pub(crate) config: ServerConfig,
    pub(crate) groups: Arc<GroupRegistry>,
    pub(crate) pool: Arc<PayloadPool>,
    pub(crate) serializer: Arc<S>,
    pub(crate) lifecycle: Arc<dyn HubLifecycle<S>>,
    pub(crate) metadata: Option<Arc<dyn HeartbeatMetadataProvider>>,
    connections: DashMap<ConnectionId, LiveConnection>,
    next_serial: AtomicU64,
}

struct LiveConnection {
    serial: u64,
    shutdown: CancellationToken,
    finished: CancellationToken,
}

/// A hub: one method table served to any number of connections.
///
/// Cheap to clone; clones share connections, groups and the payload pool.
pub struct HubServer<S = CborSerializer> {
    shared: Arc<HubShared<S>>,
}

impl<S> Clone for HubServer<S> {
    fn clone(&self) -> Self {
        Self { shared: Arc::clone(&self.shared) }
    }
}

impl<S: Serializer> std::fmt::Debug for HubServer<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubServer")
            .field("methods", &self.shared.methods.len())
            .field("connections", &self.shared.connections.len())
            .field("groups", &self.shared.groups.len())
            .finish_non_exhaustive()
    }
}

impl HubServer<CborSerializer> {
    /// Start configuring a hub that serves `methods` with CBOR payloads
    pub fn builder(methods: MethodTable<HubContext>) -> HubServerBuilder<CborSerializer> {
        HubServerBuilder::new(methods, CborSerializer)
    }
}

impl<S: Serializer> HubServer<S> {
    /// Start configuring a hub with a custom payload serializer
    pub fn builder_with(
        methods: MethodTable<HubContext<S>>,
        serializer: S,
    ) -> HubServerBuilder<S> {
        HubServerBuilder::new(methods, serializer)
    }

    /// Accept connections from `transport` until it fails permanently.
    pub async fn serve<T, E>(&self, transport: T, env: E) -> Result<(), ServerError>
    where
        T: Transport,
        E: Environment,
    {
        self.serve_until(transport, env, CancellationToken::new()).await
    }

    /// Accept connections until `shutdown` is cancelled, then close every
    /// connection and wait for their teardown.
    pub async fn serve_until<T, E>(
        &self,
        transport: T,
        env: E,
        shutdown: CancellationToken,
    ) -> Result<(), ServerError>
    where
        T: Transport,
        E: Environment,
    {
        loop {
            let accepted = tokio::select! {
                () = shutdown.cancelled() => break,
                accepted = transport.accept() => accepted,
            };

            match accepted {
                Ok(incoming) => {
                    let hub = self.clone();
                    let env = env.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        let handshake = tokio::select! {
                            () = shutdown.cancelled() => return,
                            handshake = incoming.handshake() => handshake,
                        };
                        match handshake {
                            Ok(_) if shutdown.is_cancelled() => {},
                            Ok(connection) => {
                                hub.serve_connection(connection, env).await;
                            },
                            Err(e) => tracing::debug!(error = %e, "identity handshake failed"),
                        }
                    });
                },
                Err(e) if is_per_client(&e) => {
                    tracing::debug!(error = %e, "rejected incoming connection");
                },
                Err(e) if e.kind() == io::ErrorKind::ConnectionAborted => {
                    return Err(ServerError::Accept(e));
                },
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    env.sleep(ACCEPT_BACKOFF).await;
                },
            }
        }

        tracing::info!(connections = self.connection_count(), "hub shutting down");
        self.close_all().await;
        Ok(())
    }

    /// Serve one already accepted connection until it ends.
    ///
    /// A connection presenting the identity of a connection that is still
    /// live supersedes it: the old connection is torn down first.
    pub async fn serve_connection<C, E>(&self, connection: C, env: E) -> DisconnectReason
    where
        C: TransportConnection,
        E: Environment,
    {
        let id = connection.identity();
        let serial = self.shared.next_serial.fetch_add(1, Ordering::Relaxed);
        let shutdown = CancellationToken::new();
        let finished = CancellationToken::new();

        let previous = self.shared.connections.insert(
            id,
            LiveConnection { serial, shutdown: shutdown.clone(), finished: finished.clone() },
        );
        if let Some(previous) = previous {
            tracing::info!(connection_id = %id, "identity reconnected, closing stale connection");
            previous.shutdown.cancel();
            previous.finished.cancelled().await;
        }

        let reason = connection::serve(Arc::clone(&self.shared), env, connection, shutdown).await;

        self.shared.connections.remove_if(&id, |_, live| live.serial == serial);
        finished.cancel();
        reason
    }

    /// Close one connection. Returns `false` if it is not connected.
    pub fn disconnect(&self, id: ConnectionId) -> bool {
        match self.shared.connections.get(&id) {
            Some(live) => {
                live.shutdown.cancel();
                true
            },
            None => false,
        }
    }

    /// Close every connection and wait until each has been torn down.
    pub async fn close_all(&self) {
        let live: Vec<CancellationToken> = self
            .shared
            .connections
            .iter()
            .map(|entry| {
                entry.shutdown.cancel();
                entry.finished.clone()
            })
            .collect();
        for finished in live {
            finished.cancelled().await;
        }
    }

    /// Whether `id` is connected
    pub fn is_connected(&self, id: ConnectionId) -> bool {
        self.shared.connections.contains_key(&id)
    }

    /// Number of live connections
    pub fn connection_count(&self) -> usize {
        self.shared.connections.len()
    }

    /// Groups of this hub
    pub fn groups(&self) -> &Arc<GroupRegistry> {
        &self.shared.groups
    }

    /// Payload pool shared by all connections
    pub fn pool(&self) -> &Arc<PayloadPool> {
        &self.shared.pool
    }

    /// Active configuration
    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }
}

/// Accept errors that concern one client rather than the listener
fn is_per_client(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::InvalidData
            | io::ErrorKind::TimedOut
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
    )
}

/// Builder for [`HubServer`].
pub struct HubServerBuilder<S> {
    methods: MethodTable<HubContext<S>>,
    serializer: S,
    config: ServerConfig,
    lifecycle: Arc<dyn HubLifecycle<S>>,
    metadata: Option<Arc<dyn HeartbeatMetadataProvider>>,
}

impl<S: Serializer> HubServerBuilder<S> {
    fn new(methods: MethodTable<HubContext<S>>, serializer: S) -> Self {
        Self {
            methods,
            serializer,
            config: ServerConfig::default(),
            lifecycle: Arc::new(NoLifecycle),
            metadata: None,
        }
    }

    /// Replace the whole configuration
    #[must_use]
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Override heartbeat timing for this hub
    #[must_use]
    pub fn heartbeat(mut self, heartbeat: HeartbeatConfig) -> Self {
        self.config.heartbeat = heartbeat;
        self
    }

    /// Connect/disconnect hooks
    #[must_use]
    pub fn lifecycle(mut self, lifecycle: impl HubLifecycle<S>) -> Self {
        self.lifecycle = Arc::new(lifecycle);
        self
    }

    /// Metadata attached to every server heartbeat
    #[must_use]
    pub fn heartbeat_metadata(mut self, provider: impl HeartbeatMetadataProvider) -> Self {
        self.metadata = Some(Arc::new(provider));
        self
    }

    /// Finish the hub
    pub fn build(self) -> HubServer<S> {
        let pool = Arc::new(PayloadPool::new(self.config.max_retained_payload));
        HubServer {
            shared: Arc::new(HubShared {
                methods: self.methods,
                config: self.config,
                groups: Arc::new(GroupRegistry::new()),
                pool,
                serializer: Arc::new(self.serializer),
                lifecycle: self.lifecycle,
                metadata: self.metadata,
                connections: DashMap::new(),
                next_serial: AtomicU64::new(0),
            }),
        }
    }
}
