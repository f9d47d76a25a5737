//! Reconnecting channel.
//!
//! Owns the lifecycle of successive [`HubConnection`]s behind one logical
//! identity. A supervisor task drives the state machine:
//!
//! ```text
//!             connect ok + probe ok
//! Connecting ─────────────────────────> Connected
//!   ▲  │ failure: retry += 1,                │ transport lost
//!   │  │ sleep(policy.delay(retry))          ▼
//!   │  └──────> Connecting            Disconnected ── callbacks (in order)
//!   └─────────────────────────────────────────┘
//!
//! dispose() from any state ──> Disposed
//! ```
//!
//! Identity is chosen before every attempt: reused for the channel's
//! lifetime by default, or minted fresh per attempt. Each successful
//! connection bumps the generation counter; the retry counter resets to
//! zero once a connection passes its probe.

use std::{
    fmt,
    panic::AssertUnwindSafe,
    sync::{
        Arc, Weak,
        atomic::{AtomicU32, AtomicU64, Ordering},
    },
};

use parking_lot::{Mutex, RwLock};
use serde::{Serialize, de::DeserializeOwned};
use streamhub_core::{CallError, Connector, DisconnectReason, Environment};
use streamhub_proto::{CborSerializer, ConnectionId, MethodId, Serializer};
use tokio::{sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    connection::{HubConnection, Receivers},
    error::ChannelError,
    options::{ChannelOptions, IdentityMode},
};

/// Channel lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelState {
    /// An attempt is in progress or scheduled
    Connecting,
    /// A probed connection is live
    Connected,
    /// The connection was lost; a new attempt follows immediately
    Disconnected,
    /// Terminal
    Disposed,
}

/// Passed to disconnect callbacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectInfo {
    /// Identity of the lost connection
    pub identity: ConnectionId,
    /// Generation of the lost connection
    pub generation: u64,
    /// Why it ended
    pub reason: DisconnectReason,
}

type DisconnectCallback = Arc<dyn Fn(&DisconnectInfo) + Send + Sync>;

struct ChannelInner<S> {
    state: watch::Sender<ChannelState>,
    current: RwLock<Option<HubConnection<S>>>,
    identity: RwLock<ConnectionId>,
    retry_count: AtomicU32,
    generation: AtomicU64,
    callbacks: Mutex<Vec<(u64, DisconnectCallback)>>,
    next_callback: AtomicU64,
    shutdown: CancellationToken,
}

impl<S> ChannelInner<S> {
    fn publish(&self, state: ChannelState) {
        self.state.send_replace(state);
    }

    fn run_disconnect_callbacks(&self, info: &DisconnectInfo) {
        let callbacks: Vec<DisconnectCallback> =
            self.callbacks.lock().iter().map(|(_, callback)| Arc::clone(callback)).collect();

        for callback in callbacks {
            if std::panic::catch_unwind(AssertUnwindSafe(|| callback(info))).is_err() {
                tracing::error!(identity = %info.identity, generation = info.generation, "disconnect callback panicked");
            }
        }
    }
}

struct Owner<S> {
    inner: Arc<ChannelInner<S>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl<S> Drop for Owner<S> {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

/// A hub connection that survives transport failures.
///
/// Cheap to clone. Dropping the last clone disposes the channel.
pub struct ReconnectingChannel<S = CborSerializer> {
    owner: Arc<Owner<S>>,
}

impl<S> Clone for ReconnectingChannel<S> {
    fn clone(&self) -> Self {
        Self { owner: Arc::clone(&self.owner) }
    }
}

impl<S> fmt::Debug for ReconnectingChannel<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = &self.owner.inner;
        f.debug_struct("ReconnectingChannel")
            .field("state", &*inner.state.borrow())
            .field("identity", &*inner.identity.read())
            .field("retry_count", &inner.retry_count.load(Ordering::Relaxed))
            .field("generation", &inner.generation.load(Ordering::Relaxed))
            .finish()
    }
}

impl ReconnectingChannel<CborSerializer> {
    /// Start connecting with CBOR payloads.
    pub fn start<C, E>(connector: C, env: E, receivers: Receivers, options: ChannelOptions) -> Self
    where
        C: Connector,
        E: Environment,
    {
        Self::start_with(connector, env, receivers, Arc::new(CborSerializer), options)
    }
}

impl<S: Serializer> ReconnectingChannel<S> {
    /// Start the supervisor. The first attempt begins immediately.
    pub fn start_with<C, E>(
        connector: C,
        env: E,
        receivers: Receivers<S>,
        serializer: Arc<S>,
        options: ChannelOptions,
    ) -> Self
    where
        C: Connector,
        E: Environment,
    {
        let mint = identity_source(&env, &options);
        let (state, _) = watch::channel(ChannelState::Connecting);
        let inner = Arc::new(ChannelInner {
            state,
            current: RwLock::new(None),
            identity: RwLock::new(mint()),
            retry_count: AtomicU32::new(0),
            generation: AtomicU64::new(0),
            callbacks: Mutex::new(Vec::new()),
            next_callback: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        });

        let supervisor = Supervisor { inner: Arc::clone(&inner), connector, env, receivers, serializer, options, mint };
        let task = tokio::spawn(supervisor.run());

        Self { owner: Arc::new(Owner { inner, supervisor: Mutex::new(Some(task)) }) }
    }

    /// Typed call over the current connection.
    ///
    /// Fails with [`CallError::Disconnected`] while no connection is live.
    pub async fn invoke<Req, Resp>(&self, method_id: MethodId, args: &Req) -> Result<Resp, CallError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        self.current().ok_or(CallError::Disconnected)?.invoke(method_id, args).await
    }

    /// Fire-and-forget call over the current connection.
    pub async fn invoke_fire_and_forget<Req>(&self, method_id: MethodId, args: &Req) -> Result<(), CallError>
    where
        Req: Serialize + ?Sized,
    {
        self.current().ok_or(CallError::Disconnected)?.invoke_fire_and_forget(method_id, args).await
    }

    /// Build a typed client bound to this channel
    pub fn create_client<T: HubClient<S>>(&self) -> T {
        T::from_channel(self.clone())
    }
}

impl<S> ReconnectingChannel<S> {
    /// Wait until a connection is live and return it.
    ///
    /// Fails once the channel is disposed.
    pub async fn wait_connected(&self) -> Result<HubConnection<S>, ChannelError> {
        let mut state = self.owner.inner.state.subscribe();
        loop {
            match *state.borrow_and_update() {
                ChannelState::Connected => {
                    if let Some(connection) = self.current() {
                        return Ok(connection);
                    }
                },
                ChannelState::Disposed => return Err(ChannelError::Disposed),
                ChannelState::Connecting | ChannelState::Disconnected => {},
            }
            if state.changed().await.is_err() {
                return Err(ChannelError::Disposed);
            }
        }
    }

    /// Live connection, if any
    pub fn current(&self) -> Option<HubConnection<S>> {
        self.owner.inner.current.read().clone()
    }

    /// Current state
    pub fn state(&self) -> ChannelState {
        *self.owner.inner.state.borrow()
    }

    /// Observe state changes
    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.owner.inner.state.subscribe()
    }

    /// Identity presented by the current (or next) attempt
    pub fn identity(&self) -> ConnectionId {
        *self.owner.inner.identity.read()
    }

    /// Consecutive failed attempts since the last successful connection
    pub fn retry_count(&self) -> u32 {
        self.owner.inner.retry_count.load(Ordering::SeqCst)
    }

    /// Number of successful connections so far
    pub fn generation(&self) -> u64 {
        self.owner.inner.generation.load(Ordering::SeqCst)
    }

    /// Register `callback` for every lost connection.
    ///
    /// Callbacks run on the supervisor in registration order. A panicking
    /// callback is logged and does not stop the others.
    pub fn on_disconnected(
        &self,
        callback: impl Fn(&DisconnectInfo) + Send + Sync + 'static,
    ) -> DisconnectRegistration
    where
        S: Send + Sync + 'static,
    {
        let inner = &self.owner.inner;
        let id = inner.next_callback.fetch_add(1, Ordering::Relaxed);
        inner.callbacks.lock().push((id, Arc::new(callback)));

        let weak: Weak<ChannelInner<S>> = Arc::downgrade(inner);
        DisconnectRegistration {
            id,
            remove: Box::new(move |id| {
                weak.upgrade().is_some_and(|inner| {
                    let mut callbacks = inner.callbacks.lock();
                    let before = callbacks.len();
                    callbacks.retain(|(registered, _)| *registered != id);
                    callbacks.len() != before
                })
            }),
        }
    }

    /// Stop reconnecting, close the live connection and wait for the
    /// supervisor to finish. Idempotent.
    pub async fn dispose(&self) {
        self.owner.inner.shutdown.cancel();
        let task = self.owner.supervisor.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::debug!(error = %e, "channel supervisor ended abnormally");
            }
        }
    }
}

/// Handle to a registered disconnect callback.
///
/// Dropping it keeps the callback registered.
pub struct DisconnectRegistration {
    id: u64,
    remove: Box<dyn Fn(u64) -> bool + Send + Sync>,
}

impl DisconnectRegistration {
    /// Remove the callback. Returns `false` if it was already gone.
    pub fn unregister(self) -> bool {
        (self.remove)(self.id)
    }
}

impl fmt::Debug for DisconnectRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DisconnectRegistration").field("id", &self.id).finish_non_exhaustive()
    }
}

/// A typed client built on a [`ReconnectingChannel`].
///
/// Implementations wrap the channel and expose one method per hub method,
/// each forwarding to [`ReconnectingChannel::invoke`].
pub trait HubClient<S = CborSerializer>: Sized {
    /// Bind to `channel`
    fn from_channel(channel: ReconnectingChannel<S>) -> Self;
}

type IdentitySource = Arc<dyn Fn() -> ConnectionId + Send + Sync>;

fn identity_source<E: Environment>(env: &E, options: &ChannelOptions) -> IdentitySource {
    match &options.identity_factory {
        Some(factory) => Arc::clone(factory),
        None => {
            let env = env.clone();
            Arc::new(move || ConnectionId::from_random_bytes(env.random_id_bytes()))
        },
    }
}

struct Supervisor<S, C, E> {
    inner: Arc<ChannelInner<S>>,
    connector: C,
    env: E,
    receivers: Receivers<S>,
    serializer: Arc<S>,
    options: ChannelOptions,
    mint: IdentitySource,
}

impl<S, C, E> Supervisor<S, C, E>
where
    S: Serializer,
    C: Connector,
    E: Environment,
{
    async fn run(self) {
        let inner = Arc::clone(&self.inner);
        let mut first_attempt = true;

        loop {
            inner.publish(ChannelState::Connecting);
            let identity = self.next_identity(first_attempt);
            first_attempt = false;

            let attempt = tokio::select! {
                () = inner.shutdown.cancelled() => break,
                attempt = self.establish(identity) => attempt,
            };

            let connection = match attempt {
                Ok(connection) => connection,
                Err(e) => {
                    let retry = inner.retry_count.fetch_add(1, Ordering::SeqCst) + 1;
                    let delay = self.options.retry.delay(retry);
                    tracing::warn!(%identity, retry, ?delay, error = %e, "connection attempt failed");
                    tokio::select! {
                        () = inner.shutdown.cancelled() => break,
                        () = self.env.sleep(delay) => {},
                    }
                    continue;
                },
            };

            inner.retry_count.store(0, Ordering::SeqCst);
            let generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
            *inner.current.write() = Some(connection.clone());
            inner.publish(ChannelState::Connected);
            tracing::info!(%identity, generation, "channel connected");

            let reason = tokio::select! {
                () = inner.shutdown.cancelled() => {
                    connection.close();
                    connection.closed().await;
                    inner.current.write().take();
                    break;
                },
                reason = connection.closed() => reason,
            };

            inner.current.write().take();
            inner.publish(ChannelState::Disconnected);
            tracing::info!(%identity, generation, %reason, "channel disconnected");
            inner.run_disconnect_callbacks(&DisconnectInfo { identity, generation, reason });
        }

        inner.publish(ChannelState::Disposed);
        tracing::debug!("channel disposed");
    }

    fn next_identity(&self, first_attempt: bool) -> ConnectionId {
        if self.options.identity == IdentityMode::PerAttempt && !first_attempt {
            let identity = (self.mint)();
            *self.inner.identity.write() = identity;
            identity
        } else {
            *self.inner.identity.read()
        }
    }

    async fn establish(&self, identity: ConnectionId) -> Result<HubConnection<S>, ChannelError> {
        let transport = self.connector.connect(identity).await.map_err(ChannelError::Connect)?;
        let connection = HubConnection::start_with(
            transport,
            self.env.clone(),
            Arc::clone(&self.receivers),
            Arc::clone(&self.serializer),
            self.options.client.clone(),
        );
        // Closes the connection if the probe fails or the attempt is abandoned
        let mut guard = CloseOnDrop(Some(connection.clone()));

        let latency = connection.probe(self.options.probe_timeout).await.map_err(ChannelError::Probe)?;
        tracing::debug!(%identity, ?latency, "connection probe answered");
        guard.0 = None;
        Ok(connection)
    }
}

struct CloseOnDrop<S>(Option<HubConnection<S>>);

impl<S> Drop for CloseOnDrop<S> {
    fn drop(&mut self) {
        if let Some(connection) = self.0.take() {
            connection.close();
        }
    }
}
