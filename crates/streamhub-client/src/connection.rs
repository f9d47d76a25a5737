//! One client-side hub connection.
//!
//! ```text
//! Response / ResponseWithError ─> pending call (by message id)
//! Broadcast ────────────────────> push worker ─> receiver (in arrival order)
//! ClientInvokeRequest ──────────> handler task ─> ClientInvokeResponse[WithError]
//! ServerHeartbeat ──────────────> ServerHeartbeatAck echo + callback
//! ClientHeartbeatAck ───────────> probe waiter or client heartbeat monitor
//! ```
//!
//! Pushes run one at a time on a dedicated worker so they are observed in
//! the order the server sent them, without blocking the receive loop. A
//! receiver may therefore await calls on the same connection.

use std::{
    any::Any,
    fmt,
    panic::AssertUnwindSafe,
    sync::{
        Arc,
        atomic::{AtomicI32, AtomicU32, Ordering},
    },
    time::{Duration, Instant},
};

use bytes::Bytes;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Serialize, de::DeserializeOwned};
use streamhub_core::{
    CallError, DeliveryError, DisconnectReason, Environment, HeartbeatHandle, MessageReceiver,
    MethodEntry, MethodError, MethodTable, Outbox, OutboxError, PayloadPool, PendingCalls,
    PooledPayload, TransportConnection,
};
use streamhub_proto::{CborSerializer, ConnectionId, Direction, Frame, MessageId, MethodId, Serializer};
use tokio::{sync::mpsc, task::JoinSet};
use tokio_util::sync::CancellationToken;

use crate::{context::ClientContext, options::{ClientHeartbeatEvent, ClientOptions, ServerHeartbeatEvent}};

/// Client heartbeat sequences at or above this value are liveness probes.
pub const PROBE_SEQUENCE_BASE: u32 = 0x8000_0000;

/// Methods a client exposes to its hub: push receivers and
/// client-implemented methods share one table.
pub type Receivers<S = CborSerializer> = Arc<MethodTable<ClientContext<S>>>;

struct Clock {
    now: Box<dyn Fn() -> Instant + Send + Sync>,
    wall: Box<dyn Fn() -> i64 + Send + Sync>,
}

impl Clock {
    fn of<E: Environment>(env: &E) -> Self {
        let (a, b) = (env.clone(), env.clone());
        Self { now: Box::new(move || a.now()), wall: Box::new(move || b.wall_clock_millis()) }
    }
}

struct Inner<S> {
    id: ConnectionId,
    outbox: Outbox,
    calls: PendingCalls<MessageId>,
    probes: PendingCalls<u32>,
    next_message_id: AtomicI32,
    next_probe: AtomicU32,
    serializer: Arc<S>,
    clock: Clock,
    call_timeout: Option<Duration>,
    heartbeat: HeartbeatHandle,
    shutdown: CancellationToken,
    finished: CancellationToken,
    reason: Mutex<Option<DisconnectReason>>,
}

/// A live client connection to a hub.
///
/// Cheap to clone. The connection runs until the transport ends, a
/// heartbeat times out, or [`close`](Self::close) is called; outstanding
/// calls are then cancelled.
pub struct HubConnection<S = CborSerializer> {
    inner: Arc<Inner<S>>,
}

impl<S> Clone for HubConnection<S> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<S> fmt::Debug for HubConnection<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HubConnection")
            .field("connection_id", &self.inner.id)
            .field("calls", &self.inner.calls)
            .field("finished", &self.inner.finished.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl HubConnection<CborSerializer> {
    /// Start a connection with CBOR payloads.
    pub fn start<C, E>(connection: C, env: E, receivers: Receivers, options: ClientOptions) -> Self
    where
        C: TransportConnection,
        E: Environment,
    {
        Self::start_with(connection, env, receivers, Arc::new(CborSerializer), options)
    }
}

impl<S: Serializer> HubConnection<S> {
    /// Start a connection over an established transport connection.
    ///
    /// Spawns the writer, the receive loop and, if configured, client
    /// heartbeats. Must be called within a tokio runtime.
    pub fn start_with<C, E>(
        connection: C,
        env: E,
        receivers: Receivers<S>,
        serializer: Arc<S>,
        options: ClientOptions,
    ) -> Self
    where
        C: TransportConnection,
        E: Environment,
    {
        let id = connection.identity();
        let (sender, receiver) = connection.into_split();
        let (outbox, writer) = Outbox::spawn(id, sender, options.outbox_capacity);

        let heartbeat = {
            let env = env.clone();
            let outbox = outbox.clone();
            HeartbeatHandle::spawn(env.clone(), options.heartbeat, move |sequence| {
                let frame = Frame::ClientHeartbeat {
                    sequence,
                    sent_at_ms: env.wall_clock_millis(),
                    extra: Bytes::new(),
                };
                match outbox.try_send_frame(&frame) {
                    Ok(()) | Err(OutboxError::Delivery(DeliveryError::Full(_))) => true,
                    Err(e) => {
                        tracing::debug!(connection_id = %id, sequence, error = %e, "client heartbeat not sent");
                        false
                    },
                }
            })
        };

        let hub = Self {
            inner: Arc::new(Inner {
                id,
                outbox,
                calls: PendingCalls::new(),
                probes: PendingCalls::new(),
                next_message_id: AtomicI32::new(0),
                next_probe: AtomicU32::new(0),
                serializer,
                clock: Clock::of(&env),
                call_timeout: options.call_timeout,
                heartbeat,
                shutdown: CancellationToken::new(),
                finished: CancellationToken::new(),
                reason: Mutex::new(None),
            }),
        };

        let pool = Arc::new(PayloadPool::new(options.max_retained_payload));
        tokio::spawn(run(hub.clone(), env, receiver, writer, receivers, pool, options));
        tracing::debug!(connection_id = %id, "hub connection started");
        hub
    }

    /// Call `method_id` with typed arguments and result.
    pub async fn invoke<Req, Resp>(&self, method_id: MethodId, args: &Req) -> Result<Resp, CallError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let args = Bytes::from(self.inner.serializer.to_vec(args)?);
        let result = self.invoke_raw(method_id, args).await?;
        Ok(self.inner.serializer.deserialize(&result)?)
    }

    /// Call `method_id` with pre-serialized arguments.
    pub async fn invoke_raw(&self, method_id: MethodId, args: Bytes) -> Result<Bytes, CallError> {
        let message_id = self.inner.next_message_id.fetch_add(1, Ordering::Relaxed);
        let call = self.inner.calls.register(message_id)?;
        self.inner
            .outbox
            .send_frame(&Frame::Request { message_id, method_id, args })
            .await
            .map_err(call_error)?;

        match self.inner.call_timeout {
            Some(timeout) => tokio::time::timeout(timeout, call)
                .await
                .map_err(|_| CallError::TimedOut(timeout))?,
            None => call.await,
        }
    }

    /// Call `method_id` without waiting for, or receiving, a result.
    pub async fn invoke_fire_and_forget<Req>(&self, method_id: MethodId, args: &Req) -> Result<(), CallError>
    where
        Req: Serialize + ?Sized,
    {
        let args = Bytes::from(self.inner.serializer.to_vec(args)?);
        self.invoke_fire_and_forget_raw(method_id, args).await
    }

    /// Fire-and-forget call with pre-serialized arguments.
    pub async fn invoke_fire_and_forget_raw(&self, method_id: MethodId, args: Bytes) -> Result<(), CallError> {
        if self.inner.calls.is_closed() {
            return Err(CallError::Disconnected);
        }
        self.inner
            .outbox
            .send_frame(&Frame::RequestFireAndForget { method_id, args })
            .await
            .map_err(call_error)
    }

    /// Round trip one client heartbeat and return its latency.
    ///
    /// Probes use sequences from [`PROBE_SEQUENCE_BASE`] upward, so they
    /// never disturb the client heartbeat watchdog.
    pub async fn probe(&self, timeout: Duration) -> Result<Duration, CallError> {
        let sequence = PROBE_SEQUENCE_BASE
            | (self.inner.next_probe.fetch_add(1, Ordering::Relaxed) & !PROBE_SEQUENCE_BASE);
        let call = self.inner.probes.register(sequence)?;
        let started = (self.inner.clock.now)();

        let frame = Frame::ClientHeartbeat {
            sequence,
            sent_at_ms: (self.inner.clock.wall)(),
            extra: Bytes::new(),
        };
        self.inner.outbox.send_frame(&frame).await.map_err(call_error)?;

        tokio::time::timeout(timeout, call).await.map_err(|_| CallError::TimedOut(timeout))??;
        Ok((self.inner.clock.now)().saturating_duration_since(started))
    }

    /// Serializer used for typed calls
    pub fn serializer(&self) -> &S {
        &self.inner.serializer
    }
}

impl<S> HubConnection<S> {
    /// Identity presented to the server
    pub fn connection_id(&self) -> ConnectionId {
        self.inner.id
    }

    /// Whether the connection is still running
    pub fn is_connected(&self) -> bool {
        !self.inner.finished.is_cancelled() && !self.inner.shutdown.is_cancelled()
    }

    /// Calls awaiting a response
    pub fn outstanding_calls(&self) -> usize {
        self.inner.calls.len()
    }

    /// Latest client heartbeat round trip
    pub fn latency(&self) -> Option<Duration> {
        self.inner.heartbeat.latency()
    }

    /// Start closing; outstanding calls are cancelled.
    pub fn close(&self) {
        self.inner.shutdown.cancel();
    }

    /// Wait until the connection has ended and return why.
    pub async fn closed(&self) -> DisconnectReason {
        self.inner.finished.cancelled().await;
        self.inner.reason.lock().clone().unwrap_or(DisconnectReason::LocalClose)
    }

    /// Why the connection ended, once it has
    pub fn disconnect_reason(&self) -> Option<DisconnectReason> {
        self.inner.reason.lock().clone()
    }
}

fn call_error(e: OutboxError) -> CallError {
    match e {
        OutboxError::Encode(e) => CallError::Protocol(e),
        OutboxError::Delivery(_) => CallError::Disconnected,
    }
}

type Push<S> = (MethodEntry<ClientContext<S>>, PooledPayload);

async fn run<S, E, R>(
    hub: HubConnection<S>,
    env: E,
    mut receiver: R,
    writer: tokio::task::JoinHandle<()>,
    receivers: Receivers<S>,
    pool: Arc<PayloadPool>,
    options: ClientOptions,
) where
    S: Serializer,
    E: Environment,
    R: MessageReceiver,
{
    let inner = Arc::clone(&hub.inner);
    let id = inner.id;
    let (pushes, push_queue) = mpsc::channel(options.push_capacity.max(1));
    tokio::spawn(push_worker(hub.clone(), push_queue));

    let dispatcher = Dispatcher { hub: hub.clone(), receivers, pool, options, pushes };
    let mut tasks = JoinSet::new();

    let reason = loop {
        tokio::select! {
            biased;
            () = inner.shutdown.cancelled() => break DisconnectReason::LocalClose,
            () = inner.heartbeat.timed_out() => break DisconnectReason::HeartbeatTimeout,
            () = inner.outbox.closed() => break DisconnectReason::Transport("send failed".into()),
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                if let Err(e) = joined {
                    tracing::debug!(connection_id = %id, error = %e, "client method task ended abnormally");
                }
            },
            received = receiver.recv() => match received {
                Ok(Some(message)) => match Frame::decode(&message, Direction::ToClient) {
                    Ok(frame) => dispatcher.dispatch(frame, &env, &mut tasks).await,
                    Err(e) => {
                        tracing::warn!(connection_id = %id, error = %e, "malformed frame from server");
                        break DisconnectReason::Protocol(e);
                    },
                },
                Ok(None) => break DisconnectReason::Closed,
                Err(e) => break DisconnectReason::Transport(e.to_string()),
            },
        }
    };

    tracing::info!(connection_id = %id, %reason, "hub connection closing");

    inner.heartbeat.dispose();
    let cancelled = inner.calls.cancel_all() + inner.probes.cancel_all();
    if cancelled > 0 {
        tracing::debug!(connection_id = %id, cancelled, "cancelled outstanding calls");
    }
    drop(dispatcher);
    tasks.abort_all();
    inner.outbox.close();
    if let Err(e) = writer.await {
        tracing::debug!(connection_id = %id, error = %e, "writer task ended abnormally");
    }

    *inner.reason.lock() = Some(reason);
    inner.finished.cancel();
}

async fn push_worker<S: Serializer>(hub: HubConnection<S>, mut queue: mpsc::Receiver<Push<S>>) {
    while let Some((entry, payload)) = queue.recv().await {
        let method_id = entry.id();
        let ctx = ClientContext::new(hub.clone(), method_id);
        let call = async move { entry.invoke(ctx, payload).await };
        match AssertUnwindSafe(call).catch_unwind().await {
            Ok(Ok(_)) => {},
            Ok(Err(e)) => tracing::debug!(%method_id, error = %e, "receiver failed"),
            Err(panic) => {
                tracing::error!(%method_id, panic = panic_message(&*panic), "receiver panicked");
            },
        }
    }
}

struct Dispatcher<S> {
    hub: HubConnection<S>,
    receivers: Receivers<S>,
    pool: Arc<PayloadPool>,
    options: ClientOptions,
    pushes: mpsc::Sender<Push<S>>,
}

impl<S: Serializer> Dispatcher<S> {
    async fn dispatch<E: Environment>(&self, frame: Frame, env: &E, tasks: &mut JoinSet<()>) {
        let inner = &self.hub.inner;
        let connection_id = inner.id;
        match frame {
            Frame::Response { message_id, result, .. } => {
                if !inner.calls.resolve(message_id, Ok(result)) {
                    tracing::debug!(%connection_id, message_id, "response for unknown call");
                }
            },
            Frame::ResponseWithError { message_id, error } => {
                if !inner.calls.resolve(message_id, Err(CallError::Remote(error))) {
                    tracing::debug!(%connection_id, message_id, "error response for unknown call");
                }
            },
            Frame::Broadcast { method_id, args } => {
                let Some(entry) = self.receivers.resolve(method_id) else {
                    tracing::debug!(%connection_id, %method_id, "no receiver for broadcast");
                    return;
                };
                let payload = PooledPayload::rent(&self.pool, &args);
                // A full queue stops the receive loop until a receiver finishes
                tokio::select! {
                    biased;
                    () = inner.shutdown.cancelled() => {},
                    sent = self.pushes.send((entry.clone(), payload)) => {
                        if sent.is_err() {
                            tracing::debug!(%connection_id, %method_id, "push worker gone");
                        }
                    },
                }
            },
            Frame::ClientInvokeRequest { request_id, method_id, args } => {
                let outbox = inner.outbox.clone();
                let Some(entry) = self.receivers.resolve(method_id) else {
                    tracing::debug!(%connection_id, %method_id, "server invoked unknown client method");
                    let error = MethodError::unimplemented(method_id).into_remote(true);
                    let frame = Frame::ClientInvokeResponseWithError { request_id, method_id, error };
                    if let Err(e) = outbox.try_send_frame(&frame) {
                        tracing::debug!(%connection_id, %request_id, error = %e, "error response dropped");
                    }
                    return;
                };

                let entry = entry.clone();
                let ctx = ClientContext::new(self.hub.clone(), method_id);
                let payload = PooledPayload::rent(&self.pool, &args);
                tasks.spawn(async move {
                    let call = async move { entry.invoke(ctx, payload).await };
                    let frame = match AssertUnwindSafe(call).catch_unwind().await {
                        Ok(Ok(result)) => Frame::ClientInvokeResponse { request_id, method_id, result },
                        Ok(Err(error)) => Frame::ClientInvokeResponseWithError {
                            request_id,
                            method_id,
                            error: error.into_remote(true),
                        },
                        Err(panic) => {
                            let message = panic_message(&*panic);
                            tracing::error!(%method_id, panic = message, "client method panicked");
                            let error = MethodError::internal("client method panicked").with_message(message);
                            Frame::ClientInvokeResponseWithError { request_id, method_id, error: error.into_remote(true) }
                        },
                    };
                    if let Err(e) = outbox.send_frame(&frame).await {
                        tracing::debug!(%connection_id, %request_id, error = %e, "client invoke response dropped");
                    }
                });
            },
            Frame::ServerHeartbeat { sequence, sent_at_ms, metadata } => {
                let ack = Frame::ServerHeartbeatAck { sequence, sent_at_ms };
                if let Err(e) = inner.outbox.try_send_frame(&ack) {
                    tracing::debug!(%connection_id, sequence, error = %e, "heartbeat ack dropped");
                }
                if let Some(callback) = &self.options.on_server_heartbeat {
                    let event = ServerHeartbeatEvent { sequence, sent_at_ms, metadata };
                    guarded("server heartbeat callback", || callback(&event));
                }
            },
            Frame::ClientHeartbeatAck { sequence, .. } if sequence >= PROBE_SEQUENCE_BASE => {
                inner.probes.resolve(sequence, Ok(Bytes::new()));
            },
            Frame::ClientHeartbeatAck { sequence, .. } => {
                let latency = inner.heartbeat.ack(sequence, env.now());
                tracing::trace!(%connection_id, sequence, ?latency, "client heartbeat acknowledged");
                if let Some(callback) = &self.options.on_client_heartbeat_ack {
                    let event = ClientHeartbeatEvent { sequence, latency };
                    guarded("client heartbeat callback", || callback(&event));
                }
            },
            other => {
                tracing::warn!(%connection_id, kind = ?other.kind(), "ignoring server-bound frame");
            },
        }
    }
}

fn guarded(what: &str, f: impl FnOnce()) {
    if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(f)) {
        tracing::error!(callback = what, panic = panic_message(&*panic), "callback panicked");
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}
