//! Request-scoped hub context.
//!
//! Every handler invocation receives a [`HubContext`]: the identity of the
//! calling connection, the method and message being served, and handles to
//! everything a hub method may act on (groups, the caller's outbox, the
//! caller's client-side methods, the connection's heartbeat).

use std::{
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use serde::Serialize;
use streamhub_core::{
    BroadcastGroup, DeliveryReport, GroupRegistry, HeartbeatHandle, Outbox, OutboxError, Target,
};
use streamhub_proto::{
    CborSerializer, ConnectionId, Frame, MessageId, MethodId, ProtocolError, Serializer,
};
use tokio_util::sync::CancellationToken;

use crate::client_invoke::ClientInvoker;

/// Per-connection state shared by every context of that connection
pub(crate) struct ConnectionScope<S> {
    pub(crate) id: ConnectionId,
    pub(crate) outbox: Outbox,
    pub(crate) client: ClientInvoker<S>,
    pub(crate) groups: Arc<GroupRegistry>,
    pub(crate) serializer: Arc<S>,
    pub(crate) shutdown: CancellationToken,
    pub(crate) heartbeat: HeartbeatView,
}

type AckCallback = Arc<dyn Fn(Duration) + Send + Sync>;

/// Server heartbeat state of one connection.
///
/// Shared by every context of the connection. Reads reflect the most recent
/// acknowledgement the receive loop has processed.
#[derive(Clone)]
pub struct HeartbeatView {
    inner: Arc<HeartbeatState>,
}

struct HeartbeatState {
    handle: HeartbeatHandle,
    on_ack: Mutex<Option<AckCallback>>,
}

impl fmt::Debug for HeartbeatView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeartbeatView")
            .field("latency", &self.latency())
            .field("last_ack_at", &self.last_ack_at())
            .field("timed_out", &self.is_timed_out())
            .finish_non_exhaustive()
    }
}

impl HeartbeatView {
    pub(crate) fn new(handle: HeartbeatHandle) -> Self {
        Self { inner: Arc::new(HeartbeatState { handle, on_ack: Mutex::new(None) }) }
    }

    /// Round trip of the most recently acknowledged heartbeat
    pub fn latency(&self) -> Option<Duration> {
        self.inner.handle.latency()
    }

    /// When the client last acknowledged a heartbeat
    pub fn last_ack_at(&self) -> Option<Instant> {
        self.inner.handle.last_ack_at()
    }

    /// Token cancelled when the client stops acknowledging heartbeats.
    ///
    /// Long-running methods can select on it to stop early.
    pub fn timeout_token(&self) -> CancellationToken {
        self.inner.handle.timeout_token()
    }

    /// Whether the heartbeat watchdog expired
    pub fn is_timed_out(&self) -> bool {
        self.inner.handle.is_timed_out()
    }

    /// Run `callback` with the measured latency on every acknowledgement.
    ///
    /// Replaces any callback registered earlier. A panicking callback is
    /// logged and does not affect the connection.
    pub fn on_ack<F>(&self, callback: F)
    where
        F: Fn(Duration) + Send + Sync + 'static,
    {
        *self.inner.on_ack.lock() = Some(Arc::new(callback));
    }

    pub(crate) fn acknowledge(&self, sequence: u32, now: Instant) -> Option<Duration> {
        let latency = self.inner.handle.ack(sequence, now)?;
        let callback = self.inner.on_ack.lock().clone();
        let panicked = callback
            .is_some_and(|callback| panic::catch_unwind(AssertUnwindSafe(|| callback(latency))).is_err());
        if panicked {
            tracing::warn!(sequence, "heartbeat ack callback panicked");
        }
        Some(latency)
    }

    pub(crate) async fn timed_out(&self) {
        self.inner.handle.timed_out().await;
    }

    pub(crate) fn dispose(&self) {
        self.inner.handle.dispose();
    }
}

/// What a hub method knows about the call it is serving.
pub struct HubContext<S = CborSerializer> {
    scope: Arc<ConnectionScope<S>>,
    method_id: Option<MethodId>,
    message_id: Option<MessageId>,
}

impl<S> Clone for HubContext<S> {
    fn clone(&self) -> Self {
        Self { scope: Arc::clone(&self.scope), method_id: self.method_id, message_id: self.message_id }
    }
}

impl<S> fmt::Debug for HubContext<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HubContext")
            .field("connection_id", &self.scope.id)
            .field("method_id", &self.method_id)
            .field("message_id", &self.message_id)
            .finish()
    }
}

impl<S: Serializer> HubContext<S> {
    pub(crate) fn connection(scope: Arc<ConnectionScope<S>>) -> Self {
        Self { scope, method_id: None, message_id: None }
    }

    pub(crate) fn for_call(&self, method_id: MethodId, message_id: Option<MessageId>) -> Self {
        Self { scope: Arc::clone(&self.scope), method_id: Some(method_id), message_id }
    }

    pub(crate) fn outbox(&self) -> &Outbox {
        &self.scope.outbox
    }

    /// Calling connection
    pub fn connection_id(&self) -> ConnectionId {
        self.scope.id
    }

    /// Method being served; `None` in lifecycle hooks
    pub fn method_id(&self) -> Option<MethodId> {
        self.method_id
    }

    /// Correlation id of the request; `None` for fire-and-forget calls and
    /// lifecycle hooks
    pub fn message_id(&self) -> Option<MessageId> {
        self.message_id
    }

    /// Methods implemented by the calling client
    pub fn client(&self) -> &ClientInvoker<S> {
        &self.scope.client
    }

    /// Payload serializer of this hub
    pub fn serializer(&self) -> &S {
        &self.scope.serializer
    }

    /// All groups of this hub
    pub fn groups(&self) -> &Arc<GroupRegistry> {
        &self.scope.groups
    }

    /// Add the calling connection to `group`, creating it if needed
    pub fn join(&self, group: &str) -> Arc<BroadcastGroup> {
        self.scope.groups.join(group, Arc::new(self.scope.outbox.clone()))
    }

    /// Remove the calling connection from `group`
    pub fn leave(&self, group: &str) -> bool {
        self.scope.groups.leave(group, self.scope.id)
    }

    /// Push `value` to `method_id` on the targeted members of `group`.
    ///
    /// A group nobody has joined yields an empty report.
    pub fn broadcast<T>(
        &self,
        group: &str,
        method_id: MethodId,
        value: &T,
        target: Target<'_>,
    ) -> Result<DeliveryReport, ProtocolError>
    where
        T: Serialize + ?Sized,
    {
        match self.scope.groups.get(group) {
            Some(group) => group.broadcast(self.serializer(), method_id, value, target),
            None => Ok(DeliveryReport::default()),
        }
    }

    /// Push `value` to `method_id` on the calling client only.
    pub fn push<T>(&self, method_id: MethodId, value: &T) -> Result<(), OutboxError>
    where
        T: Serialize + ?Sized,
    {
        let args = self.serializer().to_vec(value)?.into();
        self.scope.outbox.try_send_frame(&Frame::Broadcast { method_id, args })
    }

    /// Heartbeat state of the calling connection
    pub fn heartbeat(&self) -> &HeartbeatView {
        &self.scope.heartbeat
    }

    /// Close the calling connection after the current frame.
    pub fn abort(&self) {
        self.scope.shutdown.cancel();
    }
}
