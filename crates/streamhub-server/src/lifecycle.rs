//! Connection lifecycle hooks and heartbeat metadata.

use async_trait::async_trait;
use bytes::Bytes;
use streamhub_core::DisconnectReason;
use streamhub_proto::{CborSerializer, ConnectionId, Serializer};

use crate::context::HubContext;

/// Hooks run when a connection joins or leaves the hub.
///
/// `on_disconnect` runs after heartbeats stopped and outstanding client
/// invokes were cancelled, but before the connection is removed from its
/// groups, so a hook can still broadcast a farewell to them.
#[async_trait]
pub trait HubLifecycle<S: Serializer = CborSerializer>: Send + Sync + 'static {
    /// Connection accepted and ready to serve
    async fn on_connect(&self, _ctx: &HubContext<S>) {}

    /// Connection ended
    async fn on_disconnect(&self, _ctx: &HubContext<S>, _reason: &DisconnectReason) {}
}

/// Lifecycle without hooks
#[derive(Debug, Clone, Copy, Default)]
pub struct NoLifecycle;

impl<S: Serializer> HubLifecycle<S> for NoLifecycle {}

/// Supplies the metadata attached to each server heartbeat.
pub trait HeartbeatMetadataProvider: Send + Sync + 'static {
    /// Serialized metadata for the next heartbeat to `connection_id`; empty
    /// for none
    fn metadata(&self, connection_id: ConnectionId) -> Bytes;
}

impl<F> HeartbeatMetadataProvider for F
where
    F: Fn(ConnectionId) -> Bytes + Send + Sync + 'static,
{
    fn metadata(&self, connection_id: ConnectionId) -> Bytes {
        self(connection_id)
    }
}
