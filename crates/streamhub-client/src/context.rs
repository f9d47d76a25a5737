use streamhub_proto::{CborSerializer, ConnectionId, MethodId};

use crate::connection::HubConnection;

/// Context handed to client-side receivers and client-implemented methods.
pub struct ClientContext<S = CborSerializer> {
    connection: HubConnection<S>,
    method_id: MethodId,
}

impl<S> Clone for ClientContext<S> {
    fn clone(&self) -> Self {
        Self { connection: self.connection.clone(), method_id: self.method_id }
    }
}

impl<S> std::fmt::Debug for ClientContext<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientContext")
            .field("connection_id", &self.connection.connection_id())
            .field("method_id", &self.method_id)
            .finish()
    }
}

impl<S> ClientContext<S> {
    pub(crate) fn new(connection: HubConnection<S>, method_id: MethodId) -> Self {
        Self { connection, method_id }
    }

    /// Identity of the connection the call arrived on
    pub fn connection_id(&self) -> ConnectionId {
        self.connection.connection_id()
    }

    /// Method being invoked
    pub fn method_id(&self) -> MethodId {
        self.method_id
    }

    /// The connection, for calling back into the hub
    pub fn connection(&self) -> &HubConnection<S> {
        &self.connection
    }
}
