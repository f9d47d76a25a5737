//! Server-to-client invocation.
//!
//! A hub method can call a method implemented by its caller and await the
//! result. Each invocation gets a fresh random [`RequestId`]; the connection's
//! receive loop resolves it when the matching `ClientInvokeResponse` (or
//! `ClientInvokeResponseWithError`) arrives. Teardown cancels whatever is
//! still outstanding.

use std::{fmt, sync::Arc, time::Duration};

use bytes::Bytes;
use serde::{Serialize, de::DeserializeOwned};
use streamhub_core::{CallError, Outbox, OutboxError, PendingCalls};
use streamhub_proto::{CborSerializer, Frame, MethodId, RemoteError, RequestId, Serializer};

pub(crate) type IdSource = Arc<dyn Fn() -> [u8; 16] + Send + Sync>;

/// Calls methods implemented by one connected client.
pub struct ClientInvoker<S = CborSerializer> {
    outbox: Outbox,
    pending: PendingCalls<RequestId>,
    serializer: Arc<S>,
    ids: IdSource,
    timeout: Option<Duration>,
}

impl<S> Clone for ClientInvoker<S> {
    fn clone(&self) -> Self {
        Self {
            outbox: self.outbox.clone(),
            pending: self.pending.clone(),
            serializer: Arc::clone(&self.serializer),
            ids: Arc::clone(&self.ids),
            timeout: self.timeout,
        }
    }
}

impl<S> fmt::Debug for ClientInvoker<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientInvoker")
            .field("connection_id", &self.outbox.connection_id())
            .field("pending", &self.pending)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl<S: Serializer> ClientInvoker<S> {
    pub(crate) fn new(
        outbox: Outbox,
        serializer: Arc<S>,
        ids: IdSource,
        timeout: Option<Duration>,
    ) -> Self {
        Self { outbox, pending: PendingCalls::new(), serializer, ids, timeout }
    }

    /// Invoke `method_id` on the client with typed arguments and result.
    pub async fn invoke<Req, Resp>(&self, method_id: MethodId, args: &Req) -> Result<Resp, CallError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let args = Bytes::from(self.serializer.to_vec(args)?);
        let result = self.invoke_raw(method_id, args).await?;
        Ok(self.serializer.deserialize(&result)?)
    }

    /// Invoke `method_id` with pre-serialized arguments.
    ///
    /// Fails with [`CallError::TimedOut`] (status `DEADLINE_EXCEEDED`) when
    /// the configured deadline passes first.
    pub async fn invoke_raw(&self, method_id: MethodId, args: Bytes) -> Result<Bytes, CallError> {
        let request_id = RequestId::from_random_bytes((self.ids)());
        let call = self.pending.register(request_id)?;

        let frame = Frame::ClientInvokeRequest { request_id, method_id, args };
        self.outbox.send_frame(&frame).await.map_err(|e| match e {
            OutboxError::Encode(e) => CallError::Protocol(e),
            OutboxError::Delivery(_) => CallError::Disconnected,
        })?;
        tracing::trace!(%request_id, %method_id, "client invoke sent");

        match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, call)
                .await
                .map_err(|_| CallError::TimedOut(timeout))?,
            None => call.await,
        }
    }

    /// Number of invocations awaiting a client response
    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn complete(&self, request_id: RequestId, result: Bytes) {
        if !self.pending.resolve(request_id, Ok(result)) {
            tracing::debug!(%request_id, "client invoke response for unknown request");
        }
    }

    pub(crate) fn fail(&self, request_id: RequestId, error: RemoteError) {
        if !self.pending.resolve(request_id, Err(CallError::Remote(error))) {
            tracing::debug!(%request_id, "client invoke error for unknown request");
        }
    }

    pub(crate) fn cancel_all(&self) -> usize {
        self.pending.cancel_all()
    }
}
