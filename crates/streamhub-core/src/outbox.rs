//! Per-connection send serialization.
//!
//! A connection has exactly one writer task. Everything that wants to send
//! (responses, heartbeats, broadcasts from other connections) enqueues
//! encoded frames into the [`Outbox`]; the writer drains the queue in order,
//! so there is never more than one write in flight on a transport.

use bytes::Bytes;
use streamhub_proto::{ConnectionId, Frame, ProtocolError};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{error::DeliveryError, group::GroupMember, transport::MessageSender};

/// Cloneable handle to a connection's send queue.
#[derive(Debug, Clone)]
pub struct Outbox {
    connection_id: ConnectionId,
    tx: mpsc::Sender<Bytes>,
    closed: CancellationToken,
}

impl Outbox {
    /// Start the writer task for `sender`.
    ///
    /// The task ends when the outbox is closed (after draining what is already
    /// queued) or when a write fails; either way the outbox reports closed.
    pub fn spawn<S: MessageSender>(
        connection_id: ConnectionId,
        mut sender: S,
        capacity: usize,
    ) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<Bytes>(capacity.max(1));
        let closed = CancellationToken::new();
        let outbox = Self { connection_id, tx, closed: closed.clone() };

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    message = rx.recv() => {
                        let Some(message) = message else { break };
                        if let Err(e) = sender.send(message).await {
                            tracing::debug!(%connection_id, error = %e, "write failed, closing outbox");
                            closed.cancel();
                            rx.close();
                            break;
                        }
                    },
                    () = closed.cancelled() => {
                        rx.close();
                        while let Ok(message) = rx.try_recv() {
                            if sender.send(message).await.is_err() {
                                break;
                            }
                        }
                        break;
                    },
                }
            }
            closed.cancel();
            if let Err(e) = sender.close().await {
                tracing::debug!(%connection_id, error = %e, "close failed");
            }
        });

        (outbox, task)
    }

    /// Connection this outbox writes to
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Queue a message, waiting for space.
    pub async fn send(&self, message: Bytes) -> Result<(), DeliveryError> {
        if self.closed.is_cancelled() {
            return Err(DeliveryError::Closed(self.connection_id));
        }
        tokio::select! {
            result = self.tx.send(message) => {
                result.map_err(|_| DeliveryError::Closed(self.connection_id))
            },
            () = self.closed.cancelled() => Err(DeliveryError::Closed(self.connection_id)),
        }
    }

    /// Queue a message without waiting; fails if the queue is full.
    pub fn try_send(&self, message: Bytes) -> Result<(), DeliveryError> {
        if self.closed.is_cancelled() {
            return Err(DeliveryError::Closed(self.connection_id));
        }
        self.tx.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::Full(self.connection_id),
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed(self.connection_id),
        })
    }

    /// Encode and queue a frame, waiting for space.
    pub async fn send_frame(&self, frame: &Frame) -> Result<(), OutboxError> {
        let bytes = frame.to_bytes()?;
        self.send(bytes).await?;
        Ok(())
    }

    /// Encode and queue a frame without waiting.
    pub fn try_send_frame(&self, frame: &Frame) -> Result<(), OutboxError> {
        let bytes = frame.to_bytes()?;
        self.try_send(bytes)?;
        Ok(())
    }

    /// Stop accepting messages; queued messages are still written.
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Whether the outbox stopped accepting messages
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the outbox is closed (locally or by a write failure)
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }
}

impl GroupMember for Outbox {
    fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    fn deliver(&self, message: Bytes) -> Result<(), DeliveryError> {
        self.try_send(message)
    }
}

/// Failure to queue a frame
#[derive(Debug, thiserror::Error)]
pub enum OutboxError {
    /// Frame could not be encoded
    #[error(transparent)]
    Encode(#[from] ProtocolError),
    /// Queue rejected it
    #[error(transparent)]
    Delivery(#[from] DeliveryError),
}
