//! Per-connection dispatch.
//!
//! One receive loop per connection decodes frames in arrival order and routes
//! them:
//!
//! ```text
//! Request ──────────────> handler task ──> Response / ResponseWithError
//! RequestFireAndForget ─> handler task      (result logged, never sent)
//! ClientInvokeResponse ─> ClientInvoker pending call
//! ServerHeartbeatAck ───> HeartbeatView (latency, ack callback)
//! ClientHeartbeat ──────> ClientHeartbeatAck echo
//! ```
//!
//! Handlers run on their own tasks, so a slow method never stalls the loop and
//! responses may complete out of order. A handler error or panic becomes an
//! error response; only transport failure, malformed frames, a heartbeat
//! timeout or an explicit abort end the connection.

use std::{any::Any, io, panic::AssertUnwindSafe, sync::Arc};

use bytes::Bytes;
use futures::FutureExt;
use streamhub_core::{
    DeliveryError, DisconnectReason, Environment, HeartbeatHandle, HubError, MessageReceiver, MethodError,
    Outbox, OutboxError, PooledPayload, TransportConnection,
};
use streamhub_proto::{Direction, Frame, MessageId, MethodId, Serializer};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::{
    client_invoke::ClientInvoker,
    context::{ConnectionScope, HeartbeatView, HubContext},
    server::HubShared,
};

/// Serve one accepted connection until it ends.
pub(crate) async fn serve<S, E, C>(
    hub: Arc<HubShared<S>>,
    env: E,
    connection: C,
    shutdown: CancellationToken,
) -> DisconnectReason
where
    S: Serializer,
    E: Environment,
    C: TransportConnection,
{
    let id = connection.identity();
    let (sender, mut receiver) = connection.into_split();
    let (outbox, writer) = Outbox::spawn(id, sender, hub.config.outbox_capacity);

    let ids_env = env.clone();
    let client = ClientInvoker::new(
        outbox.clone(),
        Arc::clone(&hub.serializer),
        Arc::new(move || ids_env.random_id_bytes()),
        hub.config.client_invoke_timeout,
    );
    let heartbeat = HeartbeatView::new({
        let env = env.clone();
        let outbox = outbox.clone();
        let metadata = hub.metadata.clone();
        HeartbeatHandle::spawn(env.clone(), hub.config.heartbeat, move |sequence| {
            let frame = Frame::ServerHeartbeat {
                sequence,
                sent_at_ms: env.wall_clock_millis(),
                metadata: metadata.as_ref().map(|m| m.metadata(id)).unwrap_or_default(),
            };
            match outbox.try_send_frame(&frame) {
                Ok(()) => true,
                Err(OutboxError::Delivery(DeliveryError::Full(_))) => {
                    tracing::debug!(connection_id = %id, sequence, "outbox full, heartbeat skipped");
                    true
                },
                Err(e) => {
                    tracing::debug!(connection_id = %id, sequence, error = %e, "heartbeat not sent");
                    false
                },
            }
        })
    });

    let scope = Arc::new(ConnectionScope {
        id,
        outbox: outbox.clone(),
        client: client.clone(),
        groups: Arc::clone(&hub.groups),
        serializer: Arc::clone(&hub.serializer),
        shutdown: shutdown.clone(),
        heartbeat: heartbeat.clone(),
    });
    let ctx = HubContext::connection(scope);

    tracing::info!(connection_id = %id, "connection established");
    hub.lifecycle.on_connect(&ctx).await;

    let dispatcher = Dispatcher { hub: Arc::clone(&hub), ctx: ctx.clone(), client: client.clone() };
    let mut tasks = JoinSet::new();

    let reason = loop {
        let fault = tokio::select! {
            biased;
            () = shutdown.cancelled() => break DisconnectReason::LocalClose,
            () = heartbeat.timed_out() => HubError::Timeout,
            () = outbox.closed() => HubError::Transport(io::Error::new(io::ErrorKind::BrokenPipe, "send failed")),
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                if let Err(e) = joined {
                    tracing::debug!(connection_id = %id, error = %e, "handler task ended abnormally");
                }
                continue;
            },
            received = receiver.recv() => match received {
                Ok(Some(message)) => match Frame::decode(&message, Direction::ToServer) {
                    Ok(frame) => {
                        dispatcher.dispatch(frame, &env, &mut tasks).await;
                        continue;
                    },
                    Err(e) => HubError::Protocol(e),
                },
                Ok(None) => break DisconnectReason::Closed,
                Err(e) => HubError::Transport(e),
            },
        };

        tracing::warn!(connection_id = %id, error = %fault, "connection fault");
        if let Some(reason) = fault.reason() {
            break reason;
        }
    };

    tracing::info!(connection_id = %id, %reason, "connection closing");

    heartbeat.dispose();
    let cancelled = client.cancel_all();
    if cancelled > 0 {
        tracing::debug!(connection_id = %id, cancelled, "cancelled outstanding client invokes");
    }
    hub.lifecycle.on_disconnect(&ctx, &reason).await;
    hub.groups.leave_all(id);
    tasks.abort_all();
    outbox.close();
    if let Err(e) = writer.await {
        tracing::debug!(connection_id = %id, error = %e, "writer task ended abnormally");
    }

    reason
}

struct Dispatcher<S> {
    hub: Arc<HubShared<S>>,
    ctx: HubContext<S>,
    client: ClientInvoker<S>,
}

impl<S: Serializer> Dispatcher<S> {
    async fn dispatch<E: Environment>(
        &self,
        frame: Frame,
        env: &E,
        tasks: &mut JoinSet<()>,
    ) {
        let connection_id = self.ctx.connection_id();
        match frame {
            Frame::Request { message_id, method_id, args } => {
                let Some(entry) = self.hub.methods.resolve(method_id) else {
                    let fault = HubError::UnknownMethod { method_id };
                    tracing::debug!(%connection_id, message_id, error = %fault, "request failed");
                    self.respond_error(message_id, fault.to_method_error()).await;
                    return;
                };

                let entry = entry.clone();
                let ctx = self.ctx.for_call(method_id, Some(message_id));
                let payload = PooledPayload::rent(&self.hub.pool, &args);
                let outbox = self.ctx.outbox().clone();
                let expose = self.hub.config.expose_exception_details;

                tasks.spawn(async move {
                    let call = async move { entry.invoke(ctx, payload).await };
                    let outcome = AssertUnwindSafe(call).catch_unwind().await;
                    let frame = response_frame(message_id, method_id, outcome, expose);
                    if let Err(e) = outbox.send_frame(&frame).await {
                        tracing::debug!(%connection_id, message_id, error = %e, "response dropped");
                    }
                });
            },
            Frame::RequestFireAndForget { method_id, args } => {
                let Some(entry) = self.hub.methods.resolve(method_id) else {
                    tracing::debug!(%connection_id, %method_id, "fire-and-forget for unknown method");
                    return;
                };

                let entry = entry.clone();
                let ctx = self.ctx.for_call(method_id, None);
                let payload = PooledPayload::rent(&self.hub.pool, &args);

                tasks.spawn(async move {
                    let call = async move { entry.invoke(ctx, payload).await };
                    match AssertUnwindSafe(call).catch_unwind().await {
                        Ok(Ok(_)) => {},
                        Ok(Err(e)) => {
                            tracing::debug!(%connection_id, %method_id, error = %e, "fire-and-forget handler failed");
                        },
                        Err(panic) => {
                            tracing::error!(%connection_id, %method_id, panic = panic_message(&*panic), "handler panicked");
                        },
                    }
                });
            },
            Frame::ClientInvokeResponse { request_id, result, .. } => {
                self.client.complete(request_id, result);
            },
            Frame::ClientInvokeResponseWithError { request_id, error, .. } => {
                self.client.fail(request_id, error);
            },
            Frame::ServerHeartbeatAck { sequence, .. } => {
                if let Some(latency) = self.ctx.heartbeat().acknowledge(sequence, env.now()) {
                    tracing::trace!(%connection_id, sequence, ?latency, "heartbeat acknowledged");
                }
            },
            Frame::ClientHeartbeat { sequence, sent_at_ms, .. } => {
                let ack = Frame::ClientHeartbeatAck { sequence, sent_at_ms };
                if let Err(e) = self.ctx.outbox().try_send_frame(&ack) {
                    tracing::debug!(%connection_id, sequence, error = %e, "client heartbeat ack dropped");
                }
            },
            other => {
                tracing::warn!(%connection_id, kind = ?other.kind(), "ignoring client-bound frame");
            },
        }
    }

    async fn respond_error(&self, message_id: MessageId, error: MethodError) {
        let frame = Frame::ResponseWithError {
            message_id,
            error: error.into_remote(self.hub.config.expose_exception_details),
        };
        if let Err(e) = self.ctx.outbox().send_frame(&frame).await {
            tracing::debug!(connection_id = %self.ctx.connection_id(), message_id, error = %e, "error response dropped");
        }
    }
}

fn response_frame(
    message_id: MessageId,
    method_id: MethodId,
    outcome: Result<Result<Bytes, MethodError>, Box<dyn Any + Send>>,
    expose: bool,
) -> Frame {
    let fault = match outcome {
        Ok(Ok(result)) => return Frame::Response { message_id, method_id, result },
        Ok(Err(source)) => {
            let fault = HubError::HandlerFault { method_id, source };
            tracing::debug!(message_id, error = %fault, "handler returned error");
            fault
        },
        Err(panic) => {
            let message = panic_message(&*panic);
            tracing::error!(%method_id, message_id, panic = message, "handler panicked");
            let source = MethodError::internal("handler panicked").with_message(message);
            HubError::HandlerFault { method_id, source }
        },
    };
    Frame::ResponseWithError { message_id, error: fault.to_method_error().into_remote(expose) }
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
