//! Demo chat hub.
//!
//! Rooms are groups. Clients join a room under a display name, send messages
//! to everyone in it and get presence notifications. `RoundTrip` shows a hub
//! method calling back into its caller.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use streamhub_core::{DisconnectReason, MethodError, MethodTable, TableError, Target};
use streamhub_proto::{ConnectionId, StatusCode};

use crate::{
    config::ServerConfig,
    context::HubContext,
    lifecycle::HubLifecycle,
    server::HubServer,
};

/// Method ids of the chat hub and of the receivers it pushes to
pub mod methods {
    use streamhub_proto::MethodId;

    /// `(JoinRoom) -> usize` member count after joining
    pub const JOIN_ROOM: MethodId = MethodId::from_name("JoinRoom");
    /// `(String) -> bool`
    pub const LEAVE_ROOM: MethodId = MethodId::from_name("LeaveRoom");
    /// `(ChatMessage) -> usize` members reached
    pub const SEND_MESSAGE: MethodId = MethodId::from_name("SendMessage");
    /// Fire-and-forget `(String)` room name
    pub const TYPING: MethodId = MethodId::from_name("Typing");
    /// `(String) -> String`
    pub const ECHO: MethodId = MethodId::from_name("Echo");
    /// `(String) -> String`, answered by the caller's `Reflect` receiver
    pub const ROUND_TRIP: MethodId = MethodId::from_name("RoundTrip");

    /// Client receiver: `Presence`
    pub const ON_JOIN: MethodId = MethodId::from_name("OnJoin");
    /// Client receiver: `Presence`
    pub const ON_LEAVE: MethodId = MethodId::from_name("OnLeave");
    /// Client receiver: `ChatEvent`
    pub const ON_MESSAGE: MethodId = MethodId::from_name("OnMessage");
    /// Client receiver: `Presence`
    pub const ON_TYPING: MethodId = MethodId::from_name("OnTyping");
    /// Client-implemented method: `(String) -> String`
    pub const REFLECT: MethodId = MethodId::from_name("Reflect");
}

/// `JoinRoom` arguments
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRoom {
    /// Room to join
    pub room: String,
    /// Display name
    pub user: String,
}

/// `SendMessage` arguments
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Target room
    pub room: String,
    /// Message text
    pub text: String,
}

/// Pushed to room members for every message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatEvent {
    /// Room the message was sent to
    pub room: String,
    /// Sender's display name
    pub user: String,
    /// Message text
    pub text: String,
}

/// Pushed when someone joins, leaves or types
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Presence {
    /// Room concerned
    pub room: String,
    /// Display name
    pub user: String,
}

/// Display names of connected users.
#[derive(Debug, Default)]
pub struct ChatState {
    names: DashMap<ConnectionId, String>,
}

impl ChatState {
    /// Display name registered by `id`
    pub fn name(&self, id: ConnectionId) -> Option<String> {
        self.names.get(&id).map(|name| name.clone())
    }

    fn require_name(&self, id: ConnectionId) -> Result<String, MethodError> {
        self.name(id)
            .ok_or_else(|| MethodError::new(StatusCode::FAILED_PRECONDITION, "join a room first"))
    }
}

fn broadcast_failed(e: impl std::fmt::Display) -> MethodError {
    MethodError::internal("broadcast failed").with_message(e.to_string())
}

/// Method table of the chat hub
pub fn chat_methods(state: &Arc<ChatState>) -> Result<MethodTable<HubContext>, TableError> {
    let join_state = Arc::clone(state);
    let send_state = Arc::clone(state);
    let leave_state = Arc::clone(state);
    let typing_state = Arc::clone(state);

    MethodTable::builder()
        .add("JoinRoom", move |ctx: HubContext, req: JoinRoom| {
            let state = Arc::clone(&join_state);
            async move {
                if req.room.is_empty() || req.user.is_empty() {
                    return Err(MethodError::invalid_argument("room and user must not be empty"));
                }
                let id = ctx.connection_id();
                state.names.insert(id, req.user.clone());
                let group = ctx.join(&req.room);

                let presence = Presence { room: req.room.clone(), user: req.user };
                ctx.broadcast(&req.room, methods::ON_JOIN, &presence, Target::Except(id))
                    .map_err(broadcast_failed)?;
                tracing::debug!(connection_id = %id, room = %req.room, "joined room");
                Ok(group.len())
            }
        })
        .add("LeaveRoom", move |ctx: HubContext, room: String| {
            let state = Arc::clone(&leave_state);
            async move {
                let id = ctx.connection_id();
                if !ctx.leave(&room) {
                    return Ok(false);
                }
                if let Some(user) = state.name(id) {
                    let presence = Presence { room: room.clone(), user };
                    ctx.broadcast(&room, methods::ON_LEAVE, &presence, Target::All)
                        .map_err(broadcast_failed)?;
                }
                Ok::<_, MethodError>(true)
            }
        })
        .add("SendMessage", move |ctx: HubContext, msg: ChatMessage| {
            let state = Arc::clone(&send_state);
            async move {
                let id = ctx.connection_id();
                let user = state.require_name(id)?;
                if !ctx.groups().get(&msg.room).is_some_and(|group| group.contains(id)) {
                    return Err(MethodError::new(
                        StatusCode::FAILED_PRECONDITION,
                        format!("not a member of {}", msg.room),
                    ));
                }

                let event = ChatEvent { room: msg.room.clone(), user, text: msg.text };
                let report = ctx
                    .broadcast(&msg.room, methods::ON_MESSAGE, &event, Target::All)
                    .map_err(broadcast_failed)?;
                if !report.failed.is_empty() {
                    tracing::debug!(
                        room = %msg.room,
                        failed = report.failed.len(),
                        "message not delivered to every member"
                    );
                }
                Ok::<_, MethodError>(report.delivered)
            }
        })
        .add_fire_and_forget("Typing", move |ctx: HubContext, room: String| {
            let state = Arc::clone(&typing_state);
            async move {
                let id = ctx.connection_id();
                let user = state.require_name(id)?;
                let presence = Presence { room: room.clone(), user };
                ctx.broadcast(&room, methods::ON_TYPING, &presence, Target::Except(id))
                    .map_err(broadcast_failed)?;
                Ok::<_, MethodError>(())
            }
        })
        .add("Echo", |_ctx: HubContext, text: String| async move { Ok::<_, MethodError>(text) })
        .add("RoundTrip", |ctx: HubContext, text: String| async move {
            let reflected: String =
                ctx.client().invoke(methods::REFLECT, &text).await.map_err(MethodError::from)?;
            Ok::<_, MethodError>(reflected)
        })
        .build()
}

/// Announces departures to the rooms a connection was in.
#[derive(Debug, Clone)]
pub struct ChatLifecycle {
    state: Arc<ChatState>,
}

#[async_trait]
impl HubLifecycle for ChatLifecycle {
    async fn on_disconnect(&self, ctx: &HubContext, reason: &DisconnectReason) {
        let id = ctx.connection_id();
        let Some((_, user)) = self.state.names.remove(&id) else { return };

        for room in ctx.groups().groups_of(id) {
            let presence = Presence { room: room.clone(), user: user.clone() };
            if let Err(e) = ctx.broadcast(&room, methods::ON_LEAVE, &presence, Target::Except(id)) {
                tracing::debug!(connection_id = %id, %room, error = %e, "farewell not sent");
            }
        }
        tracing::debug!(connection_id = %id, %user, %reason, "user left");
    }
}

/// A ready-to-serve chat hub.
pub fn chat_hub(config: ServerConfig) -> Result<HubServer, TableError> {
    let state = Arc::new(ChatState::default());
    let methods = chat_methods(&state)?;
    Ok(HubServer::builder(methods).config(config).lifecycle(ChatLifecycle { state }).build())
}
