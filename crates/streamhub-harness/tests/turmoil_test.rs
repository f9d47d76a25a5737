//! End-to-end tests over turmoil's simulated TCP.
//!
//! The demo chat hub and real clients, connected through the length-delimited
//! framed transport, with simulated latency and a server restart.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
    time::Duration,
};

use streamhub_client::{
    ChannelOptions, ChannelState, ClientContext, ClientOptions, Receivers, ReconnectingChannel, RetryPolicy,
};
use streamhub_core::{HeartbeatConfig, MethodError, MethodTable};
use streamhub_harness::{SimConnector, SimEnv, SimTransport};
use streamhub_server::{
    ServerConfig,
    chat::{self, ChatEvent, ChatMessage, JoinRoom, Presence, methods},
};
use tokio::sync::mpsc;

/// Helper to convert any error to Box<dyn Error>
fn to_box_err<E: std::error::Error + 'static>(e: E) -> Box<dyn std::error::Error> {
    Box::new(e)
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Seen {
    Joined(Presence),
    Left(Presence),
    Message(ChatEvent),
}

fn chat_receivers(seen: mpsc::UnboundedSender<Seen>) -> Result<Receivers, Box<dyn std::error::Error>> {
    let on_join = seen.clone();
    let on_leave = seen.clone();
    let on_message = seen;

    let table = MethodTable::builder()
        .add_fire_and_forget("OnJoin", move |_: ClientContext, presence: Presence| {
            let seen = on_join.clone();
            async move {
                let _ = seen.send(Seen::Joined(presence));
                Ok::<_, MethodError>(())
            }
        })
        .add_fire_and_forget("OnLeave", move |_: ClientContext, presence: Presence| {
            let seen = on_leave.clone();
            async move {
                let _ = seen.send(Seen::Left(presence));
                Ok::<_, MethodError>(())
            }
        })
        .add_fire_and_forget("OnMessage", move |_: ClientContext, event: ChatEvent| {
            let seen = on_message.clone();
            async move {
                let _ = seen.send(Seen::Message(event));
                Ok::<_, MethodError>(())
            }
        })
        .add("Reflect", |_: ClientContext, text: String| async move {
            Ok::<_, MethodError>(text.chars().rev().collect::<String>())
        })
        .build()
        .map_err(to_box_err)?;
    Ok(Arc::new(table))
}

fn options() -> ChannelOptions {
    ChannelOptions { retry: RetryPolicy::Fixed(Duration::from_millis(200)), ..ChannelOptions::default() }
}

fn connect(seed: u64, receivers: Receivers, options: ChannelOptions) -> ReconnectingChannel {
    ReconnectingChannel::start(SimConnector::new("server:5100"), SimEnv::with_seed(seed), receivers, options)
}

async fn next(seen: &mut mpsc::UnboundedReceiver<Seen>) -> Result<Seen, Box<dyn std::error::Error>> {
    tokio::time::timeout(Duration::from_secs(10), seen.recv())
        .await
        .map_err(to_box_err)?
        .ok_or_else(|| "receiver closed".into())
}

fn join(room: &str, user: &str) -> JoinRoom {
    JoinRoom { room: room.into(), user: user.into() }
}

#[test]
fn chat_over_simulated_tcp() {
    let mut sim = turmoil::Builder::new()
        .simulation_duration(Duration::from_secs(120))
        .min_message_latency(Duration::from_millis(5))
        .max_message_latency(Duration::from_millis(40))
        .rng_seed(2024)
        .build();

    sim.host("server", || async {
        let transport = SimTransport::bind("0.0.0.0:5100").await?;
        let hub = chat::chat_hub(ServerConfig::default()).map_err(to_box_err)?;
        hub.serve(transport, SimEnv::new()).await.map_err(to_box_err)?;
        Ok(())
    });

    sim.client("users", async {
        let (alice_tx, mut alice_seen) = mpsc::unbounded_channel();
        let (bob_tx, mut bob_seen) = mpsc::unbounded_channel();
        let alice = connect(1, chat_receivers(alice_tx)?, options());
        let bob = connect(2, chat_receivers(bob_tx)?, options());
        alice.wait_connected().await.map_err(to_box_err)?;
        bob.wait_connected().await.map_err(to_box_err)?;

        let members: usize = alice.invoke(methods::JOIN_ROOM, &join("rust", "alice")).await.map_err(to_box_err)?;
        assert_eq!(members, 1);
        let members: usize = bob.invoke(methods::JOIN_ROOM, &join("rust", "bob")).await.map_err(to_box_err)?;
        assert_eq!(members, 2);
        assert_eq!(
            next(&mut alice_seen).await?,
            Seen::Joined(Presence { room: "rust".into(), user: "bob".into() })
        );

        let message = ChatMessage { room: "rust".into(), text: "hello".into() };
        let delivered: usize = alice.invoke(methods::SEND_MESSAGE, &message).await.map_err(to_box_err)?;
        assert_eq!(delivered, 2);
        let expected =
            Seen::Message(ChatEvent { room: "rust".into(), user: "alice".into(), text: "hello".into() });
        assert_eq!(next(&mut alice_seen).await?, expected);
        assert_eq!(next(&mut bob_seen).await?, expected);

        let reflected: String = bob.invoke(methods::ROUND_TRIP, "stressed").await.map_err(to_box_err)?;
        assert_eq!(reflected, "desserts");

        bob.dispose().await;
        assert_eq!(
            next(&mut alice_seen).await?,
            Seen::Left(Presence { room: "rust".into(), user: "bob".into() })
        );

        alice.dispose().await;
        Ok(())
    });

    sim.run().expect("simulation should complete");
}

#[test]
fn channel_reconnects_after_server_restart() {
    let mut sim = turmoil::Builder::new()
        .simulation_duration(Duration::from_secs(120))
        .rng_seed(99)
        .build();

    sim.host("server", || async {
        let transport = SimTransport::bind("0.0.0.0:5100").await?;
        let hub = chat::chat_hub(ServerConfig::default()).map_err(to_box_err)?;
        hub.serve(transport, SimEnv::new()).await.map_err(to_box_err)?;
        Ok(())
    });

    let connected = Arc::new(AtomicBool::new(false));
    let drops = Arc::new(AtomicU32::new(0));

    let client_connected = Arc::clone(&connected);
    let client_drops = Arc::clone(&drops);
    sim.client("user", async move {
        let (seen, _unused) = mpsc::unbounded_channel();
        // Client heartbeats notice the dead connection after the restart
        let client = ClientOptions {
            heartbeat: HeartbeatConfig {
                interval: Some(Duration::from_secs(1)),
                timeout: Some(Duration::from_secs(3)),
            },
            ..ClientOptions::default()
        };
        let channel = connect(3, chat_receivers(seen)?, ChannelOptions { client, ..options() });
        let first = channel.wait_connected().await.map_err(to_box_err)?;
        let identity = first.connection_id();

        let counter = Arc::clone(&client_drops);
        let _registration = channel.on_disconnected(move |info| {
            assert_eq!(info.identity, identity);
            counter.fetch_add(1, Ordering::SeqCst);
        });
        client_connected.store(true, Ordering::SeqCst);

        let mut state = channel.watch_state();
        while !(channel.generation() >= 2 && *state.borrow_and_update() == ChannelState::Connected) {
            state.changed().await.map_err(to_box_err)?;
        }

        assert_eq!(channel.identity(), identity);
        assert_eq!(client_drops.load(Ordering::SeqCst), 1);
        let echoed: String = channel.invoke(methods::ECHO, "still here").await.map_err(to_box_err)?;
        assert_eq!(echoed, "still here");

        channel.dispose().await;
        Ok(())
    });

    while !connected.load(Ordering::SeqCst) {
        sim.step().expect("simulation step");
    }
    sim.bounce("server");
    sim.run().expect("client should reconnect");
    assert_eq!(drops.load(Ordering::SeqCst), 1);
}
