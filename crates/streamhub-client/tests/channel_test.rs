//! Reconnecting channel tests
//!
//! Fault injection through the in-memory network: refused connects, severed
//! links and muted clients.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU8, Ordering},
    },
    time::Duration,
};

use parking_lot::Mutex;
use streamhub_client::{
    ChannelError, ChannelOptions, ChannelState, DisconnectInfo, HubClient, IdentityMode,
    ReconnectingChannel, RetryPolicy,
};
use streamhub_core::{CallError, DisconnectReason, HeartbeatConfig, MethodError, MethodTable};
use streamhub_harness::{MemoryNetwork, SimEnv};
use streamhub_proto::{ConnectionId, MethodId};
use streamhub_server::{HubContext, HubServer, ServerConfig};

const ADD: MethodId = MethodId::from_name("Add");
const WHO_AM_I: MethodId = MethodId::from_name("WhoAmI");

struct Fixture {
    hub: HubServer,
    network: MemoryNetwork,
}

fn serve() -> Fixture {
    let methods = MethodTable::builder()
        .add("Add", |_: HubContext, (a, b): (i32, i32)| async move { Ok::<_, MethodError>(a + b) })
        .add("WhoAmI", |ctx: HubContext, (): ()| async move {
            Ok::<_, MethodError>(ctx.connection_id().to_string())
        })
        .build()
        .unwrap();
    let hub = HubServer::builder(methods)
        .config(ServerConfig { heartbeat: HeartbeatConfig::DISABLED, ..ServerConfig::default() })
        .build();
    let (network, listener) = MemoryNetwork::new();
    let server = hub.clone();
    tokio::spawn(async move { server.serve(listener, SimEnv::new()).await });
    Fixture { hub, network }
}

fn options() -> ChannelOptions {
    ChannelOptions {
        retry: RetryPolicy::Fixed(Duration::from_millis(100)),
        probe_timeout: Duration::from_secs(1),
        ..ChannelOptions::default()
    }
}

fn channel(fx: &Fixture, options: ChannelOptions) -> ReconnectingChannel {
    ReconnectingChannel::start(
        fx.network.connector(),
        SimEnv::with_seed(7),
        Arc::new(MethodTable::default()),
        options,
    )
}

async fn within<F: std::future::Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(60), future).await.expect("timed out")
}

async fn wait_for_generation(channel: &ReconnectingChannel, generation: u64) {
    let mut state = channel.watch_state();
    within(async {
        loop {
            if *state.borrow_and_update() == ChannelState::Connected
                && channel.generation() >= generation
            {
                return;
            }
            state.changed().await.unwrap();
        }
    })
    .await;
}

struct Calculator {
    channel: ReconnectingChannel,
}

impl HubClient for Calculator {
    fn from_channel(channel: ReconnectingChannel) -> Self {
        Self { channel }
    }
}

impl Calculator {
    async fn add(&self, a: i32, b: i32) -> Result<i32, CallError> {
        self.channel.invoke(ADD, &(a, b)).await
    }

    async fn who_am_i(&self) -> Result<String, CallError> {
        self.channel.invoke(WHO_AM_I, &()).await
    }
}

#[tokio::test]
async fn connects_and_serves_typed_clients() {
    let fx = serve();
    let channel = channel(&fx, options());

    let connection = within(channel.wait_connected()).await.unwrap();
    assert_eq!(connection.connection_id(), channel.identity());
    assert_eq!(channel.state(), ChannelState::Connected);
    assert_eq!(channel.generation(), 1);
    assert_eq!(channel.retry_count(), 0);

    let calculator: Calculator = channel.create_client();
    assert_eq!(calculator.add(2, 3).await.unwrap(), 5);
    assert_eq!(calculator.who_am_i().await.unwrap(), channel.identity().to_string());
    assert!(fx.hub.is_connected(channel.identity()));
}

#[tokio::test(start_paused = true)]
async fn refused_connects_are_retried() {
    let fx = serve();
    fx.network.refuse_connections(true);
    let channel = channel(&fx, options());

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(channel.state(), ChannelState::Connecting);
    assert!(channel.retry_count() >= 5);
    assert!(fx.network.connect_attempts() >= 5);
    assert_eq!(
        Calculator::from_channel(channel.clone()).add(1, 1).await,
        Err(CallError::Disconnected)
    );

    fx.network.refuse_connections(false);
    within(channel.wait_connected()).await.unwrap();
    assert_eq!(channel.retry_count(), 0);
    assert_eq!(channel.generation(), 1);
}

#[tokio::test]
async fn identity_survives_reconnects_and_callbacks_fire_once_per_drop() {
    let fx = serve();
    let channel = channel(&fx, options());
    within(channel.wait_connected()).await.unwrap();
    let identity = channel.identity();

    let fired: Arc<Mutex<Vec<(&'static str, DisconnectInfo)>>> = Arc::default();
    for name in ["first", "second"] {
        let fired = Arc::clone(&fired);
        let _registration = channel.on_disconnected(move |info| fired.lock().push((name, info.clone())));
    }

    assert_eq!(fx.network.sever_all(), 1);
    wait_for_generation(&channel, 2).await;

    {
        let fired = fired.lock();
        let names: Vec<&str> = fired.iter().map(|(name, _)| *name).collect();
        assert_eq!(names, ["first", "second"]);
        for (_, info) in fired.iter() {
            assert_eq!(info.identity, identity);
            assert_eq!(info.generation, 1);
            assert!(matches!(info.reason, DisconnectReason::Transport(_)));
        }
    }

    assert_eq!(channel.identity(), identity);
    let seen: String = channel.invoke(WHO_AM_I, &()).await.unwrap();
    assert_eq!(seen, identity.to_string());

    assert_eq!(fx.network.sever_all(), 1);
    wait_for_generation(&channel, 3).await;
    assert_eq!(fired.lock().len(), 4);
    assert_eq!(channel.identity(), identity);
}

#[tokio::test]
async fn per_attempt_identity_mints_new_ids() {
    let fx = serve();
    let next = Arc::new(AtomicU8::new(1));
    let options = ChannelOptions { identity: IdentityMode::PerAttempt, ..options() }
        .identity_factory(move || {
            ConnectionId::from_random_bytes([next.fetch_add(1, Ordering::SeqCst); 16])
        });
    let channel = channel(&fx, options);

    within(channel.wait_connected()).await.unwrap();
    let before = channel.identity();
    assert_eq!(before, ConnectionId::from_random_bytes([1; 16]));

    fx.network.sever_all();
    wait_for_generation(&channel, 2).await;

    let after = channel.identity();
    assert_ne!(after, before);
    let seen: String = channel.invoke(WHO_AM_I, &()).await.unwrap();
    assert_eq!(seen, after.to_string());
}

#[tokio::test]
async fn panicking_callback_does_not_block_the_rest() {
    let fx = serve();
    let channel = channel(&fx, options());
    within(channel.wait_connected()).await.unwrap();

    let survivors = Arc::new(Mutex::new(0u32));
    let _bad = channel.on_disconnected(|_| panic!("callback failure"));
    let counter = Arc::clone(&survivors);
    let _good = channel.on_disconnected(move |_| *counter.lock() += 1);

    fx.network.sever_all();
    wait_for_generation(&channel, 2).await;
    assert_eq!(*survivors.lock(), 1);
}

#[tokio::test]
async fn unregistered_callbacks_stop_firing() {
    let fx = serve();
    let channel = channel(&fx, options());
    within(channel.wait_connected()).await.unwrap();

    let fired = Arc::new(Mutex::new(Vec::new()));
    let a = {
        let fired = Arc::clone(&fired);
        channel.on_disconnected(move |_| fired.lock().push("a"))
    };
    let _b = {
        let fired = Arc::clone(&fired);
        channel.on_disconnected(move |_| fired.lock().push("b"))
    };
    assert!(a.unregister());

    fx.network.sever_all();
    wait_for_generation(&channel, 2).await;
    assert_eq!(*fired.lock(), ["b"]);
}

#[tokio::test(start_paused = true)]
async fn unanswered_probe_is_a_failed_attempt() {
    let fx = serve();
    fx.network.mute_clients(true);
    let channel = channel(&fx, options());

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_ne!(channel.state(), ChannelState::Connected);
    assert!(channel.retry_count() >= 2);
    assert_eq!(channel.generation(), 0);

    fx.network.mute_clients(false);
    within(channel.wait_connected()).await.unwrap();
    assert_eq!(channel.retry_count(), 0);
}

#[tokio::test]
async fn dispose_is_terminal() {
    let fx = serve();
    let channel = channel(&fx, options());
    let connection = within(channel.wait_connected()).await.unwrap();
    let identity = channel.identity();

    channel.dispose().await;

    assert_eq!(channel.state(), ChannelState::Disposed);
    assert!(channel.current().is_none());
    assert!(!connection.is_connected());
    assert!(matches!(channel.wait_connected().await, Err(ChannelError::Disposed)));
    assert_eq!(
        channel.invoke::<_, i32>(ADD, &(1, 1)).await,
        Err(CallError::Disconnected)
    );

    // Nothing reconnects afterwards
    let attempts = fx.network.connect_attempts();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(fx.network.connect_attempts(), attempts);
    within(async {
        while fx.hub.is_connected(identity) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
}
