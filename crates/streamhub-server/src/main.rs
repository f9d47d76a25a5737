//! StreamHub demo server
//!
//! Serves the chat hub over length-delimited TCP.

use std::time::Duration;

use clap::Parser;
use streamhub_core::{HeartbeatConfig, SystemEnv, framed::{FramedConfig, TcpTransport}};
use streamhub_server::{ServerConfig, ServerError, chat};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "streamhub-server", about = "StreamHub chat hub server")]
struct Args {
    /// Address to listen on
    #[arg(short, long, default_value = "127.0.0.1:5100")]
    listen: String,

    /// Seconds between server heartbeats
    #[arg(long, default_value_t = 10)]
    heartbeat_interval: u64,

    /// Seconds without an acknowledgement before a connection is dropped
    #[arg(long, default_value_t = 30)]
    heartbeat_timeout: u64,

    /// Disable server heartbeats
    #[arg(long)]
    no_heartbeat: bool,

    /// Send handler error details to clients
    #[arg(long)]
    expose_exception_details: bool,

    /// Frames queued per connection
    #[arg(long, default_value_t = 1024)]
    outbox_capacity: usize,

    /// Largest accepted frame in bytes
    #[arg(long, default_value_t = 16 * 1024 * 1024)]
    max_frame_length: usize,
}

impl Args {
    fn server_config(&self) -> ServerConfig {
        let heartbeat = if self.no_heartbeat {
            HeartbeatConfig::DISABLED
        } else {
            HeartbeatConfig {
                interval: Some(Duration::from_secs(self.heartbeat_interval)),
                timeout: Some(Duration::from_secs(self.heartbeat_timeout)),
            }
        };

        ServerConfig {
            heartbeat,
            expose_exception_details: self.expose_exception_details,
            outbox_capacity: self.outbox_capacity,
            ..ServerConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), ServerError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    if !args.no_heartbeat && args.heartbeat_timeout < args.heartbeat_interval {
        tracing::warn!(
            interval = args.heartbeat_interval,
            timeout = args.heartbeat_timeout,
            "heartbeat timeout is shorter than the interval; healthy clients will be dropped"
        );
    }

    let hub = chat::chat_hub(args.server_config())?;
    let framed = FramedConfig { max_frame_length: args.max_frame_length, ..FramedConfig::default() };
    let transport = TcpTransport::bind(args.listen.as_str(), framed)
        .await
        .map_err(|source| ServerError::Bind { addr: args.listen.clone(), source })?;

    match transport.local_addr() {
        Ok(addr) => tracing::info!(%addr, "streamhub server listening"),
        Err(e) => tracing::warn!(error = %e, "listening on unknown address"),
    }

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("interrupt received");
                signal.cancel();
            },
            Err(e) => tracing::warn!(error = %e, "cannot listen for interrupts"),
        }
    });

    hub.serve_until(transport, SystemEnv, shutdown).await
}
