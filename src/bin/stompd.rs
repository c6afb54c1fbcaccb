// ABOUTME: Stand-alone STOMP broker daemon: flag parsing, logging, signal handling

use argh::FromArgs;
use std::time::Duration;
use stomp::server::{Server, ServerConfig, DEFAULT_LISTEN_ADDR};
use tokio::net::TcpListener;
use tracing::{error, info};

/// STOMP message broker.
#[derive(FromArgs, Debug)]
struct Args {
    /// address to listen on (default 0.0.0.0:61613)
    #[argh(option, short = 'l', default = "DEFAULT_LISTEN_ADDR.to_string()")]
    listen: String,

    /// minimum heart-beat period in milliseconds (default 30000)
    #[argh(option, default = "30_000")]
    heart_beat_min: u64,

    /// maximum frame size in bytes (default 16 MiB)
    #[argh(option, default = "16 * 1024 * 1024")]
    max_frame_size: usize,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(tracing::Level::INFO)
        .init();

    let args: Args = argh::from_env();

    let listener = match TcpListener::bind(&args.listen).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(addr = %args.listen, error = %err, "failed to bind");
            std::process::exit(1);
        }
    };

    let config = ServerConfig {
        heart_beat_min: Duration::from_millis(args.heart_beat_min),
        max_frame_size: args.max_frame_size,
        ..ServerConfig::default()
    };

    tokio::select! {
        result = Server::new(config).serve(listener) => {
            if let Err(err) = result {
                error!(error = %err, "server stopped");
                std::process::exit(1);
            }
        }
        signal = shutdown_signal() => {
            info!(%signal, "received signal, shutting down");
        }
    }
}

/// Resolves when SIGINT or SIGTERM arrives.
async fn shutdown_signal() -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => "SIGINT",
            _ = term.recv() => "SIGTERM",
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        "interrupt"
    }
}
