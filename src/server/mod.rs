// ABOUTME: STOMP server module: configuration, accept loop, and the broker/connection actors
// ABOUTME: Exposes the Authenticator and QueueStorage plug-in points

//! STOMP broker.
//!
//! Each accepted connection is served by two tasks (frame reader and
//! processor); destination state lives in a single broker dispatcher task
//! that every connection talks to over a request channel. Queues
//! (`/queue/...` destinations) get round-robin delivery with acknowledgement
//! tracking and pluggable storage; every other destination is a broadcast
//! topic.
//!
//! ```rust,no_run
//! use stomp::server::{Server, ServerConfig};
//! use tokio::net::TcpListener;
//!
//! # async fn example() -> stomp::Result<()> {
//! let listener = TcpListener::bind(stomp::server::DEFAULT_LISTEN_ADDR).await?;
//! Server::new(ServerConfig::default()).serve(listener).await
//! # }
//! ```

pub mod auth;
pub mod storage;

pub(crate) mod broker;
pub(crate) mod conn;
pub(crate) mod queue;
pub(crate) mod subscription;
pub(crate) mod topic;
pub(crate) mod txstore;

pub use auth::Authenticator;
pub use broker::QUEUE_PREFIX;
pub use storage::{MemoryQueueStorage, QueueStorage};

use crate::codec::MAX_FRAME_SIZE;
use crate::errors::Result;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Default listen address for the stand-alone broker.
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:61613";

/// Capacity of the broker dispatcher's request channel.
const BROKER_CHANNEL_CAPACITY: usize = 32;

/// Tunable server behaviour.
pub struct ServerConfig {
    /// Validates CONNECT credentials. `None` accepts every login.
    pub authenticator: Option<Arc<dyn Authenticator>>,

    /// Minimum heart-beat period the server will agree to. Clients asking
    /// for shorter periods are clamped up to this value.
    pub heart_beat_min: Duration,

    /// Largest frame body accepted from a client.
    pub max_frame_size: usize,

    /// Value of the `server` header in CONNECTED frames.
    pub server_id: String,
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            authenticator: None,
            heart_beat_min: Duration::from_secs(30),
            max_frame_size: MAX_FRAME_SIZE,
            server_id: format!("stompd/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("authenticator", &self.authenticator.is_some())
            .field("heart_beat_min", &self.heart_beat_min)
            .field("max_frame_size", &self.max_frame_size)
            .field("server_id", &self.server_id)
            .finish()
    }
}

/// A STOMP broker bound to a listener by [`serve`](Server::serve).
pub struct Server {
    config: Arc<ServerConfig>,
    storage: Option<Box<dyn QueueStorage>>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Server {
        Server {
            config: Arc::new(config),
            storage: None,
        }
    }

    /// Replace the default in-memory queue storage.
    pub fn with_storage(mut self, storage: Box<dyn QueueStorage>) -> Server {
        self.storage = Some(storage);
        self
    }

    /// Accept and serve connections until the listener fails fatally. The
    /// future runs forever in normal operation; cancel it (or exit the
    /// process) to shut the broker down.
    pub async fn serve(mut self, listener: TcpListener) -> Result<()> {
        let storage = self
            .storage
            .take()
            .unwrap_or_else(|| Box::new(MemoryQueueStorage::new()));
        let (broker_tx, broker_rx) = mpsc::channel(BROKER_CHANNEL_CAPACITY);
        tokio::spawn(broker::Broker::new(storage, broker_rx).run());

        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "listening for STOMP connections");
        }

        let mut next_conn_id: u64 = 0;
        loop {
            match listener.accept().await {
                Ok((socket, peer)) => {
                    next_conn_id += 1;
                    debug!(%peer, conn = next_conn_id, "accepted connection");
                    conn::spawn(
                        next_conn_id,
                        socket,
                        Arc::clone(&self.config),
                        broker_tx.clone(),
                    );
                }
                Err(err) => {
                    // transient accept failures (fd exhaustion and the like)
                    warn!(error = %err, "accept failed, retrying");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
}
