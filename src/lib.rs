//! STOMP 1.0/1.1/1.2 messaging, both halves: a tokio-based client and a
//! message broker sharing one frame codec and session core.
//!
//! STOMP (Simple Text Oriented Messaging Protocol) is a frame-based pub/sub
//! and point-to-point messaging protocol over any reliable byte stream.
//! Destinations under `/queue/` get queue semantics (buffered delivery,
//! round-robin across subscribers, acknowledgement and redelivery);
//! everything else is a topic (immediate broadcast fan-out).
//!
//! # Client
//!
//! ```rust,no_run
//! use stomp::client::{dial, ConnectOptions, SendOptions};
//! use stomp::AckMode;
//!
//! #[tokio::main]
//! async fn main() -> stomp::Result<()> {
//!     let conn = dial("localhost:61613", ConnectOptions::new()).await?;
//!
//!     let mut sub = conn.subscribe("/queue/jobs", AckMode::Client).await?;
//!     conn.send_with(
//!         "/queue/jobs",
//!         "text/plain",
//!         "job payload",
//!         SendOptions::new().with_receipt(),
//!     )
//!     .await?;
//!
//!     let message = sub.receive().await?;
//!     conn.ack(&message).await?;
//!
//!     conn.disconnect().await
//! }
//! ```
//!
//! # Server
//!
//! ```rust,no_run
//! use stomp::server::{Server, ServerConfig};
//! use tokio::net::TcpListener;
//!
//! #[tokio::main]
//! async fn main() -> stomp::Result<()> {
//!     let listener = TcpListener::bind("0.0.0.0:61613").await?;
//!     Server::new(ServerConfig::default()).serve(listener).await
//! }
//! ```

pub mod ack;
pub mod client;
pub mod codec;
pub mod connection;
pub mod errors;
pub mod frame;
pub mod header;
pub mod id;
pub mod server;
pub mod version;

#[cfg(test)]
mod tests;

pub use ack::AckMode;
pub use errors::{Result, StompError};
pub use frame::{Command, Frame};
pub use header::Headers;
pub use version::Version;
