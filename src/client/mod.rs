// ABOUTME: STOMP client module: connection handle, subscriptions, transactions, option builders
// ABOUTME: Exports the dial/connect entry points and the types they produce

//! STOMP client.
//!
//! The client is built around a per-connection coordinator task that owns the
//! write half of the byte stream and all connection-local state. Application
//! code talks to it through a cloneable [`Connection`] handle:
//!
//! * [`dial`] / [`connect`] — handshake and version/heart-beat negotiation
//! * [`Connection::send`] — publish to a queue or topic, optionally waiting
//!   for a broker receipt
//! * [`Connection::subscribe`] — returns a [`Subscription`] whose messages
//!   are read with [`Subscription::receive`]
//! * [`Connection::ack`] / [`Connection::nack`] — acknowledge deliveries
//! * [`Connection::begin`] — returns a [`Transaction`] for atomic groups
//! * [`Connection::disconnect`] — graceful receipt-confirmed shutdown
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use stomp::client::{dial, ConnectOptions};
//! use stomp::AckMode;
//!
//! # async fn example() -> stomp::Result<()> {
//! let conn = dial("localhost:61613", ConnectOptions::new()).await?;
//!
//! let mut sub = conn.subscribe("/queue/work", AckMode::Auto).await?;
//! conn.send("/queue/work", "text/plain", "job 1").await?;
//!
//! let message = sub.receive().await?;
//! println!("got: {:?}", message.body);
//!
//! conn.disconnect().await?;
//! # Ok(())
//! # }
//! ```

pub mod connection;
pub mod options;
pub mod subscription;
pub mod transaction;

pub use connection::{connect, dial, Connection};
pub use options::{ConnectOptions, SendOptions, SubscribeOptions};
pub use subscription::{Message, Subscription};
pub use transaction::Transaction;
