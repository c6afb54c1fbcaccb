// ABOUTME: Client-side subscription handle and the received-message type
// ABOUTME: Messages arrive on a bounded channel fed by the connection coordinator

use crate::ack::AckMode;
use crate::client::connection::Connection;
use crate::errors::{Result, StompError};
use crate::header::{self, Headers};
use bytes::Bytes;
use tokio::sync::mpsc;

/// A message received from the server on a subscription.
///
/// The original MESSAGE frame headers are retained so acknowledgement can
/// recover the server-assigned identifiers whatever protocol version is in
/// play.
#[derive(Debug, Clone)]
pub struct Message {
    pub destination: String,
    pub content_type: Option<String>,
    pub body: Bytes,
    pub headers: Headers,
}

impl Message {
    pub(crate) fn from_frame(frame: crate::frame::Frame) -> Message {
        Message {
            destination: frame
                .headers
                .get(header::DESTINATION)
                .unwrap_or_default()
                .to_string(),
            content_type: frame
                .headers
                .get(header::CONTENT_TYPE)
                .map(str::to_string),
            body: frame.body,
            headers: frame.headers,
        }
    }

    /// Id of the subscription this message was delivered on.
    pub fn subscription_id(&self) -> Option<&str> {
        self.headers.get(header::SUBSCRIPTION)
    }

    /// The server-assigned message id.
    pub fn message_id(&self) -> Option<&str> {
        self.headers.get(header::MESSAGE_ID)
    }

    /// The identifier to use in a 1.2 `ACK id:` frame. Servers put it in the
    /// `ack` header; ours mirrors the message id there.
    pub(crate) fn ack_id(&self) -> Option<&str> {
        self.headers.get(header::ACK).or_else(|| self.message_id())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SubscriptionState {
    Active,
    Closing,
    Closed,
}

/// A client subscription to a destination, created by
/// [`Connection::subscribe`].
///
/// Messages are drawn with [`receive`](Subscription::receive). The delivery
/// channel is bounded at 16 messages; a subscriber that stops receiving
/// eventually stalls and then drops the whole connection, which is the
/// intended backpressure behaviour for consumers that cannot keep up.
#[derive(Debug)]
pub struct Subscription {
    id: String,
    destination: String,
    ack_mode: AckMode,
    conn: Connection,
    receiver: mpsc::Receiver<Result<Message>>,
    state: SubscriptionState,
    received: u64,
}

impl Subscription {
    pub(crate) fn new(
        id: String,
        destination: String,
        ack_mode: AckMode,
        conn: Connection,
        receiver: mpsc::Receiver<Result<Message>>,
    ) -> Subscription {
        Subscription {
            id,
            destination,
            ack_mode,
            conn,
            receiver,
            state: SubscriptionState::Active,
            received: 0,
        }
    }

    /// Identifier of this subscription, unique within its connection.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn ack_mode(&self) -> AckMode {
        self.ack_mode
    }

    pub fn is_active(&self) -> bool {
        self.state == SubscriptionState::Active
    }

    /// Number of messages this subscription has yielded so far.
    pub fn messages_received(&self) -> u64 {
        self.received
    }

    /// Wait for the next message.
    ///
    /// Returns the terminal error once the connection has failed, and
    /// `connection closed` after a graceful shutdown or unsubscribe.
    pub async fn receive(&mut self) -> Result<Message> {
        if self.state != SubscriptionState::Active {
            return Err(StompError::CompletedSubscription);
        }
        match self.receiver.recv().await {
            Some(Ok(message)) => {
                self.received += 1;
                Ok(message)
            }
            Some(Err(err)) => {
                self.state = SubscriptionState::Closed;
                Err(err)
            }
            None => {
                self.state = SubscriptionState::Closed;
                Err(StompError::Closed)
            }
        }
    }

    /// Unsubscribe from the destination. The frame carries an auto-generated
    /// receipt, and the call completes when the server confirms it.
    pub async fn unsubscribe(&mut self) -> Result<()> {
        if self.state != SubscriptionState::Active {
            return Err(StompError::CompletedSubscription);
        }
        self.state = SubscriptionState::Closing;
        let result = self.conn.send_unsubscribe(&self.id).await;
        self.state = SubscriptionState::Closed;
        result
    }
}
