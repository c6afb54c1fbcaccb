// ABOUTME: Client-side transaction handle grouping SEND/ACK/NACK until COMMIT or ABORT

use crate::client::connection::Connection;
use crate::client::options::SendOptions;
use crate::client::subscription::Message;
use crate::errors::{Result, StompError};
use crate::frame::Command;
use crate::header;
use bytes::Bytes;

/// A STOMP transaction, created by [`Connection::begin`].
///
/// Sends and acknowledgements issued through the transaction are buffered by
/// the server and take effect atomically on [`commit`](Transaction::commit);
/// [`abort`](Transaction::abort) discards them. A committed or aborted
/// transaction rejects further operations.
#[derive(Debug)]
pub struct Transaction {
    id: String,
    conn: Connection,
    completed: bool,
}

impl Transaction {
    pub(crate) fn new(id: String, conn: Connection) -> Transaction {
        Transaction {
            id,
            conn,
            completed: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn check_open(&self) -> Result<()> {
        if self.completed {
            Err(StompError::CompletedTransaction)
        } else {
            Ok(())
        }
    }

    /// Send a message within this transaction.
    pub async fn send(
        &self,
        destination: &str,
        content_type: &str,
        body: impl Into<Bytes>,
    ) -> Result<()> {
        self.send_with(destination, content_type, body, SendOptions::new())
            .await
    }

    pub async fn send_with(
        &self,
        destination: &str,
        content_type: &str,
        body: impl Into<Bytes>,
        options: SendOptions,
    ) -> Result<()> {
        self.check_open()?;
        self.conn
            .send_with(
                destination,
                content_type,
                body,
                options.in_transaction(&self.id),
            )
            .await
    }

    /// Acknowledge a message within this transaction.
    pub async fn ack(&self, message: &Message) -> Result<()> {
        self.check_open()?;
        self.conn.ack_in_tx(message, Some(&self.id)).await
    }

    /// Reject a message within this transaction.
    pub async fn nack(&self, message: &Message) -> Result<()> {
        self.check_open()?;
        self.conn.nack_in_tx(message, Some(&self.id)).await
    }

    /// Commit the transaction: every buffered SEND/ACK/NACK takes effect in
    /// the order it was issued.
    pub async fn commit(&mut self) -> Result<()> {
        self.check_open()?;
        self.completed = true;
        let frame =
            crate::frame::Frame::new(Command::Commit).with_header(header::TRANSACTION, &self.id);
        self.conn.request(frame).await
    }

    /// Abort the transaction, discarding everything buffered under it.
    pub async fn abort(&mut self) -> Result<()> {
        self.check_open()?;
        self.completed = true;
        let frame =
            crate::frame::Frame::new(Command::Abort).with_header(header::TRANSACTION, &self.id);
        self.conn.request(frame).await
    }
}
