// ABOUTME: Error taxonomy for STOMP protocol, session, and transport failures
// ABOUTME: Provides a single cloneable error type usable on both the client and server halves

use crate::frame::Frame;
use std::io;
use std::sync::Arc;
use thiserror::Error;

/// Error type shared by the frame codec, the session state machines, and the
/// client API.
///
/// The type is `Clone` so that a single terminal failure (stream error, read
/// timeout, ERROR frame) can be broadcast to every outstanding receipt waiter
/// and every subscription channel on a connection. I/O errors are wrapped in
/// an `Arc` for that reason.
#[derive(Debug, Clone, Error)]
pub enum StompError {
    // Protocol / framing
    /// Frame command is not one of the STOMP commands
    #[error("invalid command")]
    InvalidCommand,

    /// Malformed frame: bad header line, missing NUL, zero-length header name
    #[error("invalid frame format")]
    InvalidFrameFormat,

    /// Frame is larger than the configured maximum
    #[error("maximum frame size exceeded")]
    ExceededMaxFrameSize,

    /// A header value failed validation (bad ack mode, bad content-length, ...)
    #[error("invalid header value for {0}")]
    InvalidHeaderValue(&'static str),

    /// The heart-beat header does not match `cx,cy`
    #[error("invalid heart-beat header")]
    InvalidHeartBeat,

    /// A header required by the frame's command is absent
    #[error("missing header: {0}")]
    MissingHeader(&'static str),

    /// A header prohibited for the frame's command is present
    #[error("prohibited header: {0}")]
    ProhibitedHeader(&'static str),

    /// No version in accept-version is supported here
    #[error("unknown version")]
    UnknownVersion,

    // Session
    /// First frame on a connection was not CONNECT or STOMP
    #[error("expected CONNECT or STOMP frame")]
    NotConnected,

    /// A valid command arrived in a state that does not allow it
    #[error("unexpected frame: {0}")]
    UnexpectedCommand(&'static str),

    /// Command is not handled in the connected state
    #[error("unknown command")]
    UnknownCommand,

    /// CONNECT and STOMP frames must not request a receipt
    #[error("receipt header prohibited in CONNECT frame")]
    ReceiptInConnect,

    /// Login/passcode rejected by the authenticator
    #[error("authentication failed")]
    AuthenticationFailed,

    // Transaction
    #[error("transaction already in progress")]
    TxAlreadyInProgress,

    #[error("transaction unknown")]
    TxUnknown,

    /// Operation on a transaction that has already committed or aborted
    #[error("transaction is completed")]
    CompletedTransaction,

    // Subscription
    /// SUBSCRIBE with an id already registered on the same connection
    #[error("subscription id already in use")]
    SubscriptionInUse,

    #[error("subscription not found")]
    SubscriptionNotFound,

    /// Operation on a subscription that has been unsubscribed
    #[error("subscription is completed")]
    CompletedSubscription,

    // Delivery
    /// NACK is not part of STOMP 1.0
    #[error("NACK not supported in STOMP 1.0")]
    NackNotSupported,

    #[error("cannot NACK on an auto subscription")]
    CannotNackAutoSub,

    /// ACK/NACK for a message this connection never received
    #[error("message was not received on this connection")]
    NotReceivedMessage,

    // Transport
    /// Connection is closed; no further operations are possible
    #[error("connection closed")]
    Closed,

    /// No frame or heart-beat arrived within the negotiated window
    #[error("read timeout")]
    ReadTimeout,

    /// Peer is not draining its write queue
    #[error("write channel full")]
    WriteChannelFull,

    /// Error from the underlying byte stream
    #[error("connection error: {0}")]
    Io(#[source] Arc<io::Error>),

    /// ERROR frame received from the peer. Carries the `message` header and
    /// the originating frame when available.
    #[error("{message}")]
    RemoteError {
        message: String,
        frame: Option<Box<Frame>>,
    },

    /// A frame arrived where a different one was required (e.g. the reply to
    /// CONNECT was neither CONNECTED nor ERROR)
    #[error("unexpected frame: expected {expected}, got {actual}")]
    UnexpectedFrame {
        expected: &'static str,
        actual: String,
    },
}

impl From<io::Error> for StompError {
    fn from(err: io::Error) -> Self {
        StompError::Io(Arc::new(err))
    }
}

impl StompError {
    /// Construct the error for a received ERROR frame, taking the text from
    /// its `message` header.
    pub fn from_error_frame(frame: Frame) -> StompError {
        let message = frame
            .headers
            .get(crate::header::MESSAGE)
            .unwrap_or("ERROR frame, missing message header")
            .to_string();
        StompError::RemoteError {
            message,
            frame: Some(Box::new(frame)),
        }
    }
}

/// Result type alias for STOMP operations.
pub type Result<T> = std::result::Result<T, StompError>;
