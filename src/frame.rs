use crate::ack::AckMode;
use crate::errors::{Result, StompError};
use crate::header::{self, Headers};
use crate::version::Version;
use bytes::Bytes;
use std::fmt;

/// A STOMP frame command. The set is closed; anything else on the wire is an
/// invalid frame. Commands are case-sensitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    // Client commands
    Connect,
    Stomp,
    Send,
    Subscribe,
    Unsubscribe,
    Ack,
    Nack,
    Begin,
    Commit,
    Abort,
    Disconnect,
    // Server commands
    Connected,
    Message,
    Receipt,
    Error,
}

impl Command {
    pub fn as_str(self) -> &'static str {
        match self {
            Command::Connect => "CONNECT",
            Command::Stomp => "STOMP",
            Command::Send => "SEND",
            Command::Subscribe => "SUBSCRIBE",
            Command::Unsubscribe => "UNSUBSCRIBE",
            Command::Ack => "ACK",
            Command::Nack => "NACK",
            Command::Begin => "BEGIN",
            Command::Commit => "COMMIT",
            Command::Abort => "ABORT",
            Command::Disconnect => "DISCONNECT",
            Command::Connected => "CONNECTED",
            Command::Message => "MESSAGE",
            Command::Receipt => "RECEIPT",
            Command::Error => "ERROR",
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Command> {
        match bytes {
            b"CONNECT" => Some(Command::Connect),
            b"STOMP" => Some(Command::Stomp),
            b"SEND" => Some(Command::Send),
            b"SUBSCRIBE" => Some(Command::Subscribe),
            b"UNSUBSCRIBE" => Some(Command::Unsubscribe),
            b"ACK" => Some(Command::Ack),
            b"NACK" => Some(Command::Nack),
            b"BEGIN" => Some(Command::Begin),
            b"COMMIT" => Some(Command::Commit),
            b"ABORT" => Some(Command::Abort),
            b"DISCONNECT" => Some(Command::Disconnect),
            b"CONNECTED" => Some(Command::Connected),
            b"MESSAGE" => Some(Command::Message),
            b"RECEIPT" => Some(Command::Receipt),
            b"ERROR" => Some(Command::Error),
            _ => None,
        }
    }

    /// Whether this frame type may carry a non-empty body. All other frames
    /// must have an empty body.
    pub fn allows_body(self) -> bool {
        matches!(self, Command::Send | Command::Message | Command::Error)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single STOMP frame: command, ordered headers, opaque body.
///
/// The body is a [`Bytes`] value, so cloning a frame copies the header
/// collection but shares the body allocation. Topic fan-out relies on this:
/// each subscriber gets an independent header set over the same payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub command: Command,
    pub headers: Headers,
    pub body: Bytes,
}

impl Frame {
    pub fn new(command: Command) -> Frame {
        Frame {
            command,
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    /// Builder-style header append.
    pub fn with_header(mut self, name: &str, value: &str) -> Frame {
        self.headers.add(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Frame {
        self.body = body.into();
        self
    }

    /// Value of the `content-length` header, if present.
    ///
    /// Fails with `invalid header value` when the header is present but is
    /// not a non-negative integer.
    pub fn content_length(&self) -> Result<Option<usize>> {
        match self.headers.get(header::CONTENT_LENGTH) {
            None => Ok(None),
            Some(text) => text
                .parse::<usize>()
                .map(Some)
                .map_err(|_| StompError::InvalidHeaderValue(header::CONTENT_LENGTH)),
        }
    }

    /// The `heart-beat` header as a `(cx, cy)` pair of millisecond values.
    /// An absent header means `(0, 0)`: no heart-beats in either direction.
    pub fn heart_beat(&self) -> Result<(u32, u32)> {
        match self.headers.get(header::HEART_BEAT) {
            None => Ok((0, 0)),
            Some(text) => parse_heart_beat(text),
        }
    }

    /// Negotiate the protocol version from this frame's `accept-version`
    /// header. An absent header means STOMP 1.0 (legal for CONNECT only;
    /// validation rejects a STOMP frame without the header before this is
    /// called).
    pub fn negotiated_version(&self) -> Result<Version> {
        match self.headers.get(header::ACCEPT_VERSION) {
            None => Ok(Version::V10),
            Some(text) => Version::negotiate(text),
        }
    }

    /// Validate command-specific header requirements and body rules.
    ///
    /// `version` is the currently negotiated protocol version; it decides
    /// whether NACK is legal. CONNECT-class frames carry their own version
    /// information and are validated against it.
    pub fn validate(&self, version: Version) -> Result<()> {
        if !self.command.allows_body() && !self.body.is_empty() {
            return Err(StompError::InvalidFrameFormat);
        }
        if self.headers.contains(header::CONTENT_LENGTH) {
            self.content_length()?;
        }
        if let Some(text) = self.headers.get(header::HEART_BEAT) {
            parse_heart_beat(text)?;
        }

        match self.command {
            Command::Connect | Command::Stomp => self.validate_connect(),
            Command::Connected | Command::Error => Ok(()),
            Command::Send => self.require(header::DESTINATION),
            Command::Subscribe => {
                self.require(header::DESTINATION)?;
                self.require(header::ID)?;
                self.prohibit(header::TRANSACTION)?;
                if let Some(ack) = self.headers.get(header::ACK) {
                    ack.parse::<AckMode>()?;
                }
                Ok(())
            }
            Command::Unsubscribe => {
                self.require(header::ID)?;
                self.prohibit(header::TRANSACTION)
            }
            Command::Ack | Command::Nack => {
                if self.command == Command::Nack && !version.supports_nack() {
                    return Err(StompError::NackNotSupported);
                }
                // Accept both the 1.2 form (id) and the 1.0/1.1 form
                // (subscription + message-id), whatever the negotiated
                // version: mixed-version fleets send both.
                if self.headers.contains(header::ID) {
                    Ok(())
                } else {
                    self.require(header::SUBSCRIPTION)?;
                    self.require(header::MESSAGE_ID)
                }
            }
            Command::Begin | Command::Commit | Command::Abort => {
                self.require(header::TRANSACTION)
            }
            Command::Disconnect => self.prohibit(header::TRANSACTION),
            Command::Message => {
                self.require(header::DESTINATION)?;
                self.require(header::MESSAGE_ID)?;
                self.require(header::SUBSCRIPTION)
            }
            Command::Receipt => self.require(header::RECEIPT_ID),
        }
    }

    fn validate_connect(&self) -> Result<()> {
        if self.headers.contains(header::RECEIPT) {
            return Err(StompError::ReceiptInConnect);
        }
        for name in [
            header::DESTINATION,
            header::TRANSACTION,
            header::ACK,
            header::ID,
        ] {
            self.prohibit(name)?;
        }

        // STOMP is the 1.1+ alias for CONNECT and must say what it accepts.
        if self.command == Command::Stomp {
            self.require(header::ACCEPT_VERSION)?;
        }

        // A connection negotiating 1.1 or later must name the virtual host.
        if self.headers.contains(header::ACCEPT_VERSION)
            && self.negotiated_version()? >= Version::V11
        {
            self.require(header::HOST)?;
        }
        Ok(())
    }

    fn require(&self, name: &'static str) -> Result<()> {
        if self.headers.contains(name) {
            Ok(())
        } else {
            Err(StompError::MissingHeader(name))
        }
    }

    fn prohibit(&self, name: &'static str) -> Result<()> {
        if self.headers.contains(name) {
            Err(StompError::ProhibitedHeader(name))
        } else {
            Ok(())
        }
    }
}

/// Parse a `heart-beat` header value: two comma-separated integers of one to
/// nine digits each.
fn parse_heart_beat(text: &str) -> Result<(u32, u32)> {
    fn field(s: &str) -> Result<u32> {
        if s.is_empty() || s.len() > 9 || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(StompError::InvalidHeartBeat);
        }
        s.parse::<u32>().map_err(|_| StompError::InvalidHeartBeat)
    }

    let (cx, cy) = text.split_once(',').ok_or(StompError::InvalidHeartBeat)?;
    Ok((field(cx)?, field(cy)?))
}
