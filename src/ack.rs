use crate::errors::{Result, StompError};
use std::fmt;
use std::str::FromStr;

/// Acknowledgement mode for a STOMP subscription, carried in the `ack` header
/// of the SUBSCRIBE frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckMode {
    /// No acknowledgement is required; the server assumes the client received
    /// the message as soon as it is written.
    #[default]
    Auto,

    /// The client acknowledges messages cumulatively: an ACK acknowledges the
    /// named message and every earlier unacknowledged message on the same
    /// subscription.
    Client,

    /// The client acknowledges each message individually.
    ClientIndividual,
}

impl AckMode {
    pub fn as_str(self) -> &'static str {
        match self {
            AckMode::Auto => "auto",
            AckMode::Client => "client",
            AckMode::ClientIndividual => "client-individual",
        }
    }

    /// Whether messages delivered to a subscription in this mode require an
    /// ACK or NACK from the client.
    pub fn requires_ack(self) -> bool {
        !matches!(self, AckMode::Auto)
    }
}

impl FromStr for AckMode {
    type Err = StompError;

    fn from_str(s: &str) -> Result<AckMode> {
        match s {
            "auto" => Ok(AckMode::Auto),
            "client" => Ok(AckMode::Client),
            "client-individual" => Ok(AckMode::ClientIndividual),
            _ => Err(StompError::InvalidHeaderValue(crate::header::ACK)),
        }
    }
}

impl fmt::Display for AckMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
