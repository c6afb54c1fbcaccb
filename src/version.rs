use crate::errors::{Result, StompError};
use std::fmt;
use std::str::FromStr;

/// STOMP protocol version.
///
/// Versions are totally ordered: `V10 < V11 < V12`. Escape encoding of header
/// names and values, the NACK command, and the STOMP alias for CONNECT all
/// require `V11` or later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Version {
    V10,
    V11,
    V12,
}

/// All versions supported by this implementation, lowest first.
pub const SUPPORTED: [Version; 3] = [Version::V10, Version::V11, Version::V12];

impl Version {
    pub fn as_str(self) -> &'static str {
        match self {
            Version::V10 => "1.0",
            Version::V11 => "1.1",
            Version::V12 => "1.2",
        }
    }

    /// Whether header names and values are escape-encoded on the wire.
    pub fn escapes_headers(self) -> bool {
        self >= Version::V11
    }

    /// Whether the NACK command is part of the protocol.
    pub fn supports_nack(self) -> bool {
        self >= Version::V11
    }

    /// Negotiate the highest mutually supported version from an
    /// `accept-version` header value (a comma-separated list).
    ///
    /// Unrecognised entries are skipped; if no entry is supported the
    /// negotiation fails with `unknown version`.
    pub fn negotiate(accept_version: &str) -> Result<Version> {
        let mut best: Option<Version> = None;
        for item in accept_version.split(',') {
            if let Ok(v) = item.trim().parse::<Version>() {
                if best.is_none_or(|b| v > b) {
                    best = Some(v);
                }
            }
        }
        best.ok_or(StompError::UnknownVersion)
    }
}

impl FromStr for Version {
    type Err = StompError;

    fn from_str(s: &str) -> Result<Version> {
        match s {
            "1.0" => Ok(Version::V10),
            "1.1" => Ok(Version::V11),
            "1.2" => Ok(Version::V12),
            _ => Err(StompError::UnknownVersion),
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
