// STOMP frame codec - separates wire parsing/encoding from the domain model
//
// This module works on byte buffers only. Async stream plumbing lives in
// `connection`, which accumulates bytes and calls `decode` until a complete
// frame (or heart-beat) is available.

use crate::errors::StompError;
use crate::frame::{Command, Frame};
use crate::header::{self, Headers};
use crate::version::Version;
use bytes::{BufMut, Bytes, BytesMut};
use std::io::Cursor;

/// Maximum frame body size accepted by default: 16 MiB.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

const LF: u8 = b'\n';
const CR: u8 = b'\r';
const NUL: u8 = 0;
const COLON: u8 = b':';

/// One unit read from the wire: either a full frame or a lone LF keep-alive.
#[derive(Debug)]
pub enum ReadEvent {
    Frame(Frame),
    Heartbeat,
}

/// Decode failure modes.
///
/// `Incomplete` is an expected runtime condition: the buffer simply does not
/// hold a whole frame yet and the caller should read more bytes. Anything
/// else means the stream is corrupt and the connection must close.
#[derive(Debug)]
pub enum DecodeError {
    /// Not enough data is buffered to decode a frame
    Incomplete,

    /// The buffered data is not a valid frame
    Invalid(StompError),
}

impl From<StompError> for DecodeError {
    fn from(err: StompError) -> DecodeError {
        DecodeError::Invalid(err)
    }
}

/// Attempt to decode one frame or heart-beat from the buffered data.
///
/// On success the cursor position is advanced past the consumed bytes. On
/// `Incomplete` the cursor position is unspecified and the caller must reset
/// it before retrying with more data.
///
/// `version` selects header unescaping (1.1 and later); `max_frame_size`
/// bounds the declared `content-length`.
pub fn decode(
    src: &mut Cursor<&[u8]>,
    version: Version,
    max_frame_size: usize,
) -> Result<ReadEvent, DecodeError> {
    let command_line = read_line(src)?;
    if command_line.is_empty() {
        // lone LF (or CR-LF) between frames
        return Ok(ReadEvent::Heartbeat);
    }

    let command = Command::from_bytes(command_line)
        .ok_or(DecodeError::Invalid(StompError::InvalidCommand))?;

    let mut headers = Headers::new();
    loop {
        let line = read_line(src)?;
        if line.is_empty() {
            break;
        }

        let index = line
            .iter()
            .position(|&b| b == COLON)
            .ok_or(DecodeError::Invalid(StompError::InvalidFrameFormat))?;
        if index == 0 {
            // zero-length header name
            return Err(DecodeError::Invalid(StompError::InvalidFrameFormat));
        }

        let (name, value) = if version.escapes_headers() {
            (unescape(&line[..index])?, unescape(&line[index + 1..])?)
        } else {
            (
                into_utf8(line[..index].to_vec())?,
                into_utf8(line[index + 1..].to_vec())?,
            )
        };
        headers.add(&name, &value);
    }

    let body = match declared_content_length(&headers)? {
        Some(len) => {
            if len > max_frame_size {
                return Err(DecodeError::Invalid(StompError::ExceededMaxFrameSize));
            }
            let start = src.position() as usize;
            let buf = *src.get_ref();
            // body plus the terminating NUL
            if buf.len() - start < len + 1 {
                return Err(DecodeError::Incomplete);
            }
            if buf[start + len] != NUL {
                return Err(DecodeError::Invalid(StompError::InvalidFrameFormat));
            }
            let body = Bytes::copy_from_slice(&buf[start..start + len]);
            src.set_position((start + len + 1) as u64);
            body
        }
        None => {
            let start = src.position() as usize;
            let buf = *src.get_ref();
            let nul = buf[start..]
                .iter()
                .position(|&b| b == NUL)
                .ok_or(DecodeError::Incomplete)?;
            if nul > max_frame_size {
                return Err(DecodeError::Invalid(StompError::ExceededMaxFrameSize));
            }
            let body = Bytes::copy_from_slice(&buf[start..start + nul]);
            src.set_position((start + nul + 1) as u64);
            body
        }
    };

    let frame = Frame {
        command,
        headers,
        body,
    };
    frame.validate(version)?;
    Ok(ReadEvent::Frame(frame))
}

/// Serialize a frame into `dst`. Header names and values are escape-encoded
/// when the negotiated version calls for it.
///
/// The CONNECT handshake always runs with a 1.0 writer, so CONNECT-class
/// frames are never escaped; after negotiation every frame is escaped
/// uniformly, which is harmless for CONNECTED-class fields that contain no
/// reserved characters.
pub fn encode(frame: &Frame, version: Version, dst: &mut BytesMut) {
    let headers_len: usize = frame
        .headers
        .iter()
        .map(|(n, v)| n.len() + v.len() + 2)
        .sum();
    dst.reserve(frame.command.as_str().len() + headers_len + frame.body.len() + 16);

    dst.put_slice(frame.command.as_str().as_bytes());
    dst.put_u8(LF);
    for (name, value) in frame.headers.iter() {
        if version.escapes_headers() {
            escape_into(name, dst);
            dst.put_u8(COLON);
            escape_into(value, dst);
        } else {
            dst.put_slice(name.as_bytes());
            dst.put_u8(COLON);
            dst.put_slice(value.as_bytes());
        }
        dst.put_u8(LF);
    }
    dst.put_u8(LF);
    dst.put_slice(&frame.body);
    dst.put_u8(NUL);
}

/// Read one LF-terminated line from the cursor, stripping an optional
/// trailing CR. Returns `Incomplete` when no LF is buffered yet.
fn read_line<'a>(src: &mut Cursor<&'a [u8]>) -> Result<&'a [u8], DecodeError> {
    let start = src.position() as usize;
    let buf = *src.get_ref();
    let lf = buf[start..]
        .iter()
        .position(|&b| b == LF)
        .ok_or(DecodeError::Incomplete)?;
    src.set_position((start + lf + 1) as u64);

    let mut line = &buf[start..start + lf];
    if line.last() == Some(&CR) {
        line = &line[..line.len() - 1];
    }
    Ok(line)
}

fn declared_content_length(headers: &Headers) -> Result<Option<usize>, DecodeError> {
    match headers.get(header::CONTENT_LENGTH) {
        None => Ok(None),
        Some(text) => text.parse::<usize>().map(Some).map_err(|_| {
            DecodeError::Invalid(StompError::InvalidHeaderValue(header::CONTENT_LENGTH))
        }),
    }
}

fn into_utf8(bytes: Vec<u8>) -> Result<String, DecodeError> {
    String::from_utf8(bytes).map_err(|_| DecodeError::Invalid(StompError::InvalidFrameFormat))
}

/// Apply the 1.1+ escape encoding to one header name or value.
fn escape_into(text: &str, dst: &mut BytesMut) {
    for &b in text.as_bytes() {
        match b {
            b'\r' => dst.put_slice(b"\\r"),
            b'\n' => dst.put_slice(b"\\n"),
            COLON => dst.put_slice(b"\\c"),
            b'\\' => dst.put_slice(b"\\\\"),
            b => dst.put_u8(b),
        }
    }
}

/// Decode the 1.1+ escape encoding. Any backslash sequence other than
/// `\r`, `\n`, `\c`, `\\` is a framing error.
fn unescape(raw: &[u8]) -> Result<String, DecodeError> {
    let mut out = Vec::with_capacity(raw.len());
    let mut iter = raw.iter();
    while let Some(&b) = iter.next() {
        if b == b'\\' {
            match iter.next() {
                Some(b'r') => out.push(CR),
                Some(b'n') => out.push(LF),
                Some(b'c') => out.push(COLON),
                Some(b'\\') => out.push(b'\\'),
                _ => return Err(DecodeError::Invalid(StompError::InvalidFrameFormat)),
            }
        } else {
            out.push(b);
        }
    }
    into_utf8(out)
}
