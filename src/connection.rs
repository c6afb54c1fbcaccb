// ABOUTME: Provides frame-based I/O over any reliable byte stream
// ABOUTME: Buffers reads until a whole STOMP frame is available and flushes every write

use crate::codec::{self, DecodeError, ReadEvent, MAX_FRAME_SIZE};
use crate::errors::{Result, StompError};
use crate::frame::Frame;
use crate::version::Version;
use bytes::{Buf, BytesMut};
use std::io::Cursor;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::watch;

/// Reads STOMP frames from the read half of a byte stream.
///
/// Bytes are accumulated in a [`BytesMut`] buffer and handed to the codec
/// until a complete frame has arrived. Data left over after a frame is kept
/// for the next call.
#[derive(Debug)]
pub struct FrameReader<R> {
    stream: R,
    buffer: BytesMut,
    version: Version,
    version_watch: Option<watch::Receiver<Version>>,
    max_frame_size: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(stream: R) -> FrameReader<R> {
        FrameReader {
            stream,
            // 4KB is plenty for the header section; bodies grow the buffer
            // on demand.
            buffer: BytesMut::with_capacity(4 * 1024),
            version: Version::V10,
            version_watch: None,
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    /// Switch header unescaping to the negotiated protocol version.
    pub fn set_version(&mut self, version: Version) {
        self.version = version;
    }

    /// Track the negotiated version through a watch channel instead of
    /// explicit `set_version` calls.
    ///
    /// The channel is re-sampled immediately before every decode attempt,
    /// not once per blocking read. The server relies on this: its processor
    /// task publishes the negotiated version before writing CONNECTED, so
    /// the first frame a client sends after the handshake is decoded with
    /// the negotiated escaping rules even though the reader task was already
    /// blocked when negotiation happened.
    pub fn watch_version(&mut self, watch: watch::Receiver<Version>) {
        self.version = *watch.borrow();
        self.version_watch = Some(watch);
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn set_max_frame_size(&mut self, max: usize) {
        self.max_frame_size = max;
    }

    /// Read a single frame or heart-beat from the underlying stream.
    ///
    /// Returns `None` when the stream ends cleanly between frames. A stream
    /// that ends mid-frame is reported as an error.
    pub async fn read(&mut self) -> Result<Option<ReadEvent>> {
        loop {
            match self.parse()? {
                Some(event) => return Ok(Some(event)),
                None => {
                    if 0 == self.stream.read_buf(&mut self.buffer).await? {
                        if self.buffer.is_empty() {
                            return Ok(None);
                        }
                        // peer closed while sending a frame
                        return Err(StompError::InvalidFrameFormat);
                    }
                }
            }
        }
    }

    /// Try to decode one event from the buffered data, consuming the bytes on
    /// success. `Ok(None)` means more data is needed.
    fn parse(&mut self) -> Result<Option<ReadEvent>> {
        if let Some(watch) = &self.version_watch {
            self.version = *watch.borrow();
        }
        let mut cursor = Cursor::new(&self.buffer[..]);
        match codec::decode(&mut cursor, self.version, self.max_frame_size) {
            Ok(event) => {
                let consumed = cursor.position() as usize;
                self.buffer.advance(consumed);
                Ok(Some(event))
            }
            Err(DecodeError::Incomplete) => {
                // Guard against a peer that never terminates its frame: the
                // headers-plus-body of a legal frame fit within the frame
                // size limit plus slack for the command and header section.
                if self.buffer.len() > self.max_frame_size + 8 * 1024 {
                    return Err(StompError::ExceededMaxFrameSize);
                }
                Ok(None)
            }
            Err(DecodeError::Invalid(err)) => Err(err),
        }
    }
}

/// Writes STOMP frames to the write half of a byte stream.
///
/// Writes go through a [`BufWriter`] and are flushed after every frame and
/// heart-beat: receipts and keep-alives must not sit in a buffer while the
/// peer's clock runs down.
#[derive(Debug)]
pub struct FrameWriter<W> {
    stream: BufWriter<W>,
    scratch: BytesMut,
    version: Version,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(stream: W) -> FrameWriter<W> {
        FrameWriter {
            stream: BufWriter::new(stream),
            scratch: BytesMut::with_capacity(4 * 1024),
            version: Version::V10,
        }
    }

    /// Switch header escaping to the negotiated protocol version.
    pub fn set_version(&mut self, version: Version) {
        self.version = version;
    }

    pub fn version(&self) -> Version {
        self.version
    }

    /// Serialize a frame and flush it to the stream.
    pub async fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        self.scratch.clear();
        codec::encode(frame, self.version, &mut self.scratch);
        self.stream.write_all(&self.scratch).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Write a single-LF heart-beat and flush it.
    pub async fn write_heartbeat(&mut self) -> Result<()> {
        self.stream.write_all(b"\n").await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Flush and shut down the write half, signalling EOF to the peer.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.stream.shutdown().await?;
        Ok(())
    }
}
