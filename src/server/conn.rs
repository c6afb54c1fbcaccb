// ABOUTME: Per-connection actor: reader task plus a processor loop owning the write half
// ABOUTME: Implements the server-side session state machine, receipts, transactions, heart-beats

use crate::codec::ReadEvent;
use crate::connection::{FrameReader, FrameWriter};
use crate::errors::{Result, StompError};
use crate::frame::{Command, Frame};
use crate::header;
use crate::server::broker::Request;
use crate::server::txstore::TxStore;
use crate::server::ServerConfig;
use crate::version::Version;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Maximum number of frames queued towards a client before the connection is
/// dropped. A client that cannot keep up must not make the server buffer
/// indefinitely.
const MAX_PENDING_WRITES: usize = 16;

/// Maximum number of parsed inbound frames buffered before the reader task
/// blocks.
const MAX_PENDING_READS: usize = 16;

/// Handle the broker uses to push frames to a connection.
///
/// Pushes never block: a full queue closes the connection instead, which is
/// the backpressure contract for slow consumers.
#[derive(Debug, Clone)]
pub(crate) struct ConnHandle {
    id: u64,
    frames: mpsc::Sender<Frame>,
    closed: Arc<Notify>,
}

impl ConnHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Queue a frame for the connection. Returns false when the connection
    /// is gone or was closed because the queue overflowed.
    pub fn push(&self, frame: Frame) -> bool {
        match self.frames.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(conn = self.id, "write queue full, closing connection");
                self.close();
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Ask the connection actor to shut down.
    pub fn close(&self) {
        self.closed.notify_one();
    }

    #[cfg(test)]
    pub(crate) fn new_for_test(id: u64) -> (ConnHandle, mpsc::Receiver<Frame>) {
        let (frames, rx) = mpsc::channel(MAX_PENDING_WRITES);
        (
            ConnHandle {
                id,
                frames,
                closed: Arc::new(Notify::new()),
            },
            rx,
        )
    }
}

enum Inbound {
    Frame(Frame),
    Heartbeat,
    Closed(Option<StompError>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Connecting,
    Connected,
    Closed,
}

/// Start the two tasks serving one accepted byte stream and return the
/// handle the broker will push frames through.
pub(crate) fn spawn<S>(
    id: u64,
    stream: S,
    config: Arc<ServerConfig>,
    broker: mpsc::Sender<Request>,
) -> ConnHandle
where
    S: AsyncRead + AsyncWrite + Send + Sync + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let mut reader = FrameReader::new(read_half);
    reader.set_max_frame_size(config.max_frame_size);
    let writer = FrameWriter::new(write_half);

    let (version_tx, version_rx) = watch::channel(Version::V10);
    // The processor publishes the negotiated version before it writes
    // CONNECTED; the reader re-samples the watch before every decode, so the
    // first post-handshake frame already gets the negotiated unescaping.
    reader.watch_version(version_rx);
    let (frame_tx, frame_rx) = mpsc::channel(MAX_PENDING_WRITES);
    let (event_tx, event_rx) = mpsc::channel(MAX_PENDING_READS);
    let closed = Arc::new(Notify::new());

    let handle = ConnHandle {
        id,
        frames: frame_tx,
        closed: Arc::clone(&closed),
    };

    tokio::spawn(read_loop(reader, event_tx));
    tokio::spawn(
        Conn {
            id,
            config,
            writer,
            state: SessionState::Connecting,
            version: Version::V10,
            version_tx,
            read_timeout: Duration::ZERO,
            write_interval: Duration::ZERO,
            tx_store: TxStore::new(),
            broker,
            handle: handle.clone(),
            frames: frame_rx,
            events: event_rx,
            closed,
            last_read: Instant::now(),
            last_write: Instant::now(),
        }
        .process_loop(),
    );

    handle
}

/// Reader task. The reader itself tracks the negotiated version through its
/// watch channel, so header unescaping switches on as soon as CONNECTED is
/// decided.
async fn read_loop<R: AsyncRead + Unpin>(
    mut reader: FrameReader<R>,
    events: mpsc::Sender<Inbound>,
) {
    loop {
        let event = match reader.read().await {
            Ok(Some(ReadEvent::Frame(frame))) => Inbound::Frame(frame),
            Ok(Some(ReadEvent::Heartbeat)) => Inbound::Heartbeat,
            Ok(None) => {
                let _ = events.send(Inbound::Closed(None)).await;
                return;
            }
            Err(err) => {
                let _ = events.send(Inbound::Closed(Some(err))).await;
                return;
            }
        };
        // Blocks when the processor falls behind; that is the reader-side
        // backpressure.
        if events.send(event).await.is_err() {
            return;
        }
    }
}

/// Processor task for one connection. Owns the write half and every piece of
/// connection-local state; nothing else touches them.
struct Conn<W> {
    id: u64,
    config: Arc<ServerConfig>,
    writer: FrameWriter<W>,
    state: SessionState,
    version: Version,
    version_tx: watch::Sender<Version>,
    read_timeout: Duration,
    write_interval: Duration,
    tx_store: TxStore,
    broker: mpsc::Sender<Request>,
    handle: ConnHandle,
    frames: mpsc::Receiver<Frame>,
    events: mpsc::Receiver<Inbound>,
    closed: Arc<Notify>,
    last_read: Instant,
    last_write: Instant,
}

impl<W: AsyncWrite + Unpin> Conn<W> {
    async fn process_loop(mut self) {
        match self.event_loop().await {
            Ok(()) => info!(conn = self.id, "connection closed"),
            Err(err) => info!(conn = self.id, error = %err, "connection terminated"),
        }
        // Open transactions die with the connection, without replay.
        let _ = self
            .broker
            .send(Request::Disconnect { conn_id: self.id })
            .await;
        let _ = self.writer.shutdown().await;
    }

    async fn event_loop(&mut self) -> Result<()> {
        loop {
            let read_deadline = self.last_read + self.read_timeout;
            let write_deadline = self.last_write + self.write_interval;

            tokio::select! {
                frame = self.frames.recv() => match frame {
                    Some(frame) => {
                        let fatal = frame.command == Command::Error;
                        self.writer.write_frame(&frame).await?;
                        self.last_write = Instant::now();
                        if fatal {
                            // an ERROR frame always ends the session
                            self.state = SessionState::Closed;
                            return Ok(());
                        }
                    }
                    None => return Ok(()),
                },

                event = self.events.recv() => match event {
                    Some(Inbound::Frame(frame)) => {
                        self.last_read = Instant::now();
                        let receipt = frame.headers.get(header::RECEIPT).map(str::to_string);
                        if let Err(err) = self.process_frame(frame).await {
                            self.send_error_and_close(&err, receipt).await;
                            return Ok(());
                        }
                        if self.state == SessionState::Closed {
                            return Ok(());
                        }
                    }
                    Some(Inbound::Heartbeat) => {
                        self.last_read = Instant::now();
                    }
                    Some(Inbound::Closed(err)) => {
                        return match err {
                            None => Ok(()),
                            Some(err) => Err(err),
                        };
                    }
                    None => return Ok(()),
                },

                _ = tokio::time::sleep_until(read_deadline),
                        if self.read_timeout > Duration::ZERO => {
                    return Err(StompError::ReadTimeout);
                }

                _ = tokio::time::sleep_until(write_deadline),
                        if self.write_interval > Duration::ZERO => {
                    self.writer.write_heartbeat().await?;
                    self.last_write = Instant::now();
                }

                _ = self.closed.notified() => {
                    return Err(StompError::WriteChannelFull);
                }
            }
        }
    }

    async fn process_frame(&mut self, frame: Frame) -> Result<()> {
        frame.validate(self.version)?;
        match self.state {
            SessionState::Connecting => match frame.command {
                Command::Connect | Command::Stomp => self.handle_connect(frame).await,
                _ => Err(StompError::NotConnected),
            },
            SessionState::Connected => self.dispatch_connected(frame).await,
            SessionState::Closed => Ok(()),
        }
    }

    async fn dispatch_connected(&mut self, frame: Frame) -> Result<()> {
        match frame.command {
            Command::Send => self.handle_send(frame).await,
            Command::Subscribe => self.handle_subscribe(frame).await,
            Command::Unsubscribe => self.handle_unsubscribe(frame).await,
            Command::Ack | Command::Nack => self.handle_ack_nack(frame).await,
            Command::Begin => self.handle_begin(frame).await,
            Command::Commit => self.handle_commit(frame).await,
            Command::Abort => self.handle_abort(frame).await,
            Command::Disconnect => self.handle_disconnect(frame).await,
            // server-originated commands, or a second CONNECT
            Command::Connect
            | Command::Stomp
            | Command::Connected
            | Command::Message
            | Command::Receipt
            | Command::Error => Err(StompError::UnexpectedCommand(frame.command.as_str())),
        }
    }

    async fn handle_connect(&mut self, frame: Frame) -> Result<()> {
        if let Some(authenticator) = &self.config.authenticator {
            let login = frame.headers.get(header::LOGIN);
            let passcode = frame.headers.get(header::PASSCODE);
            if !authenticator.authenticate(login, passcode) {
                // slow down credential guessing
                tokio::time::sleep(Duration::from_secs(1)).await;
                return Err(StompError::AuthenticationFailed);
            }
        }

        let version = frame.negotiated_version()?;
        let (mut cx, mut cy) = frame.heart_beat()?;

        // The server insists on its configured minimum period; a client
        // asking for faster heart-beats gets the slower value.
        let min = self.config.heart_beat_min.as_millis() as u32;
        if cx > 0 && cx < min {
            cx = min;
        }
        if cy > 0 && cy < min {
            cy = min;
        }
        self.read_timeout = Duration::from_millis(u64::from(cx));
        self.write_interval = Duration::from_millis(u64::from(cy));

        self.version = version;
        let _ = self.version_tx.send(version);
        self.writer.set_version(version);

        // The heart-beat header goes out even to 1.0 clients; they ignore it.
        let session = self.id.to_string();
        let connected = Frame::new(Command::Connected)
            .with_header(header::VERSION, version.as_str())
            .with_header(header::SERVER, &self.config.server_id)
            .with_header(header::SESSION, &session)
            .with_header(header::HEART_BEAT, &format!("{cy},{cx}"));
        self.writer.write_frame(&connected).await?;
        self.last_write = Instant::now();
        self.last_read = Instant::now();
        self.state = SessionState::Connected;

        debug!(conn = self.id, %version, heart_beat = %format!("{cx},{cy}"), "session connected");
        Ok(())
    }

    async fn handle_send(&mut self, mut frame: Frame) -> Result<()> {
        self.send_receipt(&mut frame).await?;
        match frame.headers.remove(header::TRANSACTION) {
            // buffered copy carries neither transaction nor receipt header,
            // so commit can replay it straight through this handler
            Some(tx) => self.tx_store.add(&tx, frame),
            None => self.to_broker(Request::Send { frame }).await,
        }
    }

    async fn handle_subscribe(&mut self, mut frame: Frame) -> Result<()> {
        let receipt = self.send_receipt(&mut frame).await?;
        self.to_broker(Request::Subscribe {
            conn: self.handle.clone(),
            version: self.version,
            frame,
            receipt,
        })
        .await
    }

    async fn handle_unsubscribe(&mut self, mut frame: Frame) -> Result<()> {
        let receipt = self.send_receipt(&mut frame).await?;
        self.to_broker(Request::Unsubscribe {
            conn: self.handle.clone(),
            frame,
            receipt,
        })
        .await
    }

    async fn handle_ack_nack(&mut self, mut frame: Frame) -> Result<()> {
        let receipt = self.send_receipt(&mut frame).await?;
        if let Some(tx) = frame.headers.remove(header::TRANSACTION) {
            return self.tx_store.add(&tx, frame);
        }
        let conn = self.handle.clone();
        let request = match frame.command {
            Command::Ack => Request::Ack {
                conn,
                frame,
                receipt,
            },
            _ => Request::Nack {
                conn,
                frame,
                receipt,
            },
        };
        self.to_broker(request).await
    }

    async fn handle_begin(&mut self, mut frame: Frame) -> Result<()> {
        self.send_receipt(&mut frame).await?;
        // validated: transaction is present
        let tx = frame.headers.get(header::TRANSACTION).unwrap_or_default();
        self.tx_store.begin(tx)
    }

    async fn handle_commit(&mut self, mut frame: Frame) -> Result<()> {
        self.send_receipt(&mut frame).await?;
        let tx = frame
            .headers
            .get(header::TRANSACTION)
            .unwrap_or_default()
            .to_string();
        // Replay in arrival order. Only SEND/ACK/NACK ever get buffered.
        for buffered in self.tx_store.commit(&tx)? {
            match buffered.command {
                Command::Send => self.handle_send(buffered).await?,
                Command::Ack | Command::Nack => self.handle_ack_nack(buffered).await?,
                other => debug!(conn = self.id, command = %other, "unexpected frame in transaction"),
            }
        }
        Ok(())
    }

    async fn handle_abort(&mut self, mut frame: Frame) -> Result<()> {
        self.send_receipt(&mut frame).await?;
        let tx = frame.headers.get(header::TRANSACTION).unwrap_or_default();
        self.tx_store.abort(tx)
    }

    async fn handle_disconnect(&mut self, mut frame: Frame) -> Result<()> {
        // After DISCONNECT nothing more is sent to the client except the
        // requested receipt; ignore a write failure since we are closing
        // anyway.
        let _ = self.send_receipt(&mut frame).await;
        self.state = SessionState::Closed;
        Ok(())
    }

    /// Answer a `receipt` header with an immediate RECEIPT frame, removing
    /// the header from the frame. Stripping matters for transactions: the
    /// buffered copy must not trigger a second receipt on replay.
    ///
    /// Returns the receipt id that was answered so requests forwarded to the
    /// broker can still correlate a later ERROR with it.
    async fn send_receipt(&mut self, frame: &mut Frame) -> Result<Option<String>> {
        if let Some(receipt) = frame.headers.remove(header::RECEIPT) {
            let receipt_frame =
                Frame::new(Command::Receipt).with_header(header::RECEIPT_ID, &receipt);
            self.writer.write_frame(&receipt_frame).await?;
            self.last_write = Instant::now();
            return Ok(Some(receipt));
        }
        Ok(None)
    }

    /// Report a protocol error to the client and end the session. The ERROR
    /// frame names the receipt of the offending frame when it carried one.
    async fn send_error_and_close(&mut self, err: &StompError, receipt: Option<String>) {
        info!(conn = self.id, error = %err, "closing connection on protocol error");
        let mut frame = Frame::new(Command::Error).with_header(header::MESSAGE, &err.to_string());
        if let Some(receipt) = receipt {
            frame.headers.add(header::RECEIPT_ID, &receipt);
        }
        let _ = self.writer.write_frame(&frame).await;
        self.state = SessionState::Closed;
    }

    async fn to_broker(&self, request: Request) -> Result<()> {
        self.broker
            .send(request)
            .await
            .map_err(|_| StompError::Closed)
    }
}
