// ABOUTME: Client connection handle and the coordinator task that owns the byte stream
// ABOUTME: Multiplexes outbound requests, inbound frames, and heart-beat timers over one select loop

use crate::ack::AckMode;
use crate::client::options::{ConnectOptions, SendOptions, SubscribeOptions};
use crate::client::subscription::{Message, Subscription};
use crate::client::transaction::Transaction;
use crate::codec::ReadEvent;
use crate::connection::{FrameReader, FrameWriter};
use crate::errors::{Result, StompError};
use crate::frame::{Command, Frame};
use crate::header;
use crate::id::IdGenerator;
use crate::version::Version;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Capacity of the outbound request queue and of each subscription's
/// delivery channel. Overflow of a delivery channel is treated as fatal
/// backpressure and drops the connection.
const CHANNEL_CAPACITY: usize = 16;

/// Outbound work for the coordinator.
enum Request {
    Frame {
        frame: Frame,
        done: Option<oneshot::Sender<Result<()>>>,
    },
    Subscribe {
        frame: Frame,
        channel: mpsc::Sender<Result<Message>>,
        done: Option<oneshot::Sender<Result<()>>>,
    },
}

/// Events produced by the reader task.
enum Inbound {
    Frame(Frame),
    Heartbeat,
    Closed(Option<StompError>),
}

/// A connection to a STOMP server.
///
/// The handle is cheap to clone; all clones feed the same coordinator task,
/// which owns the write half of the stream and all connection-local state.
/// Once the connection has failed or been disconnected, every operation
/// returns `connection closed`.
///
/// # Example
///
/// ```rust,no_run
/// use stomp::client::{dial, ConnectOptions, SendOptions};
/// use stomp::AckMode;
///
/// # async fn example() -> stomp::Result<()> {
/// let conn = dial("localhost:61613", ConnectOptions::new()).await?;
///
/// let mut sub = conn.subscribe("/queue/orders", AckMode::Client).await?;
/// conn.send("/queue/orders", "text/plain", "hello").await?;
///
/// let message = sub.receive().await?;
/// conn.ack(&message).await?;
/// conn.disconnect().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Connection {
    requests: mpsc::Sender<Request>,
    ids: Arc<IdGenerator>,
    version: Version,
    session: Option<String>,
    server: Option<String>,
}

/// Open a TCP connection to `addr` and perform the STOMP handshake.
///
/// When the options do not name a virtual host, the host portion of `addr`
/// is used.
pub async fn dial(addr: &str, mut options: ConnectOptions) -> Result<Connection> {
    if options.host.is_none() {
        let host = addr.rsplit_once(':').map_or(addr, |(h, _)| h);
        options.host = Some(host.to_string());
    }
    let stream = TcpStream::connect(addr).await?;
    connect(stream, options).await
}

/// Perform the STOMP handshake over an established byte stream and start the
/// connection tasks.
///
/// The stream may be anything implementing `AsyncRead + AsyncWrite` (a TCP
/// socket, a TLS session, an in-memory duplex for tests). The options must
/// include a host name when any version beyond 1.0 is advertised.
pub async fn connect<S>(stream: S, options: ConnectOptions) -> Result<Connection>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let mut reader = FrameReader::new(read_half);
    let mut writer = FrameWriter::new(write_half);

    let send_ms = options.send_interval.as_millis() as u64;
    let recv_ms = options.recv_interval.as_millis() as u64;

    let mut connect_frame = Frame::new(Command::Connect)
        .with_header(header::ACCEPT_VERSION, &options.accept_version_header())
        .with_header(header::HEART_BEAT, &format!("{send_ms},{recv_ms}"));
    match &options.host {
        Some(host) => connect_frame.headers.add(header::HOST, host),
        None => {
            if options.accept_versions.iter().any(|v| *v >= Version::V11) {
                return Err(StompError::MissingHeader(header::HOST));
            }
        }
    }
    if let (Some(login), Some(passcode)) = (&options.login, &options.passcode) {
        connect_frame.headers.add(header::LOGIN, login);
        connect_frame.headers.add(header::PASSCODE, passcode);
    }
    connect_frame.headers.extend_from(&options.headers);

    // The handshake runs at 1.0 framing; CONNECT and CONNECTED are never
    // escape-encoded.
    writer.write_frame(&connect_frame).await?;

    let connected = loop {
        match reader.read().await? {
            Some(ReadEvent::Frame(frame)) => break frame,
            Some(ReadEvent::Heartbeat) => continue,
            None => return Err(StompError::Closed),
        }
    };

    match connected.command {
        Command::Connected => {}
        Command::Error => return Err(StompError::from_error_frame(connected)),
        other => {
            return Err(StompError::UnexpectedFrame {
                expected: "CONNECTED",
                actual: other.to_string(),
            });
        }
    }

    let version = match connected.headers.get(header::VERSION) {
        Some(text) => text.parse::<Version>()?,
        None => Version::V10,
    };
    let session = connected.headers.get(header::SESSION).map(str::to_string);
    let server = connected.headers.get(header::SERVER).map(str::to_string);
    let (sx, sy) = connected.heart_beat()?;

    // Read deadline: the larger of what we asked for and what the server can
    // manage, plus a margin. Zero on either side disables the direction.
    let read_timeout = if recv_ms > 0 && sx > 0 {
        Duration::from_millis(recv_ms.max(u64::from(sx))) + options.heart_beat_error
    } else {
        Duration::ZERO
    };
    let write_interval = if send_ms > 0 && sy > 0 {
        Duration::from_millis(send_ms.max(u64::from(sy)))
    } else {
        Duration::ZERO
    };

    reader.set_version(version);
    writer.set_version(version);

    debug!(%version, ?read_timeout, ?write_interval, "connection established");

    let (request_tx, request_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (inbound_tx, inbound_rx) = mpsc::channel(CHANNEL_CAPACITY);

    tokio::spawn(read_loop(reader, inbound_tx));
    tokio::spawn(
        Coordinator {
            writer,
            inbound: inbound_rx,
            requests: request_rx,
            subscriptions: HashMap::new(),
            waiters: HashMap::new(),
            read_timeout,
            write_interval,
            last_read: Instant::now(),
            last_write: Instant::now(),
        }
        .run(),
    );

    Ok(Connection {
        requests: request_tx,
        ids: Arc::new(IdGenerator::new()),
        version,
        session,
        server,
    })
}

impl Connection {
    /// Negotiated protocol version.
    pub fn version(&self) -> Version {
        self.version
    }

    /// Session identifier assigned by the server, if any.
    pub fn session(&self) -> Option<&str> {
        self.session.as_deref()
    }

    /// Server identification from the CONNECTED frame, if any.
    pub fn server(&self) -> Option<&str> {
        self.server.as_deref()
    }

    /// Send a message to a destination. Completes when the frame has been
    /// written; use [`SendOptions::with_receipt`] to wait for broker
    /// confirmation instead.
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
        let body = body.into();
        let mut frame = Frame::new(Command::Send).with_header(header::DESTINATION, destination);
        if !content_type.is_empty() {
            frame.headers.add(header::CONTENT_TYPE, content_type);
        }
        if !options.suppress_content_length {
            frame
                .headers
                .add(header::CONTENT_LENGTH, &body.len().to_string());
        }
        if let Some(tx) = &options.transaction {
            frame.headers.add(header::TRANSACTION, tx);
        }
        if options.receipt {
            frame.headers.add(header::RECEIPT, &self.ids.next_id());
        }
        frame.headers.extend_from(&options.headers);
        frame.body = body;
        self.request(frame).await
    }

    /// Subscribe to a destination. The subscription id is allocated from the
    /// connection's counter.
    pub async fn subscribe(&self, destination: &str, ack_mode: AckMode) -> Result<Subscription> {
        self.subscribe_with(destination, ack_mode, SubscribeOptions::new())
            .await
    }

    pub async fn subscribe_with(
        &self,
        destination: &str,
        ack_mode: AckMode,
        options: SubscribeOptions,
    ) -> Result<Subscription> {
        let id = self.ids.next_id();
        let mut frame = Frame::new(Command::Subscribe)
            .with_header(header::ID, &id)
            .with_header(header::DESTINATION, destination)
            .with_header(header::ACK, ack_mode.as_str());
        frame.headers.extend_from(&options.headers);

        let (channel, receiver) = mpsc::channel(CHANNEL_CAPACITY);
        let (done_tx, done_rx) = oneshot::channel();
        self.requests
            .send(Request::Subscribe {
                frame,
                channel,
                done: Some(done_tx),
            })
            .await
            .map_err(|_| StompError::Closed)?;
        done_rx.await.map_err(|_| StompError::Closed)??;

        Ok(Subscription::new(
            id,
            destination.to_string(),
            ack_mode,
            self.clone(),
            receiver,
        ))
    }

    /// Acknowledge a received message.
    pub async fn ack(&self, message: &Message) -> Result<()> {
        self.ack_in_tx(message, None).await
    }

    /// Reject a received message; the server requeues it for redelivery.
    /// Requires STOMP 1.1 or later.
    pub async fn nack(&self, message: &Message) -> Result<()> {
        self.nack_in_tx(message, None).await
    }

    pub(crate) async fn ack_in_tx(&self, message: &Message, tx: Option<&str>) -> Result<()> {
        let frame = self.ack_frame(Command::Ack, message, tx)?;
        self.request(frame).await
    }

    pub(crate) async fn nack_in_tx(&self, message: &Message, tx: Option<&str>) -> Result<()> {
        if !self.version.supports_nack() {
            return Err(StompError::NackNotSupported);
        }
        let frame = self.ack_frame(Command::Nack, message, tx)?;
        self.request(frame).await
    }

    /// Start a transaction.
    pub async fn begin(&self) -> Result<Transaction> {
        let id = self.ids.next_id();
        let frame = Frame::new(Command::Begin).with_header(header::TRANSACTION, &id);
        self.request(frame).await?;
        Ok(Transaction::new(id, self.clone()))
    }

    /// Gracefully disconnect: send DISCONNECT with a receipt and wait for the
    /// server's confirmation (or the stream to close).
    pub async fn disconnect(&self) -> Result<()> {
        let receipt = self.ids.next_id();
        let frame = Frame::new(Command::Disconnect).with_header(header::RECEIPT, &receipt);
        match self.request(frame).await {
            Ok(()) => Ok(()),
            // the stream closing out from under DISCONNECT still counts
            Err(StompError::Closed) => Ok(()),
            Err(err) => Err(err),
        }
    }

    pub(crate) async fn send_unsubscribe(&self, id: &str) -> Result<()> {
        // UNSUBSCRIBE always carries a receipt so the coordinator knows when
        // to drop the delivery channel.
        let frame = Frame::new(Command::Unsubscribe)
            .with_header(header::ID, id)
            .with_header(header::RECEIPT, &self.ids.next_id());
        self.request(frame).await
    }

    /// Queue a frame for the coordinator and wait for completion: the write
    /// itself, or the matching RECEIPT when the frame asks for one.
    pub(crate) async fn request(&self, frame: Frame) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.requests
            .send(Request::Frame {
                frame,
                done: Some(done_tx),
            })
            .await
            .map_err(|_| StompError::Closed)?;
        done_rx.await.map_err(|_| StompError::Closed)?
    }

    fn ack_frame(&self, command: Command, message: &Message, tx: Option<&str>) -> Result<Frame> {
        let mut frame = Frame::new(command);
        if self.version >= Version::V12 {
            let id = message.ack_id().ok_or(StompError::NotReceivedMessage)?;
            frame.headers.add(header::ID, id);
        } else {
            let subscription = message
                .subscription_id()
                .ok_or(StompError::NotReceivedMessage)?;
            let message_id = message.message_id().ok_or(StompError::NotReceivedMessage)?;
            frame.headers.add(header::SUBSCRIPTION, subscription);
            frame.headers.add(header::MESSAGE_ID, message_id);
        }
        if let Some(tx) = tx {
            frame.headers.add(header::TRANSACTION, tx);
        }
        Ok(frame)
    }
}

/// Reader task: turns the read half of the stream into a channel of events.
async fn read_loop<R: AsyncRead + Unpin>(mut reader: FrameReader<R>, events: mpsc::Sender<Inbound>) {
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
        if events.send(event).await.is_err() {
            return;
        }
    }
}

/// What a pending receipt resolves to.
struct Waiter {
    done: Option<oneshot::Sender<Result<()>>>,
    /// Subscription id whose delivery channel is dropped when this receipt
    /// arrives (UNSUBSCRIBE cleanup).
    unsubscribe: Option<String>,
    /// This receipt confirms a DISCONNECT; the coordinator stops once it
    /// arrives.
    disconnect: bool,
}

/// Coordinator task: single owner of the write half and of all
/// connection-local state (subscription channels, receipt waiters).
struct Coordinator<W> {
    writer: FrameWriter<W>,
    inbound: mpsc::Receiver<Inbound>,
    requests: mpsc::Receiver<Request>,
    subscriptions: HashMap<String, mpsc::Sender<Result<Message>>>,
    waiters: HashMap<String, Waiter>,
    read_timeout: Duration,
    write_interval: Duration,
    last_read: Instant,
    last_write: Instant,
}

impl<W: AsyncWrite + Unpin> Coordinator<W> {
    async fn run(mut self) {
        let outcome = self.event_loop().await;
        match outcome {
            Ok(()) => self.finish(None),
            Err(err) => {
                debug!(error = %err, "connection terminated");
                self.finish(Some(err));
            }
        }
        let _ = self.writer.shutdown().await;
    }

    async fn event_loop(&mut self) -> Result<()> {
        loop {
            let read_deadline = self.last_read + self.read_timeout;
            let write_deadline = self.last_write + self.write_interval;

            tokio::select! {
                event = self.inbound.recv() => match event {
                    Some(Inbound::Frame(frame)) => {
                        self.last_read = Instant::now();
                        if self.handle_frame(frame).await? {
                            return Ok(());
                        }
                    }
                    Some(Inbound::Heartbeat) => {
                        self.last_read = Instant::now();
                    }
                    Some(Inbound::Closed(err)) => {
                        return Err(err.unwrap_or(StompError::Closed));
                    }
                    None => return Err(StompError::Closed),
                },

                request = self.requests.recv() => match request {
                    Some(request) => self.handle_request(request).await?,
                    // Every handle (and subscription) dropped: nothing can
                    // reach this connection again.
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
            }
        }
    }

    /// Handle a frame from the server. Returns `true` when the connection
    /// should stop (graceful disconnect confirmed).
    async fn handle_frame(&mut self, frame: Frame) -> Result<bool> {
        match frame.command {
            Command::Message => {
                let Some(id) = frame.headers.get(header::SUBSCRIPTION).map(str::to_string) else {
                    debug!("MESSAGE without subscription header dropped");
                    return Ok(false);
                };
                match self.subscriptions.get(&id) {
                    Some(channel) => {
                        let message = Message::from_frame(frame);
                        if let Err(mpsc::error::TrySendError::Full(_)) =
                            channel.try_send(Ok(message))
                        {
                            // The consumer is not keeping up; a stalled
                            // delivery channel stalls the whole connection,
                            // so fail fast instead.
                            warn!(subscription = %id, "delivery channel full, dropping connection");
                            return Err(StompError::WriteChannelFull);
                        }
                    }
                    None => debug!(subscription = %id, "MESSAGE for unknown subscription dropped"),
                }
                Ok(false)
            }

            Command::Receipt => {
                // validated: receipt-id is present
                let id = frame.headers.get(header::RECEIPT_ID).unwrap_or_default();
                match self.waiters.remove(id) {
                    Some(mut waiter) => {
                        if let Some(sub_id) = waiter.unsubscribe.take() {
                            self.subscriptions.remove(&sub_id);
                        }
                        if let Some(done) = waiter.done.take() {
                            let _ = done.send(Ok(()));
                        }
                        Ok(waiter.disconnect)
                    }
                    None => {
                        debug!(receipt = %id, "unmatched RECEIPT dropped");
                        Ok(false)
                    }
                }
            }

            Command::Error => Err(StompError::from_error_frame(frame)),

            other => {
                debug!(command = %other, "unexpected frame from server dropped");
                Ok(false)
            }
        }
    }

    async fn handle_request(&mut self, request: Request) -> Result<()> {
        let (frame, mut done) = match request {
            Request::Subscribe {
                frame,
                channel,
                done,
            } => {
                // Register before writing so an immediate MESSAGE is
                // routable.
                if let Some(id) = frame.headers.get(header::ID) {
                    self.subscriptions.insert(id.to_string(), channel);
                }
                (frame, done)
            }
            Request::Frame { frame, done } => (frame, done),
        };

        let receipt = frame.headers.get(header::RECEIPT).map(str::to_string);
        if let Some(receipt_id) = &receipt {
            let unsubscribe = (frame.command == Command::Unsubscribe)
                .then(|| frame.headers.get(header::ID).unwrap_or_default().to_string());
            self.waiters.insert(
                receipt_id.clone(),
                Waiter {
                    done: done.take(),
                    unsubscribe,
                    disconnect: frame.command == Command::Disconnect,
                },
            );
        }

        match self.writer.write_frame(&frame).await {
            Ok(()) => {
                self.last_write = Instant::now();
                if let Some(done) = done {
                    let _ = done.send(Ok(()));
                }
                Ok(())
            }
            Err(err) => {
                // the waiter (if registered) is resolved by finish()
                if let Some(done) = done {
                    let _ = done.send(Err(err.clone()));
                }
                Err(err)
            }
        }
    }

    /// Resolve every outstanding waiter and subscription. With an error, the
    /// error is broadcast; on clean shutdown the channels simply close.
    fn finish(&mut self, err: Option<StompError>) {
        for (_, mut waiter) in self.waiters.drain() {
            if let Some(done) = waiter.done.take() {
                let _ = done.send(match &err {
                    Some(err) => Err(err.clone()),
                    None => Err(StompError::Closed),
                });
            }
        }
        for (_, channel) in self.subscriptions.drain() {
            if let Some(err) = &err {
                let _ = channel.try_send(Err(err.clone()));
            }
        }
    }
}
