//! End-to-end tests: a real broker on a loopback listener, exercised through
//! raw frames and through the client API.

use crate::ack::AckMode;
use crate::client::{connect, dial, ConnectOptions, SendOptions};
use crate::codec::ReadEvent;
use crate::connection::{FrameReader, FrameWriter};
use crate::errors::StompError;
use crate::frame::{Command, Frame};
use crate::header;
use crate::server::{Authenticator, Server, ServerConfig};
use crate::version::Version;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);
const SHOULD_NOT_ARRIVE: Duration = Duration::from_millis(200);

async fn start_server() -> SocketAddr {
    start_server_with(ServerConfig::default()).await
}

async fn start_server_with(config: ServerConfig) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(Server::new(config).serve(listener));
    addr
}

async fn read_frame<R: AsyncRead + Unpin>(reader: &mut FrameReader<R>) -> Frame {
    match timeout(WAIT, reader.read()).await.unwrap().unwrap() {
        Some(ReadEvent::Frame(frame)) => frame,
        other => panic!("expected a frame, got {other:?}"),
    }
}

/// Open a raw socket and run the CONNECT handshake, returning the frame pair
/// plus the CONNECTED frame.
async fn raw_session(
    addr: SocketAddr,
    connect_frame: Frame,
) -> (FrameReader<OwnedReadHalf>, FrameWriter<OwnedWriteHalf>, Frame) {
    let stream = TcpStream::connect(addr).await.unwrap();
    let (read_half, write_half) = stream.into_split();
    let mut reader = FrameReader::new(read_half);
    let mut writer = FrameWriter::new(write_half);

    writer.write_frame(&connect_frame).await.unwrap();
    let connected = read_frame(&mut reader).await;
    assert_eq!(connected.command, Command::Connected);

    if let Some(version) = connected.headers.get(header::VERSION) {
        let version: Version = version.parse().unwrap();
        reader.set_version(version);
        writer.set_version(version);
    }
    (reader, writer, connected)
}

fn connect_12() -> Frame {
    Frame::new(Command::Connect)
        .with_header(header::ACCEPT_VERSION, "1.2,1.1,1.0")
        .with_header(header::HOST, "localhost")
}

#[tokio::test]
async fn connect_negotiates_and_disconnect_gets_receipt() {
    let addr = start_server().await;
    let (mut reader, mut writer, connected) = raw_session(addr, connect_12()).await;

    assert_eq!(connected.headers.get(header::VERSION), Some("1.2"));
    assert!(connected.headers.get(header::SERVER).is_some());
    assert!(connected.headers.get(header::SESSION).is_some());
    // no heart-beats requested, none granted
    assert_eq!(connected.headers.get(header::HEART_BEAT), Some("0,0"));

    let disconnect = Frame::new(Command::Disconnect).with_header(header::RECEIPT, "77");
    writer.write_frame(&disconnect).await.unwrap();

    let receipt = read_frame(&mut reader).await;
    assert_eq!(receipt.command, Command::Receipt);
    assert_eq!(receipt.headers.get(header::RECEIPT_ID), Some("77"));

    // then the server closes the stream
    assert!(timeout(WAIT, reader.read()).await.unwrap().unwrap().is_none());
}

#[tokio::test]
async fn first_frame_must_be_connect() {
    let addr = start_server().await;
    let stream = TcpStream::connect(addr).await.unwrap();
    let (read_half, write_half) = stream.into_split();
    let mut reader = FrameReader::new(read_half);
    let mut writer = FrameWriter::new(write_half);

    let send = Frame::new(Command::Send).with_header(header::DESTINATION, "/queue/q");
    writer.write_frame(&send).await.unwrap();

    let error = read_frame(&mut reader).await;
    assert_eq!(error.command, Command::Error);
    assert_eq!(
        error.headers.get(header::MESSAGE),
        Some("expected CONNECT or STOMP frame")
    );
    assert!(timeout(WAIT, reader.read()).await.unwrap().unwrap().is_none());
}

#[tokio::test]
async fn stomp_command_is_a_connect_alias() {
    let addr = start_server().await;
    let stomp = Frame::new(Command::Stomp)
        .with_header(header::ACCEPT_VERSION, "1.1")
        .with_header(header::HOST, "localhost");
    let (_reader, _writer, connected) = raw_session(addr, stomp).await;
    assert_eq!(connected.headers.get(header::VERSION), Some("1.1"));
}

#[tokio::test]
async fn send_is_buffered_until_a_subscriber_arrives() {
    let addr = start_server().await;
    let conn = dial(&addr.to_string(), ConnectOptions::new()).await.unwrap();

    conn.send_with(
        "/queue/q",
        "text/plain",
        "hi",
        SendOptions::new().with_receipt(),
    )
    .await
    .unwrap();

    // subscribing afterwards triggers delivery of the buffered message
    let mut sub = conn.subscribe("/queue/q", AckMode::Auto).await.unwrap();
    let message = timeout(WAIT, sub.receive()).await.unwrap().unwrap();
    assert_eq!(&message.body[..], b"hi");
    assert_eq!(message.destination, "/queue/q");
    assert_eq!(message.content_type.as_deref(), Some("text/plain"));
    assert_eq!(message.subscription_id(), Some(sub.id()));
    assert!(message.message_id().is_some());

    conn.disconnect().await.unwrap();
}

#[tokio::test]
async fn client_ack_frees_the_next_message() {
    let addr = start_server().await;
    let conn = dial(&addr.to_string(), ConnectOptions::new()).await.unwrap();
    let mut sub = conn.subscribe("/queue/q", AckMode::Client).await.unwrap();

    conn.send("/queue/q", "", "one").await.unwrap();
    conn.send("/queue/q", "", "two").await.unwrap();

    let first = timeout(WAIT, sub.receive()).await.unwrap().unwrap();
    assert_eq!(&first.body[..], b"one");

    // the second message is held back until the first is acknowledged
    assert!(timeout(SHOULD_NOT_ARRIVE, sub.receive()).await.is_err());

    conn.ack(&first).await.unwrap();
    let second = timeout(WAIT, sub.receive()).await.unwrap().unwrap();
    assert_eq!(&second.body[..], b"two");

    conn.disconnect().await.unwrap();
}

#[tokio::test]
async fn nack_returns_the_message_to_the_queue_head() {
    let addr = start_server().await;
    let conn = dial(&addr.to_string(), ConnectOptions::new()).await.unwrap();
    let mut sub = conn
        .subscribe("/queue/q", AckMode::ClientIndividual)
        .await
        .unwrap();

    conn.send("/queue/q", "", "first").await.unwrap();
    conn.send("/queue/q", "", "second").await.unwrap();

    let message = timeout(WAIT, sub.receive()).await.unwrap().unwrap();
    assert_eq!(&message.body[..], b"first");

    conn.nack(&message).await.unwrap();

    // redelivered ahead of the pending message
    let redelivered = timeout(WAIT, sub.receive()).await.unwrap().unwrap();
    assert_eq!(&redelivered.body[..], b"first");
    assert_eq!(redelivered.message_id(), message.message_id());

    conn.disconnect().await.unwrap();
}

#[tokio::test]
async fn unsubscribe_moves_in_flight_to_another_subscriber() {
    let addr = start_server().await;
    let conn_a = dial(&addr.to_string(), ConnectOptions::new()).await.unwrap();
    let conn_b = dial(&addr.to_string(), ConnectOptions::new()).await.unwrap();

    let mut sub_a = conn_a.subscribe("/queue/q", AckMode::Client).await.unwrap();
    let message = {
        conn_a.send("/queue/q", "", "payload").await.unwrap();
        timeout(WAIT, sub_a.receive()).await.unwrap().unwrap()
    };
    assert_eq!(&message.body[..], b"payload");

    // second subscriber sees nothing while the message is in flight
    let mut sub_b = conn_b.subscribe("/queue/q", AckMode::Client).await.unwrap();
    assert!(timeout(SHOULD_NOT_ARRIVE, sub_b.receive()).await.is_err());

    sub_a.unsubscribe().await.unwrap();
    let moved = timeout(WAIT, sub_b.receive()).await.unwrap().unwrap();
    assert_eq!(&moved.body[..], b"payload");
    assert_eq!(moved.subscription_id(), Some(sub_b.id()));

    conn_a.disconnect().await.unwrap();
    conn_b.disconnect().await.unwrap();
}

#[tokio::test]
async fn disconnect_requeues_in_flight_messages() {
    let addr = start_server().await;
    let conn_a = dial(&addr.to_string(), ConnectOptions::new()).await.unwrap();
    let conn_b = dial(&addr.to_string(), ConnectOptions::new()).await.unwrap();

    let mut sub_a = conn_a.subscribe("/queue/q", AckMode::Client).await.unwrap();
    conn_a.send("/queue/q", "", "payload").await.unwrap();
    let _held = timeout(WAIT, sub_a.receive()).await.unwrap().unwrap();

    conn_a.disconnect().await.unwrap();

    let mut sub_b = conn_b.subscribe("/queue/q", AckMode::Auto).await.unwrap();
    let moved = timeout(WAIT, sub_b.receive()).await.unwrap().unwrap();
    assert_eq!(&moved.body[..], b"payload");

    conn_b.disconnect().await.unwrap();
}

#[tokio::test]
async fn topics_broadcast_to_every_subscriber() {
    let addr = start_server().await;
    let conn = dial(&addr.to_string(), ConnectOptions::new()).await.unwrap();

    let mut subs = Vec::new();
    for _ in 0..3 {
        subs.push(conn.subscribe("/topic/news", AckMode::Auto).await.unwrap());
    }

    conn.send("/topic/news", "text/plain", "flash").await.unwrap();

    for sub in &mut subs {
        let message = timeout(WAIT, sub.receive()).await.unwrap().unwrap();
        assert_eq!(&message.body[..], b"flash");
        assert_eq!(message.subscription_id(), Some(sub.id()));
    }

    conn.disconnect().await.unwrap();
}

#[tokio::test]
async fn transaction_commit_releases_sends_in_order() {
    let addr = start_server().await;
    let conn = dial(&addr.to_string(), ConnectOptions::new()).await.unwrap();
    let mut sub = conn.subscribe("/queue/tx", AckMode::Auto).await.unwrap();

    let mut tx = conn.begin().await.unwrap();
    tx.send("/queue/tx", "", "one").await.unwrap();
    tx.send("/queue/tx", "", "two").await.unwrap();

    // nothing visible before COMMIT
    assert!(timeout(SHOULD_NOT_ARRIVE, sub.receive()).await.is_err());

    tx.commit().await.unwrap();
    let first = timeout(WAIT, sub.receive()).await.unwrap().unwrap();
    let second = timeout(WAIT, sub.receive()).await.unwrap().unwrap();
    assert_eq!(&first.body[..], b"one");
    assert_eq!(&second.body[..], b"two");

    // completed transactions reject further work
    assert!(matches!(
        tx.send("/queue/tx", "", "three").await,
        Err(StompError::CompletedTransaction)
    ));

    conn.disconnect().await.unwrap();
}

#[tokio::test]
async fn transaction_abort_discards_sends() {
    let addr = start_server().await;
    let conn = dial(&addr.to_string(), ConnectOptions::new()).await.unwrap();
    let mut sub = conn.subscribe("/queue/tx", AckMode::Auto).await.unwrap();

    let mut tx = conn.begin().await.unwrap();
    tx.send("/queue/tx", "", "doomed").await.unwrap();
    tx.abort().await.unwrap();

    assert!(timeout(SHOULD_NOT_ARRIVE, sub.receive()).await.is_err());
    conn.disconnect().await.unwrap();
}

#[tokio::test]
async fn duplicate_begin_is_a_protocol_error() {
    let addr = start_server().await;
    let (mut reader, mut writer, _) = raw_session(addr, connect_12()).await;

    let begin = Frame::new(Command::Begin).with_header(header::TRANSACTION, "t1");
    writer.write_frame(&begin).await.unwrap();
    writer.write_frame(&begin).await.unwrap();

    let error = read_frame(&mut reader).await;
    assert_eq!(error.command, Command::Error);
    assert_eq!(
        error.headers.get(header::MESSAGE),
        Some("transaction already in progress")
    );
}

#[tokio::test]
async fn escaped_headers_survive_the_round_trip() {
    let addr = start_server().await;
    let conn = dial(&addr.to_string(), ConnectOptions::new()).await.unwrap();
    assert_eq!(conn.version(), Version::V12);

    let mut sub = conn.subscribe("/queue/esc", AckMode::Auto).await.unwrap();
    conn.send_with(
        "/queue/esc",
        "",
        "x",
        SendOptions::new().with_header("k", "a:b"),
    )
    .await
    .unwrap();

    let message = timeout(WAIT, sub.receive()).await.unwrap().unwrap();
    assert_eq!(message.headers.get("k"), Some("a:b"));

    conn.disconnect().await.unwrap();
}

#[tokio::test]
async fn heart_beats_flow_when_negotiated() {
    let config = ServerConfig {
        heart_beat_min: Duration::from_millis(10),
        ..ServerConfig::default()
    };
    let addr = start_server_with(config).await;

    let connect_frame = connect_12().with_header(header::HEART_BEAT, "300,100");
    let (mut reader, mut writer, connected) = raw_session(addr, connect_frame).await;
    assert_eq!(connected.headers.get(header::HEART_BEAT), Some("100,300"));

    // keep our side alive while waiting for the server's keep-alive LF
    let keeper = tokio::spawn(async move {
        for _ in 0..10 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            if writer.write_heartbeat().await.is_err() {
                return;
            }
        }
    });

    let event = timeout(WAIT, reader.read()).await.unwrap().unwrap();
    assert!(matches!(event, Some(ReadEvent::Heartbeat)));
    keeper.abort();
}

#[tokio::test]
async fn failed_authentication_is_rejected() {
    fn check(login: Option<&str>, passcode: Option<&str>) -> bool {
        login == Some("guest") && passcode == Some("secret")
    }
    let config = ServerConfig {
        authenticator: Some(Arc::new(check) as Arc<dyn Authenticator>),
        ..ServerConfig::default()
    };
    let addr = start_server_with(config).await;

    let ok = dial(
        &addr.to_string(),
        ConnectOptions::new().with_login("guest", "secret"),
    )
    .await;
    assert!(ok.is_ok());

    let err = dial(
        &addr.to_string(),
        ConnectOptions::new().with_login("guest", "wrong"),
    )
    .await
    .unwrap_err();
    match err {
        StompError::RemoteError { message, .. } => {
            assert_eq!(message, "authentication failed");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn ten_messages_round_robin_across_three_subscribers() {
    let addr = start_server().await;

    let mut conns = Vec::new();
    let mut subs = Vec::new();
    for _ in 0..3 {
        let conn = dial(&addr.to_string(), ConnectOptions::new()).await.unwrap();
        subs.push(conn.subscribe("/queue/rr", AckMode::Client).await.unwrap());
        conns.push(conn);
    }

    let producer = dial(&addr.to_string(), ConnectOptions::new()).await.unwrap();
    for i in 0..10 {
        producer
            .send("/queue/rr", "", format!("m{i}"))
            .await
            .unwrap();
    }

    // each subscriber holds exactly one un-ACKed message
    let first = timeout(WAIT, subs[0].receive()).await.unwrap().unwrap();
    let second = timeout(WAIT, subs[1].receive()).await.unwrap().unwrap();
    let third = timeout(WAIT, subs[2].receive()).await.unwrap().unwrap();
    assert_eq!(&first.body[..], b"m0");
    assert_eq!(&second.body[..], b"m1");
    assert_eq!(&third.body[..], b"m2");
    assert!(timeout(SHOULD_NOT_ARRIVE, subs[0].receive()).await.is_err());

    // only the second subscriber acknowledges; it drains the backlog alone
    conns[1].ack(&second).await.unwrap();
    for i in 3..10 {
        let next = timeout(WAIT, subs[1].receive()).await.unwrap().unwrap();
        assert_eq!(next.body, format!("m{i}"));
        conns[1].ack(&next).await.unwrap();
    }
    assert_eq!(subs[1].messages_received(), 8);
    assert!(timeout(SHOULD_NOT_ARRIVE, subs[1].receive()).await.is_err());

    // the other two still hold their single in-flight message
    assert_eq!(subs[0].messages_received(), 1);
    assert_eq!(subs[2].messages_received(), 1);

    for conn in &conns {
        conn.disconnect().await.unwrap();
    }
    producer.disconnect().await.unwrap();
}

#[tokio::test]
async fn v11_client_acks_with_subscription_and_message_id() {
    let addr = start_server().await;
    let conn = dial(
        &addr.to_string(),
        ConnectOptions::new().with_accept_versions(&[Version::V10, Version::V11]),
    )
    .await
    .unwrap();
    assert_eq!(conn.version(), Version::V11);

    let mut sub = conn.subscribe("/queue/old", AckMode::Client).await.unwrap();
    conn.send("/queue/old", "", "one").await.unwrap();
    conn.send("/queue/old", "", "two").await.unwrap();

    let first = timeout(WAIT, sub.receive()).await.unwrap().unwrap();
    // 1.1 delivery has no ack header; the old ACK form must still resolve
    assert!(first.headers.get(header::ACK).is_none());
    conn.ack(&first).await.unwrap();

    let second = timeout(WAIT, sub.receive()).await.unwrap().unwrap();
    assert_eq!(&second.body[..], b"two");

    conn.disconnect().await.unwrap();
}

#[tokio::test]
async fn silent_client_is_dropped_after_read_timeout() {
    let config = ServerConfig {
        heart_beat_min: Duration::from_millis(10),
        ..ServerConfig::default()
    };
    let addr = start_server_with(config).await;

    // the client promises a frame or heart-beat every 50ms, then goes silent
    let connect_frame = connect_12().with_header(header::HEART_BEAT, "50,0");
    let (mut reader, _writer, connected) = raw_session(addr, connect_frame).await;
    assert_eq!(connected.headers.get(header::HEART_BEAT), Some("0,50"));

    // a stream error terminates the connection without an ERROR frame
    let event = timeout(WAIT, reader.read()).await.unwrap().unwrap();
    assert!(event.is_none());
}

#[tokio::test]
async fn error_carries_receipt_id_of_offending_frame() {
    let addr = start_server().await;
    let (mut reader, mut writer, _) = raw_session(addr, connect_12()).await;

    let begin = Frame::new(Command::Begin).with_header(header::TRANSACTION, "t1");
    writer.write_frame(&begin).await.unwrap();

    let duplicate = Frame::new(Command::Begin)
        .with_header(header::TRANSACTION, "t1")
        .with_header(header::RECEIPT, "9");
    writer.write_frame(&duplicate).await.unwrap();

    // the receipt is answered first, then the ERROR names it again
    let receipt = read_frame(&mut reader).await;
    assert_eq!(receipt.command, Command::Receipt);
    assert_eq!(receipt.headers.get(header::RECEIPT_ID), Some("9"));

    let error = read_frame(&mut reader).await;
    assert_eq!(error.command, Command::Error);
    assert_eq!(
        error.headers.get(header::MESSAGE),
        Some("transaction already in progress")
    );
    assert_eq!(error.headers.get(header::RECEIPT_ID), Some("9"));
}

#[tokio::test]
async fn ack_inside_transaction_applies_on_commit() {
    let addr = start_server().await;
    let conn = dial(&addr.to_string(), ConnectOptions::new()).await.unwrap();
    let mut sub = conn.subscribe("/queue/txack", AckMode::Client).await.unwrap();

    conn.send("/queue/txack", "", "one").await.unwrap();
    conn.send("/queue/txack", "", "two").await.unwrap();
    let first = timeout(WAIT, sub.receive()).await.unwrap().unwrap();

    let mut tx = conn.begin().await.unwrap();
    tx.ack(&first).await.unwrap();

    // the acknowledgement is buffered, so the subscription stays busy
    assert!(timeout(SHOULD_NOT_ARRIVE, sub.receive()).await.is_err());

    tx.commit().await.unwrap();
    let second = timeout(WAIT, sub.receive()).await.unwrap().unwrap();
    assert_eq!(&second.body[..], b"two");

    conn.disconnect().await.unwrap();
}

#[tokio::test]
async fn body_without_content_length_is_read_to_nul() {
    let addr = start_server().await;
    let conn = dial(&addr.to_string(), ConnectOptions::new()).await.unwrap();
    let mut sub = conn.subscribe("/queue/text", AckMode::Auto).await.unwrap();

    conn.send_with(
        "/queue/text",
        "text/plain",
        "plain text",
        SendOptions::new().without_content_length(),
    )
    .await
    .unwrap();

    let message = timeout(WAIT, sub.receive()).await.unwrap().unwrap();
    assert_eq!(&message.body[..], b"plain text");
    assert!(!message.headers.contains(header::CONTENT_LENGTH));

    conn.disconnect().await.unwrap();
}

#[tokio::test]
async fn unsupported_accept_version_is_rejected() {
    let addr = start_server().await;
    let stream = TcpStream::connect(addr).await.unwrap();
    let (read_half, write_half) = stream.into_split();
    let mut reader = FrameReader::new(read_half);
    let mut writer = FrameWriter::new(write_half);

    let connect_frame = Frame::new(Command::Connect)
        .with_header(header::ACCEPT_VERSION, "2.0,0.9")
        .with_header(header::HOST, "localhost");
    writer.write_frame(&connect_frame).await.unwrap();

    let error = read_frame(&mut reader).await;
    assert_eq!(error.command, Command::Error);
    assert_eq!(error.headers.get(header::MESSAGE), Some("unknown version"));
}

#[tokio::test]
async fn first_frame_after_handshake_is_unescaped() {
    let addr = start_server().await;
    let (mut reader, mut writer, _) = raw_session(addr, connect_12()).await;

    // the very first frame after CONNECTED carries an escaped header value;
    // the server's reader must already be decoding at the negotiated version
    let send = Frame::new(Command::Send)
        .with_header(header::DESTINATION, "/queue/first")
        .with_header("selector", "a:b")
        .with_body(&b"x"[..]);
    writer.write_frame(&send).await.unwrap();

    let subscribe = Frame::new(Command::Subscribe)
        .with_header(header::ID, "s1")
        .with_header(header::DESTINATION, "/queue/first")
        .with_header(header::ACK, "auto");
    writer.write_frame(&subscribe).await.unwrap();

    let message = read_frame(&mut reader).await;
    assert_eq!(message.command, Command::Message);
    // decoded once server-side, re-escaped on the way out, decoded here
    assert_eq!(message.headers.get("selector"), Some("a:b"));
}

#[tokio::test]
async fn broker_error_names_the_answered_receipt() {
    let addr = start_server().await;
    let (mut reader, mut writer, _) = raw_session(addr, connect_12()).await;

    let subscribe = Frame::new(Command::Subscribe)
        .with_header(header::ID, "dup")
        .with_header(header::DESTINATION, "/queue/q")
        .with_header(header::ACK, "auto");
    writer.write_frame(&subscribe).await.unwrap();

    let duplicate = subscribe.clone().with_header(header::RECEIPT, "5");
    writer.write_frame(&duplicate).await.unwrap();

    // the receipt is answered before the duplicate reaches the broker, and
    // the broker's ERROR still names it
    let receipt = read_frame(&mut reader).await;
    assert_eq!(receipt.command, Command::Receipt);
    assert_eq!(receipt.headers.get(header::RECEIPT_ID), Some("5"));

    let error = read_frame(&mut reader).await;
    assert_eq!(error.command, Command::Error);
    assert_eq!(
        error.headers.get(header::MESSAGE),
        Some("subscription id already in use")
    );
    assert_eq!(error.headers.get(header::RECEIPT_ID), Some("5"));
}

// --- client against a scripted peer -------------------------------------

#[tokio::test]
async fn client_surfaces_error_reply_to_connect() {
    let (client_io, server_io) = tokio::io::duplex(4096);

    tokio::spawn(async move {
        let (read_half, write_half) = tokio::io::split(server_io);
        let mut reader = FrameReader::new(read_half);
        let mut writer = FrameWriter::new(write_half);

        let connect_frame = read_frame(&mut reader).await;
        assert_eq!(connect_frame.command, Command::Connect);
        let error = Frame::new(Command::Error).with_header(header::MESSAGE, "no such vhost");
        writer.write_frame(&error).await.unwrap();
    });

    let err = connect(client_io, ConnectOptions::new().with_host("nope"))
        .await
        .unwrap_err();
    match err {
        StompError::RemoteError { message, .. } => assert_eq!(message, "no such vhost"),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn client_matches_receipts_and_dispatches_messages() {
    let (client_io, server_io) = tokio::io::duplex(4096);

    tokio::spawn(async move {
        let (read_half, write_half) = tokio::io::split(server_io);
        let mut reader = FrameReader::new(read_half);
        let mut writer = FrameWriter::new(write_half);

        let connect_frame = read_frame(&mut reader).await;
        assert_eq!(
            connect_frame.headers.get(header::ACCEPT_VERSION),
            Some("1.0,1.1,1.2")
        );
        let connected = Frame::new(Command::Connected)
            .with_header(header::VERSION, "1.2")
            .with_header(header::SESSION, "s-1");
        writer.write_frame(&connected).await.unwrap();
        reader.set_version(Version::V12);
        writer.set_version(Version::V12);

        let subscribe = read_frame(&mut reader).await;
        assert_eq!(subscribe.command, Command::Subscribe);
        let sub_id = subscribe.headers.get(header::ID).unwrap().to_string();

        let message = Frame::new(Command::Message)
            .with_header(header::DESTINATION, "/queue/a")
            .with_header(header::MESSAGE_ID, "9")
            .with_header(header::SUBSCRIPTION, &sub_id)
            .with_body(&b"payload"[..]);
        writer.write_frame(&message).await.unwrap();

        let ack = read_frame(&mut reader).await;
        assert_eq!(ack.command, Command::Ack);
        assert_eq!(ack.headers.get(header::ID), Some("9"));

        let send = read_frame(&mut reader).await;
        assert_eq!(send.command, Command::Send);
        let receipt_id = send.headers.get(header::RECEIPT).unwrap().to_string();
        let receipt = Frame::new(Command::Receipt).with_header(header::RECEIPT_ID, &receipt_id);
        writer.write_frame(&receipt).await.unwrap();
    });

    let conn = connect(client_io, ConnectOptions::new().with_host("test"))
        .await
        .unwrap();
    assert_eq!(conn.session(), Some("s-1"));

    let mut sub = conn.subscribe("/queue/a", AckMode::Client).await.unwrap();
    let message = timeout(WAIT, sub.receive()).await.unwrap().unwrap();
    assert_eq!(&message.body[..], b"payload");
    conn.ack(&message).await.unwrap();

    conn.send_with("/queue/a", "", "out", SendOptions::new().with_receipt())
        .await
        .unwrap();
}

#[tokio::test]
async fn client_broadcasts_server_error_to_subscriptions() {
    let (client_io, server_io) = tokio::io::duplex(4096);

    tokio::spawn(async move {
        let (read_half, write_half) = tokio::io::split(server_io);
        let mut reader = FrameReader::new(read_half);
        let mut writer = FrameWriter::new(write_half);

        let _connect = read_frame(&mut reader).await;
        let connected = Frame::new(Command::Connected).with_header(header::VERSION, "1.2");
        writer.write_frame(&connected).await.unwrap();
        reader.set_version(Version::V12);
        writer.set_version(Version::V12);

        let _subscribe = read_frame(&mut reader).await;
        let error = Frame::new(Command::Error).with_header(header::MESSAGE, "broker on fire");
        writer.write_frame(&error).await.unwrap();
    });

    let conn = connect(client_io, ConnectOptions::new().with_host("test"))
        .await
        .unwrap();
    let mut sub = conn.subscribe("/queue/a", AckMode::Auto).await.unwrap();

    let err = timeout(WAIT, sub.receive()).await.unwrap().unwrap_err();
    match err {
        StompError::RemoteError { message, .. } => assert_eq!(message, "broker on fire"),
        other => panic!("unexpected error: {other:?}"),
    }

    // the connection is dead for further operations
    let send_result = conn.send("/queue/a", "", "x").await;
    assert!(send_result.is_err());
}
