// ABOUTME: Demo: send a message to a queue and consume it with acknowledgement

use argh::FromArgs;
use stomp::client::{dial, ConnectOptions, SendOptions};
use stomp::AckMode;

/// Send one message through a STOMP queue and read it back.
#[derive(FromArgs)]
struct Args {
    /// broker address (default localhost:61613)
    #[argh(option, short = 'a', default = "String::from(\"localhost:61613\")")]
    address: String,

    /// destination queue (default /queue/demo)
    #[argh(option, short = 'd', default = "String::from(\"/queue/demo\")")]
    destination: String,

    /// message text to send
    #[argh(option, short = 'm', default = "String::from(\"hello from stomp\")")]
    message: String,
}

#[tokio::main]
async fn main() -> stomp::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(tracing::Level::WARN)
        .init();

    let args: Args = argh::from_env();

    let conn = dial(&args.address, ConnectOptions::new()).await?;
    println!(
        "connected: version {}, server {:?}",
        conn.version(),
        conn.server()
    );

    let mut sub = conn.subscribe(&args.destination, AckMode::Client).await?;

    conn.send_with(
        &args.destination,
        "text/plain",
        args.message.clone(),
        SendOptions::new().with_receipt(),
    )
    .await?;
    println!("sent {:?} (receipt confirmed)", args.message);

    let received = sub.receive().await?;
    println!(
        "received {:?} (message-id {:?})",
        String::from_utf8_lossy(&received.body),
        received.message_id()
    );
    conn.ack(&received).await?;

    sub.unsubscribe().await?;
    conn.disconnect().await
}
