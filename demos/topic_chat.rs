// ABOUTME: Demo: minimal chat over a STOMP topic, one subscriber per terminal

use argh::FromArgs;
use stomp::client::{dial, ConnectOptions};
use stomp::AckMode;
use tokio::io::{AsyncBufReadExt, BufReader};

/// Chat on a STOMP topic: every line typed here is broadcast to every
/// connected participant.
#[derive(FromArgs)]
struct Args {
    /// broker address (default localhost:61613)
    #[argh(option, short = 'a', default = "String::from(\"localhost:61613\")")]
    address: String,

    /// topic destination (default /topic/chat)
    #[argh(option, short = 't', default = "String::from(\"/topic/chat\")")]
    topic: String,

    /// display name
    #[argh(option, short = 'n', default = "String::from(\"anonymous\")")]
    name: String,
}

#[tokio::main]
async fn main() -> stomp::Result<()> {
    let args: Args = argh::from_env();

    let conn = dial(&args.address, ConnectOptions::new()).await?;
    let mut sub = conn.subscribe(&args.topic, AckMode::Auto).await?;

    tokio::spawn(async move {
        loop {
            match sub.receive().await {
                Ok(message) => {
                    let from = message.headers.get("from").unwrap_or("?");
                    println!("<{from}> {}", String::from_utf8_lossy(&message.body));
                }
                Err(err) => {
                    eprintln!("subscription ended: {err}");
                    return;
                }
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.map_err(stomp::StompError::from)? {
        if line.is_empty() {
            continue;
        }
        conn.send_with(
            &args.topic,
            "text/plain",
            line,
            stomp::client::SendOptions::new().with_header("from", &args.name),
        )
        .await?;
    }

    conn.disconnect().await
}
