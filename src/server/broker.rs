// ABOUTME: Broker dispatcher task: serializes all destination state behind one request channel
// ABOUTME: Routes SEND/SUBSCRIBE/ACK traffic to the queue and topic managers

use crate::ack::AckMode;
use crate::errors::{Result, StompError};
use crate::frame::{Command, Frame};
use crate::header;
use crate::server::conn::ConnHandle;
use crate::server::queue::QueueManager;
use crate::server::storage::QueueStorage;
use crate::server::subscription::{Subscription, SubscriptionRegistry};
use crate::server::topic::TopicManager;
use crate::version::Version;
use tokio::sync::mpsc;
use tracing::{debug, error};

/// Destinations under this prefix get queue semantics; everything else is a
/// topic.
pub const QUEUE_PREFIX: &str = "/queue/";

pub(crate) fn is_queue_destination(destination: &str) -> bool {
    destination.starts_with(QUEUE_PREFIX)
}

/// Work items for the broker task, sent by connection actors.
///
/// `receipt` carries the receipt id the connection already answered for the
/// originating frame (the RECEIPT is written synchronously before the frame
/// is forwarded here). It exists so an ERROR raised on this asynchronous
/// path can still name the offending frame's receipt, matching the
/// synchronous error path in the connection actor.
pub(crate) enum Request {
    /// A SEND frame (receipt and transaction already handled by the
    /// connection). The broker rewrites it into a MESSAGE and routes it.
    Send { frame: Frame },

    /// Register a subscription from a validated SUBSCRIBE frame.
    Subscribe {
        conn: ConnHandle,
        version: Version,
        frame: Frame,
        receipt: Option<String>,
    },

    /// Remove a subscription from a validated UNSUBSCRIBE frame.
    Unsubscribe {
        conn: ConnHandle,
        frame: Frame,
        receipt: Option<String>,
    },

    Ack {
        conn: ConnHandle,
        frame: Frame,
        receipt: Option<String>,
    },

    Nack {
        conn: ConnHandle,
        frame: Frame,
        receipt: Option<String>,
    },

    /// The connection went away; drop its subscriptions and requeue its
    /// in-flight messages.
    Disconnect { conn_id: u64 },
}

/// The broker task owns every piece of destination state: the subscription
/// registry, the queue manager (with its storage), and the topic manager.
/// Connection actors reach it only through the request channel, which
/// serializes all mutation and keeps per-destination routing FIFO.
pub(crate) struct Broker {
    registry: SubscriptionRegistry,
    queues: QueueManager,
    topics: TopicManager,
    requests: mpsc::Receiver<Request>,
}

impl Broker {
    pub fn new(storage: Box<dyn QueueStorage>, requests: mpsc::Receiver<Request>) -> Broker {
        Broker {
            registry: SubscriptionRegistry::new(),
            queues: QueueManager::new(storage),
            topics: TopicManager::new(),
            requests,
        }
    }

    pub async fn run(mut self) {
        while let Some(request) = self.requests.recv().await {
            self.handle(request);
        }
        debug!("broker dispatcher stopped");
    }

    fn handle(&mut self, request: Request) {
        match request {
            Request::Send { mut frame } => {
                let destination = frame
                    .headers
                    .get(header::DESTINATION)
                    .unwrap_or_default()
                    .to_string();
                frame.command = Command::Message;
                if is_queue_destination(&destination) {
                    if let Err(err) = self.queues.send(&mut self.registry, &destination, frame) {
                        error!(%destination, error = %err, "queue storage failure, message dropped");
                    }
                } else {
                    self.topics.publish(&mut self.registry, &destination, frame);
                }
            }

            Request::Subscribe {
                conn,
                version,
                frame,
                receipt,
            } => {
                if let Err(err) = self.subscribe(conn.clone(), version, &frame) {
                    fail_connection(&conn, &err, receipt.as_deref());
                }
            }

            Request::Unsubscribe {
                conn,
                frame,
                receipt,
            } => {
                // validated: id is present
                let id = frame.headers.get(header::ID).unwrap_or_default();
                match self.registry.remove(conn.id(), id) {
                    Some(sub) => {
                        if is_queue_destination(&sub.destination) {
                            if let Err(err) =
                                self.queues.remove_subscription(&mut self.registry, &sub)
                            {
                                error!(error = %err, "queue storage failure during unsubscribe");
                            }
                        }
                    }
                    None => fail_connection(
                        &conn,
                        &StompError::SubscriptionNotFound,
                        receipt.as_deref(),
                    ),
                }
            }

            Request::Ack {
                conn,
                frame,
                receipt,
            } => {
                if let Err(err) = self.queues.ack(&mut self.registry, conn.id(), &frame) {
                    fail_connection(&conn, &err, receipt.as_deref());
                }
            }

            Request::Nack {
                conn,
                frame,
                receipt,
            } => {
                if let Err(err) = self.queues.nack(&mut self.registry, conn.id(), &frame) {
                    fail_connection(&conn, &err, receipt.as_deref());
                }
            }

            Request::Disconnect { conn_id } => {
                for sub in self.registry.remove_conn(conn_id) {
                    if is_queue_destination(&sub.destination) {
                        if let Err(err) = self.queues.remove_subscription(&mut self.registry, &sub)
                        {
                            error!(error = %err, "queue storage failure during disconnect");
                        }
                    }
                }
            }
        }
    }

    fn subscribe(&mut self, conn: ConnHandle, version: Version, frame: &Frame) -> Result<()> {
        // validated: destination and id are present, ack parses
        let destination = frame
            .headers
            .get(header::DESTINATION)
            .unwrap_or_default()
            .to_string();
        let id = frame.headers.get(header::ID).unwrap_or_default().to_string();
        let ack = frame
            .headers
            .get(header::ACK)
            .map_or(Ok(AckMode::Auto), str::parse)?;

        self.registry.add(Subscription {
            conn,
            id,
            destination: destination.clone(),
            ack,
            version,
            busy: false,
        })?;

        if is_queue_destination(&destination) {
            self.queues
                .dispatch_pending(&mut self.registry, &destination)?;
        }
        Ok(())
    }
}

/// Send an ERROR frame describing `err` to the connection; writing an ERROR
/// makes the connection actor close the stream afterwards.
///
/// `receipt` is the id the connection already answered for the offending
/// frame. The RECEIPT went out before the failure was detected here, but the
/// ERROR still names it so clients can correlate, the same way the
/// connection actor's synchronous error path does.
fn fail_connection(conn: &ConnHandle, err: &StompError, receipt: Option<&str>) {
    debug!(conn = conn.id(), error = %err, "failing connection");
    let mut frame = Frame::new(Command::Error).with_header(header::MESSAGE, &err.to_string());
    if let Some(receipt) = receipt {
        frame.headers.add(header::RECEIPT_ID, receipt);
    }
    conn.push(frame);
}
