// ABOUTME: Queue manager: dispatch, acknowledgement tracking, and redelivery for /queue/ destinations
// ABOUTME: Pending frames live in pluggable storage; in-flight frames are tracked here until ACKed

use crate::ack::AckMode;
use crate::errors::{Result, StompError};
use crate::frame::Frame;
use crate::header;
use crate::server::storage::QueueStorage;
use crate::server::subscription::{SubKey, Subscription, SubscriptionRegistry};
use crate::version::Version;
use std::collections::BTreeMap;

/// A message delivered to a subscription and not yet acknowledged.
#[derive(Debug)]
struct InFlight {
    sub: SubKey,
    destination: String,
    frame: Frame,
}

/// Routes frames for queue destinations.
///
/// Each message is either in the storage backend (pending) or in the
/// in-flight map (delivered, awaiting acknowledgement), never both. Message
/// ids are allocated from a monotonic counter, so the in-flight map's key
/// order is delivery order.
pub(crate) struct QueueManager {
    storage: Box<dyn QueueStorage>,
    in_flight: BTreeMap<u64, InFlight>,
    last_message_id: u64,
}

impl QueueManager {
    pub fn new(storage: Box<dyn QueueStorage>) -> QueueManager {
        QueueManager {
            storage,
            in_flight: BTreeMap::new(),
            last_message_id: 0,
        }
    }

    /// Route an incoming MESSAGE frame: deliver to an idle subscriber, or
    /// park it in storage until one frees up.
    pub fn send(
        &mut self,
        registry: &mut SubscriptionRegistry,
        destination: &str,
        mut frame: Frame,
    ) -> Result<()> {
        self.last_message_id += 1;
        frame
            .headers
            .set(header::MESSAGE_ID, &self.last_message_id.to_string());

        match registry.take_idle(destination) {
            Some(key) => self.deliver(registry, &key, frame),
            None => self.storage.enqueue(destination, frame),
        }
    }

    /// Drain pending frames to idle subscribers. Called whenever a
    /// subscription appears or becomes idle.
    pub fn dispatch_pending(
        &mut self,
        registry: &mut SubscriptionRegistry,
        destination: &str,
    ) -> Result<()> {
        loop {
            let Some(frame) = self.storage.dequeue(destination)? else {
                return Ok(());
            };
            match registry.take_idle(destination) {
                Some(key) => self.deliver(registry, &key, frame)?,
                None => return self.storage.requeue(destination, frame),
            }
        }
    }

    /// Remove acknowledged messages from the in-flight map. In `client` mode
    /// the acknowledgement is cumulative: every earlier in-flight message on
    /// the same subscription is covered too.
    pub fn ack(
        &mut self,
        registry: &mut SubscriptionRegistry,
        conn_id: u64,
        frame: &Frame,
    ) -> Result<()> {
        let id = resolve_message_id(frame)?;
        let entry = self.in_flight.get(&id).ok_or(StompError::NotReceivedMessage)?;
        if entry.sub.0 != conn_id {
            return Err(StompError::NotReceivedMessage);
        }
        let key = entry.sub.clone();
        let destination = entry.destination.clone();

        let mode = registry
            .get(&key)
            .map_or(AckMode::ClientIndividual, |sub| sub.ack);
        let acked: Vec<u64> = if mode == AckMode::Client {
            self.in_flight
                .range(..=id)
                .filter(|(_, e)| e.sub == key)
                .map(|(k, _)| *k)
                .collect()
        } else {
            vec![id]
        };
        for k in acked {
            self.in_flight.remove(&k);
        }

        if let Some(sub) = registry.get_mut(&key) {
            sub.busy = false;
        }
        self.dispatch_pending(registry, &destination)
    }

    /// Return a rejected message to the head of its queue and redeliver.
    pub fn nack(
        &mut self,
        registry: &mut SubscriptionRegistry,
        conn_id: u64,
        frame: &Frame,
    ) -> Result<()> {
        let id = resolve_message_id(frame)?;

        // When the frame names its subscription (the 1.0/1.1 form), check
        // the ack mode up front: auto deliveries are never tracked, so the
        // in-flight lookup below could only report the less specific
        // "not received" error.
        if let Some(sub_id) = frame.headers.get(header::SUBSCRIPTION) {
            if let Some(sub) = registry.get(&(conn_id, sub_id.to_string())) {
                if !sub.ack.requires_ack() {
                    return Err(StompError::CannotNackAutoSub);
                }
            }
        }

        // An in-flight entry implies a non-auto subscription: deliver() only
        // records in-flight state when the ack mode requires it. A 1.2
        // id-form NACK against an auto subscription therefore fails here as
        // "not received", since there is nothing to identify the
        // subscription by.
        let entry = self.in_flight.get(&id).ok_or(StompError::NotReceivedMessage)?;
        if entry.sub.0 != conn_id {
            return Err(StompError::NotReceivedMessage);
        }

        let entry = self.in_flight.remove(&id).expect("entry present");
        self.storage
            .requeue(&entry.destination, strip_delivery_headers(entry.frame))?;

        if let Some(sub) = registry.get_mut(&entry.sub) {
            sub.busy = false;
        }
        self.dispatch_pending(registry, &entry.destination)
    }

    /// A subscription went away (UNSUBSCRIBE or disconnect): its in-flight
    /// frames return to the head of the queue in ascending message-id order,
    /// then redelivery runs for the destination.
    pub fn remove_subscription(
        &mut self,
        registry: &mut SubscriptionRegistry,
        sub: &Subscription,
    ) -> Result<()> {
        let key = sub.key();
        let ids: Vec<u64> = self
            .in_flight
            .iter()
            .filter(|(_, e)| e.sub == key)
            .map(|(k, _)| *k)
            .collect();

        // requeue in descending order so the head of the queue ends up in
        // ascending message-id order
        for id in ids.iter().rev() {
            let entry = self.in_flight.remove(id).expect("entry present");
            self.storage
                .requeue(&entry.destination, strip_delivery_headers(entry.frame))?;
        }
        self.dispatch_pending(registry, &sub.destination)
    }

    fn deliver(
        &mut self,
        registry: &mut SubscriptionRegistry,
        key: &SubKey,
        mut frame: Frame,
    ) -> Result<()> {
        let Some(sub) = registry.get_mut(key) else {
            // subscription vanished between selection and delivery
            let destination = destination_of(&frame).to_string();
            return self
                .storage
                .requeue(&destination, strip_delivery_headers(frame));
        };

        let id = resolve_message_id(&frame)?;
        frame.headers.set(header::SUBSCRIPTION, &sub.id);
        if sub.ack.requires_ack() {
            if sub.version >= Version::V12 {
                frame.headers.set(header::ACK, &id.to_string());
            }
            sub.busy = true;
            self.in_flight.insert(
                id,
                InFlight {
                    sub: key.clone(),
                    destination: destination_of(&frame).to_string(),
                    frame: frame.clone(),
                },
            );
        }
        sub.conn.push(frame);
        Ok(())
    }
}

fn destination_of(frame: &Frame) -> &str {
    frame.headers.get(header::DESTINATION).unwrap_or_default()
}

/// Resolve the message id from an ACK/NACK frame: the 1.2 `id` header, or
/// the 1.0/1.1 `message-id` header.
fn resolve_message_id(frame: &Frame) -> Result<u64> {
    let text = frame
        .headers
        .get(header::ID)
        .or_else(|| frame.headers.get(header::MESSAGE_ID))
        .ok_or(StompError::NotReceivedMessage)?;
    text.parse::<u64>()
        .map_err(|_| StompError::NotReceivedMessage)
}

/// Remove per-delivery headers before a frame re-enters the pending queue.
fn strip_delivery_headers(mut frame: Frame) -> Frame {
    frame.headers.remove(header::SUBSCRIPTION);
    frame.headers.remove(header::ACK);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Command;
    use crate::server::conn::ConnHandle;
    use crate::server::storage::MemoryQueueStorage;
    use tokio::sync::mpsc;

    const DEST: &str = "/queue/q";

    fn manager() -> QueueManager {
        QueueManager::new(Box::new(MemoryQueueStorage::new()))
    }

    fn add_sub(
        registry: &mut SubscriptionRegistry,
        conn_id: u64,
        ack: AckMode,
    ) -> mpsc::Receiver<Frame> {
        let (handle, rx) = ConnHandle::new_for_test(conn_id);
        registry
            .add(Subscription {
                conn: handle,
                id: format!("s{conn_id}"),
                destination: DEST.to_string(),
                ack,
                version: Version::V12,
                busy: false,
            })
            .unwrap();
        rx
    }

    fn message(body: &'static str) -> Frame {
        Frame::new(Command::Message)
            .with_header(header::DESTINATION, DEST)
            .with_body(body.as_bytes())
    }

    fn ack_frame(message_id: &str) -> Frame {
        Frame::new(Command::Ack).with_header(header::ID, message_id)
    }

    #[test]
    fn send_without_subscriber_is_stored() {
        let mut registry = SubscriptionRegistry::new();
        let mut qm = manager();
        qm.send(&mut registry, DEST, message("hi")).unwrap();
        assert!(qm.in_flight.is_empty());
        let stored = qm.storage.dequeue(DEST).unwrap().unwrap();
        assert_eq!(stored.headers.get(header::MESSAGE_ID), Some("1"));
    }

    #[test]
    fn auto_subscriber_gets_messages_without_tracking() {
        let mut registry = SubscriptionRegistry::new();
        let mut qm = manager();
        let mut rx = add_sub(&mut registry, 1, AckMode::Auto);

        qm.send(&mut registry, DEST, message("a")).unwrap();
        qm.send(&mut registry, DEST, message("b")).unwrap();

        assert_eq!(&rx.try_recv().unwrap().body[..], b"a");
        assert_eq!(&rx.try_recv().unwrap().body[..], b"b");
        assert!(qm.in_flight.is_empty());
    }

    #[test]
    fn client_ack_subscriber_holds_one_in_flight() {
        let mut registry = SubscriptionRegistry::new();
        let mut qm = manager();
        let mut rx = add_sub(&mut registry, 1, AckMode::Client);

        qm.send(&mut registry, DEST, message("a")).unwrap();
        qm.send(&mut registry, DEST, message("b")).unwrap();

        let delivered = rx.try_recv().unwrap();
        assert_eq!(&delivered.body[..], b"a");
        assert_eq!(delivered.headers.get(header::SUBSCRIPTION), Some("s1"));
        assert_eq!(delivered.headers.get(header::ACK), Some("1"));
        assert!(rx.try_recv().is_err());
        assert_eq!(qm.in_flight.len(), 1);

        // ACK frees the subscription; the pending frame follows
        qm.ack(&mut registry, 1, &ack_frame("1")).unwrap();
        assert_eq!(&rx.try_recv().unwrap().body[..], b"b");
    }

    #[test]
    fn round_robin_across_idle_subscribers() {
        let mut registry = SubscriptionRegistry::new();
        let mut qm = manager();
        let mut rx1 = add_sub(&mut registry, 1, AckMode::Client);
        let mut rx2 = add_sub(&mut registry, 2, AckMode::Client);
        let mut rx3 = add_sub(&mut registry, 3, AckMode::Client);

        for body in ["a", "b", "c", "d", "e"] {
            qm.send(&mut registry, DEST, message(body)).unwrap();
        }

        // first three deliveries round-robin, the rest queue behind them
        assert_eq!(&rx1.try_recv().unwrap().body[..], b"a");
        assert_eq!(&rx2.try_recv().unwrap().body[..], b"b");
        assert_eq!(&rx3.try_recv().unwrap().body[..], b"c");
        assert!(rx1.try_recv().is_err());
        assert_eq!(qm.in_flight.len(), 3);

        // only conn 2 acknowledges; it receives the next pending message
        qm.ack(&mut registry, 2, &ack_frame("2")).unwrap();
        assert_eq!(&rx2.try_recv().unwrap().body[..], b"d");
    }

    #[test]
    fn cumulative_ack_covers_earlier_messages() {
        let mut registry = SubscriptionRegistry::new();
        let mut qm = manager();
        let _rx = add_sub(&mut registry, 1, AckMode::Client);
        let key: SubKey = (1, "s1".to_string());

        // three messages in flight on one subscription
        for (id, body) in [(1u64, "m1"), (2, "m2"), (3, "m3")] {
            qm.in_flight.insert(
                id,
                InFlight {
                    sub: key.clone(),
                    destination: DEST.to_string(),
                    frame: message(body),
                },
            );
        }

        qm.ack(&mut registry, 1, &ack_frame("2")).unwrap();
        assert_eq!(qm.in_flight.keys().copied().collect::<Vec<_>>(), [3]);
    }

    #[test]
    fn individual_ack_covers_only_the_named_message() {
        let mut registry = SubscriptionRegistry::new();
        let mut qm = manager();
        let _rx = add_sub(&mut registry, 1, AckMode::ClientIndividual);
        let key: SubKey = (1, "s1".to_string());

        for id in [1u64, 2] {
            qm.in_flight.insert(
                id,
                InFlight {
                    sub: key.clone(),
                    destination: DEST.to_string(),
                    frame: message("m"),
                },
            );
        }

        qm.ack(&mut registry, 1, &ack_frame("2")).unwrap();
        assert_eq!(qm.in_flight.keys().copied().collect::<Vec<_>>(), [1]);
    }

    #[test]
    fn nack_requeues_at_head_and_redelivers() {
        let mut registry = SubscriptionRegistry::new();
        let mut qm = manager();
        let mut rx = add_sub(&mut registry, 1, AckMode::ClientIndividual);

        qm.send(&mut registry, DEST, message("a")).unwrap();
        qm.send(&mut registry, DEST, message("b")).unwrap();
        let first = rx.try_recv().unwrap();
        assert_eq!(&first.body[..], b"a");

        let nack = Frame::new(Command::Nack).with_header(header::ID, "1");
        qm.nack(&mut registry, 1, &nack).unwrap();

        // the NACKed message comes back before the pending one
        let redelivered = rx.try_recv().unwrap();
        assert_eq!(&redelivered.body[..], b"a");
        assert_eq!(redelivered.headers.get(header::MESSAGE_ID), Some("1"));
    }

    #[test]
    fn nack_against_auto_subscription_rejected() {
        let mut registry = SubscriptionRegistry::new();
        let mut qm = manager();
        let mut rx = add_sub(&mut registry, 1, AckMode::Auto);

        qm.send(&mut registry, DEST, message("a")).unwrap();
        let delivered = rx.try_recv().unwrap();
        let message_id = delivered.headers.get(header::MESSAGE_ID).unwrap();

        let nack = Frame::new(Command::Nack)
            .with_header(header::SUBSCRIPTION, "s1")
            .with_header(header::MESSAGE_ID, message_id);
        assert!(matches!(
            qm.nack(&mut registry, 1, &nack),
            Err(StompError::CannotNackAutoSub)
        ));

        // the id-only form cannot name the subscription; auto deliveries are
        // untracked, so it reports the message as not received
        let nack_by_id = Frame::new(Command::Nack).with_header(header::ID, message_id);
        assert!(matches!(
            qm.nack(&mut registry, 1, &nack_by_id),
            Err(StompError::NotReceivedMessage)
        ));
    }

    #[test]
    fn ack_from_wrong_connection_rejected() {
        let mut registry = SubscriptionRegistry::new();
        let mut qm = manager();
        let _rx = add_sub(&mut registry, 1, AckMode::Client);

        qm.send(&mut registry, DEST, message("a")).unwrap();
        assert!(matches!(
            qm.ack(&mut registry, 2, &ack_frame("1")),
            Err(StompError::NotReceivedMessage)
        ));
        assert!(matches!(
            qm.ack(&mut registry, 1, &ack_frame("99")),
            Err(StompError::NotReceivedMessage)
        ));
    }

    #[test]
    fn removed_subscription_requeues_in_flight_ascending() {
        let mut registry = SubscriptionRegistry::new();
        let mut qm = manager();
        let _rx1 = add_sub(&mut registry, 1, AckMode::Client);

        qm.send(&mut registry, DEST, message("a")).unwrap();
        qm.send(&mut registry, DEST, message("b")).unwrap();
        assert_eq!(qm.in_flight.len(), 1);

        let sub = registry.remove(1, "s1").unwrap();
        qm.remove_subscription(&mut registry, &sub).unwrap();
        assert!(qm.in_flight.is_empty());

        // in-flight frame is back at the head, ahead of the pending one
        let head = qm.storage.dequeue(DEST).unwrap().unwrap();
        assert_eq!(&head.body[..], b"a");
        assert!(!head.headers.contains(header::SUBSCRIPTION));
        let next = qm.storage.dequeue(DEST).unwrap().unwrap();
        assert_eq!(&next.body[..], b"b");
    }

    #[test]
    fn in_flight_moves_to_remaining_subscriber() {
        let mut registry = SubscriptionRegistry::new();
        let mut qm = manager();
        let mut rx1 = add_sub(&mut registry, 1, AckMode::Client);
        let mut rx2 = add_sub(&mut registry, 2, AckMode::Client);

        qm.send(&mut registry, DEST, message("a")).unwrap();
        assert_eq!(&rx1.try_recv().unwrap().body[..], b"a");

        let sub = registry.remove(1, "s1").unwrap();
        qm.remove_subscription(&mut registry, &sub).unwrap();

        let moved = rx2.try_recv().unwrap();
        assert_eq!(&moved.body[..], b"a");
        assert_eq!(moved.headers.get(header::SUBSCRIPTION), Some("s2"));
    }
}
