// ABOUTME: Server-side subscription records and the per-destination registry
// ABOUTME: Implements round-robin selection of idle subscriptions for queue dispatch

use crate::ack::AckMode;
use crate::errors::{Result, StompError};
use crate::server::conn::ConnHandle;
use crate::version::Version;
use std::collections::{HashMap, HashSet, VecDeque};

/// A subscription is identified by its connection and its client-chosen id.
pub(crate) type SubKey = (u64, String);

/// One client subscription as seen by the broker.
#[derive(Debug)]
pub(crate) struct Subscription {
    pub conn: ConnHandle,
    pub id: String,
    pub destination: String,
    pub ack: AckMode,
    pub version: Version,
    /// A queue subscription holding an un-ACKed in-flight message is busy
    /// and skipped by round-robin selection. Auto subscriptions never become
    /// busy.
    pub busy: bool,
}

impl Subscription {
    pub fn key(&self) -> SubKey {
        (self.conn.id(), self.id.clone())
    }
}

/// Registry of every active subscription, indexed by connection and by
/// destination.
///
/// The per-destination lists are kept in rotation order: selecting an idle
/// subscription moves it to the back, spreading queue deliveries round-robin
/// across the idle subscribers.
#[derive(Debug, Default)]
pub(crate) struct SubscriptionRegistry {
    subs: HashMap<SubKey, Subscription>,
    by_destination: HashMap<String, VecDeque<SubKey>>,
    by_conn: HashMap<u64, HashSet<String>>,
}

impl SubscriptionRegistry {
    pub fn new() -> SubscriptionRegistry {
        SubscriptionRegistry::default()
    }

    /// Register a subscription. The (connection, id) pair must be new.
    pub fn add(&mut self, sub: Subscription) -> Result<()> {
        let key = sub.key();
        if self.subs.contains_key(&key) {
            return Err(StompError::SubscriptionInUse);
        }
        self.by_destination
            .entry(sub.destination.clone())
            .or_default()
            .push_back(key.clone());
        self.by_conn
            .entry(key.0)
            .or_default()
            .insert(key.1.clone());
        self.subs.insert(key, sub);
        Ok(())
    }

    /// Remove one subscription, returning it if it existed.
    pub fn remove(&mut self, conn_id: u64, id: &str) -> Option<Subscription> {
        let key = (conn_id, id.to_string());
        let sub = self.subs.remove(&key)?;
        if let Some(list) = self.by_destination.get_mut(&sub.destination) {
            list.retain(|k| *k != key);
            if list.is_empty() {
                self.by_destination.remove(&sub.destination);
            }
        }
        if let Some(ids) = self.by_conn.get_mut(&conn_id) {
            ids.remove(id);
            if ids.is_empty() {
                self.by_conn.remove(&conn_id);
            }
        }
        Some(sub)
    }

    /// Remove every subscription belonging to a connection.
    pub fn remove_conn(&mut self, conn_id: u64) -> Vec<Subscription> {
        let ids: Vec<String> = self
            .by_conn
            .get(&conn_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        ids.iter()
            .filter_map(|id| self.remove(conn_id, id))
            .collect()
    }

    pub fn get(&self, key: &SubKey) -> Option<&Subscription> {
        self.subs.get(key)
    }

    pub fn get_mut(&mut self, key: &SubKey) -> Option<&mut Subscription> {
        self.subs.get_mut(key)
    }

    /// Round-robin pick: the first idle subscription for the destination,
    /// rotated to the back of the list. Returns `None` when every subscriber
    /// is busy (or there are none).
    pub fn take_idle(&mut self, destination: &str) -> Option<SubKey> {
        let list = self.by_destination.get_mut(destination)?;
        let position = list
            .iter()
            .position(|key| self.subs.get(key).is_some_and(|sub| !sub.busy))?;
        let key = list.remove(position)?;
        list.push_back(key.clone());
        Some(key)
    }

    /// Every subscription for a destination, in rotation order. Used for
    /// topic broadcast.
    pub fn subscribers(&self, destination: &str) -> Vec<SubKey> {
        self.by_destination
            .get(destination)
            .map(|list| list.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::conn::ConnHandle;
    use tokio::sync::mpsc;

    fn sub(conn_id: u64, id: &str, destination: &str) -> (Subscription, mpsc::Receiver<crate::frame::Frame>) {
        let (handle, rx) = ConnHandle::new_for_test(conn_id);
        (
            Subscription {
                conn: handle,
                id: id.to_string(),
                destination: destination.to_string(),
                ack: AckMode::Client,
                version: Version::V12,
                busy: false,
            },
            rx,
        )
    }

    #[test]
    fn duplicate_id_on_same_connection_rejected() {
        let mut registry = SubscriptionRegistry::new();
        let (s1, _rx1) = sub(1, "s", "/queue/a");
        let (s2, _rx2) = sub(1, "s", "/queue/b");
        registry.add(s1).unwrap();
        assert!(matches!(
            registry.add(s2),
            Err(StompError::SubscriptionInUse)
        ));

        // same id on another connection is fine
        let (s3, _rx3) = sub(2, "s", "/queue/a");
        registry.add(s3).unwrap();
    }

    #[test]
    fn take_idle_rotates_round_robin() {
        let mut registry = SubscriptionRegistry::new();
        let (s1, _rx1) = sub(1, "a", "/queue/q");
        let (s2, _rx2) = sub(2, "b", "/queue/q");
        let (s3, _rx3) = sub(3, "c", "/queue/q");
        registry.add(s1).unwrap();
        registry.add(s2).unwrap();
        registry.add(s3).unwrap();

        assert_eq!(registry.take_idle("/queue/q").unwrap().0, 1);
        assert_eq!(registry.take_idle("/queue/q").unwrap().0, 2);
        assert_eq!(registry.take_idle("/queue/q").unwrap().0, 3);
        assert_eq!(registry.take_idle("/queue/q").unwrap().0, 1);
    }

    #[test]
    fn busy_subscriptions_are_skipped() {
        let mut registry = SubscriptionRegistry::new();
        let (s1, _rx1) = sub(1, "a", "/queue/q");
        let (s2, _rx2) = sub(2, "b", "/queue/q");
        registry.add(s1).unwrap();
        registry.add(s2).unwrap();

        let first = registry.take_idle("/queue/q").unwrap();
        registry.get_mut(&first).unwrap().busy = true;

        // only the second subscription is idle now, twice in a row
        assert_eq!(registry.take_idle("/queue/q").unwrap().0, 2);
        assert_eq!(registry.take_idle("/queue/q").unwrap().0, 2);

        registry.get_mut(&first).unwrap().busy = false;
        let keys: Vec<u64> = (0..2)
            .map(|_| registry.take_idle("/queue/q").unwrap().0)
            .collect();
        assert!(keys.contains(&1));
    }

    #[test]
    fn take_idle_empty_or_all_busy() {
        let mut registry = SubscriptionRegistry::new();
        assert!(registry.take_idle("/queue/none").is_none());

        let (s1, _rx1) = sub(1, "a", "/queue/q");
        registry.add(s1).unwrap();
        let key = registry.take_idle("/queue/q").unwrap();
        registry.get_mut(&key).unwrap().busy = true;
        assert!(registry.take_idle("/queue/q").is_none());
    }

    #[test]
    fn remove_conn_clears_all_subscriptions() {
        let mut registry = SubscriptionRegistry::new();
        let (s1, _rx1) = sub(1, "a", "/queue/q");
        let (s2, _rx2) = sub(1, "b", "/topic/t");
        let (s3, _rx3) = sub(2, "a", "/queue/q");
        registry.add(s1).unwrap();
        registry.add(s2).unwrap();
        registry.add(s3).unwrap();

        let removed = registry.remove_conn(1);
        assert_eq!(removed.len(), 2);
        assert_eq!(registry.subscribers("/queue/q").len(), 1);
        assert!(registry.subscribers("/topic/t").is_empty());
    }
}
