// ABOUTME: Topic manager: immediate broadcast fan-out with no storage or acknowledgement

use crate::frame::Frame;
use crate::header;
use crate::server::subscription::SubscriptionRegistry;

/// Routes frames for topic destinations (anything outside `/queue/`).
///
/// Publishing clones the frame for every subscriber but the last, which
/// receives the original. Clones share the body allocation and copy the
/// headers, so one subscriber mutating its headers cannot affect another.
/// Messages published with no subscribers are dropped.
#[derive(Debug, Default)]
pub(crate) struct TopicManager {
    last_message_id: u64,
}

impl TopicManager {
    pub fn new() -> TopicManager {
        TopicManager::default()
    }

    pub fn publish(
        &mut self,
        registry: &mut SubscriptionRegistry,
        destination: &str,
        mut frame: Frame,
    ) {
        self.last_message_id += 1;
        frame
            .headers
            .set(header::MESSAGE_ID, &self.last_message_id.to_string());

        let keys = registry.subscribers(destination);
        if keys.is_empty() {
            return;
        }

        let last = keys.len() - 1;
        let mut original = Some(frame);
        for (index, key) in keys.iter().enumerate() {
            let Some(sub) = registry.get(key) else {
                continue;
            };
            // the final subscriber gets the original, everyone else a copy
            let mut copy = if index == last {
                original.take().expect("original frame available")
            } else {
                original.as_ref().expect("original frame available").clone()
            };
            copy.headers.set(header::SUBSCRIPTION, &sub.id);
            sub.conn.push(copy);
        }
    }
}
