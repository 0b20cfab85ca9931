//! Server-side event subscriptions.
//!
//! Clients toggle interest in `{event, queue}` pairs with Event frames; the
//! broker fans matching lifecycle events out to subscribers in registration
//! order.

use bytestring::ByteString;
use serde_json::json;

use hmq_codec::types::headers;
use hmq_codec::{Frame, MessageType};

use crate::clients::ClientRegistry;
use crate::types::{ClientId, DashMap, QueueName, SessionCommand};

pub mod event_names {
    pub const QUEUE_CREATED: &str = "queue-created";
    pub const QUEUE_REMOVED: &str = "queue-removed";
    pub const QUEUE_STATUS_CHANGED: &str = "queue-status-changed";
    pub const MESSAGE_TIMED_OUT: &str = "message-timed-out";
    pub const CLIENT_JOINED: &str = "client-joined";
    pub const CLIENT_LEFT: &str = "client-left";
}

type EventKey = (ByteString, QueueName);

pub struct EventRegistry {
    subs: DashMap<EventKey, Vec<ClientId>>,
}

impl Default for EventRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl EventRegistry {
    #[inline]
    pub fn new() -> Self {
        Self { subs: DashMap::default() }
    }

    /// Adds or removes a subscription; returns the resulting state.
    pub fn toggle(&self, event: &str, queue: &str, client_id: &ClientId, subscribe: bool) -> bool {
        let key = (ByteString::from(event), QueueName::from(queue));
        if subscribe {
            let mut subs = self.subs.entry(key).or_default();
            if !subs.contains(client_id) {
                subs.push(client_id.clone());
            }
            true
        } else {
            if let Some(mut subs) = self.subs.get_mut(&key) {
                subs.retain(|id| id != client_id);
            }
            self.subs.remove_if(&key, |_, subs| subs.is_empty());
            false
        }
    }

    /// Drops every subscription of a disconnecting client.
    pub fn remove_client(&self, client_id: &ClientId) {
        for mut entry in self.subs.iter_mut() {
            entry.value_mut().retain(|id| id != client_id);
        }
        self.subs.retain(|_, subs| !subs.is_empty());
    }

    /// Sends an Event frame to each subscriber, in registration order.
    pub fn fire(
        &self,
        clients: &ClientRegistry,
        event: &str,
        queue: &str,
        payload: serde_json::Value,
    ) {
        let key = (ByteString::from(event), QueueName::from(queue));
        let subscribers = match self.subs.get(&key) {
            Some(subs) => subs.clone(),
            None => return,
        };

        let mut frame = Frame::new(MessageType::Event);
        frame.set_source(queue);
        frame.push_header(headers::EVENT_NAME, event);
        frame.push_header(headers::QUEUE_NAME, queue);
        if frame.set_content_json(&json!({ "event": event, "queue": queue, "data": payload })).is_err() {
            return;
        }

        for client_id in subscribers {
            if let Some(entry) = clients.find_by_id(&client_id) {
                let mut f = frame.clone();
                f.set_target(client_id.clone());
                if entry.tx.unbounded_send(SessionCommand::Forward(f)).is_err() {
                    log::debug!("event {} skipped for {}, writer is closed", event, client_id);
                }
            }
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.subs.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.subs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Id;
    use futures::channel::mpsc;
    use futures::StreamExt;

    #[tokio::test]
    async fn fire_reaches_subscribers_in_order() {
        let clients = ClientRegistry::new();
        let events = EventRegistry::new();

        let (tx, mut rx) = mpsc::unbounded();
        clients.add(Id::from_client_id("c1"), tx);

        let c1 = ClientId::from("c1");
        events.toggle(event_names::QUEUE_CREATED, "push-a", &c1, true);
        events.fire(&clients, event_names::QUEUE_CREATED, "push-a", json!({}));

        match rx.next().await {
            Some(SessionCommand::Forward(frame)) => {
                assert_eq!(frame.typ, MessageType::Event);
                assert_eq!(frame.header(headers::EVENT_NAME).unwrap(), event_names::QUEUE_CREATED);
            }
            other => panic!("unexpected: {:?}", other),
        }

        // unsubscribe stops delivery
        events.toggle(event_names::QUEUE_CREATED, "push-a", &c1, false);
        events.fire(&clients, event_names::QUEUE_CREATED, "push-a", json!({}));
        assert!(rx.try_recv().is_err());
    }
}
