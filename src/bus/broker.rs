//! In-process broker: broadcast fan-out plus a retained-value map.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, oneshot};

use super::client::{BusClient, Delivery, LastWill, Subscription};

/// Delivery tier requested for a message.
///
/// Telemetry uses [`QoS::AtMostOnce`]; commands that must land use
/// [`QoS::AtLeastOnce`]; physically significant events where a duplicate would
/// corrupt accounting (dosing events, state transitions) use
/// [`QoS::ExactlyOnce`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QoS {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

/// A message as it travels on the bus.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub topic: Arc<str>,
    pub payload: Arc<str>,
    pub qos: QoS,
    pub retain: bool,
}

struct BusInner {
    tx: broadcast::Sender<BusMessage>,
    /// Last retained message per topic. An empty retained payload clears the slot.
    retained: Mutex<HashMap<String, BusMessage>>,
}

/// Broadcast channel for bus messages with retained last-value semantics.
///
/// Cheap to clone; all clones share the same broker state.
#[derive(Clone)]
pub struct Bus {
    inner: Arc<BusInner>,
}

impl Bus {
    /// Creates a new bus with the given channel capacity (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(BusInner {
                tx,
                retained: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Creates a client with no last-will.
    pub fn client(&self) -> BusClient {
        BusClient::new(self.clone(), None)
    }

    /// Creates a client whose [`LastWill`] is published if the client is
    /// dropped without a clean disconnect.
    pub fn client_with_will(&self, will: LastWill) -> BusClient {
        BusClient::new(self.clone(), Some(will))
    }

    /// Last retained payload on `topic`, if any.
    pub fn retained(&self, topic: &str) -> Option<Arc<str>> {
        self.lock_retained().get(topic).map(|m| m.payload.clone())
    }

    pub(super) fn publish(&self, msg: BusMessage) -> Delivery {
        if msg.retain {
            let mut retained = self.lock_retained();
            if msg.payload.is_empty() {
                retained.remove(msg.topic.as_ref());
            } else {
                retained.insert(msg.topic.to_string(), msg.clone());
            }
        }

        // No subscribers is fine.
        let _ = self.inner.tx.send(msg);

        // The in-process broker acknowledges at enqueue time.
        let (ack_tx, ack_rx) = oneshot::channel();
        let _ = ack_tx.send(());
        Delivery::new(ack_rx)
    }

    /// Subscribes with topic filters; retained messages matching a filter are
    /// replayed before live traffic.
    pub(super) fn subscribe(&self, filters: Vec<String>) -> Subscription {
        let rx = self.inner.tx.subscribe();
        let backlog = {
            let retained = self.lock_retained();
            let mut msgs: Vec<BusMessage> = retained
                .values()
                .filter(|m| filters.iter().any(|f| super::topic_matches(f, &m.topic)))
                .cloned()
                .collect();
            msgs.sort_by(|a, b| a.topic.cmp(&b.topic));
            msgs
        };
        Subscription::new(rx, filters, backlog)
    }

    fn lock_retained(&self) -> std::sync::MutexGuard<'_, HashMap<String, BusMessage>> {
        self.inner
            .retained
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn retained_value_replayed_to_late_subscriber() {
        let bus = Bus::new(16);
        let client = bus.client();

        client
            .publish("a/b/c", "41", QoS::AtMostOnce, true)
            .acked()
            .await;
        client
            .publish("a/b/c", "42", QoS::AtMostOnce, true)
            .acked()
            .await;

        let mut sub = client.subscribe(vec!["a/b/c".to_string()]);
        let msg = sub.recv().await.expect("retained replay");
        assert_eq!(msg.payload.as_ref(), "42");
    }

    #[tokio::test]
    async fn empty_retained_payload_clears_slot() {
        let bus = Bus::new(16);
        let client = bus.client();

        client.publish("x/y", "1", QoS::AtMostOnce, true);
        client.publish("x/y", "", QoS::AtMostOnce, true);
        assert!(bus.retained("x/y").is_none());
    }

    #[tokio::test]
    async fn live_messages_are_filtered() {
        let bus = Bus::new(16);
        let client = bus.client();
        let mut sub = client.subscribe(vec!["root/+/state".to_string()]);

        client.publish("root/u1/other", "no", QoS::AtMostOnce, false);
        client.publish("root/u1/state", "yes", QoS::AtMostOnce, false);

        let msg = sub.recv().await.expect("live message");
        assert_eq!(msg.payload.as_ref(), "yes");
    }
}
