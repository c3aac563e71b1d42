//! Client handles: publish/subscribe, acknowledgement, last-will.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use log::warn;
use tokio::sync::{broadcast, oneshot};

use super::broker::{Bus, BusMessage, QoS};

/// Message registered at connection time and published by the broker when the
/// owning client is dropped without a clean [`BusClient::disconnect`].
#[derive(Debug, Clone)]
pub struct LastWill {
    pub topic: String,
    pub payload: String,
    pub qos: QoS,
    pub retain: bool,
}

struct ClientState {
    bus: Bus,
    will: Mutex<Option<LastWill>>,
}

impl Drop for ClientState {
    fn drop(&mut self) {
        let will = self
            .will
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(w) = will {
            self.bus.publish(BusMessage {
                topic: w.topic.into(),
                payload: w.payload.into(),
                qos: w.qos,
                retain: w.retain,
            });
        }
    }
}

/// A connection handle to the [`Bus`].
///
/// Cheap to clone; all clones share the same connection state, so the last-will
/// fires once, when the final clone goes away uncleanly.
#[derive(Clone)]
pub struct BusClient {
    state: Arc<ClientState>,
}

impl BusClient {
    pub(super) fn new(bus: Bus, will: Option<LastWill>) -> Self {
        Self {
            state: Arc::new(ClientState {
                bus,
                will: Mutex::new(will),
            }),
        }
    }

    /// Publishes `payload` on `topic`. Returns a [`Delivery`] that resolves on
    /// broker acknowledgement.
    pub fn publish(
        &self,
        topic: impl Into<Arc<str>>,
        payload: impl Into<Arc<str>>,
        qos: QoS,
        retain: bool,
    ) -> Delivery {
        self.state.bus.publish(BusMessage {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain,
        })
    }

    /// Subscribes to every topic matching one of `filters`. Retained values are
    /// replayed first.
    pub fn subscribe(&self, filters: Vec<String>) -> Subscription {
        self.state.bus.subscribe(filters)
    }

    /// Cleanly disconnects: the registered last-will is discarded.
    pub fn disconnect(&self) {
        self.state
            .will
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
    }
}

/// Acknowledgement handle returned by [`BusClient::publish`].
pub struct Delivery {
    rx: oneshot::Receiver<()>,
}

impl Delivery {
    pub(super) fn new(rx: oneshot::Receiver<()>) -> Self {
        Self { rx }
    }

    /// Resolves once the broker has accepted the message.
    pub async fn acked(self) -> bool {
        self.rx.await.is_ok()
    }
}

/// A filtered stream of bus messages.
pub struct Subscription {
    rx: broadcast::Receiver<BusMessage>,
    filters: Vec<String>,
    backlog: VecDeque<BusMessage>,
}

impl Subscription {
    pub(super) fn new(
        rx: broadcast::Receiver<BusMessage>,
        filters: Vec<String>,
        backlog: Vec<BusMessage>,
    ) -> Self {
        Self {
            rx,
            filters,
            backlog: backlog.into(),
        }
    }

    /// Next matching message, or `None` once the bus is gone.
    ///
    /// A lagged receiver skips the overrun and keeps going; retained values
    /// make the current state recoverable regardless.
    pub async fn recv(&mut self) -> Option<BusMessage> {
        if let Some(msg) = self.backlog.pop_front() {
            return Some(msg);
        }
        loop {
            match self.rx.recv().await {
                Ok(msg) if self.matches(&msg.topic) => return Some(msg),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("bus subscription lagged, skipped {n} messages");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    fn matches(&self, topic: &str) -> bool {
        self.filters.iter().any(|f| super::topic_matches(f, topic))
    }
}
