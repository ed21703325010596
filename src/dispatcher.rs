//! Inbound frame classification and event fan-out.

use crate::error::{RealtimeError, Result};
use crate::events::DomainEvent;
use crate::identity::Topic;
use crate::models::{Event, Packet, PING};
use crate::registry::SubscriptionRegistry;
use crate::store::ClientStore;
use serde_json::Value;
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, warn};

/// Coarse "something changed" callback.
pub type RefreshCallback = Arc<dyn Fn() + Send + Sync>;

/// A classified inbound text frame.
#[derive(Debug, PartialEq)]
pub(crate) enum Inbound {
    /// Heartbeat ping from the broker.
    Ping,
    /// An event delivered on a topic.
    Delivery { topic: Topic, event: DomainEvent },
    /// Response to one of our packets.
    Reply(Packet),
    /// The broker is closing the connection.
    Disconnect(Packet),
    /// Valid packet the client has no use for.
    Ignored(Packet),
}

/// Classifies a text frame. Errors are decode errors; the frame is to be dropped.
pub(crate) fn classify(text: &str) -> Result<Inbound> {
    if text == PING {
        return Ok(Inbound::Ping);
    }
    let packet: Packet = serde_json::from_str(text)?;
    match packet.event {
        Some(Event::Publish) => {
            let Some(Value::Object(mut data)) = packet.data else {
                return Err(RealtimeError::Decode(
                    "publish packet without object data".to_string(),
                ));
            };
            let topic = match data.remove("channel") {
                Some(Value::String(channel)) => channel,
                _ => {
                    return Err(RealtimeError::Decode(
                        "publish packet without channel".to_string(),
                    ))
                }
            };
            let payload = data.remove("data").unwrap_or(Value::Null);
            let event = DomainEvent::decode(payload)?;
            Ok(Inbound::Delivery { topic, event })
        }
        Some(Event::Disconnect) => Ok(Inbound::Disconnect(packet)),
        None if packet.rid.is_some() => Ok(Inbound::Reply(packet)),
        _ => Ok(Inbound::Ignored(packet)),
    }
}

/// Fans decoded events out to subscribers, refresh callbacks and the store.
pub(crate) struct Dispatcher {
    store: Arc<RwLock<ClientStore>>,
    refresh: BTreeMap<u64, RefreshCallback>,
}

impl Dispatcher {
    pub(crate) fn new(store: Arc<RwLock<ClientStore>>) -> Self {
        Dispatcher {
            store,
            refresh: BTreeMap::new(),
        }
    }

    pub(crate) fn store(&self) -> &Arc<RwLock<ClientStore>> {
        &self.store
    }

    pub(crate) fn register_refresh(&mut self, id: u64, callback: RefreshCallback) {
        self.refresh.insert(id, callback);
    }

    pub(crate) fn unregister_refresh(&mut self, id: u64) -> bool {
        self.refresh.remove(&id).is_some()
    }

    /// Dispatches one event. Returns whether it reached any subscriber.
    ///
    /// Duplicates are discarded before any callback runs. Subscribers see the
    /// event first, then the store reduces it.
    pub(crate) async fn dispatch(
        &mut self,
        registry: &SubscriptionRegistry,
        topic: &str,
        event: DomainEvent,
    ) -> bool {
        if !registry.contains_topic(topic) {
            debug!("Dropping {} event for unsubscribed topic {}", event.kind(), topic);
            return false;
        }
        if self.store.read().await.is_duplicate(&event) {
            debug!("Discarding duplicate {} event on {}", event.kind(), topic);
            return false;
        }

        for callback in registry.callbacks(topic) {
            if catch_unwind(AssertUnwindSafe(|| callback(topic, &event))).is_err() {
                error!("Subscriber callback for {} panicked", topic);
            }
        }

        let changed = self.store.write().await.apply(&event);
        if changed || matches!(event, DomainEvent::Alert(_)) {
            self.notify_refresh();
        }
        true
    }

    /// Invokes every refresh callback.
    pub(crate) fn notify_refresh(&self) {
        for (id, callback) in &self.refresh {
            if catch_unwind(AssertUnwindSafe(|| callback())).is_err() {
                warn!("Refresh callback {} panicked", id);
            }
        }
    }
}
