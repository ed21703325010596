//! Subscription registry.
//!
//! Maps topics to the local callbacks registered for them. The registry only
//! tracks local state; the client loop decides when the broker has to hear
//! about a change (first callback added, last callback removed).

use crate::events::DomainEvent;
use crate::identity::Topic;
use std::collections::HashMap;
use std::sync::Arc;

/// Callback invoked for every event delivered on a subscribed topic.
pub type Callback = Arc<dyn Fn(&str, &DomainEvent) + Send + Sync>;

/// Identifier of one registered callback.
pub type SubscriptionId = u64;

struct Entry {
    id: SubscriptionId,
    callback: Callback,
}

/// Topic to callbacks map.
#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    topics: HashMap<Topic, Vec<Entry>>,
    index: HashMap<SubscriptionId, Topic>,
}

impl SubscriptionRegistry {
    /// Registers a callback. Returns `true` when it is the first one for the topic.
    pub(crate) fn insert(&mut self, id: SubscriptionId, topic: Topic, callback: Callback) -> bool {
        let entries = self.topics.entry(topic.clone()).or_default();
        let first = entries.is_empty();
        entries.push(Entry { id, callback });
        self.index.insert(id, topic);
        first
    }

    /// Removes a callback. Returns its topic and whether it was the last one.
    /// Unknown ids yield `None`.
    pub(crate) fn remove(&mut self, id: SubscriptionId) -> Option<(Topic, bool)> {
        let topic = self.index.remove(&id)?;
        let entries = self.topics.get_mut(&topic)?;
        entries.retain(|e| e.id != id);
        let last = entries.is_empty();
        if last {
            self.topics.remove(&topic);
        }
        Some((topic, last))
    }

    /// Snapshot of the callbacks for a topic, in registration order.
    pub(crate) fn callbacks(&self, topic: &str) -> Vec<Callback> {
        self.topics
            .get(topic)
            .map(|entries| entries.iter().map(|e| e.callback.clone()).collect())
            .unwrap_or_default()
    }

    pub(crate) fn contains_topic(&self, topic: &str) -> bool {
        self.topics.contains_key(topic)
    }

    /// All topics with at least one callback.
    pub(crate) fn topics(&self) -> Vec<Topic> {
        let mut topics: Vec<Topic> = self.topics.keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Drops every registration, returning the topics that were live.
    pub(crate) fn clear(&mut self) -> Vec<Topic> {
        let topics = self.topics();
        self.topics.clear();
        self.index.clear();
        topics
    }

    pub(crate) fn len(&self) -> usize {
        self.index.len()
    }
}
