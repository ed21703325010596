//! Client state store.
//!
//! A reducer over [`DomainEvent`]s. Only the client loop holds write access;
//! the UI gets a [`StoreReader`]. Unread counts are always derived from the
//! entities, never stored.

use crate::events::{
    Attachment, DomainEvent, MessageEvent, NotificationEvent, NotificationStatus, PresenceEvent,
    ReactionEvent, ReadReceiptEvent, TypingEvent,
};
use crate::identity::Role;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{RwLock, RwLockReadGuard};
use tracing::debug;

/// A reaction on a message.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Reaction {
    pub user_id: String,
    pub emoji: String,
}

/// A chat message.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Message {
    pub id: String,
    pub sender_id: String,
    pub content: String,
    pub read: bool,
    #[serde(default)]
    pub reactions: Vec<Reaction>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    pub created_at: DateTime<Utc>,
}

/// A conversation and its messages in arrival order.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct Conversation {
    pub id: String,
    pub messages: Vec<Message>,
    pub participants: BTreeSet<String>,
    #[serde(default)]
    pub typing: BTreeSet<String>,
}

impl Conversation {
    /// Creates an empty conversation.
    pub fn new(id: impl Into<String>) -> Self {
        Conversation {
            id: id.into(),
            ..Default::default()
        }
    }

    /// Unread messages not sent by `own_id`.
    pub fn unread_count(&self, own_id: Option<&str>) -> usize {
        self.messages
            .iter()
            .filter(|m| !m.read && Some(m.sender_id.as_str()) != own_id)
            .count()
    }

    /// Looks up a message by id.
    pub fn message(&self, id: &str) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    fn message_mut(&mut self, id: &str) -> Option<&mut Message> {
        self.messages.iter_mut().find(|m| m.id == id)
    }
}

/// A chat participant and their presence.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Participant {
    pub id: String,
    pub role: Option<Role>,
    pub online: bool,
    pub last_seen: Option<DateTime<Utc>>,
}

/// A user notification.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Notification {
    pub id: String,
    pub subject: String,
    pub content: String,
    pub created_at: Option<DateTime<Utc>>,
    pub status: NotificationStatus,
}

/// Process-wide cache of realtime state for one identity.
#[derive(Debug, Default)]
pub struct ClientStore {
    user_id: Option<String>,
    conversations: BTreeMap<String, Conversation>,
    participants: HashMap<String, Participant>,
    notifications: Vec<Notification>,
    /// Message id to conversation id.
    message_index: HashMap<String, String>,
}

impl ClientStore {
    /// The user the store is scoped to.
    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    /// Conversation by id, if any event or seed mentioned it.
    pub fn conversation(&self, id: &str) -> Option<&Conversation> {
        self.conversations.get(id)
    }

    /// All known conversations, ordered by id.
    pub fn conversations(&self) -> impl Iterator<Item = &Conversation> {
        self.conversations.values()
    }

    /// Participant by user id, known once a presence change was seen.
    pub fn participant(&self, id: &str) -> Option<&Participant> {
        self.participants.get(id)
    }

    /// Whether the participant is currently online.
    pub fn is_online(&self, id: &str) -> bool {
        self.participants.get(id).is_some_and(|p| p.online)
    }

    /// Notifications in arrival order.
    pub fn notifications(&self) -> &[Notification] {
        &self.notifications
    }

    /// Notification by id.
    pub fn notification(&self, id: &str) -> Option<&Notification> {
        self.notifications.iter().find(|n| n.id == id)
    }

    /// Whether a message with this id is present in any conversation.
    pub fn has_message(&self, id: &str) -> bool {
        self.message_index.contains_key(id)
    }

    /// Unread messages from other participants, across all conversations.
    pub fn unread_messages(&self) -> usize {
        let own = self.user_id();
        self.conversations
            .values()
            .map(|c| c.unread_count(own))
            .sum()
    }

    /// Notifications still in `UNREAD` status.
    pub fn unread_notifications(&self) -> usize {
        self.notifications
            .iter()
            .filter(|n| n.status == NotificationStatus::Unread)
            .count()
    }

    /// Unread messages plus unread notifications, recomputed on every call.
    pub fn unread_total(&self) -> usize {
        self.unread_messages() + self.unread_notifications()
    }

    /// Whether the event carries an identifier that is already stored.
    pub fn is_duplicate(&self, event: &DomainEvent) -> bool {
        match event {
            DomainEvent::Message(message) => self.has_message(&message.id),
            DomainEvent::Notification(notification) => {
                self.notification(&notification.id).is_some()
            }
            _ => false,
        }
    }

    /// Applies an event. Returns whether the state changed.
    pub(crate) fn apply(&mut self, event: &DomainEvent) -> bool {
        match event {
            DomainEvent::Message(message) => self.apply_message(message),
            DomainEvent::Reaction(reaction) => self.apply_reaction(reaction),
            DomainEvent::Typing(typing) => self.apply_typing(typing),
            DomainEvent::ReadReceipt(receipt) => self.apply_read_receipt(receipt),
            DomainEvent::PresenceChange(presence) => self.apply_presence(presence),
            DomainEvent::Notification(notification) => self.apply_notification(notification),
            // Transient, rendered by subscribers only.
            DomainEvent::Alert(_) => false,
        }
    }

    fn apply_message(&mut self, event: &MessageEvent) -> bool {
        if self.has_message(&event.id) {
            return false;
        }
        let own = self.user_id.as_deref() == Some(event.sender_id.as_str());
        let conversation = self
            .conversations
            .entry(event.conversation_id.clone())
            .or_insert_with(|| Conversation::new(event.conversation_id.clone()));
        conversation.participants.insert(event.sender_id.clone());
        conversation.typing.remove(&event.sender_id);
        conversation.messages.push(Message {
            id: event.id.clone(),
            sender_id: event.sender_id.clone(),
            content: event.content.clone(),
            read: own,
            reactions: Vec::new(),
            attachments: event.attachments.clone(),
            created_at: event.created_at,
        });
        self.message_index
            .insert(event.id.clone(), event.conversation_id.clone());
        true
    }

    fn apply_reaction(&mut self, event: &ReactionEvent) -> bool {
        let Some(message) = self
            .conversations
            .get_mut(&event.conversation_id)
            .and_then(|c| c.message_mut(&event.message_id))
        else {
            debug!("Reaction for unknown message {}", event.message_id);
            return false;
        };
        let reaction = Reaction {
            user_id: event.user_id.clone(),
            emoji: event.emoji.clone(),
        };
        if event.removed {
            let before = message.reactions.len();
            message.reactions.retain(|r| *r != reaction);
            before != message.reactions.len()
        } else if message.reactions.contains(&reaction) {
            false
        } else {
            message.reactions.push(reaction);
            true
        }
    }

    fn apply_typing(&mut self, event: &TypingEvent) -> bool {
        let Some(conversation) = self.conversations.get_mut(&event.conversation_id) else {
            return false;
        };
        if event.typing {
            conversation.typing.insert(event.user_id.clone())
        } else {
            conversation.typing.remove(&event.user_id)
        }
    }

    fn apply_read_receipt(&mut self, event: &ReadReceiptEvent) -> bool {
        let mut changed = false;

        for id in &event.message_ids {
            let Some(conversation_id) = self.message_index.get(id) else {
                continue;
            };
            if let Some(message) = self
                .conversations
                .get_mut(conversation_id)
                .and_then(|c| c.message_mut(id))
            {
                changed |= !message.read;
                message.read = true;
            }
        }

        // A receipt without explicit ids covers the whole conversation.
        if event.message_ids.is_empty() {
            if let Some(conversation) = event
                .conversation_id
                .as_ref()
                .and_then(|id| self.conversations.get_mut(id))
            {
                for message in conversation
                    .messages
                    .iter_mut()
                    .filter(|m| m.sender_id != event.reader_id)
                {
                    changed |= !message.read;
                    message.read = true;
                }
            }
        }

        for id in &event.notification_ids {
            if let Some(notification) = self.notifications.iter_mut().find(|n| &n.id == id) {
                changed |= notification.status != NotificationStatus::Read;
                notification.status = NotificationStatus::Read;
            }
        }
        changed
    }

    fn apply_presence(&mut self, event: &PresenceEvent) -> bool {
        let participant = self
            .participants
            .entry(event.user_id.clone())
            .or_insert_with(|| Participant {
                id: event.user_id.clone(),
                role: event.role,
                online: false,
                last_seen: None,
            });
        let before = participant.clone();
        participant.online = event.online;
        if event.role.is_some() {
            participant.role = event.role;
        }
        if event.last_seen.is_some() {
            participant.last_seen = event.last_seen;
        }
        if !event.online {
            for conversation in self.conversations.values_mut() {
                conversation.typing.remove(&event.user_id);
            }
        }
        *participant != before
    }

    fn apply_notification(&mut self, event: &NotificationEvent) -> bool {
        if self.notification(&event.id).is_some() {
            return false;
        }
        self.notifications.push(Notification {
            id: event.id.clone(),
            subject: event.subject.clone(),
            content: event.content.clone(),
            created_at: event.created_at,
            status: event.status,
        });
        true
    }

    /// Seeds a conversation fetched over REST. Messages already present are kept.
    pub(crate) fn load_conversation(&mut self, conversation: Conversation) -> bool {
        let entry = self
            .conversations
            .entry(conversation.id.clone())
            .or_insert_with(|| Conversation::new(conversation.id.clone()));
        let mut changed = false;
        for participant in conversation.participants {
            changed |= entry.participants.insert(participant);
        }
        for message in conversation.messages {
            if self.message_index.contains_key(&message.id) {
                continue;
            }
            self.message_index
                .insert(message.id.clone(), conversation.id.clone());
            entry.messages.push(message);
            changed = true;
        }
        if changed {
            // Seeded history may predate messages that arrived live.
            entry.messages.sort_by_key(|m| m.created_at);
        }
        changed
    }

    /// Removes a message after the server was asked to delete it.
    pub(crate) fn remove_message(&mut self, conversation_id: &str, message_id: &str) -> bool {
        let Some(conversation) = self.conversations.get_mut(conversation_id) else {
            return false;
        };
        let before = conversation.messages.len();
        conversation.messages.retain(|m| m.id != message_id);
        if before == conversation.messages.len() {
            return false;
        }
        self.message_index.remove(message_id);
        true
    }

    /// Scopes the store to a user without dropping seeded state.
    pub(crate) fn set_user(&mut self, user_id: Option<String>) {
        self.user_id = user_id;
    }

    /// Drops all state, scoping the store to `user_id`.
    pub(crate) fn reset(&mut self, user_id: Option<String>) {
        *self = ClientStore {
            user_id,
            ..Default::default()
        };
    }
}

/// Read-only access to the store.
#[derive(Clone, Debug)]
pub struct StoreReader(Arc<RwLock<ClientStore>>);

impl StoreReader {
    pub(crate) fn new(store: Arc<RwLock<ClientStore>>) -> Self {
        StoreReader(store)
    }

    /// Locks the store for reading.
    pub async fn read(&self) -> RwLockReadGuard<'_, ClientStore> {
        self.0.read().await
    }

    pub async fn unread_total(&self) -> usize {
        self.0.read().await.unread_total()
    }

    /// Clone of a conversation, if known.
    pub async fn conversation(&self, id: &str) -> Option<Conversation> {
        self.0.read().await.conversation(id).cloned()
    }
}
