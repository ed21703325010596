//! Typed domain events decoded from broker deliveries.
//!
//! Deliveries carry either the `{type, data}` envelope or, on the legacy
//! notification path, a bare `{subject, content}` pair. Both are decoded
//! once, here, into [`DomainEvent`].

use crate::error::{RealtimeError, Result};
use crate::identity::Role;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A file attached to a chat message.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Attachment {
    pub name: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// A chat message delivered on a conversation channel.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MessageEvent {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    pub created_at: DateTime<Utc>,
}

/// A reaction added to (or removed from) a message.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ReactionEvent {
    pub conversation_id: String,
    pub message_id: String,
    pub user_id: String,
    pub emoji: String,
    #[serde(default)]
    pub removed: bool,
}

/// Typing indicator for a participant.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TypingEvent {
    pub conversation_id: String,
    pub user_id: String,
    pub typing: bool,
}

/// Messages or notifications marked as read.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct ReadReceiptEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    pub reader_id: String,
    #[serde(default)]
    pub message_ids: Vec<String>,
    #[serde(default)]
    pub notification_ids: Vec<String>,
}

/// Online status change of a participant.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PresenceEvent {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    pub online: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
}

/// Read status of a notification.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum NotificationStatus {
    #[default]
    Unread,
    Read,
}

/// A notification pushed on the per-user channel.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct NotificationEvent {
    pub id: String,
    pub subject: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status: NotificationStatus,
}

/// Legacy `{subject, content}` notification, shown as a transient alert.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Alert {
    pub subject: String,
    pub content: String,
}

/// Domain event decoded from a delivery.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum DomainEvent {
    Message(MessageEvent),
    Reaction(ReactionEvent),
    Typing(TypingEvent),
    ReadReceipt(ReadReceiptEvent),
    PresenceChange(PresenceEvent),
    Notification(NotificationEvent),
    /// Never serialized by the broker in envelope form; produced from the legacy path.
    #[serde(skip)]
    Alert(Alert),
}

impl DomainEvent {
    /// Decodes a delivery payload.
    pub fn decode(payload: Value) -> Result<Self> {
        if payload.get("type").is_some() {
            return serde_json::from_value(payload).map_err(RealtimeError::from);
        }
        match serde_json::from_value::<Alert>(payload) {
            Ok(alert) => Ok(DomainEvent::Alert(alert)),
            Err(e) => Err(RealtimeError::Decode(format!(
                "payload is neither an event envelope nor a legacy alert: {e}"
            ))),
        }
    }

    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            DomainEvent::Message(_) => "message",
            DomainEvent::Reaction(_) => "reaction",
            DomainEvent::Typing(_) => "typing",
            DomainEvent::ReadReceipt(_) => "read-receipt",
            DomainEvent::PresenceChange(_) => "presence-change",
            DomainEvent::Notification(_) => "notification",
            DomainEvent::Alert(_) => "alert",
        }
    }
}

/// Outbound chat commands published on a conversation channel.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum OutboundCommand {
    SendMessage {
        conversation_id: String,
        content: String,
        attachments: Vec<Attachment>,
    },
    DeleteMessage {
        conversation_id: String,
        message_id: String,
    },
    MarkRead(ReadReceiptEvent),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_message_envelope() {
        let event = DomainEvent::decode(json!({
            "type": "message",
            "data": {
                "id": "m1",
                "conversation_id": "c1",
                "sender_id": "u2",
                "content": "hello",
                "created_at": "2024-03-01T10:00:00Z"
            }
        }))
        .unwrap();
        match event {
            DomainEvent::Message(message) => {
                assert_eq!(message.id, "m1");
                assert!(message.attachments.is_empty());
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn decodes_kebab_case_kinds() {
        let event = DomainEvent::decode(json!({
            "type": "presence-change",
            "data": { "user_id": "u9", "online": true, "role": "company" }
        }))
        .unwrap();
        assert_eq!(event.kind(), "presence-change");

        let event = DomainEvent::decode(json!({
            "type": "read-receipt",
            "data": { "reader_id": "u1", "notification_ids": ["n1"] }
        }))
        .unwrap();
        assert_eq!(event.kind(), "read-receipt");
    }

    #[test]
    fn notification_status_defaults_to_unread() {
        let event = DomainEvent::decode(json!({
            "type": "notification",
            "data": { "id": "n1", "subject": "Offer", "content": "Accepted" }
        }))
        .unwrap();
        assert!(matches!(
            event,
            DomainEvent::Notification(NotificationEvent { status: NotificationStatus::Unread, .. })
        ));
    }

    #[test]
    fn legacy_pair_becomes_alert() {
        let event =
            DomainEvent::decode(json!({ "subject": "Convention", "content": "Signed" })).unwrap();
        assert_eq!(
            event,
            DomainEvent::Alert(Alert {
                subject: "Convention".into(),
                content: "Signed".into()
            })
        );
    }

    #[test]
    fn rejects_unknown_kind_and_garbage() {
        assert!(matches!(
            DomainEvent::decode(json!({ "type": "earthquake", "data": {} })),
            Err(RealtimeError::Decode(_))
        ));
        assert!(matches!(
            DomainEvent::decode(json!(42)),
            Err(RealtimeError::Decode(_))
        ));
    }

    #[test]
    fn outbound_command_uses_envelope_shape() {
        let value = serde_json::to_value(OutboundCommand::DeleteMessage {
            conversation_id: "c1".into(),
            message_id: "m1".into(),
        })
        .unwrap();
        assert_eq!(
            value,
            json!({ "type": "delete-message", "data": { "conversation_id": "c1", "message_id": "m1" } })
        );
    }
}
