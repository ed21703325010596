//! Session identity and topic naming.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Dashboard role of an authenticated user.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Teacher,
    Student,
    Company,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Admin => "admin",
            Role::Teacher => "teacher",
            Role::Student => "student",
            Role::Company => "company",
        };
        f.write_str(name)
    }
}

/// Stable key identifying one connectable identity.
///
/// Derived from role and token so two logins with different credentials never
/// share a connection, without the token itself showing up in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IdentityKey(Uuid);

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The identity a connection is opened for.
#[derive(derive_more::Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Backend user identifier.
    pub user_id: String,
    /// Dashboard role.
    pub role: Role,
    /// Bearer credential presented in the handshake.
    #[debug(skip)]
    pub token: String,
}

impl Identity {
    /// Creates a new identity.
    pub fn new(user_id: impl Into<String>, role: Role, token: impl Into<String>) -> Self {
        Identity {
            user_id: user_id.into(),
            role,
            token: token.into(),
        }
    }

    /// Key derived from role and token.
    pub fn key(&self) -> IdentityKey {
        let name = format!("{}:{}", self.role, self.token);
        IdentityKey(Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()))
    }
}

/// Type alias for topic (channel) names.
pub type Topic = String;

/// Per-user notification channel.
pub fn notification_topic(user_id: &str) -> Topic {
    format!("notifications/{user_id}")
}

/// Per-conversation message channel.
pub fn conversation_topic(conversation_id: &str) -> Topic {
    format!("conversations/{conversation_id}")
}
