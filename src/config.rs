//! Configuration module for the realtime client.
//!
//! This module defines the `ClientConfig` struct. It deserializes from any
//! serde source (file, environment map) with durations given in whole seconds.

use crate::identity::Role;
use serde::Deserialize;
use std::time::Duration;

/// Client configuration struct.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// WebSocket URL of the broker.
    pub url: String,

    /// Fixed delay before each reconnect attempt after a transport failure.
    #[serde(deserialize_with = "crate::utils::deserialize_duration")]
    pub reconnect_delay: Duration,

    /// Connection is considered closed when no frame arrives within this window.
    /// Overridden by the `pingTimeout` the broker advertises in its handshake reply.
    #[serde(deserialize_with = "crate::utils::deserialize_duration")]
    pub ping_timeout: Duration,

    /// Upper bound for the connect handshake.
    #[serde(deserialize_with = "crate::utils::deserialize_duration")]
    pub handshake_timeout: Duration,

    /// Roles allowed to open a realtime connection.
    pub realtime_roles: Vec<Role>,
}

impl ClientConfig {
    /// Creates a configuration for the given broker URL with default timings.
    pub fn new(url: impl Into<String>) -> Self {
        ClientConfig {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Whether the role may use realtime features.
    pub fn is_eligible(&self, role: Role) -> bool {
        self.realtime_roles.contains(&role)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            url: "ws://127.0.0.1:8000/socketcluster/".to_string(),
            reconnect_delay: Duration::from_secs(5),
            ping_timeout: Duration::from_secs(20),
            handshake_timeout: Duration::from_secs(10),
            realtime_roles: vec![Role::Teacher, Role::Student, Role::Company],
        }
    }
}
