//! Wire models for the broker protocol.
//!
//! This module defines the packet structure exchanged with the broker,
//! including the `Event` enum and the `Packet` struct, plus constructors for
//! every packet the client sends.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Text frame the broker sends as a heartbeat ping.
pub const PING: &str = "#1";

/// Text frame the client answers a heartbeat ping with.
pub const PONG: &str = "#2";

/// Represents the protocol events exchanged with the broker.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum Event {
    /// Handshake carrying the bearer credential.
    #[serde(rename = "#handshake")]
    Handshake,
    /// Subscribe to a channel.
    #[serde(rename = "#subscribe")]
    Subscribe,
    /// Publish to a channel, or a delivery from one.
    #[serde(rename = "#publish")]
    Publish,
    /// Unsubscribe from a channel.
    #[serde(rename = "#unsubscribe")]
    Unsubscribe,
    /// Broker-initiated disconnect.
    #[serde(rename = "#disconnect")]
    Disconnect,
}

/// Represents a packet of data exchanged with the broker.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Packet {
    /// The type of event associated with this packet.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event: Option<Event>,
    /// The main payload of the packet.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Client-generated ID for the packet.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cid: Option<u64>,
    /// Broker-generated response ID. Matches the `cid` of the request packet.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rid: Option<u64>,
    /// Error information, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

impl Packet {
    pub(crate) fn handshake(cid: u64, auth_token: &str) -> Self {
        Packet {
            event: Some(Event::Handshake),
            data: Some(json!({ "authToken": auth_token })),
            cid: Some(cid),
            ..Default::default()
        }
    }

    pub(crate) fn subscribe(cid: u64, channel: &str) -> Self {
        Packet {
            event: Some(Event::Subscribe),
            data: Some(json!({ "channel": channel })),
            cid: Some(cid),
            ..Default::default()
        }
    }

    pub(crate) fn unsubscribe(cid: u64, channel: &str) -> Self {
        Packet {
            event: Some(Event::Unsubscribe),
            data: Some(Value::String(channel.to_string())),
            cid: Some(cid),
            ..Default::default()
        }
    }

    pub(crate) fn publish(cid: u64, channel: &str, data: Value) -> Self {
        Packet {
            event: Some(Event::Publish),
            data: Some(json!({ "channel": channel, "data": data })),
            cid: Some(cid),
            ..Default::default()
        }
    }

    /// Name of the error carried by a response packet, if any.
    pub fn error_name(&self) -> Option<&str> {
        self.error
            .as_ref()
            .and_then(|e| e.get("name"))
            .and_then(Value::as_str)
    }

    /// Human readable error description of a response packet.
    pub fn error_message(&self) -> String {
        match &self.error {
            Some(Value::String(message)) => message.clone(),
            Some(error) => error
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string()),
            None => String::new(),
        }
    }
}
