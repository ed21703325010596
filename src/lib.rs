//! # Internship Realtime
//!
//! Real-time notification and chat transport for the internship management
//! dashboards. The client keeps one persistent connection to a
//! SocketCluster v1 style broker, multiplexes deliveries to local
//! subscribers and keeps a small in-memory store of chat and notification
//! state for the UI.
//!
//! ## Features
//!
//! - Single WebSocket connection per authenticated identity
//! - Topic subscriptions with explicit handles, re-issued after every reconnect
//! - Fixed-delay reconnect and heartbeat supervision
//! - Typed domain events decoded once at the boundary
//! - Idempotent store of conversations, participants and notifications
//! - Session binding that follows the authentication state
//!
//! ## Main Components
//!
//! - `RealtimeClient`: Handle onto the event loop that owns the connection.
//! - `SessionBinder`: Connects and tears down as the user logs in and out.
//! - `ClientStore`: Derived UI state, read through a `StoreReader`.
//! - `DomainEvent`: Decoded representation of every delivery.
//! - `ClientConfig`: Client configuration.
//!
//! ## Getting Started
//!
//! ```no_run
//! use internship_realtime::{
//!     conversation_topic, AuthState, ClientConfig, Identity, RealtimeClient, Role, SessionBinder,
//! };
//! use tokio::sync::watch;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = ClientConfig::new("wss://broker.example.org/socketcluster/");
//!     let client = RealtimeClient::websocket(config.clone());
//!
//!     // Feed the binder from the authentication layer.
//!     let (auth_tx, auth_rx) = watch::channel(AuthState::Unauthenticated);
//!     SessionBinder::new(&config).spawn(client.clone(), auth_rx, |key| {
//!         tracing::warn!("session {key} expired, redirecting to login");
//!     });
//!     auth_tx
//!         .send(AuthState::Authenticated(Identity::new("42", Role::Student, "jwt")))
//!         .unwrap();
//!
//!     let _chat = client.subscribe(conversation_topic("c-17"), |topic, event| {
//!         tracing::info!("{topic}: {}", event.kind());
//!     });
//!
//!     let unread = client.store().unread_total().await;
//!     tracing::info!("{unread} unread");
//! }
//! ```

mod client;
mod config;
mod connection;
mod dispatcher;
mod error;
mod events;
mod identity;
mod models;
mod registry;
mod session;
mod store;
mod transport;
mod utils;

pub use client::*;
pub use config::*;
pub use connection::ConnectionStatus;
pub use dispatcher::RefreshCallback;
pub use error::*;
pub use events::*;
pub use identity::*;
pub use models::*;
pub use registry::{Callback, SubscriptionId};
pub use session::*;
pub use store::*;
pub use transport::*;

#[cfg(test)]
#[path = "tests/mock_broker.rs"]
mod mock_broker;

#[cfg(test)]
#[path = "tests/test_client.rs"]
mod test_client;

#[cfg(test)]
#[path = "tests/test_websocket.rs"]
mod test_websocket;
