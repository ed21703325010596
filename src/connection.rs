//! Physical connection lifecycle: status, handshake and heartbeat tracking.

use crate::error::{RealtimeError, Result};
use crate::models::{Packet, PING, PONG};
use crate::transport::{BoxReceiver, BoxSender, Connector, WsMessage};
use crate::utils::millis_from_value;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Error names the broker uses when it rejects the credential.
const AUTH_ERROR_NAMES: &[&str] = &[
    "AuthTokenExpiredError",
    "AuthTokenInvalidError",
    "AuthTokenError",
    "BadAuthTokenError",
];

/// Observable status of the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// Last attempt failed; a reconnect may be pending.
    Error,
}

/// A socket that completed the handshake.
pub(crate) struct Link {
    pub(crate) sender: BoxSender,
    pub(crate) receiver: BoxReceiver,
    /// Broker-assigned socket id.
    pub(crate) socket_id: Option<String>,
    pub(crate) heartbeat: Heartbeat,
}

/// Tracks the time of the last inbound frame.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Heartbeat {
    timeout: Duration,
    last_seen: Instant,
}

impl Heartbeat {
    pub(crate) fn new(timeout: Duration) -> Self {
        Heartbeat {
            timeout,
            last_seen: Instant::now(),
        }
    }

    pub(crate) fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    pub(crate) fn deadline(&self) -> Instant {
        self.last_seen + self.timeout
    }
}

/// Dials the broker and runs the handshake with the bearer credential.
///
/// Everything, including the dial, is bounded by `handshake_timeout`.
pub(crate) async fn open_link(
    connector: Arc<dyn Connector>,
    url: String,
    token: String,
    cid: u64,
    handshake_timeout: Duration,
    ping_timeout: Duration,
) -> Result<Link> {
    let attempt = handshake(connector, url, token, cid, ping_timeout);
    match tokio::time::timeout(handshake_timeout, attempt).await {
        Ok(Err(RealtimeError::Decode(e))) => Err(RealtimeError::Connection(e)),
        Ok(result) => result,
        Err(_) => Err(RealtimeError::Connection(format!(
            "handshake timed out after {handshake_timeout:?}"
        ))),
    }
}

async fn handshake(
    connector: Arc<dyn Connector>,
    url: String,
    token: String,
    cid: u64,
    ping_timeout: Duration,
) -> Result<Link> {
    let (mut sender, mut receiver) = connector.open(&url).await?;
    let packet = Packet::handshake(cid, &token);
    sender
        .send(WsMessage::Text(serde_json::to_string(&packet)?))
        .await?;
    debug!("Sent handshake with cid {}", cid);

    loop {
        match receiver.next().await {
            Some(Ok(WsMessage::Text(text))) if text == PING => {
                sender.send(WsMessage::Text(PONG.to_string())).await?;
            }
            Some(Ok(WsMessage::Text(text))) => {
                let reply = match serde_json::from_str::<Packet>(&text) {
                    Ok(reply) => reply,
                    Err(e) => {
                        warn!("Ignoring unparseable frame during handshake: {}", e);
                        continue;
                    }
                };
                if reply.rid != Some(cid) {
                    debug!("Ignoring non-handshake packet during handshake: {:?}", reply);
                    continue;
                }
                let (socket_id, advertised) = evaluate_handshake(&reply)?;
                let timeout = advertised.unwrap_or(ping_timeout);
                info!(
                    "Handshake accepted (socket id {:?}, ping timeout {:?})",
                    socket_id, timeout
                );
                return Ok(Link {
                    sender,
                    receiver,
                    socket_id,
                    heartbeat: Heartbeat::new(timeout),
                });
            }
            Some(Ok(WsMessage::Ping(payload))) => {
                sender.send(WsMessage::Pong(payload)).await?;
            }
            Some(Ok(WsMessage::Close(frame))) => {
                return Err(RealtimeError::Connection(format!(
                    "closed during handshake: {frame:?}"
                )));
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(e.into()),
            None => {
                return Err(RealtimeError::Connection(
                    "closed before handshake reply".to_string(),
                ))
            }
        }
    }
}

/// Classifies the handshake reply. Returns the socket id and the advertised
/// ping timeout on success.
fn evaluate_handshake(reply: &Packet) -> Result<(Option<String>, Option<Duration>)> {
    if reply.error.is_some() {
        let name = reply.error_name().unwrap_or_default();
        if AUTH_ERROR_NAMES.contains(&name) {
            warn!("Broker rejected credential: {}", reply.error_message());
            return Err(RealtimeError::AuthExpired);
        }
        return Err(RealtimeError::Connection(format!(
            "handshake rejected: {}",
            reply.error_message()
        )));
    }

    let data = reply.data.as_ref();
    if data.and_then(|d| d.get("authError")).is_some_and(|e| !e.is_null()) {
        return Err(RealtimeError::AuthExpired);
    }
    if data.and_then(|d| d.get("isAuthenticated")).and_then(Value::as_bool) == Some(false) {
        return Err(RealtimeError::AuthExpired);
    }

    let socket_id = data
        .and_then(|d| d.get("id"))
        .and_then(Value::as_str)
        .map(str::to_string);
    let ping_timeout = millis_from_value(data.and_then(|d| d.get("pingTimeout")));
    Ok((socket_id, ping_timeout))
}
