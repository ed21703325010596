//! Socket abstraction and the WebSocket implementation.
//!
//! The client loop only talks to the broker through the `Sender`, `Receiver`
//! and `Connector` traits so tests can substitute an in-memory broker.

use crate::error::Result;
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};

/// WebSocket message type used on the wire.
pub type WsMessage = tokio_tungstenite::tungstenite::Message;

/// WebSocket error type.
pub type WsError = tokio_tungstenite::tungstenite::Error;

/// Trait for sending WebSocket messages.
#[async_trait]
pub trait Sender: Send {
    /// Sends a WebSocket message.
    ///
    /// # Errors
    ///
    /// Returns a `WsError` if the socket is no longer writable.
    async fn send(&mut self, message: WsMessage) -> std::result::Result<(), WsError>;
}

/// Trait for receiving WebSocket messages.
#[async_trait]
pub trait Receiver: Send {
    /// Receives the next WebSocket message.
    ///
    /// Returns `None` once the connection is closed.
    async fn next(&mut self) -> Option<std::result::Result<WsMessage, WsError>>;
}

/// Boxed write half of an open socket.
pub type BoxSender = Box<dyn Sender>;

/// Boxed read half of an open socket.
pub type BoxReceiver = Box<dyn Receiver>;

/// Opens physical sockets to the broker.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Dials `url` and returns both halves of the socket.
    async fn open(&self, url: &str) -> Result<(BoxSender, BoxReceiver)>;
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Implements the `Sender` trait for the WebSocket sink.
pub struct WebSocketSender(SplitSink<WsStream, WsMessage>);

/// Implements the `Receiver` trait for the WebSocket stream.
pub struct WebSocketReceiver(SplitStream<WsStream>);

#[async_trait]
impl Sender for WebSocketSender {
    async fn send(&mut self, message: WsMessage) -> std::result::Result<(), WsError> {
        debug!("Sending message: {:?}", message);
        self.0.send(message).await
    }
}

#[async_trait]
impl Receiver for WebSocketReceiver {
    async fn next(&mut self) -> Option<std::result::Result<WsMessage, WsError>> {
        let result = self.0.next().await;
        debug!("Received message: {:?}", result);
        result
    }
}

/// Dials the broker with `tokio-tungstenite`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

#[async_trait]
impl Connector for WebSocketConnector {
    async fn open(&self, url: &str) -> Result<(BoxSender, BoxReceiver)> {
        debug!("Opening WebSocket to {}", url);
        let (stream, response) = connect_async(url).await?;
        info!("WebSocket opened to {} ({})", url, response.status());
        let (sink, stream) = stream.split();
        Ok((
            Box::new(WebSocketSender(sink)),
            Box::new(WebSocketReceiver(stream)),
        ))
    }
}
