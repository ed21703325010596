//! Realtime client context.
//!
//! `RealtimeClient` is a cheap handle onto one event loop task. The loop owns
//! the physical connection, the subscription registry and write access to the
//! store; every public operation is a command queued to it. Commands issued
//! from inside a callback are therefore processed on a later turn, never while
//! the registry is being iterated.

use crate::config::ClientConfig;
use crate::connection::{open_link, ConnectionStatus, Link};
use crate::dispatcher::{classify, Dispatcher, Inbound, RefreshCallback};
use crate::error::{RealtimeError, Result};
use crate::events::{Attachment, DomainEvent, OutboundCommand, ReadReceiptEvent};
use crate::identity::{conversation_topic, notification_topic, Identity, IdentityKey, Topic};
use crate::models::{Packet, PONG};
use crate::registry::{Callback, SubscriptionId, SubscriptionRegistry};
use crate::store::{ClientStore, Conversation, StoreReader};
use crate::transport::{Connector, WebSocketConnector, WsError, WsMessage};
use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, error, info, warn};

/// Upper bound for delivering the close frame on disconnect.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// A chat action performed by the user.
#[derive(Debug, Clone, PartialEq)]
pub enum UserAction {
    /// Send a chat message. The broker echoes it back on the conversation topic.
    SendMessage {
        conversation_id: String,
        content: String,
        attachments: Vec<Attachment>,
    },
    /// Mark messages of a conversation as read. Empty ids mean the whole conversation.
    MarkRead {
        conversation_id: String,
        message_ids: Vec<String>,
    },
    /// Delete a message on the server, then locally.
    DeleteMessage {
        conversation_id: String,
        message_id: String,
    },
    /// Mark a notification as read.
    MarkNotificationRead { notification_id: String },
}

enum Command {
    Connect(Identity),
    Disconnect,
    EndSession,
    Subscribe {
        id: SubscriptionId,
        topic: Topic,
        callback: Callback,
    },
    Unsubscribe(SubscriptionId),
    Publish {
        topic: Topic,
        data: Value,
        reply: oneshot::Sender<Result<()>>,
    },
    Action {
        action: UserAction,
        reply: oneshot::Sender<Result<()>>,
    },
    LoadConversation(Conversation),
    RegisterRefresh {
        id: u64,
        callback: RefreshCallback,
    },
    UnregisterRefresh(u64),
    Shutdown,
}

/// Explicit handle to one subscription.
///
/// Released with [`SubscriptionHandle::unsubscribe`] or on drop. Releasing
/// more than once is a no-op.
#[derive(derive_more::Debug)]
pub struct SubscriptionHandle {
    id: SubscriptionId,
    topic: Topic,
    #[debug(skip)]
    commands: mpsc::UnboundedSender<Command>,
    released: AtomicBool,
}

impl SubscriptionHandle {
    /// Identifier of this registration, unique per client.
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Topic the callback is registered on.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Releases the subscription.
    pub fn unsubscribe(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            debug!("Subscription {} already released", self.id);
            return;
        }
        // A closed loop has nothing left to release.
        let _ = self.commands.send(Command::Unsubscribe(self.id));
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

/// Handle to a registered refresh callback. Dropping it does not unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshHandle(u64);

/// Handle onto the realtime event loop.
#[derive(Clone)]
pub struct RealtimeClient {
    commands: mpsc::UnboundedSender<Command>,
    next_id: Arc<AtomicU64>,
    status: watch::Receiver<ConnectionStatus>,
    connected: watch::Receiver<bool>,
    degraded: watch::Receiver<bool>,
    auth_expired: watch::Receiver<Option<IdentityKey>>,
    store: StoreReader,
    config: Arc<ClientConfig>,
}

impl RealtimeClient {
    /// Spawns the event loop on the current runtime and returns a handle to it.
    pub fn new(config: ClientConfig, connector: Arc<dyn Connector>) -> Self {
        Self::spawn(config, connector).0
    }

    /// Client dialing the configured URL over WebSocket.
    pub fn websocket(config: ClientConfig) -> Self {
        Self::new(config, Arc::new(WebSocketConnector))
    }

    /// Like [`RealtimeClient::new`], also returning the loop's join handle.
    pub fn spawn(config: ClientConfig, connector: Arc<dyn Connector>) -> (Self, JoinHandle<()>) {
        let config = Arc::new(config);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Disconnected);
        let (connected_tx, connected_rx) = watch::channel(false);
        let (degraded_tx, degraded_rx) = watch::channel(false);
        let (auth_tx, auth_rx) = watch::channel(None);
        let store = Arc::new(RwLock::new(ClientStore::default()));

        let event_loop = ClientLoop {
            config: config.clone(),
            connector,
            commands: commands_rx,
            identity: None,
            link: None,
            connecting: None,
            reconnect_at: None,
            registry: SubscriptionRegistry::default(),
            dispatcher: Dispatcher::new(store.clone()),
            replies: HashMap::new(),
            rejected: HashSet::new(),
            next_cid: 0,
            status: ConnectionStatus::Disconnected,
            status_tx,
            connected_tx,
            degraded_tx,
            auth_tx,
        };
        let handle = tokio::spawn(event_loop.run());
        debug!("Spawned realtime client loop for {}", config.url);

        let client = RealtimeClient {
            commands: commands_tx,
            next_id: Arc::new(AtomicU64::new(1)),
            status: status_rx,
            connected: connected_rx,
            degraded: degraded_rx,
            auth_expired: auth_rx,
            store: StoreReader::new(store),
            config,
        };
        (client, handle)
    }

    /// Configuration the loop was spawned with.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Connects for `identity`. No-op when already connected or connecting for
    /// the same identity key; tears the current session down first otherwise.
    pub fn connect(&self, identity: Identity) {
        self.command(Command::Connect(identity));
    }

    /// Closes the socket and cancels any pending reconnect. Subscriptions stay
    /// registered and are re-issued on the next connect for the same identity.
    pub fn disconnect(&self) {
        self.command(Command::Disconnect);
    }

    /// Disconnects and purges the subscriptions and store contents of the
    /// current identity. Refresh callbacks are kept.
    pub fn end_session(&self) {
        self.command(Command::EndSession);
    }

    /// Registers `callback` for events on `topic`.
    ///
    /// Subscriptions belong to the current identity. Connecting a different
    /// identity or ending the session drops them; their handles then release
    /// nothing.
    ///
    /// # Arguments
    ///
    /// * `topic` - Channel name, see [`conversation_topic`] and [`notification_topic`].
    /// * `callback` - Invoked on the client loop for every delivery, before the store is updated.
    pub fn subscribe<F>(&self, topic: impl Into<Topic>, callback: F) -> SubscriptionHandle
    where
        F: Fn(&str, &DomainEvent) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let topic = topic.into();
        self.command(Command::Subscribe {
            id,
            topic: topic.clone(),
            callback: Arc::new(callback),
        });
        SubscriptionHandle {
            id,
            topic,
            commands: self.commands.clone(),
            released: AtomicBool::new(false),
        }
    }

    /// Releases a subscription. Same as [`SubscriptionHandle::unsubscribe`].
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) {
        handle.unsubscribe();
    }

    /// Best-effort send on `topic`. Fails with `NotConnected` when no socket is live.
    pub async fn publish(&self, topic: impl Into<Topic>, data: Value) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Publish {
            topic: topic.into(),
            data,
            reply,
        });
        rx.await.map_err(|_| RealtimeError::Closed)?
    }

    /// Performs a user action through the loop so the store keeps a single writer.
    pub async fn perform(&self, action: UserAction) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Action { action, reply });
        rx.await.map_err(|_| RealtimeError::Closed)?
    }

    /// Sends a chat message. The broker echoes it back on the conversation topic.
    ///
    /// # Errors
    ///
    /// Returns `NotConnected` when there is no identity or no live socket.
    pub async fn send_message(
        &self,
        conversation_id: impl Into<String>,
        content: impl Into<String>,
        attachments: Vec<Attachment>,
    ) -> Result<()> {
        self.perform(UserAction::SendMessage {
            conversation_id: conversation_id.into(),
            content: content.into(),
            attachments,
        })
        .await
    }

    /// Marks messages of a conversation as read. Empty `message_ids` cover the whole conversation.
    ///
    /// # Errors
    ///
    /// Returns `NotConnected` when there is no identity or no live socket. The
    /// store is left untouched in that case.
    pub async fn mark_read(
        &self,
        conversation_id: impl Into<String>,
        message_ids: Vec<String>,
    ) -> Result<()> {
        self.perform(UserAction::MarkRead {
            conversation_id: conversation_id.into(),
            message_ids,
        })
        .await
    }

    /// Asks the server to delete a message, then removes it locally.
    ///
    /// # Errors
    ///
    /// Returns `NotConnected` when there is no identity or no live socket.
    pub async fn delete_message(
        &self,
        conversation_id: impl Into<String>,
        message_id: impl Into<String>,
    ) -> Result<()> {
        self.perform(UserAction::DeleteMessage {
            conversation_id: conversation_id.into(),
            message_id: message_id.into(),
        })
        .await
    }

    /// Marks a notification as read on the server and in the store.
    ///
    /// # Errors
    ///
    /// Returns `NotConnected` when there is no identity or no live socket.
    pub async fn mark_notification_read(&self, notification_id: impl Into<String>) -> Result<()> {
        self.perform(UserAction::MarkNotificationRead {
            notification_id: notification_id.into(),
        })
        .await
    }

    /// Seeds the store with a conversation fetched from the backend.
    pub fn load_conversation(&self, conversation: Conversation) {
        self.command(Command::LoadConversation(conversation));
    }

    /// Registers a coarse "state changed, re-fetch" callback.
    pub fn register_refresh_callback<F>(&self, callback: F) -> RefreshHandle
    where
        F: Fn() + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.command(Command::RegisterRefresh {
            id,
            callback: Arc::new(callback),
        });
        RefreshHandle(id)
    }

    /// Removes a refresh callback. Unknown handles are ignored.
    pub fn unregister_refresh_callback(&self, handle: RefreshHandle) {
        self.command(Command::UnregisterRefresh(handle.0));
    }

    /// Current connection flag.
    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Observable connection flag.
    pub fn connected(&self) -> watch::Receiver<bool> {
        self.connected.clone()
    }

    /// Observable connection status.
    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    /// True while realtime push is unavailable or partially rejected.
    pub fn degraded(&self) -> watch::Receiver<bool> {
        self.degraded.clone()
    }

    /// Set to the identity whose credential the broker rejected.
    ///
    /// Connecting the same identity again is a no-op until [`RealtimeClient::disconnect`]
    /// or [`RealtimeClient::end_session`] clears it.
    pub fn auth_expired(&self) -> watch::Receiver<Option<IdentityKey>> {
        self.auth_expired.clone()
    }

    /// Read-only access to the client store.
    pub fn store(&self) -> StoreReader {
        self.store.clone()
    }

    /// Stops the event loop, closing any open socket.
    pub fn shutdown(&self) {
        self.command(Command::Shutdown);
    }

    fn command(&self, command: Command) {
        if self.commands.send(command).is_err() {
            warn!("Realtime client loop is gone, dropping command");
        }
    }
}

/// What an outstanding `cid` was for.
#[derive(Debug)]
enum PendingReply {
    Subscribe(Topic),
    Unsubscribe(Topic),
    Publish(Topic),
}

struct ClientLoop {
    config: Arc<ClientConfig>,
    connector: Arc<dyn Connector>,
    commands: mpsc::UnboundedReceiver<Command>,
    identity: Option<Identity>,
    link: Option<Link>,
    /// In-flight dial and handshake.
    connecting: Option<BoxFuture<'static, Result<Link>>>,
    reconnect_at: Option<Instant>,
    registry: SubscriptionRegistry,
    dispatcher: Dispatcher,
    replies: HashMap<u64, PendingReply>,
    rejected: HashSet<Topic>,
    next_cid: u64,
    status: ConnectionStatus,
    status_tx: watch::Sender<ConnectionStatus>,
    connected_tx: watch::Sender<bool>,
    degraded_tx: watch::Sender<bool>,
    auth_tx: watch::Sender<Option<IdentityKey>>,
}

impl ClientLoop {
    async fn run(mut self) {
        debug!("Entering realtime client loop");
        loop {
            let heartbeat_deadline = self.link.as_ref().map(|l| l.heartbeat.deadline());
            let reconnect_at = self.reconnect_at;

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command).await,
                },
                result = poll_connecting(&mut self.connecting) => {
                    self.connecting = None;
                    self.on_connect_result(result).await;
                }
                frame = next_frame(&mut self.link) => self.on_frame(frame).await,
                () = sleep_until_opt(reconnect_at) => {
                    self.reconnect_at = None;
                    info!("Reconnecting after {:?}", self.config.reconnect_delay);
                    self.start_connect();
                }
                () = sleep_until_opt(heartbeat_deadline) => {
                    warn!("No frame from broker within heartbeat timeout");
                    self.on_transport_failure("heartbeat timeout");
                }
            }
        }
        self.disconnect().await;
        info!("Realtime client loop stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect(identity) => self.connect(identity).await,
            Command::Disconnect => self.disconnect().await,
            Command::EndSession => {
                self.end_session().await;
            }
            Command::Subscribe {
                id,
                topic,
                callback,
            } => self.subscribe(id, topic, callback).await,
            Command::Unsubscribe(id) => self.unsubscribe(id).await,
            Command::Publish { topic, data, reply } => {
                let result = self.publish(&topic, data).await;
                let _ = reply.send(result);
            }
            Command::Action { action, reply } => {
                let result = self.perform(action).await;
                let _ = reply.send(result);
            }
            Command::LoadConversation(conversation) => {
                let changed = self
                    .dispatcher
                    .store()
                    .write()
                    .await
                    .load_conversation(conversation);
                if changed {
                    self.dispatcher.notify_refresh();
                }
            }
            Command::RegisterRefresh { id, callback } => {
                self.dispatcher.register_refresh(id, callback);
            }
            Command::UnregisterRefresh(id) => {
                if !self.dispatcher.unregister_refresh(id) {
                    debug!("Refresh callback {} already unregistered", id);
                }
            }
            Command::Shutdown => {}
        }
    }

    async fn connect(&mut self, identity: Identity) {
        let key = identity.key();
        match self.identity.as_ref().map(Identity::key) {
            Some(current) if current == key => {
                if self.link.is_some() || self.connecting.is_some() || self.reconnect_at.is_some()
                {
                    debug!("Already connected or connecting for {}, ignoring", key);
                    return;
                }
                // A rejected credential is only cleared by disconnect or end_session.
                if *self.auth_tx.borrow() == Some(key) {
                    debug!("Credential for {} was rejected, not redialing", key);
                    return;
                }
            }
            Some(current) => {
                info!("Identity changed from {} to {}, tearing down", current, key);
                let purged = self.end_session().await;
                if !purged.is_empty() {
                    warn!(
                        "Dropped subscriptions of previous identity {}: {:?}",
                        current, purged
                    );
                }
            }
            None => {}
        }

        self.auth_tx.send_replace(None);
        self.dispatcher
            .store()
            .write()
            .await
            .set_user(Some(identity.user_id.clone()));
        self.identity = Some(identity);
        self.start_connect();
    }

    fn start_connect(&mut self) {
        let cid = self.next_cid();
        let Some(identity) = &self.identity else {
            warn!("Connect requested without identity");
            return;
        };
        info!("Connecting to {} for {}", self.config.url, identity.key());
        self.connecting = Some(Box::pin(open_link(
            self.connector.clone(),
            self.config.url.clone(),
            identity.token.clone(),
            cid,
            self.config.handshake_timeout,
            self.config.ping_timeout,
        )));
        self.set_status(ConnectionStatus::Connecting);
    }

    async fn on_connect_result(&mut self, result: Result<Link>) {
        match result {
            Ok(link) => {
                info!("Connected as socket {:?}", link.socket_id);
                self.link = Some(link);
                self.replies.clear();
                self.rejected.clear();
                // Every topic is re-issued before the receiver is polled again.
                for topic in self.registry.topics() {
                    if let Err(e) = self.send_subscribe(&topic).await {
                        error!("Failed to re-subscribe {}: {}", topic, e);
                        self.on_transport_failure("write failed while re-subscribing");
                        return;
                    }
                }
                self.set_status(ConnectionStatus::Connected);
            }
            Err(RealtimeError::AuthExpired) => {
                let key = self.identity.as_ref().map(Identity::key);
                warn!("Credential rejected for {:?}, not retrying", key);
                self.auth_tx.send_replace(key);
                self.set_status(ConnectionStatus::Disconnected);
            }
            Err(e) if e.is_retryable() => {
                warn!("Connect attempt failed: {}", e);
                self.schedule_reconnect();
            }
            Err(e) => {
                error!("Connect attempt failed permanently: {}", e);
                self.set_status(ConnectionStatus::Error);
            }
        }
    }

    fn schedule_reconnect(&mut self) {
        if self.identity.is_none() {
            self.set_status(ConnectionStatus::Disconnected);
            return;
        }
        if self.reconnect_at.is_none() {
            let delay = self.config.reconnect_delay;
            debug!("Scheduling reconnect in {:?}", delay);
            self.reconnect_at = Some(Instant::now() + delay);
        }
        self.set_status(ConnectionStatus::Error);
    }

    fn on_transport_failure(&mut self, reason: &str) {
        warn!("Connection lost: {}", reason);
        self.link = None;
        self.replies.clear();
        self.schedule_reconnect();
    }

    async fn disconnect(&mut self) {
        if self.connecting.take().is_some() {
            debug!("Cancelled in-flight connect");
        }
        if self.reconnect_at.take().is_some() {
            debug!("Cancelled pending reconnect");
        }
        if let Some(mut link) = self.link.take() {
            info!("Disconnecting socket {:?}", link.socket_id);
            // Best-effort close; the socket is dropped either way.
            let close = link.sender.send(WsMessage::Close(None));
            if !matches!(timeout(CLOSE_TIMEOUT, close).await, Ok(Ok(()))) {
                debug!("Close frame not delivered");
            }
        }
        self.replies.clear();
        if self.auth_tx.send_replace(None).is_some() {
            debug!("Cleared rejected credential");
        }
        self.set_status(ConnectionStatus::Disconnected);
    }

    /// Returns the topics that were still subscribed.
    async fn end_session(&mut self) -> Vec<Topic> {
        self.disconnect().await;
        let topics = self.registry.clear();
        if !topics.is_empty() {
            debug!("Released {} topic(s) for previous identity", topics.len());
        }
        self.rejected.clear();
        self.identity = None;
        self.dispatcher.store().write().await.reset(None);
        self.update_degraded();
        topics
    }

    async fn subscribe(&mut self, id: SubscriptionId, topic: Topic, callback: Callback) {
        let first = self.registry.insert(id, topic.clone(), callback);
        debug!(
            "Registered subscription {} on {} ({} live)",
            id,
            topic,
            self.registry.len()
        );
        if first && self.link.is_some() {
            if let Err(e) = self.send_subscribe(&topic).await {
                error!("Failed to subscribe {}: {}", topic, e);
                self.on_transport_failure("write failed while subscribing");
            }
        }
    }

    async fn unsubscribe(&mut self, id: SubscriptionId) {
        let Some((topic, last)) = self.registry.remove(id) else {
            debug!("Subscription {} not registered", id);
            return;
        };
        debug!("Removed subscription {} from {}", id, topic);
        if !last {
            return;
        }
        self.rejected.remove(&topic);
        self.update_degraded();
        if self.link.is_some() {
            let cid = self.next_cid();
            self.replies.insert(cid, PendingReply::Unsubscribe(topic.clone()));
            if let Err(e) = self.send_packet(&Packet::unsubscribe(cid, &topic)).await {
                error!("Failed to unsubscribe {}: {}", topic, e);
                self.on_transport_failure("write failed while unsubscribing");
            }
        }
    }

    async fn publish(&mut self, topic: &str, data: Value) -> Result<()> {
        if self.link.is_none() {
            debug!("Publish to {} while not connected", topic);
            return Err(RealtimeError::NotConnected);
        }
        let cid = self.next_cid();
        self.replies.insert(cid, PendingReply::Publish(topic.to_string()));
        if let Err(e) = self.send_packet(&Packet::publish(cid, topic, data)).await {
            self.on_transport_failure("write failed while publishing");
            return Err(e);
        }
        debug!("Published to {}", topic);
        Ok(())
    }

    async fn perform(&mut self, action: UserAction) -> Result<()> {
        let Some(user_id) = self.identity.as_ref().map(|i| i.user_id.clone()) else {
            return Err(RealtimeError::NotConnected);
        };
        let (topic, command) = match &action {
            UserAction::SendMessage {
                conversation_id,
                content,
                attachments,
            } => (
                conversation_topic(conversation_id),
                OutboundCommand::SendMessage {
                    conversation_id: conversation_id.clone(),
                    content: content.clone(),
                    attachments: attachments.clone(),
                },
            ),
            UserAction::MarkRead {
                conversation_id,
                message_ids,
            } => (
                conversation_topic(conversation_id),
                OutboundCommand::MarkRead(ReadReceiptEvent {
                    conversation_id: Some(conversation_id.clone()),
                    reader_id: user_id.clone(),
                    message_ids: message_ids.clone(),
                    notification_ids: Vec::new(),
                }),
            ),
            UserAction::DeleteMessage {
                conversation_id,
                message_id,
            } => (
                conversation_topic(conversation_id),
                OutboundCommand::DeleteMessage {
                    conversation_id: conversation_id.clone(),
                    message_id: message_id.clone(),
                },
            ),
            UserAction::MarkNotificationRead { notification_id } => (
                notification_topic(&user_id),
                OutboundCommand::MarkRead(ReadReceiptEvent {
                    conversation_id: None,
                    reader_id: user_id.clone(),
                    message_ids: Vec::new(),
                    notification_ids: vec![notification_id.clone()],
                }),
            ),
        };

        self.publish(&topic, serde_json::to_value(&command)?).await?;

        let changed = {
            let mut store = self.dispatcher.store().write().await;
            match (action, command) {
                (UserAction::DeleteMessage { conversation_id, message_id }, _) => {
                    store.remove_message(&conversation_id, &message_id)
                }
                (_, OutboundCommand::MarkRead(receipt)) => {
                    store.apply(&DomainEvent::ReadReceipt(receipt))
                }
                _ => false,
            }
        };
        if changed {
            self.dispatcher.notify_refresh();
        }
        Ok(())
    }

    async fn on_frame(&mut self, frame: Option<std::result::Result<WsMessage, WsError>>) {
        if let Some(link) = self.link.as_mut() {
            link.heartbeat.touch();
        }
        match frame {
            Some(Ok(WsMessage::Text(text))) => self.on_text(&text).await,
            Some(Ok(WsMessage::Ping(payload))) => {
                if let Err(e) = self.send(WsMessage::Pong(payload)).await {
                    error!("Failed to send pong: {}", e);
                    self.on_transport_failure("write failed while answering ping");
                }
            }
            Some(Ok(WsMessage::Close(frame))) => {
                info!("Received close frame: {:?}", frame);
                self.on_transport_failure("closed by broker");
            }
            Some(Ok(other)) => debug!("Ignoring non-text frame: {:?}", other),
            Some(Err(e)) => {
                error!("Error receiving frame: {}", e);
                self.on_transport_failure("receive error");
            }
            None => self.on_transport_failure("stream ended"),
        }
    }

    async fn on_text(&mut self, text: &str) {
        match classify(text) {
            Ok(Inbound::Ping) => {
                if let Err(e) = self.send(WsMessage::Text(PONG.to_string())).await {
                    error!("Failed to send heartbeat pong: {}", e);
                    self.on_transport_failure("write failed while answering heartbeat");
                }
            }
            Ok(Inbound::Delivery { topic, event }) => {
                debug!("Delivering {} event on {}", event.kind(), topic);
                self.dispatcher.dispatch(&self.registry, &topic, event).await;
            }
            Ok(Inbound::Reply(packet)) => self.on_reply(packet),
            Ok(Inbound::Disconnect(packet)) => {
                info!("Broker requested disconnect: {:?}", packet.data);
                self.on_transport_failure("disconnect requested by broker");
            }
            Ok(Inbound::Ignored(packet)) => debug!("Ignoring packet: {:?}", packet),
            Err(e) => warn!("Dropping frame: {}: {}", e, text),
        }
    }

    fn on_reply(&mut self, packet: Packet) {
        let Some(pending) = packet.rid.and_then(|rid| self.replies.remove(&rid)) else {
            debug!("Reply for unknown cid: {:?}", packet.rid);
            return;
        };
        match (pending, packet.error.is_some()) {
            (PendingReply::Subscribe(topic), true) => {
                let error = RealtimeError::Subscription {
                    topic: topic.clone(),
                    reason: packet.error_message(),
                };
                warn!("{}", error);
                if self.registry.contains_topic(&topic) {
                    self.rejected.insert(topic);
                    self.update_degraded();
                }
            }
            (PendingReply::Subscribe(topic), false) => {
                debug!("Subscription to {} confirmed", topic);
                if self.rejected.remove(&topic) {
                    self.update_degraded();
                }
            }
            (PendingReply::Unsubscribe(topic), true) => {
                warn!("Unsubscribe from {} failed: {}", topic, packet.error_message());
            }
            (PendingReply::Publish(topic), true) => {
                warn!("Publish to {} failed: {}", topic, packet.error_message());
            }
            (pending, false) => debug!("Confirmed {:?}", pending),
        }
    }

    async fn send_subscribe(&mut self, topic: &str) -> Result<()> {
        let cid = self.next_cid();
        self.replies.insert(cid, PendingReply::Subscribe(topic.to_string()));
        self.send_packet(&Packet::subscribe(cid, topic)).await?;
        debug!("Sent subscribe for {}", topic);
        Ok(())
    }

    async fn send_packet(&mut self, packet: &Packet) -> Result<()> {
        let text = serde_json::to_string(packet)?;
        self.send(WsMessage::Text(text)).await
    }

    async fn send(&mut self, message: WsMessage) -> Result<()> {
        let Some(link) = self.link.as_mut() else {
            return Err(RealtimeError::NotConnected);
        };
        link.sender.send(message).await?;
        Ok(())
    }

    fn next_cid(&mut self) -> u64 {
        self.next_cid += 1;
        self.next_cid
    }

    fn set_status(&mut self, status: ConnectionStatus) {
        if self.status != status {
            debug!("Connection status {:?} -> {:?}", self.status, status);
            self.status = status;
            self.status_tx.send_replace(status);
        }
        self.connected_tx.send_if_modified(|connected| {
            let now = status == ConnectionStatus::Connected;
            let modified = *connected != now;
            *connected = now;
            modified
        });
        self.update_degraded();
    }

    fn update_degraded(&self) {
        let degraded = self.status == ConnectionStatus::Error
            || !self.rejected.is_empty()
            || self.auth_tx.borrow().is_some();
        self.degraded_tx.send_if_modified(|current| {
            let modified = *current != degraded;
            *current = degraded;
            modified
        });
    }
}

async fn poll_connecting(connecting: &mut Option<BoxFuture<'static, Result<Link>>>) -> Result<Link> {
    match connecting.as_mut() {
        Some(future) => future.await,
        None => std::future::pending().await,
    }
}

async fn next_frame(link: &mut Option<Link>) -> Option<std::result::Result<WsMessage, WsError>> {
    match link.as_mut() {
        Some(link) => link.receiver.next().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
