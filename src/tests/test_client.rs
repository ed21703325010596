use crate::mock_broker::{delivery, message_payload, MockBroker, Outcome};
use crate::{
    conversation_topic, notification_topic, AuthState, ClientConfig, ConnectionStatus,
    Conversation, DomainEvent, Event, Identity, RealtimeClient, RealtimeError, Role,
    SessionBinder, SubscriptionHandle,
};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::timeout;

fn config() -> ClientConfig {
    ClientConfig {
        reconnect_delay: Duration::from_secs(1),
        ping_timeout: Duration::from_secs(30),
        handshake_timeout: Duration::from_secs(5),
        ..ClientConfig::new("ws://mock/socketcluster/")
    }
}

fn student() -> Identity {
    Identity::new("s1", Role::Student, "token-a")
}

fn company() -> Identity {
    Identity::new("c1", Role::Company, "token-b")
}

fn client(broker: &MockBroker) -> RealtimeClient {
    RealtimeClient::new(config(), broker.connector())
}

async fn wait_watch<T>(mut rx: watch::Receiver<T>, f: impl FnMut(&T) -> bool) {
    timeout(Duration::from_secs(120), rx.wait_for(f))
        .await
        .expect("observable did not reach expected value")
        .expect("client loop stopped");
}

async fn wait_status(client: &RealtimeClient, status: ConnectionStatus) {
    wait_watch(client.status(), |s| *s == status).await;
}

/// Round trip through the command queue. Commands are handled in order.
async fn barrier(client: &RealtimeClient) {
    let _ = client.publish("barrier", json!(null)).await;
}

fn counting(calls: &Arc<AtomicUsize>) -> impl Fn(&str, &DomainEvent) + Send + Sync + 'static {
    let calls = calls.clone();
    move |_, _| {
        calls.fetch_add(1, Ordering::SeqCst);
    }
}

async fn has_message(client: &RealtimeClient, id: &str) -> bool {
    client.store().read().await.has_message(id)
}

async fn wait_message(client: &RealtimeClient, id: &str) {
    timeout(Duration::from_secs(5), async {
        while !has_message(client, id).await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("message never reached the store");
}

#[tokio::test]
async fn repeated_connect_for_same_identity_is_a_no_op() {
    let broker = MockBroker::new();
    let client = client(&broker);

    for _ in 0..3 {
        client.connect(student());
    }
    wait_status(&client, ConnectionStatus::Connected).await;
    client.connect(student());
    client.connect(student());
    barrier(&client).await;

    assert!(client.is_connected());
    broker.with(|s| {
        assert_eq!(s.attempts.len(), 1);
        assert_eq!(s.max_open, 1);
        assert_eq!(s.packets.iter().filter(|(_, p)| p.event == Some(Event::Handshake)).count(), 1);
    });
}

#[tokio::test]
async fn subscribe_before_connect_issues_one_subscribe_per_topic() {
    let broker = MockBroker::new();
    let client = client(&broker);
    let calls = Arc::new(AtomicUsize::new(0));

    let _a = client.subscribe(conversation_topic("c1"), counting(&calls));
    let _b = client.subscribe(conversation_topic("c1"), counting(&calls));
    let _c = client.subscribe(conversation_topic("c2"), counting(&calls));
    client.connect(student());
    wait_status(&client, ConnectionStatus::Connected).await;

    broker.with(|s| {
        assert_eq!(s.count(Event::Subscribe, "conversations/c1"), 1);
        assert_eq!(s.count(Event::Subscribe, "conversations/c2"), 1);
    });

    // Both callbacks on the shared topic see the delivery.
    assert!(broker.deliver("conversations/c1", message_payload("m1", "c1", "u2")));
    wait_message(&client, "m1").await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn releasing_last_handle_unsubscribes_exactly_once() {
    let broker = MockBroker::new();
    let client = client(&broker);
    client.connect(student());
    wait_status(&client, ConnectionStatus::Connected).await;

    let topic = conversation_topic("c1");
    let first = client.subscribe(topic.clone(), |_, _| {});
    let second = client.subscribe(topic.clone(), |_, _| {});
    barrier(&client).await;
    assert_eq!(broker.with(|s| s.count(Event::Subscribe, &topic)), 1);

    first.unsubscribe();
    barrier(&client).await;
    assert_eq!(broker.with(|s| s.count(Event::Unsubscribe, &topic)), 0);

    second.unsubscribe();
    second.unsubscribe();
    client.unsubscribe(&second);
    drop(first);
    drop(second);
    barrier(&client).await;
    assert_eq!(broker.with(|s| s.count(Event::Unsubscribe, &topic)), 1);
}

#[tokio::test]
async fn duplicate_delivery_is_stored_and_dispatched_once() {
    let broker = MockBroker::new();
    let client = client(&broker);
    let calls = Arc::new(AtomicUsize::new(0));
    let _handle = client.subscribe(conversation_topic("c1"), counting(&calls));
    client.connect(student());
    wait_status(&client, ConnectionStatus::Connected).await;

    assert!(broker.deliver("conversations/c1", message_payload("m1", "c1", "u2")));
    assert!(broker.deliver("conversations/c1", message_payload("m1", "c1", "u2")));
    // Frames are handled in order, so m2 landing means both m1 copies were seen.
    assert!(broker.deliver("conversations/c1", message_payload("m2", "c1", "u2")));
    wait_message(&client, "m2").await;

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    let conversation = client.store().conversation("c1").await.unwrap();
    assert_eq!(
        conversation.messages.iter().map(|m| m.id.as_str()).collect::<Vec<_>>(),
        vec!["m1", "m2"]
    );
}

#[tokio::test]
async fn logout_stops_callbacks_and_purges_state() {
    let broker = MockBroker::new();
    let client = client(&broker);
    let (auth_tx, auth_rx) = watch::channel(AuthState::Unauthenticated);
    SessionBinder::new(client.config()).spawn(client.clone(), auth_rx, |_| {});

    auth_tx.send_replace(AuthState::Authenticated(student()));
    wait_status(&client, ConnectionStatus::Connected).await;

    let calls = Arc::new(AtomicUsize::new(0));
    let _handle = client.subscribe(conversation_topic("c1"), counting(&calls));
    broker
        .wait_for(|s| s.count(Event::Subscribe, "conversations/c1") == 1)
        .await;
    assert_eq!(broker.with(|s| s.count(Event::Subscribe, "notifications/s1")), 1);

    assert!(broker.deliver("conversations/c1", message_payload("m1", "c1", "u2")));
    wait_message(&client, "m1").await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    auth_tx.send_replace(AuthState::Unauthenticated);
    broker.wait_for(|s| s.open == 0).await;
    wait_status(&client, ConnectionStatus::Disconnected).await;

    // The closed socket no longer accepts frames, and nothing stale is dispatched.
    assert!(!broker.deliver("conversations/c1", message_payload("m2", "c1", "u2")));
    barrier(&client).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let store = client.store();
    let store = store.read().await;
    assert_eq!(store.user_id(), None);
    assert!(!store.has_message("m1"));
    assert_eq!(store.unread_total(), 0);
}

#[tokio::test]
async fn stale_frames_after_logout_reach_no_old_subscriber() {
    let broker = MockBroker::new();
    let client = client(&broker);
    let (auth_tx, auth_rx) = watch::channel(AuthState::Authenticated(student()));
    SessionBinder::new(client.config()).spawn(client.clone(), auth_rx, |_| {});
    wait_status(&client, ConnectionStatus::Connected).await;

    let calls = Arc::new(AtomicUsize::new(0));
    let _handle = client.subscribe(conversation_topic("chat"), counting(&calls));
    broker
        .wait_for(|s| s.count(Event::Subscribe, "conversations/chat") == 1)
        .await;
    assert!(broker.deliver("conversations/chat", message_payload("m1", "chat", "u2")));
    wait_message(&client, "m1").await;

    auth_tx.send_replace(AuthState::Unauthenticated);
    broker.wait_for(|s| s.open == 0).await;

    // A later session gets a live socket the broker can still push old topics on.
    auth_tx.send_replace(AuthState::Authenticated(company()));
    broker
        .wait_for(|s| s.count(Event::Subscribe, "notifications/c1") == 1)
        .await;
    assert!(broker.deliver("conversations/chat", message_payload("m2", "chat", "u2")));
    assert!(broker.deliver(
        "notifications/c1",
        json!({"type": "notification", "data": {"id": "n1", "subject": "Offer", "content": "New"}}),
    ));
    timeout(Duration::from_secs(5), async {
        while client.store().read().await.notification("n1").is_none() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("notification never reached the store");

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let store = client.store();
    let store = store.read().await;
    assert!(!store.has_message("m1"));
    assert!(!store.has_message("m2"));
    assert!(store.conversation("chat").is_none());
}

#[tokio::test]
async fn identity_switch_closes_old_socket_before_opening_new_one() {
    let broker = MockBroker::new();
    let client = client(&broker);
    let (auth_tx, auth_rx) = watch::channel(AuthState::Authenticated(student()));
    SessionBinder::new(client.config()).spawn(client.clone(), auth_rx, |_| {});

    wait_status(&client, ConnectionStatus::Connected).await;
    let stale = client.subscribe(conversation_topic("c1"), |_, _| {});
    broker
        .wait_for(|s| s.count(Event::Subscribe, "conversations/c1") == 1)
        .await;
    assert!(broker.deliver("conversations/c1", message_payload("m1", "c1", "u2")));
    wait_message(&client, "m1").await;

    auth_tx.send_replace(AuthState::Authenticated(company()));
    broker
        .wait_for(|s| s.count(Event::Subscribe, "notifications/c1") == 1)
        .await;
    wait_status(&client, ConnectionStatus::Connected).await;
    drop(stale);
    barrier(&client).await;

    broker.with(|s| {
        assert_eq!(s.max_open, 1);
        assert_eq!(s.attempts.len(), 2);
        assert!(s.position("close:1").unwrap() < s.position("open:2").unwrap());
        let second: Vec<_> = s
            .packets
            .iter()
            .filter(|(socket, p)| *socket == 2 && p.event == Some(Event::Subscribe))
            .collect();
        assert_eq!(second.len(), 1, "old identity's topics must not carry over");
        assert_eq!(s.count(Event::Subscribe, "notifications/s1"), 1);
    });

    let store = client.store();
    let store = store.read().await;
    assert_eq!(store.user_id(), Some("c1"));
    assert!(!store.has_message("m1"));
}

#[tokio::test(start_paused = true)]
async fn failed_connects_retry_at_fixed_delay() {
    let broker = MockBroker::new();
    broker.script([Outcome::Refuse, Outcome::Refuse, Outcome::Refuse]);
    let client = client(&broker);

    client.connect(student());
    wait_watch(client.degraded(), |d| *d).await;
    wait_status(&client, ConnectionStatus::Connected).await;
    assert!(!*client.degraded().borrow());

    let attempts = broker.with(|s| s.attempts.clone());
    assert_eq!(attempts.len(), 4);
    for pair in attempts.windows(2) {
        let gap = pair[1] - pair[0];
        assert!(gap >= Duration::from_secs(1), "gap {gap:?} too short");
        assert!(gap < Duration::from_millis(1100), "gap {gap:?} too long");
    }
}

#[tokio::test(start_paused = true)]
async fn disconnect_cancels_pending_reconnect() {
    let broker = MockBroker::new();
    broker.script([Outcome::Refuse]);
    let client = client(&broker);

    client.connect(student());
    wait_status(&client, ConnectionStatus::Error).await;
    client.disconnect();
    wait_status(&client, ConnectionStatus::Disconnected).await;

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(broker.with(|s| s.attempts.len()), 1);
    assert!(!client.is_connected());
}

#[tokio::test(start_paused = true)]
async fn silent_broker_triggers_reconnect() {
    let broker = MockBroker::new();
    let client = RealtimeClient::new(
        ClientConfig {
            ping_timeout: Duration::from_secs(10),
            ..config()
        },
        broker.connector(),
    );
    let _handle = client.subscribe(conversation_topic("c1"), |_, _| {});
    client.connect(student());
    wait_status(&client, ConnectionStatus::Connected).await;

    assert!(broker.inject("#1"));
    broker.wait_for(|s| s.pongs == 1).await;

    broker.wait_for(|s| s.attempts.len() == 2).await;
    wait_status(&client, ConnectionStatus::Connected).await;
    broker.with(|s| {
        assert!(s.attempts[1] - s.attempts[0] >= Duration::from_secs(11));
        assert_eq!(s.max_open, 1);
        assert!(s.position("subscribe:conversations/c1@2").is_some());
    });
}

#[tokio::test]
async fn topics_are_resubscribed_before_queued_deliveries_dispatch() {
    let broker = MockBroker::new();
    broker.script([
        Outcome::Accept,
        Outcome::AcceptThen(vec![delivery(
            "conversations/c1",
            message_payload("m2", "c1", "u2"),
        )]),
    ]);
    let client = RealtimeClient::new(
        ClientConfig {
            reconnect_delay: Duration::from_millis(50),
            ..config()
        },
        broker.connector(),
    );

    let recorder = broker.clone();
    let _handle = client.subscribe(conversation_topic("c1"), move |_, event| {
        if let DomainEvent::Message(message) = event {
            recorder.record(format!("cb:{}", message.id));
        }
    });
    client.connect(student());
    broker
        .wait_for(|s| s.position("subscribe:conversations/c1@1").is_some())
        .await;

    broker.drop_connection();
    broker.wait_for(|s| s.position("cb:m2").is_some()).await;
    broker.with(|s| {
        let resubscribed = s.position("subscribe:conversations/c1@2").unwrap();
        assert!(resubscribed < s.position("cb:m2").unwrap());
    });
    wait_status(&client, ConnectionStatus::Connected).await;
}

#[tokio::test]
async fn rejected_subscription_marks_client_degraded() {
    let broker = MockBroker::new();
    broker.reject_topic("conversations/secret");
    let client = client(&broker);
    client.connect(student());
    wait_status(&client, ConnectionStatus::Connected).await;
    assert!(!*client.degraded().borrow());

    let secret = client.subscribe(conversation_topic("secret"), |_, _| {});
    let _open = client.subscribe(conversation_topic("c1"), |_, _| {});
    wait_watch(client.degraded(), |d| *d).await;
    assert!(client.is_connected());

    secret.unsubscribe();
    wait_watch(client.degraded(), |d| !*d).await;
}

#[tokio::test(start_paused = true)]
async fn rejected_credential_is_reported_and_not_retried() {
    let broker = MockBroker::new();
    broker.script([Outcome::RejectAuth]);
    let client = client(&broker);
    let expired = Arc::new(Mutex::new(Vec::new()));
    let (_auth_tx, auth_rx) = watch::channel(AuthState::Authenticated(student()));
    let seen = expired.clone();
    SessionBinder::new(client.config()).spawn(client.clone(), auth_rx, move |key| {
        seen.lock().unwrap().push(key);
    });

    wait_watch(client.auth_expired(), |k| *k == Some(student().key())).await;
    assert!(*client.degraded().borrow());

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(broker.with(|s| s.attempts.len()), 1);
    assert_eq!(*client.status().borrow(), ConnectionStatus::Disconnected);
    assert_eq!(*expired.lock().unwrap(), vec![student().key()]);
}

#[tokio::test(start_paused = true)]
async fn rejected_credential_is_not_redialed_until_disconnect() {
    let broker = MockBroker::new();
    broker.script([Outcome::RejectAuth]);
    let client = client(&broker);

    client.connect(student());
    wait_watch(client.auth_expired(), |k| *k == Some(student().key())).await;
    client.connect(student());
    client.connect(student());
    barrier(&client).await;
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(broker.with(|s| s.attempts.len()), 1);
    assert_eq!(*client.auth_expired().borrow(), Some(student().key()));

    client.disconnect();
    wait_watch(client.auth_expired(), |k| k.is_none()).await;
    assert!(!*client.degraded().borrow());
    client.connect(student());
    wait_status(&client, ConnectionStatus::Connected).await;
    assert_eq!(broker.with(|s| s.attempts.len()), 2);
}

#[tokio::test]
async fn callbacks_may_subscribe_reentrantly() {
    let broker = MockBroker::new();
    let client = client(&broker);
    client.connect(student());
    wait_status(&client, ConnectionStatus::Connected).await;

    let spawned: Arc<Mutex<Vec<SubscriptionHandle>>> = Arc::default();
    let inner_client = client.clone();
    let handles = spawned.clone();
    let _outer = client.subscribe(conversation_topic("c1"), move |_, _| {
        let handle = inner_client.subscribe(conversation_topic("c2"), |_, _| {});
        handles.lock().unwrap().push(handle);
    });
    broker
        .wait_for(|s| s.count(Event::Subscribe, "conversations/c1") == 1)
        .await;

    assert!(broker.deliver("conversations/c1", message_payload("m1", "c1", "u2")));
    broker
        .wait_for(|s| s.count(Event::Subscribe, "conversations/c2") == 1)
        .await;
    assert_eq!(spawned.lock().unwrap().len(), 1);
    client.shutdown();
}

#[tokio::test]
async fn publish_requires_a_live_connection() {
    let broker = MockBroker::new();
    let client = client(&broker);

    assert_eq!(
        client.publish("conversations/c1", json!({"x": 1})).await,
        Err(RealtimeError::NotConnected)
    );

    client.connect(student());
    wait_status(&client, ConnectionStatus::Connected).await;
    client
        .publish("conversations/c1", json!({"x": 1}))
        .await
        .unwrap();
    broker.with(|s| {
        let (_, packet) = s
            .packets
            .iter()
            .find(|(_, p)| p.event == Some(Event::Publish))
            .unwrap();
        assert_eq!(
            packet.data,
            Some(json!({"channel": "conversations/c1", "data": {"x": 1}}))
        );
    });
}

#[tokio::test]
async fn user_actions_publish_then_update_the_store() {
    let broker = MockBroker::new();
    let client = client(&broker);
    let _chat = client.subscribe(conversation_topic("c1"), |_, _| {});
    let _inbox = client.subscribe(notification_topic("s1"), |_, _| {});
    client.connect(student());
    wait_status(&client, ConnectionStatus::Connected).await;

    assert!(broker.deliver(
        "notifications/s1",
        json!({"type": "notification", "data": {"id": "n1", "subject": "Offer", "content": "Accepted"}}),
    ));
    assert!(broker.deliver("conversations/c1", message_payload("m1", "c1", "u2")));
    wait_message(&client, "m1").await;
    assert_eq!(client.store().unread_total().await, 2);

    client.mark_read("c1", Vec::new()).await.unwrap();
    client.mark_notification_read("n1").await.unwrap();
    assert_eq!(client.store().unread_total().await, 0);

    client.delete_message("c1", "m1").await.unwrap();
    assert!(!has_message(&client, "m1").await);

    client.send_message("c1", "hello", Vec::new()).await.unwrap();

    broker.with(|s| {
        let kinds: Vec<_> = s
            .packets
            .iter()
            .filter(|(_, p)| p.event == Some(Event::Publish))
            .filter_map(|(_, p)| p.data.as_ref()?.pointer("/data/type")?.as_str().map(String::from))
            .collect();
        assert_eq!(kinds, ["mark-read", "mark-read", "delete-message", "send-message"]);
    });
}

#[tokio::test]
async fn user_actions_fail_without_connection() {
    let broker = MockBroker::new();
    let client = client(&broker);
    assert_eq!(
        client.mark_read("c1", Vec::new()).await,
        Err(RealtimeError::NotConnected)
    );
}

#[tokio::test]
async fn refresh_callbacks_follow_store_changes() {
    let broker = MockBroker::new();
    let client = client(&broker);
    let refreshes = Arc::new(AtomicUsize::new(0));
    let counter = refreshes.clone();
    let handle = client.register_refresh_callback(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let mut conversation = Conversation::new("c9");
    conversation.participants.insert("u2".to_string());
    client.load_conversation(conversation);
    barrier(&client).await;
    assert_eq!(refreshes.load(Ordering::SeqCst), 1);
    assert!(client.store().conversation("c9").await.is_some());

    let _chat = client.subscribe(conversation_topic("c1"), |_, _| {});
    client.connect(student());
    wait_status(&client, ConnectionStatus::Connected).await;
    assert!(broker.deliver("conversations/c1", message_payload("m1", "c1", "u2")));
    wait_message(&client, "m1").await;
    assert_eq!(refreshes.load(Ordering::SeqCst), 2);

    client.unregister_refresh_callback(handle);
    barrier(&client).await;
    assert!(broker.deliver("conversations/c1", message_payload("m2", "c1", "u2")));
    wait_message(&client, "m2").await;
    assert_eq!(refreshes.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn shutdown_closes_the_socket() {
    let broker = MockBroker::new();
    let (client, task) = RealtimeClient::spawn(config(), broker.connector());
    client.connect(student());
    wait_status(&client, ConnectionStatus::Connected).await;

    client.shutdown();
    task.await.unwrap();
    broker.with(|s| {
        assert_eq!(s.open, 0);
        assert!(s.position("client-close:1").is_some());
    });
    assert_eq!(
        client.publish("conversations/c1", json!(null)).await,
        Err(RealtimeError::Closed)
    );
}
