//! Connection lifecycle against the in-memory socket server.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use patrol_nullables::NullConnector;
use patrol_transport::events::{CONNECT, CONNECT_ERROR, DISCONNECT};
use patrol_transport::tracking::{CHECKPOINT_CONFIRMED, LOCATION_BATCH};
use patrol_transport::{
    ChatChannel, CheckpointConfirmedPush, ConnectionRegistry, ConnectionState,
    LocationBatcher, LocationSample, Namespace, ReconnectPolicy, TrackingChannel,
    TransportError,
};
use patrol_types::{static_token, CheckpointId, ProofMethod, RoundId, Timestamp, TokenProvider};
use serde_json::{json, Value};

const WAIT: Duration = Duration::from_secs(2);

fn fast_policy() -> ReconnectPolicy {
    ReconnectPolicy::new(Duration::from_millis(10), Duration::from_millis(50))
}

fn registry(connector: &NullConnector) -> ConnectionRegistry {
    ConnectionRegistry::new(Arc::new(connector.clone()), fast_policy())
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("condition not reached");
}

fn counter(connection: &patrol_transport::Connection, event: &str) -> Arc<AtomicUsize> {
    let count = Arc::new(AtomicUsize::new(0));
    let seen = count.clone();
    // Listener lives as long as the connection; the subscription is not needed.
    let _ = connection.on(event, move |_| {
        seen.fetch_add(1, Ordering::SeqCst);
    });
    count
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[tokio::test]
async fn connect_twice_returns_the_same_connection() {
    let connector = NullConnector::new();
    let registry = registry(&connector);

    let first = registry.connect(Namespace::Chat, static_token("t"));
    let second = registry.connect(Namespace::Chat, static_token("other"));
    assert!(Arc::ptr_eq(&first, &second));

    first.wait_connected(WAIT).await.unwrap();
    assert_eq!(connector.connect_attempts(), 1);
}

#[tokio::test]
async fn namespaces_get_separate_connections() {
    let connector = NullConnector::new();
    let registry = registry(&connector);

    let chat = registry.connect(Namespace::Chat, static_token("t"));
    let tracking = registry.connect(Namespace::Tracking, static_token("t"));
    assert!(!Arc::ptr_eq(&chat, &tracking));

    chat.wait_connected(WAIT).await.unwrap();
    tracking.wait_connected(WAIT).await.unwrap();
    let mut namespaces: Vec<_> = connector.links().iter().map(|l| l.namespace()).collect();
    namespaces.sort_by_key(|ns| ns.path());
    assert_eq!(namespaces, vec![Namespace::Chat, Namespace::Tracking]);
}

#[tokio::test]
async fn dispose_then_connect_opens_a_fresh_connection() {
    let connector = NullConnector::new();
    let registry = registry(&connector);

    let first = registry.connect(Namespace::Tracking, static_token("t"));
    first.wait_connected(WAIT).await.unwrap();
    assert!(registry.dispose(Namespace::Tracking));
    assert!(first.is_disposed());
    assert!(registry.get(Namespace::Tracking).is_none());
    assert!(!registry.dispose(Namespace::Tracking));

    let second = registry.connect(Namespace::Tracking, static_token("t"));
    assert!(!Arc::ptr_eq(&first, &second));
    second.wait_connected(WAIT).await.unwrap();
    assert_eq!(connector.connect_attempts(), 2);
}

#[tokio::test]
async fn disposing_sends_namespace_disconnect_and_stops_reconnecting() {
    let connector = NullConnector::new();
    let registry = registry(&connector);
    let connection = registry.connect(Namespace::Chat, static_token("t"));
    connection.wait_connected(WAIT).await.unwrap();
    let link = connector.last_link().unwrap();

    connection.dispose();
    wait_until(|| link.is_closed()).await;
    assert!(link.sent_disconnect());

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(connector.connect_attempts(), 1);
    assert_eq!(connection.state(), ConnectionState::Disposed);
}

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

#[tokio::test]
async fn connect_event_fires_and_token_is_sent_as_auth() {
    let connector = NullConnector::new();
    let registry = registry(&connector);
    let connection = registry.connect(Namespace::Tracking, static_token("jwt-1"));
    let connects = counter(&connection, CONNECT);

    connection.wait_connected(WAIT).await.unwrap();
    wait_until(|| connects.load(Ordering::SeqCst) == 1).await;

    let link = connector.last_link().unwrap();
    assert_eq!(link.connect_auth(), Some(json!({"token": "jwt-1"})));
}

#[tokio::test]
async fn token_is_reread_on_every_attempt() {
    let connector = NullConnector::new();
    let registry = registry(&connector);
    let current = Arc::new(Mutex::new("old".to_string()));
    let source = current.clone();
    let token: TokenProvider = Arc::new(move || Some(source.lock().unwrap().clone()));

    let connection = registry.connect(Namespace::Chat, token);
    connection.wait_connected(WAIT).await.unwrap();
    *current.lock().unwrap() = "new".to_string();

    connector.last_link().unwrap().drop_link();
    wait_until(|| connector.links().len() == 2).await;
    connection.wait_connected(WAIT).await.unwrap();

    let links = connector.links();
    assert_eq!(links[0].connect_auth(), Some(json!({"token": "old"})));
    assert_eq!(links[1].connect_auth(), Some(json!({"token": "new"})));
}

#[tokio::test]
async fn refused_handshake_dispatches_connect_error_and_retries() {
    let connector = NullConnector::new();
    connector.refuse_handshake("jwt expired");
    let registry = registry(&connector);
    let connection = registry.connect(Namespace::Chat, static_token("stale"));

    let messages = Arc::new(Mutex::new(Vec::<Value>::new()));
    let sink = messages.clone();
    let _sub = connection.on(CONNECT_ERROR, move |payload| {
        sink.lock().unwrap().push(payload.clone());
    });

    wait_until(|| connector.connect_attempts() >= 2).await;
    assert!(!connection.is_connected());
    let first = messages.lock().unwrap()[0].clone();
    assert!(first["message"].as_str().unwrap().contains("jwt expired"));

    connector.accept_handshake();
    connection.wait_connected(WAIT).await.unwrap();
}

#[tokio::test]
async fn link_failures_are_retried_with_backoff() {
    let connector = NullConnector::new();
    connector.fail_next_connects(2);
    let registry = registry(&connector);
    let connection = registry.connect(Namespace::Tracking, static_token("t"));
    let errors = counter(&connection, CONNECT_ERROR);

    connection.wait_connected(WAIT).await.unwrap();
    assert_eq!(connector.connect_attempts(), 3);
    assert_eq!(errors.load(Ordering::SeqCst), 2);
}

// ---------------------------------------------------------------------------
// Reconnection
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unexpected_disconnect_schedules_reconnect() {
    let connector = NullConnector::new();
    let registry = registry(&connector);
    let connection = registry.connect(Namespace::Tracking, static_token("t"));
    let connects = counter(&connection, CONNECT);
    let disconnects = counter(&connection, DISCONNECT);
    connection.wait_connected(WAIT).await.unwrap();

    connector.last_link().unwrap().drop_link();
    wait_until(|| disconnects.load(Ordering::SeqCst) == 1).await;
    wait_until(|| connects.load(Ordering::SeqCst) == 2).await;
    assert!(connection.is_connected());
    assert_eq!(connector.connect_attempts(), 2);
}

#[tokio::test]
async fn server_disconnect_packet_also_reconnects() {
    let connector = NullConnector::new();
    let registry = registry(&connector);
    let connection = registry.connect(Namespace::Chat, static_token("t"));
    let reasons = Arc::new(Mutex::new(Vec::<Value>::new()));
    let sink = reasons.clone();
    let _sub = connection.on(DISCONNECT, move |reason| sink.lock().unwrap().push(reason.clone()));
    connection.wait_connected(WAIT).await.unwrap();

    connector.last_link().unwrap().push_frame("41/chat,");
    wait_until(|| connector.links().len() == 2).await;
    assert_eq!(reasons.lock().unwrap()[0], json!("io server disconnect"));
    connection.wait_connected(WAIT).await.unwrap();
}

#[tokio::test]
async fn listeners_survive_reconnection() {
    let connector = NullConnector::new();
    let registry = registry(&connector);
    let connection = registry.connect(Namespace::Chat, static_token("t"));
    let received = counter(&connection, "receive_message");
    connection.wait_connected(WAIT).await.unwrap();

    connector.last_link().unwrap().drop_link();
    wait_until(|| connector.links().len() == 2).await;
    connection.wait_connected(WAIT).await.unwrap();

    connector.last_link().unwrap().emit("receive_message", json!({}));
    wait_until(|| received.load(Ordering::SeqCst) == 1).await;
}

#[tokio::test]
async fn silent_server_times_out_and_reconnects() {
    let connector = NullConnector::new();
    connector.heartbeat(20, 20);
    let registry = registry(&connector);
    let connection = registry.connect(Namespace::Tracking, static_token("t"));
    let disconnects = counter(&connection, DISCONNECT);
    connection.wait_connected(WAIT).await.unwrap();
    let first = connector.last_link().unwrap();

    wait_until(|| disconnects.load(Ordering::SeqCst) >= 1).await;
    wait_until(|| connector.connect_attempts() >= 2).await;
    assert!(first.is_closed());
}

#[tokio::test]
async fn pings_keep_a_quiet_link_open() {
    let connector = NullConnector::new();
    connector.heartbeat(30, 30);
    let registry = registry(&connector);
    let connection = registry.connect(Namespace::Tracking, static_token("t"));
    let disconnects = counter(&connection, DISCONNECT);
    connection.wait_connected(WAIT).await.unwrap();

    let link = connector.last_link().unwrap();
    for _ in 0..15 {
        link.ping();
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(connection.is_connected());
    assert_eq!(disconnects.load(Ordering::SeqCst), 0);
    assert_eq!(connector.connect_attempts(), 1);
}

// ---------------------------------------------------------------------------
// Emit and receive
// ---------------------------------------------------------------------------

#[tokio::test]
async fn emit_while_disconnected_fails_without_queueing() {
    let connector = NullConnector::new();
    connector.stall_handshake();
    let registry = registry(&connector);
    let connection = registry.connect(Namespace::Chat, static_token("t"));

    let err = connection.emit("send_message", json!({})).unwrap_err();
    assert_eq!(err, TransportError::Disconnected { namespace: Namespace::Chat });

    connection.dispose();
    let err = connection.emit("send_message", json!({})).unwrap_err();
    assert_eq!(err, TransportError::Disposed { namespace: Namespace::Chat });
}

#[tokio::test]
async fn emitted_events_reach_the_server() {
    let connector = NullConnector::new();
    let registry = registry(&connector);
    let chat = ChatChannel::new(registry.connect(Namespace::Chat, static_token("t")));
    chat.connection().wait_connected(WAIT).await.unwrap();

    chat.join_room("room-9").unwrap();
    let link = connector.last_link().unwrap();
    wait_until(|| !link.sent_events().is_empty()).await;

    let (event, payload, ack) = link.sent_events().remove(0);
    assert_eq!(event, "join_room");
    assert_eq!(payload, json!({"roomId": "room-9"}));
    assert_eq!(ack, None);
}

#[tokio::test]
async fn emit_with_ack_resolves_with_server_reply() {
    let connector = NullConnector::new();
    let registry = registry(&connector);
    let connection = registry.connect(Namespace::Chat, static_token("t"));
    connection.wait_connected(WAIT).await.unwrap();
    let link = connector.last_link().unwrap();

    let server = tokio::spawn({
        let link = link.clone();
        async move {
            wait_until(|| !link.sent_events().is_empty()).await;
            let (_, _, ack) = link.sent_events().remove(0);
            link.ack(ack.unwrap(), json!({"ok": true}));
        }
    });

    let reply = connection
        .emit_with_ack("send_message", json!({"content": "hi"}), WAIT)
        .await
        .unwrap();
    assert_eq!(reply, json!({"ok": true}));
    server.await.unwrap();
}

#[tokio::test]
async fn emit_with_ack_times_out() {
    let connector = NullConnector::new();
    let registry = registry(&connector);
    let connection = registry.connect(Namespace::Chat, static_token("t"));
    connection.wait_connected(WAIT).await.unwrap();

    let err = connection
        .emit_with_ack("send_message", json!({}), Duration::from_millis(30))
        .await
        .unwrap_err();
    assert_eq!(err, TransportError::AckTimeout);
}

#[tokio::test]
async fn server_pings_are_answered() {
    let connector = NullConnector::new();
    let registry = registry(&connector);
    let connection = registry.connect(Namespace::Tracking, static_token("t"));
    connection.wait_connected(WAIT).await.unwrap();

    let link = connector.last_link().unwrap();
    link.ping();
    wait_until(|| link.pongs() == 1).await;
}

#[tokio::test]
async fn typed_push_is_delivered_and_foreign_namespace_ignored() {
    let connector = NullConnector::new();
    let registry = registry(&connector);
    let tracking = TrackingChannel::new(registry.connect(Namespace::Tracking, static_token("t")));
    let pushes = Arc::new(Mutex::new(Vec::new()));
    let sink = pushes.clone();
    let _sub = tracking.on_checkpoint_confirmed(move |push| sink.lock().unwrap().push(push));
    tracking.connection().wait_connected(WAIT).await.unwrap();

    let link = connector.last_link().unwrap();
    link.push_frame(r#"42/chat,["checkpoint_confirmed",{}]"#);
    link.emit(CHECKPOINT_CONFIRMED, json!({"roundId": 3}));
    link.emit(
        CHECKPOINT_CONFIRMED,
        json!({"roundId": 3, "checkpointId": 8, "method": "qr", "timestamp": 1234}),
    );

    wait_until(|| pushes.lock().unwrap().len() == 1).await;
    assert_eq!(
        pushes.lock().unwrap()[0],
        CheckpointConfirmedPush {
            round_id: RoundId::new(3),
            checkpoint_id: CheckpointId::new(8),
            method: ProofMethod::Qr,
            timestamp: Timestamp::new(1234),
        }
    );
}

#[tokio::test]
async fn unsubscribed_listener_is_not_called() {
    let connector = NullConnector::new();
    let registry = registry(&connector);
    let connection = registry.connect(Namespace::Chat, static_token("t"));
    let hits = Arc::new(AtomicUsize::new(0));
    let seen = hits.clone();
    let sub = connection.on("receive_message", move |_| {
        seen.fetch_add(1, Ordering::SeqCst);
    });
    let kept = counter(&connection, "receive_message");
    assert_eq!(connection.listener_count("receive_message"), 2);

    sub.unsubscribe();
    assert_eq!(connection.listener_count("receive_message"), 1);

    connection.wait_connected(WAIT).await.unwrap();
    connector.last_link().unwrap().emit("receive_message", json!({}));
    wait_until(|| kept.load(Ordering::SeqCst) == 1).await;
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

// ---------------------------------------------------------------------------
// Location batching
// ---------------------------------------------------------------------------

fn sample(n: u64) -> LocationSample {
    LocationSample {
        lat: 19.43,
        lon: -99.13,
        accuracy: 5.0,
        timestamp: Timestamp::new(n),
    }
}

#[tokio::test]
async fn batcher_keeps_samples_until_reconnected() {
    let connector = NullConnector::new();
    let registry = registry(&connector);
    let tracking = TrackingChannel::new(registry.connect(Namespace::Tracking, static_token("t")));
    tracking.connection().wait_connected(WAIT).await.unwrap();
    let batcher = LocationBatcher::with_capacity(tracking.clone(), 2);
    batcher.set_round(Some(RoundId::new(4)));

    connector.stall_handshake();
    connector.last_link().unwrap().drop_link();
    wait_until(|| connector.links().len() == 2 && !tracking.connection().is_connected()).await;

    batcher.push(sample(1));
    batcher.push(sample(2));
    batcher.push(sample(3));
    assert!(batcher.flush().is_err());
    assert_eq!(batcher.pending(), 2);

    // The stalled server finally accepts the namespace.
    let link = connector.last_link().unwrap();
    link.push_frame(r#"40/tracking,{"sid":"late"}"#);
    tracking.connection().wait_connected(WAIT).await.unwrap();

    assert_eq!(batcher.flush().unwrap(), 2);
    assert_eq!(batcher.pending(), 0);
    assert_eq!(batcher.flush().unwrap(), 0);

    wait_until(|| !link.sent_events().is_empty()).await;
    let (event, payload, _) = link.sent_events().remove(0);
    assert_eq!(event, LOCATION_BATCH);
    assert_eq!(payload["roundId"], json!(4));
    assert_eq!(payload["samples"].as_array().unwrap().len(), 2);
    assert_eq!(payload["samples"][0]["timestamp"], json!(2));
}

#[tokio::test]
async fn batcher_run_flushes_on_stop() {
    let connector = NullConnector::new();
    let registry = registry(&connector);
    let tracking = TrackingChannel::new(registry.connect(Namespace::Tracking, static_token("t")));
    tracking.connection().wait_connected(WAIT).await.unwrap();

    let batcher = Arc::new(LocationBatcher::new(tracking));
    let (stop, stop_rx) = tokio::sync::watch::channel(false);
    let task = tokio::spawn(batcher.clone().run(Duration::from_secs(3600), stop_rx));

    // The first tick fires immediately with nothing buffered.
    tokio::time::sleep(Duration::from_millis(10)).await;
    batcher.push(sample(7));
    stop.send_replace(true);
    task.await.unwrap();

    assert_eq!(batcher.pending(), 0);
    let link = connector.last_link().unwrap();
    wait_until(|| link.sent_events().len() == 1).await;
}
