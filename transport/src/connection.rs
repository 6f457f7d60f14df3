//! A reconnecting Socket.IO namespace connection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use patrol_types::TokenProvider;

use crate::codec::{EnginePacket, PacketKind, SocketPacket};
use crate::events::{CONNECT, CONNECT_ERROR, DISCONNECT};
use crate::{Connector, Link, Namespace, ReconnectPolicy, TransportError};

/// Bound on the Engine.IO open + namespace connect exchange.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Engine.IO v4 server defaults, used when the open packet omits them.
const DEFAULT_PING_INTERVAL_MS: u64 = 25_000;
const DEFAULT_PING_TIMEOUT_MS: u64 = 20_000;

/// Event listener. Receives the first event argument (`Null` if none).
pub type Handler = Arc<dyn Fn(&Value) + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    /// Lost or never established; a reconnection is scheduled.
    Disconnected,
    /// Terminal. No further reconnection.
    Disposed,
}

#[derive(Default)]
struct Listeners {
    next_id: u64,
    by_event: HashMap<String, Vec<(u64, Handler)>>,
}

struct Shared {
    namespace: Namespace,
    state: watch::Sender<ConnectionState>,
    listeners: Mutex<Listeners>,
    acks: Mutex<HashMap<u64, oneshot::Sender<Value>>>,
    next_ack: AtomicU64,
    outbound: mpsc::UnboundedSender<String>,
    shutdown: watch::Sender<bool>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    /// Move to `next` unless already disposed.
    fn set_state(&self, next: ConnectionState) {
        self.state.send_if_modified(|current| {
            if *current == ConnectionState::Disposed || *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }

    fn dispatch(&self, event: &str, payload: &Value) {
        let handlers: Vec<Handler> = lock(&self.listeners)
            .by_event
            .get(event)
            .map(|hs| hs.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();
        if handlers.is_empty() {
            debug!(namespace = %self.namespace, event, "no listeners");
        }
        for handler in handlers {
            handler(payload);
        }
    }

    fn resolve_ack(&self, id: Option<u64>, value: Value) {
        let Some(id) = id else {
            return;
        };
        match lock(&self.acks).remove(&id) {
            Some(sender) => {
                let _ = sender.send(value);
            }
            None => debug!(namespace = %self.namespace, ack = id, "late or unknown ack"),
        }
    }

    /// Drop every pending ack; waiters observe a disconnect.
    fn fail_acks(&self) {
        lock(&self.acks).clear();
    }
}

/// A live namespace connection, shared through `Arc` by every consumer.
///
/// Obtained from [`crate::ConnectionRegistry::connect`]. Only callers that
/// own the lifecycle should call [`Connection::dispose`].
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    pub(crate) fn open(
        namespace: Namespace,
        connector: Arc<dyn Connector>,
        token: TokenProvider,
        policy: ReconnectPolicy,
    ) -> Arc<Self> {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Connecting);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            namespace,
            state,
            listeners: Mutex::new(Listeners::default()),
            acks: Mutex::new(HashMap::new()),
            next_ack: AtomicU64::new(1),
            outbound,
            shutdown,
        });

        let driver = Driver {
            shared: Arc::clone(&shared),
            connector,
            token,
            policy,
            outbound: outbound_rx,
            shutdown: shutdown_rx,
        };
        tokio::spawn(driver.run());

        Arc::new(Self { shared })
    }

    pub fn namespace(&self) -> Namespace {
        self.shared.namespace
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn is_disposed(&self) -> bool {
        self.state() == ConnectionState::Disposed
    }

    /// State changes, for callers that need to wait on them.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Wait until connected. Fails if disposed or not connected in time.
    pub async fn wait_connected(&self, timeout: Duration) -> Result<(), TransportError> {
        let mut state = self.watch_state();
        let reached = tokio::time::timeout(
            timeout,
            state.wait_for(|s| {
                matches!(s, ConnectionState::Connected | ConnectionState::Disposed)
            }),
        )
        .await;
        match reached {
            Ok(Ok(s)) if *s == ConnectionState::Connected => Ok(()),
            Ok(_) => Err(TransportError::Disposed {
                namespace: self.namespace(),
            }),
            Err(_) => Err(TransportError::HandshakeTimeout),
        }
    }

    /// Register a listener for `event`. Lifecycle events (`connect`,
    /// `disconnect`, `connect_error`) are delivered here too.
    pub fn on<F>(&self, event: &str, handler: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let mut listeners = lock(&self.shared.listeners);
        listeners.next_id += 1;
        let id = listeners.next_id;
        listeners
            .by_event
            .entry(event.to_string())
            .or_default()
            .push((id, Arc::new(handler)));
        Subscription {
            shared: Arc::downgrade(&self.shared),
            event: event.to_string(),
            id,
        }
    }

    /// Like [`Connection::on`], deserializing the payload first. Payloads
    /// that do not match `T` are logged and dropped.
    pub fn on_json<T, F>(&self, event: &str, handler: F) -> Subscription
    where
        T: DeserializeOwned + 'static,
        F: Fn(T) + Send + Sync + 'static,
    {
        let namespace = self.namespace();
        let name = event.to_string();
        self.on(event, move |payload| {
            match serde_json::from_value::<T>(payload.clone()) {
                Ok(value) => handler(value),
                Err(e) => {
                    warn!(namespace = %namespace, event = %name, error = %e, "bad payload")
                }
            }
        })
    }

    pub fn listener_count(&self, event: &str) -> usize {
        lock(&self.shared.listeners)
            .by_event
            .get(event)
            .map_or(0, Vec::len)
    }

    /// Send an event. Fails with [`TransportError::Disconnected`] when not
    /// connected; nothing is queued for later delivery.
    pub fn emit(&self, event: &str, payload: Value) -> Result<(), TransportError> {
        self.send_event(event, payload, None)
    }

    /// Send an event and wait for the server's acknowledgement.
    pub async fn emit_with_ack(
        &self,
        event: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value, TransportError> {
        let id = self.shared.next_ack.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        lock(&self.shared.acks).insert(id, tx);

        if let Err(e) = self.send_event(event, payload, Some(id)) {
            lock(&self.shared.acks).remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(TransportError::Disconnected {
                namespace: self.namespace(),
            }),
            Err(_) => {
                lock(&self.shared.acks).remove(&id);
                warn!(namespace = %self.namespace(), event, "ack timed out");
                Err(TransportError::AckTimeout)
            }
        }
    }

    /// Clear every listener, then disconnect. The connection never
    /// reconnects afterwards.
    pub fn dispose(&self) {
        if self.is_disposed() {
            return;
        }
        lock(&self.shared.listeners).by_event.clear();
        self.shared.state.send_replace(ConnectionState::Disposed);
        self.shared.shutdown.send_replace(true);
        self.shared.fail_acks();
        info!(namespace = %self.namespace(), "connection disposed");
    }

    fn send_event(
        &self,
        event: &str,
        payload: Value,
        ack_id: Option<u64>,
    ) -> Result<(), TransportError> {
        let namespace = self.namespace();
        match self.state() {
            ConnectionState::Connected => {}
            ConnectionState::Disposed => {
                warn!(namespace = %namespace, event, "emit on disposed connection dropped");
                return Err(TransportError::Disposed { namespace });
            }
            _ => {
                warn!(namespace = %namespace, event, "emit while disconnected dropped");
                return Err(TransportError::Disconnected { namespace });
            }
        }
        let packet = SocketPacket::event(namespace.path(), event, payload, ack_id);
        self.shared
            .outbound
            .send(EnginePacket::Message(packet).encode())
            .map_err(|_| TransportError::Disconnected { namespace })
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shared.shutdown.send_replace(true);
    }
}

/// Handle to one registered listener.
pub struct Subscription {
    shared: Weak<Shared>,
    event: String,
    id: u64,
}

impl Subscription {
    pub fn event(&self) -> &str {
        &self.event
    }

    /// Remove the listener. A no-op if the connection is gone.
    pub fn unsubscribe(self) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let mut listeners = lock(&shared.listeners);
        if let Some(handlers) = listeners.by_event.get_mut(&self.event) {
            handlers.retain(|(id, _)| *id != self.id);
            if handlers.is_empty() {
                listeners.by_event.remove(&self.event);
            }
        }
    }
}

/// Heartbeat timing announced by the server's Engine.IO open packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Heartbeat {
    interval: Duration,
    timeout: Duration,
}

impl Heartbeat {
    fn from_open(data: &Value) -> Self {
        let millis = |key: &str, default: u64| {
            Duration::from_millis(data.get(key).and_then(Value::as_u64).unwrap_or(default))
        };
        Self {
            interval: millis("pingInterval", DEFAULT_PING_INTERVAL_MS),
            timeout: millis("pingTimeout", DEFAULT_PING_TIMEOUT_MS),
        }
    }

    /// Silence longer than this means the link is dead.
    fn silence_limit(&self) -> Duration {
        self.interval + self.timeout
    }
}

enum SessionEnd {
    Disposed,
    /// Was connected, then lost the link.
    Lost(String),
    /// Never got connected.
    Failed(TransportError),
}

/// Owns the link and runs connect / serve / reconnect until disposed.
struct Driver {
    shared: Arc<Shared>,
    connector: Arc<dyn Connector>,
    token: TokenProvider,
    policy: ReconnectPolicy,
    outbound: mpsc::UnboundedReceiver<String>,
    shutdown: watch::Receiver<bool>,
}

impl Driver {
    async fn run(mut self) {
        let namespace = self.shared.namespace;
        let mut failures: u32 = 0;

        loop {
            if *self.shutdown.borrow() {
                break;
            }
            self.shared.set_state(ConnectionState::Connecting);

            match self.session().await {
                SessionEnd::Disposed => break,
                SessionEnd::Lost(reason) => {
                    failures = 0;
                    self.shared.fail_acks();
                    self.shared.set_state(ConnectionState::Disconnected);
                    warn!(namespace = %namespace, reason = %reason, "disconnected");
                    self.shared.dispatch(DISCONNECT, &Value::String(reason));
                }
                SessionEnd::Failed(error) => {
                    self.shared.set_state(ConnectionState::Disconnected);
                    warn!(namespace = %namespace, error = %error, "connect failed");
                    self.shared
                        .dispatch(CONNECT_ERROR, &json!({ "message": error.to_string() }));
                }
            }

            failures = failures.saturating_add(1);
            let delay = self.policy.delay(failures);
            debug!(
                namespace = %namespace,
                attempt = failures,
                delay_ms = delay.as_millis() as u64,
                "reconnect scheduled"
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown.changed() => break,
            }
        }

        self.shared.state.send_replace(ConnectionState::Disposed);
        debug!(namespace = %namespace, "connection loop stopped");
    }

    async fn session(&mut self) -> SessionEnd {
        let namespace = self.shared.namespace;

        // Emits that raced the previous disconnect are not delivered.
        while self.outbound.try_recv().is_ok() {}

        let mut link = tokio::select! {
            result = self.connector.connect(namespace) => match result {
                Ok(link) => link,
                Err(e) => return SessionEnd::Failed(e),
            },
            _ = self.shutdown.changed() => return SessionEnd::Disposed,
        };

        let token = (self.token)();
        let handshake = tokio::select! {
            result = tokio::time::timeout(
                HANDSHAKE_TIMEOUT,
                handshake(link.as_mut(), namespace, token),
            ) => result.unwrap_or(Err(TransportError::HandshakeTimeout)),
            _ = self.shutdown.changed() => {
                link.close().await;
                return SessionEnd::Disposed;
            }
        };
        let heartbeat = match handshake {
            Ok(heartbeat) => heartbeat,
            Err(e) => {
                link.close().await;
                return SessionEnd::Failed(e);
            }
        };

        self.shared.set_state(ConnectionState::Connected);
        info!(
            namespace = %namespace,
            ping_interval_ms = heartbeat.interval.as_millis() as u64,
            "connected"
        );
        self.shared.dispatch(CONNECT, &Value::Null);

        // Half-open links never report a close; the server's pings are the
        // only proof of life.
        let silence = tokio::time::sleep(heartbeat.silence_limit());
        tokio::pin!(silence);

        loop {
            tokio::select! {
                frame = self.outbound.recv() => match frame {
                    Some(frame) => {
                        if let Err(e) = link.send(frame).await {
                            return SessionEnd::Lost(e.to_string());
                        }
                    }
                    None => {
                        link.close().await;
                        return SessionEnd::Disposed;
                    }
                },
                _ = self.shutdown.changed() => {
                    let bye = EnginePacket::Message(SocketPacket::disconnect(namespace.path()));
                    let _ = link.send(bye.encode()).await;
                    link.close().await;
                    return SessionEnd::Disposed;
                }
                _ = &mut silence => {
                    link.close().await;
                    return SessionEnd::Lost("ping timeout".into());
                }
                incoming = link.recv() => match incoming {
                    Some(Ok(frame)) => {
                        silence
                            .as_mut()
                            .reset(tokio::time::Instant::now() + heartbeat.silence_limit());
                        let ended = handle_frame(&self.shared, link.as_mut(), &frame).await;
                        if let Some(reason) = ended {
                            link.close().await;
                            return SessionEnd::Lost(reason);
                        }
                    }
                    Some(Err(e)) => return SessionEnd::Lost(e.to_string()),
                    None => return SessionEnd::Lost("transport close".into()),
                },
            }
        }
    }
}

/// Handle one inbound frame. Returns a reason when the session is over.
async fn handle_frame(shared: &Shared, link: &mut dyn Link, frame: &str) -> Option<String> {
    let namespace = shared.namespace;
    let packet = match EnginePacket::decode(frame) {
        Ok(packet) => packet,
        Err(e) => {
            warn!(namespace = %namespace, error = %e, "dropping undecodable frame");
            return None;
        }
    };

    match packet {
        EnginePacket::Ping(data) => {
            if let Err(e) = link.send(EnginePacket::Pong(data).encode()).await {
                return Some(e.to_string());
            }
            None
        }
        EnginePacket::Close => Some("transport close".into()),
        EnginePacket::Message(packet) if packet.namespace != namespace.path() => {
            debug!(namespace = %namespace, other = %packet.namespace, "foreign namespace");
            None
        }
        EnginePacket::Message(packet) => match packet.kind {
            PacketKind::Event => {
                if let Some((event, payload)) = packet.event_parts() {
                    shared.dispatch(event, &payload);
                }
                if let Some(id) = packet.ack_id {
                    let ack = SocketPacket::ack(namespace.path(), id, Vec::new());
                    if let Err(e) = link.send(EnginePacket::Message(ack).encode()).await {
                        return Some(e.to_string());
                    }
                }
                None
            }
            PacketKind::Ack => {
                shared.resolve_ack(packet.ack_id, packet.ack_value());
                None
            }
            PacketKind::Disconnect => Some("io server disconnect".into()),
            PacketKind::ConnectError => Some(refusal_message(packet.data.as_ref())),
            PacketKind::Connect => None,
        },
        _ => None,
    }
}

async fn handshake(
    link: &mut dyn Link,
    namespace: Namespace,
    token: Option<String>,
) -> Result<Heartbeat, TransportError> {
    let heartbeat = loop {
        match next_packet(link).await? {
            EnginePacket::Open(data) => break Heartbeat::from_open(&data),
            EnginePacket::Ping(data) => link.send(EnginePacket::Pong(data).encode()).await?,
            _ => {}
        }
    };

    if token.is_none() {
        warn!(namespace = %namespace, "connecting without a session token");
    }
    let auth = token.map(|token| json!({ "token": token }));
    let connect = SocketPacket::connect(namespace.path(), auth);
    link.send(EnginePacket::Message(connect).encode()).await?;

    loop {
        match next_packet(link).await? {
            EnginePacket::Message(packet) if packet.namespace == namespace.path() => {
                match packet.kind {
                    PacketKind::Connect => return Ok(heartbeat),
                    PacketKind::ConnectError => {
                        return Err(TransportError::Refused(refusal_message(
                            packet.data.as_ref(),
                        )))
                    }
                    _ => {}
                }
            }
            EnginePacket::Ping(data) => link.send(EnginePacket::Pong(data).encode()).await?,
            EnginePacket::Close => {
                return Err(TransportError::Link("closed during handshake".into()))
            }
            _ => {}
        }
    }
}

async fn next_packet(link: &mut dyn Link) -> Result<EnginePacket, TransportError> {
    loop {
        match link.recv().await {
            None => return Err(TransportError::Link("link closed".into())),
            Some(Err(e)) => return Err(e),
            Some(Ok(frame)) => match EnginePacket::decode(&frame) {
                Ok(packet) => return Ok(packet),
                Err(e) => warn!(error = %e, "dropping undecodable frame"),
            },
        }
    }
}

fn refusal_message(data: Option<&Value>) -> String {
    match data {
        Some(Value::Object(map)) => map
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("connection refused")
            .to_string(),
        Some(Value::String(s)) => s.clone(),
        _ => "connection refused".to_string(),
    }
}
