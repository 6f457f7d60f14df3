//! Nullable socket link: An in-memory Socket.IO server per connection.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use patrol_transport::{
    Connector, EnginePacket, Link, Namespace, PacketKind, SocketPacket, TransportError,
};
use serde_json::{json, Value};
use tokio::sync::mpsc;

#[derive(Clone, Debug)]
enum Handshake {
    Accept,
    Refuse(String),
    Silent,
}

#[derive(Default)]
struct ConnectorState {
    attempts: usize,
    failures: VecDeque<TransportError>,
    handshake: Option<Handshake>,
    /// `(pingInterval, pingTimeout)` announced in the open packet, in ms.
    heartbeat: Option<(u64, u64)>,
    links: Vec<NullLinkHandle>,
}

/// Connector whose links talk to a scripted server.
///
/// By default every connect succeeds, the server opens the Engine.IO session
/// and accepts the namespace handshake.
#[derive(Clone, Default)]
pub struct NullConnector {
    state: Arc<Mutex<ConnectorState>>,
}

impl NullConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `times` connects at the link level.
    pub fn fail_next_connects(&self, times: usize) {
        let mut state = self.state.lock().unwrap();
        for _ in 0..times {
            state
                .failures
                .push_back(TransportError::Link("connection refused".into()));
        }
    }

    /// Answer future namespace handshakes with `connect_error`.
    pub fn refuse_handshake(&self, message: &str) {
        self.state.lock().unwrap().handshake = Some(Handshake::Refuse(message.into()));
    }

    /// Never answer future namespace handshakes.
    pub fn stall_handshake(&self) {
        self.state.lock().unwrap().handshake = Some(Handshake::Silent);
    }

    pub fn accept_handshake(&self) {
        self.state.lock().unwrap().handshake = Some(Handshake::Accept);
    }

    /// Announce a heartbeat in future open packets. The scripted server
    /// sends no pings on its own; use [`NullLinkHandle::ping`].
    pub fn heartbeat(&self, interval_ms: u64, timeout_ms: u64) {
        self.state.lock().unwrap().heartbeat = Some((interval_ms, timeout_ms));
    }

    pub fn connect_attempts(&self) -> usize {
        self.state.lock().unwrap().attempts
    }

    /// Links opened so far, oldest first.
    pub fn links(&self) -> Vec<NullLinkHandle> {
        self.state.lock().unwrap().links.clone()
    }

    pub fn last_link(&self) -> Option<NullLinkHandle> {
        self.state.lock().unwrap().links.last().cloned()
    }
}

#[async_trait]
impl Connector for NullConnector {
    async fn connect(&self, namespace: Namespace) -> Result<Box<dyn Link>, TransportError> {
        let mut state = self.state.lock().unwrap();
        state.attempts += 1;
        if let Some(error) = state.failures.pop_front() {
            return Err(error);
        }

        let (inbound, inbound_rx) = mpsc::unbounded_channel();
        let (interval, timeout) = state.heartbeat.unwrap_or((25_000, 20_000));
        let open = json!({
            "sid": format!("null-{}", state.attempts),
            "pingInterval": interval,
            "pingTimeout": timeout,
        });
        let _ = inbound.send(Some(EnginePacket::Open(open).encode()));

        let handle = NullLinkHandle {
            namespace,
            inbound: inbound.clone(),
            sent: Arc::new(Mutex::new(Vec::new())),
            closed: Arc::new(AtomicBool::new(false)),
        };
        state.links.push(handle.clone());

        Ok(Box::new(NullLink {
            handle,
            handshake: state.handshake.clone().unwrap_or(Handshake::Accept),
            inbound: inbound_rx,
        }))
    }
}

struct NullLink {
    handle: NullLinkHandle,
    handshake: Handshake,
    inbound: mpsc::UnboundedReceiver<Option<String>>,
}

#[async_trait]
impl Link for NullLink {
    async fn send(&mut self, frame: String) -> Result<(), TransportError> {
        if self.handle.is_closed() {
            return Err(TransportError::Link("link closed".into()));
        }
        let connect = match EnginePacket::decode(&frame) {
            Ok(EnginePacket::Message(p)) if p.kind == PacketKind::Connect => Some(p),
            _ => None,
        };
        self.handle.sent.lock().unwrap().push(frame);

        if let Some(packet) = connect {
            let reply = match &self.handshake {
                Handshake::Accept => Some(SocketPacket {
                    kind: PacketKind::Connect,
                    namespace: packet.namespace,
                    ack_id: None,
                    data: Some(json!({ "sid": "null-socket" })),
                }),
                Handshake::Refuse(message) => Some(SocketPacket {
                    kind: PacketKind::ConnectError,
                    namespace: packet.namespace,
                    ack_id: None,
                    data: Some(json!({ "message": message })),
                }),
                Handshake::Silent => None,
            };
            if let Some(reply) = reply {
                let _ = self
                    .handle
                    .inbound
                    .send(Some(EnginePacket::Message(reply).encode()));
            }
        }
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<String, TransportError>> {
        if self.handle.is_closed() {
            return None;
        }
        match self.inbound.recv().await {
            Some(Some(frame)) => Some(Ok(frame)),
            _ => None,
        }
    }

    async fn close(&mut self) {
        self.handle.closed.store(true, Ordering::SeqCst);
    }
}

/// The server side of one null link.
#[derive(Clone)]
pub struct NullLinkHandle {
    namespace: Namespace,
    inbound: mpsc::UnboundedSender<Option<String>>,
    sent: Arc<Mutex<Vec<String>>>,
    closed: Arc<AtomicBool>,
}

impl NullLinkHandle {
    pub fn namespace(&self) -> Namespace {
        self.namespace
    }

    /// Deliver a raw frame to the client.
    pub fn push_frame(&self, frame: &str) {
        let _ = self.inbound.send(Some(frame.to_string()));
    }

    /// Deliver a server event on this link's namespace.
    pub fn emit(&self, event: &str, payload: Value) {
        let packet = SocketPacket::event(self.namespace.path(), event, payload, None);
        self.push_frame(&EnginePacket::Message(packet).encode());
    }

    /// Acknowledge a client emit.
    pub fn ack(&self, ack_id: u64, value: Value) {
        let packet = SocketPacket::ack(self.namespace.path(), ack_id, vec![value]);
        self.push_frame(&EnginePacket::Message(packet).encode());
    }

    pub fn ping(&self) {
        self.push_frame(&EnginePacket::Ping(None).encode());
    }

    /// Simulate losing the network: the client sees the link close.
    pub fn drop_link(&self) {
        let _ = self.inbound.send(None);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn sent_frames(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    /// Client events sent on this link: `(event, payload, ack id)`.
    pub fn sent_events(&self) -> Vec<(String, Value, Option<u64>)> {
        self.sent_packets()
            .into_iter()
            .filter_map(|p| {
                let (event, payload) = p.event_parts()?;
                Some((event.to_string(), payload, p.ack_id))
            })
            .collect()
    }

    /// Auth payload of the namespace handshake, if one was sent.
    pub fn connect_auth(&self) -> Option<Value> {
        self.sent_packets()
            .into_iter()
            .find(|p| p.kind == PacketKind::Connect)
            .and_then(|p| p.data)
    }

    pub fn sent_disconnect(&self) -> bool {
        self.sent_packets()
            .iter()
            .any(|p| p.kind == PacketKind::Disconnect)
    }

    pub fn pongs(&self) -> usize {
        self.sent_frames()
            .iter()
            .filter(|f| f.starts_with('3'))
            .count()
    }

    fn sent_packets(&self) -> Vec<SocketPacket> {
        self.sent_frames()
            .iter()
            .filter_map(|f| match EnginePacket::decode(f) {
                Ok(EnginePacket::Message(p)) => Some(p),
                _ => None,
            })
            .collect()
    }
}
