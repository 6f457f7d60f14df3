//! The byte-pipe seam under a connection.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::{Namespace, TransportError};

/// A bidirectional text frame pipe to the server.
#[async_trait]
pub trait Link: Send {
    async fn send(&mut self, frame: String) -> Result<(), TransportError>;

    /// Next frame; `None` once the peer closed the link.
    async fn recv(&mut self) -> Option<Result<String, TransportError>>;

    async fn close(&mut self);
}

/// Opens links. Each namespace gets its own link.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, namespace: Namespace) -> Result<Box<dyn Link>, TransportError>;
}

/// Connects over WebSockets to a Socket.IO server.
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    /// `base_url` is the server origin (`https://host` or `wss://host`).
    pub fn new(base_url: &str) -> Self {
        Self {
            url: socket_url(base_url),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

/// `{base}/socket.io/?EIO=4&transport=websocket` with an http(s) scheme
/// mapped to ws(s).
fn socket_url(base_url: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base.to_string()
    };
    format!("{base}/socket.io/?EIO=4&transport=websocket")
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, namespace: Namespace) -> Result<Box<dyn Link>, TransportError> {
        debug!(url = %self.url, namespace = %namespace, "opening websocket");
        let (stream, _response) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| TransportError::Link(e.to_string()))?;
        Ok(Box::new(WsLink { stream }))
    }
}

struct WsLink {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Link for WsLink {
    async fn send(&mut self, frame: String) -> Result<(), TransportError> {
        self.stream
            .send(Message::Text(frame))
            .await
            .map_err(|e| TransportError::Link(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<String, TransportError>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text)),
                Ok(Message::Close(_)) => return None,
                // WebSocket-level pings are answered by tungstenite.
                Ok(_) => continue,
                Err(e) => return Some(Err(TransportError::Link(e.to_string()))),
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }
}
