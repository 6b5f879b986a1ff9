//! Frame transports.
//!
//! [`Transport`] is one established, bidirectional text-frame connection;
//! [`Dialer`] opens new ones.  [`WsDialer`] is the production pair backed by
//! `tokio-tungstenite`; tests swap in [`LoopbackDevice`](crate::loopback::LoopbackDevice).

use std::sync::Arc;

use async_trait::async_trait;
use botflow_types::BotError;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::debug;

/// One established connection carrying text frames.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Write one frame.
    async fn send(&self, frame: String) -> Result<(), BotError>;

    /// Wait for the next frame.  An error means the connection is unusable.
    async fn recv(&self) -> Result<String, BotError>;

    /// Close the connection; pending and later `recv` calls fail.
    async fn close(&self);
}

/// Opens [`Transport`]s to an endpoint URL.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, endpoint: &str) -> Result<Arc<dyn Transport>, BotError>;
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket [`Transport`].
///
/// Sink and stream halves are locked independently so a pending read does
/// not block writers.
pub struct WsTransport {
    endpoint: String,
    sink: Mutex<SplitSink<WsStream, Message>>,
    stream: Mutex<SplitStream<WsStream>>,
}

impl WsTransport {
    pub fn new(endpoint: impl Into<String>, ws: WsStream) -> Self {
        let (sink, stream) = ws.split();
        Self {
            endpoint: endpoint.into(),
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
        }
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&self, frame: String) -> Result<(), BotError> {
        self.sink
            .lock()
            .await
            .send(Message::Text(frame.into()))
            .await
            .map_err(|e| BotError::connection(&self.endpoint, format!("write failed: {e}")))
    }

    async fn recv(&self) -> Result<String, BotError> {
        let mut stream = self.stream.lock().await;
        loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(text.as_str().to_string()),
                Some(Ok(Message::Binary(bytes))) => {
                    return String::from_utf8(bytes.to_vec()).map_err(|e| {
                        BotError::connection(&self.endpoint, format!("non-UTF-8 frame: {e}"))
                    });
                }
                Some(Ok(Message::Close(_))) | None => {
                    return Err(BotError::connection(&self.endpoint, "connection closed"));
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    return Err(BotError::connection(&self.endpoint, format!("read failed: {e}")));
                }
            }
        }
    }

    async fn close(&self) {
        if let Err(e) = self.sink.lock().await.close().await {
            debug!(endpoint = %self.endpoint, error = %e, "ws close failed");
        }
    }
}

/// Dials `ws://` / `wss://` endpoints.
#[derive(Debug, Default, Clone, Copy)]
pub struct WsDialer;

#[async_trait]
impl Dialer for WsDialer {
    async fn dial(&self, endpoint: &str) -> Result<Arc<dyn Transport>, BotError> {
        let (ws, _response) = connect_async(endpoint)
            .await
            .map_err(|e| BotError::connection(endpoint, e))?;
        debug!(endpoint, "websocket connected");
        Ok(Arc::new(WsTransport::new(endpoint, ws)))
    }
}
