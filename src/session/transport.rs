// =============================================================================
// Transport — the raw socket seam under the session manager
// =============================================================================
//
// Production uses tokio-tungstenite; tests substitute channel-backed mock
// connections. The session manager only ever sees text frames.
// =============================================================================

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};

use crate::errors::EngineError;

/// Write half of a connection.
#[async_trait]
pub trait ConnectionTx: Send {
    async fn send(&mut self, text: String) -> Result<(), EngineError>;
    async fn close(&mut self);
}

/// Read half of a connection. `None` means the peer closed cleanly.
#[async_trait]
pub trait ConnectionRx: Send {
    async fn recv(&mut self) -> Option<Result<String, EngineError>>;
}

/// Connection factory.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(
        &self,
        url: &str,
    ) -> Result<(Box<dyn ConnectionTx>, Box<dyn ConnectionRx>), EngineError>;
}

// ---------------------------------------------------------------------------
// WebSocket transport
// ---------------------------------------------------------------------------

type WsSink = futures_util::stream::SplitSink<
    WebSocketStream<MaybeTlsStream<TcpStream>>,
    Message,
>;
type WsSource = futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// tokio-tungstenite backed transport.
pub struct WsTransport;

struct WsTx {
    sink: WsSink,
}

struct WsRx {
    stream: WsSource,
}

#[async_trait]
impl Transport for WsTransport {
    async fn connect(
        &self,
        url: &str,
    ) -> Result<(Box<dyn ConnectionTx>, Box<dyn ConnectionRx>), EngineError> {
        info!(url = %url, "connecting upstream WebSocket");
        let (ws_stream, _response) = connect_async(url)
            .await
            .map_err(|_| EngineError::ConnectionLost)?;

        debug!(url = %url, "upstream WebSocket connected");
        let (sink, stream) = ws_stream.split();
        Ok((Box::new(WsTx { sink }), Box::new(WsRx { stream })))
    }
}

#[async_trait]
impl ConnectionTx for WsTx {
    async fn send(&mut self, text: String) -> Result<(), EngineError> {
        self.sink
            .send(Message::Text(text))
            .await
            .map_err(|_| EngineError::ConnectionLost)
    }

    async fn close(&mut self) {
        let _ = self.sink.send(Message::Close(None)).await;
        let _ = self.sink.close().await;
    }
}

#[async_trait]
impl ConnectionRx for WsRx {
    async fn recv(&mut self) -> Option<Result<String, EngineError>> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Some(Ok(text)),
                // tungstenite answers pings automatically; control frames and
                // binary payloads are not part of this protocol.
                Some(Ok(Message::Ping(_)))
                | Some(Ok(Message::Pong(_)))
                | Some(Ok(Message::Binary(_)))
                | Some(Ok(Message::Frame(_))) => continue,
                Some(Ok(Message::Close(_))) | None => return None,
                Some(Err(_)) => return Some(Err(EngineError::ConnectionLost)),
            }
        }
    }
}

// =============================================================================
// Mock transport for tests
// =============================================================================

#[cfg(test)]
pub mod mock {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::sync::mpsc;

    /// Scripted answer policy: given a sent frame, optionally produce the
    /// response payload (the mock echoes `req_id` automatically).
    pub type Responder = Arc<dyn Fn(&Value) -> Option<Value> + Send + Sync>;

    /// Channel-backed transport. Every `connect` creates a fresh connection
    /// whose inbound side the test can drive via [`MockTransport::push`].
    pub struct MockTransport {
        responder: Responder,
        /// All frames sent by the session, in order, across all connections.
        pub sent: Arc<Mutex<Vec<Value>>>,
        /// Inbound sender of the most recent connection.
        current_inbound: Arc<Mutex<Option<mpsc::UnboundedSender<String>>>>,
        pub connects: AtomicUsize,
        /// Number of initial `connect` calls to fail before succeeding.
        pub fail_first: AtomicUsize,
    }

    impl MockTransport {
        pub fn new(responder: Responder) -> Self {
            Self {
                responder,
                sent: Arc::new(Mutex::new(Vec::new())),
                current_inbound: Arc::new(Mutex::new(None)),
                connects: AtomicUsize::new(0),
                fail_first: AtomicUsize::new(0),
            }
        }

        /// Responder that authorizes every token and pongs every ping.
        pub fn authorizing() -> Responder {
            Arc::new(|frame: &Value| {
                if frame.get("authorize").is_some() {
                    Some(serde_json::json!({
                        "msg_type": "authorize",
                        "authorize": { "loginid": "acc-1", "currency": "USD" },
                    }))
                } else if frame.get("ping").is_some() {
                    Some(serde_json::json!({ "msg_type": "ping", "ping": "pong" }))
                } else {
                    None
                }
            })
        }

        /// Push an unsolicited inbound frame into the live connection.
        pub fn push(&self, payload: Value) {
            if let Some(tx) = self.current_inbound.lock().as_ref() {
                let _ = tx.send(payload.to_string());
            }
        }

        /// Drop the live connection (simulates a socket failure).
        pub fn sever(&self) {
            *self.current_inbound.lock() = None;
        }
    }

    pub struct MockTx {
        responder: Responder,
        sent: Arc<Mutex<Vec<Value>>>,
        // Shared with the transport so `sever` closes the channel for real.
        inbound: Arc<Mutex<Option<mpsc::UnboundedSender<String>>>>,
    }

    pub struct MockRx {
        inbound_rx: mpsc::UnboundedReceiver<String>,
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn connect(
            &self,
            _url: &str,
        ) -> Result<(Box<dyn ConnectionTx>, Box<dyn ConnectionRx>), EngineError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if self
                .fail_first
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(EngineError::ConnectionLost);
            }

            let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
            *self.current_inbound.lock() = Some(inbound_tx);

            Ok((
                Box::new(MockTx {
                    responder: self.responder.clone(),
                    sent: self.sent.clone(),
                    inbound: self.current_inbound.clone(),
                }),
                Box::new(MockRx { inbound_rx }),
            ))
        }
    }

    #[async_trait]
    impl ConnectionTx for MockTx {
        async fn send(&mut self, text: String) -> Result<(), EngineError> {
            let frame: Value = serde_json::from_str(&text)
                .map_err(|_| EngineError::Validation("mock received non-JSON".into()))?;
            self.sent.lock().push(frame.clone());

            if let Some(mut response) = (self.responder)(&frame) {
                if let Some(req_id) = frame.get("req_id") {
                    response["req_id"] = req_id.clone();
                }
                if let Some(tx) = self.inbound.lock().as_ref() {
                    let _ = tx.send(response.to_string());
                }
            }
            Ok(())
        }

        async fn close(&mut self) {}
    }

    #[async_trait]
    impl ConnectionRx for MockRx {
        async fn recv(&mut self) -> Option<Result<String, EngineError>> {
            self.inbound_rx.recv().await.map(Ok)
        }
    }
}
