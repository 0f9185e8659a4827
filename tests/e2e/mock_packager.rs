//! Mock development packager for integration testing
//!
//! Serves the packager connection endpoint on a loopback port so the real
//! client can be driven over a real WebSocket.
//!
//! # Behavior
//!
//! - Accepts one client at a time; a new connection replaces the current one.
//! - Every text frame received is parsed as JSON and forwarded to the test
//!   through [`MockPackager::recv`].
//! - Requests for the `echo` method are answered automatically with their
//!   params as the result. Everything else is left for the test to answer
//!   with [`MockPackager::send`].
//!
//! # Limitations
//!
//! - **No version check**: frames are forwarded as-is, including malformed ones
//!   that still parse as JSON
//! - **Abrupt drops only**: [`MockPackager::drop_connection`] tears down the TCP
//!   stream without a close handshake
//!
//! # Usage Example
//!
//! ```ignore
//! let mut packager = MockPackager::start().await;
//! let connection = PackagerConnection::new();
//! connection.open(&packager.url(), "e2e");
//!
//! packager.send(json!({"version": 2, "method": "reload"}));
//! let frame = packager.recv().await;
//! ```

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use url::Url;

/// Default timeout for [`MockPackager::recv`].
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

/// Commands from the test to the server task.
#[derive(Debug)]
enum Control {
    Send(String),
    DropConnection,
    Shutdown,
}

#[derive(Debug, Default)]
struct Stats {
    connections: AtomicUsize,
    uris: Mutex<Vec<String>>,
}

/// Handle to a running mock packager.
pub struct MockPackager {
    addr: SocketAddr,
    control_tx: mpsc::UnboundedSender<Control>,
    inbound_rx: mpsc::UnboundedReceiver<Value>,
    stats: Arc<Stats>,
}

impl MockPackager {
    /// Bind to a free loopback port and start serving.
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let stats = Arc::new(Stats::default());

        tokio::spawn(run(listener, control_rx, inbound_tx, Arc::clone(&stats)));

        Self {
            addr,
            control_tx,
            inbound_rx,
            stats,
        }
    }

    /// Packager connection endpoint, without a client id.
    pub fn url(&self) -> Url {
        Url::parse(&format!("ws://{}/message", self.addr)).unwrap()
    }

    /// Send a JSON frame to the connected client.
    pub fn send(&self, frame: Value) {
        let _ = self.control_tx.send(Control::Send(frame.to_string()));
    }

    /// Send a raw text frame to the connected client.
    pub fn send_text(&self, text: impl Into<String>) {
        let _ = self.control_tx.send(Control::Send(text.into()));
    }

    /// Tear down the current connection without a close handshake.
    pub fn drop_connection(&self) {
        let _ = self.control_tx.send(Control::DropConnection);
    }

    /// Stop the server and release the port.
    pub fn shutdown(&self) {
        let _ = self.control_tx.send(Control::Shutdown);
    }

    /// Next frame received from the client (with default timeout).
    pub async fn recv(&mut self) -> Option<Value> {
        self.recv_with_timeout(DEFAULT_TIMEOUT).await
    }

    /// Next frame received from the client.
    pub async fn recv_with_timeout(&mut self, timeout: Duration) -> Option<Value> {
        tokio::time::timeout(timeout, self.inbound_rx.recv())
            .await
            .ok()
            .flatten()
    }

    /// Skip frames until one matches `predicate`.
    pub async fn recv_matching(&mut self, predicate: impl Fn(&Value) -> bool) -> Option<Value> {
        loop {
            let frame = self.recv().await?;
            if predicate(&frame) {
                return Some(frame);
            }
        }
    }

    /// Number of WebSocket handshakes completed so far.
    pub fn connection_count(&self) -> usize {
        self.stats.connections.load(Ordering::SeqCst)
    }

    /// Request URI of the most recent connection.
    pub fn last_uri(&self) -> Option<String> {
        self.stats.uris.lock().unwrap().last().cloned()
    }
}

impl Drop for MockPackager {
    fn drop(&mut self) {
        let _ = self.control_tx.send(Control::Shutdown);
    }
}

async fn run(
    listener: TcpListener,
    mut control_rx: mpsc::UnboundedReceiver<Control>,
    inbound_tx: mpsc::UnboundedSender<Value>,
    stats: Arc<Stats>,
) {
    let mut current: Option<WebSocketStream<TcpStream>> = None;

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let Ok((stream, _)) = accepted else { continue };
                let recorder = Arc::clone(&stats);
                let handshake = tokio_tungstenite::accept_hdr_async(
                    stream,
                    move |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
                        recorder.uris.lock().unwrap().push(request.uri().to_string());
                        Ok(response)
                    },
                )
                .await;
                if let Ok(ws) = handshake {
                    stats.connections.fetch_add(1, Ordering::SeqCst);
                    current = Some(ws);
                }
            }
            frame = next_frame(&mut current) => match frame {
                Some(Ok(WsMessage::Text(text))) => {
                    let Ok(value) = serde_json::from_str::<Value>(text.as_str()) else { continue };
                    if let Some(reply) = echo_reply(&value) {
                        if let Some(ws) = current.as_mut() {
                            let _ = ws.send(WsMessage::Text(reply.to_string().into())).await;
                        }
                    }
                    let _ = inbound_tx.send(value);
                }
                Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => current = None,
                Some(Ok(_)) => {}
            },
            control = control_rx.recv() => match control {
                Some(Control::Send(text)) => {
                    if let Some(ws) = current.as_mut() {
                        let _ = ws.send(WsMessage::Text(text.into())).await;
                    }
                }
                Some(Control::DropConnection) => current = None,
                Some(Control::Shutdown) | None => break,
            },
        }
    }
}

async fn next_frame(
    current: &mut Option<WebSocketStream<TcpStream>>,
) -> Option<Result<WsMessage, tokio_tungstenite::tungstenite::Error>> {
    match current.as_mut() {
        Some(ws) => ws.next().await,
        None => std::future::pending().await,
    }
}

fn echo_reply(frame: &Value) -> Option<Value> {
    if frame.get("method")?.as_str()? != "echo" {
        return None;
    }
    let id = frame.get("id")?.clone();
    let params = frame.get("params").cloned().unwrap_or(Value::Null);
    Some(json!({ "version": 2, "id": id, "result": params }))
}
