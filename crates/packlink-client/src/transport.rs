//! WebSocket transport for the packager connection.
//!
//! One I/O loop per established socket. The loop is the only writer, so
//! every frame goes out as one complete WebSocket message, and it reads
//! frames in arrival order, forwarding requests and notifications to the
//! dispatch worker through an ordered channel.
//!
//! Frames are stamped with the *generation* of the socket they belong to.
//! After a reconnect the generation moves on and anything queued for the old
//! socket is discarded: responses to requests the new peer never saw, and
//! requests whose response could never arrive (those are rejected with
//! [`Error::ConnectionLost`]).

use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use url::Url;

use packlink_core::prelude::*;
use packlink_core::ConnectionSettings;

use crate::protocol::{decode, Message};
use crate::tracker::RequestTracker;

/// How often the I/O loop sweeps expired requests out of the tracker.
const STALE_REQUEST_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

type WsSink = SplitSink<WsStream, WsMessage>;

// ---------------------------------------------------------------------------
// Frames
// ---------------------------------------------------------------------------

/// An encoded frame waiting to be written by the I/O loop.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundFrame {
    /// Socket generation the frame was produced for.
    pub generation: u64,
    /// Set for request frames so a discarded frame can reject its request.
    pub request_id: Option<u64>,
    pub text: String,
}

impl OutboundFrame {
    pub fn request(generation: u64, id: u64, text: String) -> Self {
        Self {
            generation,
            request_id: Some(id),
            text,
        }
    }

    pub fn response(generation: u64, text: String) -> Self {
        Self {
            generation,
            request_id: None,
            text,
        }
    }

    pub fn notification(generation: u64, text: String) -> Self {
        Self::response(generation, text)
    }
}

/// A decoded request or notification handed to the dispatch worker.
#[derive(Debug)]
pub(crate) struct InboundFrame {
    pub generation: u64,
    pub message: Message,
}

/// Why an I/O loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LoopExit {
    /// Caller-initiated shutdown; do not reconnect.
    Closed,
    /// The socket closed or failed underneath us; reconnect.
    Lost,
}

// ---------------------------------------------------------------------------
// Reconnection policy
// ---------------------------------------------------------------------------

/// Capped-exponential reconnection policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay before the first reconnection attempt.
    pub initial_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Consecutive failed attempts after which the connection gives up.
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    /// Delay before reconnection attempt `attempt` (1-indexed).
    ///
    /// `initial_delay * 2^(attempt-1)`, capped at `max_delay`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let multiplier = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
        self.initial_delay
            .checked_mul(multiplier)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

impl From<&ConnectionSettings> for ReconnectPolicy {
    fn from(settings: &ConnectionSettings) -> Self {
        Self {
            initial_delay: settings.reconnect_initial_delay(),
            max_delay: settings.reconnect_max_delay(),
            max_attempts: settings.max_reconnect_attempts,
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from(&ConnectionSettings::default())
    }
}

// ---------------------------------------------------------------------------
// Connection + I/O loop
// ---------------------------------------------------------------------------

/// Establish a new WebSocket connection to `url`.
pub(crate) async fn connect_ws(url: &Url) -> Result<WsStream> {
    let (ws_stream, _response) = connect_async(url.as_str())
        .await
        .map_err(|err| Error::http(format!("Failed to connect to {url}: {err}")))?;
    Ok(ws_stream)
}

/// Everything one I/O loop needs besides the socket itself.
pub(crate) struct IoContext<'a> {
    pub generation: u64,
    pub outbound_rx: &'a mut mpsc::UnboundedReceiver<OutboundFrame>,
    pub inbound_tx: &'a mpsc::UnboundedSender<InboundFrame>,
    pub tracker: &'a RequestTracker,
    pub shutdown: &'a CancellationToken,
}

/// Run one socket's read/write select loop until it closes.
pub(crate) async fn run_io_loop(ws_stream: WsStream, ctx: IoContext<'_>) -> LoopExit {
    let (mut ws_sink, mut ws_stream) = ws_stream.split();

    let mut sweep = tokio::time::interval(STALE_REQUEST_SWEEP_INTERVAL);
    sweep.tick().await; // consume the immediate first tick

    loop {
        tokio::select! {
            // Caller shutdown wins over pending traffic.
            biased;

            _ = ctx.shutdown.cancelled() => {
                send_close(&mut ws_sink).await;
                return LoopExit::Closed;
            }

            // ── Incoming frame ──────────────────────────────────────────
            frame = ws_stream.next() => {
                match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        handle_inbound(text.as_bytes(), &ctx);
                    }
                    Some(Ok(WsMessage::Binary(data))) => {
                        handle_inbound(&data, &ctx);
                    }
                    Some(Ok(WsMessage::Close(_))) => {
                        debug!("Packager sent a Close frame");
                        return LoopExit::Lost;
                    }
                    Some(Ok(_)) => {
                        // Ping/Pong handled by tungstenite
                    }
                    Some(Err(err)) => {
                        warn!("Packager socket read error: {}", err);
                        return LoopExit::Lost;
                    }
                    None => {
                        debug!("Packager socket stream ended");
                        return LoopExit::Lost;
                    }
                }
            }

            // ── Outgoing frame ──────────────────────────────────────────
            frame = ctx.outbound_rx.recv() => {
                let Some(frame) = frame else {
                    debug!("Outbound channel closed, shutting down packager socket");
                    send_close(&mut ws_sink).await;
                    return LoopExit::Closed;
                };
                if !write_frame(&mut ws_sink, frame, &ctx).await {
                    return LoopExit::Lost;
                }
            }

            // ── Periodic stale request sweep ────────────────────────────
            _ = sweep.tick() => {
                let expired = ctx.tracker.reject_expired();
                if !expired.is_empty() {
                    debug!("Swept {} expired request(s): {:?}", expired.len(), expired);
                }
            }
        }
    }
}

/// Route one inbound frame: responses to the tracker, everything else to
/// the dispatch worker. Undecodable frames are logged and dropped.
fn handle_inbound(data: &[u8], ctx: &IoContext<'_>) {
    let message = match decode(data) {
        Ok(message) => message,
        Err(e) => {
            warn!("Dropping packager frame: {}", e);
            trace!("Dropped frame: {}", String::from_utf8_lossy(data));
            return;
        }
    };

    match message {
        Message::Response { id, payload } => {
            ctx.tracker.complete(id, payload);
        }
        message => {
            trace!("Queueing inbound {} for dispatch", message.kind());
            let inbound = InboundFrame {
                generation: ctx.generation,
                message,
            };
            if ctx.inbound_tx.send(inbound).is_err() {
                warn!("Dispatch worker has stopped, dropping inbound frame");
            }
        }
    }
}

/// Write one outbound frame. Returns `false` if the socket failed.
async fn write_frame(ws_sink: &mut WsSink, frame: OutboundFrame, ctx: &IoContext<'_>) -> bool {
    if frame.generation != ctx.generation {
        debug!(
            "Discarding frame for previous connection (generation {} != {})",
            frame.generation, ctx.generation
        );
        if let Some(id) = frame.request_id {
            ctx.tracker.reject(id, Error::ConnectionLost);
        }
        return true;
    }

    match ws_sink.send(WsMessage::Text(frame.text.into())).await {
        Ok(()) => true,
        Err(err) => {
            warn!("Packager socket write error: {}", err);
            if let Some(id) = frame.request_id {
                ctx.tracker.reject(id, Error::ConnectionLost);
            }
            false
        }
    }
}

/// Send a WebSocket Close frame, ignoring any write errors.
async fn send_close(ws_sink: &mut WsSink) {
    let _ = ws_sink.send(WsMessage::Close(None)).await;
    let _ = ws_sink.close().await;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
