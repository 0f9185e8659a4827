//! Packager connection orchestrator.
//!
//! [`PackagerConnection`] owns the socket session, the request correlation
//! table and the command dispatch table, and exposes the collaborator-facing
//! API: `open`, `close`, `send_notification` and `send_request`.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                        PackagerConnection                         │
//! │                                                                   │
//! │  send_request() ──register──▶ RequestTracker ◀──responses──┐      │
//! │        │                                                    │      │
//! │        └──────outbound frames──────▶ session task ──────────┤      │
//! │  send_notification() ──────────────▶ (connect / retry,      │      │
//! │                                       run_io_loop)  ────────┘      │
//! │                                             │                      │
//! │                              requests + notifications (ordered)    │
//! │                                             ▼                      │
//! │                                     dispatch worker                │
//! │                                  HandlerRegistry::dispatch         │
//! └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Handlers survive reconnection. Only in-flight requests are cancelled when
//! a socket is replaced, since their responses cannot arrive on a new one.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;

use packlink_core::prelude::*;
use packlink_core::ConnectionSettings;

use crate::dispatch::{HandlerRegistry, NotificationHandler, RequestHandler};
use crate::protocol::{encode, Message, PackagerMethod};
use crate::tracker::RequestTracker;
use crate::transport::{
    connect_ws, run_io_loop, InboundFrame, IoContext, LoopExit, OutboundFrame, ReconnectPolicy,
};

/// Query parameter carrying the client id in the connection URL.
pub const CLIENT_ID_PARAM: &str = "clientid";

/// How long `close()` waits for the session task before aborting it.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

const EVENT_CHANNEL_CAPACITY: usize = 64;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Lifecycle state of a [`PackagerConnection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not open, or permanently failed.
    Disconnected,
    /// Establishing a socket, initially or after a loss.
    Connecting,
    /// Socket established; frames flow.
    Connected,
    /// `close()` in progress.
    Closing,
}

/// Lifecycle events delivered through [`PackagerConnection::subscribe`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A socket was established.
    Connected,
    /// The current socket closed, for any reason.
    Disconnected,
    /// A reconnection attempt is scheduled.
    Reconnecting { attempt: u32, max_attempts: u32 },
    /// Reconnection attempts are exhausted. Sent once; the connection stays
    /// `Disconnected` until opened again.
    PermanentlyDisconnected { reason: String },
}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

struct Session {
    outbound_tx: mpsc::UnboundedSender<OutboundFrame>,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

struct Inner {
    registry: HandlerRegistry,
    tracker: RequestTracker,
    next_id: AtomicU64,
    generation: AtomicU64,
    state_tx: watch::Sender<ConnectionState>,
    event_tx: broadcast::Sender<ConnectionEvent>,
    policy: ReconnectPolicy,
    request_timeout: Duration,
    session: Mutex<Option<Session>>,
}

impl Inner {
    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!("Packager connection state: {:?} -> {:?}", previous, state);
        }
    }

    fn emit(&self, event: ConnectionEvent) {
        // No subscribers is fine.
        let _ = self.event_tx.send(event);
    }

    fn lock_session(&self) -> std::sync::MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn push(&self, frame: OutboundFrame) -> Result<()> {
        let session = self.lock_session();
        let session = session.as_ref().ok_or(Error::NotConnected)?;
        session
            .outbound_tx
            .send(frame)
            .map_err(|_| Error::NotConnected)
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for [`PackagerConnection`].
#[derive(Debug)]
pub struct PackagerConnectionBuilder {
    policy: ReconnectPolicy,
    request_timeout: Duration,
    registry: HandlerRegistry,
}

impl Default for PackagerConnectionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PackagerConnectionBuilder {
    pub fn new() -> Self {
        let settings = ConnectionSettings::default();
        Self {
            policy: ReconnectPolicy::from(&settings),
            request_timeout: settings.request_timeout(),
            registry: HandlerRegistry::new(),
        }
    }

    /// Take the reconnection policy and default request timeout from settings.
    pub fn settings(mut self, settings: &ConnectionSettings) -> Self {
        self.policy = ReconnectPolicy::from(settings);
        self.request_timeout = settings.request_timeout();
        self
    }

    pub fn reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Timeout used by [`PackagerConnection::request`].
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Start from a pre-populated handler registry.
    pub fn handlers(mut self, registry: HandlerRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn build(self) -> PackagerConnection {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        PackagerConnection {
            inner: Arc::new(Inner {
                registry: self.registry,
                tracker: RequestTracker::new(),
                next_id: AtomicU64::new(1),
                generation: AtomicU64::new(0),
                state_tx,
                event_tx,
                policy: self.policy,
                request_timeout: self.request_timeout,
                session: Mutex::new(None),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// PackagerConnection
// ---------------------------------------------------------------------------

/// Persistent, reconnecting control channel to the development packager.
///
/// Cloning yields another handle to the same connection, so handlers and
/// background tasks can send requests of their own. The background session
/// runs until [`close`](Self::close) is called or reconnection gives up.
#[derive(Clone)]
pub struct PackagerConnection {
    inner: Arc<Inner>,
}

impl fmt::Debug for PackagerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PackagerConnection")
            .field("state", &self.state())
            .field("handlers", &self.inner.registry)
            .field("pending_requests", &self.inner.tracker.pending_count())
            .finish()
    }
}

impl Default for PackagerConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl PackagerConnection {
    pub fn new() -> Self {
        PackagerConnectionBuilder::new().build()
    }

    pub fn builder() -> PackagerConnectionBuilder {
        PackagerConnectionBuilder::new()
    }

    pub fn from_settings(settings: &ConnectionSettings) -> Self {
        PackagerConnectionBuilder::new().settings(settings).build()
    }

    // ── Handler registration ──────────────────────────────────────────────

    pub fn register_notification_handler(
        &self,
        method: impl Into<PackagerMethod>,
        handler: impl NotificationHandler,
    ) {
        self.inner
            .registry
            .register_notification_handler(method, handler);
    }

    pub fn register_request_handler(
        &self,
        method: impl Into<PackagerMethod>,
        handler: impl RequestHandler,
    ) {
        self.inner.registry.register_request_handler(method, handler);
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.inner.registry
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────

    /// Open the connection to `endpoint`, identifying as `client_id`.
    ///
    /// Returns immediately; the socket is established in the background and
    /// progress is visible through [`state`](Self::state) and
    /// [`subscribe`](Self::subscribe). Calling `open` while a session is
    /// running is a no-op with a warning.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn open(&self, endpoint: &Url, client_id: &str) {
        let mut session = self.inner.lock_session();
        if let Some(existing) = session.as_ref() {
            if !existing.task.is_finished() {
                warn!("Packager connection is already open, ignoring open()");
                return;
            }
        }

        let url = with_client_id(endpoint, client_id);
        info!("Opening packager connection to {}", url);

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        self.inner.set_state(ConnectionState::Connecting);

        let task = tokio::spawn(run_session(
            Arc::clone(&self.inner),
            url,
            outbound_tx.clone(),
            outbound_rx,
            shutdown.clone(),
        ));

        *session = Some(Session {
            outbound_tx,
            shutdown,
            task,
        });
    }

    /// Close the connection and reject all pending requests with
    /// [`Error::ConnectionClosed`]. Idempotent.
    pub async fn close(&self) {
        let session = {
            let mut slot = self.inner.lock_session();
            let session = slot.take();
            if let Some(session) = &session {
                info!("Closing packager connection");
                self.inner.set_state(ConnectionState::Closing);
                session.shutdown.cancel();
            }
            session
        };
        let Some(mut session) = session else {
            debug!("close(): packager connection is not open");
            return;
        };

        if tokio::time::timeout(CLOSE_TIMEOUT, &mut session.task)
            .await
            .is_err()
        {
            warn!(
                "Packager session did not stop within {:?}, aborting",
                CLOSE_TIMEOUT
            );
            session.task.abort();
        }

        // `open()` may have started a new session while the old one wound
        // down; its requests and state are not ours to reset.
        let slot = self.inner.lock_session();
        if slot.is_some() {
            debug!("Packager connection reopened during close()");
            return;
        }
        let cancelled = self.inner.tracker.cancel_all(|| Error::ConnectionClosed);
        if cancelled > 0 {
            debug!("Cancelled {} pending request(s) on close", cancelled);
        }
        self.inner.set_state(ConnectionState::Disconnected);
    }

    /// `true` while a session task is running (connected or retrying).
    pub fn is_open(&self) -> bool {
        self.inner
            .lock_session()
            .as_ref()
            .is_some_and(|s| !s.task.is_finished())
    }

    // ── Messaging ─────────────────────────────────────────────────────────

    /// Send a notification. Dropped with a log line if not connected.
    pub fn send_notification(&self, method: impl Into<PackagerMethod>, params: Option<Value>) {
        let method = method.into();
        if self.state() != ConnectionState::Connected {
            warn!("Not connected to the packager, dropping notification '{}'", method);
            return;
        }

        let text = match encode(&Message::notification(method.clone(), params)) {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to encode notification '{}': {}", method, e);
                return;
            }
        };

        let generation = self.inner.generation.load(Ordering::SeqCst);
        if let Err(e) = self
            .inner
            .push(OutboundFrame::notification(generation, text))
        {
            warn!("Dropping notification '{}': {}", method, e);
        }
    }

    /// Send a request and wait for its response.
    ///
    /// Resolves exactly once: with the peer's result, or with
    /// [`Error::Remote`] (peer replied with an error), [`Error::Timeout`],
    /// [`Error::ConnectionLost`] / [`Error::ConnectionClosed`], or
    /// [`Error::NotConnected`] if no socket is established.
    pub async fn send_request(
        &self,
        method: impl Into<PackagerMethod>,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value> {
        let method = method.into();
        if self.state() != ConnectionState::Connected {
            return Err(Error::NotConnected);
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let text = encode(&Message::request(id, method.clone(), params))?;

        // Register before the frame is queued so a fast response finds it.
        let mut response_rx = self.inner.tracker.register(id, method.as_str(), timeout);
        let generation = self.inner.generation.load(Ordering::SeqCst);

        debug!("Sending request #{} ({})", id, method);
        if let Err(e) = self
            .inner
            .push(OutboundFrame::request(generation, id, text))
        {
            self.inner.tracker.reject(id, e);
        }

        let outcome = match tokio::time::timeout(timeout, &mut response_rx).await {
            Ok(outcome) => outcome,
            Err(_) => {
                // Whichever of timeout or response reaches the tracker first
                // decides the outcome.
                self.inner
                    .tracker
                    .reject(id, Error::timeout(method.as_str(), timeout));
                response_rx.await
            }
        };

        outcome.map_err(|_| Error::ChannelClosed)?
    }

    /// [`send_request`](Self::send_request) with the configured default
    /// timeout.
    pub async fn request(
        &self,
        method: impl Into<PackagerMethod>,
        params: Option<Value>,
    ) -> Result<Value> {
        self.send_request(method, params, self.inner.request_timeout)
            .await
    }

    // ── Observation ───────────────────────────────────────────────────────

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// Wait until the connection reaches `state`.
    pub async fn wait_for_state(&self, state: ConnectionState, timeout: Duration) -> Result<()> {
        let mut state_rx = self.inner.state_tx.subscribe();
        let outcome = match tokio::time::timeout(timeout, state_rx.wait_for(|s| *s == state)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(Error::ChannelClosed),
            Err(_) => Err(Error::timeout(format!("wait for {state:?}"), timeout)),
        };
        outcome
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Number of requests still awaiting a response.
    pub fn pending_request_count(&self) -> usize {
        self.inner.tracker.pending_count()
    }
}

// ---------------------------------------------------------------------------
// Background tasks
// ---------------------------------------------------------------------------

/// Own the socket for one `open()` .. `close()` span: connect, run the I/O
/// loop, and reconnect with backoff after unexpected losses.
async fn run_session(
    inner: Arc<Inner>,
    url: Url,
    outbound_tx: mpsc::UnboundedSender<OutboundFrame>,
    mut outbound_rx: mpsc::UnboundedReceiver<OutboundFrame>,
    shutdown: CancellationToken,
) {
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    // Detached: finishes once `inbound_tx` is dropped and the queue drains.
    tokio::spawn(run_dispatch_worker(
        Arc::clone(&inner),
        inbound_rx,
        outbound_tx,
    ));

    let policy = inner.policy;
    let mut failures: u32 = 0;
    let mut delay: Option<Duration> = None;

    loop {
        if let Some(delay) = delay.take() {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        if shutdown.is_cancelled() {
            break;
        }
        inner.set_state(ConnectionState::Connecting);
        let connected = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            result = connect_ws(&url) => result,
        };

        match connected {
            Ok(ws_stream) => {
                failures = 0;
                let generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
                info!("Connected to packager (generation {})", generation);
                inner.set_state(ConnectionState::Connected);
                inner.emit(ConnectionEvent::Connected);

                let exit = run_io_loop(
                    ws_stream,
                    IoContext {
                        generation,
                        outbound_rx: &mut outbound_rx,
                        inbound_tx: &inbound_tx,
                        tracker: &inner.tracker,
                        shutdown: &shutdown,
                    },
                )
                .await;
                inner.emit(ConnectionEvent::Disconnected);

                if exit == LoopExit::Closed {
                    break;
                }

                // Leave `Connected` first so no new request slips in behind
                // the cancellation.
                inner.set_state(ConnectionState::Connecting);
                let cancelled = inner.tracker.cancel_all(|| Error::ConnectionLost);
                let backoff = policy.backoff(1);
                warn!(
                    "Lost connection to packager ({} pending request(s) cancelled), \
                     reconnecting in {:?}",
                    cancelled, backoff
                );
                inner.emit(ConnectionEvent::Reconnecting {
                    attempt: 1,
                    max_attempts: policy.max_attempts,
                });
                delay = Some(backoff);
            }
            Err(err) => {
                failures += 1;
                if failures >= policy.max_attempts {
                    let failure = Error::transport_failure(failures, err.to_string());
                    error!("{}", failure);
                    inner.tracker.cancel_all(|| Error::ConnectionLost);
                    inner.set_state(ConnectionState::Disconnected);
                    inner.emit(ConnectionEvent::PermanentlyDisconnected {
                        reason: failure.to_string(),
                    });
                    break;
                }

                let attempt = failures + 1;
                let backoff = policy.backoff(attempt);
                warn!(
                    "{}; retrying in {:?} (attempt {}/{})",
                    err, backoff, attempt, policy.max_attempts
                );
                inner.emit(ConnectionEvent::Reconnecting {
                    attempt,
                    max_attempts: policy.max_attempts,
                });
                delay = Some(backoff);
            }
        }
    }

    debug!("Packager session task exiting");
}

/// Dispatch inbound requests and notifications one at a time, in arrival
/// order.
async fn run_dispatch_worker(
    inner: Arc<Inner>,
    mut inbound_rx: mpsc::UnboundedReceiver<InboundFrame>,
    outbound_tx: mpsc::UnboundedSender<OutboundFrame>,
) {
    while let Some(InboundFrame {
        generation,
        message,
    }) = inbound_rx.recv().await
    {
        let kind = message.kind();
        match inner.registry.dispatch(message, generation, &outbound_tx) {
            Ok(()) => {}
            Err(e @ Error::HandlerFailure { .. }) => error!("{}", e),
            Err(e) if e.is_recoverable() => warn!("Inbound {}: {}", kind, e),
            Err(e) => error!("Inbound {}: {}", kind, e),
        }
    }

    debug!("Dispatch worker exiting");
}

/// Append (or replace) the client id query parameter.
fn with_client_id(endpoint: &Url, client_id: &str) -> Url {
    let retained: Vec<(String, String)> = endpoint
        .query_pairs()
        .filter(|(key, _)| key != CLIENT_ID_PARAM)
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();

    let mut url = endpoint.clone();
    url.query_pairs_mut()
        .clear()
        .extend_pairs(retained)
        .append_pair(CLIENT_ID_PARAM, client_id);
    url
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
