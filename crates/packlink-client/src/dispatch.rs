//! Command dispatch table.
//!
//! Inbound requests and notifications are routed by [`PackagerMethod`] to a
//! registered handler. Two handler shapes exist:
//!
//! - [`NotificationHandler`]: fire-and-forget, receives the `params` only.
//! - [`RequestHandler`]: receives the `params` and a single-use
//!   [`Responder`] that must produce exactly one response.
//!
//! Handlers are plain synchronous callbacks. Long-running work should be
//! moved onto a spawned task that keeps the [`Responder`] and replies when
//! done, so the dispatch worker is never blocked.

use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use serde_json::Value;
use tokio::sync::mpsc;

use packlink_core::prelude::*;

use crate::protocol::{encode, Message, PackagerMethod};
use crate::transport::OutboundFrame;

/// Error text sent back when a request names a method with only a
/// notification handler.
pub const REQUEST_NOT_SUPPORTED: &str = "request is not supported";

/// Error text sent by a [`Responder`] that is dropped without replying.
pub const NO_RESPONSE: &str = "handler finished without responding";

// ---------------------------------------------------------------------------
// Handler traits
// ---------------------------------------------------------------------------

/// Handler for inbound notifications.
pub trait NotificationHandler: Send + Sync + 'static {
    fn on_notification(&self, params: Option<Value>) -> Result<()>;
}

impl<F> NotificationHandler for F
where
    F: Fn(Option<Value>) -> Result<()> + Send + Sync + 'static,
{
    fn on_notification(&self, params: Option<Value>) -> Result<()> {
        self(params)
    }
}

/// Handler for inbound requests.
///
/// The handler owns the [`Responder`] and may reply synchronously or move it
/// into a task and reply later. Returning an error after dropping the
/// responder unanswered sends an error response carrying the error text.
pub trait RequestHandler: Send + Sync + 'static {
    fn on_request(&self, params: Option<Value>, responder: Responder) -> Result<()>;
}

impl<F> RequestHandler for F
where
    F: Fn(Option<Value>, Responder) -> Result<()> + Send + Sync + 'static,
{
    fn on_request(&self, params: Option<Value>, responder: Responder) -> Result<()> {
        self(params, responder)
    }
}

// ---------------------------------------------------------------------------
// Responder
// ---------------------------------------------------------------------------

/// Single-use capability for answering one inbound request.
///
/// [`respond`](Self::respond) and [`error`](Self::error) consume the
/// responder, so a second reply is impossible. A responder dropped without
/// replying sends one error response so the peer never waits forever.
pub struct Responder {
    method: PackagerMethod,
    slot: Arc<ReplySlot>,
}

impl fmt::Debug for Responder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Responder")
            .field("id", &self.slot.id)
            .field("method", &self.method)
            .field("replied", &self.slot.lock().replied)
            .finish()
    }
}

impl Responder {
    pub(crate) fn new(
        id: u64,
        method: PackagerMethod,
        generation: u64,
        outbound: mpsc::UnboundedSender<OutboundFrame>,
    ) -> Self {
        Self {
            method,
            slot: Arc::new(ReplySlot {
                id,
                generation,
                outbound,
                state: Mutex::new(ReplyState::default()),
            }),
        }
    }

    /// Id of the request being answered.
    pub fn id(&self) -> u64 {
        self.slot.id
    }

    pub fn method(&self) -> &PackagerMethod {
        &self.method
    }

    /// Reply with a successful result.
    pub fn respond(self, result: Value) -> Result<()> {
        self.slot.lock().replied = true;
        self.slot.send(Message::result(self.slot.id, result))
    }

    /// Reply with an error message.
    pub fn error(self, message: impl Into<String>) -> Result<()> {
        self.slot.lock().replied = true;
        self.slot
            .send(Message::error(self.slot.id, Value::String(message.into())))
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        {
            let mut state = self.slot.lock();
            if state.replied {
                return;
            }
            // The dispatcher answers once the handler call returns.
            if state.dispatching {
                state.dropped = true;
                return;
            }
            state.replied = true;
        }
        warn!(
            "Request #{} ({}) dropped without a response, replying with an error",
            self.slot.id, self.method
        );
        self.slot.send_fallback(NO_RESPONSE);
    }
}

#[derive(Debug, Default)]
struct ReplyState {
    replied: bool,
    /// The handler call that received the responder has not returned yet.
    dispatching: bool,
    /// The responder was dropped unanswered while `dispatching`.
    dropped: bool,
}

/// Reply channel shared by a [`Responder`] and the dispatcher that created it.
struct ReplySlot {
    id: u64,
    generation: u64,
    outbound: mpsc::UnboundedSender<OutboundFrame>,
    state: Mutex<ReplyState>,
}

impl ReplySlot {
    fn lock(&self) -> MutexGuard<'_, ReplyState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn send(&self, message: Message) -> Result<()> {
        let text = encode(&message)?;
        self.outbound
            .send(OutboundFrame::response(self.generation, text))
            .map_err(|_| Error::ChannelClosed)
    }

    fn send_fallback(&self, message: &str) {
        if let Err(e) = self.send(Message::error(self.id, Value::String(message.to_string()))) {
            debug!("Could not send fallback response for #{}: {}", self.id, e);
        }
    }

    fn begin_dispatch(&self) {
        self.lock().dispatching = true;
    }

    /// Called after the handler returned. If it dropped the responder without
    /// replying, answer with `failure` (the handler's error) or
    /// [`NO_RESPONSE`].
    fn finish_dispatch(&self, failure: Option<String>) {
        let owed = {
            let mut state = self.lock();
            state.dispatching = false;
            let owed = state.dropped && !state.replied;
            if owed {
                state.replied = true;
            }
            owed
        };
        if owed {
            self.send_fallback(failure.as_deref().unwrap_or(NO_RESPONSE));
        }
    }
}

// ---------------------------------------------------------------------------
// HandlerRegistry
// ---------------------------------------------------------------------------

#[derive(Clone)]
enum HandlerEntry {
    Notification(Arc<dyn NotificationHandler>),
    Request(Arc<dyn RequestHandler>),
}

impl HandlerEntry {
    fn shape(&self) -> &'static str {
        match self {
            HandlerEntry::Notification(_) => "notification",
            HandlerEntry::Request(_) => "request",
        }
    }
}

/// Handlers keyed by method.
///
/// Registration and lookup are serialized by an internal lock; handlers are
/// invoked with the lock released so a handler may register further
/// handlers.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<PackagerMethod, HandlerEntry>>,
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
        let mut methods: Vec<String> = handlers
            .iter()
            .map(|(method, entry)| format!("{method} ({})", entry.shape()))
            .collect();
        methods.sort();
        f.debug_struct("HandlerRegistry")
            .field("methods", &methods)
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a notification handler, replacing any handler for `method`.
    pub fn register_notification_handler(
        &self,
        method: impl Into<PackagerMethod>,
        handler: impl NotificationHandler,
    ) {
        self.insert(method.into(), HandlerEntry::Notification(Arc::new(handler)));
    }

    /// Register a request handler, replacing any handler for `method`.
    pub fn register_request_handler(
        &self,
        method: impl Into<PackagerMethod>,
        handler: impl RequestHandler,
    ) {
        self.insert(method.into(), HandlerEntry::Request(Arc::new(handler)));
    }

    pub fn contains(&self, method: &PackagerMethod) -> bool {
        self.read().contains_key(method)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn insert(&self, method: PackagerMethod, entry: HandlerEntry) {
        debug!("Registering {} handler for '{}'", entry.shape(), method);
        let previous = self
            .handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(method.clone(), entry);
        if previous.is_some() {
            debug!("Replaced existing handler for '{}'", method);
        }
    }

    fn lookup(&self, method: &PackagerMethod) -> Option<HandlerEntry> {
        self.read().get(method).cloned()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<PackagerMethod, HandlerEntry>> {
        self.handlers.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Route one inbound message to its handler.
    ///
    /// `generation` identifies the connection the message arrived on;
    /// responses produced for it are discarded if that connection has since
    /// been replaced. Errors describe what went wrong for logging only: the
    /// peer has already been answered where an answer is owed.
    pub(crate) fn dispatch(
        &self,
        message: Message,
        generation: u64,
        outbound: &mpsc::UnboundedSender<OutboundFrame>,
    ) -> Result<()> {
        match message {
            Message::Notification { method, params } => self.dispatch_notification(method, params),
            Message::Request { id, method, params } => {
                let responder = Responder::new(id, method.clone(), generation, outbound.clone());
                self.dispatch_request(method, params, responder)
            }
            Message::Response { id, .. } => Err(Error::protocol(format!(
                "response #{id} cannot be dispatched to a handler"
            ))),
        }
    }

    fn dispatch_notification(&self, method: PackagerMethod, params: Option<Value>) -> Result<()> {
        let handler = match self.lookup(&method) {
            Some(HandlerEntry::Notification(handler)) => handler,
            Some(HandlerEntry::Request(_)) => {
                return Err(Error::protocol(format!(
                    "notification '{method}' has only a request handler, dropping it"
                )));
            }
            None => return Err(Error::method_not_found(method.as_str())),
        };

        match catch_unwind(AssertUnwindSafe(|| handler.on_notification(params))) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(Error::handler_failure(method.as_str(), e.to_string())),
            Err(panic) => Err(Error::handler_failure(
                method.as_str(),
                panic_message(panic.as_ref()),
            )),
        }
    }

    fn dispatch_request(
        &self,
        method: PackagerMethod,
        params: Option<Value>,
        responder: Responder,
    ) -> Result<()> {
        let handler = match self.lookup(&method) {
            Some(HandlerEntry::Request(handler)) => handler,
            Some(HandlerEntry::Notification(_)) => {
                responder.error(REQUEST_NOT_SUPPORTED)?;
                return Err(Error::protocol(format!(
                    "request '{method}' has only a notification handler"
                )));
            }
            None => {
                let err = Error::method_not_found(method.as_str());
                responder.error(err.to_string())?;
                return Err(err);
            }
        };

        // A responder dropped inside the call (returned error or panic) is
        // answered here with the failure text.
        let slot = Arc::clone(&responder.slot);
        slot.begin_dispatch();
        let failure = match catch_unwind(AssertUnwindSafe(|| handler.on_request(params, responder))) {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(panic) => Some(panic_message(panic.as_ref())),
        };
        slot.finish_dispatch(failure.clone());

        match failure {
            None => Ok(()),
            Some(message) => Err(Error::handler_failure(method.as_str(), message)),
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("handler panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("handler panicked: {s}")
    } else {
        "handler panicked".to_string()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
