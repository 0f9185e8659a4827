//! Request correlation table.
//!
//! Maps outstanding request ids to the oneshot continuation of the caller
//! awaiting the response. Every entry leaves the table exactly once: through
//! [`RequestTracker::complete`] / [`RequestTracker::resolve`] when the
//! response arrives, [`RequestTracker::reject`] on timeout, or
//! [`RequestTracker::cancel_all`] when the connection goes away.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::oneshot;

use packlink_core::prelude::*;

use crate::protocol::{error_payload_message, ResponsePayload};

/// Receiving half handed back to the caller of [`RequestTracker::register`].
pub type ResponseReceiver = oneshot::Receiver<Result<Value>>;

/// A request that has been sent and is waiting for its response.
#[derive(Debug)]
struct PendingRequest {
    method: String,
    created_at: Instant,
    timeout: Duration,
    response_tx: oneshot::Sender<Result<Value>>,
}

impl PendingRequest {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.created_at) >= self.timeout
    }
}

/// Tracks pending requests, awaiting responses from the packager.
///
/// All access goes through one mutex so that a response racing a timeout or
/// a connection-loss cancel resolves the continuation exactly once.
#[derive(Debug, Default)]
pub struct RequestTracker {
    pending: Mutex<HashMap<u64, PendingRequest>>,
}

impl RequestTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pending request and return the receiver for its outcome.
    ///
    /// An id that is still pending is never reused by the connection; if it
    /// happens anyway the older continuation is rejected so it cannot hang.
    pub fn register(&self, id: u64, method: &str, timeout: Duration) -> ResponseReceiver {
        let (response_tx, response_rx) = oneshot::channel();
        let pending = PendingRequest {
            method: method.to_string(),
            created_at: Instant::now(),
            timeout,
            response_tx,
        };

        let replaced = self.lock().insert(id, pending);
        if let Some(old) = replaced {
            warn!("Request id {} re-registered while still pending", id);
            let _ = old
                .response_tx
                .send(Err(Error::protocol(format!("request id {id} was reused"))));
        }

        response_rx
    }

    /// Deliver a response frame's payload to its continuation.
    ///
    /// An error payload is converted to [`Error::Remote`] carrying the method
    /// name of the original request. Returns `false` for unknown ids.
    pub fn complete(&self, id: u64, payload: ResponsePayload) -> bool {
        let Some(pending) = self.take(id) else {
            debug!("Dropping response for unknown or expired request id {}", id);
            return false;
        };

        let outcome = match payload {
            ResponsePayload::Result(value) => Ok(value),
            ResponsePayload::Error(error) => Err(Error::remote(
                &pending.method,
                error_payload_message(&error),
            )),
        };
        let _ = pending.response_tx.send(outcome);
        true
    }

    /// Resolve a pending request with a successful result.
    pub fn resolve(&self, id: u64, result: Value) -> bool {
        self.complete(id, ResponsePayload::Result(result))
    }

    /// Reject a pending request. Returns `false` if the id is not pending.
    pub fn reject(&self, id: u64, error: Error) -> bool {
        match self.take(id) {
            Some(pending) => {
                debug!("Rejecting request #{} ({}): {}", id, pending.method, error);
                let _ = pending.response_tx.send(Err(error));
                true
            }
            None => false,
        }
    }

    /// Reject every pending request and clear the table.
    ///
    /// `reason` builds a fresh error per request. Returns the number of
    /// requests that were cancelled.
    pub fn cancel_all(&self, reason: impl Fn() -> Error) -> usize {
        let drained: Vec<(u64, PendingRequest)> = self.lock().drain().collect();
        let count = drained.len();

        for (id, pending) in drained {
            debug!("Cancelling request #{} ({})", id, pending.method);
            let _ = pending.response_tx.send(Err(reason()));
        }

        count
    }

    /// Reject requests whose deadline has passed with [`Error::Timeout`].
    ///
    /// Callers normally enforce their own deadline; this sweep catches
    /// requests whose caller went away before doing so.
    pub fn reject_expired(&self) -> Vec<u64> {
        let now = Instant::now();
        let expired: Vec<(u64, PendingRequest)> = {
            let mut pending = self.lock();
            let ids: Vec<u64> = pending
                .iter()
                .filter(|(_, req)| req.is_expired(now))
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| pending.remove(&id).map(|req| (id, req)))
                .collect()
        };

        expired
            .into_iter()
            .map(|(id, req)| {
                let _ = req
                    .response_tx
                    .send(Err(Error::timeout(&req.method, req.timeout)));
                id
            })
            .collect()
    }

    /// Number of requests still waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.lock().len()
    }

    pub fn is_pending(&self, id: u64) -> bool {
        self.lock().contains_key(&id)
    }

    fn take(&self, id: u64) -> Option<PendingRequest> {
        self.lock().remove(&id)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, PendingRequest>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}
