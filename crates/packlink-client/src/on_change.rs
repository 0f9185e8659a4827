//! Long-poll change notifier.
//!
//! Keeps one GET outstanding against the development server's `/onchange`
//! endpoint. The server holds the request open until content changes, then
//! answers with `205 Reset Content`; the notifier invokes its callback and
//! immediately polls again. Any other successful answer is re-polled
//! immediately too. Failures (network errors and non-success statuses)
//! wait a fixed delay before the next poll.
//!
//! ```text
//! Idle ──start()──▶ Polling ──205──▶ onChange() ──▶ Polling
//!                     │  ──2xx──────────────────▶ Polling
//!                     │  ──error──▶ sleep(failure_delay) ──▶ Polling
//!                     └──stop()──▶ Idle
//! ```

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;

use packlink_core::prelude::*;
use packlink_core::PollingSettings;

/// Status code the server uses to signal "content changed".
pub const CHANGED_STATUS: StatusCode = StatusCode::RESET_CONTENT;

/// Build an HTTP client suitable for long polling: bounded connect time,
/// no timeout on the held-open read.
pub fn http_client(settings: &PollingSettings) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(settings.connect_timeout())
        .build()
        .map_err(|e| Error::http(format!("Failed to build HTTP client: {e}")))
}

/// Observable state of the notifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LongPollSession {
    pub enabled: bool,
    pub last_started_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PollOutcome {
    Changed,
    NoChange,
}

struct ActivePoll {
    token: CancellationToken,
    started_at: DateTime<Utc>,
    task: JoinHandle<()>,
}

/// Long-poll change notifier for one `/onchange` URL.
pub struct ChangePoller {
    client: reqwest::Client,
    url: Url,
    failure_delay: Duration,
    active: Mutex<Option<ActivePoll>>,
}

impl std::fmt::Debug for ChangePoller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangePoller")
            .field("url", &self.url.as_str())
            .field("failure_delay", &self.failure_delay)
            .field("session", &self.session())
            .finish()
    }
}

impl ChangePoller {
    pub fn new(client: reqwest::Client, url: Url, failure_delay: Duration) -> Self {
        Self {
            client,
            url,
            failure_delay,
            active: Mutex::new(None),
        }
    }

    /// Build a poller with a client configured from `settings`.
    pub fn from_settings(url: Url, settings: &PollingSettings) -> Result<Self> {
        Ok(Self::new(
            http_client(settings)?,
            url,
            settings.failure_delay(),
        ))
    }

    /// Start polling; `on_change` runs on the poller task for every change.
    ///
    /// No-op if already polling. Must be called from within a Tokio runtime.
    pub fn start<F>(&self, on_change: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        let mut active = self.lock();
        if active.as_ref().is_some_and(|poll| !poll.task.is_finished()) {
            debug!("Change polling already running, ignoring start()");
            return;
        }

        info!("Starting change polling at {}", self.url);
        let token = CancellationToken::new();
        let task = tokio::spawn(run_poll_loop(
            self.client.clone(),
            self.url.clone(),
            self.failure_delay,
            token.clone(),
            Arc::new(on_change),
        ));

        *active = Some(ActivePoll {
            token,
            started_at: Utc::now(),
            task,
        });
    }

    /// Stop polling. Safe in any state; a response arriving after this call
    /// is discarded and the callback is released.
    pub fn stop(&self) {
        if let Some(poll) = self.lock().take() {
            info!("Stopping change polling");
            poll.token.cancel();
        }
    }

    pub fn is_polling(&self) -> bool {
        self.lock()
            .as_ref()
            .is_some_and(|poll| !poll.task.is_finished())
    }

    pub fn session(&self) -> LongPollSession {
        match self.lock().as_ref() {
            Some(poll) => LongPollSession {
                enabled: true,
                last_started_at: Some(poll.started_at),
            },
            None => LongPollSession::default(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<ActivePoll>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for ChangePoller {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_poll_loop(
    client: reqwest::Client,
    url: Url,
    failure_delay: Duration,
    token: CancellationToken,
    on_change: Arc<dyn Fn() + Send + Sync>,
) {
    loop {
        let outcome = tokio::select! {
            _ = token.cancelled() => break,
            outcome = poll_once(&client, &url) => outcome,
        };

        match outcome {
            Ok(PollOutcome::Changed) => {
                if token.is_cancelled() {
                    break;
                }
                debug!("Development server reported a change");
                on_change();
            }
            Ok(PollOutcome::NoChange) => {
                trace!("Long poll returned without a change, polling again");
            }
            Err(e) => {
                warn!(
                    "Change polling failed: {}; retrying in {:?}",
                    e, failure_delay
                );
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(failure_delay) => {}
                }
            }
        }
    }

    debug!("Change polling task exiting");
}

async fn poll_once(client: &reqwest::Client, url: &Url) -> Result<PollOutcome> {
    let response = client
        .get(url.clone())
        .send()
        .await
        .map_err(|e| Error::http(format!("GET {url}: {e}")))?;

    let status = response.status();
    if status == CHANGED_STATUS {
        Ok(PollOutcome::Changed)
    } else if status.is_success() {
        Ok(PollOutcome::NoChange)
    } else {
        Err(Error::http(format!("GET {url} returned {status}")))
    }
}
