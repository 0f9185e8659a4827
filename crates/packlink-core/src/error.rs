//! Application error types with rich context

use std::time::Duration;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Application error types organized by layer/domain
#[derive(Debug, Error)]
pub enum Error {
    // ─────────────────────────────────────────────────────────────
    // Common/Infrastructure Errors
    // ─────────────────────────────────────────────────────────────
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    // ─────────────────────────────────────────────────────────────
    // Packager Protocol Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Packager protocol error: {message}")]
    Protocol { message: String },

    #[error("Method not found: {method}")]
    MethodNotFound { method: String },

    #[error("Handler for '{method}' failed: {message}")]
    HandlerFailure { method: String, message: String },

    #[error("Packager replied to '{method}' with an error: {message}")]
    Remote { method: String, message: String },

    #[error("Request '{method}' timed out after {timeout:?}")]
    Timeout { method: String, timeout: Duration },

    // ─────────────────────────────────────────────────────────────
    // Connection Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Not connected to the packager")]
    NotConnected,

    #[error("Connection to the packager was lost")]
    ConnectionLost,

    #[error("Connection to the packager was closed")]
    ConnectionClosed,

    #[error("Cannot reach the development server after {attempts} attempt(s): {message}")]
    TransportFailure { attempts: u32, message: String },

    #[error("HTTP error: {message}")]
    Http { message: String },

    // ─────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Configuration error: {message}")]
    Config { message: String },

    // ─────────────────────────────────────────────────────────────
    // Channel/Communication Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Channel closed unexpectedly")]
    ChannelClosed,
}

// ─────────────────────────────────────────────────────────────────
// Convenience Constructors
// ─────────────────────────────────────────────────────────────────

impl Error {
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub fn method_not_found(method: impl Into<String>) -> Self {
        Self::MethodNotFound {
            method: method.into(),
        }
    }

    pub fn handler_failure(method: impl Into<String>, message: impl Into<String>) -> Self {
        Self::HandlerFailure {
            method: method.into(),
            message: message.into(),
        }
    }

    pub fn remote(method: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Remote {
            method: method.into(),
            message: message.into(),
        }
    }

    pub fn timeout(method: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            method: method.into(),
            timeout,
        }
    }

    pub fn transport_failure(attempts: u32, message: impl Into<String>) -> Self {
        Self::TransportFailure {
            attempts,
            message: message.into(),
        }
    }

    pub fn http(message: impl Into<String>) -> Self {
        Self::Http {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Check if this is a recoverable error
    ///
    /// Recoverable errors are handled locally: the frame or request is
    /// dropped and the connection keeps running (or reconnects).
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::Protocol { .. }
                | Error::MethodNotFound { .. }
                | Error::HandlerFailure { .. }
                | Error::Remote { .. }
                | Error::Timeout { .. }
                | Error::NotConnected
                | Error::ConnectionLost
                | Error::Http { .. }
        )
    }
}

// ─────────────────────────────────────────────────────────────────
// Error Context Extensions
// ─────────────────────────────────────────────────────────────────

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context with a closure (lazy evaluation)
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T, E: Into<Error>> ResultExt<T> for std::result::Result<T, E> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| {
            let err = e.into();
            tracing::error!("{}: {:?}", context.into(), err);
            err
        })
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| {
            let err = e.into();
            tracing::error!("{}: {:?}", f(), err);
            err
        })
    }
}
