//! # packlink-client - Dev Packager Connection
//!
//! Persistent, reconnecting control channel between a running app and the
//! development packager, plus the HTTP change notifier and status check.
//!
//! Depends on [`packlink_core`] for error handling, logging and settings.
//!
//! ## Public API
//!
//! ### Connection
//! - [`PackagerConnection`] - `open` / `close` / `send_notification` / `send_request`
//! - [`ConnectionState`], [`ConnectionEvent`] - Lifecycle observation
//! - [`ReconnectPolicy`] - Capped-exponential reconnection backoff
//!
//! ### Wire Protocol
//! - [`Message`] - Request / Response / Notification frames
//! - [`encode()`], [`decode()`] - JSON text codec
//! - [`PackagerMethod`] - Well-known and custom method names
//!
//! ### Command Dispatch
//! - [`HandlerRegistry`] - Method → handler table
//! - [`NotificationHandler`], [`RequestHandler`] - Handler shapes
//! - [`Responder`] - Single-use reply capability for requests
//! - [`handlers::FileIoHandler`] - Built-in `fopen`/`fread`/`fwrite`/`fclose`
//!
//! ### HTTP
//! - [`ChangePoller`] - `/onchange` long-poll notifier
//! - [`check_packager_status()`] - `/status` health check
//! - [`DevServerEndpoints`] - Endpoint URLs for a `host:port`

pub mod connection;
pub mod dispatch;
pub mod endpoints;
pub mod handlers;
pub mod on_change;
pub mod protocol;
pub mod status;
pub mod tracker;
pub mod transport;

pub use connection::{
    ConnectionEvent, ConnectionState, PackagerConnection, PackagerConnectionBuilder,
};
pub use dispatch::{HandlerRegistry, NotificationHandler, RequestHandler, Responder};
pub use endpoints::DevServerEndpoints;
pub use on_change::{http_client, ChangePoller, LongPollSession};
pub use protocol::{decode, encode, Message, PackagerMethod, ResponsePayload, PROTOCOL_VERSION};
pub use status::{check_packager_status, PackagerStatus};
pub use tracker::RequestTracker;
pub use transport::{OutboundFrame, ReconnectPolicy};
