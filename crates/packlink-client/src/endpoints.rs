//! URLs of the development server endpoints.

use url::Url;

use packlink_core::prelude::*;
use packlink_core::ServerSettings;

/// Builds the endpoint URLs of one development server from its `host:port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevServerEndpoints {
    host: String,
    device: Option<String>,
    app: Option<String>,
}

impl DevServerEndpoints {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            device: None,
            app: None,
        }
    }

    pub fn from_settings(settings: &ServerSettings) -> Self {
        Self {
            host: settings.host.clone(),
            device: settings.device.clone(),
            app: settings.app.clone(),
        }
    }

    /// Device name reported in the packager connection URL.
    pub fn with_device(mut self, device: impl Into<String>) -> Self {
        self.device = Some(device.into());
        self
    }

    /// App identifier reported in the packager connection URL.
    pub fn with_app(mut self, app: impl Into<String>) -> Self {
        self.app = Some(app.into());
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// `ws://<host>/message?device=..&app=..`
    ///
    /// The `clientid` parameter is added by
    /// [`PackagerConnection::open`](crate::PackagerConnection::open).
    pub fn packager_connection_url(&self) -> Result<Url> {
        let mut url = self.url("ws", "message")?;
        if self.device.is_some() || self.app.is_some() {
            let mut query = url.query_pairs_mut();
            if let Some(device) = &self.device {
                query.append_pair("device", device);
            }
            if let Some(app) = &self.app {
                query.append_pair("app", app);
            }
        }
        Ok(url)
    }

    /// `http://<host>/onchange`, the long-poll change endpoint.
    pub fn on_change_url(&self) -> Result<Url> {
        self.url("http", "onchange")
    }

    /// `http://<host>/status`, the health check endpoint.
    pub fn status_url(&self) -> Result<Url> {
        self.url("http", "status")
    }

    fn url(&self, scheme: &str, path: &str) -> Result<Url> {
        let host = self.host.trim().trim_end_matches('/');
        if host.is_empty() {
            return Err(Error::config("development server host is empty"));
        }
        if host.contains("://") {
            return Err(Error::config(format!(
                "development server host '{host}' must be host:port without a scheme"
            )));
        }
        Ok(Url::parse(&format!("{scheme}://{host}/{path}"))?)
    }
}
