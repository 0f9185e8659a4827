//! Development server status check.

use url::Url;

use packlink_core::prelude::*;

/// Body returned by `/status` when the packager is up.
pub const PACKAGER_RUNNING_BODY: &str = "packager-status:running";

/// Result of [`check_packager_status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackagerStatus {
    Running,
    NotRunning,
}

impl PackagerStatus {
    pub fn is_running(self) -> bool {
        self == PackagerStatus::Running
    }
}

/// Ask the development server whether the packager is running.
///
/// Anything other than a successful response with exactly
/// [`PACKAGER_RUNNING_BODY`] counts as not running; the reason is logged.
pub async fn check_packager_status(client: &reqwest::Client, url: &Url) -> PackagerStatus {
    match fetch_status_body(client, url).await {
        Ok(body) if body == PACKAGER_RUNNING_BODY => {
            debug!("Packager is running at {}", url);
            PackagerStatus::Running
        }
        Ok(body) => {
            info!(
                "Unexpected status body from {}: {:?}",
                url,
                body.chars().take(80).collect::<String>()
            );
            PackagerStatus::NotRunning
        }
        Err(e) => {
            info!("Packager status check failed: {}", e);
            PackagerStatus::NotRunning
        }
    }
}

async fn fetch_status_body(client: &reqwest::Client, url: &Url) -> Result<String> {
    let response = client
        .get(url.clone())
        .send()
        .await
        .map_err(|e| Error::http(format!("GET {url}: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        return Err(Error::http(format!("GET {url} returned {status}")));
    }

    response
        .text()
        .await
        .map_err(|e| Error::http(format!("reading body of {url}: {e}")))
}
