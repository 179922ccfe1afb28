//! Read-only data source over HTTP(S).

use std::io::{Cursor, Read};
use std::time::Duration;

use reqwest::Client;
use tokio::runtime::Handle;
use tracing::{debug, warn};
use url::Url;

use super::path::{unescape_segment, VirtualPath};
use crate::config::FetchConfig;
use crate::{HostError, Result};

/// Shared HTTP plumbing for remote sources.
///
/// Requests run on the host's tokio runtime; callers block on the result, so
/// reads must happen on a blocking worker or the foreground thread, never
/// inside an async task.
#[derive(Debug, Clone)]
pub struct HttpAccess {
    client: Client,
    runtime: Handle,
}

impl HttpAccess {
    /// Build an HTTP client from the fetch configuration.
    pub fn new(config: &FetchConfig, runtime: Handle) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.total_timeout_secs))
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| HostError::Fetch(format!("failed to create HTTP client: {e}")))?;

        Ok(Self { client, runtime })
    }

    /// GET `url` and return the body.
    pub fn get_bytes(&self, url: &Url) -> Result<Vec<u8>> {
        let client = self.client.clone();
        let url = url.clone();

        self.runtime.block_on(async move {
            let response = client
                .get(url.clone())
                .send()
                .await
                .map_err(|e| HostError::Fetch(format!("failed to fetch {url}: {e}")))?;

            if !response.status().is_success() {
                return Err(HostError::Fetch(format!(
                    "HTTP error {} for {url}",
                    response.status()
                )));
            }

            let bytes = response
                .bytes()
                .await
                .map_err(|e| HostError::Fetch(format!("failed to read {url}: {e}")))?;

            Ok(bytes.to_vec())
        })
    }
}

/// A source whose paths are appended to a base URL.
#[derive(Debug, Clone)]
pub struct RemoteSource {
    base: Url,
    http: HttpAccess,
}

impl RemoteSource {
    /// Create a source for `base_url`. Trailing slashes are ignored.
    pub fn new(base_url: &str, http: HttpAccess) -> Result<Self> {
        let trimmed = base_url.trim_end_matches('/');
        let base = Url::parse(trimmed)
            .map_err(|e| HostError::Validation(format!("invalid URL `{base_url}`: {e}")))?;

        if base.cannot_be_a_base() {
            return Err(HostError::Validation(format!(
                "URL `{base_url}` cannot have child paths"
            )));
        }

        Ok(Self { base, http })
    }

    /// The base resource of this source.
    pub fn base_url(&self) -> &Url {
        &self.base
    }

    /// URL of `path` below the base; the root maps to the base itself.
    pub(crate) fn url_of(&self, path: &VirtualPath) -> Option<Url> {
        if path.is_root() {
            return Some(self.base.clone());
        }

        let mut url = self.base.clone();
        match url.path_segments_mut() {
            Ok(mut segments) => {
                segments.pop_if_empty();
                for segment in path.segments() {
                    segments.push(&unescape_segment(segment));
                }
            }
            Err(()) => {
                warn!(base = %self.base, path = %path, "remote source built a malformed URL");
                return None;
            }
        }
        Some(url)
    }

    pub(crate) fn read(&self, path: &VirtualPath) -> Option<Box<dyn Read + Send>> {
        let url = self.url_of(path)?;

        match self.http.get_bytes(&url) {
            Ok(bytes) => Some(Box::new(Cursor::new(bytes))),
            Err(e) => {
                debug!(url = %url, error = %e, "remote read failed");
                None
            }
        }
    }

    pub(crate) fn subsource(&self, path: &VirtualPath) -> Option<RemoteSource> {
        let url = self.url_of(path)?;
        Some(RemoteSource {
            base: url,
            http: self.http.clone(),
        })
    }
}
