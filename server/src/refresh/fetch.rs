//! HTTP download of the reference file.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use super::RefreshError;

/// A thin reqwest wrapper that fetches the raw reference payload.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    http: reqwest::Client,
}

impl HttpFetcher {
    /// Create a fetcher whose requests time out after `timeout`.
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("ouiwatch/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { http })
    }

    /// GET `url` and return the body bytes untouched.
    ///
    /// Any status outside 200-299 is an error, as is a transport failure
    /// while sending the request or reading the body.
    pub async fn fetch(&self, url: &str) -> Result<Vec<u8>, RefreshError> {
        let transport = |source: reqwest::Error| RefreshError::Transport {
            url: url.to_string(),
            source: Arc::new(source),
        };

        let resp = self.http.get(url).send().await.map_err(transport)?;

        let status = resp.status();
        if !status.is_success() {
            return Err(RefreshError::Status {
                url: url.to_string(),
                status,
            });
        }

        let body = resp.bytes().await.map_err(transport)?;
        debug!(url = %url, bytes = body.len(), "Downloaded reference file");
        Ok(body.to_vec())
    }
}
