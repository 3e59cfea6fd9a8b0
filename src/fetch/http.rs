use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use tracing::debug;

use crate::error::{Error, Result};
use crate::types::CachingTokens;

use super::{RetrieveOutcome, RetrieveRequest, RetrievedFeed, Retriever};

const ACCEPT: &str =
    "application/rss+xml, application/atom+xml, application/feed+json, application/xml, text/xml, */*";

/// Conditional-GET HTTP retriever.
#[derive(Debug, Clone)]
pub struct HttpRetriever {
    client: Client,
    user_agent: String,
}

impl Default for HttpRetriever {
    fn default() -> Self {
        Self::new(
            Duration::from_secs(10),
            Duration::from_secs(30),
            format!("feedstash/{}", env!("CARGO_PKG_VERSION")),
        )
    }
}

impl HttpRetriever {
    pub fn new(connect_timeout: Duration, read_timeout: Duration, user_agent: String) -> Self {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(read_timeout)
            .redirect(reqwest::redirect::Policy::limited(10))
            .gzip(true)
            .build()
            .expect("Failed to create HTTP client");
        Self { client, user_agent }
    }

    pub fn with_user_agent(mut self, user_agent: String) -> Self {
        self.user_agent = user_agent;
        self
    }
}

#[async_trait]
impl Retriever for HttpRetriever {
    async fn retrieve(&self, request: RetrieveRequest<'_>) -> Result<RetrieveOutcome> {
        debug!(url = request.url, stale = request.stale, "retrieving feed");

        let mut builder = self
            .client
            .get(request.url)
            .header("User-Agent", &self.user_agent)
            .header("Accept", ACCEPT);
        if !request.stale {
            if let Some(etag) = &request.caching.etag {
                builder = builder.header("If-None-Match", etag);
            }
            if let Some(last_modified) = &request.caching.last_modified {
                builder = builder.header("If-Modified-Since", last_modified);
            }
        }

        let response = builder.send().await.map_err(|e| Error::Parse {
            url: request.url.to_string(),
            message: format!("request failed: {}", e),
            http_status: e.status().map(|s| s.as_u16()),
        })?;

        if response.status() == StatusCode::NOT_MODIFIED {
            debug!(url = request.url, "not modified");
            return Ok(RetrieveOutcome::NotModified);
        }
        if !response.status().is_success() {
            return Err(Error::Parse {
                url: request.url.to_string(),
                message: format!(
                    "HTTP {}: {}",
                    response.status().as_u16(),
                    response
                        .status()
                        .canonical_reason()
                        .unwrap_or("unknown error")
                ),
                http_status: Some(response.status().as_u16()),
            });
        }

        let headers = response.headers();
        let caching = CachingTokens {
            etag: headers
                .get("etag")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
            last_modified: headers
                .get("last-modified")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
        };
        let media_type = headers
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_string());

        let body = response.bytes().await.map_err(|e| Error::Parse {
            url: request.url.to_string(),
            message: format!("failed to read response body: {}", e),
            http_status: None,
        })?;
        debug!(url = request.url, bytes = body.len(), "retrieved feed");

        Ok(RetrieveOutcome::Retrieved(RetrievedFeed {
            body: body.to_vec(),
            media_type,
            caching,
        }))
    }
}
