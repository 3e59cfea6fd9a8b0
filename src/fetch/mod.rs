//! Abstract feed retrieval and the default implementations behind it.
//!
//! The pipeline only sees the [`Retriever`] trait: given a URL, the stored
//! caching tokens and the stale flag, it gets back either the resource
//! bytes plus fresh tokens, or a not-modified signal.

pub(crate) mod file;
pub(crate) mod http;

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use url::Url;

use crate::error::{Error, Result};
use crate::types::CachingTokens;

pub use file::FileRetriever;
pub use http::HttpRetriever;

#[derive(Debug, Clone)]
pub struct RetrieveRequest<'a> {
    pub url: &'a str,
    pub caching: &'a CachingTokens,
    /// Bypass conditional retrieval and fetch the full document.
    pub stale: bool,
}

/// An opaque retrieved resource plus its caching metadata.
#[derive(Debug, Clone)]
pub struct RetrievedFeed {
    pub body: Vec<u8>,
    pub media_type: Option<String>,
    pub caching: CachingTokens,
}

#[derive(Debug, Clone)]
pub enum RetrieveOutcome {
    /// The origin reported the resource unchanged.
    NotModified,
    Retrieved(RetrievedFeed),
}

#[async_trait]
pub trait Retriever: Send + Sync {
    async fn retrieve(&self, request: RetrieveRequest<'_>) -> Result<RetrieveOutcome>;
}

/// HTTP(S) URLs go to the HTTP retriever; everything else is a local file,
/// available only when a feed root is configured.
pub struct DefaultRetriever {
    http: HttpRetriever,
    file: Option<FileRetriever>,
}

impl DefaultRetriever {
    pub fn new(http: HttpRetriever, file: Option<FileRetriever>) -> Self {
        Self { http, file }
    }
}

#[async_trait]
impl Retriever for DefaultRetriever {
    async fn retrieve(&self, request: RetrieveRequest<'_>) -> Result<RetrieveOutcome> {
        if is_http_url(request.url) {
            return self.http.retrieve(request).await;
        }
        match &self.file {
            Some(file) => file.retrieve(request).await,
            None => Err(Error::InvalidFeedUrl {
                url: request.url.to_string(),
                reason: "local-file feeds require a configured feed root".to_string(),
            }),
        }
    }
}

pub(crate) fn is_http_url(url: &str) -> bool {
    matches!(
        Url::parse(url).map(|u| u.scheme().to_string()).as_deref(),
        Ok("http") | Ok("https")
    )
}

/// Validate a feed URL at `add_feed` time.
pub(crate) fn validate_feed_url(url: &str, feed_root: Option<&Path>) -> Result<()> {
    if url.is_empty() {
        return Err(Error::InvalidFeedUrl {
            url: url.to_string(),
            reason: "URL cannot be empty".to_string(),
        });
    }
    match Url::parse(url) {
        Ok(parsed) => match parsed.scheme() {
            "http" | "https" => Ok(()),
            "file" => match feed_root {
                Some(root) => resolve_within_root(root, parsed.path()).map(|_| ()),
                None => Err(Error::InvalidFeedUrl {
                    url: url.to_string(),
                    reason: "local-file feeds require a configured feed root".to_string(),
                }),
            },
            scheme => Err(Error::InvalidFeedUrl {
                url: url.to_string(),
                reason: format!("unsupported scheme: {}", scheme),
            }),
        },
        // Not an absolute URL: a bare path, allowed only inside feed_root.
        Err(_) => match feed_root {
            Some(root) => resolve_within_root(root, url).map(|_| ()),
            None => Err(Error::InvalidFeedUrl {
                url: url.to_string(),
                reason: "local-file feeds require a configured feed root".to_string(),
            }),
        },
    }
}

/// Resolve a candidate path relative to `root`, refusing escapes.
pub(crate) fn resolve_within_root(root: &Path, candidate: &str) -> Result<PathBuf> {
    let mut resolved = root.to_path_buf();
    let mut depth: usize = 0;
    for component in Path::new(candidate).components() {
        match component {
            Component::Normal(part) => {
                resolved.push(part);
                depth += 1;
            }
            // A leading slash (file:///feed.xml) is taken as root-relative.
            Component::RootDir | Component::CurDir => {}
            Component::ParentDir => {
                if depth == 0 {
                    return Err(Error::InvalidFeedUrl {
                        url: candidate.to_string(),
                        reason: "path escapes the feed root".to_string(),
                    });
                }
                resolved.pop();
                depth -= 1;
            }
            Component::Prefix(_) => {
                return Err(Error::InvalidFeedUrl {
                    url: candidate.to_string(),
                    reason: "absolute paths are not allowed".to_string(),
                })
            }
        }
    }
    Ok(resolved)
}
