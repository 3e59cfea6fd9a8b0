use std::path::PathBuf;

use async_trait::async_trait;
use tracing::debug;
use url::Url;

use crate::error::{Error, Result};
use crate::types::CachingTokens;

use super::{resolve_within_root, RetrieveOutcome, RetrieveRequest, RetrievedFeed, Retriever};

/// Local-file retriever, confined to a configured root directory.
#[derive(Debug, Clone)]
pub struct FileRetriever {
    root: PathBuf,
}

impl FileRetriever {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, url: &str) -> Result<PathBuf> {
        let candidate = match Url::parse(url) {
            Ok(parsed) if parsed.scheme() == "file" => parsed.path().to_string(),
            Ok(parsed) => {
                return Err(Error::InvalidFeedUrl {
                    url: url.to_string(),
                    reason: format!("unsupported scheme for file retrieval: {}", parsed.scheme()),
                })
            }
            Err(_) => url.to_string(),
        };
        resolve_within_root(&self.root, &candidate)
    }
}

#[async_trait]
impl Retriever for FileRetriever {
    async fn retrieve(&self, request: RetrieveRequest<'_>) -> Result<RetrieveOutcome> {
        let path = self.resolve(request.url)?;
        debug!(url = request.url, path = %path.display(), "reading local feed");
        let body = tokio::fs::read(&path).await.map_err(|e| Error::Parse {
            url: request.url.to_string(),
            message: format!("failed to read {}: {}", path.display(), e),
            http_status: None,
        })?;
        Ok(RetrieveOutcome::Retrieved(RetrievedFeed {
            body,
            media_type: None,
            caching: CachingTokens::default(),
        }))
    }
}
