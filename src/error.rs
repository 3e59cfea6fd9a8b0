use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Feed already exists: {url}")]
    FeedExists { url: String },

    #[error("Feed not found: {url}")]
    FeedNotFound { url: String },

    #[error("Invalid feed URL {url}: {reason}")]
    InvalidFeedUrl { url: String, reason: String },

    #[error("Parse error for {url}: {message}")]
    Parse {
        url: String,
        message: String,
        /// HTTP status hint when the failure came out of retrieval.
        http_status: Option<u16>,
    },

    #[error("Entry already exists: ({feed_url}, {entry_id})")]
    EntryExists { feed_url: String, entry_id: String },

    #[error("Entry not found: ({feed_url}, {entry_id})")]
    EntryNotFound { feed_url: String, entry_id: String },

    #[error("Update hook {hook} failed for {resource}: {message}")]
    UpdateHook {
        hook: &'static str,
        resource: String,
        message: String,
    },

    #[error("{} update hook(s) failed", .0.len())]
    UpdateHookGroup(Vec<Error>),

    #[error("Storage error: {message}")]
    Storage {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Search is not enabled")]
    SearchNotEnabled,

    #[error("Invalid search query: {message}")]
    InvalidSearchQuery { message: String },

    #[error("Tag not found: {name}")]
    TagNotFound { name: String },

    #[error("Tag name is reserved: {name}")]
    ReservedTagName { name: String },

    #[error("Invalid plugin: {message}")]
    InvalidPlugin { message: String },

    #[error("Plugin failed to initialize: {message}")]
    PluginInit { message: String },

    #[error("Operation on a closed reader")]
    Closed,

    #[error("{message}")]
    Usage { message: String },
}

impl Error {
    pub(crate) fn storage(message: impl Into<String>) -> Self {
        Error::Storage {
            message: message.into(),
            source: None,
        }
    }

    pub fn is_feed_error(&self) -> bool {
        matches!(
            self,
            Error::FeedExists { .. }
                | Error::FeedNotFound { .. }
                | Error::InvalidFeedUrl { .. }
                | Error::Parse { .. }
        )
    }

    pub fn is_entry_error(&self) -> bool {
        matches!(
            self,
            Error::EntryExists { .. } | Error::EntryNotFound { .. }
        )
    }

    pub fn is_hook_error(&self) -> bool {
        matches!(self, Error::UpdateHook { .. } | Error::UpdateHookGroup(_))
    }

    pub fn is_search_error(&self) -> bool {
        matches!(
            self,
            Error::SearchNotEnabled | Error::InvalidSearchQuery { .. }
        )
    }

    pub fn is_tag_error(&self) -> bool {
        matches!(
            self,
            Error::TagNotFound { .. } | Error::ReservedTagName { .. }
        )
    }

    pub(crate) fn usage(message: impl Into<String>) -> Self {
        Error::Usage {
            message: message.into(),
        }
    }

    pub fn is_plugin_error(&self) -> bool {
        matches!(
            self,
            Error::InvalidPlugin { .. } | Error::PluginInit { .. }
        )
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Error::FeedExists { .. } => "FEED_EXISTS",
            Error::FeedNotFound { .. } => "FEED_NOT_FOUND",
            Error::InvalidFeedUrl { .. } => "INVALID_FEED_URL",
            Error::Parse { .. } => "PARSE",
            Error::EntryExists { .. } => "ENTRY_EXISTS",
            Error::EntryNotFound { .. } => "ENTRY_NOT_FOUND",
            Error::UpdateHook { .. } => "UPDATE_HOOK",
            Error::UpdateHookGroup(_) => "UPDATE_HOOK_GROUP",
            Error::Storage { .. } => "STORAGE",
            Error::SearchNotEnabled => "SEARCH_NOT_ENABLED",
            Error::InvalidSearchQuery { .. } => "INVALID_SEARCH_QUERY",
            Error::TagNotFound { .. } => "TAG_NOT_FOUND",
            Error::ReservedTagName { .. } => "RESERVED_TAG_NAME",
            Error::InvalidPlugin { .. } => "INVALID_PLUGIN",
            Error::PluginInit { .. } => "PLUGIN_INIT",
            Error::Closed => "CLOSED",
            Error::Usage { .. } => "USAGE",
        }
    }
}

/// Structured failure info persisted on a feed as `last_exception`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionInfo {
    pub kind: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
}

impl ExceptionInfo {
    pub fn from_error(err: &Error) -> Self {
        let http_status = match err {
            Error::Parse { http_status, .. } => *http_status,
            _ => None,
        };
        Self {
            kind: err.error_code().to_string(),
            message: err.to_string(),
            http_status,
        }
    }
}
