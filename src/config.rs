use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Configuration for opening a [`Reader`](crate::Reader).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaderConfig {
    /// Path of the SQLite database. `:memory:` opens a transient store.
    pub db_path: PathBuf,

    /// Root directory for local-file feeds. With no root, `file:` feeds
    /// and bare paths are rejected.
    #[serde(default)]
    pub feed_root: Option<PathBuf>,

    #[serde(default)]
    pub search: SearchMode,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,

    #[serde(default = "default_read_timeout")]
    pub read_timeout: u64,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Default worker count for update cycles.
    #[serde(default = "default_workers")]
    pub workers: usize,

    #[serde(default)]
    pub reserved_names: ReservedNameScheme,
}

/// What to do about the search index when the reader opens.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    /// Leave the database as it is.
    #[default]
    Auto,
    Enabled,
    Disabled,
}

/// Tag name prefixes claimed by the reader core and by plugins.
///
/// The scheme is fixed for the lifetime of a reader; changing it for an
/// existing database orphans previously reserved tags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservedNameScheme {
    #[serde(default = "default_reader_prefix")]
    pub reader_prefix: String,
    #[serde(default = "default_plugin_prefix")]
    pub plugin_prefix: String,
}

impl Default for ReservedNameScheme {
    fn default() -> Self {
        Self {
            reader_prefix: default_reader_prefix(),
            plugin_prefix: default_plugin_prefix(),
        }
    }
}

impl ReservedNameScheme {
    pub fn make_reader_reserved_name(&self, key: &str) -> String {
        format!("{}{}", self.reader_prefix, key)
    }

    pub fn make_plugin_reserved_name(&self, plugin: &str, key: &str) -> String {
        format!("{}{}.{}", self.plugin_prefix, plugin, key)
    }

    pub fn is_reserved(&self, name: &str) -> bool {
        name.starts_with(&self.reader_prefix) || name.starts_with(&self.plugin_prefix)
    }
}

impl ReaderConfig {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            feed_root: None,
            search: SearchMode::default(),
            connect_timeout: default_connect_timeout(),
            read_timeout: default_read_timeout(),
            user_agent: default_user_agent(),
            workers: default_workers(),
            reserved_names: ReservedNameScheme::default(),
        }
    }

    pub fn with_feed_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.feed_root = Some(root.into());
        self
    }

    pub fn with_search(mut self, mode: SearchMode) -> Self {
        self.search = mode;
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout)
    }

    pub fn validate(&self) -> Result<()> {
        if self.db_path.as_os_str().is_empty() {
            return Err(Error::storage("database path cannot be empty"));
        }
        if self.workers == 0 {
            return Err(Error::storage("worker count must be greater than 0"));
        }
        if self.reserved_names.reader_prefix.is_empty()
            || self.reserved_names.plugin_prefix.is_empty()
        {
            return Err(Error::storage("reserved name prefixes cannot be empty"));
        }
        Ok(())
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(ua) = std::env::var("FEEDSTASH_USER_AGENT") {
            self.user_agent = ua;
        }
        if let Ok(workers) = std::env::var("FEEDSTASH_WORKERS") {
            if let Ok(val) = workers.parse() {
                self.workers = val;
            }
        }
        if let Ok(timeout) = std::env::var("FEEDSTASH_READ_TIMEOUT") {
            if let Ok(val) = timeout.parse() {
                self.read_timeout = val;
            }
        }
    }
}

fn default_connect_timeout() -> u64 {
    10
}
fn default_read_timeout() -> u64 {
    30
}
fn default_workers() -> usize {
    1
}
fn default_user_agent() -> String {
    format!("feedstash/{}", env!("CARGO_PKG_VERSION"))
}
fn default_reader_prefix() -> String {
    ".reader.".to_string()
}
fn default_plugin_prefix() -> String {
    ".plugin.".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ReaderConfig::new(":memory:");
        assert_eq!(config.workers, 1);
        assert_eq!(config.search, SearchMode::Auto);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let mut config = ReaderConfig::new(":memory:");
        config.workers = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_reserved_name_scheme() {
        let scheme = ReservedNameScheme::default();
        assert_eq!(scheme.make_reader_reserved_name("ids"), ".reader.ids");
        assert_eq!(
            scheme.make_plugin_reserved_name("dedupe", "state"),
            ".plugin.dedupe.state"
        );
        assert!(scheme.is_reserved(".reader.ids"));
        assert!(scheme.is_reserved(".plugin.dedupe.state"));
        assert!(!scheme.is_reserved("mine"));
    }
}
