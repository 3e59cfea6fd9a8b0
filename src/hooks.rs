//! Extension points invoked by the update pipeline.
//!
//! Hooks run synchronously with the pipeline, in registration order.
//! Plugins are callables applied at reader construction that register into
//! these lists.

use async_trait::async_trait;

use crate::error::Result;
use crate::reader::Reader;
use crate::types::{Entry, EntryData};

/// How a committed entry changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryUpdateStatus {
    New,
    Modified,
}

/// Verdict of an entry-processing hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryAction {
    Keep,
    /// Drop the entry from this update without storing it.
    Skip,
}

/// Runs once per update cycle, before any feed is dispatched.
#[async_trait]
pub trait BeforeFeedsUpdateHook: Send + Sync {
    async fn before_feeds_update(&self, reader: &Reader) -> Result<()>;
}

/// Runs per feed, before retrieval. An error cancels that feed's update.
#[async_trait]
pub trait BeforeFeedUpdateHook: Send + Sync {
    async fn before_feed_update(&self, reader: &Reader, feed_url: &str) -> Result<()>;
}

/// Runs per new/modified entry, before it is stored. May mutate the entry
/// or skip it.
pub trait BeforeEntryUpdateHook: Send + Sync {
    fn before_entry_update(&self, feed_url: &str, entry: &mut EntryData) -> Result<EntryAction>;
}

/// Runs per entry after its commit. Failures are aggregated and reported
/// through the feed's result; the commit stands.
#[async_trait]
pub trait AfterEntryUpdateHook: Send + Sync {
    async fn after_entry_update(
        &self,
        reader: &Reader,
        entry: &Entry,
        status: EntryUpdateStatus,
    ) -> Result<()>;
}

/// Runs once per update cycle, after all feeds finished.
#[async_trait]
pub trait AfterFeedsUpdateHook: Send + Sync {
    async fn after_feeds_update(&self, reader: &Reader) -> Result<()>;
}

/// A plugin mutates the reader at construction time, typically to register
/// hooks.
pub type Plugin = Box<dyn FnOnce(&mut Reader) -> Result<()> + Send>;
