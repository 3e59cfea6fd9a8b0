pub mod config;
pub mod error;
pub mod fetch;
pub mod hooks;
pub mod parse;
pub mod reader;
pub mod types;
pub mod update;

mod search;
mod storage;

pub use config::{ReaderConfig, ReservedNameScheme, SearchMode};
pub use error::{Error, ExceptionInfo, Result};
pub use reader::Reader;
pub use types::{
    AddedBy, CachingTokens, Content, Enclosure, Entry, EntryCounts, EntryCursor, EntryData,
    EntryFilter, EntrySearchResult, EntrySort, Feed, FeedCounts, FeedCursor, FeedData, FeedFilter,
    FeedSort, FeedUpdateResult, HighlightedString, ResourceId, SearchSort, TagCond, TagFilter,
    TristateFilter, UpdatedFeed,
};
pub use update::{CancelToken, UpdateOptions};
