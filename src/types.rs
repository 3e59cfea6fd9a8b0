use std::ops::Range;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ExceptionInfo;

/// A subscribed feed, identified by its URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feed {
    pub url: String,
    pub updated: Option<DateTime<Utc>>,
    pub title: Option<String>,
    pub link: Option<String>,
    pub author: Option<String>,
    pub subtitle: Option<String>,
    /// Source format tag reported by the parser ("atom", "rss20", ...).
    pub version: Option<String>,
    /// User-overridden display title.
    pub user_title: Option<String>,
    pub added: DateTime<Utc>,
    /// Timestamp of the last successful parse.
    pub last_updated: Option<DateTime<Utc>>,
    /// Timestamp of the last retrieval attempt, successful or not.
    pub last_retrieved: Option<DateTime<Utc>>,
    pub last_exception: Option<ExceptionInfo>,
    pub updates_enabled: bool,
    /// Earliest timestamp of the next update attempt.
    pub update_after: Option<DateTime<Utc>>,
    pub caching: CachingTokens,
    /// Forces the next update to bypass conditional retrieval.
    pub stale: bool,
}

impl Feed {
    /// The user title if set, the feed's own title otherwise.
    pub fn resolved_title(&self) -> Option<&str> {
        self.user_title.as_deref().or(self.title.as_deref())
    }

    pub fn is_broken(&self) -> bool {
        self.last_exception.is_some()
    }

    pub fn cursor(&self, sort: FeedSort) -> FeedCursor {
        let key_text = match sort {
            FeedSort::Title => self.title.as_deref().map(str::to_lowercase),
            FeedSort::UserTitle => self.resolved_title().map(str::to_lowercase),
            FeedSort::Added => None,
        };
        FeedCursor {
            sort,
            key_text,
            added: self.added,
            url: self.url.clone(),
        }
    }
}

/// Opaque HTTP caching token pair, round-tripped verbatim to the retriever.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachingTokens {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl CachingTokens {
    pub fn is_empty(&self) -> bool {
        self.etag.is_none() && self.last_modified.is_none()
    }
}

/// A content block of an entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Content {
    pub value: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_summary: bool,
}

/// An attached resource of an entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Enclosure {
    pub href: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub length: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddedBy {
    Feed,
    User,
}

impl AddedBy {
    pub fn as_str(self) -> &'static str {
        match self {
            AddedBy::Feed => "feed",
            AddedBy::User => "user",
        }
    }
}

/// A single item of a feed, identified by `(feed_url, id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    pub feed_url: String,
    pub id: String,
    pub updated: Option<DateTime<Utc>>,
    pub published: Option<DateTime<Utc>>,
    pub title: Option<String>,
    pub link: Option<String>,
    pub author: Option<String>,
    pub summary: Option<String>,
    pub content: Vec<Content>,
    pub enclosures: Vec<Enclosure>,
    pub read: bool,
    pub read_modified: Option<DateTime<Utc>>,
    /// Tristate user flag: flagged, explicitly unflagged, or never set.
    pub important: Option<bool>,
    pub important_modified: Option<DateTime<Utc>>,
    pub added: DateTime<Utc>,
    pub added_by: AddedBy,
    pub last_updated: DateTime<Utc>,
    /// Original feed URL for entries whose feed URL was changed.
    pub original_feed_url: Option<String>,
    pub first_updated: DateTime<Utc>,
    pub first_updated_epoch: i64,
    /// Position within the feed snapshot that produced this entry,
    /// counted from the end of the document.
    pub feed_order: i64,
    /// Derived sort key placing recently published/updated entries first.
    pub recent_sort: DateTime<Utc>,
}

impl Entry {
    pub fn has_enclosures(&self) -> bool {
        !self.enclosures.is_empty()
    }

    pub fn cursor(&self) -> EntryCursor {
        EntryCursor {
            recent_sort: self.recent_sort,
            feed_url: self.feed_url.clone(),
            last_updated: self.last_updated,
            first_updated_epoch: self.first_updated_epoch,
            feed_order: self.feed_order,
            id: self.id.clone(),
        }
    }
}

/// Feed-level data produced by a parser.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedData {
    pub updated: Option<DateTime<Utc>>,
    pub title: Option<String>,
    pub link: Option<String>,
    pub author: Option<String>,
    pub subtitle: Option<String>,
    pub version: Option<String>,
}

/// Entry-level data produced by a parser or passed to `add_entry`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryData {
    pub id: String,
    pub updated: Option<DateTime<Utc>>,
    pub published: Option<DateTime<Utc>>,
    pub title: Option<String>,
    pub link: Option<String>,
    pub author: Option<String>,
    pub summary: Option<String>,
    pub content: Vec<Content>,
    pub enclosures: Vec<Enclosure>,
}

/// Aggregate feed counts for a filter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedCounts {
    pub total: u64,
    pub broken: u64,
    pub updates_enabled: u64,
}

/// Aggregate entry counts for a filter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct EntryCounts {
    pub total: u64,
    pub read: u64,
    pub important: u64,
    pub has_enclosures: u64,
    /// Average entries per day over the last 30, 91 and 365 days.
    pub averages: [f64; 3],
}

/// Five-valued filter over a boolean-or-absent field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TristateFilter {
    #[default]
    Any,
    IsTrue,
    IsFalse,
    NotSet,
    NotFalse,
    NotTrue,
}

/// One literal of a tag existence clause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagCond {
    /// The named tag exists.
    Has(String),
    /// The named tag does not exist.
    NotHas(String),
    /// At least one tag exists.
    AnySet,
    /// No tag exists.
    NoneSet,
}

/// A DNF expression over tag existence: OR of AND-clauses.
///
/// An empty expression matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagFilter(pub Vec<Vec<TagCond>>);

impl TagFilter {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// A single-clause filter requiring every named tag to exist.
    pub fn all_of<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        TagFilter(vec![names
            .into_iter()
            .map(|n| TagCond::Has(n.into()))
            .collect()])
    }
}

#[derive(Debug, Clone, Default)]
pub struct FeedFilter {
    /// Exact feed URL.
    pub feed: Option<String>,
    pub tags: TagFilter,
    /// Last update failed (true) or succeeded (false).
    pub broken: Option<bool>,
    pub updates_enabled: Option<bool>,
    /// Never successfully updated.
    pub new: Option<bool>,
}

impl FeedFilter {
    pub fn for_feed(url: impl Into<String>) -> Self {
        FeedFilter {
            feed: Some(url.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct EntryFilter {
    /// Exact feed URL.
    pub feed: Option<String>,
    /// Exact `(feed_url, entry_id)`.
    pub entry: Option<(String, String)>,
    pub read: Option<bool>,
    pub important: TristateFilter,
    pub has_enclosures: Option<bool>,
    /// Inserted by the owning feed's most recent update.
    pub new: Option<bool>,
    /// Tags on the entry itself.
    pub tags: TagFilter,
    /// Tags on the owning feed.
    pub feed_tags: TagFilter,
}

impl EntryFilter {
    pub fn for_feed(url: impl Into<String>) -> Self {
        EntryFilter {
            feed: Some(url.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FeedSort {
    /// Case-insensitive title, feeds without a title last.
    #[default]
    Title,
    /// User title if set, title otherwise.
    UserTitle,
    /// Most recently added first.
    Added,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EntrySort {
    /// Most recent first with a stable tie-break; paginated.
    #[default]
    Recent,
    /// A fresh sample per query; not paginated.
    Random,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SearchSort {
    #[default]
    Relevance,
    Recent,
}

/// Restart cursor for feed pagination, derived from the last returned feed.
#[derive(Debug, Clone)]
pub struct FeedCursor {
    pub(crate) sort: FeedSort,
    pub(crate) key_text: Option<String>,
    pub(crate) added: DateTime<Utc>,
    pub(crate) url: String,
}

/// Restart cursor for entry pagination, derived from the last returned entry.
#[derive(Debug, Clone)]
pub struct EntryCursor {
    pub(crate) recent_sort: DateTime<Utc>,
    pub(crate) feed_url: String,
    pub(crate) last_updated: DateTime<Utc>,
    pub(crate) first_updated_epoch: i64,
    pub(crate) feed_order: i64,
    pub(crate) id: String,
}

/// The resource a tag is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceId<'a> {
    Global,
    Feed(&'a str),
    Entry(&'a str, &'a str),
}

impl<'a> ResourceId<'a> {
    /// Scope columns as stored, with `""` for absent components.
    pub(crate) fn scope(&self) -> (&'a str, &'a str) {
        match *self {
            ResourceId::Global => ("", ""),
            ResourceId::Feed(feed) => (feed, ""),
            ResourceId::Entry(feed, entry) => (feed, entry),
        }
    }
}

impl std::fmt::Display for ResourceId<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceId::Global => write!(f, "()"),
            ResourceId::Feed(feed) => write!(f, "({})", feed),
            ResourceId::Entry(feed, entry) => write!(f, "({}, {})", feed, entry),
        }
    }
}

/// A string with byte ranges of search-match highlights.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HighlightedString {
    pub value: String,
    pub highlights: Vec<Range<usize>>,
}

impl HighlightedString {
    /// Build from marker-delimited text, dropping the markers.
    pub(crate) fn from_marked(marked: &str, start: char, end: char) -> Self {
        let mut value = String::with_capacity(marked.len());
        let mut highlights = Vec::new();
        let mut open: Option<usize> = None;
        for c in marked.chars() {
            if c == start {
                open = Some(value.len());
            } else if c == end {
                if let Some(begin) = open.take() {
                    if begin < value.len() {
                        highlights.push(begin..value.len());
                    }
                }
            } else {
                value.push(c);
            }
        }
        Self { value, highlights }
    }

    pub fn highlighted(&self) -> impl Iterator<Item = &str> {
        self.highlights.iter().map(|r| &self.value[r.clone()])
    }
}

/// One hit of `search_entries`.
#[derive(Debug, Clone)]
pub struct EntrySearchResult {
    pub feed_url: String,
    pub id: String,
    /// Relevance score; higher is better.
    pub score: f64,
    pub title: Option<HighlightedString>,
    pub feed_title: Option<HighlightedString>,
    pub author: Option<HighlightedString>,
    pub content: Option<HighlightedString>,
}

/// Counters for one committed feed update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdatedFeed {
    pub new: usize,
    pub modified: usize,
    pub unmodified: usize,
}

/// Per-feed outcome of an update cycle.
///
/// `Ok(None)` means the retriever reported the feed unchanged.
#[derive(Debug)]
pub struct FeedUpdateResult {
    pub url: String,
    pub result: crate::error::Result<Option<UpdatedFeed>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolved_title_prefers_user_title() {
        let mut feed = Feed {
            url: "https://example.com/feed.xml".to_string(),
            updated: None,
            title: Some("Original".to_string()),
            link: None,
            author: None,
            subtitle: None,
            version: None,
            user_title: None,
            added: Utc::now(),
            last_updated: None,
            last_retrieved: None,
            last_exception: None,
            updates_enabled: true,
            update_after: None,
            caching: CachingTokens::default(),
            stale: false,
        };
        assert_eq!(feed.resolved_title(), Some("Original"));
        feed.user_title = Some("Mine".to_string());
        assert_eq!(feed.resolved_title(), Some("Mine"));
    }

    #[test]
    fn test_highlighted_string_from_marked() {
        let h = HighlightedString::from_marked("a \u{1}match\u{2} here", '\u{1}', '\u{2}');
        assert_eq!(h.value, "a match here");
        assert_eq!(h.highlights, vec![2..7]);
        assert_eq!(h.highlighted().collect::<Vec<_>>(), vec!["match"]);
    }

    #[test]
    fn test_highlighted_string_unbalanced_markers() {
        let h = HighlightedString::from_marked("\u{2}no \u{1}open", '\u{1}', '\u{2}');
        assert_eq!(h.value, "no open");
        assert!(h.highlights.is_empty());
    }

    #[test]
    fn test_content_serde_shape() {
        let content = Content {
            value: "<p>hello</p>".to_string(),
            media_type: Some("text/html".to_string()),
            language: None,
            is_summary: false,
        };
        let json = serde_json::to_value(&content).unwrap();
        assert_eq!(json["type"], "text/html");
        assert!(json.get("language").is_none());
        assert!(json.get("is_summary").is_none());
    }

    #[test]
    fn test_resource_id_scope() {
        assert_eq!(ResourceId::Global.scope(), ("", ""));
        assert_eq!(ResourceId::Feed("f").scope(), ("f", ""));
        assert_eq!(ResourceId::Entry("f", "e").scope(), ("f", "e"));
    }
}
