//! The `Reader` facade: the crate's entire public operation surface.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use crate::config::{ReaderConfig, SearchMode};
use crate::error::{Error, Result};
use crate::fetch::{DefaultRetriever, FileRetriever, HttpRetriever, Retriever};
use crate::hooks::{
    AfterEntryUpdateHook, AfterFeedsUpdateHook, BeforeEntryUpdateHook, BeforeFeedUpdateHook,
    BeforeFeedsUpdateHook, Plugin,
};
use crate::parse::{FeedParser, Parser};
use crate::search;
use crate::storage::{entries, feeds, tags, Storage, DEFAULT_CHUNK_SIZE};
use crate::types::{
    Entry, EntryCounts, EntryCursor, EntryData, EntryFilter, EntrySearchResult, EntrySort, Feed,
    FeedCounts, FeedCursor, FeedFilter, FeedSort, ResourceId, SearchSort,
};
use crate::update::hash::entry_data_hash;

/// A personal feed-reader engine over one SQLite database.
///
/// Cheap to share behind a reference; all methods take `&self` except hook
/// registration.
pub struct Reader {
    pub(crate) config: ReaderConfig,
    pub(crate) storage: Storage,
    pub(crate) retriever: Arc<dyn Retriever>,
    pub(crate) parser: Arc<dyn Parser>,
    closed: AtomicBool,
    pub(crate) feed_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    claimed_names: Mutex<HashSet<String>>,
    pub(crate) before_feeds_update_hooks: Vec<Arc<dyn BeforeFeedsUpdateHook>>,
    pub(crate) before_feed_update_hooks: Vec<Arc<dyn BeforeFeedUpdateHook>>,
    pub(crate) before_entry_update_hooks: Vec<Arc<dyn BeforeEntryUpdateHook>>,
    pub(crate) after_entry_update_hooks: Vec<Arc<dyn AfterEntryUpdateHook>>,
    pub(crate) after_feeds_update_hooks: Vec<Arc<dyn AfterFeedsUpdateHook>>,
}

impl std::fmt::Debug for Reader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reader").finish_non_exhaustive()
    }
}

impl Reader {
    pub async fn open(config: ReaderConfig) -> Result<Reader> {
        config.validate()?;
        let storage = Storage::open(&config.db_path).await?;
        let http = HttpRetriever::new(
            config.connect_timeout(),
            config.read_timeout(),
            config.user_agent.clone(),
        );
        let file = config.feed_root.as_deref().map(FileRetriever::new);
        let reader = Reader {
            storage,
            retriever: Arc::new(DefaultRetriever::new(http, file)),
            parser: Arc::new(FeedParser::new()),
            closed: AtomicBool::new(false),
            feed_locks: DashMap::new(),
            claimed_names: Mutex::new(HashSet::new()),
            before_feeds_update_hooks: Vec::new(),
            before_feed_update_hooks: Vec::new(),
            before_entry_update_hooks: Vec::new(),
            after_entry_update_hooks: Vec::new(),
            after_feeds_update_hooks: Vec::new(),
            config,
        };
        match reader.config.search {
            SearchMode::Enabled => reader.enable_search().await?,
            SearchMode::Disabled => reader.disable_search().await?,
            SearchMode::Auto => {}
        }
        debug!(db = %reader.storage.path().display(), "reader opened");
        Ok(reader)
    }

    pub async fn open_with_plugins(config: ReaderConfig, plugins: Vec<Plugin>) -> Result<Reader> {
        let mut reader = Self::open(config).await?;
        for plugin in plugins {
            plugin(&mut reader).map_err(|e| Error::PluginInit {
                message: e.to_string(),
            })?;
        }
        Ok(reader)
    }

    /// Swap the retriever, e.g. for tests or custom transports.
    pub fn with_retriever(mut self, retriever: Arc<dyn Retriever>) -> Self {
        self.retriever = retriever;
        self
    }

    /// Swap the parser.
    pub fn with_parser(mut self, parser: Arc<dyn Parser>) -> Self {
        self.parser = parser;
        self
    }

    pub fn config(&self) -> &ReaderConfig {
        &self.config
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        Ok(())
    }

    /// Optimize and release the database. Idempotent; later operations fail
    /// with [`Error::Closed`].
    pub async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.storage.close().await
    }

    // ------------------------------------------------------------------
    // Feed lifecycle
    // ------------------------------------------------------------------

    pub async fn add_feed(&self, url: &str) -> Result<()> {
        self.ensure_open()?;
        crate::fetch::validate_feed_url(url, self.config.feed_root.as_deref())?;
        let url = url.to_string();
        let now = Utc::now();
        self.storage
            .with_conn(move |conn| feeds::add_feed(conn, &url, now))
            .await
    }

    /// Like [`add_feed`](Self::add_feed), but an existing feed is not an
    /// error.
    pub async fn add_feed_exist_ok(&self, url: &str) -> Result<()> {
        match self.add_feed(url).await {
            Err(Error::FeedExists { .. }) => Ok(()),
            other => other,
        }
    }

    pub async fn delete_feed(&self, url: &str) -> Result<()> {
        self.ensure_open()?;
        let url = url.to_string();
        self.storage
            .with_conn(move |conn| feeds::delete_feed(conn, &url))
            .await
    }

    /// Move a feed to a new URL, resetting its retrieval state. Entries,
    /// flags and tags follow; entries remember their original feed URL.
    pub async fn change_feed_url(&self, old: &str, new: &str) -> Result<()> {
        self.ensure_open()?;
        crate::fetch::validate_feed_url(new, self.config.feed_root.as_deref())?;
        let (old, new) = (old.to_string(), new.to_string());
        self.storage
            .with_conn(move |conn| feeds::change_feed_url(conn, &old, &new))
            .await
    }

    pub async fn get_feed(&self, url: &str) -> Result<Feed> {
        self.ensure_open()?;
        let url = url.to_string();
        self.storage
            .with_conn(move |conn| feeds::get_feed(conn, &url))
            .await
    }

    /// All feeds matching the filter, fetched chunk by chunk.
    pub async fn get_feeds(&self, filter: &FeedFilter, sort: FeedSort) -> Result<Vec<Feed>> {
        let mut all = Vec::new();
        let mut cursor: Option<FeedCursor> = None;
        loop {
            let page = self
                .get_feeds_page(filter, sort, DEFAULT_CHUNK_SIZE, cursor.as_ref())
                .await?;
            let done = page.len() < DEFAULT_CHUNK_SIZE;
            if let Some(last) = page.last() {
                cursor = Some(last.cursor(sort));
            }
            all.extend(page);
            if done {
                break;
            }
        }
        Ok(all)
    }

    /// One bounded page of feeds; pass the last feed's cursor to resume.
    pub async fn get_feeds_page(
        &self,
        filter: &FeedFilter,
        sort: FeedSort,
        limit: usize,
        starting_after: Option<&FeedCursor>,
    ) -> Result<Vec<Feed>> {
        self.ensure_open()?;
        let filter = filter.clone();
        let cursor = starting_after.cloned();
        self.storage
            .with_conn(move |conn| feeds::get_feeds(conn, &filter, sort, limit, cursor.as_ref()))
            .await
    }

    pub async fn get_feed_counts(&self, filter: &FeedFilter) -> Result<FeedCounts> {
        self.ensure_open()?;
        let filter = filter.clone();
        self.storage
            .with_conn(move |conn| feeds::get_feed_counts(conn, &filter))
            .await
    }

    pub async fn enable_feed_updates(&self, url: &str) -> Result<()> {
        self.set_feed_updates_enabled(url, true).await
    }

    pub async fn disable_feed_updates(&self, url: &str) -> Result<()> {
        self.set_feed_updates_enabled(url, false).await
    }

    async fn set_feed_updates_enabled(&self, url: &str, enabled: bool) -> Result<()> {
        self.ensure_open()?;
        let url = url.to_string();
        self.storage
            .with_conn(move |conn| feeds::set_feed_updates_enabled(conn, &url, enabled))
            .await
    }

    pub async fn set_feed_user_title(&self, url: &str, title: Option<&str>) -> Result<()> {
        self.ensure_open()?;
        let url = url.to_string();
        let title = title.map(str::to_string);
        self.storage
            .with_conn(move |conn| feeds::set_feed_user_title(conn, &url, title.as_deref()))
            .await
    }

    /// Defer the next update attempt; `None` clears the deferral.
    pub async fn set_feed_update_after(
        &self,
        url: &str,
        after: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.ensure_open()?;
        let url = url.to_string();
        self.storage
            .with_conn(move |conn| feeds::set_feed_update_after(conn, &url, after))
            .await
    }

    /// Force the next update to bypass conditional retrieval.
    pub async fn mark_feed_stale(&self, url: &str) -> Result<()> {
        self.ensure_open()?;
        let url = url.to_string();
        self.storage
            .with_conn(move |conn| feeds::mark_feed_stale(conn, &url))
            .await
    }

    // ------------------------------------------------------------------
    // Entry lifecycle
    // ------------------------------------------------------------------

    /// Store a user-provided entry. Refuses to overwrite an existing one.
    pub async fn add_entry(&self, feed_url: &str, entry: EntryData) -> Result<()> {
        self.ensure_open()?;
        if entry.id.is_empty() {
            return Err(Error::usage("entry id cannot be empty"));
        }
        let feed_url = feed_url.to_string();
        let hash = entry_data_hash(&entry);
        let now = Utc::now();
        self.storage
            .with_conn(move |conn| entries::add_entry(conn, &feed_url, &entry, &hash, now))
            .await
    }

    pub async fn delete_entry(&self, feed_url: &str, entry_id: &str) -> Result<()> {
        self.ensure_open()?;
        let (feed_url, entry_id) = (feed_url.to_string(), entry_id.to_string());
        self.storage
            .with_conn(move |conn| entries::delete_entry(conn, &feed_url, &entry_id))
            .await
    }

    pub async fn get_entry(&self, feed_url: &str, entry_id: &str) -> Result<Entry> {
        self.ensure_open()?;
        let (feed_url, entry_id) = (feed_url.to_string(), entry_id.to_string());
        self.storage
            .with_conn(move |conn| entries::get_entry(conn, &feed_url, &entry_id))
            .await
    }

    /// All entries matching the filter, fetched chunk by chunk. With
    /// `Random` sort this returns a single sample page instead.
    pub async fn get_entries(&self, filter: &EntryFilter, sort: EntrySort) -> Result<Vec<Entry>> {
        match sort {
            EntrySort::Random => {
                self.get_entries_page(filter, sort, DEFAULT_CHUNK_SIZE, None)
                    .await
            }
            EntrySort::Recent => {
                let mut all = Vec::new();
                let mut cursor: Option<EntryCursor> = None;
                loop {
                    let page = self
                        .get_entries_page(filter, sort, DEFAULT_CHUNK_SIZE, cursor.as_ref())
                        .await?;
                    let done = page.len() < DEFAULT_CHUNK_SIZE;
                    if let Some(last) = page.last() {
                        cursor = Some(last.cursor());
                    }
                    all.extend(page);
                    if done {
                        break;
                    }
                }
                Ok(all)
            }
        }
    }

    /// One bounded page of entries; pass the last entry's cursor to resume.
    /// Results are stable within a page and weakly consistent across pages.
    pub async fn get_entries_page(
        &self,
        filter: &EntryFilter,
        sort: EntrySort,
        limit: usize,
        starting_after: Option<&EntryCursor>,
    ) -> Result<Vec<Entry>> {
        self.ensure_open()?;
        let filter = filter.clone();
        let cursor = starting_after.cloned();
        self.storage
            .with_conn(move |conn| entries::get_entries(conn, &filter, sort, limit, cursor.as_ref()))
            .await
    }

    pub async fn get_entry_counts(&self, filter: &EntryFilter) -> Result<EntryCounts> {
        self.ensure_open()?;
        let filter = filter.clone();
        let now = Utc::now();
        self.storage
            .with_conn(move |conn| entries::get_entry_counts(conn, &filter, now))
            .await
    }

    pub async fn mark_entry_as_read(&self, feed_url: &str, entry_id: &str) -> Result<()> {
        self.set_entry_read(feed_url, entry_id, true).await
    }

    pub async fn mark_entry_as_unread(&self, feed_url: &str, entry_id: &str) -> Result<()> {
        self.set_entry_read(feed_url, entry_id, false).await
    }

    async fn set_entry_read(&self, feed_url: &str, entry_id: &str, read: bool) -> Result<()> {
        self.ensure_open()?;
        let (feed_url, entry_id) = (feed_url.to_string(), entry_id.to_string());
        let now = Utc::now();
        self.storage
            .with_conn(move |conn| entries::set_entry_read(conn, &feed_url, &entry_id, read, now))
            .await
    }

    pub async fn mark_entry_as_important(&self, feed_url: &str, entry_id: &str) -> Result<()> {
        self.set_entry_important(feed_url, entry_id, Some(true)).await
    }

    pub async fn mark_entry_as_unimportant(&self, feed_url: &str, entry_id: &str) -> Result<()> {
        self.set_entry_important(feed_url, entry_id, Some(false)).await
    }

    /// Reset the tristate flag to "never set".
    pub async fn clear_entry_important(&self, feed_url: &str, entry_id: &str) -> Result<()> {
        self.set_entry_important(feed_url, entry_id, None).await
    }

    async fn set_entry_important(
        &self,
        feed_url: &str,
        entry_id: &str,
        important: Option<bool>,
    ) -> Result<()> {
        self.ensure_open()?;
        let (feed_url, entry_id) = (feed_url.to_string(), entry_id.to_string());
        let now = Utc::now();
        self.storage
            .with_conn(move |conn| {
                entries::set_entry_important(conn, &feed_url, &entry_id, important, now)
            })
            .await
    }

    // ------------------------------------------------------------------
    // Tags
    // ------------------------------------------------------------------

    /// Set a tag. Without a value this is a presence assertion (JSON null).
    pub async fn set_tag(
        &self,
        resource: ResourceId<'_>,
        name: &str,
        value: Option<serde_json::Value>,
    ) -> Result<()> {
        self.ensure_open()?;
        self.check_tag_name(name)?;
        let value = value.unwrap_or(serde_json::Value::Null);
        self.check_tag_value(&value)?;
        let (feed, entry) = owned_scope(resource);
        let name = name.to_string();
        self.storage
            .with_conn(move |conn| {
                tags::set_tag(conn, scope_resource(&feed, &entry), &name, &value)
            })
            .await
    }

    pub async fn get_tag(
        &self,
        resource: ResourceId<'_>,
        name: &str,
    ) -> Result<serde_json::Value> {
        self.ensure_open()?;
        let (feed, entry) = owned_scope(resource);
        let name = name.to_string();
        self.storage
            .with_conn(move |conn| tags::get_tag(conn, scope_resource(&feed, &entry), &name))
            .await
    }

    pub async fn get_tags(
        &self,
        resource: ResourceId<'_>,
    ) -> Result<Vec<(String, serde_json::Value)>> {
        self.ensure_open()?;
        let (feed, entry) = owned_scope(resource);
        self.storage
            .with_conn(move |conn| tags::get_tags(conn, scope_resource(&feed, &entry)))
            .await
    }

    pub async fn get_tag_keys(&self, resource: ResourceId<'_>) -> Result<Vec<String>> {
        self.ensure_open()?;
        let (feed, entry) = owned_scope(resource);
        self.storage
            .with_conn(move |conn| tags::get_tag_keys(conn, scope_resource(&feed, &entry)))
            .await
    }

    pub async fn delete_tag(&self, resource: ResourceId<'_>, name: &str) -> Result<()> {
        self.ensure_open()?;
        let (feed, entry) = owned_scope(resource);
        let name = name.to_string();
        self.storage
            .with_conn(move |conn| tags::delete_tag(conn, scope_resource(&feed, &entry), &name))
            .await
    }

    /// Claim a reader-reserved tag name; the returned name is accepted by
    /// [`set_tag`](Self::set_tag).
    pub fn make_reader_reserved_name(&self, key: &str) -> String {
        let name = self.config.reserved_names.make_reader_reserved_name(key);
        self.claimed_names.lock().insert(name.clone());
        name
    }

    /// Claim a plugin-reserved tag name.
    pub fn make_plugin_reserved_name(&self, plugin: &str, key: &str) -> String {
        let name = self.config.reserved_names.make_plugin_reserved_name(plugin, key);
        self.claimed_names.lock().insert(name.clone());
        name
    }

    fn check_tag_name(&self, name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(Error::usage("tag name cannot be empty"));
        }
        if self.config.reserved_names.is_reserved(name) && !self.claimed_names.lock().contains(name)
        {
            return Err(Error::ReservedTagName {
                name: name.to_string(),
            });
        }
        Ok(())
    }

    /// Reserved prefixes also bind top-level object keys inside values.
    fn check_tag_value(&self, value: &serde_json::Value) -> Result<()> {
        if let serde_json::Value::Object(map) = value {
            for key in map.keys() {
                if self.config.reserved_names.is_reserved(key)
                    && !self.claimed_names.lock().contains(key)
                {
                    return Err(Error::ReservedTagName { name: key.clone() });
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Search control and queries
    // ------------------------------------------------------------------

    pub async fn enable_search(&self) -> Result<()> {
        self.ensure_open()?;
        self.storage.with_conn(search::enable).await
    }

    pub async fn disable_search(&self) -> Result<()> {
        self.ensure_open()?;
        self.storage.with_conn(search::disable).await
    }

    pub async fn is_search_enabled(&self) -> Result<bool> {
        self.ensure_open()?;
        self.storage
            .with_conn(|conn| search::is_enabled(conn))
            .await
    }

    /// Drain the change log into the search index.
    pub async fn update_search(&self) -> Result<()> {
        self.ensure_open()?;
        self.storage.with_conn(search::update).await
    }

    pub async fn search_entries(
        &self,
        query: &str,
        filter: &EntryFilter,
        sort: SearchSort,
        limit: usize,
        starting_after: Option<&EntryCursor>,
    ) -> Result<Vec<EntrySearchResult>> {
        self.ensure_open()?;
        let query = query.to_string();
        let filter = filter.clone();
        let cursor = starting_after.cloned();
        self.storage
            .with_conn(move |conn| {
                search::search(conn, &query, &filter, sort, limit, cursor.as_ref())
            })
            .await
    }

    pub async fn search_entry_counts(
        &self,
        query: &str,
        filter: &EntryFilter,
    ) -> Result<EntryCounts> {
        self.ensure_open()?;
        let query = query.to_string();
        let filter = filter.clone();
        let now = Utc::now();
        self.storage
            .with_conn(move |conn| search::search_counts(conn, &query, &filter, now))
            .await
    }

    // ------------------------------------------------------------------
    // Hook registration
    // ------------------------------------------------------------------

    pub fn add_before_feeds_update_hook(&mut self, hook: Arc<dyn BeforeFeedsUpdateHook>) {
        self.before_feeds_update_hooks.push(hook);
    }

    pub fn add_before_feed_update_hook(&mut self, hook: Arc<dyn BeforeFeedUpdateHook>) {
        self.before_feed_update_hooks.push(hook);
    }

    pub fn add_before_entry_update_hook(&mut self, hook: Arc<dyn BeforeEntryUpdateHook>) {
        self.before_entry_update_hooks.push(hook);
    }

    pub fn add_after_entry_update_hook(&mut self, hook: Arc<dyn AfterEntryUpdateHook>) {
        self.after_entry_update_hooks.push(hook);
    }

    pub fn add_after_feeds_update_hook(&mut self, hook: Arc<dyn AfterFeedsUpdateHook>) {
        self.after_feeds_update_hooks.push(hook);
    }

    pub(crate) fn feed_lock(&self, url: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.feed_locks
            .entry(url.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

fn owned_scope(resource: ResourceId<'_>) -> (String, String) {
    let (feed, entry) = resource.scope();
    (feed.to_string(), entry.to_string())
}

/// Rebuild a resource id from its stored scope; empty components mean the
/// wider scope (urls and entry ids are never empty).
fn scope_resource<'a>(feed: &'a str, entry: &'a str) -> ResourceId<'a> {
    match (feed.is_empty(), entry.is_empty()) {
        (true, _) => ResourceId::Global,
        (false, true) => ResourceId::Feed(feed),
        (false, false) => ResourceId::Entry(feed, entry),
    }
}
