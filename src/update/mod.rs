//! The update pipeline: select feeds, retrieve, parse, diff against stored
//! entries, run hooks, commit one transaction per feed.
//!
//! Feeds fan out over a bounded worker pool; a feed is never processed by
//! two workers at once. Retrieval and parse failures become that feed's
//! result without disturbing the others.

pub(crate) mod hash;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use futures::future;
use futures::stream::{self, Stream, StreamExt};
use tracing::{debug, info, warn};

use crate::error::{Error, ExceptionInfo, Result};
use crate::fetch::{RetrieveOutcome, RetrieveRequest};
use crate::hooks::{EntryAction, EntryUpdateStatus};
use crate::reader::Reader;
use crate::storage::entries::{self, EntryOp, EntryOpKind, FeedUpdateIntent};
use crate::storage::feeds::{self, FeedForUpdate, UpdateSelect};
use crate::types::{FeedUpdateResult, UpdatedFeed};

/// Consecutive hash-only updates tolerated before an entry is left alone.
const HASH_CHANGED_CAP: i64 = 24;

/// Cooperative cancellation flag: once set, no further feeds are
/// dispatched; in-flight feeds finish their current stage.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Default)]
pub struct UpdateOptions {
    /// Concurrent feeds; defaults to the reader configuration.
    pub workers: Option<usize>,
    /// Restrict the cycle to feeds never updated before (or the opposite).
    pub new: Option<bool>,
    pub cancel: Option<CancelToken>,
}

impl Reader {
    /// Update one feed, regardless of its update schedule. Raises on
    /// failure; `Ok(None)` means the origin reported it unchanged.
    pub async fn update_feed(&self, url: &str) -> Result<Option<UpdatedFeed>> {
        self.ensure_open()?;
        let feed = self.get_feed(url).await?;
        let target = FeedForUpdate {
            url: feed.url.clone(),
            caching: feed.caching.clone(),
            stale: feed.stale,
            first_fetch: feed.last_updated.is_none(),
        };
        self.process_feed(target).await
    }

    /// Update all scheduled feeds, logging and swallowing per-feed errors.
    pub async fn update_feeds(&self, options: UpdateOptions) -> Result<()> {
        let stream = self.update_feeds_iter(options).await?;
        futures::pin_mut!(stream);
        while let Some(result) = stream.next().await {
            match &result.result {
                Ok(Some(counts)) => debug!(
                    feed = %result.url,
                    new = counts.new,
                    modified = counts.modified,
                    "feed updated"
                ),
                Ok(None) => debug!(feed = %result.url, "feed not modified"),
                Err(err) => warn!(feed = %result.url, error = %err, "feed update failed"),
            }
        }
        Ok(())
    }

    /// Update all scheduled feeds, yielding one result per feed as each
    /// finishes. Completion order across feeds is arbitrary.
    pub async fn update_feeds_iter(
        &self,
        options: UpdateOptions,
    ) -> Result<impl Stream<Item = FeedUpdateResult> + '_> {
        self.ensure_open()?;
        for hook in &self.before_feeds_update_hooks {
            hook.before_feeds_update(self)
                .await
                .map_err(|e| hook_error("before_feeds_update", "update cycle", &e))?;
        }

        let select = UpdateSelect {
            feed: None,
            new: options.new,
            scheduled_only: true,
        };
        let now = Utc::now();
        let feeds = self
            .storage
            .with_conn(move |conn| feeds::get_feeds_for_update(conn, &select, now))
            .await?;
        let workers = options.workers.unwrap_or(self.config.workers).max(1);
        let cancel = options.cancel.clone().unwrap_or_default();
        info!(feeds = feeds.len(), workers, "starting update cycle");

        let results = stream::iter(feeds)
            .take_while(move |_| future::ready(!cancel.is_cancelled()))
            .map(move |feed| self.update_one(feed))
            .buffer_unordered(workers)
            .map(Some)
            .chain(stream::once(async move {
                for hook in &self.after_feeds_update_hooks {
                    if let Err(err) = hook.after_feeds_update(self).await {
                        warn!(error = %err, "after_feeds_update hook failed");
                    }
                }
                None
            }))
            .filter_map(future::ready);
        Ok(results)
    }

    async fn update_one(&self, feed: FeedForUpdate) -> FeedUpdateResult {
        let url = feed.url.clone();
        let result = self.process_feed(feed).await;
        FeedUpdateResult { url, result }
    }

    async fn process_feed(&self, feed: FeedForUpdate) -> Result<Option<UpdatedFeed>> {
        let lock = self.feed_lock(&feed.url);
        let _guard = lock.lock().await;
        let url = feed.url.clone();
        debug!(feed = %url, stale = feed.stale, first_fetch = feed.first_fetch, "updating feed");

        for hook in &self.before_feed_update_hooks {
            hook.before_feed_update(self, &url)
                .await
                .map_err(|e| hook_error("before_feed_update", &url, &e))?;
        }

        let outcome = self
            .retriever
            .retrieve(RetrieveRequest {
                url: &url,
                caching: &feed.caching,
                stale: feed.stale,
            })
            .await;
        let retrieved = match outcome {
            Ok(RetrieveOutcome::NotModified) => {
                let stamped = url.clone();
                let now = Utc::now();
                self.storage
                    .with_conn(move |conn| feeds::record_not_modified(conn, &stamped, now))
                    .await?;
                return Ok(None);
            }
            Ok(RetrieveOutcome::Retrieved(retrieved)) => retrieved,
            Err(err) => {
                self.record_failure(&url, &err).await?;
                return Err(err);
            }
        };

        let parsed = self
            .parser
            .parse(&url, &retrieved.body, retrieved.media_type.as_deref());
        let (feed_data, parsed_entries) = match parsed {
            Ok(parsed) => parsed,
            Err(err) => {
                self.record_failure(&url, &err).await?;
                return Err(err);
            }
        };

        let ids: Vec<String> = parsed_entries.iter().map(|e| e.id.clone()).collect();
        let snapshots = {
            let url = url.clone();
            self.storage
                .with_conn(move |conn| entries::get_update_targets(conn, &url, &ids))
                .await?
        };

        let mut counts = UpdatedFeed::default();
        let mut ops = Vec::new();
        let mut seen = HashSet::new();
        let total = parsed_entries.len() as i64;
        for (index, mut data) in parsed_entries.into_iter().enumerate() {
            if data.id.is_empty() || !seen.insert(data.id.clone()) {
                warn!(feed = %url, id = %data.id, "skipping entry with missing or duplicate id");
                continue;
            }
            let kind = match snapshots.get(&data.id) {
                None => Some(EntryOpKind::New),
                Some(snapshot) => {
                    let advanced = match (data.updated, snapshot.updated) {
                        (Some(new), Some(old)) => new > old,
                        (Some(_), None) => true,
                        _ => false,
                    };
                    if advanced {
                        Some(EntryOpKind::Update { hash_changed: 0 })
                    } else {
                        let hash = hash::entry_data_hash(&data);
                        if snapshot.data_hash.as_deref() == Some(hash.as_slice()) {
                            None
                        } else if snapshot.hash_changed >= HASH_CHANGED_CAP {
                            debug!(
                                feed = %url,
                                id = %data.id,
                                cap = HASH_CHANGED_CAP,
                                "entry hit the hash-only update cap"
                            );
                            None
                        } else {
                            Some(EntryOpKind::Update {
                                hash_changed: snapshot.hash_changed + 1,
                            })
                        }
                    }
                }
            };
            let Some(kind) = kind else {
                counts.unmodified += 1;
                continue;
            };

            let mut skipped = false;
            for hook in &self.before_entry_update_hooks {
                match hook.before_entry_update(&url, &mut data) {
                    Ok(EntryAction::Keep) => {}
                    Ok(EntryAction::Skip) => {
                        skipped = true;
                        break;
                    }
                    Err(err) => {
                        return Err(hook_error(
                            "before_entry_update",
                            &format!("({}, {})", url, data.id),
                            &err,
                        ))
                    }
                }
            }
            if skipped {
                counts.unmodified += 1;
                continue;
            }

            match kind {
                EntryOpKind::New => counts.new += 1,
                EntryOpKind::Update { .. } => counts.modified += 1,
            }
            // Hash after the hooks so the stored hash matches the stored
            // content. feed_order counts from the end of the snapshot so
            // entries later in the document sort first among ties.
            let hash = hash::entry_data_hash(&data);
            ops.push(EntryOp {
                hash,
                feed_order: total - 1 - index as i64,
                kind,
                data,
            });
        }

        let statuses: Vec<(String, EntryUpdateStatus)> = ops
            .iter()
            .map(|op| {
                let status = match op.kind {
                    EntryOpKind::New => EntryUpdateStatus::New,
                    EntryOpKind::Update { .. } => EntryUpdateStatus::Modified,
                };
                (op.data.id.clone(), status)
            })
            .collect();

        let intent = FeedUpdateIntent {
            url: url.clone(),
            feed: feed_data,
            caching: retrieved.caching,
            now: Utc::now(),
            first_fetch: feed.first_fetch,
            ops,
        };
        self.storage
            .with_conn(move |conn| entries::apply_feed_update(conn, intent))
            .await?;
        info!(
            feed = %url,
            new = counts.new,
            modified = counts.modified,
            unmodified = counts.unmodified,
            "feed committed"
        );

        if !self.after_entry_update_hooks.is_empty() {
            let mut hook_errors = Vec::new();
            for (id, status) in statuses {
                let entry = match self.get_entry(&url, &id).await {
                    Ok(entry) => entry,
                    Err(err) => {
                        hook_errors.push(err);
                        continue;
                    }
                };
                for hook in &self.after_entry_update_hooks {
                    if let Err(err) = hook.after_entry_update(self, &entry, status).await {
                        hook_errors.push(hook_error(
                            "after_entry_update",
                            &format!("({}, {})", url, id),
                            &err,
                        ));
                    }
                }
            }
            if !hook_errors.is_empty() {
                return Err(Error::UpdateHookGroup(hook_errors));
            }
        }

        Ok(Some(counts))
    }

    async fn record_failure(&self, url: &str, err: &Error) -> Result<()> {
        let info = ExceptionInfo::from_error(err);
        let url = url.to_string();
        let now = Utc::now();
        self.storage
            .with_conn(move |conn| feeds::record_update_failure(conn, &url, &info, now))
            .await
    }
}

fn hook_error(hook: &'static str, resource: &str, err: &Error) -> Error {
    Error::UpdateHook {
        hook,
        resource: resource.to_string(),
        message: err.to_string(),
    }
}
