//! Entry rows: diff commits from the update pipeline, user flags, filtered
//! and paginated queries, counts.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};

use crate::error::{Error, Result};
use crate::types::{
    AddedBy, CachingTokens, Content, Enclosure, Entry, EntryCounts, EntryCursor, EntryData,
    EntryFilter, EntrySort, FeedData, TristateFilter,
};

use super::query::{int, text, Dir, Query, IN_LIST_CAP};
use super::tags::tag_filter_clause;
use super::{changes, opt_to_micros, row_micros, row_opt_micros, to_micros};

const ENTRY_COLUMNS: &str = "entries.feed, entries.id, entries.title, entries.link, \
     entries.updated, entries.author, entries.published, entries.summary, entries.content, \
     entries.enclosures, entries.read, entries.read_modified, entries.important, \
     entries.important_modified, entries.added, entries.added_by, entries.last_updated, \
     entries.original_feed, entries.first_updated, entries.first_updated_epoch, \
     entries.feed_order, entries.recent_sort";

/// What is already stored for an entry, for the pipeline's diff.
#[derive(Debug, Clone)]
pub(crate) struct EntrySnapshot {
    pub(crate) updated: Option<DateTime<Utc>>,
    pub(crate) data_hash: Option<Vec<u8>>,
    pub(crate) hash_changed: i64,
}

#[derive(Debug, Clone)]
pub(crate) enum EntryOpKind {
    New,
    Update { hash_changed: i64 },
}

/// One decided entry mutation, ready to commit.
#[derive(Debug, Clone)]
pub(crate) struct EntryOp {
    pub(crate) data: EntryData,
    pub(crate) hash: Vec<u8>,
    pub(crate) feed_order: i64,
    pub(crate) kind: EntryOpKind,
}

/// Everything one successful feed update commits, atomically.
#[derive(Debug, Clone)]
pub(crate) struct FeedUpdateIntent {
    pub(crate) url: String,
    pub(crate) feed: FeedData,
    pub(crate) caching: CachingTokens,
    pub(crate) now: DateTime<Utc>,
    /// The feed had never been successfully parsed before this update.
    pub(crate) first_fetch: bool,
    pub(crate) ops: Vec<EntryOp>,
}

/// `max(published, updated)` capped at the insertion time.
///
/// On a feed's first fetch the whole backlog gets the insertion time
/// instead, so a newly added feed cannot overrun the top of the recent
/// list with years of history.
fn compute_recent_sort(
    published: Option<DateTime<Utc>>,
    updated: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    first_fetch: bool,
) -> DateTime<Utc> {
    if first_fetch {
        return now;
    }
    let candidate = match (published, updated) {
        (Some(p), Some(u)) => p.max(u),
        (Some(p), None) => p,
        (None, Some(u)) => u,
        (None, None) => now,
    };
    candidate.min(now)
}

pub(crate) fn apply_feed_update(conn: &mut Connection, intent: FeedUpdateIntent) -> Result<()> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let tracking = changes::tracking_enabled(&tx)?;
    let now = intent.now;
    let url = intent.url.as_str();

    let old_title: Option<Option<String>> = tx
        .query_row("SELECT title FROM feeds WHERE url = ?1", params![url], |r| {
            r.get(0)
        })
        .optional()?;
    let old_title = old_title.ok_or_else(|| Error::FeedNotFound {
        url: url.to_string(),
    })?;

    let inserts = intent
        .ops
        .iter()
        .filter(|op| matches!(op.kind, EntryOpKind::New))
        .count();
    let epoch: i64 = if inserts > 0 {
        tx.query_row(
            "UPDATE feeds SET update_epoch = update_epoch + 1 WHERE url = ?1 RETURNING update_epoch",
            params![url],
            |r| r.get(0),
        )?
    } else {
        0
    };

    tx.execute(
        "UPDATE feeds SET title = ?1, link = ?2, updated = ?3, author = ?4, subtitle = ?5,
             version = ?6, http_etag = ?7, http_last_modified = ?8, stale = 0,
             last_updated = ?9, last_retrieved = ?9, last_exception = NULL
         WHERE url = ?10",
        params![
            intent.feed.title,
            intent.feed.link,
            opt_to_micros(intent.feed.updated),
            intent.feed.author,
            intent.feed.subtitle,
            intent.feed.version,
            intent.caching.etag,
            intent.caching.last_modified,
            to_micros(now),
            url,
        ],
    )?;

    for op in &intent.ops {
        let data = &op.data;
        let content = serde_json::to_string(&data.content)
            .map_err(|e| Error::storage(format!("serializing content: {}", e)))?;
        let enclosures = serde_json::to_string(&data.enclosures)
            .map_err(|e| Error::storage(format!("serializing enclosures: {}", e)))?;
        match op.kind {
            EntryOpKind::New => {
                let recent_sort =
                    compute_recent_sort(data.published, data.updated, now, intent.first_fetch);
                tx.execute(
                    "INSERT INTO entries (
                        id, feed, title, link, updated, author, published, summary,
                        content, enclosures, added, added_by, last_updated, data_hash,
                        data_hash_changed, first_updated, first_updated_epoch,
                        feed_order, recent_sort
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 'feed',
                              ?11, ?12, 0, ?11, ?13, ?14, ?15)",
                    params![
                        data.id,
                        url,
                        data.title,
                        data.link,
                        opt_to_micros(data.updated),
                        data.author,
                        opt_to_micros(data.published),
                        data.summary,
                        content,
                        enclosures,
                        to_micros(now),
                        op.hash,
                        epoch,
                        op.feed_order,
                        to_micros(recent_sort),
                    ],
                )?;
            }
            EntryOpKind::Update { hash_changed } => {
                let (old_published, old_updated, old_recent): (
                    Option<i64>,
                    Option<i64>,
                    i64,
                ) = tx.query_row(
                    "SELECT published, updated, recent_sort FROM entries
                     WHERE feed = ?1 AND id = ?2",
                    params![url, data.id],
                    |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
                )?;
                let timestamps_changed = old_published != opt_to_micros(data.published)
                    || old_updated != opt_to_micros(data.updated);
                // recent_sort never goes backwards once assigned.
                let recent_sort = if timestamps_changed {
                    to_micros(compute_recent_sort(data.published, data.updated, now, false))
                        .max(old_recent)
                } else {
                    old_recent
                };
                tx.execute(
                    "UPDATE entries SET title = ?1, link = ?2, updated = ?3, author = ?4,
                         published = ?5, summary = ?6, content = ?7, enclosures = ?8,
                         data_hash = ?9, data_hash_changed = ?10, last_updated = ?11,
                         feed_order = ?12, recent_sort = ?13
                     WHERE feed = ?14 AND id = ?15",
                    params![
                        data.title,
                        data.link,
                        opt_to_micros(data.updated),
                        data.author,
                        opt_to_micros(data.published),
                        data.summary,
                        content,
                        enclosures,
                        op.hash,
                        hash_changed,
                        to_micros(now),
                        op.feed_order,
                        recent_sort,
                        url,
                        data.id,
                    ],
                )?;
            }
        }
        if tracking {
            changes::enqueue_insert(&tx, url, &data.id)?;
        }
    }

    // The feed title is baked into every search row of the feed.
    if tracking && old_title != intent.feed.title {
        let mut stmt = tx.prepare("SELECT id FROM entries WHERE feed = ?1 ORDER BY id")?;
        let ids: Vec<String> = stmt
            .query_map(params![url], |r| r.get(0))?
            .collect::<rusqlite::Result<_>>()?;
        drop(stmt);
        for id in ids {
            changes::enqueue_insert(&tx, url, &id)?;
        }
    }

    tx.commit()?;
    Ok(())
}

pub(crate) fn add_entry(
    conn: &mut Connection,
    feed_url: &str,
    data: &EntryData,
    hash: &[u8],
    now: DateTime<Utc>,
) -> Result<()> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    super::feeds::ensure_feed_exists(&tx, feed_url)?;
    let exists: i64 = tx.query_row(
        "SELECT EXISTS (SELECT 1 FROM entries WHERE feed = ?1 AND id = ?2)",
        params![feed_url, data.id],
        |r| r.get(0),
    )?;
    if exists != 0 {
        return Err(Error::EntryExists {
            feed_url: feed_url.to_string(),
            entry_id: data.id.clone(),
        });
    }
    let epoch: i64 = tx.query_row(
        "UPDATE feeds SET update_epoch = update_epoch + 1 WHERE url = ?1 RETURNING update_epoch",
        params![feed_url],
        |r| r.get(0),
    )?;
    let content = serde_json::to_string(&data.content)
        .map_err(|e| Error::storage(format!("serializing content: {}", e)))?;
    let enclosures = serde_json::to_string(&data.enclosures)
        .map_err(|e| Error::storage(format!("serializing enclosures: {}", e)))?;
    let recent_sort = compute_recent_sort(data.published, data.updated, now, false);
    tx.execute(
        "INSERT INTO entries (
            id, feed, title, link, updated, author, published, summary, content,
            enclosures, added, added_by, last_updated, data_hash, data_hash_changed,
            first_updated, first_updated_epoch, feed_order, recent_sort
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 'user', ?11, ?12, 0,
                  ?11, ?13, 0, ?14)",
        params![
            data.id,
            feed_url,
            data.title,
            data.link,
            opt_to_micros(data.updated),
            data.author,
            opt_to_micros(data.published),
            data.summary,
            content,
            enclosures,
            to_micros(now),
            hash,
            epoch,
            to_micros(recent_sort),
        ],
    )?;
    if changes::tracking_enabled(&tx)? {
        changes::enqueue_insert(&tx, feed_url, &data.id)?;
    }
    tx.commit()?;
    Ok(())
}

pub(crate) fn delete_entry(conn: &mut Connection, feed_url: &str, entry_id: &str) -> Result<()> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let sequence: Option<Option<i64>> = tx
        .query_row(
            "SELECT sequence FROM entries WHERE feed = ?1 AND id = ?2",
            params![feed_url, entry_id],
            |r| r.get(0),
        )
        .optional()?;
    let sequence = sequence.ok_or_else(|| Error::EntryNotFound {
        feed_url: feed_url.to_string(),
        entry_id: entry_id.to_string(),
    })?;
    tx.execute(
        "DELETE FROM tags WHERE feed = ?1 AND entry_id = ?2",
        params![feed_url, entry_id],
    )?;
    tx.execute(
        "DELETE FROM entries WHERE feed = ?1 AND id = ?2",
        params![feed_url, entry_id],
    )?;
    if changes::tracking_enabled(&tx)? {
        if let Some(seq) = sequence {
            changes::enqueue_delete(&tx, feed_url, entry_id, seq)?;
        }
    }
    tx.commit()?;
    Ok(())
}

pub(crate) fn get_entry(conn: &Connection, feed_url: &str, entry_id: &str) -> Result<Entry> {
    let sql = format!(
        "SELECT {} FROM entries WHERE entries.feed = ?1 AND entries.id = ?2",
        ENTRY_COLUMNS
    );
    conn.query_row(&sql, params![feed_url, entry_id], entry_from_row)
        .optional()?
        .ok_or_else(|| Error::EntryNotFound {
            feed_url: feed_url.to_string(),
            entry_id: entry_id.to_string(),
        })
}

pub(crate) fn get_entries(
    conn: &Connection,
    filter: &EntryFilter,
    sort: EntrySort,
    limit: usize,
    starting_after: Option<&EntryCursor>,
) -> Result<Vec<Entry>> {
    let mut q = Query::new("entries");
    q.select(ENTRY_COLUMNS);
    apply_entry_filter(&mut q, filter);
    match sort {
        EntrySort::Recent => {
            q.keyset(
                recent_sort_keys(),
                starting_after.map(entry_cursor_values),
            );
        }
        EntrySort::Random => {
            if starting_after.is_some() {
                return Err(Error::usage("random sort cannot be paginated"));
            }
            q.order("random()");
        }
    }
    q.limit(limit);

    let (sql, sql_params) = q.into_parts();
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(rusqlite::params_from_iter(sql_params), entry_from_row)?;
    let mut entries = Vec::new();
    for row in rows {
        entries.push(row?);
    }
    Ok(entries)
}

const COUNT_WINDOW_DAYS: [i64; 3] = [30, 91, 365];

/// Add the count/aggregate select expressions shared by entry and search
/// counts.
pub(crate) fn push_count_selects(q: &mut Query, now: DateTime<Utc>) {
    q.select("COUNT(*)")
        .select("COALESCE(SUM(CASE WHEN entries.read = 1 THEN 1 ELSE 0 END), 0)")
        .select("COALESCE(SUM(CASE WHEN entries.important = 1 THEN 1 ELSE 0 END), 0)")
        .select(
            "COALESCE(SUM(CASE WHEN json_array_length(entries.enclosures) > 0 THEN 1 ELSE 0 END), 0)",
        );
    for days in COUNT_WINDOW_DAYS {
        let cutoff = to_micros(now - chrono::Duration::days(days));
        q.select(format!(
            "COALESCE(SUM(CASE WHEN entries.recent_sort >= {} THEN 1 ELSE 0 END), 0)",
            cutoff
        ));
    }
}

pub(crate) fn counts_from_row(row: &Row<'_>) -> rusqlite::Result<EntryCounts> {
    Ok(EntryCounts {
        total: row.get::<_, i64>(0)? as u64,
        read: row.get::<_, i64>(1)? as u64,
        important: row.get::<_, i64>(2)? as u64,
        has_enclosures: row.get::<_, i64>(3)? as u64,
        averages: [
            row.get::<_, i64>(4)? as f64 / COUNT_WINDOW_DAYS[0] as f64,
            row.get::<_, i64>(5)? as f64 / COUNT_WINDOW_DAYS[1] as f64,
            row.get::<_, i64>(6)? as f64 / COUNT_WINDOW_DAYS[2] as f64,
        ],
    })
}

pub(crate) fn get_entry_counts(
    conn: &Connection,
    filter: &EntryFilter,
    now: DateTime<Utc>,
) -> Result<EntryCounts> {
    let mut q = Query::new("entries");
    push_count_selects(&mut q, now);
    apply_entry_filter(&mut q, filter);

    let (sql, sql_params) = q.into_parts();
    let counts = conn.query_row(&sql, rusqlite::params_from_iter(sql_params), counts_from_row)?;
    Ok(counts)
}

pub(crate) fn set_entry_read(
    conn: &Connection,
    feed_url: &str,
    entry_id: &str,
    read: bool,
    now: DateTime<Utc>,
) -> Result<()> {
    let updated = conn.execute(
        "UPDATE entries SET read = ?1, read_modified = ?2 WHERE feed = ?3 AND id = ?4",
        params![read as i64, to_micros(now), feed_url, entry_id],
    )?;
    if updated == 0 {
        return Err(Error::EntryNotFound {
            feed_url: feed_url.to_string(),
            entry_id: entry_id.to_string(),
        });
    }
    Ok(())
}

pub(crate) fn set_entry_important(
    conn: &Connection,
    feed_url: &str,
    entry_id: &str,
    important: Option<bool>,
    now: DateTime<Utc>,
) -> Result<()> {
    let updated = conn.execute(
        "UPDATE entries SET important = ?1, important_modified = ?2 WHERE feed = ?3 AND id = ?4",
        params![important.map(|i| i as i64), to_micros(now), feed_url, entry_id],
    )?;
    if updated == 0 {
        return Err(Error::EntryNotFound {
            feed_url: feed_url.to_string(),
            entry_id: entry_id.to_string(),
        });
    }
    Ok(())
}

/// Stored diff inputs for the given entry ids, in id chunks bounded by the
/// in-list cap.
pub(crate) fn get_update_targets(
    conn: &Connection,
    feed_url: &str,
    ids: &[String],
) -> Result<HashMap<String, EntrySnapshot>> {
    let mut snapshots = HashMap::with_capacity(ids.len());
    for chunk in ids.chunks(IN_LIST_CAP) {
        let mut q = Query::new("entries");
        q.select("entries.id")
            .select("entries.updated")
            .select("entries.data_hash")
            .select("entries.data_hash_changed")
            .filter_with("entries.feed = ?", [text(feed_url)])
            .filter_in("entries.id", chunk.iter().cloned().map(text));
        let (sql, sql_params) = q.into_parts();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(sql_params), |row| {
            Ok((
                row.get::<_, String>(0)?,
                row_opt_micros(row, 1)?,
                row.get::<_, Option<Vec<u8>>>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })?;
        for row in rows {
            let (id, updated, data_hash, hash_changed) = row?;
            snapshots.insert(
                id,
                EntrySnapshot {
                    updated,
                    data_hash,
                    hash_changed,
                },
            );
        }
    }
    Ok(snapshots)
}

pub(crate) fn recent_sort_keys() -> &'static [(&'static str, Dir)] {
    // The fixed tie-break behind `recent` ordering; cursors carry the same
    // tuple.
    &[
        ("entries.recent_sort", Dir::Desc),
        ("entries.feed", Dir::Desc),
        ("entries.last_updated", Dir::Desc),
        ("entries.first_updated_epoch", Dir::Asc),
        ("entries.feed_order", Dir::Asc),
        ("entries.id", Dir::Desc),
    ]
}

pub(crate) fn entry_cursor_values(cursor: &EntryCursor) -> Vec<Value> {
    vec![
        int(to_micros(cursor.recent_sort)),
        text(cursor.feed_url.clone()),
        int(to_micros(cursor.last_updated)),
        int(cursor.first_updated_epoch),
        int(cursor.feed_order),
        text(cursor.id.clone()),
    ]
}

pub(crate) fn apply_entry_filter(q: &mut Query, filter: &EntryFilter) {
    if let Some(feed) = &filter.feed {
        q.filter_with("entries.feed = ?", [text(feed.clone())]);
    }
    if let Some((feed, id)) = &filter.entry {
        q.filter_with(
            "entries.feed = ? AND entries.id = ?",
            [text(feed.clone()), text(id.clone())],
        );
    }
    if let Some(read) = filter.read {
        q.filter_with("entries.read = ?", [int(read as i64)]);
    }
    match filter.important {
        TristateFilter::Any => {}
        TristateFilter::IsTrue => {
            q.filter("entries.important = 1");
        }
        TristateFilter::IsFalse => {
            q.filter("entries.important = 0");
        }
        TristateFilter::NotSet => {
            q.filter("entries.important IS NULL");
        }
        TristateFilter::NotFalse => {
            q.filter("entries.important IS NULL OR entries.important = 1");
        }
        TristateFilter::NotTrue => {
            q.filter("entries.important IS NULL OR entries.important = 0");
        }
    }
    match filter.has_enclosures {
        Some(true) => {
            q.filter("json_array_length(entries.enclosures) > 0");
        }
        Some(false) => {
            q.filter("json_array_length(entries.enclosures) = 0");
        }
        None => {}
    }
    // "New" entries are the ones the owning feed's latest update inserted.
    match filter.new {
        Some(true) => {
            q.filter(
                "entries.first_updated_epoch = \
                 (SELECT feeds.update_epoch FROM feeds WHERE feeds.url = entries.feed)",
            );
        }
        Some(false) => {
            q.filter(
                "entries.first_updated_epoch <> \
                 (SELECT feeds.update_epoch FROM feeds WHERE feeds.url = entries.feed)",
            );
        }
        None => {}
    }
    if let Some((clause, params)) = tag_filter_clause(&filter.tags, "entries.feed", "entries.id") {
        q.filter(clause);
        for p in params {
            q.param(p);
        }
    }
    if let Some((clause, params)) = tag_filter_clause(&filter.feed_tags, "entries.feed", "''") {
        q.filter(clause);
        for p in params {
            q.param(p);
        }
    }
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<Entry> {
    let content: String = row.get(8)?;
    let content: Vec<Content> = serde_json::from_str(&content).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(8, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let enclosures: String = row.get(9)?;
    let enclosures: Vec<Enclosure> = serde_json::from_str(&enclosures).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(9, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let added_by: String = row.get(15)?;
    let added_by = match added_by.as_str() {
        "feed" => AddedBy::Feed,
        "user" => AddedBy::User,
        other => {
            return Err(rusqlite::Error::FromSqlConversionFailure(
                15,
                rusqlite::types::Type::Text,
                format!("unknown added_by: {}", other).into(),
            ))
        }
    };
    Ok(Entry {
        feed_url: row.get(0)?,
        id: row.get(1)?,
        title: row.get(2)?,
        link: row.get(3)?,
        updated: row_opt_micros(row, 4)?,
        author: row.get(5)?,
        published: row_opt_micros(row, 6)?,
        summary: row.get(7)?,
        content,
        enclosures,
        read: row.get::<_, i64>(10)? != 0,
        read_modified: row_opt_micros(row, 11)?,
        important: row.get::<_, Option<i64>>(12)?.map(|i| i != 0),
        important_modified: row_opt_micros(row, 13)?,
        added: row_micros(row, 14)?,
        added_by,
        last_updated: row_micros(row, 16)?,
        original_feed_url: row.get(17)?,
        first_updated: row_micros(row, 18)?,
        first_updated_epoch: row.get(19)?,
        feed_order: row.get(20)?,
        recent_sort: row_micros(row, 21)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::feeds::add_feed;
    use crate::storage::schema::open_memory;

    fn entry_data(id: &str, published: Option<DateTime<Utc>>) -> EntryData {
        EntryData {
            id: id.to_string(),
            published,
            title: Some(format!("Entry {}", id)),
            link: Some(format!("https://example.com/{}", id)),
            ..Default::default()
        }
    }

    fn commit_entries(conn: &mut Connection, url: &str, ops: Vec<EntryOp>, now: DateTime<Utc>) {
        apply_feed_update(
            conn,
            FeedUpdateIntent {
                url: url.to_string(),
                feed: FeedData {
                    title: Some("Feed".to_string()),
                    ..Default::default()
                },
                caching: CachingTokens::default(),
                now,
                first_fetch: false,
                ops,
            },
        )
        .unwrap();
    }

    fn new_op(data: EntryData, order: i64) -> EntryOp {
        EntryOp {
            hash: vec![order as u8; 4],
            feed_order: order,
            kind: EntryOpKind::New,
            data,
        }
    }

    #[test]
    fn test_insert_and_get() {
        let mut conn = open_memory();
        let now = Utc::now();
        add_feed(&conn, "f", now).unwrap();
        commit_entries(&mut conn, "f", vec![new_op(entry_data("e1", None), 0)], now);

        let entry = get_entry(&conn, "f", "e1").unwrap();
        assert_eq!(entry.title.as_deref(), Some("Entry e1"));
        assert_eq!(entry.added_by, AddedBy::Feed);
        assert!(!entry.read);
        assert_eq!(entry.first_updated_epoch, 1);

        let feed = crate::storage::feeds::get_feed(&conn, "f").unwrap();
        assert!(feed.last_updated.is_some());
        assert_eq!(feed.title.as_deref(), Some("Feed"));
    }

    #[test]
    fn test_recent_sort_uses_published_capped_at_now() {
        let now = Utc::now();
        let past = now - chrono::Duration::days(3);
        let future = now + chrono::Duration::days(3);
        assert_eq!(compute_recent_sort(Some(past), None, now, false), past);
        assert_eq!(compute_recent_sort(Some(future), None, now, false), now);
        assert_eq!(compute_recent_sort(None, None, now, false), now);
        assert_eq!(
            compute_recent_sort(Some(past), Some(now - chrono::Duration::days(1)), now, false),
            now - chrono::Duration::days(1)
        );
        // A first fetch pins the whole backlog to the insertion time.
        assert_eq!(compute_recent_sort(Some(past), None, now, true), now);
        assert_eq!(compute_recent_sort(None, None, now, true), now);
    }

    #[test]
    fn test_first_fetch_caps_recent_sort_to_now() {
        let mut conn = open_memory();
        let now = Utc::now();
        let backdated = now - chrono::Duration::days(400);
        add_feed(&conn, "f", now).unwrap();
        apply_feed_update(
            &mut conn,
            FeedUpdateIntent {
                url: "f".to_string(),
                feed: FeedData {
                    title: Some("Feed".to_string()),
                    ..Default::default()
                },
                caching: CachingTokens::default(),
                now,
                first_fetch: true,
                ops: vec![new_op(entry_data("old", Some(backdated)), 0)],
            },
        )
        .unwrap();

        let entry = get_entry(&conn, "f", "old").unwrap();
        assert_eq!(
            entry.recent_sort.timestamp_micros(),
            now.timestamp_micros()
        );
        assert_eq!(
            entry.published.unwrap().timestamp_micros(),
            backdated.timestamp_micros()
        );

        // Entries discovered by later fetches keep historical timestamps.
        commit_entries(
            &mut conn,
            "f",
            vec![new_op(entry_data("older", Some(backdated)), 0)],
            now,
        );
        let entry = get_entry(&conn, "f", "older").unwrap();
        assert_eq!(
            entry.recent_sort.timestamp_micros(),
            backdated.timestamp_micros()
        );
    }

    #[test]
    fn test_new_entry_filter() {
        let mut conn = open_memory();
        let now = Utc::now();
        add_feed(&conn, "f", now).unwrap();
        commit_entries(&mut conn, "f", vec![new_op(entry_data("old", None), 0)], now);
        commit_entries(
            &mut conn,
            "f",
            vec![new_op(entry_data("fresh", None), 0)],
            now,
        );

        let new_only = EntryFilter {
            new: Some(true),
            ..Default::default()
        };
        let ids: Vec<String> = get_entries(&conn, &new_only, EntrySort::Recent, 10, None)
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, ["fresh"]);

        let old_only = EntryFilter {
            new: Some(false),
            ..Default::default()
        };
        let ids: Vec<String> = get_entries(&conn, &old_only, EntrySort::Recent, 10, None)
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, ["old"]);

        let counts = get_entry_counts(&conn, &new_only, now).unwrap();
        assert_eq!(counts.total, 1);
        let counts = get_entry_counts(&conn, &old_only, now).unwrap();
        assert_eq!(counts.total, 1);
    }

    #[test]
    fn test_recent_order_and_pagination() {
        let mut conn = open_memory();
        let now = Utc::now();
        add_feed(&conn, "f", now).unwrap();
        let ops = (0..10)
            .map(|i| {
                new_op(
                    entry_data(
                        &format!("e{}", i),
                        Some(now - chrono::Duration::hours(10 - i)),
                    ),
                    i,
                )
            })
            .collect();
        commit_entries(&mut conn, "f", ops, now);

        let all = get_entries(&conn, &EntryFilter::default(), EntrySort::Recent, 100, None)
            .unwrap();
        assert_eq!(all.len(), 10);
        for pair in all.windows(2) {
            assert!(pair[0].recent_sort >= pair[1].recent_sort);
        }
        assert_eq!(all[0].id, "e9");

        let mut paged = Vec::new();
        let mut cursor: Option<EntryCursor> = None;
        loop {
            let page = get_entries(
                &conn,
                &EntryFilter::default(),
                EntrySort::Recent,
                3,
                cursor.as_ref(),
            )
            .unwrap();
            if page.is_empty() {
                break;
            }
            cursor = Some(page.last().unwrap().cursor());
            paged.extend(page.into_iter().map(|e| e.id));
        }
        let all_ids: Vec<String> = all.into_iter().map(|e| e.id).collect();
        assert_eq!(paged, all_ids);
    }

    #[test]
    fn test_random_sort_rejects_cursor() {
        let mut conn = open_memory();
        let now = Utc::now();
        add_feed(&conn, "f", now).unwrap();
        commit_entries(&mut conn, "f", vec![new_op(entry_data("e1", None), 0)], now);
        let entry = get_entry(&conn, "f", "e1").unwrap();
        let err = get_entries(
            &conn,
            &EntryFilter::default(),
            EntrySort::Random,
            1,
            Some(&entry.cursor()),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Usage { .. }));
    }

    #[test]
    fn test_read_flag_sets_modified() {
        let mut conn = open_memory();
        let now = Utc::now();
        add_feed(&conn, "f", now).unwrap();
        commit_entries(&mut conn, "f", vec![new_op(entry_data("e1", None), 0)], now);

        let later = now + chrono::Duration::seconds(5);
        set_entry_read(&conn, "f", "e1", true, later).unwrap();
        let entry = get_entry(&conn, "f", "e1").unwrap();
        assert!(entry.read);
        assert_eq!(
            entry.read_modified.unwrap().timestamp_micros(),
            later.timestamp_micros()
        );

        // feed updates leave the flag timestamps alone
        commit_entries(
            &mut conn,
            "f",
            vec![EntryOp {
                data: entry_data("e1", None),
                hash: vec![9; 4],
                feed_order: 0,
                kind: EntryOpKind::Update { hash_changed: 1 },
            }],
            later + chrono::Duration::seconds(5),
        );
        let entry = get_entry(&conn, "f", "e1").unwrap();
        assert_eq!(
            entry.read_modified.unwrap().timestamp_micros(),
            later.timestamp_micros()
        );
    }

    #[test]
    fn test_important_tristate_filters() {
        let mut conn = open_memory();
        let now = Utc::now();
        add_feed(&conn, "f", now).unwrap();
        let ops = vec![
            new_op(entry_data("yes", None), 0),
            new_op(entry_data("no", None), 1),
            new_op(entry_data("unset", None), 2),
        ];
        commit_entries(&mut conn, "f", ops, now);
        set_entry_important(&conn, "f", "yes", Some(true), now).unwrap();
        set_entry_important(&conn, "f", "no", Some(false), now).unwrap();

        let count = |important: TristateFilter| {
            let filter = EntryFilter {
                important,
                ..Default::default()
            };
            get_entries(&conn, &filter, EntrySort::Recent, 10, None)
                .unwrap()
                .len()
        };
        assert_eq!(count(TristateFilter::Any), 3);
        assert_eq!(count(TristateFilter::IsTrue), 1);
        assert_eq!(count(TristateFilter::IsFalse), 1);
        assert_eq!(count(TristateFilter::NotSet), 1);
        assert_eq!(count(TristateFilter::NotFalse), 2);
        assert_eq!(count(TristateFilter::NotTrue), 2);
    }

    #[test]
    fn test_counts_agree_with_listing() {
        let mut conn = open_memory();
        let now = Utc::now();
        add_feed(&conn, "f", now).unwrap();
        let mut with_enclosure = entry_data("enc", None);
        with_enclosure.enclosures.push(Enclosure {
            href: "https://example.com/a.mp3".to_string(),
            media_type: Some("audio/mpeg".to_string()),
            length: Some(123),
        });
        let ops = vec![
            new_op(entry_data("e1", Some(now - chrono::Duration::days(1))), 0),
            new_op(entry_data("e2", Some(now - chrono::Duration::days(60))), 1),
            new_op(with_enclosure, 2),
        ];
        commit_entries(&mut conn, "f", ops, now);
        set_entry_read(&conn, "f", "e1", true, now).unwrap();

        let filter = EntryFilter::default();
        let counts = get_entry_counts(&conn, &filter, now).unwrap();
        let listed = get_entries(&conn, &filter, EntrySort::Recent, 100, None).unwrap();
        assert_eq!(counts.total as usize, listed.len());
        assert_eq!(counts.read, 1);
        assert_eq!(counts.has_enclosures, 1);
        assert_eq!(counts.averages[0], 2.0 / 30.0);
        assert_eq!(counts.averages[1], 3.0 / 91.0);

        let filter = EntryFilter {
            read: Some(false),
            ..Default::default()
        };
        let counts = get_entry_counts(&conn, &filter, now).unwrap();
        let listed = get_entries(&conn, &filter, EntrySort::Recent, 100, None).unwrap();
        assert_eq!(counts.total as usize, listed.len());
        assert_eq!(counts.total, 2);
    }

    #[test]
    fn test_add_entry_then_duplicate() {
        let mut conn = open_memory();
        let now = Utc::now();
        add_feed(&conn, "f", now).unwrap();
        add_entry(&mut conn, "f", &entry_data("mine", None), &[1, 2], now).unwrap();
        let entry = get_entry(&conn, "f", "mine").unwrap();
        assert_eq!(entry.added_by, AddedBy::User);

        let err = add_entry(&mut conn, "f", &entry_data("mine", None), &[1, 2], now).unwrap_err();
        assert!(matches!(err, Error::EntryExists { .. }));
    }

    #[test]
    fn test_delete_entry() {
        let mut conn = open_memory();
        let now = Utc::now();
        add_feed(&conn, "f", now).unwrap();
        add_entry(&mut conn, "f", &entry_data("mine", None), &[1], now).unwrap();
        delete_entry(&mut conn, "f", "mine").unwrap();
        assert!(matches!(
            get_entry(&conn, "f", "mine").unwrap_err(),
            Error::EntryNotFound { .. }
        ));
        assert!(matches!(
            delete_entry(&mut conn, "f", "mine").unwrap_err(),
            Error::EntryNotFound { .. }
        ));
    }

    #[test]
    fn test_update_targets_snapshot() {
        let mut conn = open_memory();
        let now = Utc::now();
        add_feed(&conn, "f", now).unwrap();
        commit_entries(&mut conn, "f", vec![new_op(entry_data("e1", None), 0)], now);

        let targets =
            get_update_targets(&conn, "f", &["e1".to_string(), "missing".to_string()]).unwrap();
        assert_eq!(targets.len(), 1);
        let snapshot = &targets["e1"];
        assert_eq!(snapshot.hash_changed, 0);
        assert_eq!(snapshot.data_hash.as_deref(), Some(&[0u8, 0, 0, 0][..]));
    }
}
