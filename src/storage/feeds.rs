//! Feed rows: lifecycle, selection for update, filtered queries.

use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use tracing::warn;

use crate::error::{Error, ExceptionInfo, Result};
use crate::types::{CachingTokens, Feed, FeedCounts, FeedCursor, FeedFilter, FeedSort};

use super::changes;
use super::query::{int, text, Dir, Query};
use super::tags::tag_filter_clause;
use super::{opt_to_micros, row_micros, row_opt_micros, to_micros};

const FEED_COLUMNS: &str = "feeds.url, feeds.title, feeds.link, feeds.updated, feeds.author, \
     feeds.subtitle, feeds.version, feeds.user_title, feeds.http_etag, \
     feeds.http_last_modified, feeds.stale, feeds.updates_enabled, feeds.added, \
     feeds.last_updated, feeds.last_retrieved, feeds.last_exception, feeds.update_after";

/// What the pipeline needs to know to update one feed.
#[derive(Debug, Clone)]
pub(crate) struct FeedForUpdate {
    pub(crate) url: String,
    pub(crate) caching: CachingTokens,
    pub(crate) stale: bool,
    /// The feed has never been successfully parsed.
    pub(crate) first_fetch: bool,
}

/// Selection criteria for an update cycle.
#[derive(Debug, Clone, Default)]
pub(crate) struct UpdateSelect {
    pub(crate) feed: Option<String>,
    pub(crate) new: Option<bool>,
    /// Honor `updates_enabled` and `update_after`; explicit single-feed
    /// updates bypass both.
    pub(crate) scheduled_only: bool,
}

pub(crate) fn add_feed(conn: &Connection, url: &str, now: DateTime<Utc>) -> Result<()> {
    let result = conn.execute(
        "INSERT INTO feeds (url, added, updates_enabled) VALUES (?1, ?2, 1)",
        params![url, to_micros(now)],
    );
    match result {
        Ok(_) => Ok(()),
        Err(err) if super::is_unique_violation(&err) => Err(Error::FeedExists {
            url: url.to_string(),
        }),
        Err(err) => Err(err.into()),
    }
}

pub(crate) fn delete_feed(conn: &mut Connection, url: &str) -> Result<()> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    ensure_feed_exists(&tx, url)?;
    if changes::tracking_enabled(&tx)? {
        // Drop queued work for the feed, then queue index-row removal for
        // every entry that made it into the index.
        changes::delete_changes_for_feed(&tx, url)?;
        let sequenced = entry_sequences(&tx, url)?;
        for (id, seq) in sequenced {
            changes::enqueue_delete(&tx, url, &id, seq)?;
        }
    }
    tx.execute("DELETE FROM tags WHERE feed = ?1", params![url])?;
    tx.execute("DELETE FROM entries WHERE feed = ?1", params![url])?;
    tx.execute("DELETE FROM feeds WHERE url = ?1", params![url])?;
    tx.commit()?;
    Ok(())
}

pub(crate) fn change_feed_url(conn: &mut Connection, old: &str, new: &str) -> Result<()> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    ensure_feed_exists(&tx, old)?;

    let tracking = changes::tracking_enabled(&tx)?;
    if tracking {
        for (id, seq) in entry_sequences(&tx, old)? {
            changes::enqueue_delete(&tx, old, &id, seq)?;
        }
    }

    // Entries follow via ON UPDATE CASCADE. Retrieval state is reset so the
    // next update fetches the new location from scratch.
    let result = tx.execute(
        "UPDATE feeds SET url = ?1, updated = NULL, version = NULL, http_etag = NULL,
             http_last_modified = NULL, stale = 0, last_exception = NULL
         WHERE url = ?2",
        params![new, old],
    );
    match result {
        Ok(_) => {}
        Err(err) if super::is_unique_violation(&err) => {
            return Err(Error::FeedExists {
                url: new.to_string(),
            })
        }
        Err(err) => return Err(err.into()),
    }

    tx.execute(
        "UPDATE entries SET original_feed = COALESCE(original_feed, ?1) WHERE feed = ?2",
        params![old, new],
    )?;
    tx.execute(
        "UPDATE tags SET feed = ?1 WHERE feed = ?2",
        params![new, old],
    )?;

    if tracking {
        for (id, _) in entry_sequences(&tx, new)? {
            changes::enqueue_insert(&tx, new, &id)?;
        }
    }
    tx.commit()?;
    Ok(())
}

pub(crate) fn get_feed(conn: &Connection, url: &str) -> Result<Feed> {
    let sql = format!("SELECT {} FROM feeds WHERE feeds.url = ?1", FEED_COLUMNS);
    conn.query_row(&sql, params![url], feed_from_row)
        .optional()?
        .ok_or_else(|| Error::FeedNotFound {
            url: url.to_string(),
        })
}

pub(crate) fn get_feeds(
    conn: &Connection,
    filter: &FeedFilter,
    sort: FeedSort,
    limit: usize,
    starting_after: Option<&FeedCursor>,
) -> Result<Vec<Feed>> {
    if let Some(cursor) = starting_after {
        if cursor.sort != sort {
            return Err(Error::usage("feed cursor does not match the requested sort"));
        }
    }
    let mut q = Query::new("feeds");
    q.select(FEED_COLUMNS);
    apply_feed_filter(&mut q, filter);

    let (keys, cursor_values): (Vec<(&str, Dir)>, Option<Vec<Value>>) = match sort {
        FeedSort::Title => (
            vec![
                ("(feeds.title IS NULL)", Dir::Asc),
                ("lower(coalesce(feeds.title, ''))", Dir::Asc),
                ("feeds.url", Dir::Asc),
            ],
            starting_after.map(|c| {
                vec![
                    int(c.key_text.is_none() as i64),
                    text(c.key_text.clone().unwrap_or_default()),
                    text(c.url.clone()),
                ]
            }),
        ),
        FeedSort::UserTitle => (
            vec![
                ("(coalesce(feeds.user_title, feeds.title) IS NULL)", Dir::Asc),
                (
                    "lower(coalesce(feeds.user_title, feeds.title, ''))",
                    Dir::Asc,
                ),
                ("feeds.url", Dir::Asc),
            ],
            starting_after.map(|c| {
                vec![
                    int(c.key_text.is_none() as i64),
                    text(c.key_text.clone().unwrap_or_default()),
                    text(c.url.clone()),
                ]
            }),
        ),
        FeedSort::Added => (
            vec![("feeds.added", Dir::Desc), ("feeds.url", Dir::Asc)],
            starting_after.map(|c| vec![int(to_micros(c.added)), text(c.url.clone())]),
        ),
    };
    q.keyset(&keys, cursor_values);
    q.limit(limit);

    let (sql, sql_params) = q.into_parts();
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(rusqlite::params_from_iter(sql_params), feed_from_row)?;
    let mut feeds = Vec::new();
    for row in rows {
        feeds.push(row?);
    }
    Ok(feeds)
}

pub(crate) fn get_feed_counts(conn: &Connection, filter: &FeedFilter) -> Result<FeedCounts> {
    let mut q = Query::new("feeds");
    q.select("COUNT(*)")
        .select("COALESCE(SUM(CASE WHEN feeds.last_exception IS NOT NULL THEN 1 ELSE 0 END), 0)")
        .select("COALESCE(SUM(CASE WHEN feeds.updates_enabled = 1 THEN 1 ELSE 0 END), 0)");
    apply_feed_filter(&mut q, filter);
    let (sql, sql_params) = q.into_parts();
    let counts = conn.query_row(&sql, rusqlite::params_from_iter(sql_params), |row| {
        Ok(FeedCounts {
            total: row.get::<_, i64>(0)? as u64,
            broken: row.get::<_, i64>(1)? as u64,
            updates_enabled: row.get::<_, i64>(2)? as u64,
        })
    })?;
    Ok(counts)
}

pub(crate) fn set_feed_user_title(
    conn: &mut Connection,
    url: &str,
    title: Option<&str>,
) -> Result<()> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let updated = tx.execute(
        "UPDATE feeds SET user_title = ?1 WHERE url = ?2",
        params![title, url],
    )?;
    if updated == 0 {
        return Err(Error::FeedNotFound {
            url: url.to_string(),
        });
    }
    // The displayed feed title is part of the search index rows.
    if changes::tracking_enabled(&tx)? {
        for (id, _) in entry_sequences(&tx, url)? {
            changes::enqueue_insert(&tx, url, &id)?;
        }
    }
    tx.commit()?;
    Ok(())
}

pub(crate) fn set_feed_updates_enabled(
    conn: &Connection,
    url: &str,
    enabled: bool,
) -> Result<()> {
    let updated = conn.execute(
        "UPDATE feeds SET updates_enabled = ?1 WHERE url = ?2",
        params![enabled as i64, url],
    )?;
    if updated == 0 {
        return Err(Error::FeedNotFound {
            url: url.to_string(),
        });
    }
    Ok(())
}

pub(crate) fn set_feed_update_after(
    conn: &Connection,
    url: &str,
    after: Option<DateTime<Utc>>,
) -> Result<()> {
    let updated = conn.execute(
        "UPDATE feeds SET update_after = ?1 WHERE url = ?2",
        params![opt_to_micros(after), url],
    )?;
    if updated == 0 {
        return Err(Error::FeedNotFound {
            url: url.to_string(),
        });
    }
    Ok(())
}

pub(crate) fn mark_feed_stale(conn: &Connection, url: &str) -> Result<()> {
    let updated = conn.execute("UPDATE feeds SET stale = 1 WHERE url = ?1", params![url])?;
    if updated == 0 {
        return Err(Error::FeedNotFound {
            url: url.to_string(),
        });
    }
    Ok(())
}

pub(crate) fn get_feeds_for_update(
    conn: &Connection,
    select: &UpdateSelect,
    now: DateTime<Utc>,
) -> Result<Vec<FeedForUpdate>> {
    let mut q = Query::new("feeds");
    q.select("feeds.url")
        .select("feeds.http_etag")
        .select("feeds.http_last_modified")
        .select("feeds.stale")
        .select("feeds.last_updated IS NULL");
    if select.scheduled_only {
        q.filter("feeds.updates_enabled = 1");
        q.filter_with(
            "feeds.update_after IS NULL OR feeds.update_after <= ?",
            [int(to_micros(now))],
        );
    }
    if let Some(feed) = &select.feed {
        q.filter_with("feeds.url = ?", [text(feed.clone())]);
    }
    match select.new {
        Some(true) => {
            q.filter("feeds.last_updated IS NULL");
        }
        Some(false) => {
            q.filter("feeds.last_updated IS NOT NULL");
        }
        None => {}
    }
    q.order("feeds.url ASC");

    let (sql, sql_params) = q.into_parts();
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(rusqlite::params_from_iter(sql_params), |row| {
        Ok(FeedForUpdate {
            url: row.get(0)?,
            caching: CachingTokens {
                etag: row.get(1)?,
                last_modified: row.get(2)?,
            },
            stale: row.get::<_, i64>(3)? != 0,
            first_fetch: row.get::<_, i64>(4)? != 0,
        })
    })?;
    let mut feeds = Vec::new();
    for row in rows {
        feeds.push(row?);
    }
    Ok(feeds)
}

/// Stamp a retrieval attempt that ended in `304 Not Modified`.
pub(crate) fn record_not_modified(
    conn: &Connection,
    url: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "UPDATE feeds SET last_retrieved = ?1 WHERE url = ?2",
        params![to_micros(now), url],
    )?;
    Ok(())
}

/// Stamp a failed retrieval or parse.
pub(crate) fn record_update_failure(
    conn: &Connection,
    url: &str,
    exception: &ExceptionInfo,
    now: DateTime<Utc>,
) -> Result<()> {
    let serialized = serde_json::to_string(exception)
        .map_err(|e| Error::storage(format!("serializing last_exception: {}", e)))?;
    conn.execute(
        "UPDATE feeds SET last_exception = ?1, last_retrieved = ?2 WHERE url = ?3",
        params![serialized, to_micros(now), url],
    )?;
    Ok(())
}

pub(crate) fn apply_feed_filter(q: &mut Query, filter: &FeedFilter) {
    if let Some(feed) = &filter.feed {
        q.filter_with("feeds.url = ?", [text(feed.clone())]);
    }
    if let Some((clause, params)) = tag_filter_clause(&filter.tags, "feeds.url", "''") {
        q.filter(clause);
        for p in params {
            q.param(p);
        }
    }
    match filter.broken {
        Some(true) => {
            q.filter("feeds.last_exception IS NOT NULL");
        }
        Some(false) => {
            q.filter("feeds.last_exception IS NULL");
        }
        None => {}
    }
    if let Some(enabled) = filter.updates_enabled {
        q.filter_with("feeds.updates_enabled = ?", [int(enabled as i64)]);
    }
    match filter.new {
        Some(true) => {
            q.filter("feeds.last_updated IS NULL");
        }
        Some(false) => {
            q.filter("feeds.last_updated IS NOT NULL");
        }
        None => {}
    }
}

pub(crate) fn ensure_feed_exists(conn: &Connection, url: &str) -> Result<()> {
    let exists: i64 = conn.query_row(
        "SELECT EXISTS (SELECT 1 FROM feeds WHERE url = ?1)",
        params![url],
        |r| r.get(0),
    )?;
    if exists == 0 {
        return Err(Error::FeedNotFound {
            url: url.to_string(),
        });
    }
    Ok(())
}

/// `(entry_id, sequence)` for every indexed entry of a feed.
fn entry_sequences(conn: &Connection, url: &str) -> Result<Vec<(String, i64)>> {
    let mut stmt = conn.prepare(
        "SELECT id, sequence FROM entries WHERE feed = ?1 AND sequence IS NOT NULL ORDER BY id",
    )?;
    let rows = stmt.query_map(params![url], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
    })?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

fn feed_from_row(row: &Row<'_>) -> rusqlite::Result<Feed> {
    let last_exception: Option<String> = row.get(15)?;
    let last_exception = last_exception.and_then(|raw| {
        serde_json::from_str::<ExceptionInfo>(&raw)
            .map_err(|e| warn!("malformed last_exception: {}", e))
            .ok()
    });
    Ok(Feed {
        url: row.get(0)?,
        title: row.get(1)?,
        link: row.get(2)?,
        updated: row_opt_micros(row, 3)?,
        author: row.get(4)?,
        subtitle: row.get(5)?,
        version: row.get(6)?,
        user_title: row.get(7)?,
        caching: CachingTokens {
            etag: row.get(8)?,
            last_modified: row.get(9)?,
        },
        stale: row.get::<_, i64>(10)? != 0,
        updates_enabled: row.get::<_, i64>(11)? != 0,
        added: row_micros(row, 12)?,
        last_updated: row_opt_micros(row, 13)?,
        last_retrieved: row_opt_micros(row, 14)?,
        last_exception,
        update_after: row_opt_micros(row, 16)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::schema::open_memory;

    #[test]
    fn test_add_feed_twice() {
        let conn = open_memory();
        let now = Utc::now();
        add_feed(&conn, "https://example.com/a.xml", now).unwrap();
        let err = add_feed(&conn, "https://example.com/a.xml", now).unwrap_err();
        assert!(matches!(err, Error::FeedExists { .. }));
    }

    #[test]
    fn test_get_feed_missing() {
        let conn = open_memory();
        let err = get_feed(&conn, "https://example.com/missing.xml").unwrap_err();
        assert!(matches!(err, Error::FeedNotFound { .. }));
    }

    #[test]
    fn test_title_sort_nulls_last() {
        let conn = open_memory();
        let now = Utc::now();
        add_feed(&conn, "https://example.com/b.xml", now).unwrap();
        add_feed(&conn, "https://example.com/a.xml", now).unwrap();
        add_feed(&conn, "https://example.com/c.xml", now).unwrap();
        conn.execute(
            "UPDATE feeds SET title = 'Beta' WHERE url = 'https://example.com/b.xml'",
            [],
        )
        .unwrap();
        conn.execute(
            "UPDATE feeds SET title = 'alpha' WHERE url = 'https://example.com/a.xml'",
            [],
        )
        .unwrap();

        let feeds = get_feeds(&conn, &FeedFilter::default(), FeedSort::Title, 10, None).unwrap();
        let urls: Vec<&str> = feeds.iter().map(|f| f.url.as_str()).collect();
        assert_eq!(
            urls,
            [
                "https://example.com/a.xml",
                "https://example.com/b.xml",
                "https://example.com/c.xml",
            ]
        );
    }

    #[test]
    fn test_feed_pagination_no_gaps() {
        let conn = open_memory();
        let now = Utc::now();
        for i in 0..7 {
            add_feed(&conn, &format!("https://example.com/{}.xml", i), now).unwrap();
        }

        let mut seen = Vec::new();
        let mut cursor: Option<FeedCursor> = None;
        loop {
            let page = get_feeds(
                &conn,
                &FeedFilter::default(),
                FeedSort::Title,
                3,
                cursor.as_ref(),
            )
            .unwrap();
            if page.is_empty() {
                break;
            }
            cursor = Some(page.last().unwrap().cursor(FeedSort::Title));
            seen.extend(page.into_iter().map(|f| f.url));
        }
        assert_eq!(seen.len(), 7);
        seen.dedup();
        assert_eq!(seen.len(), 7);
    }

    #[test]
    fn test_update_selection_respects_schedule() {
        let conn = open_memory();
        let now = Utc::now();
        add_feed(&conn, "https://example.com/on.xml", now).unwrap();
        add_feed(&conn, "https://example.com/off.xml", now).unwrap();
        add_feed(&conn, "https://example.com/later.xml", now).unwrap();
        set_feed_updates_enabled(&conn, "https://example.com/off.xml", false).unwrap();
        set_feed_update_after(
            &conn,
            "https://example.com/later.xml",
            Some(now + chrono::Duration::hours(1)),
        )
        .unwrap();

        let select = UpdateSelect {
            scheduled_only: true,
            ..Default::default()
        };
        let feeds = get_feeds_for_update(&conn, &select, now).unwrap();
        let urls: Vec<&str> = feeds.iter().map(|f| f.url.as_str()).collect();
        assert_eq!(urls, ["https://example.com/on.xml"]);
        assert!(feeds[0].first_fetch);
    }

    #[test]
    fn test_delete_feed_removes_tags() {
        let mut conn = open_memory();
        let now = Utc::now();
        add_feed(&conn, "f", now).unwrap();
        crate::storage::tags::set_tag(
            &conn,
            crate::types::ResourceId::Feed("f"),
            "k",
            &serde_json::json!(1),
        )
        .unwrap();

        delete_feed(&mut conn, "f").unwrap();
        let tag_count: i64 = conn
            .query_row("SELECT COUNT(*) FROM tags", [], |r| r.get(0))
            .unwrap();
        assert_eq!(tag_count, 0);
        assert!(matches!(
            get_feed(&conn, "f").unwrap_err(),
            Error::FeedNotFound { .. }
        ));
    }

    #[test]
    fn test_record_update_failure_sets_broken() {
        let conn = open_memory();
        let now = Utc::now();
        add_feed(&conn, "f", now).unwrap();
        let info = ExceptionInfo {
            kind: "PARSE".to_string(),
            message: "HTTP 503".to_string(),
            http_status: Some(503),
        };
        record_update_failure(&conn, "f", &info, now).unwrap();

        let feed = get_feed(&conn, "f").unwrap();
        assert!(feed.is_broken());
        assert_eq!(feed.last_exception.unwrap().http_status, Some(503));

        let counts = get_feed_counts(
            &conn,
            &FeedFilter {
                broken: Some(true),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(counts.total, 1);
    }
}
