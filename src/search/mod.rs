//! Full-text search over entries, kept in sync with stored content through
//! the change log.
//!
//! The index is an FTS5 table rebuilt row-by-row: `update_search` drains
//! pending changes in chunks under short transactions, recomputing one
//! entry's searchable text per INSERT change and deleting rows by sequence
//! for DELETE changes, so an interrupted drain resumes where it stopped.

pub(crate) mod text;

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::storage::changes::{self, Change, ChangeAction};
use crate::storage::entries::{
    apply_entry_filter, counts_from_row, entry_cursor_values, push_count_selects,
    recent_sort_keys,
};
use crate::storage::query::{text as sql_text, Query};
use crate::types::{
    Content, EntryCounts, EntryCursor, EntryFilter, EntrySearchResult, HighlightedString,
    SearchSort,
};

pub(crate) const HIGHLIGHT_START: char = '\u{1}';
pub(crate) const HIGHLIGHT_END: char = '\u{2}';

/// Changes drained per transaction.
const DRAIN_CHUNK: usize = 128;

pub(crate) fn is_enabled(conn: &Connection) -> Result<bool> {
    changes::tracking_enabled(conn)
}

/// Create the index schema and queue a full backfill.
pub(crate) fn enable(conn: &mut Connection) -> Result<()> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    if changes::tracking_enabled(&tx)? {
        tx.commit()?;
        return Ok(());
    }
    tx.execute_batch(
        "CREATE VIRTUAL TABLE search_entries USING fts5(
            title,
            content,
            feed,
            author,
            feed_url UNINDEXED,
            id UNINDEXED,
            seq UNINDEXED,
            tokenize = 'porter unicode61'
        );",
    )?;
    let mut stmt = tx.prepare("SELECT feed, id FROM entries ORDER BY feed, id")?;
    let keys: Vec<(String, String)> = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<rusqlite::Result<_>>()?;
    drop(stmt);
    let backfill = keys.len();
    for (feed_url, id) in keys {
        changes::enqueue_insert(&tx, &feed_url, &id)?;
    }
    tx.commit()?;
    debug!(backfill, "search enabled");
    Ok(())
}

/// Drop the index schema and all pending changes.
pub(crate) fn disable(conn: &mut Connection) -> Result<()> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    tx.execute_batch("DROP TABLE IF EXISTS search_entries;")?;
    changes::delete_all_changes(&tx)?;
    tx.execute("UPDATE entries SET sequence = NULL", [])?;
    tx.commit()?;
    debug!("search disabled");
    Ok(())
}

/// Drain the whole change log. Idempotent; safe to re-run after an
/// interruption.
pub(crate) fn update(conn: &mut Connection) -> Result<()> {
    if !is_enabled(conn)? {
        return Err(Error::SearchNotEnabled);
    }
    let mut total = 0usize;
    loop {
        let processed = drain_chunk(conn)?;
        if processed == 0 {
            break;
        }
        total += processed;
    }
    debug!(changes = total, "search update done");
    Ok(())
}

fn drain_chunk(conn: &mut Connection) -> Result<usize> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let batch = changes::get_changes(&tx, DRAIN_CHUNK)?;
    if batch.is_empty() {
        return Ok(0);
    }
    for change in &batch {
        apply_change(&tx, change)?;
        changes::delete_change(&tx, change)?;
    }
    let processed = batch.len();
    tx.commit()?;
    Ok(processed)
}

fn apply_change(conn: &Connection, change: &Change) -> Result<()> {
    match change.action {
        ChangeAction::Delete => {
            // Sequence-matched so a newer insert for the same key survives.
            conn.execute(
                "DELETE FROM search_entries WHERE feed_url = ?1 AND id = ?2 AND seq = ?3",
                params![change.feed_url, change.entry_id, change.seq],
            )?;
        }
        ChangeAction::Insert => {
            let row: Option<(Option<String>, Option<String>, String, Option<String>, Option<i64>, Option<String>, Option<String>)> =
                conn.query_row(
                    "SELECT entries.title, entries.summary, entries.content, entries.author,
                            entries.sequence, feeds.title, feeds.user_title
                     FROM entries JOIN feeds ON feeds.url = entries.feed
                     WHERE entries.feed = ?1 AND entries.id = ?2",
                    params![change.feed_url, change.entry_id],
                    |r| {
                        Ok((
                            r.get(0)?,
                            r.get(1)?,
                            r.get(2)?,
                            r.get(3)?,
                            r.get(4)?,
                            r.get(5)?,
                            r.get(6)?,
                        ))
                    },
                )
                .optional()?;
            let Some((title, summary, content, author, sequence, feed_title, feed_user_title)) =
                row
            else {
                // Entry went away after the change was queued; its DELETE
                // change cleans the index.
                trace!(feed = %change.feed_url, id = %change.entry_id, "insert change for missing entry");
                return Ok(());
            };
            if sequence != Some(change.seq) {
                // Superseded by a newer change for the same entry.
                return Ok(());
            }
            let content: Vec<Content> = serde_json::from_str(&content)
                .map_err(|e| Error::storage(format!("malformed content column: {}", e)))?;
            let content_text = searchable_content(&content, summary.as_deref());
            let title_text = title.as_deref().map(text::sanitize).unwrap_or_default();
            let feed_text = feed_user_title
                .as_deref()
                .or(feed_title.as_deref())
                .map(text::sanitize)
                .unwrap_or_default();
            let author_text = author.as_deref().map(text::sanitize).unwrap_or_default();

            conn.execute(
                "DELETE FROM search_entries WHERE feed_url = ?1 AND id = ?2",
                params![change.feed_url, change.entry_id],
            )?;
            conn.execute(
                "INSERT INTO search_entries (title, content, feed, author, feed_url, id, seq)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    title_text,
                    content_text,
                    feed_text,
                    author_text,
                    change.feed_url,
                    change.entry_id,
                    change.seq,
                ],
            )?;
        }
    }
    Ok(())
}

/// Content blocks joined into one sanitized blob; summary stands in when a
/// feed only ships descriptions.
fn searchable_content(content: &[Content], summary: Option<&str>) -> String {
    let mut parts: Vec<String> = content
        .iter()
        .map(|c| text::sanitize(&c.value))
        .filter(|t| !t.is_empty())
        .collect();
    if parts.is_empty() {
        if let Some(summary) = summary {
            let sanitized = text::sanitize(summary);
            if !sanitized.is_empty() {
                parts.push(sanitized);
            }
        }
    }
    parts.join(" ")
}

pub(crate) fn search(
    conn: &Connection,
    query: &str,
    filter: &EntryFilter,
    sort: SearchSort,
    limit: usize,
    starting_after: Option<&EntryCursor>,
) -> Result<Vec<EntrySearchResult>> {
    if !is_enabled(conn)? {
        return Err(Error::SearchNotEnabled);
    }
    // The FTS match runs in a CTE so the highlight/rank auxiliaries stay in
    // FTS context while the outer query joins the regular filter surface.
    let mut q = Query::new("matched");
    q.with_cte(
        "matched",
        "SELECT feed_url, id, bm25(search_entries) AS rank, \
         highlight(search_entries, 0, ?, ?) AS h_title, \
         highlight(search_entries, 1, ?, ?) AS h_content, \
         highlight(search_entries, 2, ?, ?) AS h_feed, \
         highlight(search_entries, 3, ?, ?) AS h_author \
         FROM search_entries WHERE search_entries MATCH ?",
    );
    for _ in 0..4 {
        q.param(sql_text(HIGHLIGHT_START.to_string()));
        q.param(sql_text(HIGHLIGHT_END.to_string()));
    }
    q.param(sql_text(query));
    q.select("matched.feed_url")
        .select("matched.id")
        .select("matched.rank")
        .select("matched.h_title")
        .select("matched.h_content")
        .select("matched.h_feed")
        .select("matched.h_author");
    q.join("JOIN entries ON entries.feed = matched.feed_url AND entries.id = matched.id");
    apply_entry_filter(&mut q, filter);
    match sort {
        SearchSort::Relevance => {
            if starting_after.is_some() {
                return Err(Error::usage(
                    "relevance-sorted search cannot be paginated; use recent",
                ));
            }
            q.order("matched.rank ASC")
                .order("matched.feed_url ASC")
                .order("matched.id ASC");
        }
        SearchSort::Recent => {
            q.keyset(recent_sort_keys(), starting_after.map(entry_cursor_values));
        }
    }
    q.limit(limit);

    let (sql, sql_params) = q.into_parts();
    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| map_query_error(e, query))?;
    let rows = stmt.query_map(rusqlite::params_from_iter(sql_params), |row| {
        Ok(EntrySearchResult {
            feed_url: row.get(0)?,
            id: row.get(1)?,
            score: -row.get::<_, f64>(2)?,
            title: highlight_from_row(row, 3)?,
            content: highlight_from_row(row, 4)?,
            feed_title: highlight_from_row(row, 5)?,
            author: highlight_from_row(row, 6)?,
        })
    });
    let rows = match rows {
        Ok(rows) => rows,
        Err(e) => return Err(map_query_error(e, query)),
    };
    let mut results = Vec::new();
    for row in rows {
        results.push(row.map_err(|e| map_query_error(e, query))?);
    }
    Ok(results)
}

pub(crate) fn search_counts(
    conn: &Connection,
    query: &str,
    filter: &EntryFilter,
    now: chrono::DateTime<chrono::Utc>,
) -> Result<EntryCounts> {
    if !is_enabled(conn)? {
        return Err(Error::SearchNotEnabled);
    }
    let mut q = Query::new("search_entries");
    push_count_selects(&mut q, now);
    q.join("JOIN entries ON entries.feed = search_entries.feed_url AND entries.id = search_entries.id");
    q.filter_with("search_entries MATCH ?", [sql_text(query)]);
    apply_entry_filter(&mut q, filter);

    let (sql, sql_params) = q.into_parts();
    conn.query_row(&sql, rusqlite::params_from_iter(sql_params), counts_from_row)
        .map_err(|e| map_query_error(e, query))
}

fn highlight_from_row(
    row: &rusqlite::Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<HighlightedString>> {
    let marked: Option<String> = row.get(idx)?;
    Ok(marked.filter(|m| !m.is_empty()).map(|m| {
        HighlightedString::from_marked(&m, HIGHLIGHT_START, HIGHLIGHT_END)
    }))
}

/// Surface FTS5 query-syntax failures as user errors, everything else as
/// storage errors.
fn map_query_error(err: rusqlite::Error, query: &str) -> Error {
    let message = err.to_string();
    let is_syntax = message.contains("fts5: syntax error")
        || message.contains("unknown special query")
        || message.contains("unterminated string")
        || message.contains("malformed MATCH")
        || message.contains("no such column")
        || message.contains("fts5: phrase");
    if is_syntax {
        Error::InvalidSearchQuery {
            message: format!("{:?}: {}", query, message),
        }
    } else {
        err.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::entries::{
        apply_feed_update, delete_entry, EntryOp, EntryOpKind, FeedUpdateIntent,
    };
    use crate::storage::feeds::add_feed;
    use crate::storage::schema::open_memory;
    use crate::types::{CachingTokens, EntryData, FeedData};
    use chrono::Utc;

    fn seed(conn: &mut Connection, url: &str, entries: Vec<EntryData>) {
        let now = Utc::now();
        add_feed(conn, url, now).unwrap();
        let ops = entries
            .into_iter()
            .enumerate()
            .map(|(i, data)| EntryOp {
                hash: vec![i as u8],
                feed_order: i as i64,
                kind: EntryOpKind::New,
                data,
            })
            .collect();
        apply_feed_update(
            conn,
            FeedUpdateIntent {
                url: url.to_string(),
                feed: FeedData {
                    title: Some("Example Feed".to_string()),
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

    fn entry(id: &str, title: &str, content: &str) -> EntryData {
        EntryData {
            id: id.to_string(),
            title: Some(title.to_string()),
            content: vec![Content {
                value: content.to_string(),
                media_type: Some("text/html".to_string()),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_search_requires_enable() {
        let conn = open_memory();
        let err = search(
            &conn,
            "anything",
            &EntryFilter::default(),
            SearchSort::Relevance,
            10,
            None,
        )
        .unwrap_err();
        assert!(matches!(err, Error::SearchNotEnabled));
    }

    #[test]
    fn test_enable_backfills_and_finds() {
        let mut conn = open_memory();
        seed(
            &mut conn,
            "f",
            vec![
                entry("e1", "Rust ownership", "<p>The borrow checker at work.</p>"),
                entry("e2", "Gardening", "<p>Tomatoes and peppers.</p>"),
            ],
        );
        enable(&mut conn).unwrap();
        update(&mut conn).unwrap();

        let results = search(
            &conn,
            "borrow",
            &EntryFilter::default(),
            SearchSort::Relevance,
            10,
            None,
        )
        .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, "e1");
        assert!(results[0].score.is_finite());
        let content = results[0].content.as_ref().unwrap();
        assert_eq!(content.highlighted().collect::<Vec<_>>(), vec!["borrow"]);
    }

    #[test]
    fn test_title_highlight_ranges() {
        let mut conn = open_memory();
        seed(&mut conn, "f", vec![entry("e2", "kw in the title", "<p>nothing else</p>")]);
        enable(&mut conn).unwrap();
        update(&mut conn).unwrap();

        let results = search(
            &conn,
            "kw",
            &EntryFilter::default(),
            SearchSort::Relevance,
            10,
            None,
        )
        .unwrap();
        assert_eq!(results.len(), 1);
        let title = results[0].title.as_ref().unwrap();
        assert_eq!(title.value, "kw in the title");
        assert_eq!(title.highlights, vec![0..2]);
    }

    #[test]
    fn test_update_is_idempotent_and_tracks_deletes() {
        let mut conn = open_memory();
        seed(&mut conn, "f", vec![entry("e1", "target words", "<p>body</p>")]);
        enable(&mut conn).unwrap();
        update(&mut conn).unwrap();
        update(&mut conn).unwrap();

        delete_entry(&mut conn, "f", "e1").unwrap();
        update(&mut conn).unwrap();

        let results = search(
            &conn,
            "target",
            &EntryFilter::default(),
            SearchSort::Relevance,
            10,
            None,
        )
        .unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn test_disable_clears_state() {
        let mut conn = open_memory();
        seed(&mut conn, "f", vec![entry("e1", "t", "c")]);
        enable(&mut conn).unwrap();
        disable(&mut conn).unwrap();
        assert!(!is_enabled(&conn).unwrap());
        let pending = changes::get_changes(&conn, 10).unwrap();
        assert!(pending.is_empty());
    }

    #[test]
    fn test_invalid_query_is_user_error() {
        let mut conn = open_memory();
        seed(&mut conn, "f", vec![entry("e1", "t", "c")]);
        enable(&mut conn).unwrap();
        update(&mut conn).unwrap();

        let err = search(
            &conn,
            "AND AND (",
            &EntryFilter::default(),
            SearchSort::Relevance,
            10,
            None,
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidSearchQuery { .. }));
    }

    #[test]
    fn test_search_honors_entry_filters() {
        let mut conn = open_memory();
        seed(
            &mut conn,
            "f",
            vec![
                entry("e1", "shared words", "one"),
                entry("e2", "shared words", "two"),
            ],
        );
        enable(&mut conn).unwrap();
        update(&mut conn).unwrap();
        crate::storage::entries::set_entry_read(&conn, "f", "e1", true, Utc::now()).unwrap();

        let filter = EntryFilter {
            read: Some(false),
            ..Default::default()
        };
        let results = search(&conn, "shared", &filter, SearchSort::Relevance, 10, None).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, "e2");

        let counts = search_counts(&conn, "shared", &EntryFilter::default(), Utc::now()).unwrap();
        assert_eq!(counts.total, 2);
        assert_eq!(counts.read, 1);
    }

    #[test]
    fn test_feed_title_indexed() {
        let mut conn = open_memory();
        seed(&mut conn, "f", vec![entry("e1", "plain", "plain")]);
        enable(&mut conn).unwrap();
        update(&mut conn).unwrap();

        let results = search(
            &conn,
            "example",
            &EntryFilter::default(),
            SearchSort::Relevance,
            10,
            None,
        )
        .unwrap();
        assert_eq!(results.len(), 1);
        let feed_title = results[0].feed_title.as_ref().unwrap();
        assert_eq!(feed_title.highlighted().collect::<Vec<_>>(), vec!["Example"]);
    }
}
