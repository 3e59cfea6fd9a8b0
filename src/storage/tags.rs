//! Generic key/value tags over global, feed, and entry resources.
//!
//! Scope columns use `''` for absent components so the composite primary
//! key stays enforceable. Values are JSON text.

use rusqlite::types::Value;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{Error, Result};
use crate::types::{ResourceId, TagCond, TagFilter};

use super::query::text;

pub(crate) fn set_tag(
    conn: &Connection,
    resource: ResourceId<'_>,
    key: &str,
    value: &serde_json::Value,
) -> Result<()> {
    ensure_resource_exists(conn, resource)?;
    let (feed, entry) = resource.scope();
    let serialized = value.to_string();
    conn.execute(
        "INSERT INTO tags (feed, entry_id, key, value) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT (feed, entry_id, key) DO UPDATE SET value = excluded.value",
        params![feed, entry, key, serialized],
    )?;
    Ok(())
}

pub(crate) fn get_tag(
    conn: &Connection,
    resource: ResourceId<'_>,
    key: &str,
) -> Result<serde_json::Value> {
    let (feed, entry) = resource.scope();
    let raw: Option<String> = conn
        .query_row(
            "SELECT value FROM tags WHERE feed = ?1 AND entry_id = ?2 AND key = ?3",
            params![feed, entry, key],
            |r| r.get(0),
        )
        .optional()?;
    let raw = raw.ok_or_else(|| Error::TagNotFound {
        name: key.to_string(),
    })?;
    serde_json::from_str(&raw)
        .map_err(|e| Error::storage(format!("malformed tag value for {}: {}", key, e)))
}

pub(crate) fn get_tags(
    conn: &Connection,
    resource: ResourceId<'_>,
) -> Result<Vec<(String, serde_json::Value)>> {
    let (feed, entry) = resource.scope();
    let mut stmt = conn.prepare(
        "SELECT key, value FROM tags WHERE feed = ?1 AND entry_id = ?2 ORDER BY key",
    )?;
    let rows = stmt.query_map(params![feed, entry], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;
    let mut tags = Vec::new();
    for row in rows {
        let (key, raw) = row?;
        let value = serde_json::from_str(&raw)
            .map_err(|e| Error::storage(format!("malformed tag value for {}: {}", key, e)))?;
        tags.push((key, value));
    }
    Ok(tags)
}

pub(crate) fn get_tag_keys(conn: &Connection, resource: ResourceId<'_>) -> Result<Vec<String>> {
    let (feed, entry) = resource.scope();
    let mut stmt = conn
        .prepare("SELECT key FROM tags WHERE feed = ?1 AND entry_id = ?2 ORDER BY key")?;
    let rows = stmt.query_map(params![feed, entry], |row| row.get::<_, String>(0))?;
    let mut keys = Vec::new();
    for row in rows {
        keys.push(row?);
    }
    Ok(keys)
}

pub(crate) fn delete_tag(conn: &Connection, resource: ResourceId<'_>, key: &str) -> Result<()> {
    let (feed, entry) = resource.scope();
    let deleted = conn.execute(
        "DELETE FROM tags WHERE feed = ?1 AND entry_id = ?2 AND key = ?3",
        params![feed, entry, key],
    )?;
    if deleted == 0 {
        return Err(Error::TagNotFound {
            name: key.to_string(),
        });
    }
    Ok(())
}

fn ensure_resource_exists(conn: &Connection, resource: ResourceId<'_>) -> Result<()> {
    match resource {
        ResourceId::Global => Ok(()),
        ResourceId::Feed(url) => {
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
        ResourceId::Entry(url, id) => {
            let exists: i64 = conn.query_row(
                "SELECT EXISTS (SELECT 1 FROM entries WHERE feed = ?1 AND id = ?2)",
                params![url, id],
                |r| r.get(0),
            )?;
            if exists == 0 {
                return Err(Error::EntryNotFound {
                    feed_url: url.to_string(),
                    entry_id: id.to_string(),
                });
            }
            Ok(())
        }
    }
}

/// Compile a DNF tag filter into one WHERE fragment over correlated
/// existence subqueries.
///
/// `feed_expr` and `entry_expr` are the SQL expressions the tag scope
/// columns are matched against (for feed tags of an entries query:
/// `entries.feed` and `''`).
pub(crate) fn tag_filter_clause(
    filter: &TagFilter,
    feed_expr: &str,
    entry_expr: &str,
) -> Option<(String, Vec<Value>)> {
    if filter.is_empty() {
        return None;
    }
    let base = format!(
        "SELECT 1 FROM tags WHERE tags.feed = {} AND tags.entry_id = {}",
        feed_expr, entry_expr
    );
    let mut params = Vec::new();
    let mut clauses = Vec::new();
    for conds in &filter.0 {
        if conds.is_empty() {
            continue;
        }
        let mut literals = Vec::new();
        for cond in conds {
            match cond {
                TagCond::Has(name) => {
                    literals.push(format!("EXISTS ({} AND tags.key = ?)", base));
                    params.push(text(name.clone()));
                }
                TagCond::NotHas(name) => {
                    literals.push(format!("NOT EXISTS ({} AND tags.key = ?)", base));
                    params.push(text(name.clone()));
                }
                TagCond::AnySet => literals.push(format!("EXISTS ({})", base)),
                TagCond::NoneSet => literals.push(format!("NOT EXISTS ({})", base)),
            }
        }
        clauses.push(format!("({})", literals.join(" AND ")));
    }
    if clauses.is_empty() {
        return None;
    }
    Some((clauses.join(" OR "), params))
}
