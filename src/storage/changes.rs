//! Append-only change log driving incremental search index updates.
//!
//! Rows are only written while the search index exists. Each searchable
//! mutation of an entry takes a fresh sequence number from the singleton
//! counter; the entry row remembers its latest sequence so the drain can
//! tell superseded changes from current ones.

use rusqlite::{params, Connection};

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChangeAction {
    Insert = 1,
    Delete = 2,
}

impl ChangeAction {
    fn from_i64(value: i64) -> Option<Self> {
        match value {
            1 => Some(ChangeAction::Insert),
            2 => Some(ChangeAction::Delete),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Change {
    pub(crate) seq: i64,
    pub(crate) feed_url: String,
    pub(crate) entry_id: String,
    pub(crate) action: ChangeAction,
}

/// Whether the search index (and with it change tracking) is on.
pub(crate) fn tracking_enabled(conn: &Connection) -> Result<bool> {
    let exists: i64 = conn.query_row(
        "SELECT EXISTS (SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'search_entries')",
        [],
        |r| r.get(0),
    )?;
    Ok(exists != 0)
}

pub(crate) fn next_sequence(conn: &Connection) -> Result<i64> {
    let seq: i64 = conn.query_row(
        "UPDATE sequences SET value = value + 1 WHERE id = 0 RETURNING value",
        [],
        |r| r.get(0),
    )?;
    Ok(seq)
}

/// Record that an entry's searchable content changed: assign it a fresh
/// sequence and queue an INSERT change. Returns the new sequence.
pub(crate) fn enqueue_insert(conn: &Connection, feed_url: &str, entry_id: &str) -> Result<i64> {
    let seq = next_sequence(conn)?;
    conn.execute(
        "UPDATE entries SET sequence = ?1 WHERE feed = ?2 AND id = ?3",
        params![seq, feed_url, entry_id],
    )?;
    conn.execute(
        "INSERT OR IGNORE INTO changes (seq, feed, id, action) VALUES (?1, ?2, ?3, ?4)",
        params![seq, feed_url, entry_id, ChangeAction::Insert as i64],
    )?;
    Ok(seq)
}

/// Queue removal of the index row that `seq` produced.
pub(crate) fn enqueue_delete(
    conn: &Connection,
    feed_url: &str,
    entry_id: &str,
    seq: i64,
) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO changes (seq, feed, id, action) VALUES (?1, ?2, ?3, ?4)",
        params![seq, feed_url, entry_id, ChangeAction::Delete as i64],
    )?;
    Ok(())
}

pub(crate) fn get_changes(conn: &Connection, limit: usize) -> Result<Vec<Change>> {
    let mut stmt = conn.prepare(
        "SELECT seq, feed, id, action FROM changes ORDER BY seq, feed, id, action LIMIT ?1",
    )?;
    let rows = stmt.query_map(params![limit as i64], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, i64>(3)?,
        ))
    })?;
    let mut changes = Vec::new();
    for row in rows {
        let (seq, feed_url, entry_id, action) = row?;
        // Unknown actions would mean a corrupt log; skip them on drain.
        if let Some(action) = ChangeAction::from_i64(action) {
            changes.push(Change {
                seq,
                feed_url,
                entry_id,
                action,
            });
        }
    }
    Ok(changes)
}

pub(crate) fn delete_change(conn: &Connection, change: &Change) -> Result<()> {
    conn.execute(
        "DELETE FROM changes WHERE seq = ?1 AND feed = ?2 AND id = ?3 AND action = ?4",
        params![
            change.seq,
            change.feed_url,
            change.entry_id,
            change.action as i64
        ],
    )?;
    Ok(())
}

pub(crate) fn delete_changes_for_feed(conn: &Connection, feed_url: &str) -> Result<()> {
    conn.execute("DELETE FROM changes WHERE feed = ?1", params![feed_url])?;
    Ok(())
}

pub(crate) fn delete_all_changes(conn: &Connection) -> Result<()> {
    conn.execute("DELETE FROM changes", [])?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::schema::open_memory;

    #[test]
    fn test_sequences_are_monotonic() {
        let conn = open_memory();
        let a = next_sequence(&conn).unwrap();
        let b = next_sequence(&conn).unwrap();
        assert!(b > a);
    }

    #[test]
    fn test_enqueue_and_drain_order() {
        let conn = open_memory();
        enqueue_delete(&conn, "f", "e2", 7).unwrap();
        enqueue_delete(&conn, "f", "e1", 3).unwrap();

        let changes = get_changes(&conn, 10).unwrap();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].seq, 3);
        assert_eq!(changes[1].seq, 7);

        delete_change(&conn, &changes[0]).unwrap();
        let changes = get_changes(&conn, 10).unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].seq, 7);
    }

    #[test]
    fn test_enqueue_is_idempotent() {
        let conn = open_memory();
        enqueue_delete(&conn, "f", "e", 1).unwrap();
        enqueue_delete(&conn, "f", "e", 1).unwrap();
        assert_eq!(get_changes(&conn, 10).unwrap().len(), 1);
    }

    #[test]
    fn test_tracking_disabled_without_index() {
        let conn = open_memory();
        assert!(!tracking_enabled(&conn).unwrap());
    }
}
