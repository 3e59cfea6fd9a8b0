//! Schema bootstrap and forward migrations.
//!
//! The schema version lives in `PRAGMA user_version`; `PRAGMA
//! application_id` is stamped so foreign databases are refused instead of
//! silently migrated.

use rusqlite::Connection;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// "FDST" stamped into `PRAGMA application_id`.
pub(crate) const APPLICATION_ID: i64 = 0x4644_5354;

pub(crate) const LATEST_VERSION: i64 = 2;
/// Oldest database version that can still be migrated forward.
pub(crate) const OLDEST_SUPPORTED_VERSION: i64 = 1;

pub(crate) fn setup(conn: &mut Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA synchronous = NORMAL;
         PRAGMA busy_timeout = 5000;",
    )?;
    migrate(conn)
}

fn migrate(conn: &mut Connection) -> Result<()> {
    let application_id: i64 = conn.query_row("PRAGMA application_id", [], |r| r.get(0))?;
    let mut version: i64 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;

    if application_id == 0 && version == 0 {
        conn.execute_batch(&format!("PRAGMA application_id = {}", APPLICATION_ID))?;
    } else if application_id != APPLICATION_ID {
        return Err(Error::storage(format!(
            "not a feedstash database (application_id {:#x})",
            application_id
        )));
    }

    if version > LATEST_VERSION {
        return Err(Error::storage(format!(
            "database version {} is newer than the supported version {}",
            version, LATEST_VERSION
        )));
    }
    if version != 0 && version < OLDEST_SUPPORTED_VERSION {
        return Err(Error::storage(format!(
            "database version {} is older than the oldest supported version {}",
            version, OLDEST_SUPPORTED_VERSION
        )));
    }

    while version < LATEST_VERSION {
        let next = version + 1;
        debug!(from = version, to = next, "applying migration");
        let tx = conn.transaction()?;
        match next {
            1 => migration_initial(&tx)?,
            2 => migration_update_after(&tx)?,
            other => {
                return Err(Error::storage(format!("missing migration to version {}", other)))
            }
        }
        tx.execute_batch(&format!("PRAGMA user_version = {}", next))?;
        tx.commit()?;
        version = next;
    }
    if version == LATEST_VERSION {
        info!(version, "database schema is current");
    }
    Ok(())
}

fn migration_initial(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE feeds (
            url TEXT PRIMARY KEY NOT NULL,
            title TEXT,
            link TEXT,
            updated INTEGER,
            author TEXT,
            subtitle TEXT,
            version TEXT,
            user_title TEXT,
            http_etag TEXT,
            http_last_modified TEXT,
            stale INTEGER NOT NULL DEFAULT 0,
            updates_enabled INTEGER NOT NULL DEFAULT 1,
            update_epoch INTEGER NOT NULL DEFAULT 0,
            added INTEGER NOT NULL,
            last_updated INTEGER,
            last_retrieved INTEGER,
            last_exception TEXT
        );

        CREATE TABLE entries (
            id TEXT NOT NULL,
            feed TEXT NOT NULL REFERENCES feeds (url)
                ON UPDATE CASCADE ON DELETE CASCADE,
            title TEXT,
            link TEXT,
            updated INTEGER,
            author TEXT,
            published INTEGER,
            summary TEXT,
            content TEXT NOT NULL DEFAULT '[]',
            enclosures TEXT NOT NULL DEFAULT '[]',
            read INTEGER NOT NULL DEFAULT 0,
            read_modified INTEGER,
            important INTEGER,
            important_modified INTEGER,
            added INTEGER NOT NULL,
            added_by TEXT NOT NULL,
            last_updated INTEGER NOT NULL,
            original_feed TEXT,
            data_hash BLOB,
            data_hash_changed INTEGER NOT NULL DEFAULT 0,
            first_updated INTEGER NOT NULL,
            first_updated_epoch INTEGER NOT NULL,
            feed_order INTEGER NOT NULL,
            recent_sort INTEGER NOT NULL,
            sequence INTEGER,
            PRIMARY KEY (feed, id)
        );

        CREATE INDEX entries_by_recent ON entries (
            recent_sort DESC,
            feed DESC,
            last_updated DESC,
            first_updated_epoch ASC,
            feed_order ASC,
            id DESC
        );

        CREATE TABLE tags (
            feed TEXT NOT NULL DEFAULT '',
            entry_id TEXT NOT NULL DEFAULT '',
            key TEXT NOT NULL,
            value TEXT NOT NULL,
            PRIMARY KEY (feed, entry_id, key)
        );

        CREATE TABLE changes (
            seq INTEGER NOT NULL,
            feed TEXT NOT NULL DEFAULT '',
            id TEXT NOT NULL DEFAULT '',
            action INTEGER NOT NULL,
            PRIMARY KEY (feed, id, seq, action)
        );

        CREATE TABLE sequences (
            id INTEGER PRIMARY KEY CHECK (id = 0),
            value INTEGER NOT NULL
        );
        INSERT INTO sequences (id, value) VALUES (0, 0);",
    )?;
    Ok(())
}

fn migration_update_after(conn: &Connection) -> Result<()> {
    conn.execute_batch("ALTER TABLE feeds ADD COLUMN update_after INTEGER;")?;
    Ok(())
}

/// Fresh in-memory connection with the full schema, for tests.
#[cfg(test)]
pub(crate) fn open_memory() -> Connection {
    let mut conn = Connection::open_in_memory().expect("in-memory database");
    setup(&mut conn).expect("schema setup");
    conn
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_database_migrates_to_latest() {
        let conn = open_memory();
        let version: i64 = conn
            .query_row("PRAGMA user_version", [], |r| r.get(0))
            .unwrap();
        assert_eq!(version, LATEST_VERSION);
        let app_id: i64 = conn
            .query_row("PRAGMA application_id", [], |r| r.get(0))
            .unwrap();
        assert_eq!(app_id, APPLICATION_ID);
    }

    #[test]
    fn test_setup_is_idempotent() {
        let mut conn = open_memory();
        setup(&mut conn).unwrap();
        let version: i64 = conn
            .query_row("PRAGMA user_version", [], |r| r.get(0))
            .unwrap();
        assert_eq!(version, LATEST_VERSION);
    }

    #[test]
    fn test_newer_database_is_refused() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(&format!(
            "PRAGMA application_id = {}; PRAGMA user_version = {};",
            APPLICATION_ID,
            LATEST_VERSION + 1
        ))
        .unwrap();
        let err = setup(&mut conn).unwrap_err();
        assert!(err.to_string().contains("newer"));
    }

    #[test]
    fn test_foreign_database_is_refused() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA application_id = 42; PRAGMA user_version = 1;")
            .unwrap();
        assert!(setup(&mut conn).is_err());
    }

    #[test]
    fn test_update_after_column_exists() {
        let conn = open_memory();
        conn.execute(
            "UPDATE feeds SET update_after = 1 WHERE url = 'none'",
            [],
        )
        .unwrap();
    }
}
