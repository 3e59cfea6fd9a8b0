//! SQLite persistence: feeds, entries, tags, and the search change log.
//!
//! The connection is opened in WAL mode and guarded by a mutex; every
//! public operation runs its closure on the blocking thread pool so SQLite
//! work never stalls the async runtime. Mutations are single transactions;
//! reads are short bounded queries, so long iterations never hold the
//! database.

pub(crate) mod changes;
pub(crate) mod entries;
pub(crate) mod feeds;
pub(crate) mod query;
pub(crate) mod schema;
pub(crate) mod tags;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::Connection;
use tracing::debug;

use crate::error::{Error, Result};

/// Chunk size used by auto-paginating query helpers.
pub(crate) const DEFAULT_CHUNK_SIZE: usize = 256;

#[derive(Clone)]
pub(crate) struct Storage {
    conn: Arc<Mutex<Option<Connection>>>,
    path: PathBuf,
}

impl Storage {
    pub(crate) async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let opened = path.clone();
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection> {
            let mut conn = Connection::open(&opened)?;
            schema::setup(&mut conn)?;
            Ok(conn)
        })
        .await
        .map_err(join_error)??;
        debug!(path = %path.display(), "opened database");
        Ok(Storage {
            conn: Arc::new(Mutex::new(Some(conn))),
            path,
        })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// Run `f` against the connection on the blocking pool.
    pub(crate) async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            let conn = guard.as_mut().ok_or(Error::Closed)?;
            f(conn)
        })
        .await
        .map_err(join_error)?
    }

    /// Optimize and release the connection. Idempotent.
    pub(crate) async fn close(&self) -> Result<()> {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut guard = conn.lock();
            if let Some(conn) = guard.take() {
                let _ = conn.execute_batch("PRAGMA optimize;");
                drop(conn);
            }
            Ok(())
        })
        .await
        .map_err(join_error)?
    }
}

fn join_error(err: tokio::task::JoinError) -> Error {
    Error::Storage {
        message: format!("storage task failed: {}", err),
        source: Some(Box::new(err)),
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Storage {
            message: err.to_string(),
            source: Some(Box::new(err)),
        }
    }
}

pub(crate) fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

/// Timestamps are stored as microseconds since the Unix epoch.
pub(crate) fn to_micros(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

pub(crate) fn opt_to_micros(ts: Option<DateTime<Utc>>) -> Option<i64> {
    ts.map(to_micros)
}

pub(crate) fn row_micros(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let micros: i64 = row.get(idx)?;
    DateTime::from_timestamp_micros(micros).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Integer,
            format!("timestamp out of range: {}", micros).into(),
        )
    })
}

pub(crate) fn row_opt_micros(
    row: &rusqlite::Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let micros: Option<i64> = row.get(idx)?;
    micros
        .map(|m| {
            DateTime::from_timestamp_micros(m).ok_or_else(|| {
                rusqlite::Error::FromSqlConversionFailure(
                    idx,
                    rusqlite::types::Type::Integer,
                    format!("timestamp out of range: {}", m).into(),
                )
            })
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_and_close() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path().join("test.db")).await.unwrap();
        let one: i64 = storage
            .with_conn(|conn| Ok(conn.query_row("SELECT 1", [], |r| r.get(0))?))
            .await
            .unwrap();
        assert_eq!(one, 1);

        storage.close().await.unwrap();
        let err = storage
            .with_conn(|conn| Ok(conn.query_row("SELECT 1", [], |r| r.get::<_, i64>(0))?))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Closed));

        // close is idempotent
        storage.close().await.unwrap();
    }

    #[test]
    fn test_micros_roundtrip() {
        let now = Utc::now();
        let back = DateTime::from_timestamp_micros(to_micros(now)).unwrap();
        assert_eq!(back.timestamp_micros(), now.timestamp_micros());
    }
}
