//! Read access to the monitored SQLite store.
//!
//! The store is owned and mutated by external writers; vigil only ever
//! reads it. Connections are opened fresh per poll cycle (no pooling) so a
//! crashed cycle never wedges a handle, and WAL mode lets reads proceed
//! concurrently with the external writer. Writer contention surfaces as
//! `StoreError::Busy`, which the change detector retries with bounded
//! backoff inside the same tick.

pub mod lockfile;

pub use lockfile::ProcessLock;

use rusqlite::{Connection, OpenFlags};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Busy timeout applied to read connections.
///
/// Kept short: the detector owns retry/backoff policy and must never block
/// past its tick.
const READ_BUSY_TIMEOUT: Duration = Duration::from_millis(250);

/// Errors from store access, with writer contention split out so callers
/// can retry it.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The external writer holds an exclusive section; retryable.
    #[error("store busy: {0}")]
    Busy(rusqlite::Error),

    /// Any other SQLite failure; not retryable.
    #[error("store error: {0}")]
    Sqlite(rusqlite::Error),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        if is_busy(&err) {
            StoreError::Busy(err)
        } else {
            StoreError::Sqlite(err)
        }
    }
}

/// Check whether an error is SQLITE_BUSY / SQLITE_LOCKED contention.
fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(code, _) if matches!(
            code.code,
            rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
        )
    )
}

/// Handle on the monitored SQLite store.
///
/// Cheap to clone; holds no connection.
#[derive(Debug, Clone)]
pub struct Store {
    path: PathBuf,
}

impl Store {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open a fresh read-only connection.
    ///
    /// Read-only flags make the no-mutation contract structural: a stray
    /// write through this handle fails at the SQLite layer.
    pub fn open_read(&self) -> Result<Connection, StoreError> {
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(READ_BUSY_TIMEOUT)?;
        Ok(conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_classification() {
        let busy = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        assert!(matches!(StoreError::from(busy), StoreError::Busy(_)));

        let other = rusqlite::Error::QueryReturnedNoRows;
        assert!(matches!(StoreError::from(other), StoreError::Sqlite(_)));
    }

    #[test]
    fn read_only_connection_rejects_writes() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("store.db");

        // External writer creates the store.
        let writer = Connection::open(&db_path).unwrap();
        writer
            .execute_batch("CREATE TABLE sessions (id INTEGER PRIMARY KEY)")
            .unwrap();
        drop(writer);

        let store = Store::new(&db_path);
        let conn = store.open_read().unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM sessions", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0);

        assert!(conn
            .execute("INSERT INTO sessions (id) VALUES (1)", [])
            .is_err());
    }
}
