// SPDX-License-Identifier: Apache-2.0

//! Durable offset persistence.
//!
//! Offsets are keyed by `(identity, strategy)`: the same file tracked under
//! a different strategy produces an unrelated identity, so progress made
//! under one strategy must never be applied to another.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use rusqlite::{Connection, ErrorCode, OptionalExtension, params};

use crate::error::{Error, Result};

mod embedded {
    use refinery::embed_migrations;
    embed_migrations!("src/migrations");
}

/// Attempts for statements that hit SQLITE_BUSY before giving up.
const BUSY_RETRY_ATTEMPTS: u32 = 5;
const BUSY_RETRY_STEP: Duration = Duration::from_millis(50);

/// Persistent store of per-file read offsets.
pub trait OffsetStore: Send + Sync {
    /// Upsert the offset for `(id, strategy)`, refreshing `path` and
    /// `updated_at`.
    fn save(&self, id: &str, strategy: &str, path: &Path, offset: u64) -> Result<()>;

    /// Load the offset for `(id, strategy)`; `None` when unknown.
    fn load(&self, id: &str, strategy: &str) -> Result<Option<u64>>;

    fn delete(&self, id: &str, strategy: &str) -> Result<()>;

    /// Close the store. Later operations fail with [`Error::StoreClosed`].
    fn close(&self) -> Result<()>;
}

/// SQLite-backed [`OffsetStore`]. Safe to share across worker threads; the
/// connection serializes access and busy conditions are retried with a
/// bounded linear backoff.
pub struct SqliteStore {
    conn: Mutex<Option<Connection>>,
    path: PathBuf,
}

impl SqliteStore {
    /// Open (creating directories and schema as needed) the database at
    /// `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }

        let mut conn = Connection::open(&path)?;

        // Best-effort pragmas; WAL keeps concurrent save/load cheap.
        conn.pragma_update(None, "busy_timeout", 2000).ok();
        conn.query_row("PRAGMA journal_mode = WAL", [], |_row| Ok(())).ok();

        // Refinery tracks applied versions in its own history table, so
        // reopening an existing database is a no-op here.
        embedded::migrations::runner().run(&mut conn)?;

        Ok(Self {
            conn: Mutex::new(Some(conn)),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let guard = self.conn.lock().unwrap();
        match guard.as_ref() {
            Some(conn) => f(conn),
            None => Err(Error::StoreClosed),
        }
    }
}

fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == ErrorCode::DatabaseBusy || e.code == ErrorCode::DatabaseLocked
    )
}

/// Run `f`, retrying busy/locked failures a bounded number of times.
fn exec_with_retry<T>(mut f: impl FnMut() -> rusqlite::Result<T>) -> rusqlite::Result<T> {
    let mut last = None;
    for attempt in 0..BUSY_RETRY_ATTEMPTS {
        match f() {
            Ok(value) => return Ok(value),
            Err(err) if is_busy(&err) => {
                std::thread::sleep(BUSY_RETRY_STEP * (attempt + 1));
                last = Some(err);
            }
            Err(err) => return Err(err),
        }
    }
    Err(last.expect("retry loop ran at least once"))
}

impl OffsetStore for SqliteStore {
    fn save(&self, id: &str, strategy: &str, path: &Path, offset: u64) -> Result<()> {
        self.with_conn(|conn| {
            let path = path.to_string_lossy();
            exec_with_retry(|| {
                conn.execute(
                    "INSERT INTO offsets (id, strategy, path, offset, updated_at)
                     VALUES (?1, ?2, ?3, ?4, CURRENT_TIMESTAMP)
                     ON CONFLICT (id, strategy) DO UPDATE SET
                         offset = excluded.offset,
                         path = excluded.path,
                         updated_at = CURRENT_TIMESTAMP",
                    params![id, strategy, path.as_ref(), offset as i64],
                )
            })?;
            Ok(())
        })
    }

    fn load(&self, id: &str, strategy: &str) -> Result<Option<u64>> {
        self.with_conn(|conn| {
            let offset: Option<i64> = conn
                .query_row(
                    "SELECT offset FROM offsets WHERE id = ?1 AND strategy = ?2",
                    params![id, strategy],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(offset.map(|v| v as u64))
        })
    }

    fn delete(&self, id: &str, strategy: &str) -> Result<()> {
        self.with_conn(|conn| {
            exec_with_retry(|| {
                conn.execute(
                    "DELETE FROM offsets WHERE id = ?1 AND strategy = ?2",
                    params![id, strategy],
                )
            })?;
            Ok(())
        })
    }

    fn close(&self) -> Result<()> {
        let mut guard = self.conn.lock().unwrap();
        if let Some(conn) = guard.take() {
            conn.close().map_err(|(_, err)| Error::Store(err))?;
        }
        Ok(())
    }
}
