//! SQLite persistence for `Build`/`Project`/`Secret`/`BuildLogEntry`/
//! `BuildArtifact`.
//!
//! Generalizes the source daemon's single shared `Mutex<Connection>`
//! (`database/mod.rs`) into an actual per-build-scope checkout pool, per
//! SPEC_FULL §3.1: each `Execute(buildId, ...)` call checks out one
//! `Connection` for its lifetime and returns it on completion, so builds
//! never share an open session.

mod artifacts;
mod builds;
mod logs;
mod projects;

pub use artifacts::ArtifactsRepo;
pub use builds::BuildsRepo;
pub use logs::LogsRepo;
pub use projects::ProjectsRepo;

use std::path::Path;

use parking_lot::Mutex as SyncMutex;
use rusqlite::Connection;
use thiserror::Error;
use tokio::sync::{Semaphore, SemaphorePermit};

#[derive(Error, Debug)]
pub enum DbError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("connection pool exhausted or closed")]
    PoolClosed,

    #[error("row not found")]
    NotFound,
}

pub type DbResult<T> = std::result::Result<T, DbError>;

const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS projects (
    id                  INTEGER PRIMARY KEY,
    repo_full_name      TEXT NOT NULL,
    installation_id     INTEGER,
    docker_image        TEXT,
    timeout_minutes     INTEGER NOT NULL,
    profile             TEXT,
    available_profiles  TEXT NOT NULL DEFAULT '[]',
    notify_on_failure   INTEGER NOT NULL DEFAULT 0,
    dind                INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS secrets (
    id                  INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id          INTEGER NOT NULL REFERENCES projects(id),
    name                TEXT NOT NULL,
    encrypted_value     BLOB NOT NULL
);

CREATE TABLE IF NOT EXISTS builds (
    id                  INTEGER PRIMARY KEY,
    project_id          INTEGER NOT NULL REFERENCES projects(id),
    branch              TEXT NOT NULL,
    commit_sha          TEXT NOT NULL,
    status              TEXT NOT NULL,
    queued_at           INTEGER NOT NULL,
    started_at          INTEGER,
    finished_at         INTEGER,
    steps_total         INTEGER NOT NULL DEFAULT 0,
    steps_completed     INTEGER NOT NULL DEFAULT 0,
    steps_failed        INTEGER NOT NULL DEFAULT 0,
    error_message       TEXT
);

CREATE INDEX IF NOT EXISTS idx_builds_status ON builds(status);

CREATE TABLE IF NOT EXISTS build_log_entries (
    id                  INTEGER PRIMARY KEY AUTOINCREMENT,
    build_id            INTEGER NOT NULL REFERENCES builds(id),
    sequence            INTEGER NOT NULL,
    kind                TEXT NOT NULL,
    message             TEXT NOT NULL,
    step_name           TEXT,
    timestamp           INTEGER NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_build_log_entries_seq
    ON build_log_entries(build_id, sequence);

CREATE TABLE IF NOT EXISTS build_artifacts (
    id                  INTEGER PRIMARY KEY AUTOINCREMENT,
    build_id            INTEGER NOT NULL REFERENCES builds(id),
    project_id          INTEGER NOT NULL REFERENCES projects(id),
    name                TEXT NOT NULL,
    storage_path        TEXT NOT NULL,
    size_bytes          INTEGER NOT NULL,
    created_at          INTEGER NOT NULL,
    expires_at          INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_build_artifacts_expires ON build_artifacts(expires_at);
"#;

/// A small connection pool. Every connection points at the same database
/// file opened in WAL mode, so readers never block writers and one writer
/// at a time is enforced by SQLite itself, not by this pool.
pub struct Db {
    conns: SyncMutex<Vec<Connection>>,
    semaphore: Semaphore,
}

impl Db {
    /// Opens (creating if necessary) the database file at `path` and
    /// initializes `pool_size` connections against it.
    pub fn open(path: impl AsRef<Path>, pool_size: usize) -> DbResult<Self> {
        let path = path.as_ref();
        let mut conns = Vec::with_capacity(pool_size);
        for _ in 0..pool_size {
            let conn = Connection::open(path)?;
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "foreign_keys", true)?;
            conns.push(conn);
        }
        conns[0].execute_batch(SCHEMA)?;

        Ok(Self {
            conns: SyncMutex::new(conns),
            semaphore: Semaphore::new(pool_size),
        })
    }

    /// Opens an in-memory database for tests. In-memory databases are
    /// private per-connection, so the pool is forced to a single
    /// connection: all call sites in a test share the one handle.
    pub fn open_in_memory() -> DbResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conns: SyncMutex::new(vec![conn]),
            semaphore: Semaphore::new(1),
        })
    }

    /// Checks out one connection for the lifetime of the returned guard.
    pub async fn checkout(&self) -> DbResult<DbConn<'_>> {
        let permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| DbError::PoolClosed)?;
        let conn = self
            .conns
            .lock()
            .pop()
            .expect("semaphore permit implies a free connection");
        Ok(DbConn {
            db: self,
            conn: Some(conn),
            _permit: permit,
        })
    }
}

pub struct DbConn<'a> {
    db: &'a Db,
    conn: Option<Connection>,
    _permit: SemaphorePermit<'a>,
}

impl std::ops::Deref for DbConn<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection present until drop")
    }
}

impl Drop for DbConn<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.db.conns.lock().push(conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_in_memory_creates_schema() {
        let db = Db::open_in_memory().unwrap();
        let conn = db.checkout().await.unwrap();
        let count: i64 = conn
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE type='table' AND name='builds'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn checkout_blocks_when_pool_exhausted() {
        let db = Db::open_in_memory().unwrap();
        let _guard = db.checkout().await.unwrap();
        let second = tokio::time::timeout(std::time::Duration::from_millis(50), db.checkout()).await;
        assert!(second.is_err(), "second checkout should not complete while the only connection is held");
    }
}
