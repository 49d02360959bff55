//! `LogSink`: per-build ordered, persistent, fan-out log writer. Grounded on
//! `src/system/sink.rs`'s broadcast-channel pool (reused directly for
//! fan-out) generalized with the sequencing and persistence contract of
//! §4.6: sequence numbers are assigned under the same lock that performs the
//! insert, so persistence order and sequence order can never diverge
//! regardless of producer concurrency.

use parking_lot::Mutex;
use rusqlite::Connection;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::config::LogVerbosity;
use crate::db::LogsRepo;
use crate::model::{truncate_message, BuildId, BuildLogEntry, LogEntryKind};
use crate::system::SinkPool;

#[derive(Error, Debug)]
pub enum LogError {
    #[error("database error: {0}")]
    Db(#[from] crate::db::DbError),
}

pub type LogResult<T> = std::result::Result<T, LogError>;

struct SeqState {
    next: i64,
}

pub struct LogSink {
    build_id: BuildId,
    state: Mutex<SeqState>,
    fanout: SinkPool,
    verbosity: LogVerbosity,
}

impl LogSink {
    pub fn new(build_id: BuildId, verbosity: LogVerbosity) -> Self {
        Self {
            build_id,
            state: Mutex::new(SeqState { next: 1 }),
            fanout: SinkPool::new(),
            verbosity,
        }
    }

    /// Live subscription to this build's log entries, serialized as JSON
    /// bytes. Best-effort: a slow subscriber can lag and miss entries but
    /// never blocks the producer (the broadcast channel drops for it, it
    /// does not block persistence, per §4.6/§9).
    pub fn subscribe(&self) -> broadcast::Receiver<Vec<u8>> {
        self.fanout.subscribe()
    }

    /// The actual insert-and-fan-out. Synchronous: nothing here ever needs to
    /// wait on I/O (the sequence lock is uncontended for more than a memory
    /// fetch and `conn` is a caller-owned handle), so this can be called both
    /// from the async wrappers below and directly from a synchronous call
    /// stack such as the runner's line-by-line output reader.
    fn append_sync(&self, conn: &Connection, kind: LogEntryKind, message: &str, step_name: Option<&str>) -> LogResult<()> {
        let message = truncate_message(message);
        let mut state = self.state.lock();
        let sequence = state.next;

        let entry = BuildLogEntry {
            id: 0,
            build_id: self.build_id,
            sequence,
            kind,
            message,
            step_name: step_name.map(String::from),
            timestamp: chrono::Utc::now(),
        };

        LogsRepo::insert(conn, &entry)?;
        state.next += 1;
        drop(state);

        if let Ok(bytes) = serde_json::to_vec(&entry) {
            self.fanout.push(bytes);
        }
        Ok(())
    }

    pub async fn info(&self, conn: &Connection, message: &str) -> LogResult<()> {
        if self.verbosity.allows_info() {
            self.append_sync(conn, LogEntryKind::Info, message, None)
        } else {
            Ok(())
        }
    }

    pub async fn debug(&self, conn: &Connection, message: &str) -> LogResult<()> {
        if self.verbosity.allows_debug() {
            self.append_sync(conn, LogEntryKind::Debug, message, None)
        } else {
            Ok(())
        }
    }

    pub async fn warning(&self, conn: &Connection, message: &str) -> LogResult<()> {
        if self.verbosity.allows_warning() {
            self.append_sync(conn, LogEntryKind::Warning, message, None)
        } else {
            Ok(())
        }
    }

    /// Always emitted regardless of verbosity (§4.6).
    pub async fn error(&self, conn: &Connection, message: &str) -> LogResult<()> {
        self.append_sync(conn, LogEntryKind::Error, message, None)
    }

    /// Always emitted regardless of verbosity (§4.6).
    pub async fn output(&self, conn: &Connection, message: &str) -> LogResult<()> {
        self.append_sync(conn, LogEntryKind::Output, message, None)
    }

    /// Synchronous counterpart to `output`. The runner's stdout/stderr line
    /// callbacks run from inside a synchronous `FnMut` invoked by the
    /// container runtime's async reader loop, one line at a time, so they
    /// cannot themselves hold an `.await` point; calling straight into this
    /// makes the reader's own pace follow however long persistence takes,
    /// which is the back-pressure this path relies on (§4.6).
    pub fn output_line(&self, conn: &Connection, message: &str) -> LogResult<()> {
        self.append_sync(conn, LogEntryKind::Output, message, None)
    }

    pub async fn step_started(&self, conn: &Connection, step_name: &str) -> LogResult<()> {
        self.append_sync(conn, LogEntryKind::StepStarted, step_name, Some(step_name))
    }

    pub async fn step_completed(&self, conn: &Connection, step_name: &str) -> LogResult<()> {
        self.append_sync(conn, LogEntryKind::StepCompleted, step_name, Some(step_name))
    }

    pub async fn step_failed(&self, conn: &Connection, step_name: &str, message: &str) -> LogResult<()> {
        self.append_sync(conn, LogEntryKind::StepFailed, message, Some(step_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{BuildsRepo, ProjectsRepo};
    use crate::db::Db;
    use crate::model::{Build, Project, ProjectId};

    async fn db_with_build() -> Db {
        let db = Db::open_in_memory().unwrap();
        let conn = db.checkout().await.unwrap();
        ProjectsRepo::insert(
            &conn,
            &Project {
                id: ProjectId(1),
                repo_full_name: "acme/widgets".into(),
                installation_id: None,
                docker_image: None,
                timeout_minutes: 30,
                profile: None,
                available_profiles: vec![],
                notify_on_failure: false,
                secrets: vec![],
                dind: false,
            },
        )
        .unwrap();
        BuildsRepo::insert(&conn, &Build::new(BuildId(1), ProjectId(1), "main".into(), "a".repeat(40)))
            .unwrap();
        drop(conn);
        db
    }

    #[tokio::test]
    async fn sequence_numbers_are_dense_and_increasing_under_concurrency() {
        let db = std::sync::Arc::new(db_with_build().await);
        let sink = std::sync::Arc::new(LogSink::new(BuildId(1), LogVerbosity::Debug));

        let mut handles = Vec::new();
        for i in 0..20 {
            let db = db.clone();
            let sink = sink.clone();
            handles.push(tokio::spawn(async move {
                let conn = db.checkout().await.unwrap();
                sink.output(&conn, &format!("line {}", i)).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let conn = db.checkout().await.unwrap();
        let entries = LogsRepo::for_build(&conn, BuildId(1)).unwrap();
        assert_eq!(entries.len(), 20);
        let mut seqs: Vec<i64> = entries.iter().map(|e| e.sequence).collect();
        seqs.sort();
        assert_eq!(seqs, (1..=20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn verbosity_gates_info_and_debug_but_never_error_or_output() {
        let db = db_with_build().await;
        let conn = db.checkout().await.unwrap();
        let sink = LogSink::new(BuildId(1), LogVerbosity::Warning);

        sink.info(&conn, "hidden").await.unwrap();
        sink.debug(&conn, "hidden").await.unwrap();
        sink.error(&conn, "shown").await.unwrap();
        sink.output(&conn, "shown").await.unwrap();

        let entries = LogsRepo::for_build(&conn, BuildId(1)).unwrap();
        assert_eq!(entries.len(), 2);
    }

    #[tokio::test]
    async fn output_line_is_a_synchronous_equivalent_of_output() {
        let db = db_with_build().await;
        let conn = db.checkout().await.unwrap();
        let sink = LogSink::new(BuildId(1), LogVerbosity::Warning);

        sink.output_line(&conn, "line one").unwrap();
        sink.output_line(&conn, "line two").unwrap();

        let entries = LogsRepo::for_build(&conn, BuildId(1)).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].sequence, 1);
        assert_eq!(entries[1].sequence, 2);
    }

    #[tokio::test]
    async fn message_truncation_is_applied_at_append() {
        let db = db_with_build().await;
        let conn = db.checkout().await.unwrap();
        let sink = LogSink::new(BuildId(1), LogVerbosity::Debug);

        let long = "x".repeat(5000);
        sink.output(&conn, &long).await.unwrap();

        let entries = LogsRepo::for_build(&conn, BuildId(1)).unwrap();
        assert_eq!(entries[0].message.chars().count(), 4000);
    }
}
