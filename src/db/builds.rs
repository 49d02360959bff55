use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::model::{Build, BuildId, BuildStatus, ProjectId};

use super::{DbError, DbResult};

fn to_epoch(ts: DateTime<Utc>) -> i64 {
    ts.timestamp()
}

fn from_epoch(ts: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(ts, 0).single().unwrap_or_else(Utc::now)
}

fn row_to_build(row: &rusqlite::Row) -> rusqlite::Result<Build> {
    let status: String = row.get("status")?;
    Ok(Build {
        id: BuildId(row.get("id")?),
        project_id: ProjectId(row.get("project_id")?),
        branch: row.get("branch")?,
        commit_sha: row.get("commit_sha")?,
        status: BuildStatus::from_str(&status).unwrap_or(BuildStatus::Failed),
        queued_at: from_epoch(row.get("queued_at")?),
        started_at: row.get::<_, Option<i64>>("started_at")?.map(from_epoch),
        finished_at: row.get::<_, Option<i64>>("finished_at")?.map(from_epoch),
        steps_total: row.get("steps_total")?,
        steps_completed: row.get("steps_completed")?,
        steps_failed: row.get("steps_failed")?,
        error_message: row.get("error_message")?,
    })
}

pub struct BuildsRepo;

impl BuildsRepo {
    pub fn get(conn: &Connection, id: BuildId) -> DbResult<Option<Build>> {
        conn.query_row(
            "SELECT * FROM builds WHERE id = ?1",
            params![id.0],
            row_to_build,
        )
        .optional()
        .map_err(DbError::from)
    }

    pub fn insert(conn: &Connection, build: &Build) -> DbResult<()> {
        conn.execute(
            "INSERT INTO builds (id, project_id, branch, commit_sha, status, queued_at,
                started_at, finished_at, steps_total, steps_completed, steps_failed, error_message)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                build.id.0,
                build.project_id.0,
                build.branch,
                build.commit_sha,
                build.status.as_str(),
                to_epoch(build.queued_at),
                build.started_at.map(to_epoch),
                build.finished_at.map(to_epoch),
                build.steps_total,
                build.steps_completed,
                build.steps_failed,
                build.error_message,
            ],
        )?;
        Ok(())
    }

    /// Persists the full mutable surface of a build. The orchestrator is the
    /// sole writer of a given `BuildId`'s row.
    pub fn save(conn: &Connection, build: &Build) -> DbResult<()> {
        conn.execute(
            "UPDATE builds SET status = ?2, started_at = ?3, finished_at = ?4,
                steps_total = ?5, steps_completed = ?6, steps_failed = ?7, error_message = ?8
             WHERE id = ?1",
            params![
                build.id.0,
                build.status.as_str(),
                build.started_at.map(to_epoch),
                build.finished_at.map(to_epoch),
                build.steps_total,
                build.steps_completed,
                build.steps_failed,
                build.error_message,
            ],
        )?;
        Ok(())
    }

    pub fn get_pending(conn: &Connection) -> DbResult<Vec<BuildId>> {
        let mut stmt = conn.prepare(
            "SELECT id FROM builds WHERE status IN ('queued', 'running') ORDER BY queued_at ASC",
        )?;
        let ids = stmt
            .query_map([], |row| row.get::<_, i64>(0).map(BuildId))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids)
    }
}
