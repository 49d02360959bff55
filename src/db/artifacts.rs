use chrono::{TimeZone, Utc};
use rusqlite::{params, Connection};

use crate::model::{BuildArtifact, BuildId};

use super::DbResult;

pub struct ArtifactsRepo;

impl ArtifactsRepo {
    pub fn insert(conn: &Connection, artifact: &BuildArtifact) -> DbResult<()> {
        conn.execute(
            "INSERT INTO build_artifacts (build_id, project_id, name, storage_path, size_bytes, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                artifact.build_id.0,
                artifact.project_id.0,
                artifact.name,
                artifact.storage_path,
                artifact.size_bytes,
                artifact.created_at.timestamp(),
                artifact.expires_at.timestamp(),
            ],
        )?;
        Ok(())
    }

    pub fn for_build(conn: &Connection, build_id: BuildId) -> DbResult<Vec<BuildArtifact>> {
        let mut stmt = conn.prepare(
            "SELECT id, build_id, project_id, name, storage_path, size_bytes, created_at, expires_at
             FROM build_artifacts WHERE build_id = ?1",
        )?;
        let rows = stmt
            .query_map(params![build_id.0], Self::row_to_artifact)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Every artifact row whose `expires_at` is in the past, for the
    /// retention sweep.
    pub fn expired(conn: &Connection) -> DbResult<Vec<BuildArtifact>> {
        let mut stmt = conn.prepare(
            "SELECT id, build_id, project_id, name, storage_path, size_bytes, created_at, expires_at
             FROM build_artifacts WHERE expires_at < ?1",
        )?;
        let rows = stmt
            .query_map(params![Utc::now().timestamp()], Self::row_to_artifact)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn delete(conn: &Connection, id: i64) -> DbResult<()> {
        conn.execute("DELETE FROM build_artifacts WHERE id = ?1", params![id])?;
        Ok(())
    }

    fn row_to_artifact(row: &rusqlite::Row) -> rusqlite::Result<BuildArtifact> {
        Ok(BuildArtifact {
            id: row.get(0)?,
            build_id: BuildId(row.get(1)?),
            project_id: crate::model::ProjectId(row.get(2)?),
            name: row.get(3)?,
            storage_path: row.get(4)?,
            size_bytes: row.get::<_, i64>(5)? as u64,
            created_at: Utc.timestamp_opt(row.get(6)?, 0).single().unwrap_or_else(Utc::now),
            expires_at: Utc.timestamp_opt(row.get(7)?, 0).single().unwrap_or_else(Utc::now),
        })
    }
}
