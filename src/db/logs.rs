use chrono::{TimeZone, Utc};
use rusqlite::{params, Connection};

use crate::model::{BuildId, BuildLogEntry, LogEntryKind};

use super::DbResult;

pub struct LogsRepo;

impl LogsRepo {
    pub fn insert(conn: &Connection, entry: &BuildLogEntry) -> DbResult<()> {
        conn.execute(
            "INSERT INTO build_log_entries (build_id, sequence, kind, message, step_name, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                entry.build_id.0,
                entry.sequence,
                entry.kind.as_str(),
                entry.message,
                entry.step_name,
                entry.timestamp.timestamp(),
            ],
        )?;
        Ok(())
    }

    pub fn for_build(conn: &Connection, build_id: BuildId) -> DbResult<Vec<BuildLogEntry>> {
        let mut stmt = conn.prepare(
            "SELECT id, build_id, sequence, kind, message, step_name, timestamp
             FROM build_log_entries WHERE build_id = ?1 ORDER BY sequence ASC",
        )?;
        let entries = stmt
            .query_map(params![build_id.0], |row| {
                let kind: String = row.get(3)?;
                Ok(BuildLogEntry {
                    id: row.get(0)?,
                    build_id: BuildId(row.get(1)?),
                    sequence: row.get(2)?,
                    kind: LogEntryKind::from_str(&kind).unwrap_or(LogEntryKind::Info),
                    message: row.get(4)?,
                    step_name: row.get(5)?,
                    timestamp: Utc
                        .timestamp_opt(row.get(6)?, 0)
                        .single()
                        .unwrap_or_else(Utc::now),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }
}
