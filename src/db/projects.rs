use rusqlite::{params, Connection, OptionalExtension};

use crate::model::{Project, ProjectId, Secret};

use super::{DbError, DbResult};

pub struct ProjectsRepo;

impl ProjectsRepo {
    pub fn get(conn: &Connection, id: ProjectId) -> DbResult<Option<Project>> {
        let project = conn
            .query_row(
                "SELECT * FROM projects WHERE id = ?1",
                params![id.0],
                |row| {
                    let profiles_json: String = row.get("available_profiles")?;
                    Ok(Project {
                        id: ProjectId(row.get("id")?),
                        repo_full_name: row.get("repo_full_name")?,
                        installation_id: row.get("installation_id")?,
                        docker_image: row.get("docker_image")?,
                        timeout_minutes: row.get("timeout_minutes")?,
                        profile: row.get("profile")?,
                        available_profiles: serde_json::from_str(&profiles_json)
                            .unwrap_or_default(),
                        notify_on_failure: row.get::<_, i64>("notify_on_failure")? != 0,
                        secrets: Vec::new(),
                        dind: row.get::<_, i64>("dind")? != 0,
                    })
                },
            )
            .optional()?;

        let Some(mut project) = project else {
            return Ok(None);
        };
        project.secrets = Self::secrets_for(conn, id)?;
        Ok(Some(project))
    }

    pub fn insert(conn: &Connection, project: &Project) -> DbResult<()> {
        let profiles_json = serde_json::to_string(&project.available_profiles)
            .unwrap_or_else(|_| "[]".to_string());
        conn.execute(
            "INSERT INTO projects (id, repo_full_name, installation_id, docker_image,
                timeout_minutes, profile, available_profiles, notify_on_failure, dind)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                project.id.0,
                project.repo_full_name,
                project.installation_id,
                project.docker_image,
                project.timeout_minutes,
                project.profile,
                profiles_json,
                project.notify_on_failure as i64,
                project.dind as i64,
            ],
        )?;

        for secret in &project.secrets {
            Self::insert_secret(conn, project.id, secret)?;
        }
        Ok(())
    }

    pub fn insert_secret(conn: &Connection, project_id: ProjectId, secret: &Secret) -> DbResult<()> {
        conn.execute(
            "INSERT INTO secrets (project_id, name, encrypted_value) VALUES (?1, ?2, ?3)",
            params![project_id.0, secret.name, secret.encrypted_value],
        )?;
        Ok(())
    }

    /// Rewrites `available_profiles` after detection at build start (the
    /// only field the orchestrator is allowed to mutate on a `Project`,
    /// per §3's ownership note).
    pub fn update_available_profiles(
        conn: &Connection,
        id: ProjectId,
        profiles: &[String],
    ) -> DbResult<()> {
        let profiles_json = serde_json::to_string(profiles).unwrap_or_else(|_| "[]".to_string());
        conn.execute(
            "UPDATE projects SET available_profiles = ?2 WHERE id = ?1",
            params![id.0, profiles_json],
        )?;
        Ok(())
    }

    fn secrets_for(conn: &Connection, project_id: ProjectId) -> DbResult<Vec<Secret>> {
        let mut stmt =
            conn.prepare("SELECT name, encrypted_value FROM secrets WHERE project_id = ?1")?;
        let secrets = stmt
            .query_map(params![project_id.0], |row| {
                Ok(Secret {
                    name: row.get(0)?,
                    encrypted_value: row.get(1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(DbError::from)?;
        Ok(secrets)
    }
}
