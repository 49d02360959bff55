use chrono::{DateTime, Utc};
use serde::Serialize;

use super::{build::BuildId, project::ProjectId};

#[derive(Debug, Clone, Serialize)]
pub struct BuildArtifact {
    pub id: i64,
    pub build_id: BuildId,
    pub project_id: ProjectId,
    pub name: String,
    /// Relative to `artifactsRoot`: `{projectId}/{buildId}/{relative}`.
    pub storage_path: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}
