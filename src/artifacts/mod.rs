//! `ArtifactCollector`: copies `/workspace/artifacts/.` out of a finished
//! build container and records each file, plus a background retention
//! sweep. Grounded on the file-walk-and-metadata-record idiom in
//! `src/backup/local.rs` (`LocalAdapter::list`'s `read_dir`+`metadata` walk)
//! and the periodic-ticker idiom in `src/cron/scheduler.rs`, generalized
//! from "local backup adapter" to "copy-out-of-container plus a database
//! row per file."

use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::container::ContainerRuntime;
use crate::db::{ArtifactsRepo, Db, DbError};
use crate::model::{BuildArtifact, BuildId, ProjectId};

#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error("container error: {0}")]
    Container(#[from] crate::container::ContainerError),

    #[error("database error: {0}")]
    Db(#[from] DbError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ArtifactResult<T> = std::result::Result<T, ArtifactError>;

const CONTAINER_ARTIFACTS_PATH: &str = "/workspace/artifacts/.";

pub struct ArtifactCollector<'a> {
    runtime: &'a dyn ContainerRuntime,
    artifacts_root: PathBuf,
    retention_days: i64,
}

impl<'a> ArtifactCollector<'a> {
    pub fn new(runtime: &'a dyn ContainerRuntime, artifacts_root: PathBuf, retention_days: i64) -> Self {
        Self { runtime, artifacts_root, retention_days }
    }

    /// Copies collected artifacts out of `container_id` into
    /// `{artifactsRoot}/{projectId}/{buildId}/` and records one row per
    /// file. An absent or empty source directory is not an error (§4.8).
    pub async fn collect(
        &self,
        conn: &rusqlite::Connection,
        build_id: BuildId,
        project_id: ProjectId,
        container_id: &str,
    ) -> ArtifactResult<()> {
        let dest_dir = self.artifacts_root.join(project_id.0.to_string()).join(build_id.0.to_string());

        self.runtime.copy_out(container_id, CONTAINER_ARTIFACTS_PATH, &dest_dir).await?;

        if !dest_dir.exists() {
            return Ok(());
        }

        let now = chrono::Utc::now();
        let expires_at = now + chrono::Duration::days(self.retention_days);

        for entry in walk_files(&dest_dir)? {
            let relative = entry
                .strip_prefix(&dest_dir)
                .unwrap_or(&entry)
                .to_string_lossy()
                .to_string();
            let name = entry
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| relative.clone());
            let size_bytes = std::fs::metadata(&entry)?.len();

            ArtifactsRepo::insert(
                conn,
                &BuildArtifact {
                    id: 0,
                    build_id,
                    project_id,
                    name,
                    storage_path: relative,
                    size_bytes,
                    created_at: now,
                    expires_at,
                },
            )?;
        }

        Ok(())
    }
}

fn walk_files(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        for entry in std::fs::read_dir(&current)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else {
                files.push(path);
            }
        }
    }
    Ok(files)
}

/// Periodic background job: deletes expired artifact files and their rows.
/// Runs alongside the orchestrator loop for the process lifetime; not part
/// of `Execute`'s call graph (§4.8).
pub async fn run_retention_sweep(db: std::sync::Arc<Db>, artifacts_root: PathBuf, interval: std::time::Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = cancel.cancelled() => {
                info!("artifact retention sweep stopping");
                return;
            }
        }

        let conn = match db.checkout().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(error = %e, "retention sweep: failed to check out db connection");
                continue;
            }
        };

        let expired = match ArtifactsRepo::expired(&conn) {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "retention sweep: failed to query expired artifacts");
                continue;
            }
        };

        for artifact in expired {
            let path = artifacts_root
                .join(artifact.project_id.0.to_string())
                .join(artifact.build_id.0.to_string())
                .join(&artifact.storage_path);
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %e, "retention sweep: failed to remove artifact file");
                }
            }
            if let Err(e) = ArtifactsRepo::delete(&conn, artifact.id) {
                warn!(id = artifact.id, error = %e, "retention sweep: failed to delete artifact row");
            }
        }
    }
}
