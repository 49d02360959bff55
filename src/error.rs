//! Crate-level error currency.
//!
//! Every subsystem has its own `thiserror` enum (`ContainerError`, `RepoError`,
//! `ToolError`, `LogError`, `ArtifactError`, `StatusError`, `DbError`,
//! `ConfigError`, `OrchestratorError`). `CoreError` exists for the handful of
//! call sites that need one error currency: the CLI entry point and the
//! minimal status surface.

use thiserror::Error;

use crate::artifacts::ArtifactError;
use crate::config::ConfigError;
use crate::container::ContainerError;
use crate::db::DbError;
use crate::log::LogError;
use crate::orchestrator::OrchestratorError;
use crate::repo::RepoError;
use crate::status::StatusError;
use crate::tools::ToolError;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("database error: {0}")]
    Db(#[from] DbError),

    #[error("container runtime error: {0}")]
    Container(#[from] ContainerError),

    #[error("repository preparation error: {0}")]
    Repo(#[from] RepoError),

    #[error("tool provisioning error: {0}")]
    Tool(#[from] ToolError),

    #[error("log sink error: {0}")]
    Log(#[from] LogError),

    #[error("artifact collection error: {0}")]
    Artifact(#[from] ArtifactError),

    #[error("status reporting error: {0}")]
    Status(#[from] StatusError),

    #[error("orchestrator error: {0}")]
    Orchestrator(#[from] OrchestratorError),

    #[error("{0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;
