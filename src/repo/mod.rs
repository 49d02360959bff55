//! `RepoPreparer`: clones or fast-forwards a working tree at a specific
//! commit, using provider-minted credentials. Grounded on the
//! shell-out-and-stream-output idiom in `src/server/install.rs` (there
//! attaching to a container's installation process; here spawning a local
//! `git` process) and the per-key mutual exclusion idiom in
//! `src/system/locker.rs`, generalized to a keyed registry over
//! `(ProjectId, shortSha)`.
//!
//! Defined as a trait, mirroring `ContainerRuntime`/`RepositoryProvider`/
//! `EmailSender`: the orchestrator depends on `dyn RepoPreparer` so its tests
//! can inject an in-memory fake instead of shelling out to a real `git`
//! process (§8, "no real Docker daemon or network access required").

mod git;

pub use git::GitRepoPreparer;

use std::path::Path;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::api::RepositoryProvider;
use crate::log::LogSink;
use crate::model::ProjectId;

#[derive(Error, Debug)]
pub enum RepoError {
    #[error("git not found on PATH: {0}")]
    GitMissing(std::io::Error),

    #[error("failed to mint installation token: {0}")]
    TokenMint(String),

    #[error("commit unreachable: {0}")]
    CommitUnreachable(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type RepoResult<T> = std::result::Result<T, RepoError>;

#[async_trait]
pub trait RepoPreparer: Send + Sync {
    /// Returns `Ok(true)` if `working_path` now contains a checkout of
    /// `commit_sha`, `Ok(false)` if the commit could not be reached (the
    /// orchestrator maps this to `RepoUnavailable`).
    #[allow(clippy::too_many_arguments)]
    async fn prepare(
        &self,
        project_id: ProjectId,
        installation_id: Option<i64>,
        repo_full_name: &str,
        branch: &str,
        commit_sha: &str,
        working_path: &Path,
        token_override: Option<String>,
        provider: &dyn RepositoryProvider,
        log: &LogSink,
        log_conn: &rusqlite::Connection,
        cancel: &CancellationToken,
    ) -> RepoResult<bool>;
}
