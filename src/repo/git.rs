//! Concrete `RepoPreparer` backed by a real local `git` binary.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use base64::Engine;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::{RepoError, RepoPreparer, RepoResult};
use crate::api::RepositoryProvider;
use crate::log::LogSink;
use crate::model::{short_sha, ProjectId};
use crate::system::KeyedLockRegistry;

pub struct GitRepoPreparer {
    locks: KeyedLockRegistry<(ProjectId, String)>,
}

impl Default for GitRepoPreparer {
    fn default() -> Self {
        Self::new()
    }
}

impl GitRepoPreparer {
    pub fn new() -> Self {
        Self {
            locks: KeyedLockRegistry::new(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn clone_and_checkout(
        &self,
        working_path: &Path,
        url: &str,
        auth_header: &str,
        branch: &str,
        commit_sha: &str,
        log: &LogSink,
        log_conn: &rusqlite::Connection,
        cancel: &CancellationToken,
    ) -> RepoResult<()> {
        if let Some(parent) = working_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let _ = log
            .info(
                log_conn,
                &format!("cloning {} at branch {} to commit {}", url, branch, short_sha(commit_sha)),
            )
            .await;

        run_git(
            &[
                "-c",
                auth_header,
                "clone",
                "--branch",
                branch,
                url,
                &working_path.to_string_lossy(),
            ],
            None,
            log,
            log_conn,
            cancel,
        )
        .await?;

        run_git(
            &["-C", &working_path.to_string_lossy(), "checkout", commit_sha],
            None,
            log,
            log_conn,
            cancel,
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn fetch_and_reset(
        &self,
        working_path: &Path,
        _url: &str,
        auth_header: &str,
        branch: &str,
        commit_sha: &str,
        log: &LogSink,
        log_conn: &rusqlite::Connection,
        cancel: &CancellationToken,
    ) -> RepoResult<()> {
        let _ = log
            .info(log_conn, &format!("fetching {} at commit {}", branch, short_sha(commit_sha)))
            .await;

        let path = working_path.to_string_lossy().to_string();
        run_git(
            &["-c", auth_header, "-C", &path, "fetch", "origin", branch],
            None,
            log,
            log_conn,
            cancel,
        )
        .await?;

        run_git(
            &["-C", &path, "reset", "--hard", commit_sha],
            None,
            log,
            log_conn,
            cancel,
        )
        .await
    }
}

#[async_trait]
impl RepoPreparer for GitRepoPreparer {
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
    ) -> RepoResult<bool> {
        let key = (project_id, short_sha(commit_sha).to_string());
        let _guard = self.locks.acquire(key).await;

        let token = match token_override {
            Some(t) => t,
            None => provider
                .mint_installation_token(installation_id, repo_full_name)
                .await
                .map_err(|e| RepoError::TokenMint(e.to_string()))?,
        };

        let auth_header = format!(
            "http.extraheader=AUTHORIZATION: basic {}",
            base64::engine::general_purpose::STANDARD.encode(format!("x-access-token:{}", token))
        );

        let url = format!("https://github.com/{}.git", repo_full_name);

        let result = if is_working_tree(working_path) {
            self.fetch_and_reset(working_path, &url, &auth_header, branch, commit_sha, log, log_conn, cancel)
                .await
        } else {
            self.clone_and_checkout(working_path, &url, &auth_header, branch, commit_sha, log, log_conn, cancel)
                .await
        };

        match result {
            Ok(()) => Ok(true),
            Err(RepoError::Cancelled) => Err(RepoError::Cancelled),
            Err(e) => {
                warn!(error = %e, "repo preparation failed");
                Ok(false)
            }
        }
    }
}

fn is_working_tree(path: &Path) -> bool {
    path.join(".git").exists()
}

async fn run_git(
    args: &[&str],
    cwd: Option<&Path>,
    log: &LogSink,
    log_conn: &rusqlite::Connection,
    cancel: &CancellationToken,
) -> RepoResult<()> {
    let mut command = Command::new("git");
    command.args(args).stdout(Stdio::piped()).stderr(Stdio::piped());
    if let Some(cwd) = cwd {
        command.current_dir(cwd);
    }

    let mut child = command.spawn().map_err(RepoError::GitMissing)?;
    let stdout = child.stdout.take().expect("piped stdout");
    let stderr = child.stderr.take().expect("piped stderr");

    let mut stdout_lines = BufReader::new(stdout).lines();
    let mut stderr_lines = BufReader::new(stderr).lines();

    loop {
        tokio::select! {
            line = stdout_lines.next_line() => {
                match line? {
                    Some(line) => { let _ = log.output(log_conn, &line).await; }
                    None => break,
                }
            }
            line = stderr_lines.next_line() => {
                if let Some(line) = line? { let _ = log.output(log_conn, &line).await; }
            }
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                return Err(RepoError::Cancelled);
            }
        }
    }

    let status = tokio::select! {
        status = child.wait() => status?,
        _ = cancel.cancelled() => {
            let _ = child.kill().await;
            return Err(RepoError::Cancelled);
        }
    };

    if status.success() {
        Ok(())
    } else {
        Err(RepoError::CommitUnreachable(format!(
            "git {:?} exited with {:?}",
            args, status.code()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_working_tree_checks_dot_git() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!is_working_tree(dir.path()));
        std::fs::create_dir(dir.path().join(".git")).unwrap();
        assert!(is_working_tree(dir.path()));
    }
}
