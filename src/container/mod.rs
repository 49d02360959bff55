//! `ContainerRuntime`: the thin contract over the container daemon that the
//! orchestrator composes. Grounded on `src/environment/traits.rs` and the
//! bollard usage in `src/environment/docker/{environment,container,power}.rs`,
//! generalized from "manage one long-lived server container" to "create,
//! exec into, copy out of, and remove one ephemeral build container."

mod docker;

pub use docker::DockerRuntime;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use std::path::Path;

#[derive(Error, Debug)]
pub enum ContainerError {
    #[error("docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("container not found: {0}")]
    NotFound(String),

    #[error("container create failed: {0}")]
    CreateFailed(String),

    #[error("image pull failed: {0}")]
    ImagePull(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("operation timed out")]
    Timeout,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type ContainerResult<T> = std::result::Result<T, ContainerError>;

/// A single bind mount.
#[derive(Debug, Clone)]
pub struct MountSpec {
    pub host_path: String,
    pub container_path: String,
    pub read_only: bool,
}

/// A host path a container has mounted, as reported by the daemon's inspect
/// call. Used by `PathResolver` to translate orchestrator-visible paths into
/// host-daemon-visible ones.
#[derive(Debug, Clone)]
pub struct MountInfo {
    pub source: String,
    pub destination: String,
}

#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub image: String,
    pub mounts: Vec<MountSpec>,
    pub env: Vec<(String, String)>,
    pub workdir: String,
    pub network: String,
    /// If set, the build requested Docker-in-Docker: the host daemon socket
    /// is mounted and the hardening capability drop is skipped (§4.2).
    pub dind: bool,
}

/// Called once per complete output line.
pub type LineCallback<'a> = Box<dyn FnMut(&str) + Send + 'a>;

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Idempotent: creates the named bridge network if it does not already
    /// exist. Race-safe under concurrent callers (§4.2).
    async fn ensure_network(&self, name: &str) -> ContainerResult<()>;

    /// Starts a detached, auto-remove-on-exit container that sleeps forever,
    /// and returns its full id.
    async fn create(&self, spec: &ContainerSpec, cancel: &CancellationToken) -> ContainerResult<String>;

    /// Execs `argv` inside the running container, streaming stdout/stderr to
    /// the given line callbacks in arrival order per stream, and returns the
    /// process exit code.
    async fn exec(
        &self,
        container_id: &str,
        argv: &[String],
        workdir: &str,
        env: &[(String, String)],
        on_stdout: LineCallback<'_>,
        on_stderr: LineCallback<'_>,
        cancel: &CancellationToken,
    ) -> ContainerResult<i64>;

    /// Recursively copies `src_path` (a directory) out of the container to
    /// `dest_dir` on the host. An absent or empty source is not an error.
    async fn copy_out(&self, container_id: &str, src_path: &str, dest_dir: &Path) -> ContainerResult<()>;

    /// Force-removes a container. Errors are logged by the caller, not
    /// surfaced as a build failure (§4.1).
    async fn remove(&self, container_id: &str) -> ContainerResult<()>;

    /// Mount list for `container_ref`, used by `PathResolver`.
    async fn inspect_mounts(&self, container_ref: &str) -> ContainerResult<Vec<MountInfo>>;
}

/// Replaces the value following every `-e`/`--env` flag with `KEY=REDACTED`,
/// for debug-level argv logging (§4.2, §9 "process invocation security").
pub fn redact_argv(argv: &[String]) -> Vec<String> {
    let mut redacted = Vec::with_capacity(argv.len());
    let mut i = 0;
    while i < argv.len() {
        redacted.push(argv[i].clone());
        if (argv[i] == "-e" || argv[i] == "--env") && i + 1 < argv.len() {
            let key = argv[i + 1].split('=').next().unwrap_or("").to_string();
            redacted.push(format!("{}=REDACTED", key));
            i += 2;
        } else {
            i += 1;
        }
    }
    redacted
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redact_argv_masks_env_values() {
        let argv = vec![
            "docker".to_string(),
            "run".to_string(),
            "-e".to_string(),
            "API_KEY=s3cret".to_string(),
            "image".to_string(),
        ];
        let redacted = redact_argv(&argv);
        assert_eq!(redacted[3], "API_KEY=REDACTED");
        assert_eq!(redacted[4], "image");
    }
}
