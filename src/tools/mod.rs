//! `ToolProvisioner`: ensures the runner, container CLI, VCS client, and
//! release CLI are present inside a running build container, installing them
//! on demand. Grounded on the probe-then-install shape of
//! `src/server/install.rs` (`before_execute`'s image-inspection and
//! package-install steps), adapted from "install into a fresh installer
//! container" to "install into an already-running build container" via
//! `ContainerRuntime::exec`.

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::container::ContainerRuntime;

#[derive(Error, Debug)]
pub enum ToolError {
    #[error("container error: {0}")]
    Container(#[from] crate::container::ContainerError),

    #[error("no recognized package manager in image: {0}")]
    UnsupportedImage(String),

    #[error("install failed for {tool}: {detail}")]
    InstallFailed { tool: String, detail: String },
}

pub type ToolResult<T> = std::result::Result<T, ToolError>;

/// Fixed install location for the runner binary, independent of `PATH`
/// shape inside the image (§4.4).
pub const RUNNER_PATH: &str = "/tmp/ando-tools/ando";

const WORKDIR: &str = "/workspace";

enum PackageManager {
    Apk,
    AptGet,
}

pub struct ToolProvisioner<'a> {
    runtime: &'a dyn ContainerRuntime,
}

impl<'a> ToolProvisioner<'a> {
    pub fn new(runtime: &'a dyn ContainerRuntime) -> Self {
        Self { runtime }
    }

    async fn probe(&self, container_id: &str, command: &str, cancel: &CancellationToken) -> ToolResult<bool> {
        let argv = vec!["command".to_string(), "-v".to_string(), command.to_string()];
        let exit = self
            .runtime
            .exec(container_id, &argv, WORKDIR, &[], Box::new(|_| {}), Box::new(|_| {}), cancel)
            .await?;
        Ok(exit == 0)
    }

    async fn detect_package_manager(
        &self,
        container_id: &str,
        cancel: &CancellationToken,
    ) -> ToolResult<PackageManager> {
        if self.probe(container_id, "apk", cancel).await? {
            Ok(PackageManager::Apk)
        } else if self.probe(container_id, "apt-get", cancel).await? {
            Ok(PackageManager::AptGet)
        } else {
            Err(ToolError::UnsupportedImage(container_id.to_string()))
        }
    }

    async fn install_packages(
        &self,
        container_id: &str,
        tool: &str,
        packages: &[&str],
        cancel: &CancellationToken,
    ) -> ToolResult<()> {
        let manager = self.detect_package_manager(container_id, cancel).await?;
        let quoted = shell_words::join(packages.iter().copied());
        let script = match manager {
            PackageManager::Apk => format!("apk add --no-cache {}", quoted),
            PackageManager::AptGet => format!(
                "apt-get update && apt-get install -y --no-install-recommends {}",
                quoted
            ),
        };
        let argv = vec!["sh".to_string(), "-c".to_string(), script];

        let mut stderr = String::new();
        let exit = self
            .runtime
            .exec(
                container_id,
                &argv,
                WORKDIR,
                &[],
                Box::new(|_| {}),
                Box::new(|line| stderr.push_str(line)),
                cancel,
            )
            .await?;

        if exit == 0 {
            Ok(())
        } else {
            Err(ToolError::InstallFailed {
                tool: tool.to_string(),
                detail: stderr,
            })
        }
    }

    /// Installs the `ando` runner binary to `RUNNER_PATH` if not already
    /// present. Idempotent: a second call is a no-op probe.
    pub async fn ensure_runner(&self, container_id: &str, cancel: &CancellationToken) -> ToolResult<()> {
        let argv = vec!["test".to_string(), "-x".to_string(), RUNNER_PATH.to_string()];
        let exit = self
            .runtime
            .exec(container_id, &argv, WORKDIR, &[], Box::new(|_| {}), Box::new(|_| {}), cancel)
            .await?;
        if exit == 0 {
            return Ok(());
        }

        let install_dir = std::path::Path::new(RUNNER_PATH)
            .parent()
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_else(|| "/tmp/ando-tools".to_string());
        let script = format!(
            "mkdir -p {dir} && curl -fsSL https://ando.example/install/runner -o {path} && chmod +x {path}",
            dir = install_dir,
            path = RUNNER_PATH
        );
        let argv = vec!["sh".to_string(), "-c".to_string(), script];

        let mut stderr = String::new();
        let exit = self
            .runtime
            .exec(
                container_id,
                &argv,
                WORKDIR,
                &[],
                Box::new(|_| {}),
                Box::new(|line| stderr.push_str(line)),
                cancel,
            )
            .await?;

        if exit == 0 {
            Ok(())
        } else {
            Err(ToolError::InstallFailed { tool: "runner".to_string(), detail: stderr })
        }
    }

    pub async fn ensure_container_cli(&self, container_id: &str, cancel: &CancellationToken) -> ToolResult<()> {
        if self.probe(container_id, "docker", cancel).await? {
            return Ok(());
        }
        self.install_packages(container_id, "docker-cli", &["docker-cli"], cancel).await
    }

    pub async fn ensure_vcs(&self, container_id: &str, cancel: &CancellationToken) -> ToolResult<()> {
        if self.probe(container_id, "git", cancel).await? {
            return Ok(());
        }
        self.install_packages(container_id, "git", &["git"], cancel).await
    }

    pub async fn ensure_release_cli(&self, container_id: &str, cancel: &CancellationToken) -> ToolResult<()> {
        if self.probe(container_id, "gh", cancel).await? {
            return Ok(());
        }
        self.install_packages(container_id, "gh", &["github-cli"], cancel).await
    }

    /// Writes hosting-provider credentials scoped to `provider_host` if a
    /// token environment variable is present, and configures a committer
    /// identity with documented fallback precedence (§4.4). Never overwrites
    /// an existing committer identity.
    pub async fn configure_vcs_credentials(
        &self,
        container_id: &str,
        provider_host: &str,
        token_env_var: &str,
        cancel: &CancellationToken,
    ) -> ToolResult<()> {
        let script = format!(
            r#"
set -e
if [ -n "${token_env_var}" ]; then
  umask 077
  printf 'https://x-access-token:%s@{host}\n' "${token_env_var}" > /root/.git-credentials
  git config --global credential.helper store
  git config --global credential.useHttpPath false
fi
if ! git config --global user.name >/dev/null 2>&1; then
  name="${{GIT_COMMITTER_NAME:-${{GIT_AUTHOR_NAME:-${{GIT_USER_NAME:-ando-build}}}}}}"
  email="${{GIT_COMMITTER_EMAIL:-${{GIT_AUTHOR_EMAIL:-${{GIT_USER_EMAIL:-ando-build@localhost}}}}}}"
  git config --global user.name "$name"
  git config --global user.email "$email"
fi
"#,
            token_env_var = token_env_var,
            host = provider_host,
        );
        let argv = vec!["sh".to_string(), "-c".to_string(), script];

        let mut stderr = String::new();
        let exit = self
            .runtime
            .exec(
                container_id,
                &argv,
                WORKDIR,
                &[],
                Box::new(|_| {}),
                Box::new(|line| stderr.push_str(line)),
                cancel,
            )
            .await?;

        if exit == 0 {
            Ok(())
        } else {
            Err(ToolError::InstallFailed { tool: "vcs-credentials".to_string(), detail: stderr })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{ContainerResult, ContainerSpec, LineCallback, MountInfo};
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::Mutex;

    struct FakeRuntime {
        responses: Mutex<Vec<i64>>,
        calls: Mutex<Vec<Vec<String>>>,
    }

    #[async_trait]
    impl ContainerRuntime for FakeRuntime {
        async fn ensure_network(&self, _name: &str) -> ContainerResult<()> {
            Ok(())
        }
        async fn create(&self, _spec: &ContainerSpec, _cancel: &CancellationToken) -> ContainerResult<String> {
            Ok("fake".to_string())
        }
        async fn exec(
            &self,
            _container_id: &str,
            argv: &[String],
            _workdir: &str,
            _env: &[(String, String)],
            _on_stdout: LineCallback<'_>,
            _on_stderr: LineCallback<'_>,
            _cancel: &CancellationToken,
        ) -> ContainerResult<i64> {
            self.calls.lock().unwrap().push(argv.to_vec());
            Ok(self.responses.lock().unwrap().remove(0))
        }
        async fn copy_out(&self, _container_id: &str, _src_path: &str, _dest_dir: &Path) -> ContainerResult<()> {
            Ok(())
        }
        async fn remove(&self, _container_id: &str) -> ContainerResult<()> {
            Ok(())
        }
        async fn inspect_mounts(&self, _container_ref: &str) -> ContainerResult<Vec<MountInfo>> {
            Ok(vec![])
        }
    }

    #[tokio::test]
    async fn ensure_vcs_skips_install_when_already_present() {
        let runtime = FakeRuntime { responses: Mutex::new(vec![0]), calls: Mutex::new(vec![]) };
        let provisioner = ToolProvisioner::new(&runtime);
        provisioner.ensure_vcs("c1", &CancellationToken::new()).await.unwrap();
        assert_eq!(runtime.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn ensure_vcs_installs_via_apk_when_absent() {
        let runtime = FakeRuntime { responses: Mutex::new(vec![1, 0, 0]), calls: Mutex::new(vec![]) };
        let provisioner = ToolProvisioner::new(&runtime);
        provisioner.ensure_vcs("c1", &CancellationToken::new()).await.unwrap();
        let calls = runtime.calls.lock().unwrap();
        assert_eq!(calls.len(), 3);
        assert!(calls[2].iter().any(|a| a.contains("apk add")));
    }

    #[tokio::test]
    async fn unsupported_image_reports_unsupported_error() {
        let runtime = FakeRuntime { responses: Mutex::new(vec![1, 1, 1]), calls: Mutex::new(vec![]) };
        let provisioner = ToolProvisioner::new(&runtime);
        let result = provisioner.ensure_vcs("c1", &CancellationToken::new()).await;
        assert!(matches!(result, Err(ToolError::UnsupportedImage(_))));
    }
}
