//! `BuildOrchestrator`: owns the per-build state machine and composes every
//! other component into one `Execute(buildId)` operation. Grounded on the
//! `process_build` shape in `examples/other_examples`
//! oore.build's `build_processor.rs` (load → mark running → step-by-step
//! execution → persist outcome, with failures at any step short-circuiting
//! straight to a terminal status) and on `src/server/server.rs`'s
//! power-lock-guarded, event-driven container lifecycle; the
//! spawn-then-supervise invocation shape is the same "never let one job's
//! panic take the process down" pattern used by komodo's `execute` module.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex as SyncMutex;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::api::RepositoryProvider;
use crate::cancel::CancellationRegistry;
use crate::config::Configuration;
use crate::container::{ContainerError, ContainerRuntime, ContainerSpec, LineCallback, MountSpec};
use crate::db::{BuildsRepo, Db, DbResult, ProjectsRepo};
use crate::log::LogSink;
use crate::model::{short_sha, Build, BuildId, BuildStatus, Project, Secret};
use crate::pathresolve::PathResolver;
use crate::repo::RepoPreparer;
use crate::status::{EmailSender, StatusReporter};
use crate::tools::{ToolError, ToolProvisioner, RUNNER_PATH};

/// Environment variable the in-container runner reads its hosting-provider
/// credential from, set by `ToolProvisioner::configure_vcs_credentials` and
/// passed the same way any other secret is (container-create env channel,
/// never argv).
const VCS_TOKEN_ENV_VAR: &str = "ANDO_VCS_TOKEN";

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("repository unavailable: {0}")]
    RepoUnavailable(String),

    #[error("container create failed: {0}")]
    ContainerCreateFailed(String),

    #[error("tool provisioning failed: {0}")]
    ToolProvisioningFailed(String),

    #[error("runner start failed: {0}")]
    RunnerStartFailed(String),

    #[error("requested profile unavailable: {0}")]
    ProfileMismatch(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("timed out: {0}")]
    TimedOut(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type OrchestratorResult<T> = std::result::Result<T, OrchestratorError>;

/// Decrypts a project secret's opaque stored value into the cleartext to
/// inject as a container environment variable. Internals (key management,
/// cipher choice) are an out-of-scope collaborator (§1), mirrored here the
/// same way `RepositoryProvider` and `EmailSender` stand in for their own
/// out-of-scope collaborators: this crate only decides when to call it.
#[async_trait]
pub trait SecretDecryptor: Send + Sync {
    async fn decrypt(&self, secret: &Secret) -> anyhow::Result<String>;
}

pub struct BuildOrchestrator {
    db: Arc<Db>,
    runtime: Arc<dyn ContainerRuntime>,
    provider: Arc<dyn RepositoryProvider>,
    email: Arc<dyn EmailSender>,
    secrets: Arc<dyn SecretDecryptor>,
    cancel_registry: Arc<CancellationRegistry>,
    repo: Arc<dyn RepoPreparer>,
    config: Arc<Configuration>,
}

impl BuildOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Arc<Db>,
        runtime: Arc<dyn ContainerRuntime>,
        provider: Arc<dyn RepositoryProvider>,
        email: Arc<dyn EmailSender>,
        secrets: Arc<dyn SecretDecryptor>,
        cancel_registry: Arc<CancellationRegistry>,
        repo: Arc<dyn RepoPreparer>,
        config: Arc<Configuration>,
    ) -> Self {
        Self {
            db,
            runtime,
            provider,
            email,
            secrets,
            cancel_registry,
            repo,
            config,
        }
    }

    /// Spawns `Execute(buildId)` onto its own task and supervises it with a
    /// second task that logs (but never propagates) a panic, so one build's
    /// bug can never take the process down (§4.1, "invocation shape").
    pub fn spawn(orchestrator: Arc<Self>, build_id: BuildId) {
        tokio::spawn(async move {
            let handle = tokio::spawn({
                let orchestrator = orchestrator.clone();
                async move { orchestrator.execute(build_id).await }
            });
            if let Err(join_error) = handle.await {
                if join_error.is_panic() {
                    error!(build_id = build_id.0, "build execution task panicked");
                }
            }
        });
    }

    /// Drives `build_id` from `Queued` to a terminal status and returns.
    /// Refuses to run concurrently with another execution already
    /// registered for the same id (§4.1, §8: idempotent registration).
    pub async fn execute(&self, build_id: BuildId) {
        let Some((mut build, mut project)) = self.load(build_id).await else {
            return;
        };

        if build.status != BuildStatus::Queued {
            warn!(build_id = build_id.0, status = build.status.as_str(), "execute: build is not queued, skipping");
            return;
        }
        if self.cancel_registry.is_running(build_id) {
            warn!(build_id = build_id.0, "execute: already running, refusing second execution");
            return;
        }

        let token = self.cancel_registry.register(build_id);
        let log = Arc::new(LogSink::new(build_id, self.config.log_verbosity));

        build.mark_running();
        if let Err(e) = self.save_build(&build).await {
            error!(build_id = build_id.0, error = %e, "failed to persist running transition");
        }

        let status_reporter = StatusReporter::new(self.provider.as_ref(), self.email.as_ref(), &self.config.base_url);
        status_reporter.report_pending(&project, &build).await;

        let effective_timeout_minutes = project.timeout_minutes.min(self.config.max_timeout_minutes);
        let timeout = Duration::from_secs(u64::from(effective_timeout_minutes) * 60);

        let mut container_id: Option<String> = None;

        let outcome: OrchestratorResult<i64> = if timeout.is_zero() {
            self.cancel_registry.cancel_for_timeout(build_id);
            Err(OrchestratorError::TimedOut(format!("timed out after {} minutes", effective_timeout_minutes)))
        } else {
            let done = CancellationToken::new();
            let timer = spawn_timeout_timer(self.cancel_registry.clone(), build_id, token.clone(), done.clone(), timeout);
            let result = self.run_build(&build, &mut project, &token, &log, &mut container_id).await;
            done.cancel();
            let _ = timer.await;
            result
        };

        if matches!(outcome, Ok(0)) {
            if let Some(id) = &container_id {
                let collector = crate::artifacts::ArtifactCollector::new(
                    self.runtime.as_ref(),
                    self.config.artifacts_path.clone(),
                    self.config.artifact_retention_days,
                );
                match self.db.checkout().await {
                    Ok(conn) => {
                        if let Err(e) = collector.collect(&conn, build_id, project.id, id).await {
                            warn!(build_id = build_id.0, error = %e, "artifact collection failed, build outcome unaffected");
                        }
                    }
                    Err(e) => warn!(build_id = build_id.0, error = %e, "could not check out connection for artifact collection"),
                }
            }
        }

        if let Some(id) = &container_id {
            if let Err(e) = self.runtime.remove(id).await {
                warn!(build_id = build_id.0, container_id = %id, error = %e, "container removal failed");
            }
        }

        let (status, error_message) = match outcome {
            Ok(0) => (BuildStatus::Success, None),
            Ok(_) => (BuildStatus::Failed, Some("build script exited with a non-zero status".to_string())),
            Err(OrchestratorError::TimedOut(msg)) => (BuildStatus::TimedOut, Some(msg)),
            Err(OrchestratorError::Cancelled) => {
                if self.cancel_registry.was_timeout(build_id) {
                    (
                        BuildStatus::TimedOut,
                        Some(format!(
                            "timed out after {} minute{}",
                            effective_timeout_minutes,
                            if effective_timeout_minutes == 1 { "" } else { "s" }
                        )),
                    )
                } else {
                    (BuildStatus::Cancelled, Some("build cancelled".to_string()))
                }
            }
            Err(e) => (BuildStatus::Failed, Some(e.to_string())),
        };

        build.steps_failed = if status == BuildStatus::Success { 0 } else { 1 };
        build.mark_terminal(status, error_message);
        if let Err(e) = self.save_build(&build).await {
            error!(build_id = build_id.0, error = %e, "failed to persist terminal transition");
        }

        self.cancel_registry.unregister(build_id);

        status_reporter.report_terminal(&project, &build).await;
        status_reporter.maybe_notify_failure(&project, &build).await;

        info!(build_id = build_id.0, status = build.status.as_str(), "build finished");
    }

    /// The `Loaded → … → Finished` portion of the state machine. Returns the
    /// runner's exit code on a completed run, or the `OrchestratorError`
    /// explaining why it never got that far.
    async fn run_build(
        &self,
        build: &Build,
        project: &mut Project,
        token: &CancellationToken,
        log: &Arc<LogSink>,
        container_id: &mut Option<String>,
    ) -> OrchestratorResult<i64> {
        let detected = self
            .provider
            .detect_profiles(&project.repo_full_name, &build.branch)
            .await
            .map_err(|e| OrchestratorError::Internal(format!("profile detection failed: {e}")))?;

        {
            let conn = self.db.checkout().await.map_err(|e| OrchestratorError::Internal(e.to_string()))?;
            if let Err(e) = ProjectsRepo::update_available_profiles(&conn, project.id, &detected) {
                warn!(project_id = project.id.0, error = %e, "failed to persist detected profiles");
            }
        }
        project.available_profiles = detected.clone();

        if let Some(wanted) = &project.profile {
            if !detected.iter().any(|p| p == wanted) {
                return Err(OrchestratorError::ProfileMismatch(format!(
                    "profile {:?} not found; detected profiles: [{}]",
                    wanted,
                    detected.join(", ")
                )));
            }
        }

        let vcs_token = self
            .provider
            .mint_installation_token(project.installation_id, &project.repo_full_name)
            .await
            .map_err(|e| OrchestratorError::RepoUnavailable(format!("failed to mint installation token: {e}")))?;

        let working_path = self
            .config
            .repos_path
            .join(project.id.0.to_string())
            .join(short_sha(&build.commit_sha));

        {
            let conn = self.db.checkout().await.map_err(|e| OrchestratorError::Internal(e.to_string()))?;
            let prepared = self
                .repo
                .prepare(
                    project.id,
                    project.installation_id,
                    &project.repo_full_name,
                    &build.branch,
                    &build.commit_sha,
                    &working_path,
                    Some(vcs_token.clone()),
                    self.provider.as_ref(),
                    log,
                    &conn,
                    token,
                )
                .await;

            match prepared {
                Ok(true) => {}
                Ok(false) => {
                    return Err(OrchestratorError::RepoUnavailable(format!(
                        "could not prepare working tree at commit {}",
                        short_sha(&build.commit_sha)
                    )))
                }
                Err(_cancelled) => return Err(OrchestratorError::Cancelled),
            }
        }

        self.runtime
            .ensure_network(&self.config.builds_network_name)
            .await
            .map_err(|e| OrchestratorError::ContainerCreateFailed(e.to_string()))?;

        let resolver = PathResolver::new(self.runtime.as_ref(), &self.config.path_overrides);
        let host_working_path = resolver.resolve_host_path(&working_path.to_string_lossy()).await;

        let mut env = Vec::with_capacity(project.secrets.len() + 2);
        for secret in &project.secrets {
            let value = self
                .secrets
                .decrypt(secret)
                .await
                .map_err(|e| OrchestratorError::Internal(format!("secret decryption failed for {}: {e}", secret.name)))?;
            env.push((secret.name.clone(), value));
        }
        env.push(("ANDO_HOST_ROOT".to_string(), host_working_path.clone()));
        env.push((VCS_TOKEN_ENV_VAR.to_string(), vcs_token.clone()));

        let image = project.docker_image.clone().unwrap_or_else(|| self.config.default_docker_image.clone());
        let mut mounts = vec![MountSpec {
            host_path: host_working_path,
            container_path: "/workspace".to_string(),
            read_only: false,
        }];
        if project.dind {
            // The point of DIND is the daemon socket mount: without it the
            // runner has nothing to launch nested containers against.
            mounts.push(MountSpec {
                host_path: self.config.docker_socket_path.clone(),
                container_path: "/var/run/docker.sock".to_string(),
                read_only: false,
            });
        }
        let spec = ContainerSpec {
            image,
            mounts,
            env,
            workdir: "/workspace".to_string(),
            network: self.config.builds_network_name.clone(),
            dind: project.dind,
        };

        let id = match self.runtime.create(&spec, token).await {
            Ok(id) => id,
            Err(ContainerError::Cancelled) => return Err(OrchestratorError::Cancelled),
            Err(e) => return Err(OrchestratorError::ContainerCreateFailed(e.to_string())),
        };
        *container_id = Some(id.clone());

        let tools = ToolProvisioner::new(self.runtime.as_ref());
        tools.ensure_runner(&id, token).await.map_err(tool_err)?;
        tools.ensure_vcs(&id, token).await.map_err(tool_err)?;
        if project.dind {
            tools.ensure_container_cli(&id, token).await.map_err(tool_err)?;
        }
        tools.ensure_release_cli(&id, token).await.map_err(tool_err)?;

        let provider_host = host_from_base_url(&self.config.repository_provider.base_url);
        tools
            .configure_vcs_credentials(&id, &provider_host, VCS_TOKEN_ENV_VAR, token)
            .await
            .map_err(tool_err)?;

        // `--read-env` only tells the runner to read its secrets from its own
        // environment; the secret values themselves travel solely through the
        // container-create env channel above, never through argv. Keep it
        // that way: argv ends up in `debug!`-level exec logging.
        let mut argv = vec![RUNNER_PATH.to_string(), "run".to_string()];
        if project.dind {
            argv.push("--dind".to_string());
        }
        if !project.secrets.is_empty() {
            argv.push("--read-env".to_string());
        }
        if let Some(profile) = &project.profile {
            argv.push("-p".to_string());
            argv.push(profile.clone());
        }

        // Persist each line inline, on the same call stack that reads it off
        // the container's stdout/stderr, instead of funneling it through a
        // channel a separate task drains: there is then no queue that can
        // grow unbounded if persistence is slower than the runner's output
        // (§4.6). The connection is checked out once for the whole runner
        // invocation and held under a sync lock since the two callbacks are
        // only ever invoked one at a time from `exec`'s single reader loop,
        // never concurrently with each other.
        let runner_conn = self.db.checkout().await.map_err(|e| OrchestratorError::Internal(e.to_string()))?;
        let runner_conn = SyncMutex::new(runner_conn);

        let on_stdout: LineCallback = Box::new(|line: &str| {
            if let Err(e) = log.output_line(&runner_conn.lock(), line) {
                warn!(error = %e, "failed to persist runner stdout line");
            }
        });
        let on_stderr: LineCallback = Box::new(|line: &str| {
            if let Err(e) = log.output_line(&runner_conn.lock(), line) {
                warn!(error = %e, "failed to persist runner stderr line");
            }
        });

        let exit = self.runtime.exec(&id, &argv, "/workspace", &[], on_stdout, on_stderr, token).await;
        drop(runner_conn);

        match exit {
            Ok(code) => Ok(code),
            Err(ContainerError::Cancelled) => Err(OrchestratorError::Cancelled),
            Err(e) => Err(OrchestratorError::RunnerStartFailed(e.to_string())),
        }
    }

    async fn load(&self, build_id: BuildId) -> Option<(Build, Project)> {
        let conn = match self.db.checkout().await {
            Ok(conn) => conn,
            Err(e) => {
                error!(build_id = build_id.0, error = %e, "execute: failed to check out db connection");
                return None;
            }
        };

        let build = match BuildsRepo::get(&conn, build_id) {
            Ok(Some(build)) => build,
            Ok(None) => {
                warn!(build_id = build_id.0, "execute: build not found");
                return None;
            }
            Err(e) => {
                error!(build_id = build_id.0, error = %e, "execute: failed to load build");
                return None;
            }
        };

        let project = match ProjectsRepo::get(&conn, build.project_id) {
            Ok(Some(project)) => project,
            Ok(None) => {
                warn!(build_id = build_id.0, project_id = build.project_id.0, "execute: project not found");
                return None;
            }
            Err(e) => {
                error!(build_id = build_id.0, error = %e, "execute: failed to load project");
                return None;
            }
        };

        Some((build, project))
    }

    async fn save_build(&self, build: &Build) -> DbResult<()> {
        let conn = self.db.checkout().await?;
        BuildsRepo::save(&conn, build)
    }
}

fn tool_err(e: ToolError) -> OrchestratorError {
    if matches!(e, ToolError::Container(ContainerError::Cancelled)) {
        OrchestratorError::Cancelled
    } else {
        OrchestratorError::ToolProvisioningFailed(e.to_string())
    }
}

/// Strips scheme and path from a configured base URL, leaving the bare host
/// `git-credentials` entries are scoped to.
fn host_from_base_url(url: &str) -> String {
    let without_scheme = url.split("://").nth(1).unwrap_or(url);
    without_scheme.split('/').next().unwrap_or(without_scheme).to_string()
}

fn spawn_timeout_timer(
    registry: Arc<CancellationRegistry>,
    build_id: BuildId,
    token: CancellationToken,
    done: CancellationToken,
    duration: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {
                registry.cancel_for_timeout(build_id);
            }
            _ = token.cancelled() => {}
            _ = done.cancelled() => {}
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ApiError, ApiResult, CommitState};
    use crate::container::{ContainerResult, MountInfo};
    use crate::model::{ProjectId, Secret};
    use std::collections::HashMap;
    use std::path::Path;
    use std::sync::Mutex;

    struct FakeRuntime {
        network_calls: Mutex<u32>,
        created: Mutex<Vec<String>>,
        removed: Mutex<Vec<String>>,
        next_id: Mutex<u64>,
        tool_present: HashMap<&'static str, i64>,
        runner_present: bool,
        runner_exit_code: i64,
        runner_delay: Duration,
        runner_stdout: Vec<&'static str>,
        copy_files: Vec<(&'static str, &'static [u8])>,
    }

    impl Default for FakeRuntime {
        fn default() -> Self {
            Self {
                network_calls: Mutex::new(0),
                created: Mutex::new(vec![]),
                removed: Mutex::new(vec![]),
                next_id: Mutex::new(0),
                tool_present: HashMap::new(),
                runner_present: true,
                runner_exit_code: 0,
                runner_delay: Duration::ZERO,
                runner_stdout: vec![],
                copy_files: vec![],
            }
        }
    }

    #[async_trait]
    impl ContainerRuntime for FakeRuntime {
        async fn ensure_network(&self, _name: &str) -> ContainerResult<()> {
            *self.network_calls.lock().unwrap() += 1;
            Ok(())
        }

        async fn create(&self, _spec: &ContainerSpec, _cancel: &CancellationToken) -> ContainerResult<String> {
            let mut next = self.next_id.lock().unwrap();
            *next += 1;
            let id = format!("fake-{}", *next);
            self.created.lock().unwrap().push(id.clone());
            Ok(id)
        }

        async fn exec(
            &self,
            _container_id: &str,
            argv: &[String],
            _workdir: &str,
            _env: &[(String, String)],
            mut on_stdout: LineCallback<'_>,
            _on_stderr: LineCallback<'_>,
            cancel: &CancellationToken,
        ) -> ContainerResult<i64> {
            match argv.first().map(String::as_str) {
                Some(RUNNER_PATH) => {
                    for line in &self.runner_stdout {
                        on_stdout(line);
                    }
                    if self.runner_delay.is_zero() {
                        return Ok(self.runner_exit_code);
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(self.runner_delay) => Ok(self.runner_exit_code),
                        _ = cancel.cancelled() => Err(ContainerError::Cancelled),
                    }
                }
                Some("command") => {
                    let tool = argv.get(2).map(String::as_str).unwrap_or("");
                    Ok(*self.tool_present.get(tool).unwrap_or(&0))
                }
                Some("test") => Ok(if self.runner_present { 0 } else { 1 }),
                _ => Ok(0),
            }
        }

        async fn copy_out(&self, _container_id: &str, _src_path: &str, dest_dir: &Path) -> ContainerResult<()> {
            std::fs::create_dir_all(dest_dir).unwrap();
            for (name, contents) in &self.copy_files {
                std::fs::write(dest_dir.join(name), contents).unwrap();
            }
            Ok(())
        }

        async fn remove(&self, container_id: &str) -> ContainerResult<()> {
            self.removed.lock().unwrap().push(container_id.to_string());
            Ok(())
        }

        async fn inspect_mounts(&self, _container_ref: &str) -> ContainerResult<Vec<MountInfo>> {
            Ok(vec![])
        }
    }

    struct FakeProvider {
        profiles: Vec<String>,
        statuses: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl RepositoryProvider for FakeProvider {
        async fn mint_installation_token(&self, _installation_id: Option<i64>, _repo_full_name: &str) -> ApiResult<String> {
            Ok("token-abc".to_string())
        }
        async fn detect_profiles(&self, _repo_full_name: &str, _branch: &str) -> ApiResult<Vec<String>> {
            Ok(self.profiles.clone())
        }
        async fn post_commit_status(
            &self,
            _repo_full_name: &str,
            _commit_sha: &str,
            state: CommitState,
            description: &str,
            _target_url: Option<&str>,
        ) -> ApiResult<()> {
            self.statuses.lock().unwrap().push((state.as_str().to_string(), description.to_string()));
            Ok(())
        }
    }

    struct FakeEmail {
        address: Option<String>,
        sent: Mutex<u32>,
    }

    #[async_trait]
    impl EmailSender for FakeEmail {
        async fn send_failure_notification(&self, _address: &str, _project: &Project, _build: &Build) -> anyhow::Result<()> {
            *self.sent.lock().unwrap() += 1;
            Ok(())
        }
        async fn resolve_address(&self, _project: &Project) -> Option<String> {
            self.address.clone()
        }
    }

    struct FakeSecrets;

    #[async_trait]
    impl SecretDecryptor for FakeSecrets {
        async fn decrypt(&self, secret: &Secret) -> anyhow::Result<String> {
            Ok(String::from_utf8_lossy(&secret.encrypted_value).to_string())
        }
    }

    /// In-memory stand-in for `GitRepoPreparer`: touches neither the
    /// filesystem nor the network, so the orchestrator's state machine stays
    /// exercisable without a real `git` process (§8).
    struct FakeRepoPreparer {
        succeeds: bool,
    }

    impl Default for FakeRepoPreparer {
        fn default() -> Self {
            Self { succeeds: true }
        }
    }

    #[async_trait]
    impl RepoPreparer for FakeRepoPreparer {
        async fn prepare(
            &self,
            _project_id: ProjectId,
            _installation_id: Option<i64>,
            _repo_full_name: &str,
            _branch: &str,
            _commit_sha: &str,
            working_path: &Path,
            _token_override: Option<String>,
            _provider: &dyn RepositoryProvider,
            _log: &LogSink,
            _log_conn: &rusqlite::Connection,
            _cancel: &CancellationToken,
        ) -> crate::repo::RepoResult<bool> {
            if self.succeeds {
                std::fs::create_dir_all(working_path).ok();
            }
            Ok(self.succeeds)
        }
    }

    fn test_config(tmp: &tempfile::TempDir) -> Configuration {
        let mut config = Configuration::default();
        config.repos_path = tmp.path().join("repos");
        config.artifacts_path = tmp.path().join("artifacts");
        config.max_timeout_minutes = 60;
        config.max_concurrent_builds = 4;
        config.repository_provider.base_url = "https://api.example.com".to_string();
        config
    }

    async fn seed(project: Project, build: Build) -> Arc<Db> {
        let db = Arc::new(Db::open_in_memory().unwrap());
        let conn = db.checkout().await.unwrap();
        ProjectsRepo::insert(&conn, &project).unwrap();
        BuildsRepo::insert(&conn, &build).unwrap();
        drop(conn);
        db
    }

    fn base_project(notify_on_failure: bool) -> Project {
        Project {
            id: ProjectId(7),
            repo_full_name: "acme/widgets".to_string(),
            installation_id: Some(99),
            docker_image: None,
            timeout_minutes: 30,
            profile: None,
            available_profiles: vec![],
            notify_on_failure,
            secrets: vec![Secret { name: "API_KEY".to_string(), encrypted_value: b"s3cret".to_vec() }],
            dind: false,
        }
    }

    fn base_build() -> Build {
        Build::new(BuildId(42), ProjectId(7), "main".to_string(), "abcdef0123456789".to_string())
    }

    #[tokio::test]
    async fn happy_path_reaches_success_and_collects_one_artifact() {
        let tmp = tempfile::tempdir().unwrap();
        let config = Arc::new(test_config(&tmp));
        let db = seed(base_project(false), base_build()).await;

        let runtime = Arc::new(FakeRuntime { copy_files: vec![("out.txt", b"hello world!!")], ..Default::default() });
        let provider = Arc::new(FakeProvider { profiles: vec![], statuses: Mutex::new(vec![]) });
        let email = Arc::new(FakeEmail { address: None, sent: Mutex::new(0) });
        let registry = Arc::new(CancellationRegistry::new());

        let orchestrator = Arc::new(BuildOrchestrator::new(
            db.clone(),
            runtime.clone(),
            provider.clone(),
            email,
            Arc::new(FakeSecrets),
            registry,
            Arc::new(FakeRepoPreparer::default()),
            config,
        ));

        orchestrator.execute(BuildId(42)).await;

        let conn = db.checkout().await.unwrap();
        let build = BuildsRepo::get(&conn, BuildId(42)).unwrap().unwrap();
        assert_eq!(build.status, BuildStatus::Success);
        assert_eq!(build.steps_failed, 0);

        let artifacts = crate::db::ArtifactsRepo::for_build(&conn, BuildId(42)).unwrap();
        assert_eq!(artifacts.len(), 1);
        assert_eq!(artifacts[0].name, "out.txt");

        assert_eq!(runtime.created.lock().unwrap().len(), 1);
        assert_eq!(runtime.removed.lock().unwrap().len(), 1, "container must be removed even on success");

        let statuses = provider.statuses.lock().unwrap();
        assert_eq!(statuses[0].0, "pending");
        assert_eq!(statuses.last().unwrap().0, "success");
    }

    #[tokio::test]
    async fn profile_mismatch_fails_before_any_container_is_created() {
        let tmp = tempfile::tempdir().unwrap();
        let config = Arc::new(test_config(&tmp));

        let mut project = base_project(false);
        project.profile = Some("release".to_string());
        let db = seed(project, base_build()).await;

        let runtime = Arc::new(FakeRuntime::default());
        let provider = Arc::new(FakeProvider { profiles: vec!["debug".to_string()], statuses: Mutex::new(vec![]) });
        let email = Arc::new(FakeEmail { address: None, sent: Mutex::new(0) });
        let registry = Arc::new(CancellationRegistry::new());

        let orchestrator = Arc::new(BuildOrchestrator::new(
            db.clone(),
            runtime.clone(),
            provider,
            email,
            Arc::new(FakeSecrets),
            registry,
            Arc::new(FakeRepoPreparer::default()),
            config,
        ));

        orchestrator.execute(BuildId(42)).await;

        let conn = db.checkout().await.unwrap();
        let build = BuildsRepo::get(&conn, BuildId(42)).unwrap().unwrap();
        assert_eq!(build.status, BuildStatus::Failed);
        let message = build.error_message.unwrap();
        assert!(message.contains("release"));
        assert!(message.contains("debug"));

        assert!(runtime.created.lock().unwrap().is_empty(), "no container should be created on profile mismatch");
    }

    #[tokio::test]
    async fn external_cancel_during_runner_reaches_cancelled_and_removes_container() {
        let tmp = tempfile::tempdir().unwrap();
        let config = Arc::new(test_config(&tmp));
        let db = seed(base_project(false), base_build()).await;

        let runtime = Arc::new(FakeRuntime { runner_delay: Duration::from_secs(120), ..Default::default() });
        let provider = Arc::new(FakeProvider { profiles: vec![], statuses: Mutex::new(vec![]) });
        let email = Arc::new(FakeEmail { address: Some("dev@example.com".to_string()), sent: Mutex::new(0) });
        let registry = Arc::new(CancellationRegistry::new());

        let orchestrator = Arc::new(BuildOrchestrator::new(
            db.clone(),
            runtime.clone(),
            provider.clone(),
            email.clone(),
            Arc::new(FakeSecrets),
            registry.clone(),
            Arc::new(FakeRepoPreparer::default()),
            config,
        ));

        let exec_handle = tokio::spawn({
            let orchestrator = orchestrator.clone();
            async move { orchestrator.execute(BuildId(42)).await }
        });

        // Give the orchestrator time to register the build and start the runner exec.
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(registry.try_cancel(BuildId(42)));

        exec_handle.await.unwrap();

        let conn = db.checkout().await.unwrap();
        let build = BuildsRepo::get(&conn, BuildId(42)).unwrap().unwrap();
        assert_eq!(build.status, BuildStatus::Cancelled);
        assert_eq!(runtime.removed.lock().unwrap().len(), 1);
        assert_eq!(*email.sent.lock().unwrap(), 0, "cancellation is not a failure notification trigger");

        let statuses = provider.statuses.lock().unwrap();
        assert_eq!(statuses.last().unwrap().0, "error");
    }

    #[tokio::test]
    async fn zero_effective_timeout_times_out_immediately_without_a_container() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = test_config(&tmp);
        config.max_timeout_minutes = 0;
        let config = Arc::new(config);

        let mut project = base_project(false);
        project.timeout_minutes = 0;
        let db = seed(project, base_build()).await;

        let runtime = Arc::new(FakeRuntime::default());
        let provider = Arc::new(FakeProvider { profiles: vec![], statuses: Mutex::new(vec![]) });
        let email = Arc::new(FakeEmail { address: None, sent: Mutex::new(0) });
        let registry = Arc::new(CancellationRegistry::new());

        let orchestrator = Arc::new(BuildOrchestrator::new(
            db.clone(),
            runtime.clone(),
            provider,
            email,
            Arc::new(FakeSecrets),
            registry,
            Arc::new(FakeRepoPreparer::default()),
            config,
        ));

        orchestrator.execute(BuildId(42)).await;

        let conn = db.checkout().await.unwrap();
        let build = BuildsRepo::get(&conn, BuildId(42)).unwrap().unwrap();
        assert_eq!(build.status, BuildStatus::TimedOut);
        assert!(runtime.created.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failure_notification_sent_only_when_build_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let config = Arc::new(test_config(&tmp));
        let db = seed(base_project(true), base_build()).await;

        let runtime = Arc::new(FakeRuntime { runner_exit_code: 2, ..Default::default() });
        let provider = Arc::new(FakeProvider { profiles: vec![], statuses: Mutex::new(vec![]) });
        let email = Arc::new(FakeEmail { address: Some("dev@example.com".to_string()), sent: Mutex::new(0) });
        let registry = Arc::new(CancellationRegistry::new());

        let orchestrator = Arc::new(BuildOrchestrator::new(
            db.clone(),
            runtime,
            provider,
            email.clone(),
            Arc::new(FakeSecrets),
            registry,
            Arc::new(FakeRepoPreparer::default()),
            config,
        ));

        orchestrator.execute(BuildId(42)).await;

        let conn = db.checkout().await.unwrap();
        let build = BuildsRepo::get(&conn, BuildId(42)).unwrap().unwrap();
        assert_eq!(build.status, BuildStatus::Failed);
        assert_eq!(build.steps_failed, 1);
        assert_eq!(*email.sent.lock().unwrap(), 1);
    }
}
