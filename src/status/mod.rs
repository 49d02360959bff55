//! `StatusReporter`: maps a build's internal status onto an external
//! commit-status state and conditionally sends a failure notification email.
//! Grounded on the commit-status half of `RepositoryProvider` (§6, born from
//! `HttpClient`'s retrying-request idiom) plus an `EmailSender` out-of-scope
//! collaborator trait mirrored the same way `RepositoryProvider` treats the
//! hosting provider: an external dependency the core only decides whether to
//! invoke.

use async_trait::async_trait;
use thiserror::Error;
use tracing::warn;

use crate::api::{CommitState, RepositoryProvider};
use crate::model::{Build, BuildStatus, Project};

#[derive(Error, Debug)]
pub enum StatusError {
    #[error("repository provider error: {0}")]
    Provider(#[from] crate::api::ApiError),

    #[error("notification error: {0}")]
    Notification(String),
}

pub type StatusResult<T> = std::result::Result<T, StatusError>;

/// External collaborator for failure-notification email; internals out of
/// scope for this crate (§4.9).
#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send_failure_notification(&self, address: &str, project: &Project, build: &Build) -> anyhow::Result<()>;

    /// Resolves the notification address for `project`'s owning user,
    /// itself reached through an out-of-scope user-management collaborator
    /// (§9.1).
    async fn resolve_address(&self, project: &Project) -> Option<String>;
}

fn commit_state_for(status: BuildStatus) -> Option<CommitState> {
    match status {
        BuildStatus::Success => Some(CommitState::Success),
        BuildStatus::Cancelled => Some(CommitState::Error),
        BuildStatus::TimedOut | BuildStatus::Failed => Some(CommitState::Failure),
        BuildStatus::Queued | BuildStatus::Running => None,
    }
}

fn description_for(build: &Build) -> String {
    match build.status {
        BuildStatus::Success | BuildStatus::TimedOut => {
            let duration = build.duration().map(|d| format!("{}s", d.num_seconds())).unwrap_or_default();
            if build.status == BuildStatus::Success {
                format!("build succeeded in {}", duration)
            } else {
                format!("build timed out after {}", duration)
            }
        }
        BuildStatus::Failed | BuildStatus::Cancelled => {
            build.error_message.clone().unwrap_or_else(|| "build failed".to_string())
        }
        BuildStatus::Queued | BuildStatus::Running => "build pending".to_string(),
    }
}

pub struct StatusReporter<'a> {
    provider: &'a dyn RepositoryProvider,
    email: &'a dyn EmailSender,
    base_url: &'a str,
}

impl<'a> StatusReporter<'a> {
    pub fn new(provider: &'a dyn RepositoryProvider, email: &'a dyn EmailSender, base_url: &'a str) -> Self {
        Self { provider, email, base_url }
    }

    fn target_url(&self, build: &Build) -> Option<String> {
        if self.base_url.is_empty() {
            None
        } else {
            Some(format!("{}/builds/{}", self.base_url.trim_end_matches('/'), build.id.0))
        }
    }

    /// Reports `Pending` after entering `Running`. Failures are logged and
    /// swallowed (§4.1, §7: `StatusEmissionFailed` never changes outcome).
    pub async fn report_pending(&self, project: &Project, build: &Build) {
        let target_url = self.target_url(build);
        if let Err(e) = self
            .provider
            .post_commit_status(
                &project.repo_full_name,
                &build.commit_sha,
                CommitState::Pending,
                "build started",
                target_url.as_deref(),
            )
            .await
        {
            warn!(build_id = build.id.0, error = %e, "failed to report pending commit status");
        }
    }

    /// Reports a terminal status. Failures are logged and swallowed.
    pub async fn report_terminal(&self, project: &Project, build: &Build) {
        let Some(state) = commit_state_for(build.status) else {
            return;
        };
        let description = description_for(build);
        let target_url = self.target_url(build);
        if let Err(e) = self
            .provider
            .post_commit_status(&project.repo_full_name, &build.commit_sha, state, &description, target_url.as_deref())
            .await
        {
            warn!(build_id = build.id.0, error = %e, "failed to report terminal commit status");
        }
    }

    /// Sends a failure-notification email only when the terminal status is
    /// `Failed`, `project.notify_on_failure` is true, and an address is
    /// resolvable (§4.1). A send failure is logged, not surfaced.
    pub async fn maybe_notify_failure(&self, project: &Project, build: &Build) {
        if build.status != BuildStatus::Failed || !project.notify_on_failure {
            return;
        }

        let Some(address) = self.email.resolve_address(project).await else {
            return;
        };

        if let Err(e) = self.email.send_failure_notification(&address, project, build).await {
            warn!(build_id = build.id.0, error = %e, "failed to send failure notification");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BuildId, ProjectId};
    use std::sync::Mutex;

    struct FakeProvider {
        calls: Mutex<Vec<(String, String)>>,
        fail: bool,
    }

    #[async_trait]
    impl RepositoryProvider for FakeProvider {
        async fn mint_installation_token(&self, _installation_id: Option<i64>, _repo_full_name: &str) -> crate::api::ApiResult<String> {
            Ok("token".to_string())
        }
        async fn detect_profiles(&self, _repo_full_name: &str, _branch: &str) -> crate::api::ApiResult<Vec<String>> {
            Ok(vec![])
        }
        async fn post_commit_status(
            &self,
            _repo_full_name: &str,
            _commit_sha: &str,
            state: CommitState,
            description: &str,
            _target_url: Option<&str>,
        ) -> crate::api::ApiResult<()> {
            if self.fail {
                return Err(crate::api::ApiError::Timeout);
            }
            self.calls.lock().unwrap().push((state.as_str().to_string(), description.to_string()));
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

    fn project(notify: bool) -> Project {
        Project {
            id: ProjectId(1),
            repo_full_name: "acme/widgets".into(),
            installation_id: None,
            docker_image: None,
            timeout_minutes: 30,
            profile: None,
            available_profiles: vec![],
            notify_on_failure: notify,
            secrets: vec![],
            dind: false,
        }
    }

    #[tokio::test]
    async fn terminal_status_maps_cancelled_to_error() {
        let provider = FakeProvider { calls: Mutex::new(vec![]), fail: false };
        let email = FakeEmail { address: None, sent: Mutex::new(0) };
        let reporter = StatusReporter::new(&provider, &email, "");
        let mut build = Build::new(BuildId(1), ProjectId(1), "main".into(), "a".repeat(40));
        build.mark_running();
        build.mark_terminal(BuildStatus::Cancelled, None);

        reporter.report_terminal(&project(false), &build).await;
        assert_eq!(provider.calls.lock().unwrap()[0].0, "error");
    }

    #[tokio::test]
    async fn notify_only_on_failed_with_flag_and_address() {
        let provider = FakeProvider { calls: Mutex::new(vec![]), fail: false };
        let email = FakeEmail { address: Some("dev@example.com".to_string()), sent: Mutex::new(0) };
        let reporter = StatusReporter::new(&provider, &email, "");

        let mut success = Build::new(BuildId(1), ProjectId(1), "main".into(), "a".repeat(40));
        success.mark_running();
        success.mark_terminal(BuildStatus::Success, None);
        reporter.maybe_notify_failure(&project(true), &success).await;
        assert_eq!(*email.sent.lock().unwrap(), 0);

        let mut failed = Build::new(BuildId(2), ProjectId(1), "main".into(), "a".repeat(40));
        failed.mark_running();
        failed.mark_terminal(BuildStatus::Failed, Some("exit 2".to_string()));
        reporter.maybe_notify_failure(&project(true), &failed).await;
        assert_eq!(*email.sent.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn notify_skipped_when_flag_is_false() {
        let provider = FakeProvider { calls: Mutex::new(vec![]), fail: false };
        let email = FakeEmail { address: Some("dev@example.com".to_string()), sent: Mutex::new(0) };
        let reporter = StatusReporter::new(&provider, &email, "");

        let mut failed = Build::new(BuildId(1), ProjectId(1), "main".into(), "a".repeat(40));
        failed.mark_running();
        failed.mark_terminal(BuildStatus::Failed, Some("exit 2".to_string()));
        reporter.maybe_notify_failure(&project(false), &failed).await;
        assert_eq!(*email.sent.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn report_failure_is_swallowed_and_logged() {
        let provider = FakeProvider { calls: Mutex::new(vec![]), fail: true };
        let email = FakeEmail { address: None, sent: Mutex::new(0) };
        let reporter = StatusReporter::new(&provider, &email, "");
        let mut build = Build::new(BuildId(1), ProjectId(1), "main".into(), "a".repeat(40));
        build.mark_running();
        build.mark_terminal(BuildStatus::Success, None);
        reporter.report_terminal(&project(false), &build).await;
    }
}
