use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::project::ProjectId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BuildId(pub i64);

impl fmt::Display for BuildId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Externally-visible build status. See SPEC_FULL §4.1 for the full state
/// machine; these are the only values ever written to `Build.status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Queued,
    Running,
    Success,
    Failed,
    Cancelled,
    TimedOut,
}

impl BuildStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, BuildStatus::Queued | BuildStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStatus::Queued => "queued",
            BuildStatus::Running => "running",
            BuildStatus::Success => "success",
            BuildStatus::Failed => "failed",
            BuildStatus::Cancelled => "cancelled",
            BuildStatus::TimedOut => "timed_out",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "queued" => BuildStatus::Queued,
            "running" => BuildStatus::Running,
            "success" => BuildStatus::Success,
            "failed" => BuildStatus::Failed,
            "cancelled" => BuildStatus::Cancelled,
            "timed_out" => BuildStatus::TimedOut,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Build {
    pub id: BuildId,
    pub project_id: ProjectId,
    pub branch: String,
    pub commit_sha: String,
    pub status: BuildStatus,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub steps_total: i64,
    pub steps_completed: i64,
    pub steps_failed: i64,
    pub error_message: Option<String>,
}

impl Build {
    pub fn new(id: BuildId, project_id: ProjectId, branch: String, commit_sha: String) -> Self {
        Self {
            id,
            project_id,
            branch,
            commit_sha,
            status: BuildStatus::Queued,
            queued_at: Utc::now(),
            started_at: None,
            finished_at: None,
            steps_total: 0,
            steps_completed: 0,
            steps_failed: 0,
            error_message: None,
        }
    }

    pub fn short_sha(&self) -> &str {
        short_sha(&self.commit_sha)
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }

    /// Transitions into `Running`, setting `started_at` once.
    pub fn mark_running(&mut self) {
        self.status = BuildStatus::Running;
        self.started_at.get_or_insert_with(Utc::now);
    }

    /// Transitions into a terminal status, setting `finished_at` once.
    /// Invariant 4 (§3): every terminal non-`Success` status carries a
    /// non-empty `error_message`.
    pub fn mark_terminal(&mut self, status: BuildStatus, error_message: Option<String>) {
        debug_assert!(status.is_terminal());
        self.status = status;
        self.finished_at.get_or_insert_with(Utc::now);
        if status != BuildStatus::Success {
            self.error_message = error_message.or(self.error_message.take());
        }
    }
}

/// Takes the first 8 characters of a commit SHA, or the whole string if it is
/// shorter than 8 characters.
pub fn short_sha(sha: &str) -> &str {
    if sha.len() >= 8 {
        &sha[..8]
    } else {
        sha
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_sha_truncates_long_shas() {
        assert_eq!(short_sha("abcdef0123456789"), "abcdef01");
    }

    #[test]
    fn short_sha_passes_through_short_input() {
        assert_eq!(short_sha("abc"), "abc");
        assert_eq!(short_sha("abcdefg"), "abcdefg");
    }

    #[test]
    fn mark_running_sets_started_at_once() {
        let mut build = Build::new(BuildId(1), ProjectId(1), "main".into(), "a".repeat(40));
        build.mark_running();
        let first = build.started_at;
        std::thread::sleep(std::time::Duration::from_millis(5));
        build.mark_running();
        assert_eq!(build.started_at, first);
    }

    #[test]
    fn mark_terminal_requires_error_message_for_non_success() {
        let mut build = Build::new(BuildId(1), ProjectId(1), "main".into(), "a".repeat(40));
        build.mark_running();
        build.mark_terminal(BuildStatus::Failed, Some("boom".into()));
        assert_eq!(build.status, BuildStatus::Failed);
        assert_eq!(build.error_message.as_deref(), Some("boom"));
        assert!(build.finished_at.is_some());
    }
}
