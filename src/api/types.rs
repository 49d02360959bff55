//! Repository-provider API request and response types.

use serde::{Deserialize, Serialize};

/// Commit-status state posted back to the hosting provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CommitState {
    Pending,
    Success,
    Failure,
    Error,
}

impl CommitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommitState::Pending => "pending",
            CommitState::Success => "success",
            CommitState::Failure => "failure",
            CommitState::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct InstallationTokenResponse {
    pub token: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProfileDetectionResponse {
    #[serde(default)]
    pub profiles: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommitStatusRequest<'a> {
    pub state: &'a str,
    pub description: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_url: Option<&'a str>,
}

/// Generic error body a provider may return alongside a non-2xx status.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorResponse {
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}
