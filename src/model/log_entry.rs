use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::build::BuildId;

pub const MAX_MESSAGE_LEN: usize = 4000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogEntryKind {
    Info,
    Warning,
    Error,
    Debug,
    Output,
    StepStarted,
    StepCompleted,
    StepFailed,
}

impl LogEntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogEntryKind::Info => "info",
            LogEntryKind::Warning => "warning",
            LogEntryKind::Error => "error",
            LogEntryKind::Debug => "debug",
            LogEntryKind::Output => "output",
            LogEntryKind::StepStarted => "step_started",
            LogEntryKind::StepCompleted => "step_completed",
            LogEntryKind::StepFailed => "step_failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "info" => LogEntryKind::Info,
            "warning" => LogEntryKind::Warning,
            "error" => LogEntryKind::Error,
            "debug" => LogEntryKind::Debug,
            "output" => LogEntryKind::Output,
            "step_started" => LogEntryKind::StepStarted,
            "step_completed" => LogEntryKind::StepCompleted,
            "step_failed" => LogEntryKind::StepFailed,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BuildLogEntry {
    pub id: i64,
    pub build_id: BuildId,
    pub sequence: i64,
    pub kind: LogEntryKind,
    pub message: String,
    pub step_name: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Truncates (never splits) a message to `MAX_MESSAGE_LEN` characters.
/// Operates on characters, not bytes, so multi-byte UTF-8 is never cut
/// mid-codepoint.
pub fn truncate_message(message: &str) -> String {
    if message.chars().count() <= MAX_MESSAGE_LEN {
        message.to_string()
    } else {
        message.chars().take(MAX_MESSAGE_LEN).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_message_passes_through_exact_boundary() {
        let msg = "a".repeat(MAX_MESSAGE_LEN);
        assert_eq!(truncate_message(&msg).chars().count(), MAX_MESSAGE_LEN);
        assert_eq!(truncate_message(&msg), msg);
    }

    #[test]
    fn truncate_message_truncates_over_boundary() {
        let msg = "a".repeat(MAX_MESSAGE_LEN + 1);
        let truncated = truncate_message(&msg);
        assert_eq!(truncated.chars().count(), MAX_MESSAGE_LEN);
    }
}
