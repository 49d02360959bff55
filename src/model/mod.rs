//! Core domain entities: `Build`, `Project`, `Secret`, `BuildLogEntry`, `BuildArtifact`.
//!
//! These are semantic types, not storage types; the `db` module maps them to
//! and from SQLite rows.

mod artifact;
mod build;
mod log_entry;
mod project;

pub use artifact::BuildArtifact;
pub use build::{short_sha, Build, BuildId, BuildStatus};
pub use log_entry::{truncate_message, BuildLogEntry, LogEntryKind, MAX_MESSAGE_LEN};
pub use project::{Project, ProjectId, Secret};
