use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProjectId(pub i64);

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A project secret. `encrypted_value` is opaque to this crate; it is
/// decrypted only at container-creation time, by the secret-encryption
/// primitive (out of scope, §1), and never logged or persisted in cleartext.
#[derive(Debug, Clone)]
pub struct Secret {
    pub name: String,
    pub encrypted_value: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct Project {
    pub id: ProjectId,
    pub repo_full_name: String,
    pub installation_id: Option<i64>,
    pub docker_image: Option<String>,
    pub timeout_minutes: u32,
    pub profile: Option<String>,
    pub available_profiles: Vec<String>,
    pub notify_on_failure: bool,
    pub secrets: Vec<Secret>,
    /// Whether this project's builds request a host-daemon-socket mount
    /// (Docker-in-Docker). See §4.2's hardening carve-out.
    pub dind: bool,
}
