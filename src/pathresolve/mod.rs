//! `PathResolver`: translates an orchestrator-visible path into the path the
//! container daemon needs for bind mounts, for the case where the
//! orchestrator itself runs inside a container. Grounded on the bollard
//! `inspect_container` usage in `src/environment/docker/container.rs`
//! generalized from "inspect my own server container" to "inspect my own
//! process's container to find my own mounts."

use tracing::warn;

use crate::config::PathOverride;
use crate::container::{ContainerRuntime, MountInfo};

const DOCKERENV_SENTINEL: &str = "/.dockerenv";
const CGROUP_PATH: &str = "/proc/self/cgroup";
const FALLBACK_CONTAINER_NAME: &str = "ando-core";

pub struct PathResolver<'a> {
    runtime: &'a dyn ContainerRuntime,
    overrides: &'a [PathOverride],
}

impl<'a> PathResolver<'a> {
    pub fn new(runtime: &'a dyn ContainerRuntime, overrides: &'a [PathOverride]) -> Self {
        Self { runtime, overrides }
    }

    /// Resolves `orchestrator_path` to the host-daemon-visible path. Returns
    /// the input unchanged when the process is not containerized, when an
    /// override or mount match is found, or as a last resort when nothing
    /// matches at all (§4.5).
    pub async fn resolve_host_path(&self, orchestrator_path: &str) -> String {
        if let Some(mapped) = apply_overrides(self.overrides, orchestrator_path) {
            return mapped;
        }

        if !is_containerized() {
            return orchestrator_path.to_string();
        }

        for candidate in self.self_container_candidates() {
            if let Ok(mounts) = self.runtime.inspect_mounts(&candidate).await {
                if let Some(mapped) = longest_prefix_match(&mounts, orchestrator_path) {
                    return mapped;
                }
            }
        }

        warn!(path = orchestrator_path, "PathResolver: no mount match found, returning input unchanged");
        orchestrator_path.to_string()
    }

    fn self_container_candidates(&self) -> Vec<String> {
        let mut candidates = Vec::new();
        if let Some(id) = container_id_from_cgroup() {
            candidates.push(id);
        }
        if let Ok(hostname) = std::env::var("HOSTNAME") {
            if !hostname.is_empty() {
                candidates.push(hostname);
            }
        }
        candidates.push(FALLBACK_CONTAINER_NAME.to_string());
        candidates
    }
}

fn is_containerized() -> bool {
    std::path::Path::new(DOCKERENV_SENTINEL).exists()
        || std::env::var("DOTNET_RUNNING_IN_CONTAINER").as_deref() == Ok("true")
}

/// Parses a container id out of `/proc/self/cgroup`. Looks for a 64-hex-char
/// segment, the shape Docker uses for cgroup path components.
fn container_id_from_cgroup() -> Option<String> {
    let contents = std::fs::read_to_string(CGROUP_PATH).ok()?;
    for line in contents.lines() {
        if let Some(segment) = line.rsplit('/').next() {
            if segment.len() >= 64 && segment.chars().all(|c| c.is_ascii_hexdigit()) {
                return Some(segment[..64].to_string());
            }
        }
    }
    None
}

fn apply_overrides(overrides: &[PathOverride], path: &str) -> Option<String> {
    overrides
        .iter()
        .filter(|o| path.starts_with(&o.container_prefix))
        .max_by_key(|o| o.container_prefix.len())
        .map(|o| format!("{}{}", o.host_prefix, &path[o.container_prefix.len()..]))
}

fn longest_prefix_match(mounts: &[MountInfo], path: &str) -> Option<String> {
    mounts
        .iter()
        .filter(|m| path.starts_with(&m.destination))
        .max_by_key(|m| m.destination.len())
        .map(|m| format!("{}{}", m.source, &path[m.destination.len()..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_pick_longest_matching_prefix() {
        let overrides = vec![
            PathOverride { container_prefix: "/data".to_string(), host_prefix: "/mnt/short".to_string() },
            PathOverride { container_prefix: "/data/repos".to_string(), host_prefix: "/mnt/long".to_string() },
        ];
        let mapped = apply_overrides(&overrides, "/data/repos/7/abc12345");
        assert_eq!(mapped, Some("/mnt/long/7/abc12345".to_string()));
    }

    #[test]
    fn no_override_match_returns_none() {
        let overrides = vec![PathOverride { container_prefix: "/other".to_string(), host_prefix: "/mnt".to_string() }];
        assert_eq!(apply_overrides(&overrides, "/data/repos/7"), None);
    }

    #[test]
    fn longest_mount_prefix_wins_over_sibling() {
        let mounts = vec![
            MountInfo { source: "/srv/docker/volumes/a".to_string(), destination: "/data".to_string() },
            MountInfo { source: "/srv/docker/volumes/b".to_string(), destination: "/data/repos".to_string() },
        ];
        let mapped = longest_prefix_match(&mounts, "/data/repos/7/abc12345");
        assert_eq!(mapped, Some("/srv/docker/volumes/b/7/abc12345".to_string()));
    }

    #[test]
    fn no_mount_match_returns_none() {
        let mounts = vec![MountInfo { source: "/srv/other".to_string(), destination: "/unrelated".to_string() }];
        assert_eq!(longest_prefix_match(&mounts, "/data/repos/7"), None);
    }
}
