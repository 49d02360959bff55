//! Layered TOML configuration, following the same load-and-resolve-paths
//! shape as the daemon this crate was generalized from: relative path keys
//! are resolved against the config file's own parent directory, not the
//! process's current working directory.

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("failed to create directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

fn default_true() -> bool {
    true
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
}

fn default_port() -> u16 {
    9009
}

fn default_data_directory() -> PathBuf {
    PathBuf::from("/var/lib/ando")
}

fn default_repos_path() -> PathBuf {
    PathBuf::from("repos")
}

fn default_repos_path_in_container() -> String {
    "/workspace".to_string()
}

fn default_artifacts_path() -> PathBuf {
    PathBuf::from("artifacts")
}

fn default_database_path() -> PathBuf {
    PathBuf::from("ando.db")
}

fn default_docker_image() -> String {
    "docker.io/library/debian:bookworm-slim".to_string()
}

fn default_docker_socket_path() -> String {
    "unix:///var/run/docker.sock".to_string()
}

fn default_builds_network_name() -> String {
    "ando-builds".to_string()
}

fn default_max_timeout_minutes() -> u32 {
    120
}

fn default_artifact_retention_days() -> i64 {
    30
}

fn default_max_concurrent_builds() -> usize {
    num_cpus::get().max(1)
}

fn default_log_verbosity() -> LogVerbosity {
    LogVerbosity::Info
}

/// Gates which `LogSink` kinds are persisted/broadcast. `Error` and `Output`
/// are always emitted regardless of this setting (§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogVerbosity {
    Debug,
    Info,
    Warning,
}

impl LogVerbosity {
    pub fn allows_debug(&self) -> bool {
        *self <= LogVerbosity::Debug
    }

    pub fn allows_info(&self) -> bool {
        *self <= LogVerbosity::Info
    }

    pub fn allows_warning(&self) -> bool {
        *self <= LogVerbosity::Warning
    }
}

/// An administrator-configured host/container path-pair override, checked
/// before `PathResolver`'s mount-inspection heuristic (§4.5).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PathOverride {
    pub container_prefix: String,
    pub host_prefix: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Configuration {
    /// Directory other relative paths in this file resolve against once the
    /// config file's own parent directory has already been applied.
    #[serde(default = "default_data_directory")]
    pub data_directory: PathBuf,

    #[serde(default = "default_host")]
    pub host: IpAddr,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub debug: bool,

    /// Root directory for working trees, host-visible.
    #[serde(default = "default_repos_path")]
    pub repos_path: PathBuf,

    /// Root directory for working trees as seen from inside the orchestrator
    /// container, when the orchestrator itself is containerized.
    #[serde(default = "default_repos_path_in_container")]
    pub repos_path_in_container: String,

    /// Root directory for collected build artifacts, host-visible.
    #[serde(default = "default_artifacts_path")]
    pub artifacts_path: PathBuf,

    #[serde(default = "default_artifact_retention_days")]
    pub artifact_retention_days: i64,

    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    #[serde(default = "default_docker_image")]
    pub default_docker_image: String,

    #[serde(default = "default_docker_socket_path")]
    pub docker_socket_path: String,

    #[serde(default = "default_builds_network_name")]
    pub builds_network_name: String,

    #[serde(default = "default_max_timeout_minutes")]
    pub max_timeout_minutes: u32,

    #[serde(default = "default_max_concurrent_builds")]
    pub max_concurrent_builds: usize,

    /// Base URL the hosting provider (and any human following a build) can
    /// use to reach this instance; embedded in commit-status target URLs.
    #[serde(default)]
    pub base_url: String,

    #[serde(default)]
    pub path_overrides: Vec<PathOverride>,

    #[serde(default = "default_log_verbosity")]
    pub log_verbosity: LogVerbosity,

    #[serde(default)]
    pub repository_provider: RepositoryProviderConfiguration,

    #[serde(default = "default_true")]
    pub ansi_colors: bool,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RepositoryProviderConfiguration {
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            data_directory: default_data_directory(),
            host: default_host(),
            port: default_port(),
            debug: false,
            repos_path: default_repos_path(),
            repos_path_in_container: default_repos_path_in_container(),
            artifacts_path: default_artifacts_path(),
            artifact_retention_days: default_artifact_retention_days(),
            database_path: default_database_path(),
            default_docker_image: default_docker_image(),
            docker_socket_path: default_docker_socket_path(),
            builds_network_name: default_builds_network_name(),
            max_timeout_minutes: default_max_timeout_minutes(),
            max_concurrent_builds: default_max_concurrent_builds(),
            base_url: String::new(),
            path_overrides: Vec::new(),
            log_verbosity: default_log_verbosity(),
            repository_provider: RepositoryProviderConfiguration::default(),
            ansi_colors: true,
        }
    }
}

impl Configuration {
    /// Loads configuration from a TOML file and resolves every relative path
    /// field against the file's own parent directory, creating directories
    /// that do not yet exist.
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let mut config: Configuration =
            toml::from_str(&contents).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        let base = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        config.data_directory = Self::resolve_path(&base, &config.data_directory);
        config.repos_path = Self::resolve_path(&config.data_directory, &config.repos_path);
        config.artifacts_path = Self::resolve_path(&config.data_directory, &config.artifacts_path);
        config.database_path = Self::resolve_path(&config.data_directory, &config.database_path);

        for dir in [&config.data_directory, &config.repos_path, &config.artifacts_path] {
            std::fs::create_dir_all(dir).map_err(|source| ConfigError::CreateDir {
                path: dir.clone(),
                source,
            })?;
        }

        Ok(config)
    }

    /// Resolves `child` against `base` if `child` is relative; absolute
    /// paths pass through unchanged.
    fn resolve_path(base: &Path, child: &Path) -> PathBuf {
        if child.is_absolute() {
            child.to_path_buf()
        } else {
            base.join(child)
        }
    }

    pub fn connection_pool_size(&self) -> usize {
        self.max_concurrent_builds + 2
    }
}
