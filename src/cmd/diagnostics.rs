//! Diagnostics command: resolves configuration, then checks connectivity to
//! the container daemon and the database without starting the build loop.

use anyhow::Result;
use bollard::Docker;

use ando_core::config::Configuration;
use ando_core::db::Db;

/// Prints the resolved configuration and the health of its two external
/// dependencies: the container daemon and the SQLite database file.
pub async fn run(config_path: &str) -> Result<()> {
    println!("ando-core diagnostics");
    println!("======================\n");

    println!("Configuration:");
    println!("--------------");
    match Configuration::load(config_path) {
        Ok(config) => {
            println!("  Source: {}", config_path);
            println!("  Repos path: {}", config.repos_path.display());
            println!("  Artifacts path: {}", config.artifacts_path.display());
            println!("  Artifact retention: {} days", config.artifact_retention_days);
            println!("  Database path: {}", config.database_path.display());
            println!("  Default build image: {}", config.default_docker_image);
            println!("  Docker socket: {}", config.docker_socket_path);
            println!("  Build network: {}", config.builds_network_name);
            println!("  Max build timeout: {} minutes", config.max_timeout_minutes);
            println!("  Max concurrent builds: {}", config.max_concurrent_builds);
            println!("  Repository provider base URL: {}", config.repository_provider.base_url);

            println!("\nDocker:");
            println!("-------");
            match Docker::connect_with_local_defaults().or_else(|_| {
                config
                    .docker_socket_path
                    .strip_prefix("unix://")
                    .map(|path| Docker::connect_with_unix(path, 30, bollard::API_DEFAULT_VERSION))
                    .unwrap_or_else(|| Docker::connect_with_local_defaults())
            }) {
                Ok(docker) => match docker.version().await {
                    Ok(version) => {
                        println!("  Version: {}", version.version.unwrap_or_default());
                        println!("  API Version: {}", version.api_version.unwrap_or_default());
                        println!(
                            "  OS/Arch: {}/{}",
                            version.os.unwrap_or_default(),
                            version.arch.unwrap_or_default()
                        );
                    }
                    Err(e) => println!("  Error querying daemon: {}", e),
                },
                Err(e) => println!("  Error connecting to daemon at {}: {}", config.docker_socket_path, e),
            }

            println!("\nDatabase:");
            println!("---------");
            match Db::open(&config.database_path, config.connection_pool_size()) {
                Ok(_) => println!("  Opened {} successfully ({} pooled connections)", config.database_path.display(), config.connection_pool_size()),
                Err(e) => println!("  Error opening database: {}", e),
            }
        }
        Err(e) => {
            println!("  Error loading {}: {}", config_path, e);
        }
    }

    println!("\nDiagnostics complete.");
    Ok(())
}
