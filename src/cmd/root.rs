//! Main daemon command: loads configuration, wires the build-orchestration
//! core together, recovers any builds left mid-flight by a prior process,
//! and drives the queue for the life of the process.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use ando_core::api::HttpRepositoryProvider;
use ando_core::artifacts::run_retention_sweep;
use ando_core::cancel::CancellationRegistry;
use ando_core::container::DockerRuntime;
use ando_core::db::Db;
use ando_core::queue::InMemoryBuildQueue;
use ando_core::repo::GitRepoPreparer;
use ando_core::{BuildOrchestrator, BuildQueue, Configuration};

use super::collaborators::{LoggingEmailSender, PassthroughSecretDecryptor};

const RETENTION_SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

/// Runs the daemon until interrupted.
pub async fn run(config_path: &str) -> Result<()> {
    info!("loading configuration from {}", config_path);
    let config = Configuration::load(config_path).context("failed to load configuration")?;
    let config = Arc::new(config);

    info!(
        repos_path = %config.repos_path.display(),
        artifacts_path = %config.artifacts_path.display(),
        network = %config.builds_network_name,
        max_concurrent_builds = config.max_concurrent_builds,
        "configuration loaded",
    );

    let db = Arc::new(
        Db::open(&config.database_path, config.connection_pool_size())
            .context("failed to open database")?,
    );

    let runtime = Arc::new(
        DockerRuntime::connect(&config.docker_socket_path).context("failed to connect to container daemon")?,
    );
    runtime
        .ensure_network(&config.builds_network_name)
        .await
        .context("failed to ensure build network exists")?;

    let provider = Arc::new(
        HttpRepositoryProvider::new(&config.repository_provider)
            .context("failed to configure repository-provider client")?,
    );
    let email = Arc::new(LoggingEmailSender);
    let secrets = Arc::new(PassthroughSecretDecryptor);
    let cancel_registry = Arc::new(CancellationRegistry::new());
    let repo = Arc::new(GitRepoPreparer::new());

    let orchestrator = Arc::new(BuildOrchestrator::new(
        db.clone(),
        runtime.clone(),
        provider.clone(),
        email.clone(),
        secrets.clone(),
        cancel_registry.clone(),
        repo,
        config.clone(),
    ));

    let queue = Arc::new(InMemoryBuildQueue::new(db.clone()));
    let recovered = queue.recover_pending().await;
    if !recovered.is_empty() {
        info!(count = recovered.len(), "re-queued builds interrupted by a prior process");
    }

    let shutdown = CancellationToken::new();
    let sweep_handle = tokio::spawn(run_retention_sweep(
        db.clone(),
        config.artifacts_path.clone(),
        RETENTION_SWEEP_INTERVAL,
        shutdown.clone(),
    ));

    let concurrency = Arc::new(Semaphore::new(config.max_concurrent_builds));
    let mut in_flight = Vec::new();

    info!("entering build queue loop");
    loop {
        let next = tokio::select! {
            biased;
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received, draining in-flight builds");
                break;
            }
            next = queue.next() => next,
        };

        let Some(build_id) = next else {
            info!("build queue closed, shutting down");
            break;
        };

        let permit = concurrency.clone().acquire_owned().await.expect("semaphore is never closed");
        let orchestrator = orchestrator.clone();
        in_flight.push(tokio::spawn(async move {
            orchestrator.execute(build_id).await;
            drop(permit);
        }));

        in_flight.retain(|h| !h.is_finished());
    }

    for handle in in_flight {
        if let Err(e) = handle.await {
            if e.is_panic() {
                warn!("a build execution task panicked during shutdown drain");
            }
        }
    }

    shutdown.cancel();
    let _ = sweep_handle.await;

    info!("daemon stopped");
    Ok(())
}
