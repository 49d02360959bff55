use std::collections::HashMap;
use std::io::Cursor;
use std::path::Path;

use async_trait::async_trait;
use bollard::container::{Config, CreateContainerOptions, DownloadFromContainerOptions, LogOutput, RemoveContainerOptions};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::network::{CreateNetworkOptions, ListNetworksOptions};
use bollard::service::{HostConfig, Mount, MountTypeEnum};
use bollard::Docker;
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{ContainerError, ContainerResult, ContainerRuntime, ContainerSpec, LineCallback, MountInfo};

/// Capabilities dropped from every non-DIND build container (§4.2).
const DROPPED_CAPABILITIES: &[&str] = &[
    "SYS_ADMIN",
    "SYS_MODULE",
    "SYS_RAWIO",
    "SYS_PTRACE",
    "SYS_BOOT",
    "MAC_ADMIN",
    "MAC_OVERRIDE",
    "NET_ADMIN",
    "NET_BROADCAST",
    "NET_RAW",
    "SYS_TIME",
];

pub struct DockerRuntime {
    client: Docker,
}

impl DockerRuntime {
    pub fn connect(socket_path: &str) -> ContainerResult<Self> {
        let client = if let Some(path) = socket_path.strip_prefix("unix://") {
            Docker::connect_with_unix(path, 120, bollard::API_DEFAULT_VERSION)?
        } else {
            Docker::connect_with_local_defaults()?
        };
        Ok(Self { client })
    }

    pub fn client(&self) -> &Docker {
        &self.client
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn ensure_network(&self, name: &str) -> ContainerResult<()> {
        let mut filters = HashMap::new();
        filters.insert("name".to_string(), vec![name.to_string()]);
        let existing = self
            .client
            .list_networks(Some(ListNetworksOptions { filters }))
            .await?;
        if existing.iter().any(|n| n.name.as_deref() == Some(name)) {
            return Ok(());
        }

        match self
            .client
            .create_network(CreateNetworkOptions {
                name: name.to_string(),
                driver: "bridge".to_string(),
                ..Default::default()
            })
            .await
        {
            Ok(_) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError { status_code, .. })
                if status_code == 409 =>
            {
                // lost the creation race to a concurrent caller; that caller's
                // network is exactly as good as ours.
                Ok(())
            }
            Err(e) => Err(ContainerError::Docker(e)),
        }
    }

    async fn create(&self, spec: &ContainerSpec, cancel: &CancellationToken) -> ContainerResult<String> {
        let env: Vec<String> = spec
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let mounts: Vec<Mount> = spec
            .mounts
            .iter()
            .map(|m| Mount {
                target: Some(m.container_path.clone()),
                source: Some(m.host_path.clone()),
                typ: Some(MountTypeEnum::BIND),
                read_only: Some(m.read_only),
                ..Default::default()
            })
            .collect();

        let mut host_config = HostConfig {
            mounts: Some(mounts),
            network_mode: Some(spec.network.clone()),
            auto_remove: Some(true),
            ..Default::default()
        };

        if !spec.dind {
            host_config.cap_drop =
                Some(DROPPED_CAPABILITIES.iter().map(|c| c.to_string()).collect());
            host_config.security_opt = Some(vec!["no-new-privileges".to_string()]);
        }

        let config = Config {
            image: Some(spec.image.clone()),
            env: Some(env),
            working_dir: Some(spec.workdir.clone()),
            entrypoint: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            host_config: Some(host_config),
            ..Default::default()
        };

        let create_fut = self.client.create_container(
            Some(CreateContainerOptions {
                name: format!("ando-build-{}", uuid::Uuid::new_v4()),
                platform: None,
            }),
            config,
        );

        let created = tokio::select! {
            res = create_fut => res.map_err(|e| ContainerError::CreateFailed(e.to_string()))?,
            _ = cancel.cancelled() => return Err(ContainerError::Cancelled),
        };

        self.client
            .start_container::<String>(&created.id, None)
            .await
            .map_err(|e| ContainerError::CreateFailed(e.to_string()))?;

        Ok(created.id)
    }

    async fn exec(
        &self,
        container_id: &str,
        argv: &[String],
        workdir: &str,
        env: &[(String, String)],
        mut on_stdout: LineCallback<'_>,
        mut on_stderr: LineCallback<'_>,
        cancel: &CancellationToken,
    ) -> ContainerResult<i64> {
        debug!(argv = ?super::redact_argv(&argv.to_vec()), "exec in container");

        let env: Vec<String> = env.iter().map(|(k, v)| format!("{}={}", k, v)).collect();

        let exec = self
            .client
            .create_exec(
                container_id,
                CreateExecOptions {
                    cmd: Some(argv.to_vec()),
                    env: Some(env),
                    working_dir: Some(workdir.to_string()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await?;

        let start_fut = self.client.start_exec(&exec.id, None);

        let mut output = match tokio::select! {
            res = start_fut => res?,
            _ = cancel.cancelled() => return Err(ContainerError::Cancelled),
        } {
            StartExecResults::Attached { output, .. } => output,
            StartExecResults::Detached => {
                return Err(ContainerError::Other("exec unexpectedly detached".into()))
            }
        };

        let mut stdout_buf = String::new();
        let mut stderr_buf = String::new();

        loop {
            let next = tokio::select! {
                item = output.next() => item,
                _ = cancel.cancelled() => return Err(ContainerError::Cancelled),
            };
            let Some(chunk) = next else { break };
            match chunk? {
                LogOutput::StdOut { message } => {
                    feed_lines(&mut stdout_buf, &message, &mut on_stdout);
                }
                LogOutput::StdErr { message } => {
                    feed_lines(&mut stderr_buf, &message, &mut on_stderr);
                }
                _ => {}
            }
        }
        if !stdout_buf.is_empty() {
            on_stdout(&stdout_buf);
        }
        if !stderr_buf.is_empty() {
            on_stderr(&stderr_buf);
        }

        let inspected = self.client.inspect_exec(&exec.id).await?;
        Ok(inspected.exit_code.unwrap_or(-1))
    }

    async fn copy_out(&self, container_id: &str, src_path: &str, dest_dir: &Path) -> ContainerResult<()> {
        tokio::fs::create_dir_all(dest_dir).await?;

        let mut stream = self.client.download_from_container(
            container_id,
            Some(DownloadFromContainerOptions {
                path: src_path.to_string(),
            }),
        );

        let mut buf = Vec::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(bytes) => buf.extend_from_slice(&bytes),
                Err(bollard::errors::Error::DockerResponseServerError { status_code, .. })
                    if status_code == 404 =>
                {
                    // source directory does not exist: nothing to collect.
                    return Ok(());
                }
                Err(e) => return Err(ContainerError::Docker(e)),
            }
        }
        if buf.is_empty() {
            return Ok(());
        }

        let dest_dir = dest_dir.to_path_buf();
        tokio::task::spawn_blocking(move || {
            let mut archive = tar::Archive::new(Cursor::new(buf));
            archive.unpack(&dest_dir)
        })
        .await
        .map_err(|e| ContainerError::Other(e.to_string()))??;

        Ok(())
    }

    async fn remove(&self, container_id: &str) -> ContainerResult<()> {
        match self
            .client
            .remove_container(
                container_id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError { status_code, .. })
                if status_code == 404 =>
            {
                Ok(())
            }
            Err(e) => {
                warn!(container_id, error = %e, "container remove failed");
                Err(ContainerError::Docker(e))
            }
        }
    }

    async fn inspect_mounts(&self, container_ref: &str) -> ContainerResult<Vec<MountInfo>> {
        let inspected = self.client.inspect_container(container_ref, None).await?;
        let mounts = inspected
            .mounts
            .unwrap_or_default()
            .into_iter()
            .filter_map(|m| match (m.source, m.destination) {
                (Some(source), Some(destination)) => Some(MountInfo { source, destination }),
                _ => None,
            })
            .collect();
        Ok(mounts)
    }
}

/// Splits `chunk` into complete lines on `\n`, calling `on_line` for each,
/// and leaves any trailing partial line in `buf` for the next chunk.
fn feed_lines(buf: &mut String, chunk: &bytes::Bytes, on_line: &mut LineCallback<'_>) {
    buf.push_str(&String::from_utf8_lossy(chunk));
    while let Some(pos) = buf.find('\n') {
        let line: String = buf.drain(..=pos).collect();
        on_line(line.trim_end_matches('\n'));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feed_lines_splits_on_newlines_and_buffers_partial() {
        let mut buf = String::new();
        let mut lines = Vec::new();
        {
            let mut cb: LineCallback = Box::new(|l: &str| lines.push(l.to_string()));
            feed_lines(&mut buf, &bytes::Bytes::from_static(b"hello\nwor"), &mut cb);
        }
        assert_eq!(lines, vec!["hello".to_string()]);
        assert_eq!(buf, "wor");
    }
}
