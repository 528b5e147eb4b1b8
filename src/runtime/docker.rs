use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::LogOutput;
use bollard::errors::Error as BollardError;
use bollard::models::{ContainerCreateBody, HostConfig, VolumeCreateOptions};
use bollard::query_parameters::{
    CreateContainerOptions, DownloadFromContainerOptions, InspectContainerOptions, LogsOptions,
    RemoveContainerOptions, RemoveVolumeOptions, StartContainerOptions, StopContainerOptions,
    WaitContainerOptions,
};
use bollard::{Docker, API_DEFAULT_VERSION};
use futures_util::{pin_mut, StreamExt};
use tracing::{debug, info};

use crate::config::types::DockerConfig;
use crate::error::{ExecboxError, Result};
use crate::runtime::traits::{ByteStream, ContainerRuntime, UnitSpec};
use crate::runtime::MANAGED_LABEL;

/// Docker runtime backed by the daemon's HTTP API.
///
/// The client is cheap to clone (it shares one connection pool), so streams
/// handed out by `logs` and `download` carry their own clone and do not
/// borrow the runtime.
pub struct DockerRuntime {
    docker: Docker,
    stop_timeout_seconds: u64,
}

impl DockerRuntime {
    /// Connect to the daemon described by `config`.
    pub fn connect(config: &DockerConfig) -> Result<Self> {
        let docker = match &config.socket {
            Some(socket) => Docker::connect_with_socket(
                &socket.display().to_string(),
                config.timeout_seconds,
                API_DEFAULT_VERSION,
            ),
            None => Docker::connect_with_local_defaults(),
        }
        .map_err(|e| {
            ExecboxError::RuntimeUnavailable(format!("Failed to connect to Docker: {}", e))
        })?
        // local defaults come with their own timeout
        .with_timeout(Duration::from_secs(config.timeout_seconds));

        debug!(socket = ?config.socket, "Docker client configured");

        Ok(Self {
            docker,
            stop_timeout_seconds: config.stop_timeout_seconds,
        })
    }
}

fn status_code(err: &BollardError) -> Option<u16> {
    match err {
        BollardError::DockerResponseServerError { status_code, .. } => Some(*status_code),
        _ => None,
    }
}

fn is_not_found(err: &BollardError) -> bool {
    status_code(err) == Some(404)
}

fn log_bytes(output: LogOutput) -> bytes::Bytes {
    match output {
        LogOutput::StdOut { message }
        | LogOutput::StdErr { message }
        | LogOutput::StdIn { message }
        | LogOutput::Console { message } => message,
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    fn name(&self) -> &str {
        "docker"
    }

    async fn ping(&self) -> Result<()> {
        self.docker
            .ping()
            .await
            .map_err(|e| ExecboxError::RuntimeUnavailable(format!("Docker ping failed: {}", e)))?;
        Ok(())
    }

    async fn exists(&self, unit: &str) -> Result<bool> {
        match self
            .docker
            .inspect_container(unit, None::<InspectContainerOptions>)
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(ExecboxError::control("inspect", unit, e)),
        }
    }

    async fn create(&self, spec: &UnitSpec) -> Result<()> {
        let options = CreateContainerOptions {
            name: Some(spec.name.clone()),
            ..Default::default()
        };

        let body = ContainerCreateBody {
            image: Some(spec.image.clone()),
            cmd: Some(spec.command.clone()),
            working_dir: Some(spec.working_dir.clone()),
            // A TTY merges stdout and stderr into one stream in emission order
            tty: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            labels: Some(spec.labels.clone()),
            host_config: Some(HostConfig {
                binds: Some(spec.mounts.iter().map(|m| m.bind_spec()).collect()),
                ..Default::default()
            }),
            ..Default::default()
        };

        let response = self
            .docker
            .create_container(Some(options), body)
            .await
            .map_err(|e| ExecboxError::control("create", &spec.name, e))?;

        for warning in &response.warnings {
            debug!(unit = %spec.name, warning = %warning, "Docker create warning");
        }
        info!(unit = %spec.name, id = %response.id, image = %spec.image, "Unit created");
        Ok(())
    }

    async fn start(&self, unit: &str) -> Result<()> {
        self.docker
            .start_container(unit, None::<StartContainerOptions>)
            .await
            .map_err(|e| ExecboxError::control("start", unit, e))
    }

    async fn stop(&self, unit: &str) -> Result<()> {
        let options = StopContainerOptions {
            t: Some(self.stop_timeout_seconds as i32),
            ..Default::default()
        };

        match self.docker.stop_container(unit, Some(options)).await {
            Ok(()) => Ok(()),
            // 304: already stopped, 404: already gone
            Err(e) if matches!(status_code(&e), Some(304) | Some(404)) => Ok(()),
            Err(e) => Err(ExecboxError::control("stop", unit, e)),
        }
    }

    async fn remove(&self, unit: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };

        match self.docker.remove_container(unit, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(ExecboxError::control("remove", unit, e)),
        }
    }

    fn logs(&self, unit: &str) -> ByteStream {
        let docker = self.docker.clone();
        let unit = unit.to_string();

        Box::pin(async_stream::stream! {
            let options = LogsOptions {
                follow: true,
                stdout: true,
                stderr: true,
                ..Default::default()
            };
            let logs = docker.logs(&unit, Some(options));
            pin_mut!(logs);

            while let Some(item) = logs.next().await {
                yield item.map(log_bytes).map_err(|e| {
                    ExecboxError::Retrieval(format!("log stream of '{}' failed: {}", unit, e))
                });
            }
        })
    }

    async fn wait(&self, unit: &str) -> Result<i64> {
        let stream = self
            .docker
            .wait_container(unit, None::<WaitContainerOptions>);
        pin_mut!(stream);

        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // bollard reports a non-zero exit as an error; for us it is just an exit
            Some(Err(BollardError::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(ExecboxError::control("wait for", unit, e)),
            None => Err(ExecboxError::control(
                "wait for",
                unit,
                "wait stream ended without an exit status",
            )),
        }
    }

    fn download(&self, unit: &str, path: &str) -> ByteStream {
        let docker = self.docker.clone();
        let unit = unit.to_string();
        let path = path.to_string();

        Box::pin(async_stream::stream! {
            let options = DownloadFromContainerOptions {
                path: path.clone(),
                ..Default::default()
            };
            let archive = docker.download_from_container(&unit, Some(options));
            pin_mut!(archive);

            while let Some(item) = archive.next().await {
                yield item.map_err(|e| {
                    if is_not_found(&e) {
                        ExecboxError::Retrieval(format!("{} was not produced by '{}'", path, unit))
                    } else {
                        ExecboxError::Retrieval(format!("archive transfer from '{}' failed: {}", unit, e))
                    }
                });
            }
        })
    }

    async fn create_volume(&self, name: &str) -> Result<PathBuf> {
        let options = VolumeCreateOptions {
            name: Some(name.to_string()),
            labels: Some(HashMap::from([(
                MANAGED_LABEL.to_string(),
                "true".to_string(),
            )])),
            ..Default::default()
        };

        let volume = self
            .docker
            .create_volume(options)
            .await
            .map_err(|e| ExecboxError::control("create volume", name, e))?;

        debug!(volume = %name, mountpoint = %volume.mountpoint, "Volume created");
        Ok(PathBuf::from(volume.mountpoint))
    }

    async fn remove_volume(&self, name: &str) -> Result<()> {
        let options = RemoveVolumeOptions {
            force: true,
            ..Default::default()
        };

        match self.docker.remove_volume(name, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(ExecboxError::control("remove volume", name, e)),
        }
    }
}
