//! [`ContainerRuntime`] backed by the Docker Engine API.
//!
//! Lifecycle, volume and inspection calls go through `bollard`. Exec start is done by hand:
//! the crate needs the hijacked connection itself (output frames and stdin on one socket),
//! so it opens its own HTTP/1.1 connection to the engine socket and upgrades it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use bollard::errors::Error as BollardError;
use bollard::models::{
    ContainerCreateBody, ContainerSummaryStateEnum, ExecConfig, HostConfig, Mount, MountTypeEnum,
    RestartPolicy, RestartPolicyNameEnum, VolumeCreateOptions,
};
use bollard::query_parameters::{
    CreateContainerOptions, DownloadFromContainerOptions, InspectContainerOptions,
    ListContainersOptions, RemoveContainerOptions, RemoveVolumeOptions, StartContainerOptions,
    StopContainerOptions,
};
use bollard::{Docker, API_DEFAULT_VERSION};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use http_body_util::{BodyExt, Full};
use hyper::header::{CONNECTION, CONTENT_TYPE, HOST, UPGRADE};
use hyper::{Request, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::json;
use tokio::net::UnixStream;
use tracing::debug;

use crate::runtime::{
    ContainerRecord, ContainerRuntime, ContainerSpec, ContainerState, ExecSpec, ExecStatus,
    ExecStream, RuntimeError, RuntimeResult,
};

pub const DEFAULT_SOCKET: &str = "/var/run/docker.sock";
const CLIENT_TIMEOUT_SECS: u64 = 120;

pub struct DockerRuntime {
    docker: Docker,
    socket_path: PathBuf,
}

impl DockerRuntime {
    pub fn connect(socket_path: impl AsRef<Path>) -> RuntimeResult<Self> {
        let socket_path = socket_path.as_ref().to_path_buf();
        let docker = Docker::connect_with_socket(
            &socket_path.to_string_lossy(),
            CLIENT_TIMEOUT_SECS,
            API_DEFAULT_VERSION,
        )
        .map_err(|e| RuntimeError::Api(format!("connect to {}: {e}", socket_path.display())))?;
        Ok(Self {
            docker,
            socket_path,
        })
    }

    pub async fn ping(&self) -> RuntimeResult<()> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| engine_error("ping", e))
    }
}

fn engine_error(operation: &str, error: BollardError) -> RuntimeError {
    match error {
        BollardError::DockerResponseServerError {
            status_code: 404,
            message,
        } => RuntimeError::NotFound(format!("{operation}: {message}")),
        BollardError::DockerResponseServerError {
            status_code: 409,
            message,
        } => RuntimeError::AlreadyExists(format!("{operation}: {message}")),
        other => RuntimeError::Api(format!("{operation}: {other}")),
    }
}

fn hijack_error(operation: &str, error: impl std::fmt::Display) -> RuntimeError {
    RuntimeError::Api(format!("{operation}: {error}"))
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn volume_exists(&self, name: &str) -> RuntimeResult<bool> {
        match self.docker.inspect_volume(name).await {
            Ok(_) => Ok(true),
            Err(error) => match engine_error("inspect volume", error) {
                RuntimeError::NotFound(_) => Ok(false),
                other => Err(other),
            },
        }
    }

    async fn create_volume(
        &self,
        name: &str,
        labels: HashMap<String, String>,
    ) -> RuntimeResult<()> {
        let options = VolumeCreateOptions {
            name: Some(name.to_string()),
            labels: Some(labels),
            ..Default::default()
        };
        self.docker
            .create_volume(options)
            .await
            .map(|_| ())
            .map_err(|e| engine_error("create volume", e))
    }

    async fn remove_volume(&self, name: &str) -> RuntimeResult<()> {
        self.docker
            .remove_volume(name, None::<RemoveVolumeOptions>)
            .await
            .map_err(|e| engine_error("remove volume", e))
    }

    async fn create_container(&self, spec: &ContainerSpec) -> RuntimeResult<String> {
        let host_config = HostConfig {
            mounts: Some(vec![Mount {
                target: Some(spec.mount_target.clone()),
                source: Some(spec.volume.clone()),
                typ: Some(MountTypeEnum::VOLUME),
                ..Default::default()
            }]),
            network_mode: spec.network.clone(),
            restart_policy: Some(RestartPolicy {
                name: Some(RestartPolicyNameEnum::UNLESS_STOPPED),
                maximum_retry_count: None,
            }),
            ..Default::default()
        };
        let body = ContainerCreateBody {
            image: Some(spec.image.clone()),
            cmd: Some(spec.command.clone()),
            working_dir: Some(spec.working_dir.clone()),
            labels: Some(spec.labels.clone()),
            host_config: Some(host_config),
            ..Default::default()
        };
        let options = CreateContainerOptions {
            name: Some(spec.name.clone()),
            ..Default::default()
        };

        let response = self
            .docker
            .create_container(Some(options), body)
            .await
            .map_err(|e| engine_error("create container", e))?;
        for warning in &response.warnings {
            debug!("engine warning for {}: {warning}", spec.name);
        }
        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> RuntimeResult<()> {
        self.docker
            .start_container(id, None::<StartContainerOptions>)
            .await
            .map_err(|e| engine_error("start container", e))
    }

    async fn stop_container(&self, id: &str, grace: Duration) -> RuntimeResult<()> {
        let options = StopContainerOptions {
            t: Some(i32::try_from(grace.as_secs()).unwrap_or(i32::MAX)),
            ..Default::default()
        };
        match self.docker.stop_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            // 304: already stopped.
            Err(BollardError::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(error) => Err(engine_error("stop container", error)),
        }
    }

    async fn remove_container(&self, id: &str) -> RuntimeResult<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        self.docker
            .remove_container(id, Some(options))
            .await
            .map_err(|e| engine_error("remove container", e))
    }

    async fn inspect_container(&self, id: &str) -> RuntimeResult<Option<ContainerState>> {
        match self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
        {
            Ok(response) => {
                let running = response
                    .state
                    .and_then(|state| state.running)
                    .unwrap_or(false);
                Ok(Some(ContainerState { running }))
            }
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(None),
            Err(error) => Err(engine_error("inspect container", error)),
        }
    }

    async fn list_containers(&self, label: &str) -> RuntimeResult<Vec<ContainerRecord>> {
        let filters = HashMap::from([("label".to_string(), vec![label.to_string()])]);
        let options = ListContainersOptions {
            all: true,
            filters: Some(filters),
            ..Default::default()
        };
        let summaries = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| engine_error("list containers", e))?;

        let records = summaries
            .into_iter()
            .filter_map(|summary| {
                let id = summary.id?;
                let name = summary
                    .names
                    .and_then(|names| names.into_iter().next())
                    .map(|name| name.trim_start_matches('/').to_string())
                    .unwrap_or_else(|| id.clone());
                let created_at = summary
                    .created
                    .and_then(|secs| DateTime::from_timestamp(secs, 0))
                    .unwrap_or_else(Utc::now);
                Some(ContainerRecord {
                    id,
                    name,
                    labels: summary.labels.unwrap_or_default(),
                    running: summary.state == Some(ContainerSummaryStateEnum::RUNNING),
                    created_at,
                })
            })
            .collect();
        Ok(records)
    }

    async fn create_exec(&self, container_id: &str, spec: &ExecSpec) -> RuntimeResult<String> {
        let config = ExecConfig {
            cmd: Some(spec.argv.clone()),
            env: Some(spec.env.clone()).filter(|env| !env.is_empty()),
            working_dir: spec.working_dir.clone(),
            attach_stdin: Some(spec.attach_stdin),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(spec.tty),
            ..Default::default()
        };
        self.docker
            .create_exec(container_id, config)
            .await
            .map(|created| created.id)
            .map_err(|e| engine_error("create exec", e))
    }

    async fn start_exec(&self, exec_id: &str, tty: bool) -> RuntimeResult<ExecStream> {
        let stream = UnixStream::connect(&self.socket_path).await?;
        let (mut sender, connection) =
            hyper::client::conn::http1::handshake(TokioIo::new(stream))
                .await
                .map_err(|e| hijack_error("exec handshake", e))?;
        tokio::spawn(async move {
            if let Err(error) = connection.with_upgrades().await {
                debug!("exec connection closed with error: {error}");
            }
        });

        let body = json!({ "Detach": false, "Tty": tty }).to_string();
        let request = Request::post(format!("/exec/{exec_id}/start"))
            .header(HOST, "docker")
            .header(CONTENT_TYPE, "application/json")
            .header(CONNECTION, "Upgrade")
            .header(UPGRADE, "tcp")
            .body(Full::new(Bytes::from(body)))
            .map_err(|e| hijack_error("build exec request", e))?;

        let response = sender
            .send_request(request)
            .await
            .map_err(|e| hijack_error("start exec", e))?;

        match response.status() {
            StatusCode::SWITCHING_PROTOCOLS => {}
            status => {
                let detail = response
                    .into_body()
                    .collect()
                    .await
                    .map(|body| String::from_utf8_lossy(&body.to_bytes()).trim().to_string())
                    .unwrap_or_default();
                return Err(if status == StatusCode::NOT_FOUND {
                    RuntimeError::NotFound(format!("exec {exec_id}: {detail}"))
                } else {
                    RuntimeError::Api(format!("start exec {exec_id}: {status} {detail}"))
                });
            }
        }

        let upgraded = hyper::upgrade::on(response)
            .await
            .map_err(|e| hijack_error("upgrade exec connection", e))?;
        Ok(Box::new(TokioIo::new(upgraded)))
    }

    async fn inspect_exec(&self, exec_id: &str) -> RuntimeResult<ExecStatus> {
        let response = self
            .docker
            .inspect_exec(exec_id)
            .await
            .map_err(|e| engine_error("inspect exec", e))?;
        Ok(ExecStatus {
            running: response.running.unwrap_or(false),
            exit_code: response.exit_code,
        })
    }

    async fn download_archive(&self, container_id: &str, path: &str) -> RuntimeResult<Vec<u8>> {
        let options = DownloadFromContainerOptions {
            path: path.to_string(),
            ..Default::default()
        };
        let chunks: Vec<Bytes> = self
            .docker
            .download_from_container(container_id, Some(options))
            .try_collect()
            .await
            .map_err(|e| engine_error("download archive", e))?;
        Ok(chunks.concat())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_engine_status_codes() {
        let not_found = BollardError::DockerResponseServerError {
            status_code: 404,
            message: "no such container".into(),
        };
        assert!(matches!(
            engine_error("inspect", not_found),
            RuntimeError::NotFound(_)
        ));

        let conflict = BollardError::DockerResponseServerError {
            status_code: 409,
            message: "name in use".into(),
        };
        assert!(matches!(
            engine_error("create", conflict),
            RuntimeError::AlreadyExists(_)
        ));

        let other = BollardError::DockerResponseServerError {
            status_code: 500,
            message: "boom".into(),
        };
        assert!(matches!(engine_error("create", other), RuntimeError::Api(_)));
    }
}
