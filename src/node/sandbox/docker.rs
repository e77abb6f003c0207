//! A [`ContainerEngine`] backed by the local Docker daemon.

use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use bollard::{
    container::{
        Config,
        CreateContainerOptions,
        InspectContainerOptions,
        ListContainersOptions,
        RemoveContainerOptions,
        StartContainerOptions,
        StopContainerOptions,
        WaitContainerOptions,
    },
    errors::Error as DockerError,
    image::CreateImageOptions,
    models::{EndpointSettings, HostConfig},
    network::{ConnectNetworkOptions, CreateNetworkOptions, DisconnectNetworkOptions},
    Docker,
};
use futures::{StreamExt, TryStreamExt};

use super::engine::{ContainerEngine, ContainerExit, ContainerSpec, EngineError, NetworkSpec};

/// Maps a Docker error to an [`EngineError`]. Whatever the daemon did not answer with a client
/// error status is considered transient.
fn classify(error: DockerError) -> EngineError {
    match error {
        DockerError::DockerResponseServerError {
            status_code,
            message,
        } => match status_code {
            400 => EngineError::InvalidConfig(message),
            404 => EngineError::NotFound(message),
            409 => EngineError::Conflict(message),
            _ => EngineError::Unavailable(message),
        },
        other => EngineError::Unavailable(other.to_string()),
    }
}

#[derive(Clone)]
pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    /// Connects to the Docker daemon through the platform's default socket.
    ///
    /// # Errors
    /// Fails if the daemon does not answer.
    pub async fn connect() -> Result<Self, EngineError> {
        let docker = Docker::connect_with_local_defaults().map_err(classify)?;
        let version = docker.version().await.map_err(classify)?;
        info!(
            version = version.version.as_deref().unwrap_or("unknown"),
            "connected to the docker daemon"
        );
        Ok(Self { docker })
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn image_exists(&self, image: &str) -> Result<bool, EngineError> {
        match self.docker.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(DockerError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(error) => Err(classify(error)),
        }
    }

    async fn pull_image(&self, image: &str) -> Result<(), EngineError> {
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };
        self.docker
            .create_image(Some(options), None, None)
            .try_collect::<Vec<_>>()
            .await
            .map(|_| ())
            .map_err(|error| match error {
                DockerError::DockerResponseServerError {
                    status_code: 404, ..
                } => EngineError::ImageNotFound(image.to_string()),
                DockerError::DockerStreamError { error } if error.contains("not found") => {
                    EngineError::ImageNotFound(image.to_string())
                }
                other => classify(other),
            })
    }

    async fn create_container(&self, spec: ContainerSpec) -> Result<String, EngineError> {
        let ContainerSpec {
            name,
            image,
            binds,
            env,
            labels,
            network,
            memory_limit,
        } = spec;
        let host_config = HostConfig {
            binds: Some(binds),
            network_mode: Some(network),
            memory: memory_limit.map(|bytes| bytes as i64),
            cap_drop: Some(vec!["ALL".to_string()]),
            security_opt: Some(vec!["no-new-privileges:true".to_string()]),
            ..Default::default()
        };
        let config = Config {
            image: Some(image),
            env: Some(env),
            labels: Some(labels),
            host_config: Some(host_config),
            ..Default::default()
        };
        let options = CreateContainerOptions {
            name,
            ..Default::default()
        };
        let response = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(classify)?;
        for warning in response.warnings {
            warn!(container = %response.id, "{}", warning);
        }
        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> Result<(), EngineError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(classify)
    }

    async fn wait_container(&self, id: &str) -> Result<ContainerExit, EngineError> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };
        let exit_code = match self.docker.wait_container(id, Some(options)).next().await {
            Some(Ok(response)) => response.status_code,
            // non-zero exit codes are reported as errors
            Some(Err(DockerError::DockerContainerWaitError { code, .. })) => code,
            Some(Err(error)) => return Err(classify(error)),
            None => {
                return Err(EngineError::Unavailable(format!(
                    "no exit status for container {}",
                    id
                )))
            }
        };
        let inspect = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(classify)?;
        let oom_killed = inspect
            .state
            .and_then(|state| state.oom_killed)
            .unwrap_or(false);
        Ok(ContainerExit {
            exit_code,
            oom_killed,
        })
    }

    async fn stop_container(&self, id: &str, grace: Duration) -> Result<(), EngineError> {
        let options = StopContainerOptions {
            t: stop_timeout(grace),
        };
        match self.docker.stop_container(id, Some(options)).await {
            // already stopped
            Err(DockerError::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            result => result.map_err(classify),
        }
    }

    async fn remove_container(&self, id: &str) -> Result<(), EngineError> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        self.docker
            .remove_container(id, Some(options))
            .await
            .map_err(classify)
    }

    async fn list_containers(&self, key: &str, value: &str) -> Result<Vec<String>, EngineError> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![format!("{}={}", key, value)]);
        let options = ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        };
        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(classify)?;
        Ok(containers
            .into_iter()
            .filter_map(|container| container.id)
            .collect())
    }

    async fn create_network(&self, spec: NetworkSpec) -> Result<(), EngineError> {
        let options = CreateNetworkOptions {
            name: spec.name,
            check_duplicate: true,
            driver: "bridge".to_string(),
            internal: spec.internal,
            labels: spec.labels,
            ..Default::default()
        };
        self.docker
            .create_network(options)
            .await
            .map(|_| ())
            .map_err(classify)
    }

    async fn remove_network(&self, name: &str) -> Result<(), EngineError> {
        self.docker.remove_network(name).await.map_err(classify)
    }

    async fn connect_network(&self, network: &str, container: &str) -> Result<(), EngineError> {
        let options = ConnectNetworkOptions {
            container,
            endpoint_config: EndpointSettings::default(),
        };
        self.docker
            .connect_network(network, options)
            .await
            .map_err(classify)
    }

    async fn disconnect_network(
        &self,
        network: &str,
        container: &str,
    ) -> Result<(), EngineError> {
        let options = DisconnectNetworkOptions {
            container,
            force: true,
        };
        self.docker
            .disconnect_network(network, options)
            .await
            .map_err(classify)
    }
}

/// The stop timeout in whole seconds, rounded up so that a short grace period is not lost.
fn stop_timeout(grace: Duration) -> i64 {
    let secs = grace.as_secs() + u64::from(grace.subsec_nanos() > 0);
    i64::try_from(secs).unwrap_or(i64::MAX)
}
