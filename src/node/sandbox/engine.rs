//! The container engine seam.

use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use displaydoc::Display;
use thiserror::Error;

#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
/// Errors reported by a [`ContainerEngine`].
pub enum EngineError {
    /// image {0} not found
    ImageNotFound(String),
    /// no such object: {0}
    NotFound(String),
    /// conflict: {0}
    Conflict(String),
    /// invalid container configuration: {0}
    InvalidConfig(String),
    /// container engine unavailable: {0}
    Unavailable(String),
}

impl EngineError {
    /// Whether retrying the same operation can never succeed.
    ///
    /// Anything the engine does not clearly attribute to the request itself is considered
    /// transient.
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::ImageNotFound(_) | Self::InvalidConfig(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Everything needed to create a run container.
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    /// Bind mounts, in the `host:container[:options]` format.
    pub binds: Vec<String>,
    /// Environment variables, in the `KEY=value` format.
    pub env: Vec<String>,
    pub labels: HashMap<String, String>,
    /// The only network the container is attached to.
    pub network: String,
    /// Memory limit in bytes.
    pub memory_limit: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkSpec {
    pub name: String,
    /// Internal networks have no route to the host or the outside world.
    pub internal: bool,
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// How a container exited.
pub struct ContainerExit {
    pub exit_code: i64,
    pub oom_killed: bool,
}

/// The container engine operations the sandbox and the network bridge rely on.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ContainerEngine: Send + Sync + 'static {
    /// Checks whether an image is available locally.
    async fn image_exists(&self, image: &str) -> Result<bool, EngineError>;
    /// Pulls an image from its registry.
    async fn pull_image(&self, image: &str) -> Result<(), EngineError>;

    /// Creates a container and returns its identifier.
    async fn create_container(&self, spec: ContainerSpec) -> Result<String, EngineError>;
    async fn start_container(&self, id: &str) -> Result<(), EngineError>;
    /// Waits until the container is not running anymore.
    async fn wait_container(&self, id: &str) -> Result<ContainerExit, EngineError>;
    /// Asks the container to terminate, and kills it after `grace`.
    async fn stop_container(&self, id: &str, grace: Duration) -> Result<(), EngineError>;
    /// Removes a container along with its anonymous volumes, killing it if needed.
    async fn remove_container(&self, id: &str) -> Result<(), EngineError>;
    /// Lists the identifiers of all containers, running or not, carrying the label
    /// `key=value`.
    async fn list_containers(&self, key: &str, value: &str) -> Result<Vec<String>, EngineError>;

    async fn create_network(&self, spec: NetworkSpec) -> Result<(), EngineError>;
    async fn remove_network(&self, name: &str) -> Result<(), EngineError>;
    async fn connect_network(&self, network: &str, container: &str) -> Result<(), EngineError>;
    async fn disconnect_network(&self, network: &str, container: &str)
        -> Result<(), EngineError>;
}
