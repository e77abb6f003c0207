//! The container sandbox.
//!
//! Every run gets its own container, created from the run's image with all capabilities dropped,
//! attached to the network of its collaboration only, and two bind mounts backed by a per-run
//! host directory:
//!
//! - `/mnt/input` (read-only), holding the decrypted input in the file `input`,
//! - `/mnt/output`, where the algorithm is expected to write its result to the file `output`.
//!
//! Their locations are also passed to the container as the `INPUT_FILE` and `OUTPUT_FILE`
//! environment variables. The container finds its own node in `NODE_ID`, the other nodes of the
//! collaboration in `PEERS` (comma separated) and the overlay address of each of them in
//! `PEER_<node>`. The directory, the container and the network attachment are released on every
//! exit path.

mod docker;
mod engine;

use std::{
    collections::HashMap,
    io,
    net::IpAddr,
    path::{Path, PathBuf},
    sync::Arc,
};

use displaydoc::Display;
use thiserror::Error;
use tokio::{
    fs,
    sync::{OwnedSemaphorePermit, Semaphore},
};

pub use self::{
    docker::DockerEngine,
    engine::{ContainerEngine, ContainerExit, ContainerSpec, EngineError, NetworkSpec},
};
#[cfg(test)]
pub use self::engine::MockContainerEngine;
use super::network::NetworkHandle;
use crate::{
    common::{NodeId, RunId},
    settings::SandboxSettings,
};

const INPUT_MOUNT: &str = "/mnt/input";
const OUTPUT_MOUNT: &str = "/mnt/output";
/// Name of the input file, inside the input mount.
pub const INPUT_FILE: &str = "input";
/// Name of the output file, inside the output mount.
pub const OUTPUT_FILE: &str = "output";

/// Label carrying the node owning a container.
pub const NODE_LABEL: &str = "federa.node";
/// Label carrying the run a container executes.
pub const RUN_LABEL: &str = "federa.run";

#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
/// Why a run container could not be started.
pub enum StartFailure {
    /// permanent start failure: {0}
    Permanent(String),
    /// transient start failure: {0}
    Transient(String),
}

impl StartFailure {
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<EngineError> for StartFailure {
    fn from(error: EngineError) -> Self {
        if error.is_permanent() {
            Self::Permanent(error.to_string())
        } else {
            Self::Transient(error.to_string())
        }
    }
}

impl From<io::Error> for StartFailure {
    fn from(error: io::Error) -> Self {
        Self::Transient(format!("run volume: {}", error))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// How a run container ended.
pub enum ExitOutcome {
    /// The container exited with code 0. Holds the content of its output file.
    Success(Vec<u8>),
    /// The run may succeed if retried, e.g. after the container ran out of memory.
    Transient(String),
    Permanent(String),
}

/// One of the sandbox's run slots, reserved with [`Sandbox::reserve`].
#[derive(Debug)]
pub struct RunSlot(OwnedSemaphorePermit);

/// What to run in a sandbox.
#[derive(Debug, Clone, Copy)]
pub struct RunRequest<'a> {
    pub run_id: RunId,
    pub image: &'a str,
    pub input: &'a [u8],
    pub network: &'a NetworkHandle,
    /// The overlay addresses of the other nodes of the collaboration.
    pub peers: &'a [(NodeId, IpAddr)],
}

/// A started run container.
///
/// Holds one of the sandbox's run slots until released.
#[derive(Debug)]
pub struct SandboxHandle {
    run_id: RunId,
    container_id: Option<String>,
    run_dir: PathBuf,
    released: bool,
    _slot: RunSlot,
}

impl SandboxHandle {
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn container_id(&self) -> Option<&str> {
        self.container_id.as_deref()
    }

    /// The host directory backing the run's mounts.
    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    fn input_dir(&self) -> PathBuf {
        self.run_dir.join("input")
    }

    fn output_dir(&self) -> PathBuf {
        self.run_dir.join("output")
    }
}

/// Runs algorithm images in isolated containers.
pub struct Sandbox {
    engine: Arc<dyn ContainerEngine>,
    settings: SandboxSettings,
    node_id: NodeId,
    slots: Arc<Semaphore>,
}

impl Sandbox {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        settings: SandboxSettings,
        node_id: NodeId,
    ) -> Self {
        let slots = Arc::new(Semaphore::new(settings.max_concurrent_runs));
        Self {
            engine,
            settings,
            node_id,
            slots,
        }
    }

    /// Removes the containers and run directories left behind by a previous process of this
    /// node. Returns the number of containers removed.
    ///
    /// # Errors
    /// Fails if the containers of this node cannot be listed.
    pub async fn sweep_orphans(&self) -> Result<usize, EngineError> {
        let orphans = self
            .engine
            .list_containers(NODE_LABEL, &self.node_id.to_string())
            .await?;
        for id in &orphans {
            warn!(container = %id, "removing orphaned run container");
            if let Err(error) = self.engine.remove_container(id).await {
                warn!(container = %id, error = %error, "failed to remove orphaned container");
            }
        }

        if let Ok(mut entries) = fs::read_dir(&self.settings.data_dir).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                let path = entry.path();
                debug!(path = %path.display(), "removing stale run directory");
                if let Err(error) = fs::remove_dir_all(&path).await {
                    warn!(path = %path.display(), error = %error, "failed to remove stale run directory");
                }
            }
        }
        Ok(orphans.len())
    }

    /// Waits for a free run slot. Dropping the future gives up the wait.
    ///
    /// # Errors
    /// Fails if the sandbox is closed.
    pub async fn reserve(&self) -> Result<RunSlot, StartFailure> {
        self.slots
            .clone()
            .acquire_owned()
            .await
            .map(RunSlot)
            .map_err(|_| StartFailure::Transient("the sandbox is closed".into()))
    }

    /// Pulls an image unless it is present already. Dropping the future abandons the pull.
    ///
    /// # Errors
    /// Fails with [`StartFailure::Permanent`] when the image does not exist.
    pub async fn pull(&self, image: &str) -> Result<(), StartFailure> {
        if !self.engine.image_exists(image).await? {
            info!(image, "pulling image");
            self.engine.pull_image(image).await?;
        }
        Ok(())
    }

    /// Creates and starts the container of a run in a reserved slot, pulling its image if needed.
    ///
    /// Whatever was created before a failure is removed again before the failure is returned.
    ///
    /// # Errors
    /// Fails with [`StartFailure::Permanent`] when the image does not exist or the container
    /// configuration is refused, and with [`StartFailure::Transient`] otherwise.
    pub async fn start(
        &self,
        slot: RunSlot,
        request: RunRequest<'_>,
    ) -> Result<SandboxHandle, StartFailure> {
        let run_id = request.run_id;
        let image = request.image;
        let mut handle = SandboxHandle {
            run_id,
            container_id: None,
            run_dir: self.settings.data_dir.join(run_id.to_string()),
            released: false,
            _slot: slot,
        };
        match self.try_start(&mut handle, &request).await {
            Ok(()) => {
                info!(container = ?handle.container_id, image, "run container started");
                Ok(handle)
            }
            Err(failure) => {
                warn!(image, failure = %failure, "run container failed to start");
                self.release(&mut handle).await;
                Err(failure)
            }
        }
    }

    async fn try_start(
        &self,
        handle: &mut SandboxHandle,
        request: &RunRequest<'_>,
    ) -> Result<(), StartFailure> {
        let input_dir = handle.input_dir();
        let output_dir = handle.output_dir();
        fs::create_dir_all(&input_dir).await?;
        fs::create_dir_all(&output_dir).await?;
        fs::write(input_dir.join(INPUT_FILE), request.input).await?;
        // the algorithm may run as any user
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&output_dir, std::fs::Permissions::from_mode(0o777)).await?;
        }

        self.pull(request.image).await?;
        let spec = self.container_spec(handle, request);
        let id = self.engine.create_container(spec).await?;
        handle.container_id = Some(id.clone());
        self.engine.start_container(&id).await?;
        Ok(())
    }

    fn container_spec(&self, handle: &SandboxHandle, request: &RunRequest<'_>) -> ContainerSpec {
        let mut binds = vec![
            format!("{}:{}:ro", handle.input_dir().display(), INPUT_MOUNT),
            format!("{}:{}", handle.output_dir().display(), OUTPUT_MOUNT),
        ];
        binds.extend(
            self.settings
                .data_mounts
                .iter()
                .map(|mount| format!("{}:ro", mount)),
        );
        let mut labels = HashMap::new();
        labels.insert(NODE_LABEL.to_string(), self.node_id.to_string());
        labels.insert(RUN_LABEL.to_string(), handle.run_id.to_string());

        let mut env = vec![
            format!("INPUT_FILE={}/{}", INPUT_MOUNT, INPUT_FILE),
            format!("OUTPUT_FILE={}/{}", OUTPUT_MOUNT, OUTPUT_FILE),
            format!("NODE_ID={}", self.node_id),
        ];
        let peers = request
            .peers
            .iter()
            .map(|(node_id, _)| node_id.to_string())
            .collect::<Vec<_>>();
        env.push(format!("PEERS={}", peers.join(",")));
        env.extend(
            request
                .peers
                .iter()
                .map(|(node_id, address)| format!("PEER_{}={}", node_id, address)),
        );

        ContainerSpec {
            name: format!("federa-run-{}", handle.run_id),
            image: request.image.to_string(),
            binds,
            env,
            labels,
            network: request.network.name().to_string(),
            memory_limit: self.settings.memory_limit.map(|mib| mib * 1024 * 1024),
        }
    }

    /// Waits for the run container to exit, collects its output and releases it.
    ///
    /// The output file is only read once the container is fully stopped.
    pub async fn await_completion(&self, handle: &mut SandboxHandle) -> ExitOutcome {
        let outcome = match handle.container_id.clone() {
            Some(id) => self.wait(handle, &id).await,
            None => ExitOutcome::Permanent("the run container was never created".into()),
        };
        self.release(handle).await;
        outcome
    }

    async fn wait(&self, handle: &SandboxHandle, id: &str) -> ExitOutcome {
        match self.engine.wait_container(id).await {
            Ok(ContainerExit { exit_code: 0, .. }) => {
                match fs::read(handle.output_dir().join(OUTPUT_FILE)).await {
                    Ok(output) => {
                        info!(bytes = output.len(), "run container succeeded");
                        ExitOutcome::Success(output)
                    }
                    Err(error) => ExitOutcome::Permanent(format!("no output: {}", error)),
                }
            }
            Ok(ContainerExit {
                oom_killed: true, ..
            }) => {
                warn!("run container ran out of memory");
                ExitOutcome::Transient("out of memory".into())
            }
            Ok(ContainerExit { exit_code, .. }) => {
                info!(exit_code, "run container failed");
                ExitOutcome::Permanent(format!("exit code {}", exit_code))
            }
            Err(error) if error.is_permanent() => ExitOutcome::Permanent(error.to_string()),
            Err(error) => ExitOutcome::Transient(error.to_string()),
        }
    }

    /// Stops the run container, waiting at most the configured grace period, then removes it
    /// along with the run directory. Killing a released handle does nothing.
    pub async fn kill(&self, handle: &mut SandboxHandle) {
        if handle.released {
            return;
        }
        if let Some(id) = handle.container_id.as_deref() {
            info!(container = %id, "stopping run container");
            if let Err(error) = self
                .engine
                .stop_container(id, self.settings.stop_grace_period())
                .await
            {
                debug!(container = %id, error = %error, "stop failed, removing anyway");
            }
        }
        self.release(handle).await;
    }

    async fn release(&self, handle: &mut SandboxHandle) {
        if handle.released {
            return;
        }
        if let Some(id) = handle.container_id.as_deref() {
            match self.engine.remove_container(id).await {
                Ok(()) | Err(EngineError::NotFound(_)) => {}
                Err(error) => warn!(container = %id, error = %error, "failed to remove run container"),
            }
        }
        match fs::remove_dir_all(&handle.run_dir).await {
            Ok(()) => {}
            Err(error) if error.kind() == io::ErrorKind::NotFound => {}
            Err(error) => {
                warn!(path = %handle.run_dir.display(), error = %error, "failed to remove run directory")
            }
        }
        handle.released = true;
    }
}
