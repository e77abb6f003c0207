mod client;

use std::{
    collections::{HashMap, HashSet},
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use tokio::sync::Notify;

use super::{
    network::{PeerNetworkBridge, StaticRendezvous},
    sandbox::{ContainerEngine, ContainerExit, ContainerSpec, EngineError, NetworkSpec, Sandbox},
    sandbox::{INPUT_FILE, OUTPUT_FILE},
};
use crate::{
    common::{CollaborationId, NodeId},
    settings::{NetworkSettings, PeerSettings, SandboxSettings},
};

/// What a fake container does once started.
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Writes its input back as output and exits with code 0.
    Echo,
    /// Writes `output`, if any, then exits.
    Exit {
        code: i64,
        oom_killed: bool,
        output: Option<Vec<u8>>,
    },
    /// Runs until stopped.
    Forever,
    /// Fails to start.
    FailStart(EngineError),
}

#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub spec: ContainerSpec,
    pub behavior: Behavior,
    /// The content of the input file when the container started.
    pub input: Option<Vec<u8>>,
    pub stopped: bool,
}

#[derive(Debug, Default)]
pub struct FakeState {
    /// Images available locally, and what their containers do.
    pub local: HashMap<String, Behavior>,
    /// Images that can be pulled.
    pub remote: HashMap<String, Behavior>,
    pub pulled: Vec<String>,
    pub containers: HashMap<String, FakeContainer>,
    pub removed: Vec<String>,
    /// Networks and the containers explicitly connected to them.
    pub networks: HashMap<String, HashSet<String>>,
    pub networks_created: usize,
    next_id: u64,
}

/// An in-memory container engine.
#[derive(Default)]
pub struct FakeEngine {
    state: Mutex<FakeState>,
    stopped: Notify,
}

impl FakeEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_image(self: &Arc<Self>, image: &str, behavior: Behavior) -> Arc<Self> {
        self.state().local.insert(image.to_string(), behavior);
        self.clone()
    }

    pub fn with_remote_image(self: &Arc<Self>, image: &str, behavior: Behavior) -> Arc<Self> {
        self.state().remote.insert(image.to_string(), behavior);
        self.clone()
    }

    pub fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    /// The containers not removed yet.
    pub fn live_containers(&self) -> Vec<FakeContainer> {
        self.state().containers.values().cloned().collect()
    }

    /// Waits until a container of the run exists and is started.
    pub async fn wait_for_container(&self, name: &str) -> FakeContainer {
        for _ in 0..500 {
            let found = self
                .state()
                .containers
                .values()
                .find(|c| c.spec.name == name && c.input.is_some())
                .cloned();
            if let Some(container) = found {
                return container;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("container {} never started", name);
    }

    fn host_path(spec: &ContainerSpec, mount: &str) -> Option<PathBuf> {
        spec.binds.iter().find_map(|bind| {
            let mut parts = bind.split(':');
            let host = parts.next()?;
            (parts.next()? == mount).then(|| PathBuf::from(host))
        })
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn image_exists(&self, image: &str) -> Result<bool, EngineError> {
        Ok(self.state().local.contains_key(image))
    }

    async fn pull_image(&self, image: &str) -> Result<(), EngineError> {
        let mut state = self.state();
        match state.remote.get(image).cloned() {
            Some(behavior) => {
                state.pulled.push(image.to_string());
                state.local.insert(image.to_string(), behavior);
                Ok(())
            }
            None => Err(EngineError::ImageNotFound(image.to_string())),
        }
    }

    async fn create_container(&self, spec: ContainerSpec) -> Result<String, EngineError> {
        let mut state = self.state();
        let behavior = state
            .local
            .get(&spec.image)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(spec.image.clone()))?;
        if state.containers.values().any(|c| c.spec.name == spec.name) {
            return Err(EngineError::Conflict(spec.name));
        }
        if !state.networks.contains_key(&spec.network) {
            return Err(EngineError::NotFound(spec.network));
        }
        state.next_id += 1;
        let id = format!("container-{}", state.next_id);
        state.containers.insert(
            id.clone(),
            FakeContainer {
                spec,
                behavior,
                input: None,
                stopped: false,
            },
        );
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<(), EngineError> {
        let (spec, behavior) = {
            let state = self.state();
            let container = state
                .containers
                .get(id)
                .ok_or_else(|| EngineError::NotFound(id.to_string()))?;
            (container.spec.clone(), container.behavior.clone())
        };
        if let Behavior::FailStart(error) = behavior {
            return Err(error);
        }
        let input_dir = Self::host_path(&spec, "/mnt/input")
            .ok_or_else(|| EngineError::InvalidConfig("no input mount".into()))?;
        let input = tokio::fs::read(input_dir.join(INPUT_FILE))
            .await
            .map_err(|e| EngineError::InvalidConfig(e.to_string()))?;
        if let Some(container) = self.state().containers.get_mut(id) {
            container.input = Some(input);
        }
        Ok(())
    }

    async fn wait_container(&self, id: &str) -> Result<ContainerExit, EngineError> {
        loop {
            let notified = self.stopped.notified();
            let container = self
                .state()
                .containers
                .get(id)
                .cloned()
                .ok_or_else(|| EngineError::NotFound(id.to_string()))?;
            if container.stopped {
                return Ok(ContainerExit {
                    exit_code: 137,
                    oom_killed: false,
                });
            }
            let output_dir = Self::host_path(&container.spec, "/mnt/output")
                .ok_or_else(|| EngineError::InvalidConfig("no output mount".into()))?;
            let (exit_code, oom_killed, output) = match container.behavior {
                Behavior::Echo => (0, false, container.input),
                Behavior::Exit {
                    code,
                    oom_killed,
                    output,
                } => (code, oom_killed, output),
                Behavior::Forever | Behavior::FailStart(_) => {
                    notified.await;
                    continue;
                }
            };
            if let Some(output) = output {
                tokio::fs::write(output_dir.join(OUTPUT_FILE), output)
                    .await
                    .map_err(|e| EngineError::Unavailable(e.to_string()))?;
            }
            return Ok(ContainerExit {
                exit_code,
                oom_killed,
            });
        }
    }

    async fn stop_container(&self, id: &str, _grace: Duration) -> Result<(), EngineError> {
        let mut state = self.state();
        let container = state
            .containers
            .get_mut(id)
            .ok_or_else(|| EngineError::NotFound(id.to_string()))?;
        container.stopped = true;
        self.stopped.notify_waiters();
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<(), EngineError> {
        let mut state = self.state();
        match state.containers.remove(id) {
            Some(_) => {
                state.removed.push(id.to_string());
                for attached in state.networks.values_mut() {
                    attached.remove(id);
                }
                self.stopped.notify_waiters();
                Ok(())
            }
            None => Err(EngineError::NotFound(id.to_string())),
        }
    }

    async fn list_containers(&self, key: &str, value: &str) -> Result<Vec<String>, EngineError> {
        Ok(self
            .state()
            .containers
            .iter()
            .filter(|(_, c)| c.spec.labels.get(key).map(String::as_str) == Some(value))
            .map(|(id, _)| id.clone())
            .collect())
    }

    async fn create_network(&self, spec: NetworkSpec) -> Result<(), EngineError> {
        let mut state = self.state();
        if state.networks.contains_key(&spec.name) {
            return Err(EngineError::Conflict(spec.name));
        }
        assert!(spec.internal);
        state.networks.insert(spec.name, HashSet::new());
        state.networks_created += 1;
        Ok(())
    }

    async fn remove_network(&self, name: &str) -> Result<(), EngineError> {
        let mut state = self.state();
        let in_use = state
            .containers
            .values()
            .any(|c| c.spec.network == name);
        if in_use {
            return Err(EngineError::Conflict(name.to_string()));
        }
        state
            .networks
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| EngineError::NotFound(name.to_string()))
    }

    async fn connect_network(&self, network: &str, container: &str) -> Result<(), EngineError> {
        let mut state = self.state();
        let attached = state
            .networks
            .get_mut(network)
            .ok_or_else(|| EngineError::NotFound(network.to_string()))?;
        if attached.insert(container.to_string()) {
            Ok(())
        } else {
            Err(EngineError::Conflict(container.to_string()))
        }
    }

    async fn disconnect_network(
        &self,
        network: &str,
        container: &str,
    ) -> Result<(), EngineError> {
        let mut state = self.state();
        let attached = state
            .networks
            .get_mut(network)
            .ok_or_else(|| EngineError::NotFound(network.to_string()))?;
        if attached.remove(container) {
            Ok(())
        } else {
            Err(EngineError::NotFound(container.to_string()))
        }
    }
}

pub const NODE: u64 = 10;
pub const IMAGE: &str = "registry.local/count:1";

pub fn sandbox_settings(data_dir: &tempfile::TempDir) -> SandboxSettings {
    SandboxSettings {
        data_dir: data_dir.path().to_path_buf(),
        stop_grace_period: 1,
        max_concurrent_runs: 4,
        memory_limit: Some(256),
        data_mounts: vec!["/srv/data:/mnt/data".into()],
    }
}

/// The overlay address of node 11. Node 12 has none.
pub const PEER_ADDRESS: &str = "10.76.0.11";

pub fn network_settings() -> NetworkSettings {
    NetworkSettings {
        address: None,
        tunnel_container: Some("tunnel".into()),
        peers: vec![PeerSettings {
            node: 11,
            address: PEER_ADDRESS.parse().unwrap(),
        }],
    }
}

/// A sandbox and a network bridge over a fake engine, with the tunnel container `tunnel`.
///
/// Collaboration 1 has the members 10 (this node), 11 and 12.
pub fn components(
    engine: &Arc<FakeEngine>,
    data_dir: &tempfile::TempDir,
) -> (Arc<Sandbox>, Arc<PeerNetworkBridge>) {
    let node_id = NodeId::from(NODE);
    let sandbox = Arc::new(Sandbox::new(
        engine.clone(),
        sandbox_settings(data_dir),
        node_id,
    ));
    let settings = network_settings();
    let mut members = HashMap::new();
    members.insert(
        CollaborationId::from(1),
        vec![node_id, NodeId::from(11), NodeId::from(12)],
    );
    let bridge = Arc::new(
        PeerNetworkBridge::new(
            engine.clone(),
            Arc::new(StaticRendezvous::new(&settings)),
            node_id,
            &settings,
        )
        .with_members(members),
    );
    (sandbox, bridge)
}

/// The number of entries in a directory.
pub fn entries(dir: &tempfile::TempDir) -> usize {
    std::fs::read_dir(dir.path()).unwrap().count()
}
