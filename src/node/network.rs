//! The peer network bridge.
//!
//! Run containers of a collaboration share one internal container network per node. The network
//! has no route to the host or the outside world: the only other endpoint on it is the optional
//! tunnel container, which carries the overlay to the other nodes of the collaboration.

use std::{collections::HashMap, net::IpAddr, sync::Arc};

use async_trait::async_trait;
use displaydoc::Display;
use thiserror::Error;
use tokio::sync::Mutex;

use super::sandbox::{ContainerEngine, EngineError, NetworkSpec, NODE_LABEL};
use crate::{
    common::{CollaborationId, NodeId},
    settings::NetworkSettings,
};

/// Label carrying the collaboration a network belongs to.
pub const COLLABORATION_LABEL: &str = "federa.collaboration";

#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum RendezvousError {
    /// node {0} is unknown to the rendezvous
    UnknownPeer(NodeId),
    /// rendezvous unavailable: {0}
    Unavailable(String),
}

/// Where the nodes of the overlay meet.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Rendezvous: Send + Sync + 'static {
    /// Announces a node on the overlay and returns its address there.
    async fn register(&self, node_id: NodeId) -> Result<IpAddr, RendezvousError>;
    /// Resolves the overlay address of another node.
    async fn peer_address(&self, node_id: NodeId) -> Result<IpAddr, RendezvousError>;
}

/// A rendezvous whose addresses are all fixed in the settings.
#[derive(Debug, Clone, Default)]
pub struct StaticRendezvous {
    local: Option<IpAddr>,
    peers: HashMap<NodeId, IpAddr>,
}

impl StaticRendezvous {
    pub fn new(settings: &NetworkSettings) -> Self {
        Self {
            local: settings.address,
            peers: settings
                .peers
                .iter()
                .map(|peer| (NodeId::from(peer.node), peer.address))
                .collect(),
        }
    }
}

#[async_trait]
impl Rendezvous for StaticRendezvous {
    async fn register(&self, node_id: NodeId) -> Result<IpAddr, RendezvousError> {
        self.local.ok_or_else(|| {
            RendezvousError::Unavailable(format!("no overlay address configured for node {}", node_id))
        })
    }

    async fn peer_address(&self, node_id: NodeId) -> Result<IpAddr, RendezvousError> {
        self.peers
            .get(&node_id)
            .copied()
            .ok_or(RendezvousError::UnknownPeer(node_id))
    }
}

#[derive(Debug, Display, Error)]
pub enum NetworkError {
    /// {0}
    Engine(#[from] EngineError),
    /// {0}
    Rendezvous(#[from] RendezvousError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// An acquired collaboration network. Give it back with [`PeerNetworkBridge::release`].
pub struct NetworkHandle {
    collaboration_id: CollaborationId,
    name: String,
}

impl NetworkHandle {
    pub fn collaboration_id(&self) -> CollaborationId {
        self.collaboration_id
    }

    /// The engine name of the network.
    pub fn name(&self) -> &str {
        &self.name
    }
}

struct Entry {
    handle: NetworkHandle,
    users: usize,
}

/// Manages the collaboration networks of a node.
pub struct PeerNetworkBridge {
    engine: Arc<dyn ContainerEngine>,
    rendezvous: Arc<dyn Rendezvous>,
    node_id: NodeId,
    tunnel: Option<String>,
    members: HashMap<CollaborationId, Vec<NodeId>>,
    networks: Mutex<HashMap<CollaborationId, Entry>>,
}

impl PeerNetworkBridge {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        rendezvous: Arc<dyn Rendezvous>,
        node_id: NodeId,
        settings: &NetworkSettings,
    ) -> Self {
        Self {
            engine,
            rendezvous,
            node_id,
            tunnel: settings.tunnel_container.clone(),
            members: HashMap::new(),
            networks: Mutex::new(HashMap::new()),
        }
    }

    /// Sets the other members of each collaboration.
    pub fn with_members(mut self, members: HashMap<CollaborationId, Vec<NodeId>>) -> Self {
        self.members = members;
        self
    }

    /// Registers this node with the rendezvous and returns its overlay address.
    pub async fn register(&self) -> Result<IpAddr, NetworkError> {
        let address = self.rendezvous.register(self.node_id).await?;
        info!(address = %address, "registered on the overlay");
        Ok(address)
    }

    pub async fn peer_address(&self, node_id: NodeId) -> Result<IpAddr, NetworkError> {
        Ok(self.rendezvous.peer_address(node_id).await?)
    }

    /// Resolves the overlay addresses of the other members of a collaboration.
    ///
    /// Members the rendezvous cannot resolve are left out.
    pub async fn peer_addresses(
        &self,
        collaboration_id: CollaborationId,
    ) -> Vec<(NodeId, IpAddr)> {
        let members = match self.members.get(&collaboration_id) {
            Some(members) => members,
            None => return Vec::new(),
        };
        let mut peers = Vec::with_capacity(members.len());
        for node_id in members.iter().copied().filter(|id| *id != self.node_id) {
            match self.peer_address(node_id).await {
                Ok(address) => peers.push((node_id, address)),
                Err(error) => warn!(peer = %node_id, error = %error, "peer not reachable"),
            }
        }
        peers
    }

    /// Returns the network of a collaboration, creating it for the first user.
    ///
    /// # Errors
    /// Fails if the network cannot be created or the tunnel cannot be attached to it.
    pub async fn acquire_network(
        &self,
        collaboration_id: CollaborationId,
    ) -> Result<NetworkHandle, NetworkError> {
        let mut networks = self.networks.lock().await;
        if let Some(entry) = networks.get_mut(&collaboration_id) {
            entry.users += 1;
            return Ok(entry.handle.clone());
        }

        let handle = NetworkHandle {
            collaboration_id,
            name: format!("federa-{}-collaboration-{}", self.node_id, collaboration_id),
        };
        self.create(&handle).await?;
        debug!(network = %handle.name, "collaboration network up");
        networks.insert(
            collaboration_id,
            Entry {
                handle: handle.clone(),
                users: 1,
            },
        );
        Ok(handle)
    }

    async fn create(&self, handle: &NetworkHandle) -> Result<(), NetworkError> {
        let mut labels = HashMap::new();
        labels.insert(NODE_LABEL.to_string(), self.node_id.to_string());
        labels.insert(
            COLLABORATION_LABEL.to_string(),
            handle.collaboration_id.to_string(),
        );
        let spec = NetworkSpec {
            name: handle.name.clone(),
            internal: true,
            labels,
        };
        match self.engine.create_network(spec).await {
            // left over by a previous process
            Ok(()) | Err(EngineError::Conflict(_)) => {}
            Err(error) => return Err(error.into()),
        }

        if let Some(tunnel) = &self.tunnel {
            match self.engine.connect_network(&handle.name, tunnel).await {
                Ok(()) | Err(EngineError::Conflict(_)) => {}
                Err(error) => {
                    let _ = self.engine.remove_network(&handle.name).await;
                    return Err(error.into());
                }
            }
        }
        Ok(())
    }

    /// Gives a network back. The network is torn down when its last user releases it.
    pub async fn release(&self, handle: &NetworkHandle) {
        let mut networks = self.networks.lock().await;
        let last = match networks.get_mut(&handle.collaboration_id) {
            Some(entry) => {
                entry.users -= 1;
                entry.users == 0
            }
            None => {
                warn!(network = %handle.name, "released an unknown network");
                return;
            }
        };
        if !last {
            return;
        }
        networks.remove(&handle.collaboration_id);

        if let Some(tunnel) = &self.tunnel {
            if let Err(error) = self.engine.disconnect_network(&handle.name, tunnel).await {
                warn!(network = %handle.name, error = %error, "failed to detach the tunnel");
            }
        }
        match self.engine.remove_network(&handle.name).await {
            Ok(()) => debug!(network = %handle.name, "collaboration network down"),
            Err(error) => warn!(network = %handle.name, error = %error, "failed to remove network"),
        }
    }

    /// The number of networks currently up.
    pub async fn active_networks(&self) -> usize {
        self.networks.lock().await.len()
    }
}
