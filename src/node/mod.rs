//! The node agent.
//!
//! A node holds the private keys of its organization. It keeps one authenticated control channel
//! to the coordinator ([`NodeClient`]), opens the inputs it is assigned and runs the algorithm of
//! each run in a container ([`Executor`], [`Sandbox`]) attached to the network of the run's
//! collaboration ([`PeerNetworkBridge`]). Results are sealed for the task initiator before they
//! leave the node.

pub mod client;
pub mod executor;
pub mod network;
pub mod sandbox;

#[cfg(test)]
mod tests;

use std::sync::Arc;

pub use self::{
    client::{ClientError, NodeClient},
    executor::{Executor, KillInitiator},
    network::{NetworkHandle, PeerNetworkBridge, Rendezvous, StaticRendezvous},
    sandbox::{
        ContainerEngine,
        DockerEngine,
        ExitOutcome,
        RunRequest,
        RunSlot,
        Sandbox,
        SandboxHandle,
        StartFailure,
    },
};
use crate::{crypto::SecureEnvelope, settings::NodeSettings};

/// Wires the node components together on top of a container engine and a rendezvous.
pub fn build(
    settings: &NodeSettings,
    engine: Arc<dyn ContainerEngine>,
    rendezvous: Arc<dyn Rendezvous>,
) -> (NodeClient, Arc<Sandbox>, Arc<PeerNetworkBridge>) {
    let node_id = settings.node_id();
    let sandbox = Arc::new(Sandbox::new(
        engine.clone(),
        settings.sandbox.clone(),
        node_id,
    ));
    let bridge = Arc::new(
        PeerNetworkBridge::new(engine, rendezvous, node_id, &settings.network)
            .with_members(settings.collaboration_peers()),
    );
    let envelope =
        SecureEnvelope::new(Arc::new(settings.key_registry())).with_keyring(settings.keyring());
    let executor = Executor::new(sandbox.clone(), bridge.clone(), envelope);
    let client = NodeClient::new(
        settings.coordinator.clone(),
        node_id,
        settings.signing_keys(),
        settings.collaboration_ids(),
        executor,
    );
    (client, sandbox, bridge)
}
