use std::{
    collections::{HashMap, HashSet},
    net::IpAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;
use validator::{Validate, ValidationError};

use super::{
    coordinator::default_max_message_size,
    deserialize_hex,
    load,
    LoggingSettings,
    SettingsError,
};
use crate::{
    common::{CollaborationId, NodeId},
    crypto::{
        EncryptKeyPair,
        EncryptKeySeed,
        Keyring,
        PublicEncryptKey,
        SigningKeyPair,
        SigningKeySeed,
        StaticKeyRegistry,
    },
};

#[derive(Debug, Validate, Deserialize)]
#[validate(schema(function = "validate_collaborations"))]
/// The node settings.
///
/// Each section in the configuration file corresponds to the identically named settings field.
pub struct NodeSettings {
    pub node: IdentitySettings,
    #[validate]
    pub coordinator: ChannelSettings,
    #[validate]
    pub sandbox: SandboxSettings,
    #[serde(default)]
    pub network: NetworkSettings,
    pub collaborations: Vec<NodeCollaborationSettings>,
    pub log: LoggingSettings,
}

impl NodeSettings {
    /// Loads and validates the settings via a configuration file.
    ///
    /// # Errors
    /// Fails when the loading of the configuration file or its validation failed.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        load(path)
    }

    pub fn node_id(&self) -> NodeId {
        NodeId::from(self.node.id)
    }

    /// The identity key pair the node authenticates with.
    pub fn signing_keys(&self) -> SigningKeyPair {
        SigningKeyPair::derive_from_seed(&self.node.signing_seed)
    }

    /// The node's private keys, one pair per collaboration.
    pub fn keyring(&self) -> Keyring {
        let mut keyring = Keyring::new(self.node_id());
        for collaboration in &self.collaborations {
            keyring.insert(
                CollaborationId::from(collaboration.id),
                EncryptKeyPair::derive_from_seed(&collaboration.encrypt_seed),
            );
        }
        keyring
    }

    /// The public keys of the other members (and this node's own, derived from its seeds), used to
    /// seal results for task initiators.
    pub fn key_registry(&self) -> StaticKeyRegistry {
        let mut registry = StaticKeyRegistry::default();
        for collaboration in &self.collaborations {
            let id = CollaborationId::from(collaboration.id);
            registry.insert(
                id,
                self.node_id(),
                EncryptKeyPair::derive_from_seed(&collaboration.encrypt_seed).public,
            );
            for peer in &collaboration.peers {
                registry.insert(id, NodeId::from(peer.node), peer.encrypt_key);
            }
        }
        registry
    }

    /// The other members of each collaboration.
    pub fn collaboration_peers(&self) -> HashMap<CollaborationId, Vec<NodeId>> {
        self.collaborations
            .iter()
            .map(|c| {
                let peers = c.peers.iter().map(|peer| NodeId::from(peer.node)).collect();
                (CollaborationId::from(c.id), peers)
            })
            .collect()
    }

    pub fn collaboration_ids(&self) -> Vec<CollaborationId> {
        self.collaborations
            .iter()
            .map(|c| CollaborationId::from(c.id))
            .collect()
    }
}

#[derive(Debug, Deserialize, Clone)]
/// The node identity.
///
/// # Examples
///
/// **TOML**
/// ```text
/// [node]
/// id = 10
/// signing_seed = "<64 hex characters>"
/// ```
pub struct IdentitySettings {
    pub id: u64,
    /// Seed of the node's `Ed25519` identity key pair.
    #[serde(deserialize_with = "deserialize_hex")]
    pub signing_seed: SigningKeySeed,
}

#[derive(Debug, Validate, Deserialize, Clone)]
#[validate(schema(function = "validate_backoff"))]
/// Settings of the control channel to the coordinator.
pub struct ChannelSettings {
    /// The coordinator's control channel address.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [coordinator]
    /// address = "coordinator.example.org:7070"
    /// ```
    pub address: String,

    /// The largest control message accepted, in bytes. Defaults to 16 MiB.
    #[serde(default = "default_max_message_size")]
    #[validate(range(min = 1024))]
    pub max_message_size: usize,

    /// First delay before reconnecting after the channel dropped, in milliseconds. The delay
    /// doubles after every failed attempt, up to `max_backoff`.
    #[serde(default = "default_initial_backoff")]
    #[validate(range(min = 1))]
    pub initial_backoff: u64,

    /// Upper bound of the reconnection delay, in milliseconds.
    #[serde(default = "default_max_backoff")]
    pub max_backoff: u64,
}

fn default_initial_backoff() -> u64 {
    500
}

fn default_max_backoff() -> u64 {
    30_000
}

fn validate_backoff(s: &ChannelSettings) -> Result<(), ValidationError> {
    if s.initial_backoff <= s.max_backoff {
        Ok(())
    } else {
        Err(ValidationError::new("invalid backoff range"))
    }
}

impl ChannelSettings {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff)
    }
}

#[derive(Debug, Validate, Deserialize, Clone)]
/// Container sandbox settings.
pub struct SandboxSettings {
    /// Directory under which the per-run input/output volumes are created.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [sandbox]
    /// data_dir = "/var/lib/federa/runs"
    /// ```
    pub data_dir: PathBuf,

    /// How long a container gets to exit after the termination signal before it is force-removed,
    /// in seconds.
    #[serde(default = "default_stop_grace_period")]
    pub stop_grace_period: u64,

    /// The maximum number of containers being started or running at the same time.
    #[serde(default = "default_max_concurrent_runs")]
    #[validate(range(min = 1))]
    pub max_concurrent_runs: usize,

    /// Memory limit of a run container, in MiB. Unlimited when absent.
    #[serde(default)]
    pub memory_limit: Option<u64>,

    /// Host directories mounted read-only into every run container, as `host:container` pairs.
    /// This is how algorithms reach the node's private data.
    #[serde(default)]
    pub data_mounts: Vec<String>,
}

fn default_stop_grace_period() -> u64 {
    10
}

fn default_max_concurrent_runs() -> usize {
    4
}

impl SandboxSettings {
    pub fn stop_grace_period(&self) -> Duration {
        Duration::from_secs(self.stop_grace_period)
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
/// Peer network settings.
///
/// # Examples
///
/// **TOML**
/// ```text
/// [network]
/// address = "10.76.0.10"
/// tunnel_container = "federa-vpn-client"
///
/// [[network.peers]]
/// node = 11
/// address = "10.76.0.11"
/// ```
pub struct NetworkSettings {
    /// This node's address on the overlay network.
    pub address: Option<IpAddr>,
    /// The container running the tunnel endpoint. It is attached to every collaboration network
    /// and is the only route out of it.
    pub tunnel_container: Option<String>,
    /// The overlay addresses of the other nodes.
    #[serde(default)]
    pub peers: Vec<PeerSettings>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PeerSettings {
    pub node: u64,
    pub address: IpAddr,
}

#[derive(Debug, Deserialize, Clone)]
/// A collaboration this node takes part in.
///
/// # Examples
///
/// **TOML**
/// ```text
/// [[collaborations]]
/// id = 1
/// encrypt_seed = "<64 hex characters>"
///
/// [[collaborations.peers]]
/// node = 11
/// encrypt_key = "<64 hex characters>"
/// ```
pub struct NodeCollaborationSettings {
    pub id: u64,
    /// Seed of this node's `C25519` key pair for the collaboration.
    #[serde(deserialize_with = "deserialize_hex")]
    pub encrypt_seed: EncryptKeySeed,
    /// Public keys of the other members.
    #[serde(default)]
    pub peers: Vec<PeerKeySettings>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PeerKeySettings {
    pub node: u64,
    #[serde(deserialize_with = "deserialize_hex")]
    pub encrypt_key: PublicEncryptKey,
}

fn validate_collaborations(s: &NodeSettings) -> Result<(), ValidationError> {
    check_collaborations(&s.collaborations)
}

fn check_collaborations(collaborations: &[NodeCollaborationSettings]) -> Result<(), ValidationError> {
    if collaborations.is_empty() {
        return Err(ValidationError::new("a node needs at least one collaboration"));
    }
    let mut ids = HashSet::new();
    if collaborations.iter().all(|c| ids.insert(c.id)) {
        Ok(())
    } else {
        Err(ValidationError::new("duplicate collaboration id"))
    }
}
