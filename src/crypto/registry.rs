//! Public key lookup and the node-local private keyring.

use std::{collections::HashMap, fmt};

use super::{EncryptKeyPair, PublicEncryptKey};
use crate::common::{CollaborationId, NodeId};

/// Resolves the public encryption key of a node within a collaboration.
///
/// The lookup is deterministic: the same pair always resolves to the same key until the registry
/// is replaced.
pub trait KeyRegistry: Send + Sync {
    fn public_key(&self, collaboration: CollaborationId, node: NodeId) -> Option<PublicEncryptKey>;
}

/// A [`KeyRegistry`] backed by a fixed table, usually loaded from the settings.
#[derive(Debug, Default, Clone)]
pub struct StaticKeyRegistry {
    keys: HashMap<(CollaborationId, NodeId), PublicEncryptKey>,
}

impl StaticKeyRegistry {
    /// Registers (or replaces) the public key of `node` in `collaboration`.
    pub fn insert(&mut self, collaboration: CollaborationId, node: NodeId, key: PublicEncryptKey) {
        self.keys.insert((collaboration, node), key);
    }
}

impl KeyRegistry for StaticKeyRegistry {
    fn public_key(&self, collaboration: CollaborationId, node: NodeId) -> Option<PublicEncryptKey> {
        self.keys.get(&(collaboration, node)).copied()
    }
}

/// The private key material of a node, one key pair per collaboration.
///
/// Neither `Serialize` nor `Clone`: a keyring is built once in the node process and moved into its
/// envelope.
pub struct Keyring {
    owner: NodeId,
    pairs: HashMap<CollaborationId, EncryptKeyPair>,
}

impl Keyring {
    /// Creates an empty keyring for `owner`.
    pub fn new(owner: NodeId) -> Self {
        Self {
            owner,
            pairs: HashMap::new(),
        }
    }

    pub fn insert(&mut self, collaboration: CollaborationId, pair: EncryptKeyPair) {
        self.pairs.insert(collaboration, pair);
    }

    /// The node this keyring belongs to.
    pub fn owner(&self) -> NodeId {
        self.owner
    }

    pub(crate) fn pair(&self, collaboration: CollaborationId) -> Option<&EncryptKeyPair> {
        self.pairs.get(&collaboration)
    }

    /// The collaborations this node holds keys for.
    pub fn collaborations(&self) -> impl Iterator<Item = CollaborationId> + '_ {
        self.pairs.keys().copied()
    }
}

impl fmt::Debug for Keyring {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keyring")
            .field("owner", &self.owner)
            .field("collaborations", &self.pairs.keys().collect::<Vec<_>>())
            .finish()
    }
}
