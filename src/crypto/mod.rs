//! Wrappers around the [sodiumoxide] primitives used by the platform.
//!
//! Two kinds of keys exist:
//! - `C25519` encryption keys, one pair per node *and* collaboration. The public halves are known
//!   to everyone through a [`KeyRegistry`], the secret halves only ever live inside the node
//!   process, in its [`Keyring`].
//! - `Ed25519` signing keys, one pair per node. They authenticate the node when it opens its
//!   control channel to the coordinator.
//!
//! Task payloads cross the coordinator only as sealed [`SecureEnvelope`] ciphertexts.
//!
//! # Examples
//! ```
//! # use federa::{common::{CollaborationId, NodeId}, crypto::*};
//! # use std::sync::Arc;
//! let collaboration = CollaborationId::from(1);
//! let node = NodeId::from(7);
//! let keys = EncryptKeyPair::generate();
//!
//! let mut registry = StaticKeyRegistry::default();
//! registry.insert(collaboration, node, keys.public);
//! let mut keyring = Keyring::new(node);
//! keyring.insert(collaboration, keys);
//!
//! let envelope = SecureEnvelope::new(Arc::new(registry)).with_keyring(keyring);
//! let sealed = envelope.encrypt(collaboration, node, b"input").unwrap();
//! assert_eq!(envelope.decrypt(collaboration, &sealed).unwrap(), b"input".to_vec());
//! ```
//!
//! [sodiumoxide]: https://docs.rs/sodiumoxide/

pub(crate) mod envelope;
pub(crate) mod keys;
pub(crate) mod registry;

pub use self::{
    envelope::{DecryptionError, SecureEnvelope, UnknownKeyError},
    keys::{
        EncryptKeyPair,
        EncryptKeySeed,
        PublicEncryptKey,
        PublicSigningKey,
        SecretEncryptKey,
        SecretSigningKey,
        Signature,
        SigningKeyPair,
        SigningKeySeed,
    },
    registry::{KeyRegistry, Keyring, StaticKeyRegistry},
};

use sodiumoxide::randombytes::randombytes;

/// An interface for slicing into cryptographic byte objects.
pub trait ByteObject: Sized {
    /// Length in bytes of this object
    const LENGTH: usize;

    /// Gets the object byte representation.
    fn as_slice(&self) -> &[u8];

    /// Creates an object from the given buffer.
    ///
    /// # Errors
    /// Returns `None` if the length of the byte-slice isn't equal to the length of the object.
    fn from_slice(bytes: &[u8]) -> Option<Self>;

    /// Creates an object from a hex string, as found in configuration files.
    fn from_hex(hex: &str) -> Option<Self> {
        hex::decode(hex.trim())
            .ok()
            .and_then(|bytes| Self::from_slice(&bytes))
    }

    /// Returns the hex representation of this object.
    fn to_hex(&self) -> String {
        hex::encode(self.as_slice())
    }

    /// Generates an object with random bytes
    fn generate() -> Self {
        // safe unwrap: length of slice is guaranteed by constants
        Self::from_slice(randombytes(Self::LENGTH).as_slice()).unwrap()
    }
}
