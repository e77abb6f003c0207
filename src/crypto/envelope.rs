//! The secure envelope around task inputs and results.

use std::sync::Arc;

use displaydoc::Display;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{KeyRegistry, Keyring};
use crate::common::{CollaborationId, NodeId};

/// No public key is registered for node {node} in collaboration {collaboration}.
#[derive(Debug, Display, Error, Clone, Copy, PartialEq, Eq)]
pub struct UnknownKeyError {
    pub collaboration: CollaborationId,
    pub node: NodeId,
}

/// Errors which can occur when opening an envelope.
///
/// None of the variants ever carries (partially) decrypted data.
#[derive(Debug, Display, Error, Clone, Copy, PartialEq, Eq)]
pub enum DecryptionError {
    /// This node holds no key for collaboration {0}.
    NoKey(CollaborationId),
    /// The ciphertext failed the integrity check.
    Integrity,
    /// The envelope is bound to another collaboration or recipient.
    Mismatch,
}

/// What actually gets sealed: the payload together with the context it was sealed for.
#[derive(Serialize, Deserialize)]
struct SealedBody {
    collaboration: CollaborationId,
    recipient: NodeId,
    payload: Vec<u8>,
}

/// Asymmetric encryption of payloads, keyed by collaboration.
///
/// The coordinator only ever holds the public side (`SecureEnvelope::new`). Nodes attach their
/// [`Keyring`] with [`SecureEnvelope::with_keyring`] to be able to open envelopes addressed to
/// them.
#[derive(Clone)]
pub struct SecureEnvelope {
    registry: Arc<dyn KeyRegistry>,
    keyring: Option<Arc<Keyring>>,
}

impl SecureEnvelope {
    pub fn new(registry: Arc<dyn KeyRegistry>) -> Self {
        Self {
            registry,
            keyring: None,
        }
    }

    pub fn with_keyring(self, keyring: Keyring) -> Self {
        Self {
            keyring: Some(Arc::new(keyring)),
            ..self
        }
    }

    /// Seals `plaintext` for `node` in `collaboration`.
    ///
    /// # Errors
    /// Fails with [`UnknownKeyError`] if the registry has no key for the pair.
    pub fn encrypt(
        &self,
        collaboration: CollaborationId,
        node: NodeId,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, UnknownKeyError> {
        let key = self
            .registry
            .public_key(collaboration, node)
            .ok_or(UnknownKeyError { collaboration, node })?;
        let body = SealedBody {
            collaboration,
            recipient: node,
            payload: plaintext.to_vec(),
        };
        // safe unwrap: serializing a struct of integers and bytes into a vector cannot fail
        let bytes = bincode::serialize(&body).unwrap();
        Ok(key.encrypt(&bytes))
    }

    /// Opens an envelope sealed for this node in `collaboration`.
    ///
    /// # Errors
    /// Fails with [`DecryptionError`] if this envelope has no keyring, if the ciphertext was not
    /// sealed with this node's key or was tampered with, or if it was sealed for another
    /// collaboration or node.
    pub fn decrypt(
        &self,
        collaboration: CollaborationId,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, DecryptionError> {
        let keyring = self
            .keyring
            .as_ref()
            .ok_or(DecryptionError::NoKey(collaboration))?;
        let pair = keyring
            .pair(collaboration)
            .ok_or(DecryptionError::NoKey(collaboration))?;
        let bytes = pair
            .secret
            .decrypt(ciphertext, &pair.public)
            .ok_or(DecryptionError::Integrity)?;
        let body: SealedBody =
            bincode::deserialize(&bytes).map_err(|_| DecryptionError::Integrity)?;
        if body.collaboration != collaboration || body.recipient != keyring.owner() {
            return Err(DecryptionError::Mismatch);
        }
        Ok(body.payload)
    }
}

impl std::fmt::Debug for SecureEnvelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureEnvelope")
            .field("keyring", &self.keyring)
            .finish()
    }
}
