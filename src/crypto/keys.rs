//! Key types for encryption and node authentication.
//!
//! See the [crypto module] documentation since this is a private module anyways.
//!
//! [crypto module]: crate::crypto

use std::convert::TryInto;

use derive_more::{AsRef, From};
use serde::{Deserialize, Serialize};
use sodiumoxide::crypto::{box_, sealedbox, sign};

use super::ByteObject;

#[derive(Debug, Clone, PartialEq, Eq)]
/// A `C25519` key pair, held by a node for one collaboration.
pub struct EncryptKeyPair {
    /// The `C25519` public key.
    pub public: PublicEncryptKey,
    /// The `C25519` secret key.
    pub secret: SecretEncryptKey,
}

impl EncryptKeyPair {
    /// Generates a new random `C25519` key pair for encryption.
    pub fn generate() -> Self {
        let (pk, sk) = box_::gen_keypair();
        Self {
            public: PublicEncryptKey(pk),
            secret: SecretEncryptKey(sk),
        }
    }

    /// Deterministically derives a `C25519` key pair from a seed.
    pub fn derive_from_seed(seed: &EncryptKeySeed) -> Self {
        let (pk, sk) = box_::keypair_from_seed(&seed.0);
        Self {
            public: PublicEncryptKey(pk),
            secret: SecretEncryptKey(sk),
        }
    }
}

#[derive(AsRef, From, Serialize, Deserialize, Hash, Eq, PartialEq, Copy, Clone, Debug)]
/// A `C25519` public key for asymmetric encryption.
pub struct PublicEncryptKey(box_::PublicKey);

impl PublicEncryptKey {
    /// Seals a message `m` for the owner of this public key.
    ///
    /// The ciphertext carries an ephemeral public key, so it is [`sealedbox::SEALBYTES`] longer
    /// than `m`.
    pub fn encrypt(&self, m: &[u8]) -> Vec<u8> {
        sealedbox::seal(m, self.as_ref())
    }
}

impl ByteObject for PublicEncryptKey {
    const LENGTH: usize = box_::PUBLICKEYBYTES;

    fn as_slice(&self) -> &[u8] {
        self.0.as_ref()
    }

    fn from_slice(bytes: &[u8]) -> Option<Self> {
        box_::PublicKey::from_slice(bytes).map(Self)
    }
}

#[derive(AsRef, From, Eq, PartialEq, Clone)]
/// A `C25519` secret key.
///
/// When this goes out of scope, its contents will be zeroed out.
pub struct SecretEncryptKey(box_::SecretKey);

impl SecretEncryptKey {
    /// Opens the sealed ciphertext `c`, returning `None` if it was not sealed for `pk` or has been
    /// tampered with.
    pub fn decrypt(&self, c: &[u8], pk: &PublicEncryptKey) -> Option<Vec<u8>> {
        sealedbox::open(c, pk.as_ref(), self.as_ref()).ok()
    }

    /// Computes the corresponding public key for this secret key.
    pub fn public_key(&self) -> PublicEncryptKey {
        PublicEncryptKey(self.0.public_key())
    }
}

impl std::fmt::Debug for SecretEncryptKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretEncryptKey(..)")
    }
}

#[derive(AsRef, From, Eq, PartialEq, Clone)]
/// A seed for deterministic `C25519` key pair derivation.
pub struct EncryptKeySeed(box_::Seed);

impl std::fmt::Debug for EncryptKeySeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EncryptKeySeed(..)")
    }
}

impl ByteObject for EncryptKeySeed {
    const LENGTH: usize = box_::SEEDBYTES;

    fn as_slice(&self) -> &[u8] {
        self.0.as_ref()
    }

    fn from_slice(bytes: &[u8]) -> Option<Self> {
        box_::Seed::from_slice(bytes).map(Self)
    }
}

#[derive(Debug, Clone)]
/// An `Ed25519` key pair identifying a node.
pub struct SigningKeyPair {
    /// The `Ed25519` public key.
    pub public: PublicSigningKey,
    /// The `Ed25519` secret key.
    pub secret: SecretSigningKey,
}

impl SigningKeyPair {
    /// Generates a new random `Ed25519` key pair for signing.
    pub fn generate() -> Self {
        let (pk, sk) = sign::gen_keypair();
        Self {
            public: PublicSigningKey(pk),
            secret: SecretSigningKey(sk),
        }
    }

    /// Deterministically derives an `Ed25519` key pair from a seed.
    pub fn derive_from_seed(seed: &SigningKeySeed) -> Self {
        let (pk, sk) = sign::keypair_from_seed(&seed.0);
        Self {
            public: PublicSigningKey(pk),
            secret: SecretSigningKey(sk),
        }
    }
}

#[derive(AsRef, From, Serialize, Deserialize, Hash, Eq, PartialEq, Copy, Clone, Debug)]
/// An `Ed25519` public key for signatures.
pub struct PublicSigningKey(sign::PublicKey);

impl PublicSigningKey {
    /// Verifies the signature `s` against the message `m` and this public key.
    pub fn verify_detached(&self, s: &Signature, m: &[u8]) -> bool {
        sign::verify_detached(&s.0, m, self.as_ref())
    }
}

impl ByteObject for PublicSigningKey {
    const LENGTH: usize = sign::PUBLICKEYBYTES;

    fn as_slice(&self) -> &[u8] {
        self.0.as_ref()
    }

    fn from_slice(bytes: &[u8]) -> Option<Self> {
        sign::PublicKey::from_slice(bytes).map(Self)
    }
}

#[derive(AsRef, From, Eq, PartialEq, Clone)]
/// An `Ed25519` secret key.
///
/// When this goes out of scope, its contents will be zeroed out.
pub struct SecretSigningKey(sign::SecretKey);

impl SecretSigningKey {
    /// Signs a message `m` with this secret key.
    pub fn sign_detached(&self, m: &[u8]) -> Signature {
        Signature(sign::sign_detached(m, self.as_ref()))
    }
}

impl std::fmt::Debug for SecretSigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretSigningKey(..)")
    }
}

#[derive(AsRef, From, Eq, PartialEq, Clone)]
/// A seed for deterministic `Ed25519` key pair derivation.
pub struct SigningKeySeed(sign::Seed);

impl std::fmt::Debug for SigningKeySeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SigningKeySeed(..)")
    }
}

impl ByteObject for SigningKeySeed {
    const LENGTH: usize = sign::SEEDBYTES;

    fn as_slice(&self) -> &[u8] {
        self.0.as_ref()
    }

    fn from_slice(bytes: &[u8]) -> Option<Self> {
        sign::Seed::from_slice(bytes).map(Self)
    }
}

#[derive(Eq, PartialEq, Copy, Clone, Debug)]
/// An `Ed25519` signature detached from its message.
pub struct Signature(sign::Signature);

impl ByteObject for Signature {
    const LENGTH: usize = sign::SIGNATUREBYTES;

    fn as_slice(&self) -> &[u8] {
        self.0.as_ref()
    }

    fn from_slice(bytes: &[u8]) -> Option<Self> {
        bytes.try_into().ok().map(Self)
    }
}

mod manually_derive_serde_for_signature {
    use serde::{de::Error, Deserialize, Deserializer, Serialize, Serializer};

    use super::{ByteObject, Signature};

    impl Serialize for Signature {
        fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            self.as_slice().serialize(serializer)
        }
    }

    impl<'de> Deserialize<'de> for Signature {
        fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
        where
            D: Deserializer<'de>,
        {
            let bytes = <Vec<u8> as Deserialize>::deserialize(deserializer)?;
            Self::from_slice(&bytes).ok_or_else(|| {
                D::Error::custom(format!(
                    "invalid length {}, expected {}",
                    bytes.len(),
                    Self::LENGTH,
                ))
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seed_derivation_is_deterministic() {
        let seed = EncryptKeySeed::generate();
        assert_eq!(
            EncryptKeyPair::derive_from_seed(&seed),
            EncryptKeyPair::derive_from_seed(&seed)
        );

        let seed = SigningKeySeed::generate();
        let first = SigningKeyPair::derive_from_seed(&seed);
        let second = SigningKeyPair::derive_from_seed(&seed);
        assert_eq!(first.public, second.public);
    }

    #[test]
    fn test_signature_verification() {
        let keys = SigningKeyPair::generate();
        let signature = keys.secret.sign_detached(b"nonce");
        assert!(keys.public.verify_detached(&signature, b"nonce"));
        assert!(!keys.public.verify_detached(&signature, b"other nonce"));

        let other = SigningKeyPair::generate();
        assert!(!other.public.verify_detached(&signature, b"nonce"));
    }

    #[test]
    fn test_hex_round_trip() {
        let keys = EncryptKeyPair::generate();
        let hex = keys.public.to_hex();
        assert_eq!(PublicEncryptKey::from_hex(&hex), Some(keys.public));
        assert!(PublicEncryptKey::from_hex("not hex").is_none());
        assert!(PublicEncryptKey::from_hex("abcd").is_none());
    }
}
