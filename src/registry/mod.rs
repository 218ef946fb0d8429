//! Signed, revision-numbered registry entries and the multi-host read and
//! update flows built on top of the worker pool.

use ed25519_dalek::{SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::config::MAX_REGISTRY_DATA_SIZE;
use crate::crypto::{blake2b256_all, sign_hash, verify_hash, Hash};
use crate::error::RegistryError;
use crate::types::PublicKey;

pub mod cache;
mod read;
mod update;

pub use cache::RegistryCache;
pub use read::read_registry;
pub use update::{update_registry, UpdateRegistryOutcome};

/// The signed payload of a registry entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryValue {
    pub tweak: Hash,
    pub data: Vec<u8>,
    pub revision: u64,
}

impl RegistryValue {
    /// Hash covered by the entry signature.
    #[must_use]
    pub fn hash(&self) -> Hash {
        blake2b256_all(&[
            &self.tweak,
            &(self.data.len() as u64).to_le_bytes(),
            &self.data,
            &self.revision.to_le_bytes(),
        ])
    }

    /// Sign the value with the owner's key.
    #[must_use]
    pub fn sign(self, sk: &SigningKey) -> SignedRegistryValue {
        let signature = sign_hash(sk, &self.hash());
        SignedRegistryValue {
            value: self,
            signature,
        }
    }
}

/// A registry value plus its owner signature.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedRegistryValue {
    pub value: RegistryValue,
    #[serde(with = "crate::crypto::sig_serde")]
    pub signature: [u8; 64],
}

impl SignedRegistryValue {
    /// Check the signature and the data size cap against the owner key.
    pub fn verify(&self, pk: &PublicKey) -> Result<(), RegistryError> {
        if self.value.data.len() > MAX_REGISTRY_DATA_SIZE {
            return Err(RegistryError::DataTooLarge);
        }
        let Ok(vk) = VerifyingKey::from_bytes(&pk.key) else {
            return Err(RegistryError::InvalidSignature);
        };
        if !verify_hash(&vk, &self.value.hash(), &self.signature) {
            return Err(RegistryError::InvalidSignature);
        }
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::generate_keypair;

    fn signed_entry(revision: u64) -> (SignedRegistryValue, PublicKey) {
        let (sk, vk) = generate_keypair();
        let entry = RegistryValue {
            tweak: [7u8; 32],
            data: b"value".to_vec(),
            revision,
        }
        .sign(&sk);
        (entry, PublicKey::ed25519(vk.to_bytes()))
    }

    #[test]
    fn sign_verify_roundtrip() {
        let (entry, pk) = signed_entry(3);
        assert!(entry.verify(&pk).is_ok());
    }

    #[test]
    fn tampering_breaks_signature() {
        let (mut entry, pk) = signed_entry(3);
        entry.value.revision = 4;
        assert_eq!(entry.verify(&pk), Err(RegistryError::InvalidSignature));
    }

    #[test]
    fn oversized_data_rejected() {
        let (sk, vk) = generate_keypair();
        let entry = RegistryValue {
            tweak: [0u8; 32],
            data: vec![0u8; MAX_REGISTRY_DATA_SIZE + 1],
            revision: 1,
        }
        .sign(&sk);
        assert_eq!(
            entry.verify(&PublicKey::ed25519(vk.to_bytes())),
            Err(RegistryError::DataTooLarge)
        );
    }

    #[test]
    fn wire_roundtrip() {
        let (entry, pk) = signed_entry(9);
        let json = serde_json::to_vec(&entry).unwrap();
        let back: SignedRegistryValue = serde_json::from_slice(&json).unwrap();
        assert_eq!(back, entry);
        assert!(back.verify(&pk).is_ok());
    }
}
