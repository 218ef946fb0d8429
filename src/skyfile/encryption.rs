//! Skyfile encryption: skykeys, subkey derivation, and the XChaCha20 pass
//! over base sectors and fanout pieces.

use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::XChaCha20;
use rand::RngCore;

use crate::crypto::{blake2b256_all, Hash};
use crate::error::SkyfileError;

/// Length of a skykey identifier stored in the layout.
pub const SKYKEY_ID_LEN: usize = 16;
/// XChaCha20 nonce length, stored in plaintext next to the identifier.
pub const NONCE_LEN: usize = 24;

/// Cipher tags stored in the layout.
pub const CIPHER_PLAIN: [u8; 8] = *b"plain\0\0\0";
pub const CIPHER_XCHACHA20: [u8; 8] = *b"xchacha2";

/// How receivers identify the key that encrypted a file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkykeyMode {
    /// The 16-byte key id sits in plaintext in the layout.
    PublicId,
    /// The layout carries an identifier derived from the key and the nonce;
    /// receivers try all known keys until one matches.
    PrivateId,
}

/// A named encryption key for content-addressed blobs.
#[derive(Clone)]
pub struct Skykey {
    pub name: String,
    pub mode: SkykeyMode,
    entropy: [u8; 32],
}

impl Skykey {
    #[must_use]
    pub fn generate(name: String, mode: SkykeyMode) -> Self {
        let mut entropy = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut entropy);
        Self {
            name,
            mode,
            entropy,
        }
    }

    #[must_use]
    pub fn from_entropy(name: String, mode: SkykeyMode, entropy: [u8; 32]) -> Self {
        Self {
            name,
            mode,
            entropy,
        }
    }

    /// Stable public identifier of the key itself.
    #[must_use]
    pub fn id(&self) -> [u8; SKYKEY_ID_LEN] {
        let hash = blake2b256_all(&[&self.entropy, b"key-id"]);
        hash[..SKYKEY_ID_LEN].try_into().expect("hash longer than id")
    }

    /// Derive a subkey bound to a usage label.
    #[must_use]
    pub fn derive_subkey(&self, label: &[u8]) -> [u8; 32] {
        blake2b256_all(&[&self.entropy, label])
    }

    /// Key for the base sector pass.
    #[must_use]
    pub fn base_sector_key(&self) -> [u8; 32] {
        self.derive_subkey(b"base-sector-nonce")
    }

    /// Key for fanout pieces.
    #[must_use]
    pub fn fanout_key(&self) -> [u8; 32] {
        self.derive_subkey(b"fanout-nonce")
    }

    /// Per-file identifier for private-id keys: derived from the key and the
    /// file nonce, so only key holders can recognize their files.
    #[must_use]
    pub fn encryption_identifier(&self, nonce: &[u8; NONCE_LEN]) -> [u8; SKYKEY_ID_LEN] {
        let hash = blake2b256_all(&[&self.entropy, b"encryption-id", nonce]);
        hash[..SKYKEY_ID_LEN].try_into().expect("hash longer than id")
    }

    /// The identifier this key writes into a layout for the given nonce.
    #[must_use]
    pub fn identifier_for(&self, nonce: &[u8; NONCE_LEN]) -> [u8; SKYKEY_ID_LEN] {
        match self.mode {
            SkykeyMode::PublicId => self.id(),
            SkykeyMode::PrivateId => self.encryption_identifier(nonce),
        }
    }

    /// Whether this key matches the identifier stored in a layout.
    #[must_use]
    pub fn matches(&self, identifier: &[u8; SKYKEY_ID_LEN], nonce: &[u8; NONCE_LEN]) -> bool {
        self.identifier_for(nonce) == *identifier
    }
}

/// Pick the key that can decrypt a layout with the given identifier+nonce.
pub fn match_skykey<'a>(
    keys: &'a [Skykey],
    identifier: &[u8; SKYKEY_ID_LEN],
    nonce: &[u8; NONCE_LEN],
) -> Result<&'a Skykey, SkyfileError> {
    keys.iter()
        .find(|k| k.matches(identifier, nonce))
        .ok_or(SkyfileError::EncryptionNotSupported)
}

/// Apply the XChaCha20 keystream in place. Encryption and decryption are the
/// same operation.
pub fn xchacha20_apply(key: &[u8; 32], nonce: &[u8; NONCE_LEN], data: &mut [u8]) {
    let mut cipher = XChaCha20::new(key.into(), nonce.into());
    cipher.apply_keystream(data);
}

/// Nonce for one fanout piece, bound to its chunk and piece index.
#[must_use]
pub fn fanout_piece_nonce(file_nonce: &[u8; NONCE_LEN], chunk: u64, piece: u64) -> [u8; NONCE_LEN] {
    let hash: Hash = blake2b256_all(&[
        file_nonce,
        &chunk.to_le_bytes(),
        &piece.to_le_bytes(),
    ]);
    hash[..NONCE_LEN].try_into().expect("hash longer than nonce")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subkeys_differ_by_label() {
        let key = Skykey::generate("test".into(), SkykeyMode::PublicId);
        assert_ne!(key.base_sector_key(), key.fanout_key());
    }

    #[test]
    fn apply_is_an_involution() {
        let key = Skykey::generate("test".into(), SkykeyMode::PublicId);
        let nonce = [7u8; NONCE_LEN];
        let mut data = b"secret payload".to_vec();
        let original = data.clone();
        xchacha20_apply(&key.base_sector_key(), &nonce, &mut data);
        assert_ne!(data, original);
        xchacha20_apply(&key.base_sector_key(), &nonce, &mut data);
        assert_eq!(data, original);
    }

    #[test]
    fn public_id_matches_by_key_id() {
        let key = Skykey::generate("pub".into(), SkykeyMode::PublicId);
        let nonce = [1u8; NONCE_LEN];
        assert!(key.matches(&key.id(), &nonce));
        let other = Skykey::generate("other".into(), SkykeyMode::PublicId);
        assert!(!other.matches(&key.id(), &nonce));
    }

    #[test]
    fn private_id_hides_the_key() {
        let key = Skykey::generate("priv".into(), SkykeyMode::PrivateId);
        let nonce = [2u8; NONCE_LEN];
        let identifier = key.identifier_for(&nonce);
        assert_ne!(identifier, key.id(), "private id must not expose the key id");
        // A different nonce produces a different identifier.
        assert_ne!(identifier, key.identifier_for(&[3u8; NONCE_LEN]));
        assert!(key.matches(&identifier, &nonce));
    }

    #[test]
    fn match_skykey_tries_all_keys() {
        let keys = vec![
            Skykey::generate("a".into(), SkykeyMode::PublicId),
            Skykey::generate("b".into(), SkykeyMode::PrivateId),
        ];
        let nonce = [9u8; NONCE_LEN];
        let identifier = keys[1].identifier_for(&nonce);
        let found = match_skykey(&keys, &identifier, &nonce).unwrap();
        assert_eq!(found.name, "b");
        assert!(matches!(
            match_skykey(&keys, &[0u8; SKYKEY_ID_LEN], &nonce),
            Err(SkyfileError::EncryptionNotSupported)
        ));
    }

    #[test]
    fn fanout_nonces_are_position_bound() {
        let nonce = [4u8; NONCE_LEN];
        assert_ne!(
            fanout_piece_nonce(&nonce, 0, 0),
            fanout_piece_nonce(&nonce, 0, 1)
        );
        assert_ne!(
            fanout_piece_nonce(&nonce, 0, 0),
            fanout_piece_nonce(&nonce, 1, 0)
        );
    }
}
