//! Crypto utilities: BLAKE2b-256 hashing, sector Merkle roots, ed25519 keys.

use blake2::digest::{Update, VariableOutput};
use blake2::Blake2bVar;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};

use crate::config::{HASH_SIZE, SEGMENT_SIZE};

/// A 32-byte BLAKE2b-256 digest.
pub type Hash = [u8; HASH_SIZE];

/// BLAKE2b-256 hash (32-byte output).
#[must_use]
pub fn blake2b256(data: &[u8]) -> Hash {
    let mut hasher = Blake2bVar::new(HASH_SIZE).expect("BLAKE2b-256 output size 32 is valid");
    hasher.update(data);
    let mut out = [0u8; HASH_SIZE];
    hasher
        .finalize_variable(&mut out)
        .expect("32-byte output");
    out
}

/// BLAKE2b-256 over the concatenation of several byte slices.
#[must_use]
pub fn blake2b256_all(parts: &[&[u8]]) -> Hash {
    let mut hasher = Blake2bVar::new(HASH_SIZE).expect("BLAKE2b-256 output size 32 is valid");
    for p in parts {
        hasher.update(p);
    }
    let mut out = [0u8; HASH_SIZE];
    hasher
        .finalize_variable(&mut out)
        .expect("32-byte output");
    out
}

/// Incremental BLAKE2b-256 hasher for streaming writers.
pub struct StreamingHasher {
    inner: Blake2bVar,
}

impl StreamingHasher {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Blake2bVar::new(HASH_SIZE).expect("BLAKE2b-256 output size 32 is valid"),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    #[must_use]
    pub fn finalize(self) -> Hash {
        let mut out = [0u8; HASH_SIZE];
        self.inner
            .finalize_variable(&mut out)
            .expect("32-byte output");
        out
    }
}

impl Default for StreamingHasher {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Merkle trees over sector segments
// ============================================================================

const LEAF_PREFIX: u8 = 0x00;
const NODE_PREFIX: u8 = 0x01;

fn leaf_hash(segment: &[u8]) -> Hash {
    blake2b256_all(&[&[LEAF_PREFIX], segment])
}

fn node_hash(left: &Hash, right: &Hash) -> Hash {
    blake2b256_all(&[&[NODE_PREFIX], left, right])
}

/// Merkle root of the given data, split into 64-byte segments. The final
/// segment is zero-padded. Empty data hashes as a single zero segment so a
/// root always exists.
#[must_use]
pub fn sector_root(data: &[u8]) -> Hash {
    let mut leaves: Vec<Hash> = Vec::with_capacity(data.len() / SEGMENT_SIZE + 1);
    if data.is_empty() {
        leaves.push(leaf_hash(&[0u8; SEGMENT_SIZE]));
    }
    for chunk in data.chunks(SEGMENT_SIZE) {
        if chunk.len() == SEGMENT_SIZE {
            leaves.push(leaf_hash(chunk));
        } else {
            let mut padded = [0u8; SEGMENT_SIZE];
            padded[..chunk.len()].copy_from_slice(chunk);
            leaves.push(leaf_hash(&padded));
        }
    }
    merkle_root_from_leaves(leaves)
}

/// Collapse a leaf layer into a root. Odd nodes are promoted unchanged.
fn merkle_root_from_leaves(mut layer: Vec<Hash>) -> Hash {
    while layer.len() > 1 {
        let mut next = Vec::with_capacity((layer.len() + 1) / 2);
        for pair in layer.chunks(2) {
            if pair.len() == 2 {
                next.push(node_hash(&pair[0], &pair[1]));
            } else {
                next.push(pair[0]);
            }
        }
        layer = next;
    }
    layer[0]
}

/// Serde adapter for 64-byte signatures, encoded as hex strings.
pub mod sig_serde {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(sig: &[u8; 64], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(sig))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 64], D::Error> {
        let s = String::deserialize(d)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("signature must be 64 bytes"))
    }
}

// ============================================================================
// ed25519 helpers
// ============================================================================

/// Generate a fresh ed25519 keypair from the OS RNG.
#[must_use]
pub fn generate_keypair() -> (SigningKey, VerifyingKey) {
    let mut csprng = rand::rngs::OsRng;
    let sk = SigningKey::generate(&mut csprng);
    let vk = sk.verifying_key();
    (sk, vk)
}

/// Sign a message hash, returning the raw 64-byte signature.
#[must_use]
pub fn sign_hash(sk: &SigningKey, hash: &Hash) -> [u8; 64] {
    sk.sign(hash).to_bytes()
}

/// Verify a raw 64-byte signature over a message hash.
#[must_use]
pub fn verify_hash(pk: &VerifyingKey, hash: &Hash, signature: &[u8; 64]) -> bool {
    let sig = Signature::from_bytes(signature);
    pk.verify(hash, &sig).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blake2b256_empty_matches_known() {
        // Known BLAKE2b-256 of empty input.
        let expected: [u8; 32] = [
            0x0e, 0x57, 0x51, 0xc0, 0x26, 0xe5, 0x43, 0xb2, 0xe8, 0xab, 0x2e, 0xb0, 0x60, 0x99,
            0xda, 0xa1, 0xd1, 0xe5, 0xdf, 0x47, 0x77, 0x8f, 0x77, 0x87, 0xfa, 0xab, 0x45, 0xcd,
            0xf1, 0x2f, 0xe3, 0xa8,
        ];
        assert_eq!(blake2b256(&[]), expected, "BLAKE2b-256(empty)");
    }

    #[test]
    fn blake2b256_all_matches_concat() {
        let a = b"hello ";
        let b = b"world";
        let mut joined = Vec::new();
        joined.extend_from_slice(a);
        joined.extend_from_slice(b);
        assert_eq!(blake2b256_all(&[a, b]), blake2b256(&joined));
    }

    #[test]
    fn streaming_hasher_matches_oneshot() {
        let data = vec![7u8; 1000];
        let mut h = StreamingHasher::new();
        h.update(&data[..400]);
        h.update(&data[400..]);
        assert_eq!(h.finalize(), blake2b256(&data));
    }

    #[test]
    fn single_segment_root_is_leaf_hash() {
        let seg = [3u8; SEGMENT_SIZE];
        assert_eq!(sector_root(&seg), leaf_hash(&seg));
    }

    #[test]
    fn short_data_is_padded() {
        let mut padded = [0u8; SEGMENT_SIZE];
        padded[0] = 9;
        assert_eq!(sector_root(&[9u8]), sector_root(&padded));
    }

    #[test]
    fn root_is_deterministic_and_order_sensitive() {
        let mut data = vec![0u8; SEGMENT_SIZE * 4];
        data[0] = 1;
        let r1 = sector_root(&data);
        let r2 = sector_root(&data);
        assert_eq!(r1, r2);
        data[SEGMENT_SIZE] = 1;
        assert_ne!(sector_root(&data), r1);
    }

    #[test]
    fn sign_verify_roundtrip() {
        let (sk, vk) = generate_keypair();
        let h = blake2b256(b"message");
        let sig = sign_hash(&sk, &h);
        assert!(verify_hash(&vk, &h, &sig));
        let other = blake2b256(b"other");
        assert!(!verify_hash(&vk, &other, &sig));
    }
}
