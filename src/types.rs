//! Core renter types: specifiers, host keys, logical paths, contracts.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::PathError;

/// Currency amount in hastings.
pub type Currency = u128;

/// Serde adapter encoding currency amounts as decimal strings. Hastings
/// amounts routinely exceed the u64 range JSON numbers survive.
pub mod currency_serde {
    use serde::{Deserialize, Deserializer, Serializer};

    use super::Currency;

    pub fn serialize<S: Serializer>(v: &Currency, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&v.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Currency, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Contract identifier.
pub type ContractId = [u8; 32];

// ============================================================================
// Specifier
// ============================================================================

/// A 16-byte, zero-padded ASCII tag identifying algorithms and RPCs.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Specifier(pub [u8; 16]);

impl Specifier {
    /// Build a specifier from a short ASCII name. Names longer than 16 bytes
    /// are a programmer error.
    #[must_use]
    pub const fn new(name: &str) -> Self {
        let bytes = name.as_bytes();
        assert!(bytes.len() <= 16, "specifier name too long");
        let mut out = [0u8; 16];
        let mut i = 0;
        while i < bytes.len() {
            out[i] = bytes[i];
            i += 1;
        }
        Specifier(out)
    }

    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Debug for Specifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let end = self.0.iter().position(|&b| b == 0).unwrap_or(16);
        match std::str::from_utf8(&self.0[..end]) {
            Ok(s) => write!(f, "Specifier({s})"),
            Err(_) => write!(f, "Specifier({})", hex::encode(self.0)),
        }
    }
}

/// Signature algorithm tag for ed25519 keys.
pub const ALGORITHM_ED25519: Specifier = Specifier::new("ed25519");

/// RPC specifier: fetch a fresh price table.
pub const RPC_UPDATE_PRICE_TABLE: Specifier = Specifier::new("UpdatePriceTable");
/// RPC specifier: read a registry entry.
pub const RPC_READ_REGISTRY: Specifier = Specifier::new("ReadRegistry");
/// RPC specifier: write a registry entry.
pub const RPC_UPDATE_REGISTRY: Specifier = Specifier::new("UpdateRegistry");
/// RPC specifier: fund an ephemeral account.
pub const RPC_FUND_ACCOUNT: Specifier = Specifier::new("FundAccount");
/// RPC specifier: query an ephemeral account balance.
pub const RPC_ACCOUNT_BALANCE: Specifier = Specifier::new("AccountBalance");
/// RPC specifier: probe whether a host stores a sector.
pub const RPC_HAS_SECTOR: Specifier = Specifier::new("HasSector");
/// RPC specifier: read a byte range of a sector by Merkle root.
pub const RPC_READ_SECTOR: Specifier = Specifier::new("ReadSector");

// ============================================================================
// Public keys
// ============================================================================

/// An algorithm-tagged public key. Equal iff both fields match. Used as the
/// stable identifier for contracts, workers, accounts, and cache entries.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PublicKey {
    pub algorithm: Specifier,
    pub key: [u8; 32],
}

impl PublicKey {
    #[must_use]
    pub const fn ed25519(key: [u8; 32]) -> Self {
        Self {
            algorithm: ALGORITHM_ED25519,
            key,
        }
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}:{}", self.algorithm, &hex::encode(self.key)[..8])
    }
}

/// Host identity key.
pub type HostKey = PublicKey;

// ============================================================================
// Contracts and allowance
// ============================================================================

/// Usability flags attached to a contract by the contract layer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractUtility {
    pub good_for_upload: bool,
    pub good_for_renew: bool,
}

/// The slice of a contract visible to the core.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Contract {
    pub id: ContractId,
    pub host_key: HostKey,
    pub end_height: u64,
    pub utility: ContractUtility,
    pub host_version: String,
}

/// Funding and duration parameters bounding renter spending.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allowance {
    #[serde(with = "currency_serde")]
    pub funds: Currency,
    pub period: u64,
    pub hosts: u64,
    pub expected_storage: u64,
    pub expected_download: u64,
    pub expected_upload: u64,
}

impl Default for Allowance {
    fn default() -> Self {
        Self {
            funds: crate::config::DEFAULT_ALLOWANCE_FUNDS,
            period: crate::config::DEFAULT_ALLOWANCE_PERIOD,
            hosts: 50,
            expected_storage: 1 << 40,
            expected_download: 1 << 37,
            expected_upload: 1 << 35,
        }
    }
}

impl Allowance {
    /// An allowance with zero funds blocks all paid work.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.funds == 0
    }
}

// ============================================================================
// Logical paths
// ============================================================================

/// A `/`-separated logical path rooted at the renter file system root.
/// Never contains `..`, `.`, empty segments, or a leading/trailing slash.
/// Comparison is case-sensitive and byte-exact. The root is the empty path.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RenterPath {
    path: String,
}

impl RenterPath {
    /// The file system root.
    #[must_use]
    pub fn root() -> Self {
        Self {
            path: String::new(),
        }
    }

    /// Validate and build a path from its string form.
    pub fn new(s: &str) -> Result<Self, PathError> {
        if s.is_empty() {
            return Ok(Self::root());
        }
        if s.starts_with('/') || s.ends_with('/') {
            return Err(PathError::Malformed(s.to_string()));
        }
        for seg in s.split('/') {
            if seg.is_empty() || seg == "." || seg == ".." {
                return Err(PathError::Malformed(s.to_string()));
            }
            if seg.contains('\\') || seg.contains('\0') || seg.contains(':') {
                return Err(PathError::Malformed(s.to_string()));
            }
        }
        Ok(Self {
            path: s.to_string(),
        })
    }

    /// Append a single segment.
    pub fn join(&self, segment: &str) -> Result<Self, PathError> {
        if segment.is_empty() || segment.contains('/') {
            return Err(PathError::Malformed(segment.to_string()));
        }
        let joined = if self.path.is_empty() {
            segment.to_string()
        } else {
            format!("{}/{}", self.path, segment)
        };
        Self::new(&joined)
    }

    /// Parent directory, or None at the root.
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            return None;
        }
        match self.path.rfind('/') {
            Some(idx) => Some(Self {
                path: self.path[..idx].to_string(),
            }),
            None => Some(Self::root()),
        }
    }

    /// Final segment, or "" at the root.
    #[must_use]
    pub fn name(&self) -> &str {
        match self.path.rfind('/') {
            Some(idx) => &self.path[idx + 1..],
            None => &self.path,
        }
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.path.is_empty()
    }

    /// True if `self` is an ancestor of `other` (a strict prefix by segments).
    #[must_use]
    pub fn is_ancestor_of(&self, other: &Self) -> bool {
        if self.is_root() {
            return !other.is_root();
        }
        other.path.len() > self.path.len()
            && other.path.starts_with(&self.path)
            && other.path.as_bytes()[self.path.len()] == b'/'
    }

    /// True if the path equals or sits beneath `ancestor`.
    #[must_use]
    pub fn is_within(&self, ancestor: &Self) -> bool {
        self == ancestor || ancestor.is_ancestor_of(self)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.path
    }

    // Distinguished sub-roots.

    /// `/home` — parent of all user-visible trees.
    #[must_use]
    pub fn home_dir() -> Self {
        Self {
            path: "home".to_string(),
        }
    }

    /// `/home/user` — user files.
    #[must_use]
    pub fn user_dir() -> Self {
        Self {
            path: "home/user".to_string(),
        }
    }

    /// `/home/user/snapshots` — backup archives.
    #[must_use]
    pub fn snapshots_dir() -> Self {
        Self {
            path: "home/user/snapshots".to_string(),
        }
    }

    /// `/var` — internal files.
    #[must_use]
    pub fn var_dir() -> Self {
        Self {
            path: "var".to_string(),
        }
    }

    /// `/var/skynet` — content-addressed blob uploads.
    #[must_use]
    pub fn skynet_dir() -> Self {
        Self {
            path: "var/skynet".to_string(),
        }
    }
}

impl fmt::Debug for RenterPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.path)
    }
}

impl fmt::Display for RenterPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.path)
    }
}
