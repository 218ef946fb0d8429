//! Skylinks: 34-byte content-addressed identifiers.
//!
//! Layout: 32 bytes of Merkle root, then a 16-bit little-endian bitfield
//! packing the version and a shared exponent/mantissa encoding of the fetch
//! offset and length. Serialized as 46 characters of URL-safe base64.

use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::config::SECTOR_SIZE;
use crate::crypto::Hash;
use crate::error::SkyfileError;

/// Raw size of an encoded skylink.
pub const SKYLINK_SIZE: usize = 34;
/// Length of the base64 string form.
pub const SKYLINK_STR_LEN: usize = 46;

/// Base unit of the offset/length encoding at mode 0.
const BASE_UNIT: u32 = 4096;
/// Bitfield layout: version(2) | mode(3) | offset(7) | length(4).
const MODE_SHIFT: u16 = 2;
const OFFSET_SHIFT: u16 = 5;
const LENGTH_SHIFT: u16 = 12;
const MAX_MODE: u32 = 7;
const MAX_OFFSET_CODE: u32 = 0x7F;
const MAX_LENGTH_UNITS: u32 = 16;

/// A skylink: Merkle root plus packed version, offset, and fetch size.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Skylink {
    root: Hash,
    bitfield: u16,
}

impl Skylink {
    /// Pack a skylink for the given byte range of the base sector. The
    /// smallest mode that can represent the range wins, so identical inputs
    /// always produce identical links.
    pub fn new(root: Hash, offset: u32, fetch_size: u32) -> Result<Self, SkyfileError> {
        if fetch_size == 0 || offset.saturating_add(fetch_size) > SECTOR_SIZE as u32 {
            return Err(SkyfileError::MalformedSkylink(format!(
                "range {offset}+{fetch_size} outside a sector"
            )));
        }
        for mode in 0..=MAX_MODE {
            let unit = BASE_UNIT << mode;
            if offset % unit != 0 {
                continue;
            }
            let offset_code = offset / unit;
            if offset_code > MAX_OFFSET_CODE {
                continue;
            }
            let length_units = fetch_size.div_ceil(unit);
            if length_units > MAX_LENGTH_UNITS {
                continue;
            }
            let bitfield = ((mode as u16) << MODE_SHIFT)
                | ((offset_code as u16) << OFFSET_SHIFT)
                | (((length_units - 1) as u16) << LENGTH_SHIFT);
            return Ok(Self { root, bitfield });
        }
        Err(SkyfileError::MalformedSkylink(format!(
            "range {offset}+{fetch_size} not encodable"
        )))
    }

    #[must_use]
    pub fn root(&self) -> Hash {
        self.root
    }

    /// Format version, 1-based.
    #[must_use]
    pub fn version(&self) -> u8 {
        (self.bitfield & 0b11) as u8 + 1
    }

    fn unit(&self) -> u32 {
        BASE_UNIT << ((self.bitfield >> MODE_SHIFT) & 0b111)
    }

    #[must_use]
    pub fn offset(&self) -> u32 {
        let code = u32::from((self.bitfield >> OFFSET_SHIFT) & 0x7F);
        code * self.unit()
    }

    /// Bytes to fetch from the base sector, rounded up to the mode's unit.
    #[must_use]
    pub fn fetch_size(&self) -> u32 {
        let code = u32::from((self.bitfield >> LENGTH_SHIFT) & 0xF);
        (code + 1) * self.unit()
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; SKYLINK_SIZE] {
        let mut out = [0u8; SKYLINK_SIZE];
        out[..32].copy_from_slice(&self.root);
        out[32..].copy_from_slice(&self.bitfield.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SkyfileError> {
        if bytes.len() != SKYLINK_SIZE {
            return Err(SkyfileError::MalformedSkylink(format!(
                "{} bytes, want {SKYLINK_SIZE}",
                bytes.len()
            )));
        }
        let root: Hash = bytes[..32].try_into().expect("length checked");
        let bitfield = u16::from_le_bytes(bytes[32..].try_into().expect("length checked"));
        let link = Self { root, bitfield };
        if link.version() != 1 {
            return Err(SkyfileError::MalformedSkylink(format!(
                "unsupported version {}",
                link.version()
            )));
        }
        if link.offset().saturating_add(link.fetch_size()) > SECTOR_SIZE as u32 {
            return Err(SkyfileError::MalformedSkylink(
                "range outside a sector".into(),
            ));
        }
        Ok(link)
    }
}

impl fmt::Display for Skylink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&URL_SAFE_NO_PAD.encode(self.to_bytes()))
    }
}

impl fmt::Debug for Skylink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Skylink({self})")
    }
}

impl FromStr for Skylink {
    type Err = SkyfileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != SKYLINK_STR_LEN {
            return Err(SkyfileError::MalformedSkylink(format!(
                "{} chars, want {SKYLINK_STR_LEN}",
                s.len()
            )));
        }
        let bytes = URL_SAFE_NO_PAD
            .decode(s)
            .map_err(|e| SkyfileError::MalformedSkylink(e.to_string()))?;
        Self::from_bytes(&bytes)
    }
}

impl Serialize for Skylink {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Skylink {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root() -> Hash {
        crate::crypto::blake2b256(b"some sector")
    }

    #[test]
    fn roundtrip_through_bytes_and_string() {
        let link = Skylink::new(root(), 0, 12_345).unwrap();
        let bytes = link.to_bytes();
        let back = Skylink::from_bytes(&bytes).unwrap();
        assert_eq!(back, link);

        let s = link.to_string();
        assert_eq!(s.len(), SKYLINK_STR_LEN);
        let parsed: Skylink = s.parse().unwrap();
        assert_eq!(parsed, link);
    }

    #[test]
    fn fetch_size_covers_request() {
        for size in [1u32, 4096, 4097, 65_536, 1 << 20, SECTOR_SIZE as u32] {
            let link = Skylink::new(root(), 0, size).unwrap();
            assert!(link.fetch_size() >= size, "size {size}");
            assert_eq!(link.offset(), 0);
            assert_eq!(link.version(), 1);
        }
    }

    #[test]
    fn encoding_is_deterministic() {
        let a = Skylink::new(root(), 0, 99_999).unwrap();
        let b = Skylink::new(root(), 0, 99_999).unwrap();
        assert_eq!(a.to_bytes(), b.to_bytes());
    }

    #[test]
    fn aligned_offsets_encode() {
        let link = Skylink::new(root(), 8192, 4096).unwrap();
        assert_eq!(link.offset(), 8192);
        assert!(link.fetch_size() >= 4096);
    }

    #[test]
    fn invalid_ranges_rejected() {
        assert!(Skylink::new(root(), 0, 0).is_err());
        assert!(Skylink::new(root(), 0, SECTOR_SIZE as u32 + 1).is_err());
        assert!(Skylink::new(root(), SECTOR_SIZE as u32, 4096).is_err());
    }

    #[test]
    fn malformed_strings_rejected() {
        assert!("short".parse::<Skylink>().is_err());
        let mut bytes = Skylink::new(root(), 0, 100).unwrap().to_bytes();
        // Force version 3.
        bytes[32] |= 0b10;
        assert!(Skylink::from_bytes(&bytes).is_err());
    }
}
