//! Content-addressed blobs ("skyfiles"): base-sector assembly, conversion
//! of erasure-coded files into linked blobs, and the download streamer.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::SECTOR_SIZE;
use crate::crypto::{blake2b256, sector_root, Hash};
use crate::error::SkyfileError;
use crate::fs::{ErasureCoderKind, ErasureSpec, FileStore};
use crate::types::RenterPath;

pub mod encryption;
pub mod fanout;
pub mod skylink;

use encryption::{
    fanout_piece_nonce, match_skykey, xchacha20_apply, Skykey, CIPHER_PLAIN, CIPHER_XCHACHA20,
    NONCE_LEN, SKYKEY_ID_LEN,
};
pub use fanout::{download_skyfile, FanoutStreamer, SectorFetcher, SkyfileStreamer};
pub use skylink::Skylink;

/// Fixed size of the layout header at the front of every base sector.
pub const LAYOUT_SIZE: usize = 99;

/// Current base sector format version.
pub const LAYOUT_VERSION: u8 = 1;

// Layout byte offsets.
const OFF_VERSION: usize = 0;
const OFF_FILESIZE: usize = 1;
const OFF_METADATA_SIZE: usize = 9;
const OFF_FANOUT_SIZE: usize = 17;
const OFF_FANOUT_DATA: usize = 25;
const OFF_FANOUT_PARITY: usize = 26;
const OFF_CIPHER: usize = 27;
const OFF_KEY_DATA: usize = 35;

// ============================================================================
// Layout
// ============================================================================

/// The fixed-width header of a base sector.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SkyfileLayout {
    pub version: u8,
    pub filesize: u64,
    pub metadata_size: u64,
    pub fanout_size: u64,
    pub fanout_data_pieces: u8,
    pub fanout_parity_pieces: u8,
    pub cipher_type: [u8; 8],
    pub key_data: [u8; 64],
}

impl SkyfileLayout {
    #[must_use]
    pub fn plain(filesize: u64, metadata_size: u64) -> Self {
        Self {
            version: LAYOUT_VERSION,
            filesize,
            metadata_size,
            fanout_size: 0,
            fanout_data_pieces: 0,
            fanout_parity_pieces: 0,
            cipher_type: CIPHER_PLAIN,
            key_data: [0u8; 64],
        }
    }

    #[must_use]
    pub fn encode(&self) -> [u8; LAYOUT_SIZE] {
        let mut out = [0u8; LAYOUT_SIZE];
        out[OFF_VERSION] = self.version;
        out[OFF_FILESIZE..OFF_METADATA_SIZE].copy_from_slice(&self.filesize.to_le_bytes());
        out[OFF_METADATA_SIZE..OFF_FANOUT_SIZE].copy_from_slice(&self.metadata_size.to_le_bytes());
        out[OFF_FANOUT_SIZE..OFF_FANOUT_DATA].copy_from_slice(&self.fanout_size.to_le_bytes());
        out[OFF_FANOUT_DATA] = self.fanout_data_pieces;
        out[OFF_FANOUT_PARITY] = self.fanout_parity_pieces;
        out[OFF_CIPHER..OFF_KEY_DATA].copy_from_slice(&self.cipher_type);
        out[OFF_KEY_DATA..LAYOUT_SIZE].copy_from_slice(&self.key_data);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, SkyfileError> {
        if bytes.len() < LAYOUT_SIZE {
            return Err(SkyfileError::MalformedBaseSector(format!(
                "{} bytes, layout needs {LAYOUT_SIZE}",
                bytes.len()
            )));
        }
        let take_u64 = |at: usize| {
            u64::from_le_bytes(bytes[at..at + 8].try_into().expect("length checked"))
        };
        Ok(Self {
            version: bytes[OFF_VERSION],
            filesize: take_u64(OFF_FILESIZE),
            metadata_size: take_u64(OFF_METADATA_SIZE),
            fanout_size: take_u64(OFF_FANOUT_SIZE),
            fanout_data_pieces: bytes[OFF_FANOUT_DATA],
            fanout_parity_pieces: bytes[OFF_FANOUT_PARITY],
            cipher_type: bytes[OFF_CIPHER..OFF_KEY_DATA]
                .try_into()
                .expect("length checked"),
            key_data: bytes[OFF_KEY_DATA..LAYOUT_SIZE]
                .try_into()
                .expect("length checked"),
        })
    }
}

/// User-facing metadata stored alongside the payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkyfileMetadata {
    pub filename: String,
    pub length: u64,
}

// ============================================================================
// Base sector assembly and parsing
// ============================================================================

fn build_base_sector(
    layout: &SkyfileLayout,
    fanout: &[u8],
    metadata: &[u8],
    payload: &[u8],
) -> Result<Vec<u8>, SkyfileError> {
    let total = LAYOUT_SIZE + fanout.len() + metadata.len() + payload.len();
    if total > SECTOR_SIZE {
        return Err(SkyfileError::MetadataTooBig);
    }
    let mut sector = Vec::with_capacity(total);
    sector.extend_from_slice(&layout.encode());
    sector.extend_from_slice(fanout);
    sector.extend_from_slice(metadata);
    sector.extend_from_slice(payload);
    Ok(sector)
}

/// Split a (plaintext) base sector into its parts.
pub fn parse_base_sector(
    sector: &[u8],
) -> Result<(SkyfileLayout, Vec<u8>, SkyfileMetadata, Vec<u8>), SkyfileError> {
    let layout = SkyfileLayout::decode(sector)?;
    let fanout_end = LAYOUT_SIZE
        .checked_add(layout.fanout_size as usize)
        .ok_or_else(|| SkyfileError::MalformedBaseSector("fanout size overflow".into()))?;
    let metadata_end = fanout_end
        .checked_add(layout.metadata_size as usize)
        .ok_or_else(|| SkyfileError::MalformedBaseSector("metadata size overflow".into()))?;
    if metadata_end > sector.len() {
        return Err(SkyfileError::MalformedBaseSector(format!(
            "sections end at {metadata_end}, sector is {}",
            sector.len()
        )));
    }
    let fanout = sector[LAYOUT_SIZE..fanout_end].to_vec();
    let metadata: SkyfileMetadata = serde_json::from_slice(&sector[fanout_end..metadata_end])
        .map_err(|e| SkyfileError::MalformedBaseSector(e.to_string()))?;
    let payload = if layout.fanout_size == 0 {
        let payload_end = metadata_end
            .checked_add(layout.filesize as usize)
            .filter(|end| *end <= sector.len())
            .ok_or_else(|| SkyfileError::MalformedBaseSector("payload out of bounds".into()))?;
        sector[metadata_end..payload_end].to_vec()
    } else {
        Vec::new()
    };
    Ok((layout, fanout, metadata, payload))
}

// ============================================================================
// Base sector encryption
// ============================================================================

/// Keystream coverage: the numeric layout fields, then everything after the
/// layout. Version, cipher type, and key data stay plaintext so receivers
/// can identify the key.
fn apply_base_sector_cipher(sector: &mut [u8], key: &[u8; 32], nonce: &[u8; NONCE_LEN]) {
    use chacha20::cipher::{KeyIvInit, StreamCipher};
    let mut cipher = chacha20::XChaCha20::new(key.into(), nonce.into());
    cipher.apply_keystream(&mut sector[OFF_FILESIZE..OFF_CIPHER]);
    cipher.apply_keystream(&mut sector[LAYOUT_SIZE..]);
}

/// Encrypt a base sector in place with a fresh nonce.
pub fn encrypt_base_sector(sector: &mut [u8], skykey: &Skykey) -> Result<(), SkyfileError> {
    if sector.len() < LAYOUT_SIZE {
        return Err(SkyfileError::MalformedBaseSector("sector too short".into()));
    }
    let mut nonce = [0u8; NONCE_LEN];
    rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut nonce);
    apply_base_sector_cipher(sector, &skykey.base_sector_key(), &nonce);

    let identifier = skykey.identifier_for(&nonce);
    sector[OFF_CIPHER..OFF_KEY_DATA].copy_from_slice(&CIPHER_XCHACHA20);
    sector[OFF_KEY_DATA..OFF_KEY_DATA + SKYKEY_ID_LEN].copy_from_slice(&identifier);
    sector[OFF_KEY_DATA + SKYKEY_ID_LEN..OFF_KEY_DATA + SKYKEY_ID_LEN + NONCE_LEN]
        .copy_from_slice(&nonce);
    Ok(())
}

/// Decrypt a base sector in place, resolving the key from the known set.
/// Returns the matched key for the fanout pass, or `None` for plaintext.
pub fn decrypt_base_sector<'a>(
    sector: &mut [u8],
    keys: &'a [Skykey],
) -> Result<Option<&'a Skykey>, SkyfileError> {
    if sector.len() < LAYOUT_SIZE {
        return Err(SkyfileError::MalformedBaseSector("sector too short".into()));
    }
    let cipher_type: [u8; 8] = sector[OFF_CIPHER..OFF_KEY_DATA]
        .try_into()
        .expect("length checked");
    if cipher_type == CIPHER_PLAIN {
        return Ok(None);
    }
    if cipher_type != CIPHER_XCHACHA20 {
        return Err(SkyfileError::MalformedBaseSector(format!(
            "unknown cipher {cipher_type:?}"
        )));
    }
    let identifier: [u8; SKYKEY_ID_LEN] = sector
        [OFF_KEY_DATA..OFF_KEY_DATA + SKYKEY_ID_LEN]
        .try_into()
        .expect("length checked");
    let nonce: [u8; NONCE_LEN] = sector
        [OFF_KEY_DATA + SKYKEY_ID_LEN..OFF_KEY_DATA + SKYKEY_ID_LEN + NONCE_LEN]
        .try_into()
        .expect("length checked");
    let key = match_skykey(keys, &identifier, &nonce)?;
    apply_base_sector_cipher(sector, &key.base_sector_key(), &nonce);
    Ok(Some(key))
}

// ============================================================================
// Blocklist
// ============================================================================

/// Blocked skylinks, stored as hashes of their Merkle roots.
pub struct Blocklist {
    hashes: Mutex<HashSet<Hash>>,
}

impl Blocklist {
    #[must_use]
    pub fn new() -> Self {
        Self {
            hashes: Mutex::new(HashSet::new()),
        }
    }

    pub fn block(&self, link: &Skylink) {
        self.hashes.lock().insert(blake2b256(&link.root()));
    }

    #[must_use]
    pub fn is_blocked(&self, link: &Skylink) -> bool {
        self.hashes.lock().contains(&blake2b256(&link.root()))
    }
}

impl Default for Blocklist {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Upload
// ============================================================================

/// Erasure spec every base sector file uses: full replication, one data
/// piece.
#[must_use]
pub fn base_sector_erasure() -> ErasureSpec {
    ErasureSpec {
        kind: ErasureCoderKind::ReedSolomonSubShards64,
        data_pieces: 1,
        parity_pieces: 9,
    }
}

/// Parameters for a blob upload.
pub struct SkyfileUploadRequest {
    pub upload_path: RenterPath,
    pub filename: String,
    pub skykey: Option<Skykey>,
}

/// A fully assembled blob, ready for the upload pipeline.
pub struct PreparedSkyfile {
    pub skylink: Skylink,
    pub base_sector: Vec<u8>,
    /// Fanout pieces keyed by Merkle root; empty for small files whose
    /// payload lives in the base sector.
    pub fanout_sectors: Vec<(Hash, Vec<u8>)>,
}

/// Upload a blob. Small payloads inline into the base sector; anything
/// larger goes through an extended companion file and a fanout.
pub fn upload_skyfile(
    fs: &Arc<dyn FileStore>,
    blocklist: &Blocklist,
    data: &[u8],
    request: &SkyfileUploadRequest,
) -> Result<PreparedSkyfile, SkyfileError> {
    let metadata = SkyfileMetadata {
        filename: request.filename.clone(),
        length: data.len() as u64,
    };
    let metadata_bytes =
        serde_json::to_vec(&metadata).map_err(|e| SkyfileError::MalformedBaseSector(e.to_string()))?;
    if LAYOUT_SIZE + metadata_bytes.len() + data.len() <= SECTOR_SIZE {
        return upload_small(fs, blocklist, data, &metadata_bytes, request);
    }

    // Large path: store the payload in an extended companion file, then
    // convert it into a linked blob.
    let extended_path = request
        .upload_path
        .parent()
        .and_then(|p| {
            p.join(&format!("{}.extended", request.upload_path.name()))
                .ok()
        })
        .ok_or_else(|| SkyfileError::MalformedBaseSector("bad upload path".into()))?;
    fs.new_file(&extended_path, base_sector_erasure(), data.to_vec())?;
    convert_to_skyfile(
        fs,
        blocklist,
        &extended_path,
        &request.upload_path,
        &request.filename,
        request.skykey.as_ref(),
    )
}

fn upload_small(
    fs: &Arc<dyn FileStore>,
    blocklist: &Blocklist,
    data: &[u8],
    metadata_bytes: &[u8],
    request: &SkyfileUploadRequest,
) -> Result<PreparedSkyfile, SkyfileError> {
    let layout = SkyfileLayout::plain(data.len() as u64, metadata_bytes.len() as u64);
    let mut sector = build_base_sector(&layout, &[], metadata_bytes, data)?;
    if let Some(skykey) = &request.skykey {
        encrypt_base_sector(&mut sector, skykey)?;
    }
    let fetch_size = sector.len() as u32;
    let skylink = Skylink::new(sector_root(&sector), 0, fetch_size)?;
    if blocklist.is_blocked(&skylink) {
        return Err(SkyfileError::SkylinkBlocked);
    }
    let node = fs.new_file(&request.upload_path, base_sector_erasure(), sector.clone())?;
    node.add_skylink(skylink.to_string());
    Ok(PreparedSkyfile {
        skylink,
        base_sector: sector,
        fanout_sectors: Vec::new(),
    })
}

/// Convert an existing 1-of-N file into a linked blob. The source must use
/// the sub-shard Reed-Solomon scheme with a single data piece.
pub fn convert_to_skyfile(
    fs: &Arc<dyn FileStore>,
    blocklist: &Blocklist,
    source: &RenterPath,
    dest: &RenterPath,
    filename: &str,
    skykey: Option<&Skykey>,
) -> Result<PreparedSkyfile, SkyfileError> {
    let node = fs.open_file(source)?;
    let spec = node.erasure_spec();
    if spec.kind != ErasureCoderKind::ReedSolomonSubShards64 || spec.data_pieces != 1 {
        return Err(SkyfileError::RedundancyNotSupported);
    }
    let content = node.content()?;
    let metadata = SkyfileMetadata {
        filename: filename.to_string(),
        length: content.len() as u64,
    };
    let metadata_bytes =
        serde_json::to_vec(&metadata).map_err(|e| SkyfileError::MalformedBaseSector(e.to_string()))?;

    // A fresh file nonce binds the fanout pieces together under encryption.
    let mut file_nonce = [0u8; NONCE_LEN];
    rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut file_nonce);

    // One data piece per chunk: the fanout stores only the first piece root.
    let mut fanout = Vec::new();
    let mut fanout_sectors = Vec::new();
    for (chunk_index, chunk) in content.chunks(SECTOR_SIZE).enumerate() {
        let mut piece = chunk.to_vec();
        if let Some(key) = skykey {
            let nonce = fanout_piece_nonce(&file_nonce, chunk_index as u64, 0);
            xchacha20_apply(&key.fanout_key(), &nonce, &mut piece);
        }
        let root = sector_root(&piece);
        fanout.extend_from_slice(&root);
        fanout_sectors.push((root, piece));
    }

    let mut layout = SkyfileLayout::plain(content.len() as u64, metadata_bytes.len() as u64);
    layout.fanout_size = fanout.len() as u64;
    layout.fanout_data_pieces = spec.data_pieces as u8;
    layout.fanout_parity_pieces = spec.parity_pieces as u8;
    layout.key_data[SKYKEY_ID_LEN..SKYKEY_ID_LEN + NONCE_LEN].copy_from_slice(&file_nonce);

    let mut sector = build_base_sector(&layout, &fanout, &metadata_bytes, &[])?;
    if let Some(key) = skykey {
        // The base sector pass overwrites key data; the file nonce slot is
        // re-written with the same nonce the fanout pieces used.
        encrypt_base_sector_with_nonce(&mut sector, key, &file_nonce)?;
    }
    let skylink = Skylink::new(sector_root(&sector), 0, sector.len() as u32)?;

    let staged = fs.new_file(dest, base_sector_erasure(), sector.clone())?;
    if blocklist.is_blocked(&skylink) {
        // The staging file must not survive a blocked link.
        fs.delete_file(dest)?;
        return Err(SkyfileError::SkylinkBlocked);
    }
    staged.add_skylink(skylink.to_string());
    Ok(PreparedSkyfile {
        skylink,
        base_sector: sector,
        fanout_sectors,
    })
}

/// Encrypt with a caller-chosen nonce so fanout pieces and base sector share
/// the same file nonce.
fn encrypt_base_sector_with_nonce(
    sector: &mut [u8],
    skykey: &Skykey,
    nonce: &[u8; NONCE_LEN],
) -> Result<(), SkyfileError> {
    if sector.len() < LAYOUT_SIZE {
        return Err(SkyfileError::MalformedBaseSector("sector too short".into()));
    }
    apply_base_sector_cipher(sector, &skykey.base_sector_key(), nonce);
    let identifier = skykey.identifier_for(nonce);
    sector[OFF_CIPHER..OFF_KEY_DATA].copy_from_slice(&CIPHER_XCHACHA20);
    sector[OFF_KEY_DATA..OFF_KEY_DATA + SKYKEY_ID_LEN].copy_from_slice(&identifier);
    sector[OFF_KEY_DATA + SKYKEY_ID_LEN..OFF_KEY_DATA + SKYKEY_ID_LEN + NONCE_LEN]
        .copy_from_slice(nonce);
    Ok(())
}
