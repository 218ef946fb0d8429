//! Encrypted, integrity-checked backups of the user file tree.
//!
//! Layout: a 32-byte hash of everything after it, a single-line JSON header,
//! then an optionally twofish-CTR-encrypted, gzip-compressed stream holding a
//! POSIX tar of `/home/user` followed by the allowance as trailing JSON. The
//! hash is verified before any tar content is honored.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ctr::cipher::{KeyIvInit, StreamCipher};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use log::debug;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::crypto::{Hash, StreamingHasher};
use crate::error::BackupError;
use crate::fs::FileStore;
use crate::types::{Allowance, RenterPath};

type TwofishCtr = ctr::Ctr128BE<twofish::Twofish>;

const BACKUP_VERSION: &str = "1.0";
const ENCRYPTION_PLAINTEXT: &str = "plaintext";
const ENCRYPTION_TWOFISH_CTR: &str = "twofish-ctr";
const CHECKSUM_SIZE: usize = 32;

#[derive(Debug, Serialize, Deserialize)]
struct BackupHeader {
    version: String,
    encryption: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    iv: Option<String>,
}

// ============================================================================
// Writer plumbing
// ============================================================================

/// Tee that hashes everything written through it.
struct HashingWriter<W: Write> {
    inner: W,
    hasher: StreamingHasher,
}

impl<W: Write> HashingWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: StreamingHasher::new(),
        }
    }

    fn into_parts(self) -> (W, Hash) {
        (self.inner, self.hasher.finalize())
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.hasher.update(buf);
        self.inner.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Optional twofish-CTR pass over everything written through it.
struct CipherWriter<W: Write> {
    inner: W,
    cipher: Option<TwofishCtr>,
}

impl<W: Write> CipherWriter<W> {
    fn new(inner: W, cipher: Option<TwofishCtr>) -> Self {
        Self { inner, cipher }
    }

    fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for CipherWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match &mut self.cipher {
            Some(cipher) => {
                let mut out = buf.to_vec();
                cipher.apply_keystream(&mut out);
                self.inner.write_all(&out)?;
            }
            None => self.inner.write_all(buf)?,
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

// ============================================================================
// Create
// ============================================================================

/// Write a backup of everything under `/home/user` plus the allowance.
pub fn create_backup(
    fs: &Arc<dyn FileStore>,
    dest: &Path,
    allowance: &Allowance,
    secret: Option<&[u8; 32]>,
) -> Result<(), BackupError> {
    let mut file = File::create(dest)?;
    // Reserved for the final hash.
    file.write_all(&[0u8; CHECKSUM_SIZE])?;

    let (cipher, iv) = match secret {
        Some(secret) => {
            let mut iv = [0u8; 16];
            rand::thread_rng().fill_bytes(&mut iv);
            (
                Some(TwofishCtr::new(secret.into(), (&iv).into())),
                Some(STANDARD.encode(iv)),
            )
        }
        None => (None, None),
    };
    let header = BackupHeader {
        version: BACKUP_VERSION.to_string(),
        encryption: if secret.is_some() {
            ENCRYPTION_TWOFISH_CTR.to_string()
        } else {
            ENCRYPTION_PLAINTEXT.to_string()
        },
        iv,
    };

    // Everything after the reserved hash goes through the hashing tee: the
    // header in plaintext, the body through the cipher and gzip.
    let mut hashing = HashingWriter::new(file);
    serde_json::to_writer(&mut hashing, &header)?;
    hashing.write_all(b"\n")?;

    let cipher_writer = CipherWriter::new(hashing, cipher);
    let gz = GzEncoder::new(cipher_writer, Compression::default());
    let mut tar = tar::Builder::new(gz);

    tar_tree(fs, &mut tar, &RenterPath::user_dir())?;
    let mut gz = tar.into_inner()?;
    // The allowance rides after the tar EOF, still inside the gzip stream.
    gz.write_all(&serde_json::to_vec(allowance)?)?;

    let cipher_writer = gz.finish()?;
    let (mut file, hash) = cipher_writer.into_inner().into_parts();
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&hash)?;
    file.sync_all()?;
    Ok(())
}

/// Recursively tar a directory of the logical tree.
fn tar_tree<W: Write>(
    fs: &Arc<dyn FileStore>,
    tar: &mut tar::Builder<W>,
    dir: &RenterPath,
) -> Result<(), BackupError> {
    for entry in fs.read_dir(dir)? {
        if entry.is_dir {
            let mut header = tar::Header::new_ustar();
            header.set_entry_type(tar::EntryType::Directory);
            header.set_size(0);
            header.set_mode(0o755);
            tar.append_data(&mut header, entry.path.as_str(), std::io::empty())?;
            tar_tree(fs, tar, &entry.path)?;
        } else {
            let node = fs.open_file(&entry.path)?;
            let content = node.content()?;
            let mut header = tar::Header::new_ustar();
            header.set_entry_type(tar::EntryType::Regular);
            // Size at header-write time; the snapshot is already taken.
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            tar.append_data(&mut header, entry.path.as_str(), content.as_slice())?;
        }
    }
    Ok(())
}

// ============================================================================
// Load
// ============================================================================

/// Restore a backup into the file store. The checksum is verified before any
/// entry touches the store. Returns the archived allowance when present;
/// archives without one load fine.
pub fn load_backup(
    fs: &Arc<dyn FileStore>,
    src: &Path,
    secret: Option<&[u8; 32]>,
) -> Result<Option<Allowance>, BackupError> {
    let mut raw = Vec::new();
    OpenOptions::new()
        .read(true)
        .open(src)?
        .read_to_end(&mut raw)?;
    if raw.len() < CHECKSUM_SIZE {
        return Err(BackupError::BadHeader("file shorter than checksum".into()));
    }
    let expected: Hash = raw[..CHECKSUM_SIZE].try_into().expect("length checked");
    let actual = crate::crypto::blake2b256(&raw[CHECKSUM_SIZE..]);
    if expected != actual {
        return Err(BackupError::ChecksumMismatch);
    }

    let rest = &raw[CHECKSUM_SIZE..];
    let newline = rest
        .iter()
        .position(|&b| b == b'\n')
        .ok_or_else(|| BackupError::BadHeader("unterminated header".into()))?;
    let header: BackupHeader = serde_json::from_slice(&rest[..newline])
        .map_err(|e| BackupError::BadHeader(e.to_string()))?;
    if header.version != BACKUP_VERSION {
        return Err(BackupError::BadHeader(format!(
            "unknown version {:?}",
            header.version
        )));
    }

    let mut body = rest[newline + 1..].to_vec();
    match header.encryption.as_str() {
        ENCRYPTION_PLAINTEXT => {}
        ENCRYPTION_TWOFISH_CTR => {
            let Some(secret) = secret else {
                return Err(BackupError::WrongSecret);
            };
            let iv_b64 = header
                .iv
                .ok_or_else(|| BackupError::BadHeader("missing iv".into()))?;
            let iv: [u8; 16] = STANDARD
                .decode(iv_b64)
                .map_err(|e| BackupError::BadHeader(e.to_string()))?
                .try_into()
                .map_err(|_| BackupError::BadHeader("iv must be 16 bytes".into()))?;
            let mut cipher = TwofishCtr::new(secret.into(), (&iv).into());
            cipher.apply_keystream(&mut body);
        }
        other => {
            return Err(BackupError::BadHeader(format!("unknown encryption {other:?}")));
        }
    }

    // A wrong secret leaves gzip garbage; surface that as a secret problem.
    let encrypted = header.encryption == ENCRYPTION_TWOFISH_CTR;
    let mut gz = GzDecoder::new(body.as_slice());
    let mut compressed = Vec::new();
    gz.read_to_end(&mut compressed).map_err(|e| {
        if encrypted {
            BackupError::WrongSecret
        } else {
            BackupError::Io(e)
        }
    })?;

    let mut archive = tar::Archive::new(compressed.as_slice());
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path_str = entry.path()?.to_string_lossy().into_owned();
        let Ok(path) = RenterPath::new(path_str.trim_end_matches('/')) else {
            debug!("backup: skipping malformed path {path_str:?}");
            continue;
        };
        if !path.is_within(&RenterPath::user_dir()) {
            debug!("backup: skipping foreign path {path}");
            continue;
        }
        match entry.header().entry_type() {
            tar::EntryType::Directory => fs.new_dir(&path)?,
            tar::EntryType::Regular => {
                if fs.file_exists(&path) {
                    continue;
                }
                if let Some(parent) = path.parent() {
                    fs.new_dir(&parent)?;
                }
                fs.add_file_from_reader(&path, &mut entry)?;
            }
            other => debug!("backup: skipping entry type {other:?} at {path}"),
        }
    }

    // Whatever follows the tar EOF is the allowance, decoded best-effort so
    // archives predating it still load.
    let mut trailing = Vec::new();
    archive.into_inner().read_to_end(&mut trailing)?;
    let json_start = trailing.iter().position(|&b| b == b'{');
    let allowance = json_start.and_then(|at| serde_json::from_slice(&trailing[at..]).ok());
    Ok(allowance)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::mem::MemFileStore;
    use crate::fs::{ErasureCoderKind, ErasureSpec};

    fn path(s: &str) -> RenterPath {
        RenterPath::new(s).unwrap()
    }

    fn spec() -> ErasureSpec {
        ErasureSpec {
            kind: ErasureCoderKind::ReedSolomonSubShards64,
            data_pieces: 1,
            parity_pieces: 9,
        }
    }

    fn populated_store() -> Arc<dyn FileStore> {
        let fs: Arc<dyn FileStore> = Arc::new(MemFileStore::new());
        fs.new_dir(&path("home/user/docs")).unwrap();
        fs.new_file(&path("home/user/a.txt"), spec(), b"alpha".to_vec())
            .unwrap();
        fs.new_file(&path("home/user/docs/b.txt"), spec(), b"beta".to_vec())
            .unwrap();
        // Outside the user tree, must not be archived.
        fs.new_file(&path("var/skynet/blob"), spec(), b"blob".to_vec())
            .unwrap();
        fs
    }

    fn assert_restored(fs: &Arc<dyn FileStore>) {
        let a = fs.open_file(&path("home/user/a.txt")).unwrap();
        assert_eq!(a.content().unwrap(), b"alpha");
        let b = fs.open_file(&path("home/user/docs/b.txt")).unwrap();
        assert_eq!(b.content().unwrap(), b"beta");
        assert!(!fs.file_exists(&path("var/skynet/blob")));
    }

    #[test]
    fn roundtrip_plaintext() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("backup.bak");
        let source = populated_store();
        let allowance = Allowance {
            funds: 777,
            ..Allowance::default()
        };
        create_backup(&source, &dest, &allowance, None).unwrap();

        let target: Arc<dyn FileStore> = Arc::new(MemFileStore::new());
        let restored = load_backup(&target, &dest, None).unwrap();
        assert_eq!(restored.unwrap().funds, 777);
        assert_restored(&target);
    }

    #[test]
    fn roundtrip_encrypted() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("backup.bak");
        let source = populated_store();
        let secret = [9u8; 32];
        create_backup(&source, &dest, &Allowance::default(), Some(&secret)).unwrap();

        // Without the secret the load refuses outright.
        let target: Arc<dyn FileStore> = Arc::new(MemFileStore::new());
        assert!(matches!(
            load_backup(&target, &dest, None),
            Err(BackupError::WrongSecret)
        ));
        // A wrong secret cannot produce a valid stream.
        assert!(matches!(
            load_backup(&target, &dest, Some(&[1u8; 32])),
            Err(BackupError::WrongSecret)
        ));

        let target: Arc<dyn FileStore> = Arc::new(MemFileStore::new());
        load_backup(&target, &dest, Some(&secret)).unwrap();
        assert_restored(&target);
    }

    // Flipping any byte after the checksum fails the load before anything
    // lands in the file store.
    #[test]
    fn corruption_detected_before_restore() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("backup.bak");
        let source = populated_store();
        create_backup(&source, &dest, &Allowance::default(), None).unwrap();

        let mut raw = std::fs::read(&dest).unwrap();
        raw[40] ^= 0xFF;
        std::fs::write(&dest, &raw).unwrap();

        let target: Arc<dyn FileStore> = Arc::new(MemFileStore::new());
        assert!(matches!(
            load_backup(&target, &dest, None),
            Err(BackupError::ChecksumMismatch)
        ));
        assert!(target.read_dir(&RenterPath::root()).unwrap().is_empty());
    }

    // Older archives end at the tar EOF with no trailing allowance.
    #[test]
    fn legacy_archive_without_allowance_still_loads() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("legacy.bak");
        let source = populated_store();

        let mut file = File::create(&dest).unwrap();
        file.write_all(&[0u8; CHECKSUM_SIZE]).unwrap();
        let header = BackupHeader {
            version: BACKUP_VERSION.to_string(),
            encryption: ENCRYPTION_PLAINTEXT.to_string(),
            iv: None,
        };
        let mut hashing = HashingWriter::new(file);
        serde_json::to_writer(&mut hashing, &header).unwrap();
        hashing.write_all(b"\n").unwrap();
        let gz = GzEncoder::new(
            CipherWriter::new(hashing, None),
            Compression::default(),
        );
        let mut tar = tar::Builder::new(gz);
        tar_tree(&source, &mut tar, &RenterPath::user_dir()).unwrap();
        let gz = tar.into_inner().unwrap();
        let (mut file, hash) = gz.finish().unwrap().into_inner().into_parts();
        file.seek(SeekFrom::Start(0)).unwrap();
        file.write_all(&hash).unwrap();
        drop(file);

        let target: Arc<dyn FileStore> = Arc::new(MemFileStore::new());
        let allowance = load_backup(&target, &dest, None).unwrap();
        assert!(allowance.is_none());
        assert_restored(&target);
    }

    #[test]
    fn existing_files_are_not_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("backup.bak");
        let source = populated_store();
        create_backup(&source, &dest, &Allowance::default(), None).unwrap();

        let target: Arc<dyn FileStore> = Arc::new(MemFileStore::new());
        target
            .new_file(&path("home/user/a.txt"), spec(), b"kept".to_vec())
            .unwrap();
        load_backup(&target, &dest, None).unwrap();
        let a = target.open_file(&path("home/user/a.txt")).unwrap();
        assert_eq!(a.content().unwrap(), b"kept");
    }
}
