//! Streaming download of blobs: base sector resolution, then per-chunk
//! piece fetches with erasure decoding.
//!
//! Each referenced chunk spawns one fetch task per piece; the chunk
//! completes as soon as enough pieces arrived and decrypted. Remaining
//! fetches are discarded.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use reed_solomon_simd::ReedSolomonDecoder;
use tokio::task::JoinSet;

use crate::config::SECTOR_SIZE;
use crate::crypto::Hash;
use crate::error::SkyfileError;
use crate::skyfile::encryption::{fanout_piece_nonce, xchacha20_apply, Skykey, NONCE_LEN};
use crate::skyfile::skylink::Skylink;
use crate::skyfile::{decrypt_base_sector, parse_base_sector, SkyfileLayout, SkyfileMetadata};
use crate::worker::pool::WorkerPool;

/// Fetches a byte range of a sector by Merkle root. The worker pool is the
/// production implementation; tests substitute in-memory maps.
#[async_trait]
pub trait SectorFetcher: Send + Sync {
    async fn download_by_root(
        &self,
        root: Hash,
        offset: u32,
        length: u32,
    ) -> Result<Vec<u8>, SkyfileError>;
}

#[async_trait]
impl SectorFetcher for WorkerPool {
    async fn download_by_root(
        &self,
        root: Hash,
        offset: u32,
        length: u32,
    ) -> Result<Vec<u8>, SkyfileError> {
        WorkerPool::download_by_root(self, root, offset, length)
            .await
            .map_err(|e| SkyfileError::Download(e.to_string()))
    }
}

// ============================================================================
// Fanout parsing
// ============================================================================

/// Split the packed fanout into per-chunk piece roots. Chunks of a
/// single-data-piece encoding store only the first piece's root; chunks with
/// multiple data pieces store all pieces' roots.
pub fn parse_fanout(
    bytes: &[u8],
    layout: &SkyfileLayout,
) -> Result<Vec<Vec<Hash>>, SkyfileError> {
    let data_pieces = layout.fanout_data_pieces as usize;
    let parity_pieces = layout.fanout_parity_pieces as usize;
    if data_pieces == 0 {
        return Err(SkyfileError::MalformedBaseSector(
            "fanout with zero data pieces".into(),
        ));
    }
    let pieces_per_chunk = if data_pieces == 1 {
        1
    } else {
        data_pieces + parity_pieces
    };
    let entry_size = pieces_per_chunk * 32;
    if bytes.is_empty() || bytes.len() % entry_size != 0 {
        return Err(SkyfileError::MalformedBaseSector(format!(
            "fanout of {} bytes is not a multiple of {entry_size}",
            bytes.len()
        )));
    }
    let chunk_size = data_pieces as u64 * SECTOR_SIZE as u64;
    let expected_chunks = layout.filesize.div_ceil(chunk_size) as usize;
    let chunks: Vec<Vec<Hash>> = bytes
        .chunks(entry_size)
        .map(|entry| {
            entry
                .chunks(32)
                .map(|root| root.try_into().expect("entry size checked"))
                .collect()
        })
        .collect();
    if chunks.len() != expected_chunks {
        return Err(SkyfileError::MalformedBaseSector(format!(
            "fanout covers {} chunks, file needs {expected_chunks}",
            chunks.len()
        )));
    }
    Ok(chunks)
}

// ============================================================================
// The streamer
// ============================================================================

/// Streaming reader over a fanout-encoded blob.
pub struct FanoutStreamer {
    layout: SkyfileLayout,
    chunks: Vec<Vec<Hash>>,
    fetcher: Arc<dyn SectorFetcher>,
    /// Fanout decryption key and file nonce, when the blob is encrypted.
    crypto: Option<([u8; 32], [u8; NONCE_LEN])>,
}

impl std::fmt::Debug for FanoutStreamer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanoutStreamer")
            .field("layout", &self.layout)
            .field("chunks", &self.chunks)
            .field("crypto", &self.crypto.is_some())
            .finish()
    }
}

impl FanoutStreamer {
    pub fn new(
        layout: SkyfileLayout,
        fanout_bytes: &[u8],
        fetcher: Arc<dyn SectorFetcher>,
        skykey: Option<&Skykey>,
    ) -> Result<Self, SkyfileError> {
        let chunks = parse_fanout(fanout_bytes, &layout)?;
        let crypto = skykey.map(|key| {
            let nonce: [u8; NONCE_LEN] = layout.key_data[16..16 + NONCE_LEN]
                .try_into()
                .expect("layout key data holds the nonce");
            (key.fanout_key(), nonce)
        });
        Ok(Self {
            layout,
            chunks,
            fetcher,
            crypto,
        })
    }

    #[must_use]
    pub fn len(&self) -> u64 {
        self.layout.filesize
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.layout.filesize == 0
    }

    fn chunk_size(&self) -> u64 {
        self.layout.fanout_data_pieces as u64 * SECTOR_SIZE as u64
    }

    /// Read an arbitrary byte range, fetching only the chunks it touches.
    pub async fn read_range(&self, offset: u64, length: u64) -> Result<Vec<u8>, SkyfileError> {
        let end = offset
            .checked_add(length)
            .ok_or(SkyfileError::OutOfBounds)?;
        if end > self.layout.filesize {
            return Err(SkyfileError::OutOfBounds);
        }
        if length == 0 {
            return Ok(Vec::new());
        }
        let chunk_size = self.chunk_size();
        let first_chunk = offset / chunk_size;
        let last_chunk = (end - 1) / chunk_size;

        let mut out = Vec::with_capacity(length as usize);
        for chunk_index in first_chunk..=last_chunk {
            let chunk = self.fetch_chunk(chunk_index).await?;
            let chunk_start = chunk_index * chunk_size;
            let local_start = offset.saturating_sub(chunk_start) as usize;
            let local_end = (end.min(chunk_start + chunk.len() as u64) - chunk_start) as usize;
            out.extend_from_slice(&chunk[local_start..local_end]);
        }
        Ok(out)
    }

    /// Fetch one chunk: one task per piece, complete at `data_pieces`
    /// successes, fail permanently once too many pieces are gone.
    async fn fetch_chunk(&self, chunk_index: u64) -> Result<Vec<u8>, SkyfileError> {
        let roots = &self.chunks[chunk_index as usize];
        let data_pieces = self.layout.fanout_data_pieces as usize;
        let total = roots.len();

        let mut set = JoinSet::new();
        for (piece_index, root) in roots.iter().enumerate() {
            let fetcher = self.fetcher.clone();
            let root = *root;
            set.spawn(async move {
                let piece = fetcher
                    .download_by_root(root, 0, SECTOR_SIZE as u32)
                    .await;
                (piece_index, piece)
            });
        }

        let mut pieces: HashMap<usize, Vec<u8>> = HashMap::new();
        let mut failed = 0usize;
        while let Some(joined) = set.join_next().await {
            let Ok((piece_index, result)) = joined else {
                failed += 1;
                continue;
            };
            match result {
                Ok(mut piece) => {
                    if let Some((key, file_nonce)) = &self.crypto {
                        let nonce =
                            fanout_piece_nonce(file_nonce, chunk_index, piece_index as u64);
                        xchacha20_apply(key, &nonce, &mut piece);
                    }
                    pieces.insert(piece_index, piece);
                    if pieces.len() >= data_pieces {
                        // Enough pieces; discard the stragglers.
                        set.abort_all();
                        break;
                    }
                }
                Err(_) => failed += 1,
            }
            if failed + pieces.len() == total && pieces.len() < data_pieces {
                return Err(SkyfileError::ChunkIrrecoverable {
                    completed: pieces.len(),
                    needed: data_pieces,
                });
            }
        }
        if pieces.len() < data_pieces {
            return Err(SkyfileError::ChunkIrrecoverable {
                completed: pieces.len(),
                needed: data_pieces,
            });
        }

        let chunk = self.assemble_chunk(pieces, data_pieces, total)?;
        // The final chunk is truncated to the file's end.
        let chunk_start = chunk_index * self.chunk_size();
        let remaining = (self.layout.filesize - chunk_start).min(chunk.len() as u64);
        let mut chunk = chunk;
        chunk.truncate(remaining as usize);
        Ok(chunk)
    }

    /// Concatenate the data pieces, erasure-decoding when some are missing.
    fn assemble_chunk(
        &self,
        pieces: HashMap<usize, Vec<u8>>,
        data_pieces: usize,
        total: usize,
    ) -> Result<Vec<u8>, SkyfileError> {
        let all_data_present = (0..data_pieces).all(|i| pieces.contains_key(&i));
        if all_data_present {
            let mut out = Vec::new();
            for i in 0..data_pieces {
                out.extend_from_slice(&pieces[&i]);
            }
            return Ok(out);
        }

        let parity = total - data_pieces;
        let shard_size = pieces
            .values()
            .next()
            .map(Vec::len)
            .ok_or(SkyfileError::ChunkIrrecoverable {
                completed: 0,
                needed: data_pieces,
            })?;
        let mut decoder = ReedSolomonDecoder::new(data_pieces, parity, shard_size)
            .map_err(|e| SkyfileError::Download(format!("decoder: {e}")))?;
        for (index, piece) in &pieces {
            if *index < data_pieces {
                decoder
                    .add_original_shard(*index, piece)
                    .map_err(|e| SkyfileError::Download(format!("original shard: {e}")))?;
            } else {
                decoder
                    .add_recovery_shard(*index - data_pieces, piece)
                    .map_err(|e| SkyfileError::Download(format!("recovery shard: {e}")))?;
            }
        }
        let restored = decoder
            .decode()
            .map_err(|e| SkyfileError::Download(format!("decode: {e}")))?;
        let mut out = Vec::new();
        for i in 0..data_pieces {
            if let Some(piece) = pieces.get(&i) {
                out.extend_from_slice(piece);
            } else {
                let shard = restored.restored_original(i).ok_or_else(|| {
                    SkyfileError::Download(format!("shard {i} not restored"))
                })?;
                out.extend_from_slice(shard);
            }
        }
        Ok(out)
    }
}

// ============================================================================
// Download entry point
// ============================================================================

/// A downloaded blob: inline payload for small files, a fanout streamer for
/// everything else.
#[derive(Debug)]
pub enum SkyfileStreamer {
    Inline(Vec<u8>),
    Fanout(FanoutStreamer),
}

impl SkyfileStreamer {
    #[must_use]
    pub fn len(&self) -> u64 {
        match self {
            SkyfileStreamer::Inline(data) => data.len() as u64,
            SkyfileStreamer::Fanout(streamer) => streamer.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub async fn read_range(&self, offset: u64, length: u64) -> Result<Vec<u8>, SkyfileError> {
        match self {
            SkyfileStreamer::Inline(data) => {
                let end = offset
                    .checked_add(length)
                    .filter(|end| *end <= data.len() as u64)
                    .ok_or(SkyfileError::OutOfBounds)?;
                Ok(data[offset as usize..end as usize].to_vec())
            }
            SkyfileStreamer::Fanout(streamer) => streamer.read_range(offset, length).await,
        }
    }

    /// Convenience: the whole payload.
    pub async fn read_all(&self) -> Result<Vec<u8>, SkyfileError> {
        self.read_range(0, self.len()).await
    }
}

/// Resolve a skylink into metadata and a streamer over its content.
pub async fn download_skyfile(
    fetcher: &Arc<dyn SectorFetcher>,
    link: &Skylink,
    skykeys: &[Skykey],
) -> Result<(SkyfileMetadata, SkyfileStreamer), SkyfileError> {
    let mut base = fetcher
        .download_by_root(link.root(), 0, SECTOR_SIZE as u32)
        .await?;
    let matched = decrypt_base_sector(&mut base, skykeys)?;
    let (layout, fanout_bytes, metadata, payload) = parse_base_sector(&base)?;
    if layout.fanout_size == 0 {
        return Ok((metadata, SkyfileStreamer::Inline(payload)));
    }
    let streamer = FanoutStreamer::new(layout, &fanout_bytes, fetcher.clone(), matched)?;
    Ok((metadata, SkyfileStreamer::Fanout(streamer)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use reed_solomon_simd::ReedSolomonEncoder;

    use crate::fs::mem::MemFileStore;
    use crate::fs::FileStore;
    use crate::skyfile::encryption::SkykeyMode;
    use crate::skyfile::{upload_skyfile, Blocklist, SkyfileUploadRequest};
    use crate::types::RenterPath;

    /// Serves sectors from a map, padding short reads like a host would.
    struct MapFetcher {
        sectors: Mutex<HashMap<Hash, Vec<u8>>>,
    }

    impl MapFetcher {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sectors: Mutex::new(HashMap::new()),
            })
        }

        fn insert(&self, root: Hash, data: Vec<u8>) {
            self.sectors.lock().insert(root, data);
        }

        fn remove(&self, root: &Hash) {
            self.sectors.lock().remove(root);
        }
    }

    #[async_trait]
    impl SectorFetcher for MapFetcher {
        async fn download_by_root(
            &self,
            root: Hash,
            offset: u32,
            length: u32,
        ) -> Result<Vec<u8>, SkyfileError> {
            let sectors = self.sectors.lock();
            let Some(sector) = sectors.get(&root) else {
                return Err(SkyfileError::Download("unknown root".into()));
            };
            let mut out = vec![0u8; length as usize];
            let start = offset as usize;
            if start < sector.len() {
                let avail = &sector[start..];
                let n = avail.len().min(out.len());
                out[..n].copy_from_slice(&avail[..n]);
            }
            Ok(out)
        }
    }

    fn upload(
        data: &[u8],
        skykey: Option<Skykey>,
    ) -> (crate::skyfile::PreparedSkyfile, Arc<MapFetcher>) {
        let fs: Arc<dyn FileStore> = Arc::new(MemFileStore::new());
        let request = SkyfileUploadRequest {
            upload_path: RenterPath::new("var/skynet/blob").unwrap(),
            filename: "blob".into(),
            skykey,
        };
        let prepared = upload_skyfile(&fs, &Blocklist::new(), data, &request).unwrap();
        let fetcher = MapFetcher::new();
        fetcher.insert(prepared.skylink.root(), prepared.base_sector.clone());
        for (root, sector) in &prepared.fanout_sectors {
            fetcher.insert(*root, sector.clone());
        }
        (prepared, fetcher)
    }

    #[tokio::test]
    async fn small_blob_roundtrip() {
        let data = b"tiny payload".to_vec();
        let (prepared, fetcher) = upload(&data, None);
        let fetcher: Arc<dyn SectorFetcher> = fetcher;
        let (metadata, streamer) = download_skyfile(&fetcher, &prepared.skylink, &[])
            .await
            .unwrap();
        assert_eq!(metadata.filename, "blob");
        assert_eq!(streamer.read_all().await.unwrap(), data);
    }

    #[tokio::test]
    async fn large_blob_roundtrip_and_ranges() {
        // Two full chunks plus a partial third.
        let mut data = vec![0u8; SECTOR_SIZE * 2 + 300];
        for (i, byte) in data.iter_mut().enumerate() {
            *byte = (i % 251) as u8;
        }
        let (prepared, fetcher) = upload(&data, None);
        assert_eq!(prepared.fanout_sectors.len(), 3);
        let fetcher: Arc<dyn SectorFetcher> = fetcher;
        let (metadata, streamer) = download_skyfile(&fetcher, &prepared.skylink, &[])
            .await
            .unwrap();
        assert_eq!(metadata.length, data.len() as u64);
        assert_eq!(streamer.len(), data.len() as u64);

        // A range crossing the first chunk boundary.
        let start = SECTOR_SIZE as u64 - 100;
        let got = streamer.read_range(start, 200).await.unwrap();
        assert_eq!(got, &data[start as usize..start as usize + 200]);

        // The tail of the file.
        let tail_start = data.len() as u64 - 300;
        let got = streamer.read_range(tail_start, 300).await.unwrap();
        assert_eq!(got, &data[tail_start as usize..]);

        assert!(streamer
            .read_range(data.len() as u64 - 1, 2)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn encrypted_large_blob_roundtrip() {
        let key = Skykey::generate("k".into(), SkykeyMode::PrivateId);
        let mut data = vec![0u8; SECTOR_SIZE + 10];
        for (i, byte) in data.iter_mut().enumerate() {
            *byte = (i % 13) as u8;
        }
        let (prepared, fetcher) = upload(&data, Some(key.clone()));
        let fetcher: Arc<dyn SectorFetcher> = fetcher;

        // Without the key the download refuses.
        let err = download_skyfile(&fetcher, &prepared.skylink, &[])
            .await
            .unwrap_err();
        assert!(matches!(err, SkyfileError::EncryptionNotSupported));

        let (_, streamer) = download_skyfile(
            &fetcher,
            &prepared.skylink,
            std::slice::from_ref(&key),
        )
        .await
        .unwrap();
        assert_eq!(streamer.read_all().await.unwrap(), data);
    }

    #[tokio::test]
    async fn missing_piece_fails_the_chunk() {
        let data = vec![5u8; SECTOR_SIZE + 1];
        let (prepared, fetcher) = upload(&data, None);
        // Drop the second chunk's only piece.
        fetcher.remove(&prepared.fanout_sectors[1].0);
        let fetcher: Arc<dyn SectorFetcher> = fetcher;
        let (_, streamer) = download_skyfile(&fetcher, &prepared.skylink, &[])
            .await
            .unwrap();
        // First chunk still reads.
        assert!(streamer.read_range(0, 100).await.is_ok());
        let err = streamer.read_all().await.unwrap_err();
        assert!(matches!(err, SkyfileError::ChunkIrrecoverable { .. }));
    }

    #[tokio::test]
    async fn erasure_decoding_recovers_missing_data_piece() {
        // A 2-of-3 chunk built by hand; the streamer must decode when one
        // data piece is gone. Pieces are whole sectors, as on the wire.
        let shard_size = SECTOR_SIZE;
        let shard_a: Vec<u8> = (0..shard_size).map(|i| (i % 7) as u8).collect();
        let shard_b: Vec<u8> = (0..shard_size).map(|i| (i % 11) as u8).collect();
        let mut encoder = ReedSolomonEncoder::new(2, 1, shard_size).unwrap();
        encoder.add_original_shard(&shard_a).unwrap();
        encoder.add_original_shard(&shard_b).unwrap();
        let encoded = encoder.encode().unwrap();
        let recovery: Vec<u8> = encoded.recovery_iter().next().unwrap().to_vec();

        let fetcher = MapFetcher::new();
        let roots: Vec<Hash> = [&shard_a, &shard_b, &recovery]
            .iter()
            .map(|shard| {
                let root = crate::crypto::blake2b256(shard);
                fetcher.insert(root, (*shard).clone());
                root
            })
            .collect();
        // Lose data piece 0.
        fetcher.remove(&roots[0]);

        let filesize = (shard_a.len() + shard_b.len()) as u64;
        let mut layout = SkyfileLayout::plain(filesize, 0);
        layout.fanout_size = 96;
        layout.fanout_data_pieces = 2;
        layout.fanout_parity_pieces = 1;
        let fanout_bytes: Vec<u8> = roots.iter().flat_map(|r| r.to_vec()).collect();

        let fetcher: Arc<dyn SectorFetcher> = fetcher;
        let streamer = FanoutStreamer::new(layout, &fanout_bytes, fetcher, None).unwrap();
        let got = streamer.read_range(0, filesize).await.unwrap();
        assert_eq!(&got[..shard_size], shard_a.as_slice());
        assert_eq!(&got[shard_size..], shard_b.as_slice());
    }
}
