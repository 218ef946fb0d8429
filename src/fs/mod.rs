//! File-store interface consumed by the core.
//!
//! The on-disk file format, its write-ahead log, and the chunk layout are
//! owned by the file store itself; the core only reads cached health values,
//! directory metadata, and raw snapshots for backups.

use std::io::Read;
use std::sync::Arc;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::error::FsError;
use crate::types::RenterPath;

pub mod mem;

/// Sentinel for "no redundancy information yet".
pub const UNSET_REDUNDANCY: f64 = -1.0;

// ============================================================================
// Erasure coding descriptors
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErasureCoderKind {
    ReedSolomon,
    /// Reed-Solomon over 64-byte sub-shards; the only kind eligible for
    /// conversion into a content-addressed blob.
    ReedSolomonSubShards64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErasureSpec {
    pub kind: ErasureCoderKind,
    pub data_pieces: usize,
    pub parity_pieces: usize,
}

impl ErasureSpec {
    #[must_use]
    pub const fn total_pieces(&self) -> usize {
        self.data_pieces + self.parity_pieces
    }
}

// ============================================================================
// File snapshots
// ============================================================================

/// Cached per-file values gathered during a metadata pass.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FileInfo {
    pub health: f64,
    pub stuck_health: f64,
    pub redundancy: f64,
    pub size: u64,
    pub mod_time: SystemTime,
    pub last_health_check_time: SystemTime,
    pub num_stuck_chunks: u64,
    pub repair_bytes: u64,
    pub stuck_bytes: u64,
    pub num_skylinks: u64,
}

/// An open file handle.
pub trait FileNode: Send + Sync {
    fn path(&self) -> RenterPath;
    fn info(&self) -> FileInfo;
    fn erasure_spec(&self) -> ErasureSpec;
    fn num_chunks(&self) -> u64;
    fn stuck_chunks(&self) -> Vec<u64>;
    fn set_stuck(&self, chunk: u64, stuck: bool) -> Result<(), FsError>;
    /// Refresh the cached health triple after a health check.
    fn update_cached_health(&self, health: f64, stuck_health: f64, redundancy: f64);
    fn mark_health_checked(&self, when: SystemTime);
    /// Raw serialized form, used for backups and blob assembly.
    fn content(&self) -> Result<Vec<u8>, FsError>;
    fn skylinks(&self) -> Vec<String>;
    fn add_skylink(&self, link: String);
}

// ============================================================================
// Directory metadata
// ============================================================================

/// Per-directory metadata. The `Aggregate*` group sums or extremizes the
/// whole subtree rooted at this directory; the plain group covers only the
/// directory itself and its direct files.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DirMetadata {
    pub health: f64,
    pub stuck_health: f64,
    pub remote_health: f64,
    pub min_redundancy: f64,
    pub mod_time: SystemTime,
    pub last_health_check_time: SystemTime,
    pub num_files: u64,
    pub num_stuck_chunks: u64,
    pub num_sub_dirs: u64,
    pub size: u64,
    pub repair_size: u64,
    pub stuck_size: u64,
    pub skynet_files: u64,
    pub skynet_size: u64,

    pub aggregate_health: f64,
    pub aggregate_stuck_health: f64,
    pub aggregate_remote_health: f64,
    pub aggregate_min_redundancy: f64,
    pub aggregate_mod_time: SystemTime,
    pub aggregate_last_health_check_time: SystemTime,
    pub aggregate_num_files: u64,
    pub aggregate_num_stuck_chunks: u64,
    pub aggregate_num_sub_dirs: u64,
    pub aggregate_size: u64,
    pub aggregate_repair_size: u64,
    pub aggregate_stuck_size: u64,
    pub aggregate_skynet_files: u64,
    pub aggregate_skynet_size: u64,
}

impl Default for DirMetadata {
    fn default() -> Self {
        Self {
            health: 0.0,
            stuck_health: 0.0,
            remote_health: 0.0,
            min_redundancy: UNSET_REDUNDANCY,
            mod_time: SystemTime::UNIX_EPOCH,
            last_health_check_time: SystemTime::UNIX_EPOCH,
            num_files: 0,
            num_stuck_chunks: 0,
            num_sub_dirs: 0,
            size: 0,
            repair_size: 0,
            stuck_size: 0,
            skynet_files: 0,
            skynet_size: 0,
            aggregate_health: 0.0,
            aggregate_stuck_health: 0.0,
            aggregate_remote_health: 0.0,
            aggregate_min_redundancy: UNSET_REDUNDANCY,
            aggregate_mod_time: SystemTime::UNIX_EPOCH,
            aggregate_last_health_check_time: SystemTime::UNIX_EPOCH,
            aggregate_num_files: 0,
            aggregate_num_stuck_chunks: 0,
            aggregate_num_sub_dirs: 0,
            aggregate_size: 0,
            aggregate_repair_size: 0,
            aggregate_stuck_size: 0,
            aggregate_skynet_files: 0,
            aggregate_skynet_size: 0,
        }
    }
}

/// An open directory handle.
pub trait DirNode: Send + Sync {
    fn path(&self) -> RenterPath;
    fn metadata(&self) -> DirMetadata;
    fn update_metadata(&self, metadata: DirMetadata) -> Result<(), FsError>;
}

// ============================================================================
// The store itself
// ============================================================================

/// One entry of a directory listing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    pub path: RenterPath,
    pub is_dir: bool,
}

/// The file-store interface. Paths are logical [`RenterPath`]s.
pub trait FileStore: Send + Sync {
    fn open_file(&self, path: &RenterPath) -> Result<Arc<dyn FileNode>, FsError>;
    fn open_dir(&self, path: &RenterPath) -> Result<Arc<dyn DirNode>, FsError>;
    /// Direct children of a directory, files and subdirectories.
    fn read_dir(&self, path: &RenterPath) -> Result<Vec<DirEntry>, FsError>;
    /// Create a directory and any missing ancestors. Succeeds if it exists.
    fn new_dir(&self, path: &RenterPath) -> Result<(), FsError>;
    fn new_file(
        &self,
        path: &RenterPath,
        erasure: ErasureSpec,
        content: Vec<u8>,
    ) -> Result<Arc<dyn FileNode>, FsError>;
    /// Materialize a file from its serialized snapshot (backup restore).
    fn add_file_from_reader(
        &self,
        path: &RenterPath,
        reader: &mut dyn Read,
    ) -> Result<(), FsError>;
    fn delete_file(&self, path: &RenterPath) -> Result<(), FsError>;
    fn file_exists(&self, path: &RenterPath) -> bool;
    fn dir_exists(&self, path: &RenterPath) -> bool;
}
