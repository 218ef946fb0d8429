//! In-memory file store. Backs tests and acts as the reference
//! implementation of the store interface.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Read;
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;

use crate::error::FsError;
use crate::fs::{
    DirEntry, DirMetadata, DirNode, ErasureCoderKind, ErasureSpec, FileInfo, FileNode, FileStore,
    UNSET_REDUNDANCY,
};
use crate::types::RenterPath;

/// Chunk size used when deriving chunk counts from content length.
const MEM_CHUNK_SIZE: u64 = 1 << 16;

#[derive(Clone)]
struct FileState {
    content: Vec<u8>,
    erasure: ErasureSpec,
    health: f64,
    stuck_health: f64,
    redundancy: f64,
    mod_time: SystemTime,
    last_health_check_time: SystemTime,
    stuck_chunks: BTreeSet<u64>,
    skylinks: Vec<String>,
}

/// File handle into the in-memory store.
pub struct MemFileNode {
    path: RenterPath,
    state: Mutex<FileState>,
}

impl MemFileNode {
    fn new(path: RenterPath, erasure: ErasureSpec, content: Vec<u8>) -> Self {
        Self {
            path,
            state: Mutex::new(FileState {
                content,
                erasure,
                health: 0.0,
                stuck_health: 0.0,
                redundancy: UNSET_REDUNDANCY,
                mod_time: SystemTime::now(),
                last_health_check_time: SystemTime::UNIX_EPOCH,
                stuck_chunks: BTreeSet::new(),
                skylinks: Vec::new(),
            }),
        }
    }

    /// Force the cached health values, bypassing the health loop. Test hook.
    pub fn set_health(&self, health: f64, stuck_health: f64, redundancy: f64) {
        let mut st = self.state.lock();
        st.health = health;
        st.stuck_health = stuck_health;
        st.redundancy = redundancy;
    }
}

impl FileNode for MemFileNode {
    fn path(&self) -> RenterPath {
        self.path.clone()
    }

    fn info(&self) -> FileInfo {
        let st = self.state.lock();
        let size = st.content.len() as u64;
        let num_chunks = size.div_ceil(MEM_CHUNK_SIZE).max(1);
        let chunk_size = size / num_chunks;
        let num_stuck = st.stuck_chunks.len() as u64;
        let needs_repair = st.health >= crate::config::REPAIR_THRESHOLD;
        FileInfo {
            health: st.health,
            stuck_health: st.stuck_health,
            redundancy: st.redundancy,
            size,
            mod_time: st.mod_time,
            last_health_check_time: st.last_health_check_time,
            num_stuck_chunks: num_stuck,
            repair_bytes: if needs_repair { size } else { 0 },
            stuck_bytes: num_stuck * chunk_size,
            num_skylinks: st.skylinks.len() as u64,
        }
    }

    fn erasure_spec(&self) -> ErasureSpec {
        self.state.lock().erasure
    }

    fn num_chunks(&self) -> u64 {
        let size = self.state.lock().content.len() as u64;
        size.div_ceil(MEM_CHUNK_SIZE).max(1)
    }

    fn stuck_chunks(&self) -> Vec<u64> {
        self.state.lock().stuck_chunks.iter().copied().collect()
    }

    fn set_stuck(&self, chunk: u64, stuck: bool) -> Result<(), FsError> {
        let mut st = self.state.lock();
        if stuck {
            st.stuck_chunks.insert(chunk);
        } else {
            st.stuck_chunks.remove(&chunk);
        }
        Ok(())
    }

    fn update_cached_health(&self, health: f64, stuck_health: f64, redundancy: f64) {
        let mut st = self.state.lock();
        st.health = health;
        st.stuck_health = stuck_health;
        st.redundancy = redundancy;
    }

    fn mark_health_checked(&self, when: SystemTime) {
        self.state.lock().last_health_check_time = when;
    }

    fn content(&self) -> Result<Vec<u8>, FsError> {
        Ok(self.state.lock().content.clone())
    }

    fn skylinks(&self) -> Vec<String> {
        self.state.lock().skylinks.clone()
    }

    fn add_skylink(&self, link: String) {
        let mut st = self.state.lock();
        if !st.skylinks.contains(&link) {
            st.skylinks.push(link);
        }
    }
}

struct MemDirNode {
    path: RenterPath,
    store: Arc<Shared>,
}

impl DirNode for MemDirNode {
    fn path(&self) -> RenterPath {
        self.path.clone()
    }

    fn metadata(&self) -> DirMetadata {
        self.store
            .dirs
            .lock()
            .get(&self.path)
            .cloned()
            .unwrap_or_default()
    }

    fn update_metadata(&self, metadata: DirMetadata) -> Result<(), FsError> {
        let mut dirs = self.store.dirs.lock();
        if !dirs.contains_key(&self.path) {
            return Err(FsError::NotFound(self.path.to_string()));
        }
        dirs.insert(self.path.clone(), metadata);
        Ok(())
    }
}

struct Shared {
    dirs: Mutex<BTreeMap<RenterPath, DirMetadata>>,
    files: Mutex<BTreeMap<RenterPath, Arc<MemFileNode>>>,
}

/// The in-memory store. Cheap to clone via `Arc`.
pub struct MemFileStore {
    shared: Arc<Shared>,
}

impl MemFileStore {
    #[must_use]
    pub fn new() -> Self {
        let mut dirs = BTreeMap::new();
        dirs.insert(RenterPath::root(), DirMetadata::default());
        Self {
            shared: Arc::new(Shared {
                dirs: Mutex::new(dirs),
                files: Mutex::new(BTreeMap::new()),
            }),
        }
    }

    /// Typed access to a file node, for test hooks like `set_health`.
    pub fn file(&self, path: &RenterPath) -> Result<Arc<MemFileNode>, FsError> {
        self.shared
            .files
            .lock()
            .get(path)
            .cloned()
            .ok_or_else(|| FsError::NotFound(path.to_string()))
    }

    /// Default erasure spec for files created through `add_file_from_reader`.
    fn default_erasure() -> ErasureSpec {
        ErasureSpec {
            kind: ErasureCoderKind::ReedSolomonSubShards64,
            data_pieces: 1,
            parity_pieces: 9,
        }
    }
}

impl Default for MemFileStore {
    fn default() -> Self {
        Self::new()
    }
}

impl FileStore for MemFileStore {
    fn open_file(&self, path: &RenterPath) -> Result<Arc<dyn FileNode>, FsError> {
        let node = self.file(path)?;
        Ok(node)
    }

    fn open_dir(&self, path: &RenterPath) -> Result<Arc<dyn DirNode>, FsError> {
        if !self.shared.dirs.lock().contains_key(path) {
            return Err(FsError::NotFound(path.to_string()));
        }
        Ok(Arc::new(MemDirNode {
            path: path.clone(),
            store: self.shared.clone(),
        }))
    }

    fn read_dir(&self, path: &RenterPath) -> Result<Vec<DirEntry>, FsError> {
        let dirs = self.shared.dirs.lock();
        if !dirs.contains_key(path) {
            return Err(FsError::NotFound(path.to_string()));
        }
        let mut entries = Vec::new();
        for dir in dirs.keys() {
            if path.is_ancestor_of(dir) && dir.parent().as_ref() == Some(path) {
                entries.push(DirEntry {
                    path: dir.clone(),
                    is_dir: true,
                });
            }
        }
        drop(dirs);
        let files = self.shared.files.lock();
        for file in files.keys() {
            if file.parent().as_ref() == Some(path) {
                entries.push(DirEntry {
                    path: file.clone(),
                    is_dir: false,
                });
            }
        }
        Ok(entries)
    }

    fn new_dir(&self, path: &RenterPath) -> Result<(), FsError> {
        if self.shared.files.lock().contains_key(path) {
            return Err(FsError::NotADirectory(path.to_string()));
        }
        let mut dirs = self.shared.dirs.lock();
        let mut chain = Vec::new();
        let mut cur = path.clone();
        loop {
            chain.push(cur.clone());
            match cur.parent() {
                Some(p) => cur = p,
                None => break,
            }
        }
        for dir in chain.into_iter().rev() {
            dirs.entry(dir).or_default();
        }
        Ok(())
    }

    fn new_file(
        &self,
        path: &RenterPath,
        erasure: ErasureSpec,
        content: Vec<u8>,
    ) -> Result<Arc<dyn FileNode>, FsError> {
        let parent = path
            .parent()
            .ok_or_else(|| FsError::NotAFile(path.to_string()))?;
        self.new_dir(&parent)?;
        let mut files = self.shared.files.lock();
        if files.contains_key(path) {
            return Err(FsError::Exists(path.to_string()));
        }
        let node = Arc::new(MemFileNode::new(path.clone(), erasure, content));
        files.insert(path.clone(), node.clone());
        Ok(node)
    }

    fn add_file_from_reader(
        &self,
        path: &RenterPath,
        reader: &mut dyn Read,
    ) -> Result<(), FsError> {
        let mut content = Vec::new();
        reader
            .read_to_end(&mut content)
            .map_err(|e| FsError::Io(e.to_string()))?;
        self.new_file(path, Self::default_erasure(), content)?;
        Ok(())
    }

    fn delete_file(&self, path: &RenterPath) -> Result<(), FsError> {
        self.shared
            .files
            .lock()
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| FsError::NotFound(path.to_string()))
    }

    fn file_exists(&self, path: &RenterPath) -> bool {
        self.shared.files.lock().contains_key(path)
    }

    fn dir_exists(&self, path: &RenterPath) -> bool {
        self.shared.dirs.lock().contains_key(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(s: &str) -> RenterPath {
        RenterPath::new(s).unwrap()
    }

    #[test]
    fn new_dir_creates_ancestors() {
        let store = MemFileStore::new();
        store.new_dir(&path("a/b/c")).unwrap();
        assert!(store.dir_exists(&path("a")));
        assert!(store.dir_exists(&path("a/b")));
        assert!(store.dir_exists(&path("a/b/c")));
    }

    #[test]
    fn read_dir_lists_direct_children_only() {
        let store = MemFileStore::new();
        store.new_dir(&path("a/b")).unwrap();
        store.new_dir(&path("a/c/d")).unwrap();
        store
            .new_file(&path("a/f1"), MemFileStore::default_erasure(), vec![1, 2])
            .unwrap();
        let mut names: Vec<String> = store
            .read_dir(&path("a"))
            .unwrap()
            .into_iter()
            .map(|e| e.path.as_str().to_string())
            .collect();
        names.sort();
        assert_eq!(names, vec!["a/b", "a/c", "a/f1"]);
    }

    #[test]
    fn file_roundtrip_and_stuck_tracking() {
        let store = MemFileStore::new();
        let node = store
            .new_file(&path("x/file"), MemFileStore::default_erasure(), vec![9; 10])
            .unwrap();
        assert_eq!(node.content().unwrap(), vec![9; 10]);
        node.set_stuck(0, true).unwrap();
        assert_eq!(node.info().num_stuck_chunks, 1);
        node.set_stuck(0, false).unwrap();
        assert_eq!(node.info().num_stuck_chunks, 0);
    }

    #[test]
    fn duplicate_file_rejected() {
        let store = MemFileStore::new();
        store
            .new_file(&path("dup"), MemFileStore::default_erasure(), vec![])
            .unwrap();
        assert!(matches!(
            store.new_file(&path("dup"), MemFileStore::default_erasure(), vec![]),
            Err(FsError::Exists(_))
        ));
    }
}
