//! Stuck-chunk machinery: the LIFO stack of recently repaired files, the
//! weighted walk that picks directories still holding stuck chunks, and the
//! loop body feeding the repair heap.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::seq::SliceRandom;
use rand::Rng;

use crate::config::{
    MAX_SUCCESSFUL_STUCK_REPAIR_FILES, REPAIR_HEAP_CAPACITY, STUCK_LOOP_CHUNKS_PER_ITERATION,
};
use crate::error::FsError;
use crate::fs::FileStore;
use crate::types::RenterPath;

// ============================================================================
// Stuck stack
// ============================================================================

/// Bounded LIFO of files whose stuck chunks were recently repaired. Those
/// files are the best candidates for more successful repairs.
pub struct StuckStack {
    inner: Mutex<VecDeque<RenterPath>>,
    capacity: usize,
}

impl StuckStack {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(MAX_SUCCESSFUL_STUCK_REPAIR_FILES)
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            capacity,
        }
    }

    /// Push a file to the top. A file already on the stack moves to the top
    /// instead of duplicating; the oldest entry past the cap is dropped.
    pub fn push(&self, path: RenterPath) {
        let mut stack = self.inner.lock();
        if let Some(idx) = stack.iter().position(|p| *p == path) {
            stack.remove(idx);
        }
        stack.push_front(path);
        stack.truncate(self.capacity);
    }

    /// Most recently pushed file, if any.
    pub fn pop(&self) -> Option<RenterPath> {
        self.inner.lock().pop_front()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for StuckStack {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Repair heap
// ============================================================================

/// A chunk queued for repair.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ChunkRef {
    pub path: RenterPath,
    pub chunk: u64,
}

/// Bounded queue of chunks awaiting repair.
pub struct RepairHeap {
    inner: Mutex<Vec<ChunkRef>>,
    capacity: usize,
}

impl RepairHeap {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(REPAIR_HEAP_CAPACITY)
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Vec::new()),
            capacity,
        }
    }

    /// Add a chunk unless the heap is full or already tracks it.
    pub fn push(&self, chunk: ChunkRef) -> bool {
        let mut heap = self.inner.lock();
        if heap.len() >= self.capacity || heap.contains(&chunk) {
            return false;
        }
        heap.push(chunk);
        true
    }

    pub fn pop(&self) -> Option<ChunkRef> {
        self.inner.lock().pop()
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        let heap = self.inner.lock();
        heap.len() >= self.capacity
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for RepairHeap {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Weighted directory selection
// ============================================================================

/// Walk the tree toward stuck chunks, descending with probability
/// proportional to each directory's `aggregate_num_stuck_chunks`. Returns
/// `None` when the tree holds no stuck chunks at all.
pub fn random_stuck_directory(
    fs: &Arc<dyn FileStore>,
) -> Result<Option<RenterPath>, FsError> {
    let mut rng = rand::thread_rng();
    let mut current = RenterPath::root();
    loop {
        let metadata = fs.open_dir(&current)?.metadata();
        if metadata.aggregate_num_stuck_chunks == 0 {
            // An empty directory: either the tree is clean or the metadata
            // has not bubbled yet. Stop rather than spin.
            return Ok(None);
        }
        let mut pick = rng.gen_range(0..metadata.aggregate_num_stuck_chunks);
        if pick < metadata.num_stuck_chunks {
            return Ok(Some(current));
        }
        pick -= metadata.num_stuck_chunks;

        let mut descended = false;
        for entry in fs.read_dir(&current)? {
            if !entry.is_dir {
                continue;
            }
            let child = fs.open_dir(&entry.path)?.metadata();
            let weight = child.aggregate_num_stuck_chunks;
            if pick < weight {
                current = entry.path;
                descended = true;
                break;
            }
            pick -= weight;
        }
        if !descended {
            // Aggregates promise more stuck chunks than the children carry;
            // the directory itself is the best answer available.
            return Ok(Some(current));
        }
    }
}

// ============================================================================
// Stuck loop body
// ============================================================================

/// One iteration of the stuck loop: drain a few chunks from the stack, then
/// top the heap up with randomly selected stuck chunks. Stops when the heap
/// fills, a pass adds nothing, or the walk hits a clean directory.
pub fn add_stuck_chunks_to_heap(
    fs: &Arc<dyn FileStore>,
    stack: &StuckStack,
    heap: &RepairHeap,
) -> Result<usize, FsError> {
    let mut added = 0usize;

    // Files with recently repaired stuck chunks first, LIFO.
    let mut from_stack = 0usize;
    while from_stack < STUCK_LOOP_CHUNKS_PER_ITERATION && !heap.is_full() {
        let Some(path) = stack.pop() else {
            break;
        };
        let Ok(file) = fs.open_file(&path) else {
            // Deleted since it was pushed; skip it.
            continue;
        };
        for chunk in file.stuck_chunks() {
            if heap.push(ChunkRef {
                path: path.clone(),
                chunk,
            }) {
                added += 1;
                from_stack += 1;
            }
        }
    }

    // Then random stuck chunks, weighted by directory.
    loop {
        if heap.is_full() {
            break;
        }
        let Some(dir) = random_stuck_directory(fs)? else {
            break;
        };
        let mut stuck_files: Vec<RenterPath> = Vec::new();
        for entry in fs.read_dir(&dir)? {
            if entry.is_dir {
                continue;
            }
            let file = fs.open_file(&entry.path)?;
            if file.info().num_stuck_chunks > 0 {
                stuck_files.push(entry.path);
            }
        }
        let Some(path) = stuck_files.choose(&mut rand::thread_rng()).cloned() else {
            // The weights pointed at a directory with no stuck files left.
            break;
        };
        let file = fs.open_file(&path)?;
        let mut progressed = false;
        for chunk in file.stuck_chunks() {
            if heap.push(ChunkRef {
                path: path.clone(),
                chunk,
            }) {
                added += 1;
                progressed = true;
            }
        }
        if !progressed {
            // Every chunk of the chosen file is already queued; adding more
            // from the same weights would spin.
            break;
        }
    }
    Ok(added)
}
