//! Minimal set of directories to bubble after a batch of file updates.
//!
//! Bubbling a directory refreshes every ancestor on its way to the root, so
//! only the deepest added path per branch needs its own pass. `child_dirs`
//! holds those leaves; `parent_dirs` the ancestors already covered.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::bubble::BubbleEngine;
use crate::types::RenterPath;

#[derive(Default)]
struct RefreshInner {
    child_dirs: HashSet<RenterPath>,
    parent_dirs: HashSet<RenterPath>,
}

#[derive(Default)]
pub struct UniqueRefreshPaths {
    inner: Mutex<RefreshInner>,
}

impl UniqueRefreshPaths {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `path` for refresh. Paths already covered by a deeper tracked
    /// path are dropped; tracked ancestors of `path` are demoted to covered.
    pub fn add(&self, path: &RenterPath) {
        let mut inner = self.inner.lock();
        if inner.parent_dirs.contains(path) || inner.child_dirs.contains(path) {
            return;
        }
        inner.child_dirs.insert(path.clone());
        let mut current = path.clone();
        while let Some(parent) = current.parent() {
            inner.child_dirs.remove(&parent);
            inner.parent_dirs.insert(parent.clone());
            current = parent;
        }
    }

    /// The directories that get their own bubble pass.
    #[must_use]
    pub fn child_dirs(&self) -> Vec<RenterPath> {
        self.inner.lock().child_dirs.iter().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().child_dirs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fire-and-forget a bubble per tracked leaf.
    pub fn refresh_all(&self, engine: &Arc<BubbleEngine>) {
        for path in self.child_dirs() {
            engine.queue_bubble(&path);
        }
    }

    /// Bubble every tracked leaf and wait for the chains to finish.
    pub async fn refresh_all_blocking(&self, engine: &Arc<BubbleEngine>) {
        for path in self.child_dirs() {
            engine.bubble_blocking(&path).await;
        }
    }
}
