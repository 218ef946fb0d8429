//! Bubble: recursive, deduplicated propagation of directory metadata.
//!
//! Each directory has at most one metadata pass in flight. Calls arriving
//! while one runs collapse into a single follow-up pass. Completed passes
//! schedule their parent, so a change anywhere eventually reaches the root,
//! where repair and stuck signals fire.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use log::{debug, error, warn};
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::config::{ALERT_LOW_REDUNDANCY_THRESHOLD, REPAIR_THRESHOLD};
use crate::fs::FileStore;
use crate::types::RenterPath;

pub mod health;
pub mod metadata;
pub mod refresh_paths;
pub mod stuck;

use metadata::calculate_dir_metadata;

/// Single-flight state per directory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BubbleStatus {
    /// A pass is running.
    Active,
    /// A pass is running and another was requested; one follow-up runs after.
    Pending,
}

/// Files whose health crossed the alert threshold, keyed by path.
pub struct Alerts {
    active: Mutex<HashMap<RenterPath, String>>,
}

impl Alerts {
    #[must_use]
    pub fn new() -> Self {
        Self {
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&self, path: RenterPath, message: String) {
        self.active.lock().insert(path, message);
    }

    pub fn unregister(&self, path: &RenterPath) {
        self.active.lock().remove(path);
    }

    #[must_use]
    pub fn is_active(&self, path: &RenterPath) -> bool {
        self.active.lock().contains_key(path)
    }

    #[must_use]
    pub fn active(&self) -> Vec<(RenterPath, String)> {
        self.active
            .lock()
            .iter()
            .map(|(p, m)| (p.clone(), m.clone()))
            .collect()
    }
}

impl Default for Alerts {
    fn default() -> Self {
        Self::new()
    }
}

/// The metadata propagation engine.
pub struct BubbleEngine {
    fs: Arc<dyn FileStore>,
    updates: Mutex<HashMap<RenterPath, BubbleStatus>>,
    pub alerts: Alerts,
    /// Fires when a root pass sees subtree health at or past the repair
    /// threshold.
    pub repair_needed: Notify,
    /// Fires when a root pass sees stuck chunks anywhere in the tree.
    pub stuck_found: Notify,
}

impl BubbleEngine {
    #[must_use]
    pub fn new(fs: Arc<dyn FileStore>) -> Arc<Self> {
        Arc::new(Self {
            fs,
            updates: Mutex::new(HashMap::new()),
            alerts: Alerts::new(),
            repair_needed: Notify::new(),
            stuck_found: Notify::new(),
        })
    }

    #[must_use]
    pub fn fs(&self) -> &Arc<dyn FileStore> {
        &self.fs
    }

    /// Claim the single-flight slot for a directory. Returns whether the
    /// caller should run the pass itself.
    fn prepare_bubble(&self, path: &RenterPath) -> bool {
        let mut updates = self.updates.lock();
        match updates.get(path) {
            None => {
                updates.insert(path.clone(), BubbleStatus::Active);
                true
            }
            Some(BubbleStatus::Active) => {
                updates.insert(path.clone(), BubbleStatus::Pending);
                false
            }
            Some(BubbleStatus::Pending) => false,
        }
    }

    /// Release the slot after a pass. Returns whether a follow-up pass must
    /// run because requests piled up meanwhile.
    fn complete_bubble(&self, path: &RenterPath) -> bool {
        let mut updates = self.updates.lock();
        match updates.get(path) {
            Some(BubbleStatus::Active) => {
                updates.remove(path);
                false
            }
            Some(BubbleStatus::Pending) => {
                updates.insert(path.clone(), BubbleStatus::Active);
                true
            }
            None => {
                // Completing a pass that was never prepared is a bug in the
                // engine itself.
                error!("bubble: complete without prepare on {path}");
                panic!("bubble state machine violated for {path}");
            }
        }
    }

    #[must_use]
    pub fn is_bubbling(&self, path: &RenterPath) -> bool {
        self.updates.lock().contains_key(path)
    }

    /// Schedule a bubble of `path`. Deduplicated per directory; completion
    /// schedules the parent automatically.
    pub fn queue_bubble(self: &Arc<Self>, path: &RenterPath) {
        if !self.prepare_bubble(path) {
            return;
        }
        let this = self.clone();
        let path = path.clone();
        tokio::spawn(async move {
            this.run_prepared(path).await;
        });
    }

    /// Bubble `path` and wait until the whole ancestor chain has been
    /// refreshed, including passes owned by concurrent callers.
    pub async fn bubble_blocking(self: &Arc<Self>, path: &RenterPath) {
        let mut current = path.clone();
        loop {
            if self.prepare_bubble(&current) {
                loop {
                    self.perform_bubble(&current);
                    if !self.complete_bubble(&current) {
                        break;
                    }
                }
            } else {
                // Someone else owns the pass; their follow-up covers us.
                while self.is_bubbling(&current) {
                    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                }
            }
            match current.parent() {
                Some(parent) => current = parent,
                None => return,
            }
        }
    }

    /// Run an already-prepared pass, then walk up the ancestor chain.
    async fn run_prepared(self: Arc<Self>, path: RenterPath) {
        let mut current = path;
        loop {
            loop {
                self.perform_bubble(&current);
                if !self.complete_bubble(&current) {
                    break;
                }
            }
            match current.parent() {
                Some(parent) => {
                    if !self.prepare_bubble(&parent) {
                        // The owner of the running pass continues upward.
                        return;
                    }
                    current = parent;
                }
                None => return,
            }
        }
    }

    /// One metadata pass over a single directory.
    fn perform_bubble(self: &Arc<Self>, path: &RenterPath) {
        let now = SystemTime::now();
        let calc = match calculate_dir_metadata(&self.fs, path, now) {
            Ok(calc) => calc,
            Err(e) => {
                warn!("bubble: calculating {path}: {e}");
                return;
            }
        };

        // Children that never saw a health check heal themselves via their
        // own bubble.
        for child in &calc.stale_children {
            if !self.is_bubbling(child) {
                self.queue_bubble(child);
            }
        }

        // Alert upkeep for the direct files.
        for (file_path, info) in &calc.files {
            let worst = info.health.max(info.stuck_health);
            if worst >= ALERT_LOW_REDUNDANCY_THRESHOLD {
                self.alerts.register(
                    file_path.clone(),
                    format!("file {file_path} is at low redundancy (health {worst:.2})"),
                );
            } else {
                self.alerts.unregister(file_path);
            }
        }

        let metadata = calc.metadata;
        let repair = metadata.aggregate_health >= REPAIR_THRESHOLD;
        let stuck = metadata.aggregate_num_stuck_chunks > 0;
        match self.fs.open_dir(path) {
            Ok(dir) => {
                if let Err(e) = dir.update_metadata(metadata) {
                    warn!("bubble: writing metadata for {path}: {e}");
                }
            }
            Err(e) => warn!("bubble: opening {path}: {e}"),
        }

        if path.is_root() {
            debug!("bubble: root pass complete, repair={repair} stuck={stuck}");
            if repair {
                self.repair_needed.notify_one();
            }
            if stuck {
                self.stuck_found.notify_one();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::mem::MemFileStore;
    use crate::fs::{DirMetadata, ErasureCoderKind, ErasureSpec, FileNode};
    use crate::testutil::wait_until;

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

    fn engine_with_store() -> (Arc<BubbleEngine>, Arc<MemFileStore>) {
        let mem = Arc::new(MemFileStore::new());
        (BubbleEngine::new(mem.clone()), mem)
    }

    #[test]
    fn single_flight_state_machine() {
        let (engine, _) = engine_with_store();
        let p = RenterPath::root();
        assert!(engine.prepare_bubble(&p));
        // A second caller queues exactly one follow-up.
        assert!(!engine.prepare_bubble(&p));
        assert!(!engine.prepare_bubble(&p));
        assert!(engine.complete_bubble(&p), "follow-up must run");
        assert!(!engine.complete_bubble(&p), "only one follow-up");
        assert!(!engine.is_bubbling(&p));
    }

    #[test]
    #[should_panic(expected = "bubble state machine violated")]
    fn complete_without_prepare_panics() {
        let (engine, _) = engine_with_store();
        engine.complete_bubble(&RenterPath::root());
    }

    // The worst health below propagates to the root; the directly-bubbled
    // empty directory falls back to default health, so its preset value is
    // overwritten and the siblings' persisted values win.
    #[tokio::test]
    async fn bubble_propagates_worst_health() {
        let (engine, mem) = engine_with_store();
        let fs: Arc<dyn FileStore> = mem.clone();
        fs.new_dir(&path("a/b/c")).unwrap();
        for (p, health) in [("a", 1.0), ("a/b", 1.0), ("a/b/c", 4.0)] {
            let dir = fs.open_dir(&path(p)).unwrap();
            dir.update_metadata(DirMetadata {
                health,
                aggregate_health: health,
                ..DirMetadata::default()
            })
            .unwrap();
        }

        engine.bubble_blocking(&path("a/b/c")).await;

        let root = fs.open_dir(&RenterPath::root()).unwrap().metadata();
        assert_eq!(root.aggregate_health, 1.0);
        // The empty directory itself was recomputed down to the default.
        let c = fs.open_dir(&path("a/b/c")).unwrap().metadata();
        assert_eq!(c.aggregate_health, 0.0);
    }

    #[tokio::test]
    async fn aggregates_match_subtree_after_quiesce() {
        let (engine, mem) = engine_with_store();
        let fs: Arc<dyn FileStore> = mem.clone();
        fs.new_file(&path("a/f1"), spec(), vec![0; 100]).unwrap();
        fs.new_file(&path("a/b/f2"), spec(), vec![0; 200]).unwrap();
        fs.new_file(&path("a/b/f3"), spec(), vec![0; 300]).unwrap();
        mem.file(&path("a/b/f2")).unwrap().set_health(2.0, 0.0, 1.0);
        mem.file(&path("a/b/f2")).unwrap().set_stuck(0, true).unwrap();

        // Deepest-first so parent passes see fresh child aggregates.
        engine.bubble_blocking(&path("a/b")).await;

        let root = fs.open_dir(&RenterPath::root()).unwrap().metadata();
        assert_eq!(root.aggregate_num_files, 3);
        assert_eq!(root.aggregate_size, 600);
        assert_eq!(root.aggregate_health, 2.0);
        assert_eq!(root.aggregate_num_stuck_chunks, 1);
        // Subtree: a and a/b.
        assert_eq!(root.aggregate_num_sub_dirs, 2);

        let a = fs.open_dir(&path("a")).unwrap().metadata();
        assert_eq!(a.aggregate_num_files, 3);
        assert_eq!(a.num_files, 1);
        assert_eq!(a.aggregate_num_sub_dirs, 1);
    }

    #[tokio::test]
    async fn concurrent_bubbles_deduplicate() {
        let (engine, mem) = engine_with_store();
        let fs: Arc<dyn FileStore> = mem.clone();
        fs.new_dir(&path("busy")).unwrap();
        for _ in 0..16 {
            engine.queue_bubble(&path("busy"));
        }
        let probe = engine.clone();
        wait_until("bubbles quiesce", move || {
            !probe.is_bubbling(&path("busy")) && !probe.is_bubbling(&RenterPath::root())
        })
        .await;
        // The pass landed: the directory's metadata got a health check time.
        let md = fs.open_dir(&path("busy")).unwrap().metadata();
        assert_ne!(md.last_health_check_time, SystemTime::UNIX_EPOCH);
    }

    #[tokio::test]
    async fn low_redundancy_file_gets_alert_and_recovers() {
        let (engine, mem) = engine_with_store();
        let fs: Arc<dyn FileStore> = mem.clone();
        fs.new_file(&path("d/bad"), spec(), vec![0; 10]).unwrap();
        mem.file(&path("d/bad")).unwrap().set_health(1.0, 0.0, 0.5);

        engine.bubble_blocking(&path("d")).await;
        assert!(engine.alerts.is_active(&path("d/bad")));

        mem.file(&path("d/bad")).unwrap().set_health(0.0, 0.0, 3.0);
        engine.bubble_blocking(&path("d")).await;
        assert!(!engine.alerts.is_active(&path("d/bad")));
    }
}
