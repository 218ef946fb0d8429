//! The background health-check walk: find the subtree whose health data is
//! oldest, refresh the cached file values inside it, and bubble the results.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use log::debug;

use crate::config::{HEALTH_BATCH_MAX_FILES, HEALTH_BATCH_MAX_SUBDIRS};
use crate::error::FsError;
use crate::fs::{FileNode, FileStore};
use crate::types::RenterPath;

use super::refresh_paths::UniqueRefreshPaths;

/// Recomputes a file's cached `(health, stuck_health, redundancy)` triple.
/// The renter wires this to the repair subsystem's view of the hosts.
pub type HealthFn = dyn Fn(&dyn FileNode) -> (f64, f64, f64) + Send + Sync;

/// Descend toward the directory whose subtree has the oldest aggregate
/// health check time, stopping once the subtree is small enough to refresh
/// as one batch. Returns the batch root and its aggregate time.
pub fn oldest_health_check_time(
    fs: &Arc<dyn FileStore>,
) -> Result<(RenterPath, SystemTime), FsError> {
    let mut current = RenterPath::root();
    loop {
        let metadata = fs.open_dir(&current)?.metadata();
        let small_enough = metadata.aggregate_num_sub_dirs <= HEALTH_BATCH_MAX_SUBDIRS
            && metadata.aggregate_num_files <= HEALTH_BATCH_MAX_FILES;
        if small_enough {
            return Ok((current, metadata.aggregate_last_health_check_time));
        }

        let mut oldest: Option<(RenterPath, SystemTime)> = None;
        for entry in fs.read_dir(&current)? {
            if !entry.is_dir {
                continue;
            }
            let child = fs.open_dir(&entry.path)?.metadata();
            let t = child.aggregate_last_health_check_time;
            if oldest.as_ref().is_none_or(|(_, best)| t < *best) {
                oldest = Some((entry.path, t));
            }
        }
        match oldest {
            Some((child, _)) => current = child,
            None => return Ok((current, metadata.aggregate_last_health_check_time)),
        }
    }
}

/// Walk the subtree under `root`, refresh every file whose directory is due
/// a check, and collect the touched directories for bubbling. Directories
/// checked within `interval` are skipped wholesale.
pub fn prepare_for_bubble(
    fs: &Arc<dyn FileStore>,
    root: &RenterPath,
    interval: Duration,
    now: SystemTime,
    health_fn: &HealthFn,
) -> Result<UniqueRefreshPaths, FsError> {
    let urp = UniqueRefreshPaths::new();
    let mut queue = vec![root.clone()];
    while let Some(dir) = queue.pop() {
        let metadata = fs.open_dir(&dir)?.metadata();
        let fresh = now
            .duration_since(metadata.aggregate_last_health_check_time)
            .map_or(true, |age| age < interval);
        if fresh && dir != *root {
            continue;
        }

        let mut touched = false;
        for entry in fs.read_dir(&dir)? {
            if entry.is_dir {
                queue.push(entry.path);
                continue;
            }
            let file = fs.open_file(&entry.path)?;
            let (health, stuck_health, redundancy) = health_fn(file.as_ref());
            file.update_cached_health(health, stuck_health, redundancy);
            file.mark_health_checked(now);
            touched = true;
        }
        if touched || metadata.num_sub_dirs == 0 {
            urp.add(&dir);
        }
    }
    debug!("health walk under {root}: {} directories to refresh", urp.len());
    Ok(urp)
}
