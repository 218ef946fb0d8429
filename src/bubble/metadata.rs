//! Directory metadata calculation: fold a directory's direct children into
//! its own metadata and roll the subtree aggregates up.

use std::sync::Arc;
use std::time::SystemTime;

use crate::error::FsError;
use crate::fs::{DirMetadata, FileInfo, FileStore, UNSET_REDUNDANCY};
use crate::types::RenterPath;

/// Companion files carrying extended attributes. Their bytes count toward
/// blob totals, the files themselves do not.
const EXTENDED_SUFFIX: &str = ".extended";

/// Outcome of one metadata pass over a directory.
pub struct DirCalculation {
    pub metadata: DirMetadata,
    /// Direct file children with their gathered info, for alert upkeep.
    pub files: Vec<(RenterPath, FileInfo)>,
    /// Subdirectories that have never been through a health check; they need
    /// their own bubble to become trustworthy.
    pub stale_children: Vec<RenterPath>,
}

fn combine_min_redundancy(a: f64, b: f64) -> f64 {
    if a < 0.0 {
        b
    } else if b < 0.0 {
        a
    } else {
        a.min(b)
    }
}

fn min_time(a: SystemTime, b: SystemTime) -> SystemTime {
    if a <= b {
        a
    } else {
        b
    }
}

fn max_time(a: SystemTime, b: SystemTime) -> SystemTime {
    if a >= b {
        a
    } else {
        b
    }
}

/// True when the file participates in blob ("skynet") accounting.
fn counts_as_skynet(path: &RenterPath, info: &FileInfo) -> bool {
    path.is_within(&RenterPath::skynet_dir()) || info.num_skylinks > 0
}

/// Compute a directory's metadata from its direct children.
///
/// File-derived fields come from the direct files. A directory holding only
/// subdirectories keeps its persisted health triple (there is no file data
/// to replace it); a directory with no children at all resets to defaults.
pub fn calculate_dir_metadata(
    fs: &Arc<dyn FileStore>,
    path: &RenterPath,
    now: SystemTime,
) -> Result<DirCalculation, FsError> {
    let entries = fs.read_dir(path)?;
    let persisted = fs.open_dir(path)?.metadata();

    let mut metadata = DirMetadata::default();
    let mut files = Vec::new();
    let mut stale_children = Vec::new();
    let mut file_lhct: Option<SystemTime> = None;

    for entry in &entries {
        if entry.is_dir {
            continue;
        }
        let node = fs.open_file(&entry.path)?;
        let info = node.info();

        metadata.health = metadata.health.max(info.health);
        metadata.stuck_health = metadata.stuck_health.max(info.stuck_health);
        metadata.remote_health = metadata.remote_health.max(info.health);
        metadata.min_redundancy = combine_min_redundancy(metadata.min_redundancy, info.redundancy);
        metadata.mod_time = max_time(metadata.mod_time, info.mod_time);
        metadata.num_files += 1;
        metadata.num_stuck_chunks += info.num_stuck_chunks;
        metadata.size += info.size;
        metadata.repair_size += info.repair_bytes;
        metadata.stuck_size += info.stuck_bytes;
        if counts_as_skynet(&entry.path, &info) {
            metadata.skynet_size += info.size;
            if !entry.path.name().ends_with(EXTENDED_SUFFIX) {
                metadata.skynet_files += 1;
            }
        }
        file_lhct = Some(match file_lhct {
            Some(t) => min_time(t, info.last_health_check_time),
            None => info.last_health_check_time,
        });
        files.push((entry.path.clone(), info));
    }

    let num_sub_dirs = entries.iter().filter(|e| e.is_dir).count() as u64;
    metadata.num_sub_dirs = num_sub_dirs;
    metadata.last_health_check_time = file_lhct.unwrap_or(now);

    if metadata.num_files == 0 && num_sub_dirs > 0 {
        // No file data to recompute from; the persisted values stand.
        metadata.health = persisted.health;
        metadata.stuck_health = persisted.stuck_health;
        metadata.remote_health = persisted.remote_health;
    }

    // Seed the aggregates with this directory's own values.
    metadata.aggregate_health = metadata.health;
    metadata.aggregate_stuck_health = metadata.stuck_health;
    metadata.aggregate_remote_health = metadata.remote_health;
    metadata.aggregate_min_redundancy = metadata.min_redundancy;
    metadata.aggregate_mod_time = metadata.mod_time;
    metadata.aggregate_last_health_check_time = metadata.last_health_check_time;
    metadata.aggregate_num_files = metadata.num_files;
    metadata.aggregate_num_stuck_chunks = metadata.num_stuck_chunks;
    metadata.aggregate_num_sub_dirs = 0;
    metadata.aggregate_size = metadata.size;
    metadata.aggregate_repair_size = metadata.repair_size;
    metadata.aggregate_stuck_size = metadata.stuck_size;
    metadata.aggregate_skynet_files = metadata.skynet_files;
    metadata.aggregate_skynet_size = metadata.skynet_size;

    for entry in &entries {
        if !entry.is_dir {
            continue;
        }
        let child = fs.open_dir(&entry.path)?.metadata();
        if child.aggregate_last_health_check_time == SystemTime::UNIX_EPOCH {
            stale_children.push(entry.path.clone());
        }
        metadata.aggregate_health = metadata.aggregate_health.max(child.aggregate_health);
        metadata.aggregate_stuck_health = metadata
            .aggregate_stuck_health
            .max(child.aggregate_stuck_health);
        metadata.aggregate_remote_health = metadata
            .aggregate_remote_health
            .max(child.aggregate_remote_health);
        metadata.aggregate_min_redundancy = combine_min_redundancy(
            metadata.aggregate_min_redundancy,
            child.aggregate_min_redundancy,
        );
        metadata.aggregate_mod_time =
            max_time(metadata.aggregate_mod_time, child.aggregate_mod_time);
        metadata.aggregate_last_health_check_time = min_time(
            metadata.aggregate_last_health_check_time,
            child.aggregate_last_health_check_time,
        );
        metadata.aggregate_num_files += child.aggregate_num_files;
        metadata.aggregate_num_stuck_chunks += child.aggregate_num_stuck_chunks;
        // Each child counts itself on top of its own roll-up.
        metadata.aggregate_num_sub_dirs += child.aggregate_num_sub_dirs + 1;
        metadata.aggregate_size += child.aggregate_size;
        metadata.aggregate_repair_size += child.aggregate_repair_size;
        metadata.aggregate_stuck_size += child.aggregate_stuck_size;
        metadata.aggregate_skynet_files += child.aggregate_skynet_files;
        metadata.aggregate_skynet_size += child.aggregate_skynet_size;
    }

    Ok(DirCalculation {
        metadata,
        files,
        stale_children,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::mem::MemFileStore;
    use crate::fs::{ErasureCoderKind, ErasureSpec, FileNode, FileStore};

    fn spec() -> ErasureSpec {
        ErasureSpec {
            kind: ErasureCoderKind::ReedSolomonSubShards64,
            data_pieces: 1,
            parity_pieces: 9,
        }
    }

    fn path(s: &str) -> RenterPath {
        RenterPath::new(s).unwrap()
    }

    fn store() -> (Arc<dyn FileStore>, Arc<MemFileStore>) {
        let mem = Arc::new(MemFileStore::new());
        (mem.clone() as Arc<dyn FileStore>, mem)
    }

    #[test]
    fn empty_directory_resets_to_defaults() {
        let (fs, _) = store();
        fs.new_dir(&path("d")).unwrap();
        let calc = calculate_dir_metadata(&fs, &path("d"), SystemTime::now()).unwrap();
        assert_eq!(calc.metadata.health, 0.0);
        assert_eq!(calc.metadata.num_files, 0);
        assert_eq!(calc.metadata.aggregate_num_sub_dirs, 0);
        assert!(calc.files.is_empty());
    }

    #[test]
    fn file_health_dominates() {
        let (fs, mem) = store();
        fs.new_file(&path("d/a"), spec(), vec![1; 100]).unwrap();
        fs.new_file(&path("d/b"), spec(), vec![2; 50]).unwrap();
        mem.file(&path("d/a")).unwrap().set_health(2.5, 0.0, 1.5);
        mem.file(&path("d/b")).unwrap().set_health(0.5, 3.0, 2.0);

        let calc = calculate_dir_metadata(&fs, &path("d"), SystemTime::now()).unwrap();
        assert_eq!(calc.metadata.health, 2.5);
        assert_eq!(calc.metadata.stuck_health, 3.0);
        assert_eq!(calc.metadata.min_redundancy, 1.5);
        assert_eq!(calc.metadata.num_files, 2);
        assert_eq!(calc.metadata.size, 150);
        assert_eq!(calc.metadata.aggregate_health, 2.5);
    }

    #[test]
    fn subdir_aggregates_roll_up() {
        let (fs, _) = store();
        fs.new_dir(&path("d/sub")).unwrap();
        let sub = fs.open_dir(&path("d/sub")).unwrap();
        let mut sub_md = DirMetadata {
            aggregate_health: 4.0,
            aggregate_num_files: 7,
            aggregate_num_sub_dirs: 2,
            aggregate_size: 1000,
            aggregate_num_stuck_chunks: 3,
            ..DirMetadata::default()
        };
        sub_md.aggregate_last_health_check_time = SystemTime::now();
        sub.update_metadata(sub_md).unwrap();

        let calc = calculate_dir_metadata(&fs, &path("d"), SystemTime::now()).unwrap();
        assert_eq!(calc.metadata.aggregate_health, 4.0);
        assert_eq!(calc.metadata.aggregate_num_files, 7);
        // The child counts itself on top of its own two subdirectories.
        assert_eq!(calc.metadata.aggregate_num_sub_dirs, 3);
        assert_eq!(calc.metadata.aggregate_size, 1000);
        assert_eq!(calc.metadata.aggregate_num_stuck_chunks, 3);
        assert!(calc.stale_children.is_empty());
    }

    #[test]
    fn never_checked_child_is_reported_stale() {
        let (fs, _) = store();
        fs.new_dir(&path("d/fresh")).unwrap();
        let calc = calculate_dir_metadata(&fs, &path("d"), SystemTime::now()).unwrap();
        assert_eq!(calc.stale_children, vec![path("d/fresh")]);
        assert_eq!(
            calc.metadata.aggregate_last_health_check_time,
            SystemTime::UNIX_EPOCH
        );
    }

    #[test]
    fn skynet_counting_rules() {
        let (fs, mem) = store();
        // A file under the blob tree counts by location.
        fs.new_file(&path("var/skynet/blob"), spec(), vec![0; 10])
            .unwrap();
        // A user file with a skylink counts by reference.
        fs.new_file(&path("home/user/linked"), spec(), vec![0; 20])
            .unwrap();
        mem.file(&path("home/user/linked"))
            .unwrap()
            .add_skylink("AAA".repeat(15) + "A");
        // An extended companion contributes bytes, not a file count.
        fs.new_file(&path("var/skynet/blob.extended"), spec(), vec![0; 5])
            .unwrap();
        // A plain user file counts for neither.
        fs.new_file(&path("home/user/plain"), spec(), vec![0; 40])
            .unwrap();

        let now = SystemTime::now();
        let skynet = calculate_dir_metadata(&fs, &path("var/skynet"), now).unwrap();
        assert_eq!(skynet.metadata.skynet_files, 1);
        assert_eq!(skynet.metadata.skynet_size, 15);

        let user = calculate_dir_metadata(&fs, &path("home/user"), now).unwrap();
        assert_eq!(user.metadata.skynet_files, 1);
        assert_eq!(user.metadata.skynet_size, 20);
        assert_eq!(user.metadata.num_files, 2);
    }

    #[test]
    fn dir_with_only_subdirs_keeps_persisted_health() {
        let (fs, _) = store();
        fs.new_dir(&path("d/sub")).unwrap();
        let dir = fs.open_dir(&path("d")).unwrap();
        dir.update_metadata(DirMetadata {
            health: 1.0,
            stuck_health: 0.5,
            ..DirMetadata::default()
        })
        .unwrap();
        let calc = calculate_dir_metadata(&fs, &path("d"), SystemTime::now()).unwrap();
        assert_eq!(calc.metadata.health, 1.0);
        assert_eq!(calc.metadata.stuck_health, 0.5);
    }

    #[test]
    fn redundancy_sentinel_combines() {
        assert_eq!(combine_min_redundancy(UNSET_REDUNDANCY, 2.0), 2.0);
        assert_eq!(combine_min_redundancy(2.0, UNSET_REDUNDANCY), 2.0);
        assert_eq!(combine_min_redundancy(2.0, 1.0), 1.0);
        assert_eq!(
            combine_min_redundancy(UNSET_REDUNDANCY, UNSET_REDUNDANCY),
            UNSET_REDUNDANCY
        );
    }
}
