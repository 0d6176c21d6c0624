use std::collections::HashSet;
use std::path::{Path, PathBuf};

use log::{debug, info};

use crate::config::Config;
use crate::file_utils::{remove_trace_file, scan_trace_files};
use crate::types::{TraceFileInfo, TraceKind};

/// Retention decision makers, evaluated newest-first so the newest files
/// are the ones that survive.
enum AgeingChecker {
    /// Keep at most `max` files.
    Count { max: u64, seen: u64 },
    /// Keep at most `max_kb` KiB in total, but never fewer than
    /// `min_keep` files regardless of size.
    Size {
        max_kb: u64,
        min_keep: u64,
        seen_files: u64,
        seen_kb: u64,
    },
}

impl AgeingChecker {
    /// Resolve the configured checker for a trace kind. The size cap
    /// wins when both caps are set; root builds may switch ageing off
    /// per kind.
    fn for_kind(config: &Config, kind: TraceKind) -> Option<AgeingChecker> {
        let param = config.ageing_param(kind);
        if config.runtime.root_mode && !param.root_enable {
            return None;
        }
        if kind == TraceKind::Snapshot && !config.snapshot.file_ageing {
            return None;
        }
        if param.max_total_size_kb > 0 {
            return Some(AgeingChecker::Size {
                max_kb: param.max_total_size_kb,
                min_keep: 2,
                seen_files: 0,
                seen_kb: 0,
            });
        }
        if param.max_file_count > 0 {
            return Some(AgeingChecker::Count {
                max: param.max_file_count,
                seen: 0,
            });
        }
        None
    }

    fn should_age(&mut self, info: &TraceFileInfo) -> bool {
        match self {
            AgeingChecker::Count { max, seen } => {
                if *seen >= *max {
                    return true;
                }
                *seen += 1;
                false
            }
            AgeingChecker::Size {
                max_kb,
                min_keep,
                seen_files,
                seen_kb,
            } => {
                if *seen_files < *min_keep {
                    *seen_files += 1;
                    *seen_kb += info.size_bytes / 1024;
                    return false;
                }
                if *seen_kb >= *max_kb {
                    return true;
                }
                *seen_kb += info.size_bytes / 1024;
                false
            }
        }
    }
}

/// Apply the retention policy to the tracked file list and to any
/// untracked (orphan) files on disk with the kind's filename prefix.
/// Pinned snapshots are invisible to the checker and always survive.
pub fn handle_ageing(
    files: &mut Vec<TraceFileInfo>,
    trace_dir: &Path,
    kind: TraceKind,
    config: &Config,
) {
    let Some(mut checker) = AgeingChecker::for_kind(config, kind) else {
        return;
    };

    let mut delete_count = 0u32;
    let mut kept_newest_first: Vec<TraceFileInfo> = Vec::with_capacity(files.len());
    for info in files.iter().rev() {
        if kind == TraceKind::Snapshot && info.pinned {
            kept_newest_first.push(info.clone());
            continue;
        }
        if checker.should_age(info) {
            if remove_trace_file(&info.path) {
                delete_count += 1;
            }
        } else {
            kept_newest_first.push(info.clone());
        }
    }
    kept_newest_first.reverse();
    *files = kept_newest_first;

    // files on disk the executor does not track are fair game too
    let tracked: HashSet<PathBuf> = files.iter().map(|info| info.path.clone()).collect();
    for orphan in scan_trace_files(trace_dir, kind) {
        if tracked.contains(&orphan.path) {
            continue;
        }
        if kind == TraceKind::Snapshot && orphan.pinned {
            debug!("[ageing] orphan {} is pinned, kept", orphan.path.display());
            continue;
        }
        if remove_trace_file(&orphan.path) {
            delete_count += 1;
        }
    }
    info!("[ageing] kind {kind:?}: removed {delete_count} file(s)");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn seed_files(dir: &Path, kind: TraceKind, count: usize, size: usize) -> Vec<TraceFileInfo> {
        let prefix = crate::file_utils::trace_file_prefix(kind);
        (0..count)
            .map(|i| {
                let path = dir.join(format!("{prefix}2025010100000{i}@{i}-0.sys"));
                fs::write(&path, vec![0u8; size]).unwrap();
                TraceFileInfo::new(path, size as u64)
            })
            .collect()
    }

    fn count_config(kind: TraceKind, max: u64) -> Config {
        let mut config = Config::default();
        match kind {
            TraceKind::Snapshot => config.ageing.snapshot.max_file_count = max,
            TraceKind::Recording => config.ageing.recording.max_file_count = max,
            TraceKind::Cache => config.ageing.cache.max_file_count = max,
        }
        config
    }

    #[test]
    fn count_checker_keeps_newest_files() {
        let dir = tempdir().unwrap();
        let mut files = seed_files(dir.path(), TraceKind::Recording, 5, 10);
        let config = count_config(TraceKind::Recording, 3);

        handle_ageing(&mut files, dir.path(), TraceKind::Recording, &config);

        assert_eq!(files.len(), 3);
        let on_disk = scan_trace_files(dir.path(), TraceKind::Recording);
        assert_eq!(on_disk.len(), 3);
        // the two oldest are the ones that went
        assert!(files.iter().all(|f| {
            let name = f.path.file_name().unwrap().to_string_lossy().to_string();
            !name.contains("00000@") && !name.contains("00001@")
        }));
    }

    #[test]
    fn size_checker_wins_over_count_and_keeps_minimum() {
        let dir = tempdir().unwrap();
        // 4 files of 2 KiB each, cap of 1 KiB total: without the
        // minimum-keep rule everything would age
        let mut files = seed_files(dir.path(), TraceKind::Recording, 4, 2048);
        let mut config = count_config(TraceKind::Recording, 1);
        config.ageing.recording.max_total_size_kb = 1;

        handle_ageing(&mut files, dir.path(), TraceKind::Recording, &config);

        assert_eq!(files.len(), 2, "size checker never ages below 2 files");
        assert_eq!(scan_trace_files(dir.path(), TraceKind::Recording).len(), 2);
    }

    #[test]
    fn pinned_snapshots_survive_count_ageing() {
        let dir = tempdir().unwrap();
        let mut files = seed_files(dir.path(), TraceKind::Snapshot, 5, 10);
        // pin the oldest out of band (the scan would read the xattr)
        files[0].pinned = true;
        let config = count_config(TraceKind::Snapshot, 3);

        handle_ageing(&mut files, dir.path(), TraceKind::Snapshot, &config);

        assert_eq!(files.len(), 4, "pinned + 3 newest unpinned");
        assert!(files[0].pinned);
        assert!(files[0].path.exists());
    }

    #[test]
    fn snapshot_ageing_can_be_disabled() {
        let dir = tempdir().unwrap();
        let mut files = seed_files(dir.path(), TraceKind::Snapshot, 5, 10);
        let mut config = count_config(TraceKind::Snapshot, 2);
        config.snapshot.file_ageing = false;

        handle_ageing(&mut files, dir.path(), TraceKind::Snapshot, &config);
        assert_eq!(files.len(), 5);
    }

    #[test]
    fn root_mode_override_disables_ageing() {
        let dir = tempdir().unwrap();
        let mut files = seed_files(dir.path(), TraceKind::Recording, 4, 10);
        let mut config = count_config(TraceKind::Recording, 1);
        config.runtime.root_mode = true;
        config.ageing.recording.root_enable = false;

        handle_ageing(&mut files, dir.path(), TraceKind::Recording, &config);
        assert_eq!(files.len(), 4);
    }

    #[test]
    fn orphans_on_disk_are_swept() {
        let dir = tempdir().unwrap();
        let mut files = seed_files(dir.path(), TraceKind::Recording, 2, 10);
        // an untracked file of the same kind
        let orphan = dir.path().join("record_trace_20240101000000@99-0.sys");
        fs::write(&orphan, b"stale").unwrap();
        let config = count_config(TraceKind::Recording, 10);

        handle_ageing(&mut files, dir.path(), TraceKind::Recording, &config);

        assert_eq!(files.len(), 2);
        assert!(!orphan.exists(), "orphan removed");
        assert!(files.iter().all(|f| f.path.exists()));
    }
}
