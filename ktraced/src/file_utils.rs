use std::fs;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use log::{info, warn};

use crate::types::{TraceFileInfo, TraceKind};

pub const TRACE_FILE_SUFFIX: &str = ".sys";
pub const SAVED_EVENTS_FORMAT: &str = "saved_events_format";

/// Extended attribute marking a snapshot as pinned against ageing.
pub const PIN_ATTR_NAME: &str = "user.linknum";

pub fn trace_file_prefix(kind: TraceKind) -> &'static str {
    match kind {
        TraceKind::Snapshot => "trace_",
        TraceKind::Recording => "record_trace_",
        TraceKind::Cache => "cache_trace_",
    }
}

/// Boot clock in nanoseconds; monotonic across suspend. All intra-file
/// ordering and pipe timeouts use this base.
pub fn boot_time_ns() -> u64 {
    match nix::time::clock_gettime(nix::time::ClockId::CLOCK_BOOTTIME) {
        Ok(ts) => ts.tv_sec() as u64 * 1_000_000_000 + ts.tv_nsec() as u64,
        Err(_) => 0,
    }
}

/// Wall clock, unix milliseconds. Only used for filename rendering and
/// clock-sync markers.
pub fn unix_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Project a boot-clock timestamp onto the unix timeline, milliseconds.
pub fn boot_ns_to_unix_ms(ts_ns: u64) -> u64 {
    let behind_ms = boot_time_ns().saturating_sub(ts_ns) / 1_000_000;
    unix_time_ms().saturating_sub(behind_ms)
}

/// eg: /var/log/ktrace/trace_20250801120000@1234-56789.sys
pub fn generate_trace_file_name(dir: &Path, kind: TraceKind) -> PathBuf {
    let local = chrono::Local::now().format("%Y%m%d%H%M%S");
    let boot_ns = boot_time_ns();
    let name = format!(
        "{}{}@{}-{}{}",
        trace_file_prefix(kind),
        local,
        boot_ns / 1_000_000_000,
        boot_ns % 1_000_000_000,
        TRACE_FILE_SUFFIX
    );
    dir.join(name)
}

/// Rename a finished cache file so the slice duration (ms) is visible in
/// the name: cache_trace_...@boot-nanos-<duration_ms>.sys
pub fn rename_cache_file(path: &Path, start_ms: u64, end_ms: u64) -> Option<PathBuf> {
    let name = path.file_name()?.to_str()?;
    let stem = name.strip_suffix(TRACE_FILE_SUFFIX)?;
    let duration_ms = end_ms.saturating_sub(start_ms);
    let renamed = path.with_file_name(format!("{stem}-{duration_ms}{TRACE_FILE_SUFFIX}"));
    match fs::rename(path, &renamed) {
        Ok(()) => Some(renamed),
        Err(err) => {
            warn!("[files] rename {} failed: {err}", path.display());
            None
        }
    }
}

pub fn file_size(path: &Path) -> u64 {
    fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

/// A non-empty pin attribute protects a snapshot from ageing.
pub fn is_pinned(path: &Path) -> bool {
    matches!(xattr::get(path, PIN_ATTR_NAME), Ok(Some(value)) if !value.is_empty())
}

/// All on-disk files of the given kind, oldest first.
pub fn scan_trace_files(dir: &Path, kind: TraceKind) -> Vec<TraceFileInfo> {
    let prefix = trace_file_prefix(kind);
    let mut entries: Vec<(SystemTime, PathBuf, u64)> = Vec::new();
    for entry in walkdir::WalkDir::new(dir)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
    {
        let name = entry.file_name().to_string_lossy().to_string();
        if !matches_kind(&name, kind, prefix) {
            continue;
        }
        if let Ok(meta) = entry.metadata() {
            let mtime = meta.modified().unwrap_or(UNIX_EPOCH);
            entries.push((mtime, entry.path().to_path_buf(), meta.len()));
        }
    }
    entries.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
    entries
        .into_iter()
        .map(|(_, path, size)| {
            let pinned = kind == TraceKind::Snapshot && is_pinned(&path);
            TraceFileInfo {
                pinned,
                is_new: false,
                ..TraceFileInfo::new(path, size)
            }
        })
        .collect()
}

fn matches_kind(name: &str, _kind: TraceKind, prefix: &str) -> bool {
    name.starts_with(prefix) && name.ends_with(TRACE_FILE_SUFFIX)
}

/// Remove one trace file, skipping files another process holds locked.
pub fn remove_trace_file(path: &Path) -> bool {
    let file = match fs::OpenOptions::new().read(true).open(path) {
        Ok(file) => file,
        Err(err) => {
            warn!("[files] open for remove failed {}: {err}", path.display());
            return false;
        }
    };
    let fd = file.as_raw_fd();
    if unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) } < 0 {
        warn!(
            "[files] {} is locked elsewhere, skipping removal",
            path.display()
        );
        return false;
    }
    let removed = match fs::remove_file(path) {
        Ok(()) => {
            info!("[files] removed {}", path.display());
            true
        }
        Err(err) => {
            warn!("[files] remove {} failed: {err}", path.display());
            false
        }
    };
    unsafe { libc::flock(fd, libc::LOCK_UN) };
    removed
}

/// Drop the cached event-format dictionary; the next dump re-reads the
/// kernel descriptors. Called whenever a recording session starts.
pub fn delete_saved_events_format(dir: &Path) {
    let path = dir.join(SAVED_EVENTS_FORMAT);
    if !path.exists() {
        return;
    }
    match fs::remove_file(&path) {
        Ok(()) => info!("[files] deleted {}", path.display()),
        Err(err) => warn!("[files] delete {} failed: {err}", path.display()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn generated_names_carry_prefix_and_suffix() {
        let dir = tempdir().unwrap();
        for (kind, prefix) in [
            (TraceKind::Snapshot, "trace_"),
            (TraceKind::Recording, "record_trace_"),
            (TraceKind::Cache, "cache_trace_"),
        ] {
            let path = generate_trace_file_name(dir.path(), kind);
            let name = path.file_name().unwrap().to_str().unwrap();
            assert!(name.starts_with(prefix), "{name}");
            assert!(name.ends_with(".sys"), "{name}");
            assert!(name.contains('@'), "{name}");
        }
    }

    #[test]
    fn scan_classifies_kinds_and_sorts_oldest_first() {
        let dir = tempdir().unwrap();
        let snap = dir.path().join("trace_20250101000000@1-0.sys");
        let record = dir.path().join("record_trace_20250101000001@2-0.sys");
        let cache = dir.path().join("cache_trace_20250101000002@3-0.sys");
        for path in [&snap, &record, &cache] {
            fs::write(path, b"x").unwrap();
        }
        fs::write(dir.path().join("unrelated.txt"), b"x").unwrap();

        let snaps = scan_trace_files(dir.path(), TraceKind::Snapshot);
        assert_eq!(snaps.len(), 1);
        assert_eq!(snaps[0].path, snap);
        assert_eq!(scan_trace_files(dir.path(), TraceKind::Recording).len(), 1);
        assert_eq!(scan_trace_files(dir.path(), TraceKind::Cache).len(), 1);
    }

    #[test]
    fn cache_rename_appends_duration() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache_trace_20250101000002@3-0.sys");
        fs::write(&path, b"x").unwrap();
        let renamed = rename_cache_file(&path, 1_000, 11_000).unwrap();
        assert!(renamed
            .file_name()
            .unwrap()
            .to_str()
            .unwrap()
            .ends_with("-10000.sys"));
        assert!(renamed.exists());
        assert!(!path.exists());
    }

    #[test]
    fn remove_and_saved_format_cleanup() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("trace_1@1-0.sys");
        fs::write(&path, b"x").unwrap();
        assert!(remove_trace_file(&path));
        assert!(!path.exists());
        assert!(!remove_trace_file(&path));

        let fmt = dir.path().join(SAVED_EVENTS_FORMAT);
        fs::write(&fmt, b"fmt").unwrap();
        delete_saved_events_format(dir.path());
        assert!(!fmt.exists());
    }
}
