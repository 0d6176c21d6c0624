use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use anyhow::Context;
use log::{debug, warn};
use once_cell::sync::OnceCell;

use crate::config::TraceTag;
use crate::error::{node_write_error, TraceCode, TraceError, TraceResult};
use crate::file_utils::unix_time_ms;

/// One ring-buffer page as handed out by `trace_pipe_raw`. The first 8
/// bytes are a little-endian boot-clock nanosecond timestamp.
pub const PAGE_SIZE: usize = 4096;

const TRACEFS_CANDIDATES: [&str; 2] = ["/sys/kernel/tracing", "/sys/kernel/debug/tracing"];

static DETECTED_ROOT: OnceCell<Option<PathBuf>> = OnceCell::new();

/// Outcome of one page read from a per-CPU raw pipe.
#[derive(Debug)]
pub enum PageRead {
    /// One page worth of data, `n` bytes filled.
    Page(usize),
    /// Pipe open but no page ready (non-blocking read).
    Again,
    /// Kernel closed the pipe.
    Eof,
}

/// The sole concentrator of kernel-tracing file-system I/O. Stateless
/// apart from the resolved root directory.
#[derive(Debug, Clone)]
pub struct TraceFs {
    root: PathBuf,
}

impl TraceFs {
    /// Auto-detect the mounted tracefs root; the result is cached
    /// process-wide.
    pub fn detect() -> TraceResult<Self> {
        let root = DETECTED_ROOT.get_or_init(|| {
            TRACEFS_CANDIDATES
                .iter()
                .map(PathBuf::from)
                .find(|p| p.join("trace_marker").exists())
        });
        match root {
            Some(root) => Ok(Self { root: root.clone() }),
            None => Err(TraceError::new(
                TraceCode::TraceNotSupported,
                "tracefs is not mounted",
            )),
        }
    }

    /// Use an explicit root, bypassing detection. Tests and the worker's
    /// `--tracefs` override go through here.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// CPU indices that expose a raw pipe under `per_cpu/`.
    pub fn online_cpus(&self) -> Vec<u32> {
        let mut cpus = Vec::new();
        if let Ok(entries) = fs::read_dir(self.root.join("per_cpu")) {
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().to_string();
                if let Some(idx) = name.strip_prefix("cpu").and_then(|s| s.parse::<u32>().ok()) {
                    cpus.push(idx);
                }
            }
        }
        cpus.sort_unstable();
        cpus
    }

    /// Open the per-CPU raw binary pipe in non-blocking mode.
    pub fn open_cpu_raw(&self, cpu: u32) -> std::io::Result<File> {
        OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(self.root.join(format!("per_cpu/cpu{cpu}/trace_pipe_raw")))
    }

    /// Read exactly one page worth of data when available.
    pub fn read_page(reader: &mut File, buf: &mut [u8; PAGE_SIZE]) -> std::io::Result<PageRead> {
        loop {
            match reader.read(buf) {
                Ok(0) => return Ok(PageRead::Eof),
                Ok(n) => return Ok(PageRead::Page(n)),
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    return Ok(PageRead::Again)
                }
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
    }

    /// Boot-clock nanosecond timestamp in a page header.
    pub fn page_timestamp(page: &[u8]) -> u64 {
        let mut ts = [0u8; 8];
        ts.copy_from_slice(&page[..8]);
        u64::from_le_bytes(ts)
    }

    /// Read a small metadata pseudo-file fully into memory.
    pub fn read_text(&self, relative: &str) -> anyhow::Result<String> {
        let path = self.root.join(relative);
        fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))
    }

    /// Device identity and kernel build info for the base-info section.
    pub fn base_info(&self) -> String {
        let mut pairs: BTreeMap<&str, String> = BTreeMap::new();
        pairs.insert(
            "KERNEL_VERSION",
            fs::read_to_string("/proc/version")
                .unwrap_or_default()
                .trim()
                .to_string(),
        );
        pairs.insert(
            "OS_RELEASE",
            fs::read_to_string("/proc/sys/kernel/osrelease")
                .unwrap_or_default()
                .trim()
                .to_string(),
        );
        pairs.insert(
            "TRACE_CLOCK",
            self.read_text("trace_clock").unwrap_or_default().trim().to_string(),
        );
        pairs.insert("NR_CPUS", self.online_cpus().len().to_string());
        let mut out = String::new();
        for (key, value) in pairs {
            out.push_str(key);
            out.push_str(": ");
            out.push_str(&value);
            out.push('\n');
        }
        out
    }

    /// Emit the wall-clock and monotonic sync points into the trace
    /// stream. The downstream parser aligns time bases on these lines;
    /// always written right before a read loop begins.
    pub fn mark_clock_sync(&self) -> TraceResult<()> {
        let realtime = format!("trace_event_clock_sync: realtime_ts={}", unix_time_ms());
        self.write_node("trace_marker", &realtime)?;

        let mono = nix::time::clock_gettime(nix::time::ClockId::CLOCK_MONOTONIC)
            .map(|ts| (ts.tv_sec(), ts.tv_nsec() / 1_000))
            .unwrap_or((0, 0));
        let parent = format!("trace_event_clock_sync: parent_ts={}.{:06}", mono.0, mono.1);
        self.write_node("trace_marker", &parent)
    }

    pub fn set_tracing_on(&self, enable: bool) -> TraceResult<()> {
        self.write_node("tracing_on", if enable { "1" } else { "0" })
    }

    pub fn tracing_on(&self) -> bool {
        self.read_text("tracing_on")
            .map(|v| v.trim() == "1")
            .unwrap_or(false)
    }

    /// Resize the kernel ring buffer. Values are rounded down to whole
    /// pages before hitting the kernel.
    pub fn set_buffer_size_kb(&self, size_kb: u64) -> TraceResult<()> {
        let page_kb = (PAGE_SIZE / 1024) as u64;
        let rounded = size_kb / page_kb * page_kb;
        self.write_node("buffer_size_kb", &rounded.to_string())
    }

    pub fn set_clock(&self, clock: &str) -> TraceResult<()> {
        // the kernel reports the active clock bracketed, eg "[boot] mono"
        if let Ok(current) = self.read_text("trace_clock") {
            if current.contains(&format!("[{clock}]")) {
                return Ok(());
            }
        }
        self.write_node("trace_clock", clock)
    }

    /// Event latency threshold, microseconds.
    pub fn set_level_threshold(&self, threshold_us: u64) -> TraceResult<()> {
        self.write_node("tracing_thresh", &threshold_us.to_string())
    }

    /// Whether the ring buffer overwrites oldest pages when full.
    pub fn set_overwrite(&self, overwrite: bool) -> TraceResult<()> {
        self.write_node("options/overwrite", if overwrite { "1" } else { "0" })
    }

    /// Toggle every catalog tag according to the enable mask. A missing
    /// enable node is logged and skipped; the per-tag failure does not
    /// abort the walk.
    pub fn apply_tag_enable_bits(
        &self,
        bits: u64,
        catalog: &BTreeMap<String, TraceTag>,
    ) -> TraceResult<()> {
        for (name, tag) in catalog {
            let on = bits & (1u64 << tag.bit) != 0;
            for node in &tag.enable_paths {
                if let Err(err) = self.write_node(node, if on { "1" } else { "0" }) {
                    debug!("[tracefs] tag {name}: {err}");
                }
            }
        }
        Ok(())
    }

    /// Whether a tag is currently switched on in the kernel, judged by
    /// its first enable node. Lets the out-of-process worker recover the
    /// enabled set without sharing controller state.
    pub fn tag_is_enabled(&self, tag: &TraceTag) -> bool {
        tag.enable_paths.first().is_some_and(|node| {
            self.read_text(node)
                .map(|v| v.trim_start().starts_with('1'))
                .unwrap_or(false)
        })
    }

    fn write_node(&self, relative: &str, value: &str) -> TraceResult<()> {
        let path = self.root.join(relative);
        let mut file = OpenOptions::new().write(true).open(&path).map_err(|err| {
            if !self.root.exists() {
                TraceError::new(TraceCode::TraceNotSupported, "tracefs root vanished")
            } else {
                node_write_error(&path, &err)
            }
        })?;
        file.write_all(value.as_bytes())
            .map_err(|err| node_write_error(&path, &err))?;
        Ok(())
    }
}

/// Warn-only wrapper for control writes that are best-effort.
pub fn write_or_warn(result: TraceResult<()>, what: &str) {
    if let Err(err) = result {
        warn!("[tracefs] {what}: {err}");
    }
}
