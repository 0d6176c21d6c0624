use std::path::PathBuf;

use crate::error::TraceCode;

/// Capture mode of a dump. The numeric values travel inside the wire
/// record and classify output filenames.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TraceKind {
    Snapshot = 0,
    Recording = 1,
    Cache = 2,
}

impl TraceKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(TraceKind::Snapshot),
            1 => Some(TraceKind::Recording),
            2 => Some(TraceKind::Cache),
            _ => None,
        }
    }
}

/// Engine mode bitmask reported by `get_trace_mode`.
pub mod trace_mode {
    pub const CLOSE: u8 = 0;
    pub const OPEN: u8 = 1 << 0;
    pub const RECORD: u8 = 1 << 1;
    pub const CACHE: u8 = 1 << 2;
}

/// Per-request dump parameters handed to the executor.
#[derive(Debug, Clone)]
pub struct TraceDumpParam {
    pub kind: TraceKind,
    /// Explicit output path; a fresh name is generated when empty.
    pub output_file: Option<PathBuf>,
    /// Retention cap on the number of output files (recording).
    pub file_limit: u32,
    /// Per-file size cap in KiB; 0 means the configured default.
    pub file_size_kb: u64,
    /// Trace window, boot-clock nanoseconds.
    pub trace_start_ns: u64,
    pub trace_end_ns: u64,
}

impl TraceDumpParam {
    pub fn snapshot() -> Self {
        Self {
            kind: TraceKind::Snapshot,
            output_file: None,
            file_limit: 0,
            file_size_kb: 0,
            trace_start_ns: 0,
            trace_end_ns: u64::MAX,
        }
    }
}

/// Parameters of one strategy iteration.
#[derive(Debug, Clone)]
pub struct TraceDumpRequest {
    pub kind: TraceKind,
    /// Max single-file size in bytes; only enforced when `limit_file_size`.
    pub file_size_limit: u64,
    pub limit_file_size: bool,
    pub trace_start_ns: u64,
    pub trace_end_ns: u64,
    /// Cache mode only: seconds of trace per output file.
    pub cache_slice_duration_s: u64,
}

/// Outcome of one dump, observable by callers and over the pipe.
#[derive(Debug, Clone)]
pub struct TraceDumpResult {
    pub code: TraceCode,
    pub output_file: PathBuf,
    pub file_size: u64,
    pub trace_start_ns: u64,
    pub trace_end_ns: u64,
}

impl TraceDumpResult {
    pub fn error(code: TraceCode) -> Self {
        Self {
            code,
            output_file: PathBuf::new(),
            file_size: 0,
            trace_start_ns: 0,
            trace_end_ns: 0,
        }
    }
}

/// Aggregate return of a control-surface call.
#[derive(Debug, Clone)]
pub struct TraceRetInfo {
    pub code: TraceCode,
    pub output_files: Vec<PathBuf>,
    pub file_size: u64,
    pub trace_start_ns: u64,
    pub trace_end_ns: u64,
}

impl TraceRetInfo {
    pub fn error(code: TraceCode) -> Self {
        Self {
            code,
            output_files: Vec::new(),
            file_size: 0,
            trace_start_ns: 0,
            trace_end_ns: 0,
        }
    }
}

/// Bookkeeping entry for one on-disk trace file.
#[derive(Debug, Clone)]
pub struct TraceFileInfo {
    pub path: PathBuf,
    /// Trace window covered by the file, unix milliseconds.
    pub trace_start_ms: u64,
    pub trace_end_ms: u64,
    pub size_bytes: u64,
    /// Created by the current capture session (reported on stop).
    pub is_new: bool,
    /// Snapshot only: protected from ageing via the pin attribute.
    pub pinned: bool,
}

impl TraceFileInfo {
    pub fn new(path: PathBuf, size_bytes: u64) -> Self {
        Self {
            path,
            trace_start_ms: 0,
            trace_end_ms: 0,
            size_bytes,
            is_new: true,
            pinned: false,
        }
    }
}
