use std::path::PathBuf;

use crate::error::TraceCode;
use crate::types::TraceKind;

/// Fixed wire size of one task record. Stays below PIPE_BUF so a single
/// `write(2)` is atomic and no framing is needed.
pub const TASK_RECORD_SIZE: usize = 320;
const OUTPUT_PATH_BYTES: usize = 256;

const _: () = assert!(TASK_RECORD_SIZE <= libc::PIPE_BUF);

/// Lifecycle of a dump task as it crosses the pipe.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Start = 0,
    /// CPU raw data sits in the output file; trailer still pending.
    ReadDone = 1,
    WaitWrite = 2,
    /// Trailer flushed; the file is complete.
    WriteDone = 3,
    Finish = 4,
    Error = 5,
}

impl TaskStatus {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(TaskStatus::Start),
            1 => Some(TaskStatus::ReadDone),
            2 => Some(TaskStatus::WaitWrite),
            3 => Some(TaskStatus::WriteDone),
            4 => Some(TaskStatus::Finish),
            5 => Some(TaskStatus::Error),
            _ => None,
        }
    }
}

/// One dump request/acknowledgement as carried over the dump pipes.
///
/// Wire layout, little-endian:
/// `u64 time | u8 status | u8 code | 6 pad | 256-byte NUL-padded path |
///  u64 file_size | u64 trace_start_ns | u64 trace_end_ns |
///  u8 kind | 7 pad | u64 file_size_cap | u64 cache_slice_s`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceDumpTask {
    /// Task id: boot-clock ns at submission, unique and monotonically
    /// increasing within a process lifetime.
    pub time: u64,
    pub status: TaskStatus,
    pub code: TraceCode,
    pub output_file: PathBuf,
    pub file_size: u64,
    pub trace_start_ns: u64,
    pub trace_end_ns: u64,
    pub kind: TraceKind,
    /// Max single-file size in bytes; 0 means uncapped.
    pub file_size_cap: u64,
    pub cache_slice_s: u64,
}

impl TraceDumpTask {
    pub fn new(time: u64, kind: TraceKind, output_file: PathBuf) -> Self {
        Self {
            time,
            status: TaskStatus::Start,
            code: TraceCode::Unset,
            output_file,
            file_size: 0,
            trace_start_ns: 0,
            trace_end_ns: u64::MAX,
            kind,
            file_size_cap: 0,
            cache_slice_s: 0,
        }
    }

    pub fn encode(&self) -> [u8; TASK_RECORD_SIZE] {
        let mut buf = [0u8; TASK_RECORD_SIZE];
        buf[0..8].copy_from_slice(&self.time.to_le_bytes());
        buf[8] = self.status as u8;
        buf[9] = self.code as u8;
        // bytes 10..16 reserved

        let path = self.output_file.to_string_lossy();
        let path_bytes = path.as_bytes();
        let n = path_bytes.len().min(OUTPUT_PATH_BYTES - 1);
        buf[16..16 + n].copy_from_slice(&path_bytes[..n]);

        buf[272..280].copy_from_slice(&self.file_size.to_le_bytes());
        buf[280..288].copy_from_slice(&self.trace_start_ns.to_le_bytes());
        buf[288..296].copy_from_slice(&self.trace_end_ns.to_le_bytes());
        buf[296] = self.kind as u8;
        // bytes 297..304 reserved
        buf[304..312].copy_from_slice(&self.file_size_cap.to_le_bytes());
        buf[312..320].copy_from_slice(&self.cache_slice_s.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < TASK_RECORD_SIZE {
            return None;
        }
        let le_u64 =
            |at: usize| u64::from_le_bytes(buf[at..at + 8].try_into().expect("8-byte slice"));
        let path_end = buf[16..16 + OUTPUT_PATH_BYTES]
            .iter()
            .position(|b| *b == 0)
            .map(|p| 16 + p)
            .unwrap_or(16 + OUTPUT_PATH_BYTES);
        let path = String::from_utf8_lossy(&buf[16..path_end]).to_string();
        Some(Self {
            time: le_u64(0),
            status: TaskStatus::from_u8(buf[8])?,
            code: TraceCode::from_u8(buf[9]),
            output_file: PathBuf::from(path),
            file_size: le_u64(272),
            trace_start_ns: le_u64(280),
            trace_end_ns: le_u64(288),
            kind: TraceKind::from_u8(buf[296])?,
            file_size_cap: le_u64(304),
            cache_slice_s: le_u64(312),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> TraceDumpTask {
        TraceDumpTask {
            time: 0x0102_0304_0506_0708,
            status: TaskStatus::ReadDone,
            code: TraceCode::Success,
            output_file: PathBuf::from("/var/log/ktrace/trace_20250801@1-2.sys"),
            file_size: 4096,
            trace_start_ns: 111,
            trace_end_ns: 999,
            kind: TraceKind::Cache,
            file_size_cap: 100 << 20,
            cache_slice_s: 10,
        }
    }

    #[test]
    fn record_round_trips() {
        let task = sample();
        let wire = task.encode();
        let back = TraceDumpTask::decode(&wire).unwrap();
        assert_eq!(back, task);
    }

    #[test]
    fn layout_offsets_are_pinned() {
        let task = sample();
        let wire = task.encode();
        assert_eq!(&wire[0..8], &task.time.to_le_bytes());
        assert_eq!(wire[8], TaskStatus::ReadDone as u8);
        assert_eq!(wire[9], TraceCode::Success as u8);
        assert_eq!(&wire[10..16], &[0u8; 6]);
        assert_eq!(&wire[16..21], b"/var/");
        assert_eq!(&wire[272..280], &4096u64.to_le_bytes());
        assert_eq!(wire[296], TraceKind::Cache as u8);
        assert_eq!(&wire[312..320], &10u64.to_le_bytes());
    }

    #[test]
    fn over_long_paths_are_truncated_not_panicking() {
        let mut task = sample();
        task.output_file = PathBuf::from(format!("/{}", "x".repeat(400)));
        let wire = task.encode();
        let back = TraceDumpTask::decode(&wire).unwrap();
        assert_eq!(back.output_file.to_string_lossy().len(), 255);
    }

    #[test]
    fn garbage_status_is_rejected() {
        let mut wire = sample().encode();
        wire[8] = 42;
        assert!(TraceDumpTask::decode(&wire).is_none());
    }
}
