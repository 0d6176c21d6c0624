use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};

use crate::config::TraceTag;
use crate::error::{TraceCode, TraceError, TraceResult};
use crate::file_utils::SAVED_EVENTS_FORMAT;
use crate::tracefs::TraceFs;

/// First bytes of every container file.
pub const TRACE_FILE_MAGIC: [u8; 8] = *b"KTRACE01";
/// Magic + 4 reserved bytes + the fixed 20-byte CPU-frequency table.
pub const FILE_HEADER_BYTES: usize = 8 + 4 + CPU_FREQ_TABLE_BYTES;
pub const CPU_FREQ_TABLE_BYTES: usize = 20;
/// 4-byte cpu id + 4-byte frequency state per slot.
const CPU_FREQ_SLOT_BYTES: usize = 8;

/// Section type tags; stable, observable to downstream parsers.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionType {
    BaseInfo = 0x01,
    EventFormats = 0x02,
    CpuRaw = 0x03,
    CmdLines = 0x04,
    Tgids = 0x05,
    HeaderPage = 0x06,
    PrintkFormats = 0x07,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuFreqEntry {
    pub cpu: u32,
    pub freq_khz: u32,
}

/// Sample current core frequencies from procfs. Best effort: a core
/// without a readable frequency reports zero.
pub fn sample_cpu_frequencies() -> Vec<CpuFreqEntry> {
    use procfs::prelude::*;
    match procfs::CpuInfo::current() {
        Ok(info) => (0..info.num_cores())
            .map(|idx| {
                let mhz = info
                    .get_field(idx, "cpu MHz")
                    .and_then(|raw| raw.trim().parse::<f64>().ok())
                    .unwrap_or(0.0);
                CpuFreqEntry {
                    cpu: idx as u32,
                    freq_khz: (mhz * 1000.0) as u32,
                }
            })
            .collect(),
        Err(err) => {
            debug!("[container] cpuinfo unavailable: {err}");
            Vec::new()
        }
    }
}

/// Serializes the on-disk trace container and enforces its layout.
///
/// A file is `[header][typed sections]*`; all integers little-endian.
/// Text sections are `u8 tag | u64 len | payload`; CPU raw segments are
/// `u8 tag | u32 cpu | u64 len | pages`.
pub struct ContainerWriter {
    file: File,
    path: PathBuf,
    written: u64,
    size_cap: Option<u64>,
    overflow: bool,
}

impl ContainerWriter {
    pub fn create(path: &Path, size_cap: Option<u64>) -> TraceResult<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|err| {
                TraceError::new(
                    TraceCode::FileError,
                    format!("open {} failed: {err}", path.display()),
                )
            })?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
            written: 0,
            size_cap,
            overflow: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    pub fn is_overflow(&self) -> bool {
        self.overflow
    }

    /// Write (or rewrite, on a file roll) the file header. The frequency
    /// table is refreshed on every call; it is truncated or zero-padded
    /// to its fixed 20 bytes.
    pub fn write_file_header(&mut self, freqs: &[CpuFreqEntry]) -> TraceResult<()> {
        let mut header = Vec::with_capacity(FILE_HEADER_BYTES);
        header.extend_from_slice(&TRACE_FILE_MAGIC);
        header.extend_from_slice(&0u32.to_le_bytes());
        let mut table = [0u8; CPU_FREQ_TABLE_BYTES];
        for (slot, entry) in freqs
            .iter()
            .take(CPU_FREQ_TABLE_BYTES / CPU_FREQ_SLOT_BYTES)
            .enumerate()
        {
            let at = slot * CPU_FREQ_SLOT_BYTES;
            table[at..at + 4].copy_from_slice(&entry.cpu.to_le_bytes());
            table[at + 4..at + 8].copy_from_slice(&entry.freq_khz.to_le_bytes());
        }
        header.extend_from_slice(&table);
        self.write_all(&header)
    }

    /// Append one text-payload section.
    pub fn write_section(&mut self, section: SectionType, payload: &[u8]) -> TraceResult<()> {
        debug_assert_ne!(section, SectionType::CpuRaw);
        let mut frame = Vec::with_capacity(1 + 8 + payload.len());
        frame.push(section as u8);
        frame.extend_from_slice(&(payload.len() as u64).to_le_bytes());
        frame.extend_from_slice(payload);
        self.write_all(&frame)
    }

    /// Append one per-CPU raw segment from the chunks produced by the
    /// reader. Returns `false` without writing when the segment would
    /// push the file past its size cap; the caller decides whether to
    /// roll or finalize.
    pub fn write_cpu_segment(&mut self, cpu: u32, chunks: &[&[u8]]) -> TraceResult<bool> {
        let payload_len: u64 = chunks.iter().map(|c| c.len() as u64).sum();
        if payload_len == 0 {
            return Ok(true);
        }
        let frame_len = 1 + 4 + 8 + payload_len;
        if let Some(cap) = self.size_cap {
            if self.written + frame_len > cap {
                self.overflow = true;
                info!(
                    "[container] {}: size cap {cap} reached at {} bytes",
                    self.path.display(),
                    self.written
                );
                return Ok(false);
            }
        }
        let mut head = Vec::with_capacity(13);
        head.push(SectionType::CpuRaw as u8);
        head.extend_from_slice(&cpu.to_le_bytes());
        head.extend_from_slice(&payload_len.to_le_bytes());
        self.write_all(&head)?;
        for chunk in chunks {
            self.write_all(chunk)?;
        }
        Ok(true)
    }

    pub fn flush(&mut self) -> TraceResult<()> {
        self.file.flush().map_err(|err| {
            TraceError::new(
                TraceCode::FileError,
                format!("flush {} failed: {err}", self.path.display()),
            )
        })
    }

    fn write_all(&mut self, bytes: &[u8]) -> TraceResult<()> {
        self.file.write_all(bytes).map_err(|err| {
            TraceError::new(
                TraceCode::FileError,
                format!("write {} failed: {err}", self.path.display()),
            )
        })?;
        self.written += bytes.len() as u64;
        Ok(())
    }
}

/// Event-format dictionary for the enabled tags, cached between dumps.
///
/// The first dump of a session reads every `format` descriptor out of
/// the kernel and mirrors the concatenation into `saved_events_format`
/// under the trace directory; later dumps reuse the side-file as long as
/// the tag set is unchanged (a recording start deletes it).
pub fn event_format_dictionary(
    fs_: &TraceFs,
    trace_dir: &Path,
    enabled: &[&TraceTag],
    base_paths: &[String],
) -> String {
    let saved = trace_dir.join(SAVED_EVENTS_FORMAT);
    if let Ok(cached) = fs::read_to_string(&saved) {
        if !cached.is_empty() {
            return cached;
        }
    }

    let mut dictionary = String::new();
    for node in base_paths {
        append_format(fs_, node, &mut dictionary);
    }
    for tag in enabled {
        for node in &tag.format_paths {
            append_format(fs_, node, &mut dictionary);
        }
    }
    if let Err(err) = fs::write(&saved, &dictionary) {
        warn!("[container] cache {} failed: {err}", saved.display());
    }
    dictionary
}

fn append_format(fs_: &TraceFs, node: &str, out: &mut String) {
    match fs_.read_text(node) {
        Ok(text) => {
            out.push_str(&text);
            if !text.ends_with('\n') {
                out.push('\n');
            }
        }
        Err(err) => debug!("[container] format {node} unreadable: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    /// Minimal parser mirroring the documented layout; used to prove
    /// round-trips.
    fn parse(bytes: &[u8]) -> (Vec<CpuFreqEntry>, Vec<(u8, Option<u32>, Vec<u8>)>) {
        assert_eq!(&bytes[..8], &TRACE_FILE_MAGIC);
        let mut freqs = Vec::new();
        for slot in 0..CPU_FREQ_TABLE_BYTES / CPU_FREQ_SLOT_BYTES {
            let at = 12 + slot * CPU_FREQ_SLOT_BYTES;
            let cpu = u32::from_le_bytes(bytes[at..at + 4].try_into().unwrap());
            let khz = u32::from_le_bytes(bytes[at + 4..at + 8].try_into().unwrap());
            freqs.push(CpuFreqEntry { cpu, freq_khz: khz });
        }
        let mut sections = Vec::new();
        let mut at = FILE_HEADER_BYTES;
        while at < bytes.len() {
            let tag = bytes[at];
            at += 1;
            if tag == SectionType::CpuRaw as u8 {
                let cpu = u32::from_le_bytes(bytes[at..at + 4].try_into().unwrap());
                let len = u64::from_le_bytes(bytes[at + 4..at + 12].try_into().unwrap()) as usize;
                at += 12;
                sections.push((tag, Some(cpu), bytes[at..at + len].to_vec()));
                at += len;
            } else {
                let len = u64::from_le_bytes(bytes[at..at + 8].try_into().unwrap()) as usize;
                at += 8;
                sections.push((tag, None, bytes[at..at + len].to_vec()));
                at += len;
            }
        }
        (freqs, sections)
    }

    #[test]
    fn container_round_trips_through_a_layout_parser() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("trace_1@1-0.sys");
        let mut writer = ContainerWriter::create(&path, None).unwrap();
        writer
            .write_file_header(&[
                CpuFreqEntry { cpu: 0, freq_khz: 1_800_000 },
                CpuFreqEntry { cpu: 1, freq_khz: 2_400_000 },
                CpuFreqEntry { cpu: 2, freq_khz: 2_400_000 }, // truncated
            ])
            .unwrap();
        writer
            .write_section(SectionType::BaseInfo, b"KERNEL_VERSION: test\n")
            .unwrap();
        let mut page_a = vec![0u8; 64];
        page_a[..8].copy_from_slice(&100u64.to_le_bytes());
        let mut page_b = vec![0u8; 64];
        page_b[..8].copy_from_slice(&200u64.to_le_bytes());
        assert!(writer
            .write_cpu_segment(0, &[page_a.as_slice(), page_b.as_slice()])
            .unwrap());
        assert!(writer.write_cpu_segment(1, &[page_b.as_slice()]).unwrap());
        writer
            .write_section(SectionType::CmdLines, b"1 init\n")
            .unwrap();
        writer.flush().unwrap();

        let bytes = fs::read(&path).unwrap();
        assert_eq!(bytes.len() as u64, writer.bytes_written());
        let (freqs, sections) = parse(&bytes);
        assert_eq!(freqs[0].freq_khz, 1_800_000);
        assert_eq!(freqs[1].cpu, 1);
        assert_eq!(sections.len(), 4);
        assert_eq!(sections[0].0, SectionType::BaseInfo as u8);
        assert_eq!(sections[1], (0x03, Some(0), [page_a.clone(), page_b.clone()].concat()));
        assert_eq!(sections[2], (0x03, Some(1), page_b.clone()));
        assert_eq!(sections[3].2, b"1 init\n".to_vec());
    }

    #[test]
    fn size_cap_stops_cpu_raw_and_reports_overflow() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("record_trace_1@1-0.sys");
        let mut writer = ContainerWriter::create(&path, Some(64)).unwrap();
        writer.write_file_header(&[]).unwrap();
        let page = vec![0u8; 128];
        assert!(!writer.write_cpu_segment(0, &[page.as_slice()]).unwrap());
        assert!(writer.is_overflow());
        // nothing of the refused segment hit the disk
        assert_eq!(writer.bytes_written(), FILE_HEADER_BYTES as u64);
    }

    #[test]
    fn empty_cpu_segment_is_elided() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("trace_2@1-0.sys");
        let mut writer = ContainerWriter::create(&path, None).unwrap();
        writer.write_file_header(&[]).unwrap();
        assert!(writer.write_cpu_segment(5, &[]).unwrap());
        assert_eq!(writer.bytes_written(), FILE_HEADER_BYTES as u64);
    }

    #[test]
    fn format_dictionary_uses_and_refreshes_side_file() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("tracefs");
        fs::create_dir_all(root.join("events/sched/sched_switch")).unwrap();
        fs::write(root.join("events/sched/sched_switch/format"), "name: sched_switch\n").unwrap();
        let fs_ = TraceFs::with_root(&root);

        let tag = TraceTag {
            description: String::new(),
            bit: 0,
            kind: crate::config::TagKind::Kernel,
            enable_paths: vec![],
            format_paths: vec!["events/sched/sched_switch/format".to_string()],
        };
        let trace_dir = dir.path().join("out");
        fs::create_dir_all(&trace_dir).unwrap();

        let dict = event_format_dictionary(&fs_, &trace_dir, &[&tag], &[]);
        assert!(dict.contains("sched_switch"));
        assert!(trace_dir.join(SAVED_EVENTS_FORMAT).exists());

        // second call is served from the side-file even if the kernel
        // descriptor vanished meanwhile
        fs::remove_file(root.join("events/sched/sched_switch/format")).unwrap();
        let cached = event_format_dictionary(&fs_, &trace_dir, &[&tag], &[]);
        assert_eq!(cached, dict);
    }
}
