use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use log::{debug, info, warn};

use crate::buffer::{BlockHandle, TraceBufferManager};
use crate::config::Config;
use crate::container::{
    event_format_dictionary, sample_cpu_frequencies, ContainerWriter, SectionType,
};
use crate::error::{TraceCode, TraceResult};
use crate::file_utils::{boot_time_ns, generate_trace_file_name};
use crate::raw_reader::{capture_cpu_raw, CaptureOutcome, CaptureRequest, DumpStatus};
use crate::state::TraceDumpState;
use crate::tracefs::TraceFs;
use crate::types::{TraceDumpRequest, TraceDumpResult, TraceKind};

/// Give up after this many attempts to re-create a vanished output file.
const MAX_NEW_TRACE_FILE_RETRY: u32 = 5;

/// Loop variants pace their capture iterations on this interval, giving
/// the ring buffers time to fill.
const LOOP_CAPTURE_INTERVAL: Duration = Duration::from_secs(1);

/// Everything a strategy needs to run one dump.
pub struct DumpContext<'a> {
    pub tracefs: &'a TraceFs,
    pub pool: &'a TraceBufferManager,
    pub state: &'a TraceDumpState,
    pub config: &'a Config,
    /// Buffer-pool key for this dump.
    pub task_id: u64,
}

/// The three capture algorithms share one template: write the common
/// front sections, run the variant body over the per-CPU reader, write
/// the trailer sections, retry on a vanished output file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Snapshot,
    Recording,
    Cache,
}

/// Registration table resolving a dump kind to its strategy.
const REGISTRY: &[(TraceKind, Strategy)] = &[
    (TraceKind::Snapshot, Strategy::Snapshot),
    (TraceKind::Recording, Strategy::Recording),
    (TraceKind::Cache, Strategy::Cache),
];

impl Strategy {
    pub fn for_kind(kind: TraceKind) -> Option<Strategy> {
        REGISTRY
            .iter()
            .find(|(kind_, _)| *kind_ == kind)
            .map(|(_, strategy)| *strategy)
    }

    /// Recording keeps going on a fresh file when the current one
    /// disappeared under it; the one-shot variants finalize instead.
    fn recreates_missing_file(self) -> bool {
        self == Strategy::Recording
    }

    /// Run the dump. `on_core_done` fires between the CPU-raw step and
    /// the trailer; the out-of-process worker hooks its sync return in
    /// here.
    pub fn execute(
        self,
        ctx: &DumpContext<'_>,
        request: &TraceDumpRequest,
        output: &Path,
        on_core_done: Option<&dyn Fn(&TraceDumpResult)>,
    ) -> TraceDumpResult {
        let mut path = output.to_path_buf();
        let mut new_file_count = 1u32;
        loop {
            let ret = self.run_once(ctx, request, &path, on_core_done);
            ctx.pool.release(ctx.task_id);
            if self.recreates_missing_file() && !path.exists() {
                if new_file_count > MAX_NEW_TRACE_FILE_RETRY {
                    warn!("[strategy] new trace file creation limited");
                    return ret;
                }
                new_file_count += 1;
                path = generate_trace_file_name(&ctx.config.runtime.trace_dir, request.kind);
                info!("[strategy] output vanished, retrying on {}", path.display());
                continue;
            }
            return ret;
        }
    }

    fn run_once(
        self,
        ctx: &DumpContext<'_>,
        request: &TraceDumpRequest,
        path: &Path,
        on_core_done: Option<&dyn Fn(&TraceDumpResult)>,
    ) -> TraceDumpResult {
        let cap = request
            .limit_file_size
            .then_some(request.file_size_limit)
            .filter(|cap| *cap > 0);
        let mut writer = match ContainerWriter::create(path, cap) {
            Ok(writer) => writer,
            Err(err) => {
                warn!("[strategy] {err}");
                return TraceDumpResult::error(err.code);
            }
        };

        let mut ret = TraceDumpResult {
            code: TraceCode::Success,
            output_file: path.to_path_buf(),
            file_size: 0,
            trace_start_ns: 0,
            trace_end_ns: 0,
        };

        if let Err(err) = write_common_front(ctx, &mut writer) {
            warn!("[strategy] front sections failed: {err}");
            ret.code = TraceCode::WriteTraceInfoError;
            return ret;
        }

        let core_ok = match self {
            Strategy::Snapshot => self.core_snapshot(ctx, request, &mut writer, &mut ret),
            Strategy::Recording => self.core_recording(ctx, request, &mut writer, &mut ret),
            Strategy::Cache => self.core_cache(ctx, request, &mut writer, &mut ret),
        };

        if let Some(hook) = on_core_done {
            ret.file_size = writer.bytes_written();
            hook(&ret);
        }

        if core_ok {
            write_common_back(ctx, &mut writer);
        }
        if let Err(err) = writer.flush() {
            warn!("[strategy] {err}");
            ret.code = TraceCode::FileError;
        }
        ret.file_size = writer.bytes_written();
        ret
    }

    fn core_snapshot(
        self,
        ctx: &DumpContext<'_>,
        request: &TraceDumpRequest,
        writer: &mut ContainerWriter,
        ret: &mut TraceDumpResult,
    ) -> bool {
        let outcome = run_capture(ctx, request, request.trace_end_ns, writer);
        ret.code = outcome.status.to_code();
        ret.trace_start_ns = outcome.first_page_ts;
        ret.trace_end_ns = outcome.last_page_ts;
        outcome.status == DumpStatus::Success
    }

    fn core_recording(
        self,
        ctx: &DumpContext<'_>,
        request: &TraceDumpRequest,
        writer: &mut ContainerWriter,
        ret: &mut TraceDumpResult,
    ) -> bool {
        while ctx.state.is_loop_running() {
            std::thread::sleep(LOOP_CAPTURE_INTERVAL);
            let outcome = run_capture(ctx, request, boot_time_ns(), writer);
            ctx.pool.release(ctx.task_id);
            match outcome.status {
                DumpStatus::Success => {
                    merge_window(ret, &outcome);
                    ret.code = TraceCode::Success;
                }
                // a quiet second is not a failure of the recording
                DumpStatus::OutOfTime => {}
                status => {
                    ret.code = status.to_code();
                    return false;
                }
            }
            if writer.is_overflow() {
                info!("[strategy] recording file reached its size cap");
                break;
            }
        }
        true
    }

    fn core_cache(
        self,
        ctx: &DumpContext<'_>,
        request: &TraceDumpRequest,
        writer: &mut ContainerWriter,
        ret: &mut TraceDumpResult,
    ) -> bool {
        let mut slice_elapsed_s = 0u64;
        while ctx.state.is_loop_running() {
            let slice_start = boot_time_ns();
            std::thread::sleep(LOOP_CAPTURE_INTERVAL);
            let outcome = run_capture(ctx, request, boot_time_ns(), writer);
            ctx.pool.release(ctx.task_id);
            match outcome.status {
                DumpStatus::Success => {
                    merge_window(ret, &outcome);
                    ret.code = TraceCode::Success;
                }
                DumpStatus::OutOfTime => {}
                status => {
                    ret.code = status.to_code();
                    return false;
                }
            }
            slice_elapsed_s += (boot_time_ns().saturating_sub(slice_start)) / 1_000_000_000;
            if slice_elapsed_s >= request.cache_slice_duration_s || ctx.state.is_interrupted() {
                debug!("[strategy] cache slice complete after {slice_elapsed_s}s");
                break;
            }
        }
        true
    }
}

fn merge_window(ret: &mut TraceDumpResult, outcome: &CaptureOutcome) {
    if outcome.first_page_ts != 0
        && (ret.trace_start_ns == 0 || outcome.first_page_ts < ret.trace_start_ns)
    {
        ret.trace_start_ns = outcome.first_page_ts;
    }
    if outcome.last_page_ts > ret.trace_end_ns {
        ret.trace_end_ns = outcome.last_page_ts;
    }
}

/// One reader pass plus serialization of the captured blocks, per CPU in
/// ascending order.
fn run_capture(
    ctx: &DumpContext<'_>,
    request: &TraceDumpRequest,
    end_ns: u64,
    writer: &mut ContainerWriter,
) -> CaptureOutcome {
    let capture = CaptureRequest {
        task_id: ctx.task_id,
        start_ns: request.trace_start_ns,
        end_ns,
        byte_budget: request
            .limit_file_size
            .then_some(request.file_size_limit)
            .filter(|cap| *cap > 0),
    };
    let mut outcome = capture_cpu_raw(ctx.tracefs, ctx.pool, &capture);
    if outcome.status == DumpStatus::Success || outcome.pages > 0 {
        if let Err(err) = write_task_segments(ctx, writer) {
            warn!("[strategy] cpu raw serialization failed: {err}");
            outcome.status = DumpStatus::PipeError;
        }
    }
    outcome
}

fn write_task_segments(ctx: &DumpContext<'_>, writer: &mut ContainerWriter) -> TraceResult<()> {
    let mut by_cpu: BTreeMap<u32, Vec<BlockHandle>> = BTreeMap::new();
    for block in ctx.pool.blocks_of(ctx.task_id) {
        let cpu = block.lock().unwrap().cpu;
        by_cpu.entry(cpu).or_default().push(block);
    }
    for (cpu, handles) in by_cpu {
        let guards: Vec<_> = handles.iter().map(|h| h.lock().unwrap()).collect();
        let chunks: Vec<&[u8]> = guards.iter().map(|g| g.payload()).collect();
        if !writer.write_cpu_segment(cpu, &chunks)? {
            // cap reached: stop serializing, the caller sees the
            // overflow flag on the writer
            break;
        }
    }
    Ok(())
}

/// Steps 1-3 of the assembly sequence: file header, base info, event
/// format dictionary.
fn write_common_front(ctx: &DumpContext<'_>, writer: &mut ContainerWriter) -> TraceResult<()> {
    writer.write_file_header(&sample_cpu_frequencies())?;
    writer.write_section(SectionType::BaseInfo, ctx.tracefs.base_info().as_bytes())?;

    let enabled: Vec<_> = ctx
        .config
        .tags
        .values()
        .filter(|tag| ctx.tracefs.tag_is_enabled(tag))
        .collect();
    let dictionary = event_format_dictionary(
        ctx.tracefs,
        &ctx.config.runtime.trace_dir,
        &enabled,
        &ctx.config.runtime.base_format_paths,
    );
    writer.write_section(SectionType::EventFormats, dictionary.as_bytes())
}

/// Trailer sections: command-line map, tgid map, header-page
/// descriptor, printk formats. Individually best-effort; a missing
/// pseudo-file yields an empty section rather than a failed dump.
fn write_common_back(ctx: &DumpContext<'_>, writer: &mut ContainerWriter) {
    let trailer = [
        (SectionType::CmdLines, "saved_cmdlines"),
        (SectionType::Tgids, "saved_tgids"),
        (SectionType::HeaderPage, "events/header_page"),
        (SectionType::PrintkFormats, "printk_formats"),
    ];
    for (section, node) in trailer {
        let text = ctx.tracefs.read_text(node).unwrap_or_else(|err| {
            debug!("[strategy] {node} unreadable: {err}");
            String::new()
        });
        if let Err(err) = writer.write_section(section, text.as_bytes()) {
            info!("[strategy] trailer section {section:?} failed: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracefs::PAGE_SIZE;
    use std::fs;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn synthetic_page(ts: u64) -> Vec<u8> {
        let mut page = vec![0u8; PAGE_SIZE];
        page[..8].copy_from_slice(&ts.to_le_bytes());
        page
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        tracefs: TraceFs,
        config: Config,
    }

    fn fixture(pages_per_cpu: &[(u32, Vec<Vec<u8>>)]) -> Fixture {
        let dir = tempdir().unwrap();
        let root = dir.path().join("tracefs");
        for (cpu, pages) in pages_per_cpu {
            let cpu_dir = root.join(format!("per_cpu/cpu{cpu}"));
            fs::create_dir_all(&cpu_dir).unwrap();
            let bytes: Vec<u8> = pages.iter().flatten().copied().collect();
            fs::write(cpu_dir.join("trace_pipe_raw"), bytes).unwrap();
        }
        fs::write(root.join("saved_cmdlines"), "1 init\n").unwrap();
        fs::write(root.join("saved_tgids"), "1 1\n").unwrap();
        fs::write(root.join("printk_formats"), "").unwrap();
        fs::create_dir_all(root.join("events")).unwrap();
        fs::write(root.join("events/header_page"), "field: u64 timestamp\n").unwrap();

        let trace_dir = dir.path().join("out");
        fs::create_dir_all(&trace_dir).unwrap();
        let mut config = Config::default();
        config.runtime.trace_dir = trace_dir;
        config.runtime.base_format_paths = vec![];
        Fixture {
            tracefs: TraceFs::with_root(root),
            config,
            _dir: dir,
        }
    }

    fn request(kind: TraceKind) -> TraceDumpRequest {
        TraceDumpRequest {
            kind,
            file_size_limit: 0,
            limit_file_size: false,
            trace_start_ns: 0,
            trace_end_ns: u64::MAX,
            cache_slice_duration_s: 1,
        }
    }

    #[test]
    fn registry_resolves_all_kinds() {
        assert_eq!(Strategy::for_kind(TraceKind::Snapshot), Some(Strategy::Snapshot));
        assert_eq!(Strategy::for_kind(TraceKind::Recording), Some(Strategy::Recording));
        assert_eq!(Strategy::for_kind(TraceKind::Cache), Some(Strategy::Cache));
    }

    #[test]
    fn snapshot_writes_full_container_and_reports_window() {
        let fx = fixture(&[
            (0, vec![synthetic_page(100), synthetic_page(300)]),
            (1, vec![synthetic_page(200)]),
        ]);
        let pool = TraceBufferManager::new(1 << 22, 1 << 20);
        let state = TraceDumpState::new();
        let ctx = DumpContext {
            tracefs: &fx.tracefs,
            pool: &pool,
            state: &state,
            config: &fx.config,
            task_id: 1,
        };
        let output = fx.config.runtime.trace_dir.join("trace_test@1-0.sys");
        let ret = Strategy::Snapshot.execute(&ctx, &request(TraceKind::Snapshot), &output, None);

        assert_eq!(ret.code, TraceCode::Success);
        assert_eq!(ret.trace_start_ns, 100);
        assert_eq!(ret.trace_end_ns, 300);
        assert_eq!(ret.output_file, output);
        let bytes = fs::read(&output).unwrap();
        assert_eq!(ret.file_size, bytes.len() as u64);
        // every section tag present: base info, formats, raw, trailer
        for tag in [0x01u8, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07] {
            assert!(bytes.contains(&tag), "missing section 0x{tag:02x}");
        }
        // pool fully released after the dump
        assert_eq!(pool.total_allocated(), 0);
    }

    #[test]
    fn snapshot_with_empty_window_is_out_of_time() {
        let fx = fixture(&[(0, vec![synthetic_page(10)])]);
        let pool = TraceBufferManager::new(1 << 22, 1 << 20);
        let state = TraceDumpState::new();
        let ctx = DumpContext {
            tracefs: &fx.tracefs,
            pool: &pool,
            state: &state,
            config: &fx.config,
            task_id: 2,
        };
        let mut req = request(TraceKind::Snapshot);
        req.trace_start_ns = 1_000;
        req.trace_end_ns = 2_000;
        let output = fx.config.runtime.trace_dir.join("trace_empty@1-0.sys");
        let ret = Strategy::Snapshot.execute(&ctx, &req, &output, None);
        assert_eq!(ret.code, TraceCode::OutOfTime);
    }

    #[test]
    fn core_done_hook_fires_before_trailer() {
        let fx = fixture(&[(0, vec![synthetic_page(50)])]);
        let pool = TraceBufferManager::new(1 << 22, 1 << 20);
        let state = TraceDumpState::new();
        let ctx = DumpContext {
            tracefs: &fx.tracefs,
            pool: &pool,
            state: &state,
            config: &fx.config,
            task_id: 3,
        };
        let output = fx.config.runtime.trace_dir.join("trace_hook@1-0.sys");
        let seen = std::sync::Mutex::new(None);
        let hook = |ret: &TraceDumpResult| {
            *seen.lock().unwrap() = Some((ret.code, ret.file_size));
        };
        let ret = Strategy::Snapshot.execute(&ctx, &request(TraceKind::Snapshot), &output, Some(&hook));
        let (code, mid_size) = seen.lock().unwrap().take().expect("hook fired");
        assert_eq!(code, TraceCode::Success);
        assert!(mid_size > 0);
        assert!(mid_size < ret.file_size, "trailer grew the file after the hook");
    }

    #[test]
    fn recording_loop_stops_on_flag_and_keeps_container_valid() {
        let fx = fixture(&[(0, vec![synthetic_page(100), synthetic_page(200)])]);
        let pool = TraceBufferManager::new(1 << 22, 1 << 20);
        let state = Arc::new(TraceDumpState::new());
        assert!(state.start_capture());

        let output = fx.config.runtime.trace_dir.join("record_trace_test@1-0.sys");
        let ret = std::thread::scope(|scope| {
            let handle = {
                let state = Arc::clone(&state);
                let tracefs = &fx.tracefs;
                let config = &fx.config;
                let pool = &pool;
                let output = output.clone();
                scope.spawn(move || {
                    let ctx = DumpContext {
                        tracefs,
                        pool,
                        state: &state,
                        config,
                        task_id: 4,
                    };
                    let ret = Strategy::Recording.execute(
                        &ctx,
                        &request(TraceKind::Recording),
                        &output,
                        None,
                    );
                    state.end_capture_self();
                    ret
                })
            };
            std::thread::sleep(Duration::from_millis(1_500));
            assert!(state.end_capture());
            handle.join().unwrap()
        });

        assert_eq!(ret.code, TraceCode::Success);
        assert!(output.exists());
        assert!(ret.trace_start_ns >= 100);
        assert_eq!(pool.total_allocated(), 0);
    }
}
