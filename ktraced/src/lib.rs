//! System-wide kernel tracing engine.
//!
//! Drains the kernel's per-CPU ftrace ring buffers into durable,
//! self-describing trace containers in three capture modes: one-shot
//! snapshot, long-running recording and sliding-window cache. Snapshots
//! are read by an out-of-process dump worker connected over named
//! FIFOs; the loop modes run on a controller-side capture thread.

use std::path::PathBuf;
use std::sync::Mutex;

use log::{info, warn};
use once_cell::sync::OnceCell;

pub mod ageing;
pub mod buffer;
pub mod config;
pub mod container;
pub mod error;
pub mod executor;
pub mod file_utils;
pub mod pipe;
pub mod raw_reader;
pub mod state;
pub mod strategy;
pub mod task;
pub mod tracefs;
pub mod types;
pub mod worker;

pub use config::Config;
pub use error::{TraceCode, TraceError, TraceResult};
pub use executor::TraceDumpExecutor;
pub use tracefs::TraceFs;
pub use types::{trace_mode, TraceDumpParam, TraceKind, TraceRetInfo};

use ageing::handle_ageing;
use executor::AsyncDumpCallback;
use file_utils::{boot_time_ns, delete_saved_events_format, scan_trace_files, unix_time_ms};
use types::TraceDumpResult;

const MIN_BUFFER_SIZE_KB: u64 = 256;
const MAX_BUFFER_SIZE_KB: u64 = 307_200; // 300 MiB
const HM_MAX_BUFFER_SIZE_KB: u64 = 1024 * 1024; // 1024 MiB
const MIN_FILE_SIZE_KB: u64 = 51_200; // 50 MiB
const MAX_FILE_SIZE_KB: u64 = 512_000; // 500 MiB

/// Values of an `open_trace` argument string, already split into the
/// outputs the engine consumes. The front-end that renders such strings
/// lives outside this crate.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TraceArgs {
    pub tags: Vec<String>,
    pub buffer_size_kb: Option<u64>,
    pub clock: Option<String>,
    pub overwrite: bool,
    pub output: Option<PathBuf>,
    pub file_size_kb: Option<u64>,
    pub file_limit: Option<u32>,
}

impl TraceArgs {
    /// Parse the space-separated `key:value` form, e.g.
    /// `tags:sched,freq bufferSize:147456 clockType:boot overwrite:1`.
    pub fn parse(raw: &str) -> TraceResult<Self> {
        let mut args = TraceArgs {
            overwrite: true,
            ..TraceArgs::default()
        };
        for part in raw.split_whitespace() {
            let (key, value) = part.split_once(':').ok_or_else(|| {
                TraceError::new(TraceCode::TagError, format!("malformed argument '{part}'"))
            })?;
            match key {
                "tags" => {
                    args.tags = value
                        .split(',')
                        .filter(|t| !t.is_empty())
                        .map(str::to_string)
                        .collect();
                }
                "bufferSize" => args.buffer_size_kb = Some(parse_number(key, value)?),
                "clockType" => args.clock = Some(value.to_string()),
                "overwrite" => args.overwrite = value != "0",
                "output" => args.output = Some(PathBuf::from(value)),
                "fileSize" => args.file_size_kb = Some(parse_number(key, value)?),
                "fileLimit" => args.file_limit = Some(parse_number(key, value)? as u32),
                other => {
                    return Err(TraceError::new(
                        TraceCode::TagError,
                        format!("unknown argument '{other}'"),
                    ));
                }
            }
        }
        Ok(args)
    }
}

fn parse_number(key: &str, value: &str) -> TraceResult<u64> {
    value.parse::<u64>().map_err(|_| {
        TraceError::new(
            TraceCode::TagError,
            format!("argument '{key}' expects a number, got '{value}'"),
        )
    })
}

#[derive(Debug, Default)]
struct EngineState {
    mode: u8,
    enabled_bits: u64,
    file_size_kb: Option<u64>,
    file_limit: Option<u32>,
    output: Option<PathBuf>,
}

/// Process-wide engine facade implementing the control surface. Created
/// once at start-up; all operations are internally synchronized.
pub struct TraceEngine {
    config: Config,
    tracefs: TraceFs,
    executor: std::sync::Arc<TraceDumpExecutor>,
    inner: Mutex<EngineState>,
}

static ENGINE: OnceCell<TraceEngine> = OnceCell::new();

/// Explicit engine initialization at process start.
pub fn init_engine(config: Config) -> TraceResult<&'static TraceEngine> {
    let tracefs = TraceFs::detect()?;
    Ok(ENGINE.get_or_init(|| TraceEngine::with_parts(config, tracefs)))
}

/// The engine handle, lazily initialized from the on-disk configuration.
pub fn engine() -> TraceResult<&'static TraceEngine> {
    match ENGINE.get() {
        Some(engine) => Ok(engine),
        None => init_engine(Config::load()),
    }
}

impl TraceEngine {
    pub fn with_parts(config: Config, tracefs: TraceFs) -> Self {
        let executor = TraceDumpExecutor::new(config.clone(), tracefs.clone());
        Self {
            config,
            tracefs,
            executor,
            inner: Mutex::new(EngineState::default()),
        }
    }

    pub fn executor(&self) -> &std::sync::Arc<TraceDumpExecutor> {
        &self.executor
    }

    /// Current mode bitmask (`trace_mode::{CLOSE, OPEN, RECORD, CACHE}`).
    pub fn get_trace_mode(&self) -> u8 {
        self.inner.lock().unwrap().mode
    }

    /// Enable mask of the currently open session (0 when closed).
    pub fn enabled_tag_bits(&self) -> u64 {
        self.inner.lock().unwrap().enabled_bits
    }

    /// Enable kernel tags for the named groups with default parameters.
    pub fn open_trace(&self, tag_groups: &[String]) -> TraceResult<()> {
        let bits = self.config.group_tag_bits(tag_groups).ok_or_else(|| {
            TraceError::new(
                TraceCode::TagError,
                format!("unknown tag group in {tag_groups:?}"),
            )
        })?;
        self.open_with(bits, &TraceArgs {
            overwrite: true,
            ..TraceArgs::default()
        })
    }

    /// Enable tags parsed from an argument string
    /// (`tags:… bufferSize:… clockType:… overwrite:… output:… fileSize:… fileLimit:…`).
    pub fn open_trace_args(&self, raw: &str) -> TraceResult<()> {
        let args = TraceArgs::parse(raw)?;
        if let Some(size_kb) = args.buffer_size_kb {
            let max = if self.config.runtime.hardware_module_kernel {
                HM_MAX_BUFFER_SIZE_KB
            } else {
                MAX_BUFFER_SIZE_KB
            };
            if size_kb < MIN_BUFFER_SIZE_KB || size_kb > max {
                return Err(TraceError::new(
                    TraceCode::TagError,
                    format!("buffer size must be within [{MIN_BUFFER_SIZE_KB}, {max}] KiB"),
                ));
            }
        }
        if let Some(file_kb) = args.file_size_kb {
            if file_kb < MIN_FILE_SIZE_KB || file_kb > MAX_FILE_SIZE_KB {
                return Err(TraceError::new(
                    TraceCode::TagError,
                    format!("file size must be within [{MIN_FILE_SIZE_KB}, {MAX_FILE_SIZE_KB}] KiB"),
                ));
            }
        }
        let bits = self.config.tag_bits(&args.tags).ok_or_else(|| {
            TraceError::new(TraceCode::TagError, format!("unknown tag in {:?}", args.tags))
        })?;
        self.open_with(bits, &args)
    }

    fn open_with(&self, bits: u64, args: &TraceArgs) -> TraceResult<()> {
        if bits == 0 {
            return Err(TraceError::new(TraceCode::TagError, "no tags enabled"));
        }
        let mut inner = self.inner.lock().unwrap();
        if inner.mode & (trace_mode::RECORD | trace_mode::CACHE) != 0 {
            return Err(TraceError::new(
                TraceCode::TraceIsOccupied,
                "a capture loop is active",
            ));
        }
        if inner.mode & trace_mode::OPEN != 0 {
            return Err(TraceError::new(
                TraceCode::WrongTraceMode,
                "trace is already open",
            ));
        }

        // start-up hygiene: stale snapshots beyond the caps go first,
        // and the cached format dictionary is rebuilt for this session
        let mut stale = scan_trace_files(&self.config.runtime.trace_dir, TraceKind::Snapshot);
        handle_ageing(
            &mut stale,
            &self.config.runtime.trace_dir,
            TraceKind::Snapshot,
            &self.config,
        );
        delete_saved_events_format(&self.config.runtime.trace_dir);

        self.tracefs
            .apply_tag_enable_bits(bits, &self.config.tags)?;
        let buffer_kb = args.buffer_size_kb.unwrap_or(self.config.snapshot.buffer_size_kb);
        tracefs::write_or_warn(self.tracefs.set_buffer_size_kb(buffer_kb), "buffer size");
        let clock = args.clock.as_deref().unwrap_or("boot");
        tracefs::write_or_warn(self.tracefs.set_clock(clock), "trace clock");
        tracefs::write_or_warn(self.tracefs.set_overwrite(args.overwrite), "overwrite");
        self.tracefs.set_tracing_on(true)?;

        inner.mode |= trace_mode::OPEN;
        inner.enabled_bits = bits;
        inner.file_size_kb = args.file_size_kb;
        inner.file_limit = args.file_limit;
        inner.output = args.output.clone();
        info!("[engine] trace opened, enable mask {bits:#x}");
        Ok(())
    }

    /// Synchronous snapshot. `max_duration` seconds bound the window and
    /// the wait (0 = unlimited); `trace_end_time` is a unix-second
    /// anchor for retrospective dumps (0 = now).
    pub fn dump_trace(&self, max_duration: i64, trace_end_time: u64) -> TraceRetInfo {
        let param = match self.snapshot_param(max_duration, trace_end_time) {
            Ok(param) => param,
            Err(err) => {
                warn!("[engine] {err}");
                return TraceRetInfo::error(err.code);
            }
        };
        let timeout_ms = if max_duration > 0 {
            max_duration as u64 * 1_000 + 10_000
        } else {
            u64::MAX
        };
        let ret = self.executor.dump_trace(&param, timeout_ms);
        ret_info(ret)
    }

    /// Fire-and-forget snapshot; `callback` receives the final result
    /// after the trailer is flushed or the completion bound expires.
    pub fn dump_trace_async(
        &self,
        max_duration: i64,
        trace_end_time: u64,
        file_size_limit: u64,
        callback: impl FnOnce(TraceRetInfo) + Send + 'static,
    ) -> TraceRetInfo {
        let param = match self.snapshot_param(max_duration, trace_end_time) {
            Ok(param) => param,
            Err(err) => return TraceRetInfo::error(err.code),
        };
        let adapter: AsyncDumpCallback = Box::new(move |ret| callback(ret_info(ret)));
        let ret = self
            .executor
            .dump_trace_async(&param, file_size_limit, adapter);
        ret_info(ret)
    }

    fn snapshot_param(&self, max_duration: i64, trace_end_time: u64) -> TraceResult<TraceDumpParam> {
        if max_duration < 0 {
            return Err(TraceError::new(
                TraceCode::InvalidMaxDuration,
                "negative max duration",
            ));
        }
        let inner = self.inner.lock().unwrap();
        if inner.mode & trace_mode::OPEN == 0 {
            return Err(TraceError::new(
                TraceCode::WrongTraceMode,
                "trace is not open",
            ));
        }
        let mut param = TraceDumpParam::snapshot();
        param.file_size_kb = inner.file_size_kb.unwrap_or(0);
        param.output_file = inner.output.clone();

        let end_ns = if trace_end_time == 0 {
            0 // resolved to "now" at submit time
        } else {
            let now_s = unix_time_ms() / 1_000;
            let behind_s = now_s.saturating_sub(trace_end_time);
            boot_time_ns().saturating_sub(behind_s * 1_000_000_000)
        };
        param.trace_end_ns = end_ns;
        if max_duration > 0 {
            let anchor = if end_ns == 0 { boot_time_ns() } else { end_ns };
            param.trace_start_ns = anchor.saturating_sub(max_duration as u64 * 1_000_000_000);
        }
        Ok(param)
    }

    /// Start the periodic recording loop; files rotate on the per-file
    /// size cap until `record_trace_off`.
    pub fn record_trace_on(&self) -> TraceResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.mode & trace_mode::OPEN == 0 {
            return Err(TraceError::new(
                TraceCode::WrongTraceMode,
                "trace is not open",
            ));
        }
        if !self.executor.precheck_loop() {
            return Err(TraceError::new(
                TraceCode::TraceIsOccupied,
                "another capture is active",
            ));
        }
        let param = TraceDumpParam {
            kind: TraceKind::Recording,
            output_file: None,
            file_limit: inner.file_limit.unwrap_or(0),
            file_size_kb: inner.file_size_kb.unwrap_or(0),
            trace_start_ns: 0,
            trace_end_ns: u64::MAX,
        };
        self.executor.start_recording_loop(param)?;
        inner.mode |= trace_mode::RECORD;
        Ok(())
    }

    pub fn record_trace_off(&self) -> TraceRetInfo {
        let mut inner = self.inner.lock().unwrap();
        if inner.mode & trace_mode::RECORD == 0 {
            return TraceRetInfo::error(TraceCode::WrongTraceMode);
        }
        let files = self.executor.stop_recording_loop();
        inner.mode &= !trace_mode::RECORD;
        TraceRetInfo {
            code: TraceCode::Success,
            output_files: files,
            file_size: 0,
            trace_start_ns: 0,
            trace_end_ns: 0,
        }
    }

    /// Start the sliding-window cache loop: `total_file_size_mb` bounds
    /// the retained slices, `slice_duration_s` the span of each file.
    pub fn cache_trace_on(&self, total_file_size_mb: u64, slice_duration_s: u64) -> TraceResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.mode & trace_mode::OPEN == 0 {
            return Err(TraceError::new(
                TraceCode::WrongTraceMode,
                "trace is not open",
            ));
        }
        if !self.executor.precheck_loop() {
            return Err(TraceError::new(
                TraceCode::TraceIsOccupied,
                "another capture is active",
            ));
        }
        let total = if total_file_size_mb == 0 {
            self.config.cache.total_file_size_mb
        } else {
            total_file_size_mb
        };
        self.executor
            .start_cache_loop(TraceDumpParam::snapshot(), total, slice_duration_s)?;
        inner.mode |= trace_mode::CACHE;
        Ok(())
    }

    pub fn cache_trace_off(&self) -> TraceRetInfo {
        let mut inner = self.inner.lock().unwrap();
        if inner.mode & trace_mode::CACHE == 0 {
            return TraceRetInfo::error(TraceCode::WrongTraceMode);
        }
        let files = self.executor.stop_cache_loop();
        inner.mode &= !trace_mode::CACHE;
        TraceRetInfo {
            code: TraceCode::Success,
            output_files: files,
            file_size: 0,
            trace_start_ns: 0,
            trace_end_ns: 0,
        }
    }

    /// Disable tags, flush the dump pipes and return to idle.
    pub fn close_trace(&self) -> TraceResult<()> {
        {
            let inner = self.inner.lock().unwrap();
            if inner.mode & trace_mode::RECORD != 0 {
                drop(inner);
                let _ = self.record_trace_off();
            } else if inner.mode & trace_mode::CACHE != 0 {
                drop(inner);
                let _ = self.cache_trace_off();
            }
        }
        let mut inner = self.inner.lock().unwrap();
        self.executor.shutdown();
        tracefs::write_or_warn(
            self.tracefs.apply_tag_enable_bits(0, &self.config.tags),
            "tag disable",
        );
        tracefs::write_or_warn(self.tracefs.set_tracing_on(false), "tracing_on");
        inner.mode = trace_mode::CLOSE;
        inner.enabled_bits = 0;
        info!("[engine] trace closed");
        Ok(())
    }

    /// Flip the kernel's `tracing_on` switch without touching the mode.
    pub fn set_trace_status(&self, enable: bool) -> TraceResult<()> {
        self.tracefs.set_tracing_on(enable)
    }
}

fn ret_info(ret: TraceDumpResult) -> TraceRetInfo {
    let output_files = if ret.output_file.as_os_str().is_empty() {
        Vec::new()
    } else {
        vec![ret.output_file.clone()]
    };
    TraceRetInfo {
        code: ret.code,
        output_files,
        file_size: ret.file_size,
        trace_start_ns: ret.trace_start_ns,
        trace_end_ns: ret.trace_end_ns,
    }
}
