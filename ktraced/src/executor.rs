use std::path::PathBuf;
use std::process::{Child, Command};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use dashmap::DashMap;
use log::{error, info, warn};

use crate::ageing::handle_ageing;
use crate::buffer::pool;
use crate::config::Config;
use crate::error::{TraceCode, TraceError, TraceResult};
use crate::file_utils::{
    boot_ns_to_unix_ms, boot_time_ns, delete_saved_events_format, generate_trace_file_name,
    rename_cache_file, scan_trace_files,
};
use crate::pipe::DumpPipe;
use crate::state::{DumpState, TraceDumpState};
use crate::strategy::{DumpContext, Strategy};
use crate::task::{TaskStatus, TraceDumpTask};
use crate::tracefs::TraceFs;
use crate::types::{TraceDumpParam, TraceDumpRequest, TraceDumpResult, TraceFileInfo, TraceKind};

/// Async completions and loop-stop acknowledgements wait this long.
const ASYNC_WAIT_MS: u64 = 5_000;
/// Bound on waiting for a freshly spawned worker to open its pipe ends.
const WORKER_SPAWN_WAIT_MS: u64 = 3_000;
/// Bound on waiting for the cache loop to acknowledge an interrupt.
const INTERRUPT_ACK_WAIT_MS: u64 = 2_000;

const KB_PER_MB: u64 = 1024;
const BYTES_PER_KB: u64 = 1024;

pub type AsyncDumpCallback = Box<dyn FnOnce(TraceDumpResult) + Send + 'static>;

/// Controller-side facade over the whole dump machinery: the mode state
/// machine, the on-disk file bookkeeping, the out-of-process worker and
/// the loop thread for the long-running modes. One instance per process,
/// created at start-up and handed to whoever needs it.
pub struct TraceDumpExecutor {
    config: Config,
    tracefs: TraceFs,
    state: TraceDumpState,
    /// Files produced by the active (or last) capture loop.
    loop_files: Mutex<Vec<TraceFileInfo>>,
    snapshot_files: Mutex<Vec<TraceFileInfo>>,
    tasks: DashMap<u64, TraceDumpTask>,
    loop_thread: Mutex<Option<JoinHandle<()>>>,
    current_loop: Mutex<Option<TraceKind>>,
    worker: Mutex<WorkerLink>,
    cache_total_kb: AtomicU64,
    last_task_id: AtomicU64,
}

#[derive(Default)]
struct WorkerLink {
    child: Option<Child>,
    pipe: Option<DumpPipe>,
}

impl TraceDumpExecutor {
    pub fn new(config: Config, tracefs: TraceFs) -> Arc<Self> {
        if let Err(err) = std::fs::create_dir_all(&config.runtime.trace_dir) {
            warn!(
                "[executor] create {} failed: {err}",
                config.runtime.trace_dir.display()
            );
        }
        let cache_total_kb = config.cache.total_file_size_mb * KB_PER_MB;
        Arc::new(Self {
            config,
            tracefs,
            state: TraceDumpState::new(),
            loop_files: Mutex::new(Vec::new()),
            snapshot_files: Mutex::new(Vec::new()),
            tasks: DashMap::new(),
            loop_thread: Mutex::new(None),
            current_loop: Mutex::new(None),
            worker: Mutex::new(WorkerLink::default()),
            cache_total_kb: AtomicU64::new(cache_total_kb),
            last_task_id: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn state(&self) -> &TraceDumpState {
        &self.state
    }

    pub fn current_loop_kind(&self) -> Option<TraceKind> {
        *self.current_loop.lock().unwrap()
    }

    /// Atomic test-and-set from idle into the looping state; the loop
    /// thread itself is started afterwards so a racing second start sees
    /// the rejection here.
    pub fn precheck_loop(&self) -> bool {
        self.state.start_capture()
    }

    pub fn start_recording_loop(self: &Arc<Self>, param: TraceDumpParam) -> TraceResult<()> {
        self.start_loop_inner(param, TraceKind::Recording)
    }

    pub fn start_cache_loop(
        self: &Arc<Self>,
        mut param: TraceDumpParam,
        total_file_size_mb: u64,
        slice_duration_s: u64,
    ) -> TraceResult<()> {
        self.cache_total_kb
            .store(total_file_size_mb * KB_PER_MB, Ordering::Relaxed);
        param.kind = TraceKind::Cache;
        let mut slice = slice_duration_s;
        if slice == 0 {
            slice = self.config.cache.slice_duration_s;
        }
        self.start_loop_with_slice(param, TraceKind::Cache, slice)
    }

    fn start_loop_inner(self: &Arc<Self>, param: TraceDumpParam, kind: TraceKind) -> TraceResult<()> {
        self.start_loop_with_slice(param, kind, self.config.cache.slice_duration_s)
    }

    fn start_loop_with_slice(
        self: &Arc<Self>,
        mut param: TraceDumpParam,
        kind: TraceKind,
        slice_duration_s: u64,
    ) -> TraceResult<()> {
        if !self.state.is_loop_running() && !self.state.start_capture() {
            return Err(TraceError::new(
                TraceCode::TraceIsOccupied,
                "another capture is active",
            ));
        }
        param.kind = kind;
        *self.current_loop.lock().unwrap() = Some(kind);
        if kind == TraceKind::Recording {
            // force the format dictionary to be rebuilt for this session
            delete_saved_events_format(&self.config.runtime.trace_dir);
        }
        let executor = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("ktrace-dump-loop".into())
            .spawn(move || executor.run_loop(param, slice_duration_s))
            .map_err(|err| {
                self.state.end_capture_self();
                *self.current_loop.lock().unwrap() = None;
                TraceError::new(TraceCode::ForkError, format!("loop thread spawn: {err}"))
            })?;
        *self.loop_thread.lock().unwrap() = Some(handle);
        Ok(())
    }

    pub fn stop_recording_loop(&self) -> Vec<PathBuf> {
        self.stop_loop(TraceKind::Recording)
    }

    pub fn stop_cache_loop(&self) -> Vec<PathBuf> {
        self.stop_loop(TraceKind::Cache)
    }

    fn stop_loop(&self, kind: TraceKind) -> Vec<PathBuf> {
        if !self.state.end_capture() {
            warn!("[executor] loop did not acknowledge the stop in time");
        }
        if let Some(handle) = self.loop_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
        *self.current_loop.lock().unwrap() = None;
        let files = self.loop_files.lock().unwrap();
        files
            .iter()
            .filter(|info| info.is_new && matches_prefix(info, kind))
            .map(|info| info.path.clone())
            .collect()
    }

    /// The capture loop body shared by recording and cache mode. Each
    /// iteration ages the retained files, generates a fresh output name
    /// and runs the strategy in-process; the worker process is only used
    /// for one-shot snapshots.
    fn run_loop(self: &Arc<Self>, param: TraceDumpParam, slice_duration_s: u64) {
        let kind = param.kind;
        let ageing_config = self.loop_ageing_config(&param, kind);
        {
            let mut files = self.loop_files.lock().unwrap();
            *files = scan_trace_files(&self.config.runtime.trace_dir, kind);
            handle_ageing(&mut files, &self.config.runtime.trace_dir, kind, &ageing_config);
        }

        // root builds may record one unbounded file instead of rotating
        if kind == TraceKind::Recording
            && param.file_size_kb == 0
            && self.config.runtime.root_mode
        {
            let path = param
                .output_file
                .clone()
                .unwrap_or_else(|| generate_trace_file_name(&self.config.runtime.trace_dir, kind));
            let request = self.loop_request(&param, kind, false, slice_duration_s);
            if let Some(info) = self.run_loop_iteration(&request, &path) {
                self.loop_files.lock().unwrap().push(info);
            }
            self.state.end_capture_self();
            return;
        }

        loop {
            match self.state.current() {
                DumpState::Running => {}
                DumpState::Interrupt => match self.state.wait_while_interrupted() {
                    DumpState::Running => continue,
                    _ => break,
                },
                _ => break,
            }
            {
                let mut files = self.loop_files.lock().unwrap();
                handle_ageing(&mut files, &self.config.runtime.trace_dir, kind, &ageing_config);
            }
            let path = generate_trace_file_name(&self.config.runtime.trace_dir, kind);
            let request = self.loop_request(&param, kind, true, slice_duration_s);
            match self.run_loop_iteration(&request, &path) {
                Some(mut info) => {
                    if kind == TraceKind::Cache {
                        if let Some(renamed) =
                            rename_cache_file(&info.path, info.trace_start_ms, info.trace_end_ms)
                        {
                            info.path = renamed;
                        }
                    }
                    self.loop_files.lock().unwrap().push(info);
                }
                None => break,
            }
        }
        self.state.end_capture_self();
        info!("[executor] capture loop for {kind:?} finished");
    }

    fn loop_request(
        &self,
        param: &TraceDumpParam,
        kind: TraceKind,
        limit_file_size: bool,
        slice_duration_s: u64,
    ) -> TraceDumpRequest {
        let default_kb = match kind {
            TraceKind::Recording => self.config.recording.file_size_kb,
            _ => self.config.snapshot.file_size_kb,
        };
        let cap_kb = if param.file_size_kb > 0 {
            param.file_size_kb
        } else {
            default_kb
        };
        TraceDumpRequest {
            kind,
            file_size_limit: cap_kb * BYTES_PER_KB,
            limit_file_size,
            trace_start_ns: param.trace_start_ns,
            trace_end_ns: param.trace_end_ns,
            cache_slice_duration_s: slice_duration_s,
        }
    }

    fn run_loop_iteration(
        self: &Arc<Self>,
        request: &TraceDumpRequest,
        path: &std::path::Path,
    ) -> Option<TraceFileInfo> {
        if let Err(err) = self.tracefs.mark_clock_sync() {
            warn!("[executor] clock sync marker failed: {err}");
        }
        let strategy = match Strategy::for_kind(request.kind) {
            Some(strategy) => strategy,
            None => {
                error!("[executor] unknown trace dump type");
                return None;
            }
        };
        let ctx = DumpContext {
            tracefs: &self.tracefs,
            pool: pool(),
            state: &self.state,
            config: &self.config,
            task_id: self.next_task_id(),
        };
        let ret = strategy.execute(&ctx, request, path, None);
        if !ret.code.is_success() || !ret.output_file.exists() {
            warn!("[executor] loop dump failed with {:?}", ret.code);
            return None;
        }
        Some(file_info_from_result(&ret))
    }

    /// Retention for the running loop: cache sessions follow their
    /// total-size budget, recording sessions honour an explicit
    /// file-count limit over the static table.
    fn loop_ageing_config(&self, param: &TraceDumpParam, kind: TraceKind) -> Config {
        let mut config = self.config.clone();
        match kind {
            TraceKind::Cache => {
                config.ageing.cache.max_total_size_kb = self.cache_total_kb.load(Ordering::Relaxed);
                config.ageing.cache.max_file_count = 0;
            }
            TraceKind::Recording if param.file_limit > 0 => {
                config.ageing.recording.max_file_count = param.file_limit as u64;
                config.ageing.recording.max_total_size_kb = 0;
            }
            _ => {}
        }
        config
    }

    /// Synchronous one-shot snapshot through the worker process. While a
    /// cache session is looping, the slice is interrupted, the snapshot
    /// borrows the facility and the cache resumes afterwards; a
    /// recording session rejects the request outright.
    pub fn dump_trace(&self, param: &TraceDumpParam, timeout_ms: u64) -> TraceDumpResult {
        let interrupting = match self.current_loop_kind() {
            Some(TraceKind::Cache) => true,
            Some(_) => return TraceDumpResult::error(TraceCode::TraceIsOccupied),
            None => false,
        };
        if interrupting {
            if !self.state.interrupt_cache() {
                return TraceDumpResult::error(TraceCode::TraceIsOccupied);
            }
            // let the in-flight slice finish its trailer first
            self.wait_interrupt_ack();
        } else if !self.state.start_capture() {
            return TraceDumpResult::error(TraceCode::TraceIsOccupied);
        }

        let result = self.dump_via_worker(param, timeout_ms);

        if interrupting {
            self.state.continue_cache();
        } else {
            self.state.end_capture_self();
        }
        if result.code.is_success() {
            self.note_snapshot_file(&result);
        }
        result
    }

    /// Fire-and-forget snapshot: the task is registered, the worker is
    /// driven from a monitor thread and `callback` fires once the
    /// trailer is flushed (or the 5 s completion bound expires).
    pub fn dump_trace_async(
        self: &Arc<Self>,
        param: &TraceDumpParam,
        file_size_cap_bytes: u64,
        callback: AsyncDumpCallback,
    ) -> TraceDumpResult {
        match self.current_loop_kind() {
            Some(TraceKind::Cache) | None => {}
            Some(_) => return TraceDumpResult::error(TraceCode::TraceIsOccupied),
        }
        let mut param = param.clone();
        if file_size_cap_bytes > 0 {
            param.file_size_kb = file_size_cap_bytes / BYTES_PER_KB;
        }
        let executor = Arc::clone(self);
        let timeout_ms = ASYNC_WAIT_MS;
        let spawned = std::thread::Builder::new()
            .name("ktrace-async-dump".into())
            .spawn(move || {
                let result = executor.dump_trace(&param, timeout_ms);
                callback(result);
            });
        match spawned {
            Ok(_) => TraceDumpResult::error(TraceCode::AsyncDump),
            Err(err) => {
                error!("[executor] async dump thread spawn failed: {err}");
                TraceDumpResult::error(TraceCode::ForkError)
            }
        }
    }

    fn dump_via_worker(&self, param: &TraceDumpParam, timeout_ms: u64) -> TraceDumpResult {
        let mut link = self.worker.lock().unwrap();
        if let Err(err) = self.ensure_worker(&mut link) {
            error!("[executor] {err}");
            return TraceDumpResult::error(err.code);
        }
        let pipe = link.pipe.as_ref().expect("worker link holds a pipe");

        if let Err(err) = self.tracefs.mark_clock_sync() {
            warn!("[executor] clock sync marker failed: {err}");
        }

        let output = param
            .output_file
            .clone()
            .unwrap_or_else(|| generate_trace_file_name(&self.config.runtime.trace_dir, param.kind));
        let mut task = TraceDumpTask::new(self.next_task_id(), param.kind, output);
        task.trace_start_ns = param.trace_start_ns;
        task.trace_end_ns = match param.trace_end_ns {
            0 | u64::MAX => boot_time_ns(),
            explicit => explicit,
        };
        let cap_kb = if param.file_size_kb > 0 {
            param.file_size_kb
        } else {
            self.config.snapshot.file_size_kb
        };
        task.file_size_cap = cap_kb * BYTES_PER_KB;

        if !pipe.submit_task(&task) {
            return TraceDumpResult::error(TraceCode::PipeCreateError);
        }
        self.add_task(task.clone());

        let sync = match pipe.read_sync_return(timeout_ms) {
            Some(sync) => sync,
            None => {
                self.remove_task(task.time);
                return TraceDumpResult::error(TraceCode::OutOfTime);
            }
        };
        self.update_task(sync.clone());

        let done = match pipe.read_async_return(ASYNC_WAIT_MS) {
            Some(done) => done,
            None => {
                warn!("[executor] task {}: no completion within 5s", task.time);
                self.remove_task(task.time);
                let mut result = result_from_task(&sync);
                result.code = TraceCode::TraceTaskDumpTimeout;
                return result;
            }
        };
        self.remove_task(task.time);
        result_from_task(&done)
    }

    fn note_snapshot_file(&self, result: &TraceDumpResult) {
        let mut files = self.snapshot_files.lock().unwrap();
        files.push(file_info_from_result(result));
        handle_ageing(
            &mut files,
            &self.config.runtime.trace_dir,
            TraceKind::Snapshot,
            &self.config,
        );
    }

    pub fn snapshot_files(&self) -> Vec<PathBuf> {
        self.snapshot_files
            .lock()
            .unwrap()
            .iter()
            .map(|info| info.path.clone())
            .collect()
    }

    fn ensure_worker(&self, link: &mut WorkerLink) -> TraceResult<()> {
        if let Some(child) = link.child.as_mut() {
            match child.try_wait() {
                Ok(Some(status)) => {
                    warn!("[executor] dump worker exited ({status}); respawning");
                    link.child = None;
                    link.pipe = None;
                }
                Ok(None) => {}
                Err(err) => {
                    warn!("[executor] worker wait failed: {err}");
                }
            }
        }
        if link.child.is_some() && link.pipe.is_some() {
            return Ok(());
        }

        DumpPipe::init(&self.config.runtime.trace_dir)?;
        let binary = worker_binary();
        let child = Command::new(&binary)
            .arg("--dir")
            .arg(&self.config.runtime.trace_dir)
            .arg("--tracefs")
            .arg(self.tracefs.root())
            .spawn()
            .map_err(|err| {
                TraceError::new(
                    TraceCode::ForkError,
                    format!("spawn {} failed: {err}", binary.display()),
                )
            })?;
        info!("[executor] dump worker spawned, pid {}", child.id());

        match DumpPipe::open_controller_timeout(&self.config.runtime.trace_dir, WORKER_SPAWN_WAIT_MS)
        {
            Ok(pipe) => {
                link.child = Some(child);
                link.pipe = Some(pipe);
                Ok(())
            }
            Err(err) => {
                let mut child = child;
                let _ = child.kill();
                let _ = child.wait();
                Err(TraceError::new(
                    TraceCode::PipeCreateError,
                    format!("worker pipes unavailable: {err}"),
                ))
            }
        }
    }

    /// Orderly worker shutdown: a FINISH sentinel over the submit pipe,
    /// then the FIFOs are unlinked.
    pub fn shutdown(&self) {
        let mut link = self.worker.lock().unwrap();
        if let Some(pipe) = link.pipe.take() {
            let mut sentinel =
                TraceDumpTask::new(self.next_task_id(), TraceKind::Snapshot, PathBuf::new());
            sentinel.status = TaskStatus::Finish;
            pipe.submit_task(&sentinel);
        }
        if let Some(mut child) = link.child.take() {
            let deadline = std::time::Instant::now() + std::time::Duration::from_millis(1_000);
            loop {
                match child.try_wait() {
                    Ok(Some(_)) => break,
                    Ok(None) if std::time::Instant::now() < deadline => {
                        std::thread::sleep(std::time::Duration::from_millis(20));
                    }
                    _ => {
                        let _ = child.kill();
                        let _ = child.wait();
                        break;
                    }
                }
            }
        }
        DumpPipe::clear(&self.config.runtime.trace_dir);
        self.tasks.clear();
    }

    fn wait_interrupt_ack(&self) {
        // the loop thread finishes its slice, trailer included, then
        // parks; only afterwards may the snapshot open the facility
        let deadline = std::time::Instant::now()
            + std::time::Duration::from_millis(INTERRUPT_ACK_WAIT_MS);
        while std::time::Instant::now() < deadline {
            if self.state.is_paused() || !self.state.is_interrupted() {
                return;
            }
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
        warn!("[executor] cache loop did not acknowledge the interrupt");
    }

    /// Task ids are boot-clock nanoseconds, bumped when two submissions
    /// land in the same tick, so they are unique and ordered.
    fn next_task_id(&self) -> u64 {
        let now = boot_time_ns();
        self.last_task_id
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last + 1))
            })
            .map(|last| now.max(last + 1))
            .unwrap_or(now)
    }

    pub fn add_task(&self, task: TraceDumpTask) {
        self.tasks.insert(task.time, task);
    }

    pub fn update_task(&self, task: TraceDumpTask) -> bool {
        match self.tasks.get_mut(&task.time) {
            Some(mut entry) => {
                *entry = task;
                true
            }
            None => false,
        }
    }

    pub fn remove_task(&self, time: u64) {
        self.tasks.remove(&time);
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_task_registry_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

fn matches_prefix(info: &TraceFileInfo, kind: TraceKind) -> bool {
    info.path
        .file_name()
        .map(|name| {
            name.to_string_lossy()
                .starts_with(crate::file_utils::trace_file_prefix(kind))
        })
        .unwrap_or(false)
}

fn file_info_from_result(ret: &TraceDumpResult) -> TraceFileInfo {
    TraceFileInfo {
        path: ret.output_file.clone(),
        trace_start_ms: boot_ns_to_unix_ms(ret.trace_start_ns),
        trace_end_ms: boot_ns_to_unix_ms(ret.trace_end_ns),
        size_bytes: ret.file_size,
        is_new: true,
        pinned: false,
    }
}

fn result_from_task(task: &TraceDumpTask) -> TraceDumpResult {
    TraceDumpResult {
        code: task.code,
        output_file: task.output_file.clone(),
        file_size: task.file_size,
        trace_start_ns: task.trace_start_ns,
        trace_end_ns: task.trace_end_ns,
    }
}

fn worker_binary() -> PathBuf {
    if let Ok(path) = std::env::var("KTRACE_WORKER_BIN") {
        return PathBuf::from(path);
    }
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            let sibling = dir.join("ktrace-worker");
            if sibling.exists() {
                return sibling;
            }
        }
    }
    PathBuf::from("ktrace-worker")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::Duration;
    use tempfile::tempdir;

    fn synthetic_page(ts: u64) -> Vec<u8> {
        let mut page = vec![0u8; crate::tracefs::PAGE_SIZE];
        page[..8].copy_from_slice(&ts.to_le_bytes());
        page
    }

    fn fixture() -> (tempfile::TempDir, Arc<TraceDumpExecutor>) {
        let dir = tempdir().unwrap();
        let root = dir.path().join("tracefs");
        for cpu in 0..2u32 {
            let cpu_dir = root.join(format!("per_cpu/cpu{cpu}"));
            fs::create_dir_all(&cpu_dir).unwrap();
            let pages: Vec<u8> = (1..=3u64)
                .flat_map(|i| synthetic_page(i * 1_000 + cpu as u64))
                .collect();
            fs::write(cpu_dir.join("trace_pipe_raw"), pages).unwrap();
        }
        fs::write(root.join("trace_marker"), "").unwrap();
        fs::write(root.join("saved_cmdlines"), "1 init\n").unwrap();
        fs::write(root.join("saved_tgids"), "1 1\n").unwrap();
        fs::write(root.join("printk_formats"), "").unwrap();
        fs::create_dir_all(root.join("events")).unwrap();
        fs::write(root.join("events/header_page"), "ts\n").unwrap();

        let mut config = Config::default();
        config.runtime.trace_dir = dir.path().join("out");
        config.runtime.base_format_paths = vec![];
        config.tags.clear();
        config.recording.file_size_kb = 1024;
        let executor = TraceDumpExecutor::new(config, TraceFs::with_root(root));
        (dir, executor)
    }

    #[test]
    fn precheck_is_exclusive_until_stopped() {
        let (_dir, executor) = fixture();
        assert!(executor.precheck_loop());
        assert!(!executor.precheck_loop());
        executor.state().end_capture_self();
        assert!(executor.precheck_loop());
        executor.state().end_capture_self();
    }

    #[test]
    fn task_registry_crud() {
        let (_dir, executor) = fixture();
        assert!(executor.is_task_registry_empty());
        let task = TraceDumpTask::new(42, TraceKind::Snapshot, PathBuf::from("/tmp/t.sys"));
        executor.add_task(task.clone());
        assert_eq!(executor.task_count(), 1);

        let mut update = task.clone();
        update.status = TaskStatus::ReadDone;
        assert!(executor.update_task(update));
        let mut missing = task.clone();
        missing.time = 777;
        assert!(!executor.update_task(missing));

        executor.remove_task(42);
        assert!(executor.is_task_registry_empty());
    }

    #[test]
    fn recording_loop_produces_files_and_stops_clean() {
        let (_dir, executor) = fixture();
        assert!(executor.precheck_loop());
        executor
            .start_recording_loop(TraceDumpParam {
                kind: TraceKind::Recording,
                ..TraceDumpParam::snapshot()
            })
            .unwrap();
        assert_eq!(executor.current_loop_kind(), Some(TraceKind::Recording));

        std::thread::sleep(Duration::from_millis(1_500));
        let files = executor.stop_recording_loop();
        assert!(!files.is_empty(), "at least one recording file");
        for file in &files {
            assert!(file.exists());
            let name = file.file_name().unwrap().to_string_lossy().to_string();
            assert!(name.starts_with("record_trace_"));
        }
        // mode returned to idle: a new capture is accepted
        assert_eq!(executor.state().current(), DumpState::Idle);
        assert!(executor.precheck_loop());
        executor.state().end_capture_self();
    }

    #[test]
    fn second_loop_start_is_rejected_while_looping() {
        let (_dir, executor) = fixture();
        assert!(executor.precheck_loop());
        executor
            .start_recording_loop(TraceDumpParam {
                kind: TraceKind::Recording,
                ..TraceDumpParam::snapshot()
            })
            .unwrap();
        // state already running: a competing precheck fails
        assert!(!executor.precheck_loop());
        let _ = executor.stop_recording_loop();
    }

    #[test]
    fn dump_trace_rejected_during_recording() {
        let (_dir, executor) = fixture();
        assert!(executor.precheck_loop());
        executor
            .start_recording_loop(TraceDumpParam {
                kind: TraceKind::Recording,
                ..TraceDumpParam::snapshot()
            })
            .unwrap();
        let ret = executor.dump_trace(&TraceDumpParam::snapshot(), 100);
        assert_eq!(ret.code, TraceCode::TraceIsOccupied);
        let _ = executor.stop_recording_loop();
    }

    #[test]
    fn cache_loop_slices_and_renames() {
        let (_dir, executor) = fixture();
        assert!(executor.precheck_loop());
        executor
            .start_cache_loop(TraceDumpParam::snapshot(), 800, 1)
            .unwrap();
        std::thread::sleep(Duration::from_millis(2_600));
        let files = executor.stop_cache_loop();
        assert!(files.len() >= 2, "got {} cache slices", files.len());
        for file in &files {
            let name = file.file_name().unwrap().to_string_lossy().to_string();
            assert!(name.starts_with("cache_trace_"), "{name}");
            // duration suffix from the rename: ...@boot-nanos-<ms>.sys
            let stem = name.strip_suffix(".sys").unwrap();
            let tail = stem.rsplit('-').next().unwrap();
            assert!(tail.parse::<u64>().is_ok(), "{name}");
        }
    }

    #[test]
    fn loop_start_without_precheck_self_arms() {
        let (_dir, executor) = fixture();
        executor
            .start_recording_loop(TraceDumpParam {
                kind: TraceKind::Recording,
                ..TraceDumpParam::snapshot()
            })
            .unwrap();
        assert!(executor.state().is_loop_running() || executor.current_loop_kind().is_some());
        let _ = executor.stop_recording_loop();
    }
}
