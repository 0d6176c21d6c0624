use std::path::PathBuf;

use anyhow::Context;
use log::{info, warn};

use crate::buffer::pool;
use crate::config::Config;
use crate::error::TraceCode;
use crate::pipe::DumpPipe;
use crate::state::TraceDumpState;
use crate::strategy::{DumpContext, Strategy};
use crate::task::{TaskStatus, TraceDumpTask};
use crate::tracefs::TraceFs;
use crate::types::{TraceDumpRequest, TraceDumpResult};

pub struct WorkerOptions {
    /// Directory holding the dump FIFOs and the output files.
    pub trace_dir: PathBuf,
    /// Explicit tracefs root; auto-detected when absent.
    pub tracefs_root: Option<PathBuf>,
    /// Exit when no submission arrives within this window.
    pub idle_timeout_ms: u64,
}

/// Dump-worker process body: poll the submit FIFO, run the strategy for
/// each task, acknowledge on the sync pipe once the CPU raw data is on
/// disk and on the async pipe once the trailer is flushed.
pub fn run(options: WorkerOptions) -> anyhow::Result<()> {
    let tracefs = match &options.tracefs_root {
        Some(root) => TraceFs::with_root(root),
        None => TraceFs::detect().map_err(|err| anyhow::anyhow!("{err}"))?,
    };
    let pipe = DumpPipe::open_worker(&options.trace_dir)
        .with_context(|| format!("open dump pipes under {}", options.trace_dir.display()))?;

    let mut config = Config::load();
    config.runtime.trace_dir = options.trace_dir.clone();
    let state = TraceDumpState::new();

    info!(
        "[worker] ready, tracefs {} -> {}",
        tracefs.root().display(),
        options.trace_dir.display()
    );
    loop {
        let Some(task) = pipe.read_task(options.idle_timeout_ms) else {
            info!("[worker] no submissions, exiting");
            break;
        };
        if task.status == TaskStatus::Finish {
            info!("[worker] shutdown sentinel received");
            break;
        }
        handle_task(&tracefs, &config, &state, &pipe, task);
    }
    Ok(())
}

fn handle_task(
    tracefs: &TraceFs,
    config: &Config,
    state: &TraceDumpState,
    pipe: &DumpPipe,
    task: TraceDumpTask,
) {
    info!(
        "[worker] task {}: {:?} -> {}",
        task.time,
        task.kind,
        task.output_file.display()
    );
    let Some(strategy) = Strategy::for_kind(task.kind) else {
        warn!("[worker] task {}: unknown trace dump type", task.time);
        let mut failed = task.clone();
        failed.status = TaskStatus::Error;
        failed.code = TraceCode::UnknownTraceDumpType;
        pipe.write_sync_return(&failed);
        pipe.write_async_return(&failed);
        return;
    };

    let request = TraceDumpRequest {
        kind: task.kind,
        file_size_limit: task.file_size_cap,
        limit_file_size: task.file_size_cap > 0,
        trace_start_ns: task.trace_start_ns,
        trace_end_ns: task.trace_end_ns,
        cache_slice_duration_s: task.cache_slice_s,
    };
    let ctx = DumpContext {
        tracefs,
        pool: pool(),
        state,
        config,
        task_id: task.time,
    };

    // the controller may proceed as soon as the raw pages are durable;
    // the trailer keeps writing behind this acknowledgement
    let sync_hook = |ret: &TraceDumpResult| {
        let ack = task_with_result(&task, ret, TaskStatus::ReadDone);
        if !pipe.write_sync_return(&ack) {
            warn!("[worker] task {}: sync return lost", task.time);
        }
    };

    let ret = strategy.execute(&ctx, &request, &task.output_file, Some(&sync_hook));
    let done = task_with_result(&task, &ret, TaskStatus::WriteDone);
    if !pipe.write_async_return(&done) {
        warn!("[worker] task {}: async return lost", task.time);
    }
    info!(
        "[worker] task {}: finished with {:?}, {} bytes",
        task.time, ret.code, ret.file_size
    );
}

fn task_with_result(
    task: &TraceDumpTask,
    ret: &TraceDumpResult,
    ok_status: TaskStatus,
) -> TraceDumpTask {
    let mut out = task.clone();
    out.status = if ret.code.is_success() {
        ok_status
    } else {
        TaskStatus::Error
    };
    out.code = ret.code;
    out.output_file = ret.output_file.clone();
    out.file_size = ret.file_size;
    out.trace_start_ns = ret.trace_start_ns;
    out.trace_end_ns = ret.trace_end_ns;
    out
}
