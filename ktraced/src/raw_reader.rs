use std::os::fd::AsFd;

use log::{debug, warn};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use crate::buffer::TraceBufferManager;
use crate::error::TraceCode;
use crate::file_utils::boot_time_ns;
use crate::tracefs::{PageRead, TraceFs, PAGE_SIZE};

/// How long one CPU reader waits for the ring to refill before
/// re-checking the window end.
const DATA_WAIT_MS: u16 = 200;

/// Observable result of the per-CPU capture pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpStatus {
    Success,
    /// No page fell inside the requested window.
    OutOfTime,
    /// Raw pipe could not be opened/read or its readiness poll failed.
    PipeError,
    /// The buffer pool refused an allocation mid-dump.
    BufferExhausted,
}

impl DumpStatus {
    pub fn to_code(self) -> TraceCode {
        match self {
            DumpStatus::Success => TraceCode::Success,
            DumpStatus::OutOfTime => TraceCode::OutOfTime,
            DumpStatus::PipeError => TraceCode::EpollWaitError,
            DumpStatus::BufferExhausted => TraceCode::BufferExhausted,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CaptureRequest {
    /// Buffer-pool key; also the dump-task id.
    pub task_id: u64,
    /// Window in boot-clock ns, inclusive start, exclusive end.
    pub start_ns: u64,
    pub end_ns: u64,
    /// Stop reading once this many bytes sit in the pool for the task.
    pub byte_budget: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CaptureOutcome {
    pub status: DumpStatus,
    pub first_page_ts: u64,
    pub last_page_ts: u64,
    pub pages: u64,
}

impl Default for DumpStatus {
    fn default() -> Self {
        DumpStatus::Success
    }
}

#[derive(Debug, Default)]
struct CpuOutcome {
    first_ts: u64,
    last_ts: u64,
    pages: u64,
    pipe_error: bool,
    exhausted: bool,
}

/// Drain every online CPU's raw pipe into pool blocks, one reader thread
/// per CPU. Pages outside the window are dropped; a timestamp regression
/// within one CPU marks a ring-buffer wrap and ends that CPU's stream.
/// Per-CPU failures stay local: the dump proceeds with the remaining
/// CPUs.
pub fn capture_cpu_raw(
    fs_: &TraceFs,
    pool: &TraceBufferManager,
    request: &CaptureRequest,
) -> CaptureOutcome {
    let cpus = fs_.online_cpus();
    let mut results: Vec<CpuOutcome> = Vec::with_capacity(cpus.len());

    std::thread::scope(|scope| {
        let mut handles = Vec::with_capacity(cpus.len());
        for cpu in &cpus {
            let cpu = *cpu;
            handles.push(scope.spawn(move || read_one_cpu(fs_, pool, request, cpu)));
        }
        for handle in handles {
            match handle.join() {
                Ok(outcome) => results.push(outcome),
                Err(_) => results.push(CpuOutcome {
                    pipe_error: true,
                    ..CpuOutcome::default()
                }),
            }
        }
    });

    let mut outcome = CaptureOutcome::default();
    let mut any_pipe_error = false;
    for cpu_result in &results {
        outcome.pages += cpu_result.pages;
        any_pipe_error |= cpu_result.pipe_error;
        if cpu_result.exhausted {
            outcome.status = DumpStatus::BufferExhausted;
        }
        if cpu_result.first_ts != 0
            && (outcome.first_page_ts == 0 || cpu_result.first_ts < outcome.first_page_ts)
        {
            outcome.first_page_ts = cpu_result.first_ts;
        }
        if cpu_result.last_ts > outcome.last_page_ts {
            outcome.last_page_ts = cpu_result.last_ts;
        }
    }
    if outcome.status == DumpStatus::Success && outcome.pages == 0 {
        outcome.status = if any_pipe_error {
            DumpStatus::PipeError
        } else {
            DumpStatus::OutOfTime
        };
    }
    outcome
}

fn read_one_cpu(
    fs_: &TraceFs,
    pool: &TraceBufferManager,
    request: &CaptureRequest,
    cpu: u32,
) -> CpuOutcome {
    let mut result = CpuOutcome::default();
    let mut reader = match fs_.open_cpu_raw(cpu) {
        Ok(file) => file,
        Err(err) => {
            warn!("[reader] cpu{cpu}: open raw pipe failed: {err}");
            result.pipe_error = true;
            return result;
        }
    };
    let mut block = match pool.allocate(request.task_id, cpu) {
        Some(block) => block,
        None => {
            result.exhausted = true;
            return result;
        }
    };

    let mut page = [0u8; PAGE_SIZE];
    loop {
        if let Some(budget) = request.byte_budget {
            if pool.used_bytes(request.task_id) as u64 >= budget {
                debug!("[reader] cpu{cpu}: byte budget reached");
                break;
            }
        }
        match TraceFs::read_page(&mut reader, &mut page) {
            Ok(PageRead::Page(n)) => {
                let ts = TraceFs::page_timestamp(&page);
                if ts < request.start_ns {
                    continue;
                }
                if ts >= request.end_ns {
                    break;
                }
                if result.last_ts != 0 && ts < result.last_ts {
                    debug!("[reader] cpu{cpu}: timestamp regression, ring wrapped");
                    break;
                }
                if !append_page(pool, request.task_id, cpu, &mut block, &page[..n]) {
                    result.exhausted = true;
                    break;
                }
                if result.first_ts == 0 {
                    result.first_ts = ts;
                }
                result.last_ts = ts;
                result.pages += 1;
            }
            Ok(PageRead::Again) => {
                if boot_time_ns() >= request.end_ns {
                    break;
                }
                let fd = reader.as_fd();
                let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
                match poll(&mut fds, PollTimeout::from(DATA_WAIT_MS)) {
                    Ok(_) => continue,
                    Err(err) => {
                        warn!("[reader] cpu{cpu}: poll failed: {err}");
                        result.pipe_error = true;
                        break;
                    }
                }
            }
            Ok(PageRead::Eof) => break,
            Err(err) => {
                warn!("[reader] cpu{cpu}: read failed: {err}");
                result.pipe_error = true;
                break;
            }
        }
    }
    result
}

fn append_page(
    pool: &TraceBufferManager,
    task_id: u64,
    cpu: u32,
    block: &mut crate::buffer::BlockHandle,
    page: &[u8],
) -> bool {
    if block.lock().unwrap().append(page) {
        return true;
    }
    match pool.allocate(task_id, cpu) {
        Some(fresh) => {
            *block = fresh;
            block.lock().unwrap().append(page)
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn synthetic_page(ts: u64, fill: u8) -> Vec<u8> {
        let mut page = vec![fill; PAGE_SIZE];
        page[..8].copy_from_slice(&ts.to_le_bytes());
        page
    }

    fn fixture(cpu_pages: &[(u32, Vec<Vec<u8>>)]) -> (tempfile::TempDir, TraceFs) {
        let dir = tempdir().unwrap();
        for (cpu, pages) in cpu_pages {
            let cpu_dir = dir.path().join(format!("per_cpu/cpu{cpu}"));
            fs::create_dir_all(&cpu_dir).unwrap();
            let bytes: Vec<u8> = pages.iter().flatten().copied().collect();
            fs::write(cpu_dir.join("trace_pipe_raw"), bytes).unwrap();
        }
        let fs_ = TraceFs::with_root(dir.path());
        (dir, fs_)
    }

    #[test]
    fn window_filter_is_inclusive_exclusive() {
        let (_dir, fs_) = fixture(&[(
            0,
            vec![
                synthetic_page(100, 1),
                synthetic_page(200, 2),
                synthetic_page(300, 3),
                synthetic_page(400, 4),
            ],
        )]);
        let pool = TraceBufferManager::new(1 << 20, 64 * 1024);
        let outcome = capture_cpu_raw(
            &fs_,
            &pool,
            &CaptureRequest {
                task_id: 1,
                start_ns: 200,
                end_ns: 400,
                byte_budget: None,
            },
        );
        assert_eq!(outcome.status, DumpStatus::Success);
        assert_eq!(outcome.pages, 2);
        assert_eq!(outcome.first_page_ts, 200);
        assert_eq!(outcome.last_page_ts, 300);
        assert_eq!(pool.used_bytes(1), 2 * PAGE_SIZE);
    }

    #[test]
    fn timestamp_regression_ends_the_stream() {
        let (_dir, fs_) = fixture(&[(
            0,
            vec![
                synthetic_page(100, 1),
                synthetic_page(150, 2),
                synthetic_page(120, 3), // ring wrapped
                synthetic_page(500, 4),
            ],
        )]);
        let pool = TraceBufferManager::new(1 << 20, 64 * 1024);
        let outcome = capture_cpu_raw(
            &fs_,
            &pool,
            &CaptureRequest {
                task_id: 2,
                start_ns: 0,
                end_ns: u64::MAX,
                byte_budget: None,
            },
        );
        assert_eq!(outcome.pages, 2);
        assert_eq!(outcome.last_page_ts, 150);
    }

    #[test]
    fn cpus_aggregate_first_and_last_timestamps() {
        let (_dir, fs_) = fixture(&[
            (0, vec![synthetic_page(300, 1), synthetic_page(700, 2)]),
            (1, vec![synthetic_page(100, 3), synthetic_page(500, 4)]),
        ]);
        let pool = TraceBufferManager::new(1 << 22, 64 * 1024);
        let outcome = capture_cpu_raw(
            &fs_,
            &pool,
            &CaptureRequest {
                task_id: 3,
                start_ns: 0,
                end_ns: u64::MAX,
                byte_budget: None,
            },
        );
        assert_eq!(outcome.status, DumpStatus::Success);
        assert_eq!(outcome.pages, 4);
        assert_eq!(outcome.first_page_ts, 100);
        assert_eq!(outcome.last_page_ts, 700);
    }

    #[test]
    fn empty_window_reports_out_of_time() {
        let (_dir, fs_) = fixture(&[(0, vec![synthetic_page(100, 1)])]);
        let pool = TraceBufferManager::new(1 << 20, 64 * 1024);
        let outcome = capture_cpu_raw(
            &fs_,
            &pool,
            &CaptureRequest {
                task_id: 4,
                start_ns: 5_000,
                end_ns: 6_000,
                byte_budget: None,
            },
        );
        assert_eq!(outcome.status, DumpStatus::OutOfTime);
        assert_eq!(outcome.pages, 0);
    }

    #[test]
    fn pool_ceiling_surfaces_buffer_exhausted() {
        let (_dir, fs_) = fixture(&[(
            0,
            vec![synthetic_page(1, 1), synthetic_page(2, 2), synthetic_page(3, 3)],
        )]);
        // one block of one page, no room for a second block
        let pool = TraceBufferManager::new(PAGE_SIZE, PAGE_SIZE);
        let outcome = capture_cpu_raw(
            &fs_,
            &pool,
            &CaptureRequest {
                task_id: 5,
                start_ns: 0,
                end_ns: u64::MAX,
                byte_budget: None,
            },
        );
        assert_eq!(outcome.status, DumpStatus::BufferExhausted);
        assert_eq!(outcome.pages, 1);
    }

    #[test]
    fn byte_budget_bounds_the_read() {
        let pages: Vec<Vec<u8>> = (1..=8).map(|i| synthetic_page(i * 10, i as u8)).collect();
        let (_dir, fs_) = fixture(&[(0, pages)]);
        let pool = TraceBufferManager::new(1 << 22, 64 * 1024);
        let outcome = capture_cpu_raw(
            &fs_,
            &pool,
            &CaptureRequest {
                task_id: 6,
                start_ns: 0,
                end_ns: u64::MAX,
                byte_budget: Some(2 * PAGE_SIZE as u64),
            },
        );
        assert_eq!(outcome.status, DumpStatus::Success);
        assert_eq!(outcome.pages, 2);
    }
}
