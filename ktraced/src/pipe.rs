use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, error, info, warn};
use nix::sys::stat::Mode;
use nix::unistd::mkfifo;

use crate::error::{TraceCode, TraceError, TraceResult};
use crate::task::{TraceDumpTask, TASK_RECORD_SIZE};

const TASK_SUBMIT_PIPE: &str = "trace_task";
const SYNC_RETURN_PIPE: &str = "trace_sync_return";
const ASYNC_RETURN_PIPE: &str = "trace_async_return";

/// Non-blocking reads retry on this cadence until the timeout elapses.
const POLL_STEP_MS: u64 = 50;

fn pipe_paths(dir: &Path) -> [PathBuf; 3] {
    [
        dir.join(TASK_SUBMIT_PIPE),
        dir.join(SYNC_RETURN_PIPE),
        dir.join(ASYNC_RETURN_PIPE),
    ]
}

/// The three named FIFOs connecting the controller to the dump worker:
/// task submissions flow down, sync returns (after the CPU-raw step) and
/// async returns (after the trailer) flow back. One writer per direction
/// per pipe; records are fixed-size and written atomically.
pub struct DumpPipe {
    is_controller: bool,
    submit: File,
    sync_ret: File,
    async_ret: File,
}

impl DumpPipe {
    /// Create the FIFOs, mode 0666, before the worker process is
    /// spawned. Already-existing FIFOs are reused.
    pub fn init(dir: &Path) -> TraceResult<()> {
        for path in pipe_paths(dir) {
            match mkfifo(&path, Mode::from_bits_truncate(0o666)) {
                Ok(()) => {}
                Err(nix::errno::Errno::EEXIST) => {
                    debug!("[pipe] {} already exists", path.display());
                }
                Err(err) => {
                    error!("[pipe] create {} failed: {err}", path.display());
                    return Err(TraceError::new(
                        TraceCode::PipeCreateError,
                        format!("mkfifo {} failed: {err}", path.display()),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Remove the FIFOs on orderly shutdown.
    pub fn clear(dir: &Path) {
        for path in pipe_paths(dir) {
            if let Err(err) = std::fs::remove_file(&path) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!("[pipe] unlink {} failed: {err}", path.display());
                }
            }
        }
    }

    pub fn exists(dir: &Path) -> bool {
        pipe_paths(dir).iter().all(|p| p.exists())
    }

    /// Controller side: blocking submit writer, non-blocking return
    /// readers. Opening the submit pipe blocks until the worker has its
    /// read end open, so spawn the worker first.
    pub fn open_controller(dir: &Path) -> anyhow::Result<Self> {
        let [submit, sync_ret, async_ret] = pipe_paths(dir);
        let submit = OpenOptions::new().write(true).open(&submit)?;
        let sync_ret = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&sync_ret)?;
        let async_ret = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&async_ret)?;
        Ok(Self {
            is_controller: true,
            submit,
            sync_ret,
            async_ret,
        })
    }

    /// Like [`DumpPipe::open_controller`], but instead of blocking until
    /// the worker appears, retries the submit open (ENXIO while the read
    /// end is missing) on the poll cadence up to `timeout_ms`. Keeps a
    /// failed worker spawn from hanging the controller forever.
    pub fn open_controller_timeout(dir: &Path, timeout_ms: u64) -> anyhow::Result<Self> {
        let [submit_path, sync_ret, async_ret] = pipe_paths(dir);
        let mut waited = 0u64;
        let submit = loop {
            match OpenOptions::new()
                .write(true)
                .custom_flags(libc::O_NONBLOCK)
                .open(&submit_path)
            {
                Ok(file) => break file,
                Err(err) if err.raw_os_error() == Some(libc::ENXIO) => {
                    if waited >= timeout_ms {
                        anyhow::bail!("worker never opened {}", submit_path.display());
                    }
                    std::thread::sleep(Duration::from_millis(POLL_STEP_MS));
                    waited += POLL_STEP_MS;
                }
                Err(err) => return Err(err.into()),
            }
        };
        let sync_ret = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&sync_ret)?;
        let async_ret = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&async_ret)?;
        Ok(Self {
            is_controller: true,
            submit,
            sync_ret,
            async_ret,
        })
    }

    /// Worker side: non-blocking submit reader, blocking return writers.
    pub fn open_worker(dir: &Path) -> anyhow::Result<Self> {
        let [submit, sync_ret, async_ret] = pipe_paths(dir);
        let submit = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&submit)?;
        let sync_ret = OpenOptions::new().write(true).open(&sync_ret)?;
        let async_ret = OpenOptions::new().write(true).open(&async_ret)?;
        Ok(Self {
            is_controller: false,
            submit,
            sync_ret,
            async_ret,
        })
    }

    pub fn submit_task(&self, task: &TraceDumpTask) -> bool {
        if !self.is_controller {
            error!("[pipe] worker process cannot submit dump tasks");
            return false;
        }
        match write_record(&self.submit, task) {
            Ok(()) => {
                info!("[pipe] task {} submitted", task.time);
                true
            }
            Err(err) => {
                error!("[pipe] submit failed: {err}");
                false
            }
        }
    }

    pub fn read_sync_return(&self, timeout_ms: u64) -> Option<TraceDumpTask> {
        if !self.is_controller {
            error!("[pipe] worker process cannot read the sync return pipe");
            return None;
        }
        read_record(&self.sync_ret, timeout_ms, "sync return")
    }

    pub fn read_async_return(&self, timeout_ms: u64) -> Option<TraceDumpTask> {
        if !self.is_controller {
            error!("[pipe] worker process cannot read the async return pipe");
            return None;
        }
        read_record(&self.async_ret, timeout_ms, "async return")
    }

    pub fn read_task(&self, timeout_ms: u64) -> Option<TraceDumpTask> {
        if self.is_controller {
            error!("[pipe] controller process cannot read the submit pipe");
            return None;
        }
        read_record(&self.submit, timeout_ms, "task submit")
    }

    pub fn write_sync_return(&self, task: &TraceDumpTask) -> bool {
        if self.is_controller {
            error!("[pipe] controller process cannot write the sync return pipe");
            return false;
        }
        match write_record(&self.sync_ret, task) {
            Ok(()) => true,
            Err(err) => {
                error!("[pipe] sync return failed: {err}");
                false
            }
        }
    }

    pub fn write_async_return(&self, task: &TraceDumpTask) -> bool {
        if self.is_controller {
            error!("[pipe] controller process cannot write the async return pipe");
            return false;
        }
        match write_record(&self.async_ret, task) {
            Ok(()) => true,
            Err(err) => {
                error!("[pipe] async return failed: {err}");
                false
            }
        }
    }
}

fn write_record(mut file: &File, task: &TraceDumpTask) -> std::io::Result<()> {
    file.write_all(&task.encode())
}

/// Timeout-polled read. A timeout of exactly 0 attempts a single read
/// and returns immediately. Timeouts are recoverable: the caller maps
/// them to `OUT_OF_TIME`, never a failure of the pipe itself.
fn read_record(mut file: &File, timeout_ms: u64, what: &str) -> Option<TraceDumpTask> {
    let mut waited = 0u64;
    let mut buf = [0u8; TASK_RECORD_SIZE];
    loop {
        match file.read(&mut buf) {
            Ok(n) if n >= TASK_RECORD_SIZE => match TraceDumpTask::decode(&buf) {
                Some(task) => {
                    debug!("[pipe] {what}: task {} received", task.time);
                    return Some(task);
                }
                None => {
                    warn!("[pipe] {what}: undecodable record dropped");
                }
            },
            Ok(n) if n > 0 => {
                warn!("[pipe] {what}: short read of {n} bytes dropped");
            }
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => {
                warn!("[pipe] {what}: read failed: {err}");
                return None;
            }
        }
        if waited >= timeout_ms {
            debug!("[pipe] {what}: timed out after {timeout_ms} ms");
            return None;
        }
        std::thread::sleep(Duration::from_millis(POLL_STEP_MS));
        waited += POLL_STEP_MS;
    }
}
