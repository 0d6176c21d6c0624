use std::path::PathBuf;

use clap::Parser;

use ktraced::worker::{run, WorkerOptions};

/// Out-of-process dump worker. Spawned by the controlling process after
/// the dump FIFOs exist; never started by hand in normal operation.
#[derive(Parser, Debug)]
#[command(name = "ktrace-worker")]
#[command(about = "ktrace dump worker process")]
struct Args {
    /// Directory holding the dump FIFOs and trace output files.
    #[arg(long, value_name = "PATH")]
    dir: PathBuf,
    /// tracefs root override; auto-detected when omitted.
    #[arg(long, value_name = "PATH")]
    tracefs: Option<PathBuf>,
    /// Exit when idle for this long.
    #[arg(long, default_value_t = 60_000)]
    idle_timeout_ms: u64,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();
    run(WorkerOptions {
        trace_dir: args.dir,
        tracefs_root: args.tracefs,
        idle_timeout_ms: args.idle_timeout_ms,
    })
}
