//! Keep-alive supervisor for framelink shared-memory artifacts
//!
//! Creates the declared segments and unmanaged regions under one shm-id
//! namespace, holds them on behalf of transient device processes, and
//! cleans the namespace on exit. SIGINT/SIGTERM stop the supervisor;
//! SIGUSR1 re-initializes segment allocators and zeroes region contents.

use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use framelink_core::{RegionSpec, SegmentSpec, ShmId};
use framelink_shmem::supervisor::{
    install_signal_handlers, parse_specs, ShmManager, ShmManagerConfig, STOP_REQUESTED,
};

const MAIN_POLL: Duration = Duration::from_millis(50);

#[derive(Parser, Debug)]
#[command(
    name = "shmmanager",
    version,
    about = "Keep-alive supervisor owning shared-memory segments and regions"
)]
struct Cli {
    /// Shm id namespace (decimal or 0x-prefixed hex)
    #[arg(long, value_parser = parse_shm_id)]
    shmid: ShmId,

    /// Managed segments, as <id>,<size>,<numaId> ...
    #[arg(long, num_args = 1..)]
    segments: Vec<String>,

    /// Unmanaged regions, as <id>,<size>,<numaId> ...
    #[arg(long, num_args = 1..)]
    regions: Vec<String>,

    /// Skip zeroing segment and region contents on init
    #[arg(long)]
    nozero: bool,

    /// Watch the declared artifacts and exit when one disappears
    #[arg(
        long,
        action = clap::ArgAction::Set,
        num_args = 0..=1,
        default_value_t = true,
        default_missing_value = "true"
    )]
    check_presence: bool,
}

fn parse_shm_id(value: &str) -> Result<ShmId, String> {
    value
        .parse::<ShmId>()
        .map_err(|e| format!("invalid shm id '{}': {}", value, e))
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = run() {
        error!("unhandled error reached the top of main: {:#}, application will now exit", e);
        std::process::exit(2);
    }
}

fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    install_signal_handlers().context("failed to install signal handlers")?;

    let segments: Vec<SegmentSpec> = parse_specs(&cli.segments, "--segments")?;
    let regions: Vec<RegionSpec> = parse_specs(&cli.regions, "--regions")?;

    let manager = ShmManager::new(ShmManagerConfig {
        shm_id: cli.shmid,
        segments,
        regions,
        zero: !cli.nozero,
    })
    .context("supervisor startup failed")?;

    let mut workers = vec![manager.spawn_reset_thread()];
    if cli.check_presence {
        workers.push(manager.spawn_presence_thread());
    }

    info!("shmmanager running for {}", manager.shm_id());

    while !manager.stop_requested() {
        if STOP_REQUESTED.load(Ordering::Relaxed) {
            manager.request_stop();
        }
        thread::sleep(MAIN_POLL);
    }

    info!("stopping");
    for worker in workers {
        let _ = worker.join();
    }

    Ok(())
}
