//! Keep-alive supervisor
//!
//! A long-running process whose sole job is to own segments and regions so
//! they outlive short-lived device processes. Devices come and go; the
//! supervisor holds the mappings, services reset-content requests, and
//! (optionally) watches that no artifact was cleaned up externally.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{error, info, warn};

use framelink_core::{
    AllocStrategy, RegionId, RegionSpec, SegmentId, SegmentSpec, ShmId, SpecParseError,
};

use crate::error::{Result, ShmemError};
use crate::monitor::Monitor;
use crate::region::{AckHandler, Region, RegionConfig};
use crate::segment::Segment;

/// Poll period of the reset-content flag.
pub const RESET_POLL: Duration = Duration::from_millis(50);

/// Poll period of the presence watchdog.
pub const PRESENCE_POLL: Duration = Duration::from_millis(500);

/// Set from the interrupt/terminate signal handlers; polled by the
/// supervisor main loop.
pub static STOP_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Set from the user-signal handler; polled and cleared by the reset
/// thread.
pub static RESET_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_stop_signal(_: libc::c_int) {
    // One atomic store; anything more is not async-signal-safe.
    STOP_REQUESTED.store(true, Ordering::Relaxed);
}

extern "C" fn handle_reset_signal(_: libc::c_int) {
    RESET_REQUESTED.store(true, Ordering::Relaxed);
}

/// Install the supervisor signal disposition: SIGINT/SIGTERM request a
/// stop, SIGUSR1 requests a content reset.
pub fn install_signal_handlers() -> Result<()> {
    use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

    let stop = SigAction::new(
        SigHandler::Handler(handle_stop_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    let reset = SigAction::new(
        SigHandler::Handler(handle_reset_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    for (signal, action) in [
        (Signal::SIGINT, &stop),
        (Signal::SIGTERM, &stop),
        (Signal::SIGUSR1, &reset),
    ] {
        unsafe { sigaction(signal, action) }
            .map_err(|e| ShmemError::Platform(format!("sigaction({:?}) failed: {}", signal, e)))?;
    }
    Ok(())
}

/// Parse a list of `<id>,<size>,<numaId>` values, attributing failures to
/// the CLI flag they came from.
pub fn parse_specs<T>(values: &[String], flag: &str) -> Result<Vec<T>>
where
    T: FromStr<Err = SpecParseError>,
{
    values
        .iter()
        .map(|value| {
            value.parse::<T>().map_err(|e| {
                ShmemError::Config(format!("incorrect format for {} '{}': {}", flag, value, e))
            })
        })
        .collect()
}

/// Construction options of a [`ShmManager`].
#[derive(Debug, Clone)]
pub struct ShmManagerConfig {
    pub shm_id: ShmId,
    pub segments: Vec<SegmentSpec>,
    pub regions: Vec<RegionSpec>,
    /// Zero contents right after creation.
    pub zero: bool,
}

/// Owner of the declared segments and regions for one shm-id namespace.
pub struct ShmManager {
    shm_id: ShmId,
    segment_specs: Vec<SegmentSpec>,
    region_specs: Vec<RegionSpec>,
    segments: Mutex<BTreeMap<SegmentId, Segment>>,
    regions: Mutex<BTreeMap<RegionId, Region>>,
    stop: AtomicBool,
}

impl ShmManager {
    /// Clean the namespace, then create, lock and (optionally) zero every
    /// declared artifact. Construction errors leave nothing behind.
    pub fn new(config: ShmManagerConfig) -> Result<Arc<Self>> {
        let shm_id = config.shm_id;

        // A previous incarnation may have died without cleanup.
        Monitor::cleanup(shm_id)?;

        let build = || -> Result<(BTreeMap<SegmentId, Segment>, BTreeMap<RegionId, Region>)> {
            let mut segments = BTreeMap::new();
            for spec in &config.segments {
                let mut segment = Segment::create(
                    shm_id,
                    spec.id,
                    spec.size,
                    AllocStrategy::RbTreeBestFit,
                    spec.numa,
                )?;
                info!(
                    "created segment {} of size {}, starting at {:p}; locking",
                    spec.id,
                    segment.size(),
                    segment.as_ptr()
                );
                segment.lock();
                if config.zero {
                    segment.zero();
                }
                segments.insert(spec.id, segment);
            }

            let mut regions = BTreeMap::new();
            for spec in &config.regions {
                let region_config = RegionConfig::new(shm_id, spec.id, spec.size)
                    .numa(spec.numa)
                    .lock(true)
                    .zero(config.zero);
                let region = Region::create(region_config, AckHandler::Ignore)?;
                info!(
                    "created unmanaged region {} of size {}, starting at {:p}",
                    spec.id,
                    region.size(),
                    region.as_ptr()
                );
                regions.insert(spec.id, region);
            }
            Ok((segments, regions))
        };

        let (segments, regions) = match build() {
            Ok(maps) => maps,
            Err(e) => {
                // Partial startup leaves no artifacts behind.
                let _ = Monitor::cleanup(shm_id);
                return Err(e);
            }
        };

        Ok(Arc::new(ShmManager {
            shm_id,
            segment_specs: config.segments,
            region_specs: config.regions,
            segments: Mutex::new(segments),
            regions: Mutex::new(regions),
            stop: AtomicBool::new(false),
        }))
    }

    pub fn shm_id(&self) -> ShmId {
        self.shm_id
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    /// Re-initialize the declared artifacts in place.
    pub fn reset_content(&self) -> Result<()> {
        let _segments = self.segments.lock();
        let _regions = self.regions.lock();
        Monitor::reset_content(self.shm_id, &self.segment_specs, &self.region_specs)
    }

    /// Whether every declared artifact is still present.
    pub fn all_present(&self) -> bool {
        let _segments = self.segments.lock();
        let _regions = self.regions.lock();
        self.segment_specs
            .iter()
            .all(|spec| Monitor::segment_is_present(self.shm_id, spec.id))
            && self
                .region_specs
                .iter()
                .all(|spec| Monitor::region_is_present(self.shm_id, spec.id))
    }

    /// Reset thread: services [`RESET_REQUESTED`] until stop.
    pub fn spawn_reset_thread(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        thread::spawn(move || {
            while !manager.stop_requested() {
                if RESET_REQUESTED.swap(false, Ordering::Relaxed) {
                    info!("resetting content of {}", manager.shm_id);
                    if let Err(e) = manager.reset_content() {
                        error!("content reset of {} failed: {}", manager.shm_id, e);
                    }
                }
                thread::sleep(RESET_POLL);
            }
        })
    }

    /// Presence watchdog: raises the stop flag when a declared artifact
    /// disappears, so the supervisor exits and a restart can be scripted.
    pub fn spawn_presence_thread(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        thread::spawn(move || {
            while !manager.stop_requested() {
                if !manager.all_present() {
                    warn!(
                        "a declared artifact of {} disappeared, stopping",
                        manager.shm_id
                    );
                    manager.request_stop();
                    break;
                }
                thread::sleep(PRESENCE_POLL);
            }
        })
    }
}

impl Drop for ShmManager {
    fn drop(&mut self) {
        // Regions unlink their own artifacts; the sweep catches segments
        // and anything a crashed peer left in the namespace.
        self.regions.lock().clear();
        self.segments.lock().clear();
        if let Err(e) = Monitor::cleanup(self.shm_id) {
            warn!("final cleanup of {} failed: {}", self.shm_id, e);
        }
    }
}
