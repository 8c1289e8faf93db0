//! Directory of shared-memory artifacts under one shm-id namespace
//!
//! Nothing here is stored: the directory is computed by probing the
//! canonical naming scheme. All operations are safe to run from any
//! process; `reset_content` additionally requires peers to be quiescent
//! (a contract on the caller, not enforced).

use std::path::Path;

use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use tracing::{debug, trace};

use framelink_core::{region_name, segment_name, RegionId, RegionSpec, SegmentId, SegmentSpec, ShmId};

use crate::error::{Result, ShmemError};
use crate::mapping::MappedRegion;
use crate::segment::Segment;

/// Mount point of POSIX shared-memory objects.
const SHM_MOUNT: &str = "/dev/shm";

/// Stateless facade over the naming scheme.
pub struct Monitor;

impl Monitor {
    /// Whether the region object exists in the kernel namespace.
    pub fn region_is_present(shm_id: ShmId, id: RegionId) -> bool {
        object_present(&region_name(shm_id, id))
    }

    /// Whether the segment object exists in the kernel namespace.
    pub fn segment_is_present(shm_id: ShmId, id: SegmentId) -> bool {
        object_present(&segment_name(shm_id, id))
    }

    /// Remove every shared-memory object whose name begins with the shm-id
    /// prefix: regions, acknowledgement queues and segments alike.
    /// Idempotent; returns the names actually removed.
    pub fn cleanup(shm_id: ShmId) -> Result<Vec<String>> {
        let prefix = shm_id.prefix();
        let mut removed = Vec::new();

        let entries = std::fs::read_dir(SHM_MOUNT).map_err(ShmemError::BackingIo)?;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with(&prefix) && MappedRegion::remove(name) {
                trace!("cleanup: removed '{}'", name);
                removed.push(name.to_string());
            }
        }

        debug!("cleanup of {}: {} object(s) removed", shm_id, removed.len());
        Ok(removed)
    }

    /// Companion sweep for file-backed regions living on a mount path.
    pub fn cleanup_files(shm_id: ShmId, dir: &Path) -> Result<Vec<String>> {
        let prefix = shm_id.prefix();
        let mut removed = Vec::new();

        let entries = std::fs::read_dir(dir).map_err(ShmemError::BackingIo)?;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with(&prefix) && std::fs::remove_file(entry.path()).is_ok() {
                trace!("cleanup: removed file '{}'", name);
                removed.push(name.to_string());
            }
        }
        Ok(removed)
    }

    /// Re-initialize the declared artifacts in place: segments get a fresh
    /// allocator header (without unmapping), regions get their bytes
    /// zeroed. Artifacts that are not present are skipped.
    pub fn reset_content(
        shm_id: ShmId,
        segments: &[SegmentSpec],
        regions: &[RegionSpec],
    ) -> Result<()> {
        for spec in segments {
            if !Self::segment_is_present(shm_id, spec.id) {
                debug!("reset: segment {} of {} not present, skipped", spec.id, shm_id);
                continue;
            }
            let segment = Segment::open(shm_id, spec.id)?;
            segment.reset();
            debug!("reset: segment {} of {} re-initialized", spec.id, shm_id);
        }

        for spec in regions {
            if !Self::region_is_present(shm_id, spec.id) {
                debug!("reset: region {} of {} not present, skipped", spec.id, shm_id);
                continue;
            }
            let mut mapping = MappedRegion::open(&region_name(shm_id, spec.id), None)?;
            mapping.zero();
            debug!("reset: region {} of {} zeroed", spec.id, shm_id);
        }

        Ok(())
    }
}

fn object_present(name: &str) -> bool {
    nix::sys::mman::shm_open(name, OFlag::O_RDONLY, Mode::empty()).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use framelink_core::{AllocStrategy, NumaMode};

    fn test_shm_id(salt: u16) -> ShmId {
        ShmId::new((std::process::id() as u64) << 16 | salt as u64)
    }

    #[test]
    fn presence_follows_the_object_lifecycle() {
        let shm_id = test_shm_id(30);
        assert!(!Monitor::region_is_present(shm_id, 7));

        let name = region_name(shm_id, 7);
        let _mapping = MappedRegion::create(&name, 4096, None, NumaMode::Disabled).unwrap();
        assert!(Monitor::region_is_present(shm_id, 7));

        MappedRegion::remove(&name);
        assert!(!Monitor::region_is_present(shm_id, 7));
    }

    #[test]
    fn cleanup_is_idempotent() {
        let shm_id = test_shm_id(31);
        let _region =
            MappedRegion::create(&region_name(shm_id, 1), 4096, None, NumaMode::Disabled).unwrap();
        let _segment =
            Segment::create(shm_id, 2, 8192, AllocStrategy::RbTreeBestFit, NumaMode::Disabled)
                .unwrap();

        let removed = Monitor::cleanup(shm_id).unwrap();
        assert_eq!(removed.len(), 2);
        assert!(!Monitor::region_is_present(shm_id, 1));
        assert!(!Monitor::segment_is_present(shm_id, 2));

        // Second run observes the same kernel state and removes nothing.
        let removed = Monitor::cleanup(shm_id).unwrap();
        assert!(removed.is_empty());
    }

    #[test]
    fn cleanup_ignores_other_namespaces() {
        let ours = test_shm_id(32);
        let theirs = test_shm_id(33);
        let _foreign =
            MappedRegion::create(&region_name(theirs, 1), 4096, None, NumaMode::Disabled).unwrap();

        Monitor::cleanup(ours).unwrap();
        assert!(Monitor::region_is_present(theirs, 1));
        Monitor::cleanup(theirs).unwrap();
    }

    #[test]
    fn reset_content_zeroes_regions_and_resets_segments() {
        let shm_id = test_shm_id(34);
        let segment =
            Segment::create(shm_id, 1, 32768, AllocStrategy::RbTreeBestFit, NumaMode::Disabled)
                .unwrap();
        let full = segment.free_bytes();
        segment.allocate(1024, 0).unwrap();
        segment.allocate(1024, 0).unwrap();

        let mut region_map =
            MappedRegion::create(&region_name(shm_id, 2), 4096, None, NumaMode::Disabled).unwrap();
        region_map.zero();
        unsafe { *region_map.as_ptr().add(100) = 0xEE };

        let segments = [SegmentSpec { id: 1, size: 32768, numa: NumaMode::Disabled }];
        let regions = [RegionSpec { id: 2, size: 4096, numa: NumaMode::Disabled }];
        Monitor::reset_content(shm_id, &segments, &regions).unwrap();

        unsafe { assert_eq!(*region_map.as_ptr().add(100), 0) };
        assert_eq!(segment.free_bytes(), full);
        let h = segment.allocate(full - 16, 0).unwrap();
        segment.deallocate(h).unwrap();

        drop(region_map);
        drop(segment);
        Monitor::cleanup(shm_id).unwrap();
    }

    #[test]
    fn reset_content_skips_missing_artifacts() {
        let shm_id = test_shm_id(35);
        let segments = [SegmentSpec { id: 9, size: 4096, numa: NumaMode::Disabled }];
        let regions = [RegionSpec { id: 9, size: 4096, numa: NumaMode::Disabled }];
        Monitor::reset_content(shm_id, &segments, &regions).unwrap();
    }
}
