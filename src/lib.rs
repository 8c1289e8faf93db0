//! framelink
//!
//! Shared-memory transport core for high-throughput data-acquisition
//! pipelines: unmanaged regions with a block release protocol, managed
//! segments, a namespace monitor, and the `shmmanager` keep-alive
//! supervisor.

pub use framelink_core;
pub use framelink_shmem;

pub use framelink_shmem::{
    AckHandler, AckQueue, MappedRegion, Monitor, Region, RegionBlock, RegionConfig, Segment,
    ShmId, ShmManager, ShmemError,
};
