//! framelink - Shared Memory Transport Core
//!
//! Zero-copy exchange of large payloads between cooperating processes on
//! one host. A producer creates an unmanaged [`Region`], peers attach to
//! it by name, use the bytes in place, and hand each byte-range back
//! through an out-of-band acknowledgement queue so the producer can reuse
//! the buffer. Managed [`Segment`]s add an embedded allocator; the
//! [`Monitor`] and the `shmmanager` supervisor take care of the namespace
//! directory and artifact lifetime.

pub mod error;
pub mod mapping;
pub mod monitor;
pub mod queue;
pub mod region;
pub mod segment;
pub mod supervisor;

pub use error::*;
pub use mapping::*;
pub use monitor::*;
pub use queue::*;
pub use region::*;
pub use segment::*;
pub use supervisor::{
    install_signal_handlers, ShmManager, ShmManagerConfig, PRESENCE_POLL, RESET_POLL,
};

/// Re-export the shared core types.
pub use framelink_core::{
    blocks_as_bytes, blocks_as_bytes_mut, region_name, region_queue_name, segment_name,
    AllocStrategy, NumaMode, RegionBlock, RegionId, RegionSpec, SegmentId, SegmentSpec, ShmId,
    ACK_BUNCH_SIZE, ACK_QUEUE_CAPACITY, REGION_BLOCK_SIZE,
};
