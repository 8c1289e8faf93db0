//! framelink - Core Module
//!
//! Common types shared by every process participating in a framelink
//! shared-memory group: the shm-id namespace and its canonical naming
//! scheme, the `RegionBlock` acknowledgement record, and the
//! configuration surface of the supervisor.

pub mod block;
pub mod config;
pub mod ids;

pub use block::*;
pub use config::*;
pub use ids::*;

/// Number of `RegionBlock` records carried by one acknowledgement batch.
/// Both the queue record width and the send-batch target.
pub const ACK_BUNCH_SIZE: usize = 256;

/// Capacity of a region acknowledgement queue, in messages.
pub const ACK_QUEUE_CAPACITY: usize = 1024;
