//! Bounded inter-process FIFO of acknowledgement batches
//!
//! One queue per region, named `fmq_<shmId>_rgq_<regionId>`. Messages are
//! whole batches of `RegionBlock` records; the record size is fixed at
//! creation and both ends must agree on it, otherwise the queue is treated
//! as poisoned at attach time. The queue lives in its own shared-memory
//! object: a fixed header plus `capacity` sequence-stamped slots, driven
//! entirely by atomics inside the mapping so any number of producer and
//! consumer processes are safe by construction.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tracing::trace;

use framelink_core::NumaMode;

use crate::error::{Result, ShmemError};
use crate::mapping::MappedRegion;

/// Identifies an initialized acknowledgement queue mapping.
pub const ACK_QUEUE_MAGIC: u32 = 0x4651_4151; // "FQAQ"

const HEADER_SIZE: usize = 64;
const SLOT_HEADER_SIZE: usize = 16;

/// Sleep between receive polls once the initial spin is exhausted.
const RECV_POLL: Duration = Duration::from_micros(500);

#[repr(C)]
struct QueueHeader {
    magic: AtomicU32,
    ready: AtomicU32,
    msg_size: AtomicU64,
    capacity: AtomicU64,
    enqueue_pos: AtomicU64,
    dequeue_pos: AtomicU64,
    _pad: [u64; 3],
}

struct Slot<'a> {
    seq: &'a AtomicU64,
    len: &'a AtomicU64,
    data: *mut u8,
}

/// Typed bounded FIFO carrying one batch per message.
pub struct AckQueue {
    mapping: MappedRegion,
    msg_size: usize,
    capacity: u64,
    stride: usize,
}

impl AckQueue {
    /// Create the queue object with the given geometry. `capacity` must be
    /// a power of two. Fails with `RegionAlreadyExists` on name collision.
    pub fn create(name: &str, capacity: usize, msg_size: usize) -> Result<Self> {
        if capacity == 0 || !capacity.is_power_of_two() {
            return Err(ShmemError::Config(format!(
                "queue capacity must be a power of two, got {}",
                capacity
            )));
        }
        if msg_size == 0 {
            return Err(ShmemError::Config("queue record size must be non-zero".into()));
        }

        let stride = slot_stride(msg_size);
        let total = HEADER_SIZE + capacity * stride;
        let mapping = MappedRegion::create(name, total, None, NumaMode::Disabled)?;

        let queue = AckQueue {
            mapping,
            msg_size,
            capacity: capacity as u64,
            stride,
        };

        let header = queue.header();
        header.magic.store(ACK_QUEUE_MAGIC, Ordering::Relaxed);
        header.msg_size.store(msg_size as u64, Ordering::Relaxed);
        header.capacity.store(capacity as u64, Ordering::Relaxed);
        header.enqueue_pos.store(0, Ordering::Relaxed);
        header.dequeue_pos.store(0, Ordering::Relaxed);
        for i in 0..capacity as u64 {
            queue.slot(i).seq.store(i, Ordering::Relaxed);
        }
        // Publish: peers spin on `ready` until the geometry above is visible.
        header.ready.store(ACK_QUEUE_MAGIC, Ordering::Release);

        trace!("shmem: initialized queue: {} ({} x {} bytes)", name, capacity, msg_size);
        Ok(queue)
    }

    /// Attach to an existing queue and validate its geometry against the
    /// caller's expectation. A mismatch poisons the queue deterministically
    /// before any message moves.
    pub fn open(name: &str, capacity: usize, msg_size: usize) -> Result<Self> {
        let mapping = MappedRegion::open(name, None)?;
        if mapping.size() < HEADER_SIZE {
            return Err(ShmemError::ProtocolDesync(format!(
                "queue '{}' mapping too small ({} bytes)",
                name,
                mapping.size()
            )));
        }

        let stride = slot_stride(msg_size);
        let queue = AckQueue {
            mapping,
            msg_size,
            capacity: capacity as u64,
            stride,
        };

        // The creator publishes `ready` last; wait out the window between
        // object creation and header initialization.
        let header = queue.header();
        let deadline = Instant::now() + Duration::from_millis(500);
        while header.ready.load(Ordering::Acquire) != ACK_QUEUE_MAGIC {
            if Instant::now() >= deadline {
                return Err(ShmemError::ProtocolDesync(format!(
                    "queue '{}' never became ready",
                    name
                )));
            }
            std::thread::sleep(Duration::from_millis(1));
        }

        let found_msg = header.msg_size.load(Ordering::Relaxed);
        let found_cap = header.capacity.load(Ordering::Relaxed);
        if header.magic.load(Ordering::Relaxed) != ACK_QUEUE_MAGIC
            || found_msg != msg_size as u64
            || found_cap != capacity as u64
        {
            return Err(ShmemError::ProtocolDesync(format!(
                "queue '{}' geometry mismatch: peer has {} x {} bytes, expected {} x {}",
                name, found_cap, found_msg, capacity, msg_size
            )));
        }
        if queue.mapping.size() < HEADER_SIZE + capacity * stride {
            return Err(ShmemError::ProtocolDesync(format!(
                "queue '{}' mapping truncated",
                name
            )));
        }

        trace!("shmem: attached queue: {}", name);
        Ok(queue)
    }

    /// Non-blocking enqueue of one whole message. `Ok(false)` means the
    /// queue is full (back-pressure, not an error).
    pub fn try_send(&self, msg: &[u8]) -> Result<bool> {
        if msg.len() > self.msg_size {
            return Err(ShmemError::ProtocolDesync(format!(
                "message of {} bytes exceeds queue record size {}",
                msg.len(),
                self.msg_size
            )));
        }

        let header = self.header();
        let mask = self.capacity - 1;
        let mut pos = header.enqueue_pos.load(Ordering::Relaxed);
        loop {
            let slot = self.slot(pos & mask);
            let seq = slot.seq.load(Ordering::Acquire);
            let dif = seq as i64 - pos as i64;
            if dif == 0 {
                match header.enqueue_pos.compare_exchange_weak(
                    pos,
                    pos + 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        unsafe {
                            std::ptr::copy_nonoverlapping(msg.as_ptr(), slot.data, msg.len());
                        }
                        slot.len.store(msg.len() as u64, Ordering::Relaxed);
                        slot.seq.store(pos + 1, Ordering::Release);
                        return Ok(true);
                    }
                    Err(current) => pos = current,
                }
            } else if dif < 0 {
                return Ok(false);
            } else {
                pos = header.enqueue_pos.load(Ordering::Relaxed);
            }
        }
    }

    /// Non-blocking dequeue of one whole message into `buf`.
    pub fn try_receive(&self, buf: &mut [u8]) -> Result<Option<usize>> {
        let header = self.header();
        let mask = self.capacity - 1;
        let mut pos = header.dequeue_pos.load(Ordering::Relaxed);
        loop {
            let slot = self.slot(pos & mask);
            let seq = slot.seq.load(Ordering::Acquire);
            let dif = seq as i64 - (pos + 1) as i64;
            if dif == 0 {
                match header.dequeue_pos.compare_exchange_weak(
                    pos,
                    pos + 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        let len = slot.len.load(Ordering::Relaxed) as usize;
                        let n = len.min(buf.len());
                        unsafe {
                            std::ptr::copy_nonoverlapping(slot.data, buf.as_mut_ptr(), n);
                        }
                        slot.seq.store(pos + self.capacity, Ordering::Release);
                        if len > buf.len() {
                            return Err(ShmemError::ProtocolDesync(format!(
                                "received {} bytes into a {}-byte buffer",
                                len,
                                buf.len()
                            )));
                        }
                        return Ok(Some(len));
                    }
                    Err(current) => pos = current,
                }
            } else if dif < 0 {
                return Ok(None);
            } else {
                pos = header.dequeue_pos.load(Ordering::Relaxed);
            }
        }
    }

    /// Dequeue one message, waiting at most `timeout`. Returns `None` when
    /// the deadline passes with the queue still empty.
    pub fn timed_receive(&self, buf: &mut [u8], timeout: Duration) -> Result<Option<usize>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(n) = self.try_receive(buf)? {
                return Ok(Some(n));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            std::thread::sleep(RECV_POLL);
        }
    }

    /// Approximate number of queued messages.
    pub fn len(&self) -> u64 {
        let header = self.header();
        header
            .enqueue_pos
            .load(Ordering::Relaxed)
            .saturating_sub(header.dequeue_pos.load(Ordering::Relaxed))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn msg_size(&self) -> usize {
        self.msg_size
    }

    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    pub fn name(&self) -> &str {
        self.mapping.name()
    }

    /// Destroy the kernel object. Only the local role calls this, at
    /// teardown. Returns whether an object was removed.
    pub fn unlink(name: &str) -> bool {
        MappedRegion::remove(name)
    }

    fn header(&self) -> &QueueHeader {
        unsafe { &*(self.mapping.as_ptr() as *const QueueHeader) }
    }

    fn slot(&self, idx: u64) -> Slot<'_> {
        unsafe {
            let base = self
                .mapping
                .as_ptr()
                .add(HEADER_SIZE + idx as usize * self.stride);
            Slot {
                seq: &*(base as *const AtomicU64),
                len: &*(base.add(8) as *const AtomicU64),
                data: base.add(SLOT_HEADER_SIZE),
            }
        }
    }
}

impl std::fmt::Debug for AckQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AckQueue")
            .field("name", &self.mapping.name())
            .field("capacity", &self.capacity)
            .field("msg_size", &self.msg_size)
            .finish()
    }
}

fn slot_stride(msg_size: usize) -> usize {
    (SLOT_HEADER_SIZE + msg_size + 7) & !7
}
