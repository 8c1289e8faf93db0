//! Managed shared-memory segments
//!
//! A [`Segment`] is a mapping named `fmq_<shmId>_sg_<id>` with a best-fit
//! allocator embedded at its base, so that handles (byte offsets) minted in
//! one process are meaningful in every process attached to the segment.
//! All allocator state lives inside the mapping and is expressed as
//! offsets, never pointers.
//!
//! The allocation strategy is the string-named tag `rbtree_best_fit`, the
//! only supported value at present; free space is kept as an address-ordered
//! chunk list with tail splitting on allocation and neighbor coalescing on
//! deallocation.
//!
//! Allocator mutations within one process are serialized by a mutex.
//! Cross-process mutation requires the callers to coordinate; in the
//! keep-alive deployment the supervisor is the single owner.

use parking_lot::Mutex;
use tracing::trace;

use framelink_core::{segment_name, AllocStrategy, NumaMode, SegmentId, ShmId};

use crate::error::{Result, ShmemError};
use crate::mapping::MappedRegion;

/// Identifies an initialized segment mapping.
pub const SEGMENT_MAGIC: u32 = 0x4651_5347; // "FQSG"

const HEADER_SIZE: u64 = 64;
/// Every chunk starts 16-aligned and carries a 16-byte prefix before the
/// user bytes.
const CHUNK_ALIGN: u64 = 16;
const PREFIX_SIZE: u64 = 16;
/// Smallest splittable remainder; anything less is absorbed by the
/// allocation.
const MIN_CHUNK: u64 = 32;

#[repr(C)]
struct SegmentHeader {
    magic: u32,
    strategy: u32,
    total_size: u64,
    free_head: u64,
    free_bytes: u64,
    alloc_count: u64,
    _pad: [u64; 3],
}

/// A free span of the segment: `size` covers the whole chunk, `next` is the
/// offset of the following free chunk (0 terminates the list).
#[derive(Debug, Clone, Copy)]
#[repr(C)]
struct FreeChunk {
    size: u64,
    next: u64,
}

/// Prefix written immediately before every allocated range, so
/// `deallocate` can recover the chunk it was carved from.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
struct AllocPrefix {
    chunk_off: u64,
    chunk_size: u64,
}

/// A managed shared-memory mapping with an embedded allocator.
pub struct Segment {
    mapping: MappedRegion,
    strategy: AllocStrategy,
    alloc_mtx: Mutex<()>,
}

impl Segment {
    /// Create the segment object (exclusive) and initialize the allocator
    /// header at its base.
    pub fn create(
        shm_id: ShmId,
        id: SegmentId,
        size: u64,
        strategy: AllocStrategy,
        numa: NumaMode,
    ) -> Result<Self> {
        if size < HEADER_SIZE + MIN_CHUNK {
            return Err(ShmemError::Config(format!(
                "segment {} of {} bytes is too small to hold the allocator",
                id, size
            )));
        }

        let name = segment_name(shm_id, id);
        let mapping = MappedRegion::create(&name, size as usize, None, numa)?;
        let segment = Segment {
            mapping,
            strategy,
            alloc_mtx: Mutex::new(()),
        };
        segment.init_header();

        trace!(
            "shmem: initialized segment: {} ({} bytes, {})",
            name,
            size,
            strategy.as_str()
        );
        Ok(segment)
    }

    /// Attach to an existing segment and validate its header.
    pub fn open(shm_id: ShmId, id: SegmentId) -> Result<Self> {
        let name = segment_name(shm_id, id);
        let mapping = MappedRegion::open(&name, None)?;
        if mapping.size() < (HEADER_SIZE + MIN_CHUNK) as usize {
            return Err(ShmemError::ProtocolDesync(format!(
                "segment '{}' mapping too small",
                name
            )));
        }

        let segment = Segment {
            mapping,
            strategy: AllocStrategy::RbTreeBestFit,
            alloc_mtx: Mutex::new(()),
        };
        let header = unsafe { &*segment.header() };
        if header.magic != SEGMENT_MAGIC {
            return Err(ShmemError::ProtocolDesync(format!(
                "segment '{}' carries no allocator header",
                name
            )));
        }
        Ok(segment)
    }

    /// Best-fit allocation of `size` bytes at the given alignment. Returns
    /// the handle (byte offset from the segment base) of the range.
    pub fn allocate(&self, size: u64, align: u64) -> Result<u64> {
        if size == 0 {
            return Err(ShmemError::Config("zero-size segment allocation".into()));
        }
        if align != 0 && !align.is_power_of_two() {
            return Err(ShmemError::Config(format!(
                "allocation alignment {} is not a power of two",
                align
            )));
        }
        let align = align.max(CHUNK_ALIGN);

        let _guard = self.alloc_mtx.lock();
        let header = unsafe { &mut *self.header() };

        // Best fit: smallest free chunk that can hold the aligned range.
        let mut best: Option<(u64, u64, FreeChunk, u64, u64)> = None;
        let mut prev = 0u64;
        let mut cur = header.free_head;
        while cur != 0 {
            let chunk = unsafe { self.read_free(cur) };
            let user = align_up(cur + PREFIX_SIZE, align);
            let span = align_up(user + size - cur, CHUNK_ALIGN);
            if span <= chunk.size && best.map_or(true, |(_, _, b, _, _)| chunk.size < b.size) {
                best = Some((prev, cur, chunk, user, span));
            }
            prev = cur;
            cur = chunk.next;
        }

        let (prev, off, chunk, user, span) = best.ok_or(ShmemError::BadAlloc {
            requested: size,
            free: header.free_bytes,
        })?;

        let leftover = chunk.size - span;
        let (taken, next) = if leftover >= MIN_CHUNK {
            let tail = off + span;
            unsafe {
                self.write_free(
                    tail,
                    FreeChunk {
                        size: leftover,
                        next: chunk.next,
                    },
                )
            };
            (span, tail)
        } else {
            (chunk.size, chunk.next)
        };

        if prev == 0 {
            header.free_head = next;
        } else {
            let mut p = unsafe { self.read_free(prev) };
            p.next = next;
            unsafe { self.write_free(prev, p) };
        }

        unsafe {
            self.write_prefix(
                user,
                AllocPrefix {
                    chunk_off: off,
                    chunk_size: taken,
                },
            )
        };
        header.free_bytes -= taken;
        header.alloc_count += 1;
        Ok(user)
    }

    /// Return a range previously minted by [`Segment::allocate`]. Adjacent
    /// free chunks are coalesced.
    pub fn deallocate(&self, handle: u64) -> Result<()> {
        let total = self.mapping.size() as u64;
        if handle < HEADER_SIZE + PREFIX_SIZE || handle > total {
            return Err(ShmemError::Platform(format!(
                "deallocation handle {} outside segment", handle
            )));
        }

        let _guard = self.alloc_mtx.lock();
        let header = unsafe { &mut *self.header() };

        let prefix = unsafe { self.read_prefix(handle) };
        let (off, size) = (prefix.chunk_off, prefix.chunk_size);
        if off < HEADER_SIZE
            || off % CHUNK_ALIGN != 0
            || size < MIN_CHUNK
            || off + PREFIX_SIZE > handle
            || off + size > total
        {
            return Err(ShmemError::Platform(format!(
                "corrupt allocation prefix at handle {}", handle
            )));
        }

        // Walk to the insertion point of the address-ordered free list.
        let mut prev = 0u64;
        let mut cur = header.free_head;
        while cur != 0 && cur < off {
            prev = cur;
            cur = unsafe { self.read_free(cur) }.next;
        }

        let mut merged = FreeChunk { size, next: cur };
        if cur != 0 && off + size == cur {
            let next_chunk = unsafe { self.read_free(cur) };
            merged.size += next_chunk.size;
            merged.next = next_chunk.next;
        }

        if prev != 0 {
            let mut p = unsafe { self.read_free(prev) };
            if prev + p.size == off {
                p.size += merged.size;
                p.next = merged.next;
                unsafe { self.write_free(prev, p) };
            } else {
                p.next = off;
                unsafe { self.write_free(prev, p) };
                unsafe { self.write_free(off, merged) };
            }
        } else {
            header.free_head = off;
            unsafe { self.write_free(off, merged) };
        }

        header.free_bytes += size;
        header.alloc_count -= 1;
        Ok(())
    }

    /// Re-initialize the allocator header in place, forgetting every
    /// allocation. Peers must be quiescent.
    pub fn reset(&self) {
        let _guard = self.alloc_mtx.lock();
        self.init_header();
    }

    /// Zero the full mapping and re-initialize the allocator header.
    pub fn zero(&mut self) {
        self.mapping.zero();
        self.init_header();
    }

    /// Pin the mapping into RAM (best-effort).
    pub fn lock(&mut self) {
        self.mapping.lock();
    }

    pub fn free_bytes(&self) -> u64 {
        let _guard = self.alloc_mtx.lock();
        unsafe { &*self.header() }.free_bytes
    }

    pub fn alloc_count(&self) -> u64 {
        let _guard = self.alloc_mtx.lock();
        unsafe { &*self.header() }.alloc_count
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.mapping.as_ptr()
    }

    pub fn size(&self) -> usize {
        self.mapping.size()
    }

    pub fn name(&self) -> &str {
        self.mapping.name()
    }

    pub fn strategy(&self) -> AllocStrategy {
        self.strategy
    }

    /// Remove a segment object by name. Returns whether one was removed.
    pub fn remove(shm_id: ShmId, id: SegmentId) -> bool {
        MappedRegion::remove(&segment_name(shm_id, id))
    }

    fn init_header(&self) {
        let total = self.mapping.size() as u64;
        let first = HEADER_SIZE;
        unsafe {
            self.write_free(
                first,
                FreeChunk {
                    size: total - first,
                    next: 0,
                },
            );
            std::ptr::write(
                self.header(),
                SegmentHeader {
                    magic: SEGMENT_MAGIC,
                    strategy: 1,
                    total_size: total,
                    free_head: first,
                    free_bytes: total - first,
                    alloc_count: 0,
                    _pad: [0; 3],
                },
            );
        }
    }

    fn header(&self) -> *mut SegmentHeader {
        self.mapping.as_ptr() as *mut SegmentHeader
    }

    unsafe fn read_free(&self, off: u64) -> FreeChunk {
        std::ptr::read(self.mapping.as_ptr().add(off as usize) as *const FreeChunk)
    }

    unsafe fn write_free(&self, off: u64, chunk: FreeChunk) {
        std::ptr::write(self.mapping.as_ptr().add(off as usize) as *mut FreeChunk, chunk)
    }

    unsafe fn read_prefix(&self, handle: u64) -> AllocPrefix {
        std::ptr::read(
            self.mapping.as_ptr().add((handle - PREFIX_SIZE) as usize) as *const AllocPrefix
        )
    }

    unsafe fn write_prefix(&self, handle: u64, prefix: AllocPrefix) {
        std::ptr::write(
            self.mapping.as_ptr().add((handle - PREFIX_SIZE) as usize) as *mut AllocPrefix,
            prefix,
        )
    }
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("name", &self.mapping.name())
            .field("size", &self.mapping.size())
            .field("strategy", &self.strategy.as_str())
            .finish()
    }
}

fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_shm_id(salt: u16) -> ShmId {
        ShmId::new((std::process::id() as u64) << 16 | salt as u64)
    }

    struct Remove(ShmId, SegmentId);
    impl Drop for Remove {
        fn drop(&mut self) {
            Segment::remove(self.0, self.1);
        }
    }

    #[test]
    fn allocate_and_deallocate_round_trip() {
        let shm_id = test_shm_id(20);
        let _guard = Remove(shm_id, 1);
        let seg = Segment::create(shm_id, 1, 65536, AllocStrategy::RbTreeBestFit, NumaMode::Disabled)
            .unwrap();

        let before = seg.free_bytes();
        let a = seg.allocate(100, 0).unwrap();
        let b = seg.allocate(100, 0).unwrap();
        assert_ne!(a, b);
        assert_eq!(a % 16, 0);
        assert_eq!(seg.alloc_count(), 2);
        assert!(seg.free_bytes() < before);

        seg.deallocate(a).unwrap();
        seg.deallocate(b).unwrap();
        assert_eq!(seg.alloc_count(), 0);
        assert_eq!(seg.free_bytes(), before);
    }

    #[test]
    fn coalescing_restores_the_full_span() {
        let shm_id = test_shm_id(21);
        let _guard = Remove(shm_id, 1);
        let seg = Segment::create(shm_id, 1, 16384, AllocStrategy::RbTreeBestFit, NumaMode::Disabled)
            .unwrap();

        let handles: Vec<u64> = (0..8).map(|_| seg.allocate(512, 0).unwrap()).collect();
        // Free in an interleaved order to force both-neighbor merges.
        for &h in handles.iter().step_by(2) {
            seg.deallocate(h).unwrap();
        }
        for &h in handles.iter().skip(1).step_by(2) {
            seg.deallocate(h).unwrap();
        }

        // One fully coalesced chunk again: a max-size allocation fits.
        let max = seg.free_bytes() - PREFIX_SIZE;
        let h = seg.allocate(max, 0).unwrap();
        seg.deallocate(h).unwrap();
    }

    #[test]
    fn best_fit_prefers_the_tightest_hole() {
        let shm_id = test_shm_id(22);
        let _guard = Remove(shm_id, 1);
        let seg = Segment::create(shm_id, 1, 65536, AllocStrategy::RbTreeBestFit, NumaMode::Disabled)
            .unwrap();

        // Carve [big hole][plug][small hole][plug][tail].
        let big = seg.allocate(4096, 0).unwrap();
        let _plug1 = seg.allocate(64, 0).unwrap();
        let small = seg.allocate(512, 0).unwrap();
        let _plug2 = seg.allocate(64, 0).unwrap();
        seg.deallocate(big).unwrap();
        seg.deallocate(small).unwrap();

        // A request fitting both holes lands in the tighter one.
        let h = seg.allocate(256, 0).unwrap();
        assert_eq!(h, small);
    }

    #[test]
    fn exhaustion_raises_bad_alloc() {
        let shm_id = test_shm_id(23);
        let _guard = Remove(shm_id, 1);
        let seg = Segment::create(shm_id, 1, 4096, AllocStrategy::RbTreeBestFit, NumaMode::Disabled)
            .unwrap();

        let err = seg.allocate(1 << 20, 0).unwrap_err();
        assert!(matches!(err, ShmemError::BadAlloc { .. }));
    }

    #[test]
    fn alignment_is_honored() {
        let shm_id = test_shm_id(24);
        let _guard = Remove(shm_id, 1);
        let seg = Segment::create(shm_id, 1, 65536, AllocStrategy::RbTreeBestFit, NumaMode::Disabled)
            .unwrap();

        let _skew = seg.allocate(24, 0).unwrap();
        let h = seg.allocate(100, 256).unwrap();
        assert_eq!(h % 256, 0);
        seg.deallocate(h).unwrap();

        assert!(matches!(
            seg.allocate(8, 3),
            Err(ShmemError::Config(_))
        ));
    }

    #[test]
    fn reset_forgets_all_allocations() {
        let shm_id = test_shm_id(25);
        let _guard = Remove(shm_id, 1);
        let seg = Segment::create(shm_id, 1, 32768, AllocStrategy::RbTreeBestFit, NumaMode::Disabled)
            .unwrap();

        let full = seg.free_bytes();
        for _ in 0..10 {
            seg.allocate(256, 0).unwrap();
        }
        assert!(seg.free_bytes() < full);

        seg.reset();
        assert_eq!(seg.free_bytes(), full);
        assert_eq!(seg.alloc_count(), 0);
        let h = seg.allocate(full - PREFIX_SIZE, 0).unwrap();
        assert_eq!(seg.free_bytes(), 0);
        seg.deallocate(h).unwrap();
    }

    #[test]
    fn open_validates_the_header() {
        let shm_id = test_shm_id(26);
        let _guard = Remove(shm_id, 1);
        let created = Segment::create(shm_id, 1, 16384, AllocStrategy::RbTreeBestFit, NumaMode::Disabled)
            .unwrap();

        let attached = Segment::open(shm_id, 1).unwrap();
        assert_eq!(attached.size(), 16384);

        // Handles minted by one attachment are valid through the other.
        let h = created.allocate(128, 0).unwrap();
        attached.deallocate(h).unwrap();
        drop(attached);
        drop(created);
    }
}
