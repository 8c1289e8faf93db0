//! Unmanaged shared-memory regions and the block release protocol
//!
//! A [`Region`] ties one [`MappedRegion`] to one [`AckQueue`]. The process
//! that creates a region (the local role) owns the storage, runs the
//! acks-receiver worker and destroys every named artifact on teardown. A
//! process that attaches (the remote role) runs the acks-sender worker,
//! releases byte-ranges back to the owner through the queue, and removes
//! nothing when it detaches.
//!
//! Allocation policy inside the region is entirely the user's; the region
//! guarantees only that the mapping stays valid for its lifetime and that
//! every accepted [`RegionBlock`] is delivered to the owner exactly once
//! (short of a crash).

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{error, trace, warn};

use framelink_core::{
    blocks_as_bytes, blocks_as_bytes_mut, region_name, region_queue_name, NumaMode, RegionBlock,
    RegionId, ShmId, ACK_BUNCH_SIZE, ACK_QUEUE_CAPACITY, REGION_BLOCK_SIZE,
};

use crate::error::{Result, ShmemError};
use crate::mapping::{Backing, MappedRegion};
use crate::queue::AckQueue;

/// Grace period after stop during which outstanding acks are drained.
pub const DEFAULT_LINGER: Duration = Duration::from_millis(100);

/// Receive deadline of the acks-receiver while running.
const RUNNING_RECV_TIMEOUT: Duration = Duration::from_millis(100);

/// Condition-variable wait of the acks-sender between batches.
const SEND_WAIT: Duration = Duration::from_millis(500);

/// Per-block release callback: receives `region base + handle`, the block
/// size, and the user hint.
pub type RegionCallback = Box<dyn FnMut(*mut u8, usize, u64) + Send>;

/// Bulk release callback: invoked exactly once per received batch.
pub type RegionBulkCallback = Box<dyn FnMut(&[AckedBlock]) + Send>;

/// One acknowledged block as delivered to the owner.
#[derive(Debug, Clone, Copy)]
pub struct AckedBlock {
    pub ptr: *mut u8,
    pub size: usize,
    pub hint: u64,
}

/// How the owner wants released blocks delivered. Exactly one shape; a
/// region with `Ignore` is legal — acks are drained and discarded.
pub enum AckHandler {
    Ignore,
    Block(RegionCallback),
    Bulk(RegionBulkCallback),
}

impl std::fmt::Debug for AckHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            AckHandler::Ignore => "AckHandler::Ignore",
            AckHandler::Block(_) => "AckHandler::Block",
            AckHandler::Bulk(_) => "AckHandler::Bulk",
        })
    }
}

/// Role of this process for one region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Local,
    Remote,
}

/// Construction options of a region.
#[derive(Debug, Clone)]
pub struct RegionConfig {
    pub shm_id: ShmId,
    pub id: RegionId,
    /// Size in bytes; only meaningful on create (attach discovers it).
    pub size: u64,
    /// When set, back the region by a file on this mount path instead of a
    /// shared-memory object.
    pub path: Option<PathBuf>,
    pub numa: NumaMode,
    /// Zero the mapping at creation.
    pub zero: bool,
    /// Pin the mapping into RAM at creation (best-effort).
    pub lock: bool,
    pub linger: Duration,
}

impl RegionConfig {
    pub fn new(shm_id: ShmId, id: RegionId, size: u64) -> Self {
        RegionConfig {
            shm_id,
            id,
            size,
            path: None,
            numa: NumaMode::Disabled,
            zero: false,
            lock: false,
            linger: DEFAULT_LINGER,
        }
    }

    pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn numa(mut self, numa: NumaMode) -> Self {
        self.numa = numa;
        self
    }

    pub fn zero(mut self, zero: bool) -> Self {
        self.zero = zero;
        self
    }

    pub fn lock(mut self, lock: bool) -> Self {
        self.lock = lock;
        self
    }

    pub fn linger(mut self, linger: Duration) -> Self {
        self.linger = linger;
        self
    }
}

struct RegionInner {
    role: Role,
    name: String,
    queue_name: String,
    mapping: MappedRegion,
    queue: AckQueue,
    stop: AtomicBool,
    linger_ms: AtomicU64,
    pending: Mutex<Vec<RegionBlock>>,
    send_cv: Condvar,
}

/// An unmanaged shared-memory region with its acknowledgement channel.
pub struct Region {
    inner: Arc<RegionInner>,
    worker: Option<JoinHandle<()>>,
}

impl Region {
    /// Create the region (local role): create and map the storage, create
    /// the acknowledgement queue, and start the acks-receiver worker that
    /// feeds `handler`.
    pub fn create(config: RegionConfig, handler: AckHandler) -> Result<Self> {
        if config.size == 0 {
            return Err(ShmemError::Config(format!(
                "region {} requested with zero size",
                config.id
            )));
        }

        let name = region_name(config.shm_id, config.id);
        let queue_name = region_queue_name(config.shm_id, config.id);

        let mut mapping = MappedRegion::create(
            &name,
            config.size as usize,
            config.path.as_deref(),
            config.numa,
        )?;
        if config.zero {
            mapping.zero();
        }
        if config.lock {
            mapping.lock();
        }

        let queue = match AckQueue::create(
            &queue_name,
            ACK_QUEUE_CAPACITY,
            ACK_BUNCH_SIZE * REGION_BLOCK_SIZE,
        ) {
            Ok(queue) => queue,
            Err(e) => {
                // Leave no half-built artifacts behind.
                remove_storage(&mapping, &name);
                return Err(e);
            }
        };

        let inner = Arc::new(RegionInner {
            role: Role::Local,
            name,
            queue_name,
            mapping,
            queue,
            stop: AtomicBool::new(false),
            linger_ms: AtomicU64::new(config.linger.as_millis() as u64),
            pending: Mutex::new(Vec::new()),
            send_cv: Condvar::new(),
        });

        let worker = spawn_worker("fmq-acks-recv", {
            let inner = inner.clone();
            move || receive_acks(&inner, handler)
        })?;

        trace!("shmem: initialized region: {} (local)", inner.name);
        Ok(Region { inner, worker: Some(worker) })
    }

    /// Attach to an existing region (remote role): open the storage and the
    /// queue, and start the acks-sender worker. Removes nothing on drop.
    pub fn attach(shm_id: ShmId, id: RegionId, path: Option<&Path>) -> Result<Self> {
        let name = region_name(shm_id, id);
        let queue_name = region_queue_name(shm_id, id);

        let mapping = MappedRegion::open(&name, path)?;
        let queue = AckQueue::open(
            &queue_name,
            ACK_QUEUE_CAPACITY,
            ACK_BUNCH_SIZE * REGION_BLOCK_SIZE,
        )?;

        let inner = Arc::new(RegionInner {
            role: Role::Remote,
            name,
            queue_name,
            mapping,
            queue,
            stop: AtomicBool::new(false),
            linger_ms: AtomicU64::new(DEFAULT_LINGER.as_millis() as u64),
            pending: Mutex::new(Vec::new()),
            send_cv: Condvar::new(),
        });

        let worker = spawn_worker("fmq-acks-send", {
            let inner = inner.clone();
            move || send_acks(&inner)
        })?;

        trace!("shmem: initialized region: {} (remote)", inner.name);
        Ok(Region { inner, worker: Some(worker) })
    }

    /// Hand a used byte-range back to the region owner. Never blocks on I/O
    /// and never fails; the block is batched and shipped by the acks-sender.
    /// Blocks released after [`Region::stop_acks`] are dropped.
    pub fn release_block(&self, block: RegionBlock) {
        if self.inner.role == Role::Local {
            warn!("release_block on local region '{}' has no effect", self.inner.name);
            return;
        }
        if self.inner.stop.load(Ordering::Relaxed) {
            warn!("release_block on stopped region '{}', block dropped", self.inner.name);
            return;
        }

        let mut pending = self.inner.pending.lock();
        pending.push(block);
        let full_bunch = pending.len() >= ACK_BUNCH_SIZE;
        drop(pending);

        if full_bunch {
            self.inner.send_cv.notify_one();
        }
    }

    /// Stop the acknowledgement machinery and join the worker.
    ///
    /// Remote role: every block accepted before this call is sent before
    /// the worker exits; if the owner has died and its queue is full this
    /// can stall indefinitely (known limitation of the release protocol).
    /// Local role: the receiver keeps draining until the linger window
    /// passes without traffic, then exits.
    pub fn stop_acks(&mut self) {
        self.inner.stop.store(true, Ordering::SeqCst);
        self.inner.send_cv.notify_one();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }

    /// Grace period granted to outstanding acks at stop time.
    pub fn linger(&self) -> Duration {
        Duration::from_millis(self.inner.linger_ms.load(Ordering::Relaxed))
    }

    pub fn set_linger(&self, linger: Duration) {
        self.inner
            .linger_ms
            .store(linger.as_millis() as u64, Ordering::Relaxed);
    }

    /// Base address of the mapping in this process.
    pub fn as_ptr(&self) -> *mut u8 {
        self.inner.mapping.as_ptr()
    }

    pub fn size(&self) -> usize {
        self.inner.mapping.size()
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_remote(&self) -> bool {
        self.inner.role == Role::Remote
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        self.stop_acks();

        if self.inner.role == Role::Local {
            remove_storage(&self.inner.mapping, &self.inner.name);
            if AckQueue::unlink(&self.inner.queue_name) {
                trace!("region queue '{}' destroyed", self.inner.queue_name);
            }
        }
    }
}

impl std::fmt::Debug for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Region")
            .field("name", &self.inner.name)
            .field("role", &self.inner.role)
            .field("size", &self.inner.mapping.size())
            .finish()
    }
}

fn spawn_worker<F>(name: &str, body: F) -> Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(name.to_string())
        .spawn(body)
        .map_err(|e| ShmemError::Platform(format!("failed to spawn {}: {}", name, e)))
}

fn remove_storage(mapping: &MappedRegion, name: &str) {
    let removed = match mapping.backing() {
        Backing::Shmem => MappedRegion::remove(name),
        Backing::File { path } => MappedRegion::remove_file(path, name),
    };
    if removed {
        trace!("region '{}' destroyed", name);
    }
}

/// Acks-receiver loop (local role). Drains batches from the queue and
/// dispatches them to the handler; after stop, keeps draining with the
/// linger deadline and exits on the first quiet window.
fn receive_acks(inner: &RegionInner, mut handler: AckHandler) {
    let mut blocks = vec![RegionBlock::default(); ACK_BUNCH_SIZE];
    let mut scratch: Vec<AckedBlock> = Vec::with_capacity(ACK_BUNCH_SIZE);

    loop {
        let leave = inner.stop.load(Ordering::Relaxed);
        let window = if leave {
            Duration::from_millis(inner.linger_ms.load(Ordering::Relaxed))
        } else {
            RUNNING_RECV_TIMEOUT
        };

        // One absolute deadline per pass: sustained traffic must not keep
        // the stop flag from being revisited.
        let deadline = Instant::now() + window;
        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let buf = blocks_as_bytes_mut(&mut blocks);
            match inner.queue.timed_receive(buf, deadline - now) {
                Ok(Some(received)) => {
                    if received % REGION_BLOCK_SIZE != 0 {
                        warn!(
                            "discarding malformed ack batch of {} bytes on '{}'",
                            received, inner.queue_name
                        );
                        continue;
                    }
                    let count = received / REGION_BLOCK_SIZE;
                    dispatch(inner, &mut handler, &blocks[..count], &mut scratch);
                }
                Ok(None) => break,
                Err(e) => {
                    error!("ack receive failed on '{}': {}", inner.queue_name, e);
                    break;
                }
            }
        }

        if leave {
            break;
        }
    }

    trace!(
        "AcksReceiver for '{}' leaving (remaining queue size: {})",
        inner.name,
        inner.queue.len()
    );
}

fn dispatch(
    inner: &RegionInner,
    handler: &mut AckHandler,
    batch: &[RegionBlock],
    scratch: &mut Vec<AckedBlock>,
) {
    let base = inner.mapping.as_ptr();
    let region_size = inner.mapping.size() as u64;

    match handler {
        AckHandler::Ignore => {}
        AckHandler::Bulk(callback) => {
            scratch.clear();
            for block in batch {
                if block.handle.saturating_add(block.size) > region_size {
                    warn!(
                        "ack block [{}+{}] outside region '{}', dropped",
                        block.handle, block.size, inner.name
                    );
                    continue;
                }
                scratch.push(AckedBlock {
                    ptr: unsafe { base.add(block.handle as usize) },
                    size: block.size as usize,
                    hint: block.hint,
                });
            }
            if catch_unwind(AssertUnwindSafe(|| callback(scratch))).is_err() {
                error!("bulk release callback panicked for '{}'", inner.name);
            }
        }
        AckHandler::Block(callback) => {
            for block in batch {
                if block.handle.saturating_add(block.size) > region_size {
                    warn!(
                        "ack block [{}+{}] outside region '{}', dropped",
                        block.handle, block.size, inner.name
                    );
                    continue;
                }
                let ptr = unsafe { base.add(block.handle as usize) };
                let size = block.size as usize;
                let hint = block.hint;
                if catch_unwind(AssertUnwindSafe(|| callback(ptr, size, hint))).is_err() {
                    error!("release callback panicked for '{}'", inner.name);
                }
            }
        }
    }
}

/// Acks-sender loop (remote role). Batches pending blocks up to the bunch
/// size and ships them; a full queue is back-pressure, answered by
/// yielding. Once stop is set, a held batch is sent to completion before
/// the worker exits so no accepted block is lost.
fn send_acks(inner: &RegionInner) {
    let mut batch: Vec<RegionBlock> = Vec::with_capacity(ACK_BUNCH_SIZE);

    loop {
        batch.clear();
        {
            let mut pending = inner.pending.lock();
            if pending.len() < ACK_BUNCH_SIZE {
                let _ = inner.send_cv.wait_for(&mut pending, SEND_WAIT);
            }
            let take = pending.len().min(ACK_BUNCH_SIZE);
            let at = pending.len() - take;
            batch.extend(pending.drain(at..));
        }

        if !batch.is_empty() {
            let bytes = blocks_as_bytes(&batch);
            loop {
                match inner.queue.try_send(bytes) {
                    Ok(true) => break,
                    Ok(false) => {
                        // Receiver slow, retry.
                        thread::yield_now();
                    }
                    Err(e) => {
                        error!("ack send failed on '{}': {}", inner.queue_name, e);
                        break;
                    }
                }
            }
        } else if inner.stop.load(Ordering::Relaxed) {
            break;
        }
    }

    trace!(
        "AcksSender for '{}' leaving (blocks left to free: {})",
        inner.name,
        inner.pending.lock().len()
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    fn test_shm_id(salt: u16) -> ShmId {
        ShmId::new((std::process::id() as u64) << 16 | salt as u64)
    }

    fn wait_for(deadline: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let until = Instant::now() + deadline;
        while Instant::now() < until {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        condition()
    }

    #[test]
    fn bulk_release_round_trip() {
        let shm_id = test_shm_id(50);

        // (ptr, size, hint) per delivered block, in delivery order.
        let received: Arc<Mutex<Vec<(usize, usize, u64)>>> = Arc::new(Mutex::new(Vec::new()));
        let batches = Arc::new(AtomicUsize::new(0));

        let handler = {
            let received = received.clone();
            let batches = batches.clone();
            AckHandler::Bulk(Box::new(move |blocks: &[AckedBlock]| {
                batches.fetch_add(1, Ordering::SeqCst);
                let mut received = received.lock();
                for b in blocks {
                    received.push((b.ptr as usize, b.size, b.hint));
                }
            }))
        };

        let local = Region::create(RegionConfig::new(shm_id, 7, 1 << 20), handler).unwrap();
        let base = local.as_ptr() as usize;

        let remote = Region::attach(shm_id, 7, None).unwrap();
        assert!(remote.is_remote());
        assert_eq!(remote.size(), 1 << 20);
        for _ in 0..300 {
            remote.release_block(RegionBlock::new(0, 4096, 42));
        }
        drop(remote);

        assert!(wait_for(Duration::from_secs(5), || received.lock().len() == 300));
        // One message carries at most a bunch, so 300 blocks need >= 2.
        assert!(batches.load(Ordering::SeqCst) >= 2);
        for &(ptr, size, hint) in received.lock().iter() {
            assert_eq!(ptr, base);
            assert_eq!(size, 4096);
            assert_eq!(hint, 42);
        }

        drop(local);
        assert!(matches!(
            Region::attach(shm_id, 7, None),
            Err(ShmemError::RegionNotFound(_))
        ));
    }

    #[test]
    fn stop_acks_drains_outstanding_blocks() {
        let shm_id = test_shm_id(51);

        let delivered = Arc::new(AtomicUsize::new(0));
        let handler = {
            let delivered = delivered.clone();
            AckHandler::Block(Box::new(move |_ptr, _size, _hint| {
                delivered.fetch_add(1, Ordering::SeqCst);
            }))
        };

        let mut local = Region::create(RegionConfig::new(shm_id, 1, 65536), handler).unwrap();
        local.set_linger(Duration::from_millis(500));

        let mut remote = Region::attach(shm_id, 1, None).unwrap();
        for i in 0..10 {
            remote.release_block(RegionBlock::new(i * 4096, 4096, i));
        }

        // The remote flushes its partial bunch while the local receiver is
        // draining inside its linger window.
        let flusher = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            remote.stop_acks();
            remote
        });
        local.stop_acks();
        let remote = flusher.join().unwrap();

        assert_eq!(delivered.load(Ordering::SeqCst), 10);
        drop(remote);
        drop(local);
    }

    #[test]
    fn blocks_of_one_sender_arrive_in_release_order() {
        let shm_id = test_shm_id(52);

        let hints: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));
        let handler = {
            let hints = hints.clone();
            AckHandler::Block(Box::new(move |_ptr, _size, hint| {
                hints.lock().push(hint);
            }))
        };

        let local = Region::create(RegionConfig::new(shm_id, 3, 65536), handler).unwrap();
        let remote = Region::attach(shm_id, 3, None).unwrap();
        for hint in 0..100u64 {
            remote.release_block(RegionBlock::new(0, 16, hint));
        }
        drop(remote);

        assert!(wait_for(Duration::from_secs(5), || hints.lock().len() == 100));
        let hints = hints.lock();
        assert!(hints.iter().copied().eq(0..100));
        drop(local);
    }

    #[test]
    fn second_local_creation_collides() {
        let shm_id = test_shm_id(53);
        let first = Region::create(RegionConfig::new(shm_id, 5, 8192), AckHandler::Ignore).unwrap();
        let err =
            Region::create(RegionConfig::new(shm_id, 5, 8192), AckHandler::Ignore).unwrap_err();
        assert!(matches!(err, ShmemError::RegionAlreadyExists(_)));
        drop(first);
    }

    #[test]
    fn attach_to_missing_region_fails() {
        let err = Region::attach(test_shm_id(54), 9, None).unwrap_err();
        assert!(matches!(err, ShmemError::RegionNotFound(_)));
    }

    #[test]
    fn acks_without_handler_are_discarded() {
        let shm_id = test_shm_id(55);
        let local =
            Region::create(RegionConfig::new(shm_id, 6, 8192), AckHandler::Ignore).unwrap();

        let mut remote = Region::attach(shm_id, 6, None).unwrap();
        for _ in 0..5 {
            remote.release_block(RegionBlock::new(0, 64, 0));
        }
        remote.stop_acks();
        // Released after stop: dropped, not enqueued.
        remote.release_block(RegionBlock::new(0, 64, 0));
        drop(remote);
        drop(local);
    }

    #[test]
    fn panicking_callback_does_not_poison_the_loop() {
        let shm_id = test_shm_id(56);

        let delivered = Arc::new(AtomicUsize::new(0));
        let handler = {
            let delivered = delivered.clone();
            AckHandler::Block(Box::new(move |_ptr, _size, hint| {
                delivered.fetch_add(1, Ordering::SeqCst);
                if hint == 0 {
                    panic!("user callback failure");
                }
            }))
        };

        let local = Region::create(RegionConfig::new(shm_id, 8, 8192), handler).unwrap();
        let remote = Region::attach(shm_id, 8, None).unwrap();
        for hint in 0..3u64 {
            remote.release_block(RegionBlock::new(0, 16, hint));
        }
        drop(remote);

        assert!(wait_for(Duration::from_secs(5), || {
            delivered.load(Ordering::SeqCst) == 3
        }));
        drop(local);
    }

    #[test]
    fn stop_acks_is_bounded_under_sustained_traffic() {
        let shm_id = test_shm_id(58);

        let delivered = Arc::new(AtomicUsize::new(0));
        let handler = {
            let delivered = delivered.clone();
            AckHandler::Block(Box::new(move |_ptr, _size, _hint| {
                delivered.fetch_add(1, Ordering::SeqCst);
            }))
        };

        let mut local = Region::create(RegionConfig::new(shm_id, 2, 65536), handler).unwrap();
        let remote = Arc::new(Region::attach(shm_id, 2, None).unwrap());

        // Keep full bunches flowing so the receiver never runs dry.
        let keep_sending = Arc::new(AtomicBool::new(true));
        let producer = {
            let remote = remote.clone();
            let keep_sending = keep_sending.clone();
            thread::spawn(move || {
                while keep_sending.load(Ordering::Relaxed) {
                    for _ in 0..ACK_BUNCH_SIZE {
                        remote.release_block(RegionBlock::new(0, 16, 1));
                    }
                    thread::sleep(Duration::from_millis(5));
                }
            })
        };

        assert!(wait_for(Duration::from_secs(5), || {
            delivered.load(Ordering::SeqCst) > 0
        }));

        // The receiver must revisit the stop flag at each deadline even
        // though batches keep arriving.
        let started = Instant::now();
        local.stop_acks();
        assert!(started.elapsed() < Duration::from_secs(2));

        keep_sending.store(false, Ordering::Relaxed);
        producer.join().unwrap();
        drop(remote);
        drop(local);
    }

    #[test]
    fn file_backed_region_round_trip() {
        let shm_id = test_shm_id(57);
        let dir = tempfile::tempdir().unwrap();

        let delivered = Arc::new(AtomicUsize::new(0));
        let handler = {
            let delivered = delivered.clone();
            AckHandler::Block(Box::new(move |_ptr, _size, _hint| {
                delivered.fetch_add(1, Ordering::SeqCst);
            }))
        };

        let config = RegionConfig::new(shm_id, 4, 65536)
            .path(dir.path())
            .zero(true);
        let local = Region::create(config, handler).unwrap();
        let backing = dir.path().join(region_name(shm_id, 4));
        assert!(backing.exists());

        let remote = Region::attach(shm_id, 4, Some(dir.path())).unwrap();
        remote.release_block(RegionBlock::new(128, 256, 1));
        drop(remote);

        assert!(wait_for(Duration::from_secs(5), || {
            delivered.load(Ordering::SeqCst) == 1
        }));
        drop(local);
        assert!(!backing.exists());
    }
}
