//! Contiguous shared-memory mappings
//!
//! A [`MappedRegion`] is one read-write mapping backed either by a POSIX
//! shared-memory object or by a regular file on a tmpfs-like mount path.
//! Once created, base and size are immutable; the mapping stays valid until
//! the owning `Region`/`Segment` is dropped. Removal of the kernel object
//! is a separate, by-name operation so that remote attachments never
//! destroy storage they do not own.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use memmap2::{MmapOptions, MmapRaw};
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use tracing::{debug, trace, warn};

use framelink_core::NumaMode;

use crate::error::{Result, ShmemError};

/// What a mapping is backed by.
#[derive(Debug)]
pub enum Backing {
    /// Anonymous POSIX shared-memory object (`shm_open`).
    Shmem,
    /// Regular file at `<path>/<name>` on a caller-supplied mount.
    File { path: PathBuf },
}

/// A single contiguous shared-memory mapping.
pub struct MappedRegion {
    name: String,
    map: MmapRaw,
    size: usize,
    backing: Backing,
    // Keeps the descriptor alive for the lifetime of the mapping.
    _file: File,
    locked: bool,
    zeroed: bool,
}

// The mapping is shared across processes by design; synchronization of the
// payload is the caller's contract.
unsafe impl Send for MappedRegion {}
unsafe impl Sync for MappedRegion {}

impl MappedRegion {
    /// Create the backing object with the given canonical name, size it,
    /// and map it read-write. Fails with `RegionAlreadyExists` if an object
    /// of that name is already present.
    pub fn create(
        name: &str,
        size: usize,
        file_path: Option<&Path>,
        numa: NumaMode,
    ) -> Result<Self> {
        if size == 0 {
            return Err(ShmemError::Config(format!(
                "region '{}' requested with zero size",
                name
            )));
        }

        let (file, backing) = match file_path {
            Some(dir) => {
                let full = dir.join(name);
                let mut file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create_new(true)
                    .open(&full)
                    .map_err(|e| {
                        if e.kind() == std::io::ErrorKind::AlreadyExists {
                            ShmemError::RegionAlreadyExists(name.to_string())
                        } else {
                            ShmemError::BackingIo(e)
                        }
                    })?;
                // Extend sparsely: seek to size-1 and write one zero byte.
                let sized = file
                    .seek(SeekFrom::Start(size as u64 - 1))
                    .and_then(|_| file.write_all(&[0]));
                if let Err(e) = sized {
                    let _ = std::fs::remove_file(&full);
                    return Err(ShmemError::BackingIo(e));
                }
                debug!("shmem: initialized file: {}", full.display());
                (file, Backing::File { path: dir.to_path_buf() })
            }
            None => {
                let fd = nix::sys::mman::shm_open(
                    name,
                    OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
                    Mode::S_IRUSR | Mode::S_IWUSR,
                )
                .map_err(|e| ShmemError::from_shm_errno(e, name))?;
                let file = File::from(fd);
                if let Err(e) = nix::unistd::ftruncate(&file, size as i64) {
                    let _ = nix::sys::mman::shm_unlink(name);
                    return Err(ShmemError::Platform(format!("ftruncate {}: {}", name, e)));
                }
                (file, Backing::Shmem)
            }
        };

        let map = match MmapOptions::new().len(size).map_raw(&file) {
            Ok(map) => map,
            Err(e) => {
                match &backing {
                    Backing::Shmem => {
                        let _ = nix::sys::mman::shm_unlink(name);
                    }
                    Backing::File { path } => {
                        let _ = std::fs::remove_file(path.join(name));
                    }
                }
                return Err(ShmemError::BackingIo(e));
            }
        };

        apply_numa(map.as_mut_ptr(), size, numa, name);

        trace!("shmem: mapped region: {} ({} bytes, local)", name, size);

        Ok(MappedRegion {
            name: name.to_string(),
            map,
            size,
            backing,
            _file: file,
            locked: false,
            zeroed: false,
        })
    }

    /// Map an existing backing object open-only; the size is discovered
    /// from the object itself. Fails with `RegionNotFound` if absent.
    pub fn open(name: &str, file_path: Option<&Path>) -> Result<Self> {
        let (file, backing) = match file_path {
            Some(dir) => {
                let full = dir.join(name);
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(&full)
                    .map_err(|e| {
                        if e.kind() == std::io::ErrorKind::NotFound {
                            ShmemError::RegionNotFound(name.to_string())
                        } else {
                            ShmemError::BackingIo(e)
                        }
                    })?;
                (file, Backing::File { path: dir.to_path_buf() })
            }
            None => {
                let fd = nix::sys::mman::shm_open(name, OFlag::O_RDWR, Mode::empty())
                    .map_err(|e| ShmemError::from_shm_errno(e, name))?;
                (File::from(fd), Backing::Shmem)
            }
        };

        let size = file.metadata().map_err(ShmemError::BackingIo)?.len() as usize;
        if size == 0 {
            return Err(ShmemError::Platform(format!(
                "region '{}' exists but has zero size",
                name
            )));
        }

        let map = MmapOptions::new()
            .len(size)
            .map_raw(&file)
            .map_err(ShmemError::BackingIo)?;

        trace!("shmem: mapped region: {} ({} bytes, remote)", name, size);

        Ok(MappedRegion {
            name: name.to_string(),
            map,
            size,
            backing,
            _file: file,
            locked: false,
            zeroed: false,
        })
    }

    /// Pin the mapping into RAM. Best-effort: failure logs a warning and
    /// the mapping stays usable.
    pub fn lock(&mut self) {
        let res = unsafe {
            nix::sys::mman::mlock(self.map.as_mut_ptr() as *const libc::c_void, self.size)
        };
        match res {
            Ok(()) => self.locked = true,
            Err(e) => warn!("failed to lock pages of '{}': {}", self.name, e),
        }
    }

    /// Write zero bytes across the full mapping.
    pub fn zero(&mut self) {
        unsafe { std::ptr::write_bytes(self.map.as_mut_ptr(), 0, self.size) };
        self.zeroed = true;
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.map.as_mut_ptr()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn backing(&self) -> &Backing {
        &self.backing
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn is_zeroed(&self) -> bool {
        self.zeroed
    }

    /// Remove a shared-memory object by name. Returns whether an object was
    /// actually removed.
    pub fn remove(name: &str) -> bool {
        nix::sys::mman::shm_unlink(name).is_ok()
    }

    /// Remove a file-backed region's file. Returns whether a file was
    /// actually removed.
    pub fn remove_file(dir: &Path, name: &str) -> bool {
        std::fs::remove_file(dir.join(name)).is_ok()
    }
}

impl std::fmt::Debug for MappedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedRegion")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("backing", &self.backing)
            .field("locked", &self.locked)
            .field("zeroed", &self.zeroed)
            .finish()
    }
}

/// Route the NUMA placement request to `mbind(2)`. Best-effort: an offline
/// node or an unsupported kernel logs a warning and the mapping proceeds
/// with default placement.
#[cfg(target_os = "linux")]
fn apply_numa(ptr: *mut u8, len: usize, numa: NumaMode, name: &str) {
    const MPOL_BIND: libc::c_int = 2;
    const MPOL_INTERLEAVE: libc::c_int = 3;

    let (policy, mask) = match numa {
        NumaMode::Disabled => return,
        NumaMode::Interleave => (MPOL_INTERLEAVE, online_node_mask()),
        NumaMode::Node(n) => {
            if n >= 64 {
                warn!("numa node {} out of mask range for '{}'", n, name);
                return;
            }
            (MPOL_BIND, 1u64 << n)
        }
    };

    let rc = unsafe {
        libc::syscall(
            libc::SYS_mbind,
            ptr as *mut libc::c_void,
            len,
            policy,
            &mask as *const u64,
            64usize,
            0u32,
        )
    };
    if rc != 0 {
        warn!(
            "mbind({:?}) failed for '{}': {}",
            numa,
            name,
            std::io::Error::last_os_error()
        );
    } else {
        debug!("numa policy {:?} applied to '{}'", numa, name);
    }
}

#[cfg(not(target_os = "linux"))]
fn apply_numa(_ptr: *mut u8, _len: usize, numa: NumaMode, name: &str) {
    if numa != NumaMode::Disabled {
        warn!("numa binding {:?} not supported on this platform for '{}'", numa, name);
    }
}

/// Bitmask of the online NUMA nodes, from sysfs ranges like `0` or `0-3`.
#[cfg(target_os = "linux")]
fn online_node_mask() -> u64 {
    std::fs::read_to_string("/sys/devices/system/node/online")
        .ok()
        .map(|s| parse_node_ranges(s.trim()))
        .filter(|&m| m != 0)
        .unwrap_or(1)
}

#[cfg(target_os = "linux")]
fn parse_node_ranges(s: &str) -> u64 {
    let mut mask = 0u64;
    for part in s.split(',') {
        let part = part.trim();
        if let Some((lo, hi)) = part.split_once('-') {
            if let (Ok(lo), Ok(hi)) = (lo.parse::<u32>(), hi.parse::<u32>()) {
                for n in lo..=hi.min(63) {
                    mask |= 1u64 << n;
                }
            }
        } else if let Ok(n) = part.parse::<u32>() {
            if n < 64 {
                mask |= 1u64 << n;
            }
        }
    }
    mask
}
