//! Shared memory transport error types

use thiserror::Error;

/// Shared memory transport errors
#[derive(Error, Debug)]
pub enum ShmemError {
    /// Remote attach to a missing kernel object
    #[error("shared memory region not found: {0}")]
    RegionNotFound(String),

    /// Local create collides with an existing kernel object
    #[error("shared memory region already exists: {0}")]
    RegionAlreadyExists(String),

    /// File create/truncate/map failure on the backing storage
    #[error("backing storage I/O error: {0}")]
    BackingIo(#[from] std::io::Error),

    /// Managed segment allocator exhausted
    #[error("segment allocation failed: requested {requested} bytes, {free} free")]
    BadAlloc { requested: u64, free: u64 },

    /// Malformed acknowledgement traffic or mismatched queue geometry
    #[error("protocol desync: {0}")]
    ProtocolDesync(String),

    /// Contradictory construction options
    #[error("configuration error: {0}")]
    Config(String),

    /// Platform call failure that maps to no other kind
    #[error("platform error: {0}")]
    Platform(String),
}

/// Convenience type alias
pub type Result<T> = std::result::Result<T, ShmemError>;

impl ShmemError {
    /// Map an errno from a shm object create/open call, attaching the
    /// object name to the not-found / already-exists kinds.
    pub(crate) fn from_shm_errno(errno: nix::errno::Errno, name: &str) -> Self {
        match errno {
            nix::errno::Errno::ENOENT => ShmemError::RegionNotFound(name.to_string()),
            nix::errno::Errno::EEXIST => ShmemError::RegionAlreadyExists(name.to_string()),
            e => ShmemError::Platform(format!("{}: {}", name, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert!(matches!(
            ShmemError::from_shm_errno(nix::errno::Errno::ENOENT, "x"),
            ShmemError::RegionNotFound(_)
        ));
        assert!(matches!(
            ShmemError::from_shm_errno(nix::errno::Errno::EEXIST, "x"),
            ShmemError::RegionAlreadyExists(_)
        ));
        assert!(matches!(
            ShmemError::from_shm_errno(nix::errno::Errno::EACCES, "x"),
            ShmemError::Platform(_)
        ));
    }
}
