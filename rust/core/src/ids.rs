//! Shared-memory id namespace and canonical object naming

use std::fmt;
use std::str::FromStr;

/// Identifier of one cooperating process group. All shared-memory objects
/// belonging to the group carry its canonical 16-digit hex rendering as a
/// name prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShmId(u64);

/// Identifier of an unmanaged region, unique within a [`ShmId`].
pub type RegionId = u16;

/// Identifier of a managed segment, unique within a [`ShmId`].
pub type SegmentId = u16;

/// Common prefix of every framelink kernel object name.
pub const NAME_PREFIX: &str = "fmq_";

impl ShmId {
    pub fn new(id: u64) -> Self {
        ShmId(id)
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    /// Canonical rendering: 16 lowercase hex digits with leading zeros.
    pub fn as_hex(&self) -> String {
        format!("{:016x}", self.0)
    }

    /// Namespace prefix shared by all objects of this group,
    /// e.g. `fmq_0000000000000042_`.
    pub fn prefix(&self) -> String {
        format!("{}{}_", NAME_PREFIX, self.as_hex())
    }
}

impl fmt::Display for ShmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_hex())
    }
}

impl From<u64> for ShmId {
    fn from(id: u64) -> Self {
        ShmId(id)
    }
}

impl FromStr for ShmId {
    type Err = std::num::ParseIntError;

    /// Accepts decimal or `0x`-prefixed hex.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let id = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            Some(hex) => u64::from_str_radix(hex, 16)?,
            None => s.parse::<u64>()?,
        };
        Ok(ShmId(id))
    }
}

/// Kernel object name of an unmanaged region.
pub fn region_name(shm_id: ShmId, id: RegionId) -> String {
    format!("{}{}_rg_{}", NAME_PREFIX, shm_id.as_hex(), id)
}

/// Kernel object name of a region acknowledgement queue.
pub fn region_queue_name(shm_id: ShmId, id: RegionId) -> String {
    format!("{}{}_rgq_{}", NAME_PREFIX, shm_id.as_hex(), id)
}

/// Kernel object name of a managed segment.
pub fn segment_name(shm_id: ShmId, id: SegmentId) -> String {
    format!("{}{}_sg_{}", NAME_PREFIX, shm_id.as_hex(), id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_rendering_is_16_lowercase_digits() {
        assert_eq!(ShmId::new(0x42).as_hex(), "0000000000000042");
        assert_eq!(ShmId::new(u64::MAX).as_hex(), "ffffffffffffffff");
        assert_eq!(ShmId::new(0).as_hex(), "0000000000000000");
    }

    #[test]
    fn object_names_match_the_naming_scheme() {
        let id = ShmId::new(0x42);
        assert_eq!(region_name(id, 2), "fmq_0000000000000042_rg_2");
        assert_eq!(region_queue_name(id, 2), "fmq_0000000000000042_rgq_2");
        assert_eq!(segment_name(id, 1), "fmq_0000000000000042_sg_1");
        assert_eq!(id.prefix(), "fmq_0000000000000042_");
    }

    #[test]
    fn parses_decimal_and_hex() {
        assert_eq!("66".parse::<ShmId>().unwrap(), ShmId::new(66));
        assert_eq!("0x42".parse::<ShmId>().unwrap(), ShmId::new(0x42));
        assert_eq!("0X42".parse::<ShmId>().unwrap(), ShmId::new(0x42));
        assert!("zz".parse::<ShmId>().is_err());
    }
}
