//! Configuration surface of the supervisor and the mapping layer

use std::str::FromStr;

use thiserror::Error;

use crate::ids::{RegionId, SegmentId};

/// NUMA placement of a mapping.
///
/// Encoded on the command line as an integer: `-2` disabled, `-1`
/// interleave across nodes, `>= 0` bind to that node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NumaMode {
    #[default]
    Disabled,
    Interleave,
    Node(u32),
}

impl FromStr for NumaMode {
    type Err = SpecParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw: i64 = s
            .trim()
            .parse()
            .map_err(|_| SpecParseError::InvalidField {
                field: "numaId",
                value: s.to_string(),
            })?;
        match raw {
            -2 => Ok(NumaMode::Disabled),
            -1 => Ok(NumaMode::Interleave),
            n if n >= 0 && n <= u32::MAX as i64 => Ok(NumaMode::Node(n as u32)),
            _ => Err(SpecParseError::InvalidField {
                field: "numaId",
                value: s.to_string(),
            }),
        }
    }
}

/// Allocation strategy of a managed segment.
///
/// A string-named extension point; `rbtree_best_fit` is the only supported
/// value at present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AllocStrategy {
    #[default]
    RbTreeBestFit,
}

impl AllocStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            AllocStrategy::RbTreeBestFit => "rbtree_best_fit",
        }
    }
}

impl FromStr for AllocStrategy {
    type Err = SpecParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rbtree_best_fit" => Ok(AllocStrategy::RbTreeBestFit),
            _ => Err(SpecParseError::UnknownStrategy(s.to_string())),
        }
    }
}

/// One managed segment declared to the supervisor, `<id>,<size>,<numaId>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentSpec {
    pub id: SegmentId,
    pub size: u64,
    pub numa: NumaMode,
}

/// One unmanaged region declared to the supervisor, `<id>,<size>,<numaId>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionSpec {
    pub id: RegionId,
    pub size: u64,
    pub numa: NumaMode,
}

/// Errors from parsing the `<id>,<size>,<numaId>` spec grammar.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SpecParseError {
    #[error("expecting <id>,<size>,<numaId>, got {0} field(s)")]
    FieldCount(usize),

    #[error("invalid {field}: '{value}'")]
    InvalidField { field: &'static str, value: String },

    #[error("size must be greater than zero")]
    ZeroSize,

    #[error("unknown allocation strategy: '{0}'")]
    UnknownStrategy(String),
}

fn parse_triple(s: &str) -> Result<(u16, u64, NumaMode), SpecParseError> {
    let fields: Vec<&str> = s.split(',').collect();
    if fields.len() != 3 {
        return Err(SpecParseError::FieldCount(fields.len()));
    }
    let id = fields[0]
        .trim()
        .parse::<u16>()
        .map_err(|_| SpecParseError::InvalidField {
            field: "id",
            value: fields[0].to_string(),
        })?;
    let size = fields[1]
        .trim()
        .parse::<u64>()
        .map_err(|_| SpecParseError::InvalidField {
            field: "size",
            value: fields[1].to_string(),
        })?;
    if size == 0 {
        return Err(SpecParseError::ZeroSize);
    }
    let numa = fields[2].parse::<NumaMode>()?;
    Ok((id, size, numa))
}

impl FromStr for SegmentSpec {
    type Err = SpecParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (id, size, numa) = parse_triple(s)?;
        Ok(SegmentSpec { id, size, numa })
    }
}

impl FromStr for RegionSpec {
    type Err = SpecParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (id, size, numa) = parse_triple(s)?;
        Ok(RegionSpec { id, size, numa })
    }
}
