//! Error types for the check engine.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FsckError {
    /// I/O on the volume device failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Read or write beyond the end of the device
    #[error("Offset {offset} is out of bounds (device size: {max})")]
    OutOfBounds { offset: u64, max: u64 },

    /// The boot sector does not describe a valid NTFS volume
    #[error("Invalid boot sector: {0}")]
    InvalidBootSector(String),

    /// On-disk metadata violates a structural invariant
    #[error("Corrupt metadata in MFT record {mft_no}: {reason}")]
    CorruptRecord { mft_no: u64, reason: &'static str },

    /// A mapping-pairs buffer could not be decoded
    #[error("Corrupt runlist: {0}")]
    CorruptRunlist(&'static str),

    /// Encoding was attempted on a runlist with unmapped regions
    #[error("Runlist contains unmapped regions; map fully before encoding")]
    UnmappedRunlist,

    /// The encoded mapping pairs would not fit in the space available
    #[error("Mapping pairs need {needed} bytes but only {max} are available")]
    MappingPairsOverflow { needed: usize, max: usize },

    /// A multi-sector record failed its update-sequence check
    #[error("Fixup mismatch in sector {sector} of a multi-sector record")]
    FixupMismatch { sector: usize },

    /// The volume cannot be operated on (mounted, unsupported, read-only)
    #[error("Refused to operate: {0}")]
    Refused(String),

    /// An index node has no room for the entry being inserted
    #[error("Index node of inode {mft_no} is full")]
    IndexFull { mft_no: u64 },

    /// An MFT record has no room for the attribute being added or grown
    #[error("MFT record {mft_no} has no room for attribute 0x{attr_type:x}")]
    RecordFull { mft_no: u64, attr_type: u32 },

    /// No free clusters could be allocated
    #[error("Volume has no free clusters for a {count}-cluster allocation")]
    NoSpace { count: i64 },

    /// Something that must exist was not found
    #[error("Not found: {0}")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, FsckError>;
