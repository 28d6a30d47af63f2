//! # ntfsck_core
//!
//! Offline consistency checking and in-place repair for NTFS volumes.
//!
//! The engine is a fixed five-pass pipeline over one exclusively held
//! volume: an MFT linear scan that accumulates the in-memory cluster
//! bitmap and resolves duplicated clusters, system-file checks with a log
//! reset, a directory-tree walk that validates every reachable inode, and
//! two reconciliation passes that relink orphaned records and bring the
//! on-disk bitmaps into agreement with what the scan observed.
//!
//! ## Key components
//!
//! - [`runlist`]: the mapping-pairs codec for non-resident attributes
//! - [`bitmap`]: the sparse fsck cluster and MFT bitmaps (FCB/FMB)
//! - [`problem`]: the closed problem-code table and repair-policy engine
//! - [`volume`]: mount, geometry, and all byte-level device access
//! - [`session`]: the check-session context and pass driver
//!
//! The library has no CLI dependencies; the `ntfsck` binary crate layers
//! argument parsing, progress bars, and exit-code mapping on top.

pub mod attr;
pub mod bitmap;
pub mod boot;
pub mod device;
pub mod error;
pub mod index;
pub mod inode;
pub mod layout;
pub mod orphan;
pub mod problem;
pub mod runlist;
pub mod session;
pub mod types;
pub mod volume;

pub use device::{FileDevice, MemDevice, VolumeDevice};
pub use error::{FsckError, Result};
pub use problem::{ProblemCode, ProblemEngine};
pub use session::{CheckSession, NoProgress, Progress, Report};
pub use types::{exit_code, CheckOptions, RepairMode};
pub use volume::Volume;
