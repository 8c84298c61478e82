// vim: tw=80
//! Common type definitions used throughout the duplex rebuild engine

use std::{
    fmt::{self, Display, Formatter},
    pin::Pin,
};

use enum_primitive_derive::Primitive;
use num_traits::ToPrimitive;
use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

/// Our `IoVec`.  Reference-counted, like the buffers the metadata services
/// hand back.
pub type IoVec = divbuf::DivBuf;

/// Indexes an LBA.  LBAs are disk-relative within a RaidGroup: each position
/// exposes the same address range, and the rebuild checkpoint for a position
/// is an LBA in this space.
pub type LbaT = u64;

/// Indexes a disk position within a RaidGroup.
pub type PositionT = u8;

/// A set of disk positions, one bit per position.  No RaidGroup is ever wider
/// than 16 positions.
pub type PosMask = u16;

/// The mask bit for a single position.
pub const fn pos_bit(pos: PositionT) -> PosMask {
    1 << pos
}

/// Indexes a chunk within one region of the needs-rebuild bitmap.
pub type ChunkT = u64;

/// Identifies the external object (a LUN or a disk being replaced) that
/// rebuild notifications are addressed to.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq,
         PartialOrd, Serialize)]
pub struct ObjectId(pub u64);

impl Display for ObjectId {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The rebuild engine's error type.  Basically just an errno.
#[derive(Clone, Copy, Debug, Deserialize, Error, Eq, PartialEq, Primitive,
         Serialize)]
pub enum Error {
    #[error("Operation not permitted")]
    EPERM      = libc::EPERM as isize,
    #[error("No such file or directory")]
    ENOENT     = libc::ENOENT as isize,
    #[error("Input/output error")]
    EIO        = libc::EIO as isize,
    #[error("Device not configured")]
    ENXIO      = libc::ENXIO as isize,
    #[error("Device busy")]
    EBUSY      = libc::EBUSY as isize,
    #[error("Operation not supported by device")]
    ENODEV     = libc::ENODEV as isize,
    #[error("Invalid argument")]
    EINVAL     = libc::EINVAL as isize,
    #[error("No space left on device")]
    ENOSPC     = libc::ENOSPC as isize,
    #[error("Resource temporarily unavailable")]
    EAGAIN     = libc::EAGAIN as isize,
    #[error("Operation canceled")]
    ECANCELED  = libc::ECANCELED as isize,

    //// Custom error types below.  Values must not collide with errnos.
    #[error("Integrity check failed")]
    EINTEGRITY = 256,
    #[error("Unknown error")]
    EUNKNOWN   = 257,
}

impl Error {
    /// Is this error transient, such that the failed rebuild cycle may simply
    /// be rescheduled?
    pub fn is_retryable(self) -> bool {
        matches!(self, Error::EAGAIN | Error::EBUSY | Error::ECANCELED)
    }
}

impl From<Error> for i32 {
    fn from(e: Error) -> Self {
        match e {
            Error::EUNKNOWN =>
                panic!("Unknown error codes should never be exposed"),
            _ => e.to_i32().unwrap()
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// A rebuild checkpoint: the per-disk LBA below which all of a position's data
/// is known good.
///
/// The ordering reflects progress.  `At(x) < At(y)` iff `x < y`, and
/// `Complete` sorts above any LBA.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd,
         Serialize)]
pub enum Checkpoint {
    /// Rebuild has progressed up to, but not including, this LBA.
    At(LbaT),
    /// No remaining work for this position.
    Complete,
}

impl Checkpoint {
    pub fn as_lba(self) -> Option<LbaT> {
        if let Checkpoint::At(lba) = self {
            Some(lba)
        } else {
            None
        }
    }

    pub fn is_complete(self) -> bool {
        self == Checkpoint::Complete
    }
}

impl Display for Checkpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match *self {
            Checkpoint::At(lba) => write!(f, "{lba}"),
            Checkpoint::Complete => "complete".fmt(f),
        }
    }
}

/// Future representing an operation on one of the engine's service seams.
pub type BoxRebuildFut<T> =
    Pin<Box<dyn futures::Future<Output = Result<T>> + Send>>;

// LCOV_EXCL_STOP
