// vim: tw=80
//! Seam to the block-I/O execution engine
//!
//! Reconstruction I/O (read survivors, recompute, write the targets) is
//! executed outside of this subsystem.  The rebuild pipeline only names the
//! range and the target positions.

#[cfg(test)] use mockall::automock;

use crate::types::*;

/// The block-I/O execution engine, as seen by the rebuild pipeline.
#[cfg_attr(test, automock)]
pub trait BlockIo: Send + Sync {
    /// Reconstruct `[lba, lba + blocks)` onto every position in `targets`.
    ///
    /// A hard media error surfaces as `EINTEGRITY`; any other failure as the
    /// executor's errno.  The checkpoint does not advance on any error.
    fn rebuild(&self, lba: LbaT, blocks: LbaT, targets: PosMask)
        -> BoxRebuildFut<()>;
}
