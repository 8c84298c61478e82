// vim: tw=80
//! Seams to the metadata persistence services
//!
//! Two services back the rebuild engine's durable state.  The paged service
//! stores the per-chunk records for the user region; it may need disk I/O to
//! page records in.  The non-paged service stores small fixed records (the
//! checkpoint table and the metadata-of-metadata table) that are always
//! resident and are replicated to the peer controller.  Both services
//! serialize their own internal mutation; callers never take locks.

#[cfg(test)] use mockall::automock;

use crate::types::*;

/// Paged per-chunk record storage for the user region.
#[cfg_attr(test, automock)]
pub trait PagedStore: Send + Sync {
    /// Read `count` packed [`crate::chunk::ChunkInfo`] records starting at
    /// `chunk`.
    fn read_chunks(&self, chunk: ChunkT, count: ChunkT)
        -> BoxRebuildFut<IoVec>;

    /// For every record in `[chunk, chunk + count)` that has a rebuild bit of
    /// `mask` set, clear those rebuild bits along with the matching verify
    /// bits.  Unmarked records are left untouched.  All-or-nothing relative
    /// to one metadata write.
    fn clear_if_marked(&self, chunk: ChunkT, count: ChunkT, mask: PosMask)
        -> BoxRebuildFut<()>;

    /// Set the rebuild bits of `mask` on every record in
    /// `[chunk, chunk + count)`.  Used when a position degrades.
    fn mark_range(&self, chunk: ChunkT, count: ChunkT, mask: PosMask)
        -> BoxRebuildFut<()>;

    /// Does any user-region record have a rebuild bit of `mask` set?
    fn any_marked(&self, mask: PosMask) -> BoxRebuildFut<bool>;
}

/// Non-paged storage for one small fixed record, replicated to the peer.
///
/// The engine owns two of these: one for the checkpoint table and one for the
/// metadata-of-metadata table.
#[cfg_attr(test, automock)]
pub trait NonpagedStore: Send + Sync {
    /// Read the current record.
    fn read(&self) -> BoxRebuildFut<IoVec>;

    /// Full-record write.  Persisted locally and replicated to the peer
    /// controller before the future completes.
    fn set(&self, record: Vec<u8>) -> BoxRebuildFut<()>;

    /// Lightweight local-only write.  Persisted locally but not pushed across
    /// the inter-controller link.  Used for the high-frequency checkpoint
    /// increments between full pushes.
    fn increment(&self, record: Vec<u8>) -> BoxRebuildFut<()>;
}
