// vim: tw=80
//! Chunk records: the unit of needs-rebuild tracking
//!
//! A chunk is a fixed-size LBA range.  For every chunk the bitmap stores one
//! [`ChunkInfo`] record: a needs-rebuild mask and a needs-verify mask, one bit
//! per disk position.  Records are stored packed in paged metadata for the
//! user region and in the non-paged metadata-of-metadata table for the
//! RaidGroup's own metadata region.

use crate::types::*;

/*
 * Packed record format, all little-endian:
 *
 * NR mask:     2 bytes     needs-rebuild, one bit per position
 * NV mask:     2 bytes     needs-verify, one bit per position
 *
 * The format is fixed; it is shared with the peer controller and must remain
 * byte-compatible across reboots of either controller.
 */
pub const RECORD_SIZE: usize = 4;

/// Per-chunk rebuild state for every position in a RaidGroup.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ChunkInfo {
    /// Needs-rebuild: set iff this position's data in the chunk is stale
    pub nr: PosMask,
    /// Needs-verify: set if the chunk should be parity-checked
    pub nv: PosMask,
}

impl ChunkInfo {
    pub fn from_bytes(b: &[u8]) -> Self {
        debug_assert!(b.len() >= RECORD_SIZE);
        ChunkInfo {
            nr: PosMask::from_le_bytes([b[0], b[1]]),
            nv: PosMask::from_le_bytes([b[2], b[3]]),
        }
    }

    pub fn to_bytes(self) -> [u8; RECORD_SIZE] {
        let nr = self.nr.to_le_bytes();
        let nv = self.nv.to_le_bytes();
        [nr[0], nr[1], nv[0], nv[1]]
    }

    /// Does any position in `mask` need rebuild in this chunk?
    pub fn needs_rebuild(&self, mask: PosMask) -> bool {
        self.nr & mask != 0
    }

    pub fn needs_verify(&self, mask: PosMask) -> bool {
        self.nv & mask != 0
    }

    /// Mark every position in `mask` as stale.
    pub fn set_rebuild(&mut self, mask: PosMask) {
        self.nr |= mask;
    }

    /// Clear the rebuild bits for `mask`.  Rebuild subsumes verify, so the
    /// verify bits clear too.
    pub fn clear(&mut self, mask: PosMask) {
        self.nr &= !mask;
        self.nv &= !mask;
    }
}

/// Return the chunk range covering `[lba, lba + blocks)`.
///
/// The first element is the index of the first covered chunk; the second is
/// the number of covered chunks.  Partially covered chunks count.
pub fn chunk_range(lba: LbaT, blocks: LbaT, chunk_size: LbaT)
    -> (ChunkT, ChunkT)
{
    debug_assert!(chunk_size > 0);
    let first = lba / chunk_size;
    let end = (lba + blocks).div_ceil(chunk_size);
    (first, end.saturating_sub(first))
}

/// A typed, lazy iterator over the packed chunk records in a metadata buffer.
///
/// Yields `(chunk index, ChunkInfo)` pairs.  The iterator is finite (bounded
/// by the buffer) and restartable: [`ChunkIter::restart_at`] repositions it
/// to any chunk within the buffer so a scan can be repeated without another
/// metadata read.
pub struct ChunkIter {
    buf: IoVec,
    /// Chunk index of the record at the start of `buf`
    base: ChunkT,
    /// Next chunk to yield
    next: ChunkT,
}

impl ChunkIter {
    /// `base` is the chunk index of the first record in `buf`.
    pub fn new(base: ChunkT, buf: IoVec) -> Self {
        debug_assert_eq!(buf.len() % RECORD_SIZE, 0);
        ChunkIter { buf, base, next: base }
    }

    /// Number of records in the underlying buffer.
    pub fn len(&self) -> ChunkT {
        (self.buf.len() / RECORD_SIZE) as ChunkT
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Reposition the iterator to `chunk`, which must lie within the buffer.
    pub fn restart_at(&mut self, chunk: ChunkT) {
        assert!(chunk >= self.base && chunk <= self.base + self.len(),
                "Chunk {chunk} is outside of the buffer");
        self.next = chunk;
    }

    /// Advance to the next chunk whose record has a rebuild bit set for any
    /// position in `mask`, consuming unmarked records along the way.
    pub fn find_marked(&mut self, mask: PosMask) -> Option<(ChunkT, ChunkInfo)>
    {
        self.by_ref().find(|(_, ci)| ci.needs_rebuild(mask))
    }
}

impl Iterator for ChunkIter {
    type Item = (ChunkT, ChunkInfo);

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.base + self.len() {
            return None;
        }
        let off = ((self.next - self.base) as usize) * RECORD_SIZE;
        let ci = ChunkInfo::from_bytes(&self.buf[off..off + RECORD_SIZE]);
        let chunk = self.next;
        self.next += 1;
        Some((chunk, ci))
    }
}

// LCOV_EXCL_STOP
