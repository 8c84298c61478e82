// vim: tw=80
//! The needs-rebuild bitmap
//!
//! Per-chunk, per-position rebuild state for both of a RaidGroup's regions.
//! User-region records live in paged metadata.  Records for the chunks that
//! back the paged metadata itself live in the metadata-of-metadata table: a
//! small fixed non-paged array, because that region cannot depend on paged
//! metadata to describe its own state.
//!
//! Chunk indices are device-absolute: user chunks occupy
//! `0..user_chunks`, metadata chunks `user_chunks..user_chunks + meta_chunks`.

use std::sync::Arc;

use divbuf::DivBufShared;
use serde_derive::{Deserialize, Serialize};

use crate::{
    chunk::{ChunkInfo, ChunkIter, RECORD_SIZE, chunk_range},
    metadata::{NonpagedStore, PagedStore},
    types::*,
};

/// Capacity of the metadata-of-metadata table, in chunks.  Fixed so the
/// non-paged record has a fixed worst-case size.
pub const MOM_TABLE_CHUNKS: usize = 64;

const MOM_RECORD_VERSION: u32 = 1;

/// Persisted form of the metadata-of-metadata table.
#[derive(Debug, Deserialize, Serialize)]
struct MomRecord {
    version: u32,
    /// Packed `ChunkInfo` records, [`RECORD_SIZE`] bytes each
    records: Vec<u8>,
}

/// Which region a chunk range falls in.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Region {
    User,
    Metadata,
}

pub struct NeedsRebuildBitmap {
    chunk_size: LbaT,
    /// Per-disk user capacity, in LBAs.  Metadata LBAs lie above this.
    user_capacity: LbaT,
    /// Number of chunks in the metadata region
    meta_chunks: ChunkT,
    paged: Arc<dyn PagedStore>,
    mom_store: Arc<dyn NonpagedStore>,
    /// The metadata-of-metadata table, mirrored in memory
    mom: Vec<ChunkInfo>,
}

impl std::fmt::Debug for NeedsRebuildBitmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NeedsRebuildBitmap")
            .field("chunk_size", &self.chunk_size)
            .field("user_capacity", &self.user_capacity)
            .field("meta_chunks", &self.meta_chunks)
            .field("mom", &self.mom)
            .finish_non_exhaustive()
    }
}

impl NeedsRebuildBitmap {
    /// Construct a bitmap for a freshly configured RaidGroup.  All chunks
    /// start clean.
    pub fn create(
        chunk_size: LbaT,
        user_capacity: LbaT,
        meta_chunks: ChunkT,
        paged: Arc<dyn PagedStore>,
        mom_store: Arc<dyn NonpagedStore>,
    ) -> Self {
        assert!(chunk_size > 0);
        assert_eq!(user_capacity % chunk_size, 0,
            "User capacity must be chunk-aligned");
        assert!(meta_chunks as usize <= MOM_TABLE_CHUNKS);
        let mom = vec![ChunkInfo::default(); meta_chunks as usize];
        NeedsRebuildBitmap {
            chunk_size,
            user_capacity,
            meta_chunks,
            paged,
            mom_store,
            mom,
        }
    }

    /// Reload the bitmap after a controller reboot.  The user-region records
    /// are wherever the paged service left them; only the
    /// metadata-of-metadata table must be read back.
    pub async fn open(
        chunk_size: LbaT,
        user_capacity: LbaT,
        meta_chunks: ChunkT,
        paged: Arc<dyn PagedStore>,
        mom_store: Arc<dyn NonpagedStore>,
    ) -> Result<Self> {
        let mut bitmap = NeedsRebuildBitmap::create(chunk_size, user_capacity,
            meta_chunks, paged, mom_store);
        let buf = bitmap.mom_store.read().await?;
        let rec: MomRecord = bincode::deserialize(&buf[..])
            .map_err(|_| Error::EINTEGRITY)?;
        if rec.version != MOM_RECORD_VERSION {
            return Err(Error::EINTEGRITY);
        }
        if rec.records.len() != bitmap.mom.len() * RECORD_SIZE {
            return Err(Error::EINTEGRITY);
        }
        for (i, ci) in bitmap.mom.iter_mut().enumerate() {
            *ci = ChunkInfo::from_bytes(
                &rec.records[i * RECORD_SIZE..(i + 1) * RECORD_SIZE]);
        }
        Ok(bitmap)
    }

    pub fn chunk_size(&self) -> LbaT {
        self.chunk_size
    }

    /// First chunk of the metadata region
    pub fn meta_base(&self) -> ChunkT {
        self.user_capacity / self.chunk_size
    }

    /// First LBA of the metadata region
    pub fn meta_start_lba(&self) -> LbaT {
        self.user_capacity
    }

    /// One past the last metadata LBA
    pub fn meta_end_lba(&self) -> LbaT {
        self.user_capacity + self.meta_chunks * self.chunk_size
    }

    fn region_of(&self, lba: LbaT) -> Region {
        if lba < self.user_capacity {
            Region::User
        } else {
            Region::Metadata
        }
    }

    /// Map an LBA range to device-absolute chunk indices.
    pub fn chunk_range(&self, lba: LbaT, blocks: LbaT) -> (ChunkT, ChunkT) {
        chunk_range(lba, blocks, self.chunk_size)
    }

    /// Clamp `blocks` so `[lba, lba + blocks)` stays within one region.  A
    /// single bitmap request must never span the user/metadata boundary.
    pub fn truncate(&self, lba: LbaT, blocks: LbaT) -> LbaT {
        let limit = match self.region_of(lba) {
            Region::User => self.user_capacity,
            Region::Metadata => self.meta_end_lba(),
        };
        blocks.min(limit.saturating_sub(lba))
    }

    /// Read the chunk records covering `[lba, lba + blocks)`.
    ///
    /// The range must not span the boundary; see [`truncate`].
    #[tracing::instrument(skip(self))]
    pub async fn read(&self, lba: LbaT, blocks: LbaT) -> Result<ChunkIter> {
        assert_eq!(self.truncate(lba, blocks), blocks,
            "Bitmap request spans the user/metadata boundary");
        let (first, count) = self.chunk_range(lba, blocks);
        match self.region_of(lba) {
            Region::User => {
                let buf = self.paged.read_chunks(first, count).await?;
                if buf.len() != count as usize * RECORD_SIZE {
                    return Err(Error::EINTEGRITY);
                }
                Ok(ChunkIter::new(first, buf))
            },
            Region::Metadata => {
                let idx = (first - self.meta_base()) as usize;
                let mut v = Vec::with_capacity(count as usize * RECORD_SIZE);
                for ci in &self.mom[idx..idx + count as usize] {
                    v.extend_from_slice(&ci.to_bytes());
                }
                let buf = DivBufShared::from(v).try_const().unwrap();
                Ok(ChunkIter::new(first, buf))
            }
        }
    }

    /// Clear the rebuild bits (and, with them, the verify bits) of `mask` for
    /// every chunk covering `[lba, lba + blocks)`.
    #[tracing::instrument(skip(self))]
    pub async fn clear_bits(&mut self, lba: LbaT, blocks: LbaT, mask: PosMask)
        -> Result<()>
    {
        assert_eq!(self.truncate(lba, blocks), blocks,
            "Bitmap request spans the user/metadata boundary");
        let (first, count) = self.chunk_range(lba, blocks);
        match self.region_of(lba) {
            Region::User =>
                self.paged.clear_if_marked(first, count, mask).await,
            Region::Metadata => {
                let idx = (first - self.meta_base()) as usize;
                for ci in &mut self.mom[idx..idx + count as usize] {
                    ci.clear(mask);
                }
                self.persist_mom().await
            }
        }
    }

    /// Mark every chunk in both regions stale for `mask`.  Called when a
    /// position degrades.
    pub async fn mark_all(&mut self, mask: PosMask) -> Result<()> {
        let user_chunks = self.meta_base();
        self.paged.mark_range(0, user_chunks, mask).await?;
        for ci in self.mom.iter_mut() {
            ci.set_rebuild(mask);
        }
        self.persist_mom().await
    }

    /// Does any user-region chunk need rebuild for `mask`?
    pub async fn any_user_marked(&self, mask: PosMask) -> Result<bool> {
        self.paged.any_marked(mask).await
    }

    /// Does any metadata-region chunk need rebuild for `mask`?  Non-paged, so
    /// the answer is synchronous.
    pub fn any_meta_marked(&self, mask: PosMask) -> bool {
        self.mom.iter().any(|ci| ci.needs_rebuild(mask))
    }

    async fn persist_mom(&self) -> Result<()> {
        let mut records = Vec::with_capacity(self.mom.len() * RECORD_SIZE);
        for ci in &self.mom {
            records.extend_from_slice(&ci.to_bytes());
        }
        let rec = MomRecord { version: MOM_RECORD_VERSION, records };
        let bytes = bincode::serialize(&rec)
            .map_err(|_| Error::EINTEGRITY)?;
        self.mom_store.set(bytes).await
    }
}

// LCOV_EXCL_STOP
