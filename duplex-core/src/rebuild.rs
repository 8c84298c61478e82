// vim: tw=80
//! The rebuild I/O pipeline
//!
//! One cycle advances the selected positions over one LBA range:
//!
//! ```text
//! Init -> PermitCheck -> Io -> BitmapUpdate -> CheckpointUpdate -> Done
//!                                  |
//!                                Failed  (from any phase; no advance)
//! ```
//!
//! Ranges no LUN has ever consumed, and chunk runs whose rebuild bits are
//! already clear, advance the checkpoint without touching the disks.  Every
//! checkpoint advance is all-or-nothing relative to a single metadata write.

use crate::{
    bitmap::NeedsRebuildBitmap,
    blockio::BlockIo,
    checkpoint::CheckpointStore,
    permit::{ConsumptionOracle, PermitStatus},
    selector::RebuildAction,
    types::*,
};

/// Phase of an in-flight rebuild cycle.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Phase {
    Init,
    PermitCheck,
    Io,
    BitmapUpdate,
    CheckpointUpdate,
    Done,
    Failed,
}

/// Per-cycle state.  Created when a cycle begins, dropped on completion.
#[derive(Debug)]
struct RebuildContext {
    start_lba: LbaT,
    block_count: LbaT,
    /// Positions this cycle reconstructs
    targets: PosMask,
    is_metadata: bool,
    /// Consumer of the head of the range, learned from the permit reply
    object: Option<ObjectId>,
    phase: Phase,
}

/// What a completed cycle did.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CycleReport {
    /// Positions whose checkpoints advanced
    pub advanced: PosMask,
    /// The new checkpoint value, if any position advanced
    pub new_checkpoint: Option<LbaT>,
    /// Was reconstruction I/O issued?
    pub io_issued: bool,
    /// User blocks credited to the blocks-rebuilt counters
    pub blocks_counted: LbaT,
    /// External object consuming the range, if the permit reply named one
    pub object: Option<ObjectId>,
}

/// Borrows a RaidGroup's parts for the duration of one cycle.
pub struct RebuildPipeline<'a> {
    pub store: &'a mut CheckpointStore,
    pub bitmap: &'a mut NeedsRebuildBitmap,
    pub blockio: &'a dyn BlockIo,
    pub oracle: &'a dyn ConsumptionOracle,
    /// Upper bound on one user-region cycle, in LBAs.  Chunk-aligned.
    pub cycle_blocks: LbaT,
}

impl RebuildPipeline<'_> {
    /// Execute one rebuild cycle for `action`.
    ///
    /// On any error the checkpoint has not advanced; retryable errors leave
    /// all state untouched.
    #[tracing::instrument(skip(self))]
    pub async fn run(&mut self, action: &RebuildAction) -> Result<CycleReport>
    {
        debug_assert!(action.rebuild_now_mask != 0);
        debug_assert!(!action.needs_reset,
            "Reset the checkpoints before running a cycle");
        let mut ctx = self.init(action);
        match self.advance_phases(&mut ctx).await {
            Ok(report) => {
                ctx.phase = Phase::Done;
                tracing::debug!(?report, "Cycle complete");
                Ok(report)
            },
            Err(e) => {
                ctx.phase = Phase::Failed;
                if e.is_retryable() {
                    tracing::debug!(%e, "Cycle deferred");
                } else {
                    tracing::warn!(%e, ?ctx, "Cycle failed");
                }
                Err(e)
            }
        }
    }

    fn init(&self, action: &RebuildAction) -> RebuildContext {
        let start = action.target_checkpoint;
        let user_capacity = self.bitmap.meta_start_lba();
        let is_metadata = start >= user_capacity;
        let raw = if is_metadata {
            // The metadata region is small; one cycle covers all of it
            self.bitmap.meta_end_lba() - start
        } else {
            self.cycle_blocks.min(user_capacity - start)
        };
        RebuildContext {
            start_lba: start,
            block_count: self.bitmap.truncate(start, raw),
            targets: action.rebuild_now_mask,
            is_metadata,
            object: None,
            phase: Phase::Init,
        }
    }

    async fn advance_phases(&mut self, ctx: &mut RebuildContext)
        -> Result<CycleReport>
    {
        // PERMIT_CHECK.  The metadata region lies beyond anything a LUN can
        // consume; it skips straight to I/O.
        if !ctx.is_metadata {
            ctx.phase = Phase::PermitCheck;
            if let Some(report) = self.permit_check(ctx).await? {
                return Ok(report);
            }
        }

        // IO.  Find the first marked run within the range.
        ctx.phase = Phase::Io;
        let chunk_size = self.bitmap.chunk_size();
        let mut iter = self.bitmap.read(ctx.start_lba, ctx.block_count)
            .await?;
        let Some((c0, _)) = iter.find_marked(ctx.targets) else {
            // No rebuild bits anywhere in the range: advance over all of it
            // without I/O.
            let end = ctx.start_lba + ctx.block_count;
            return self.commit(ctx, end, false).await;
        };
        let mut c1 = c0 + 1;
        for (_, ci) in iter {
            if !ci.needs_rebuild(ctx.targets) {
                break;
            }
            c1 += 1;
        }
        let io_start = (c0 * chunk_size).max(ctx.start_lba);
        let io_end = (c1 * chunk_size).min(ctx.start_lba + ctx.block_count);
        self.blockio.rebuild(io_start, io_end - io_start, ctx.targets)
            .await?;

        // BITMAP_UPDATE.  Clear only positions that aren't rebuild-logging by
        // now; zero qualifying positions means the caller's bookkeeping and
        // ours disagree.
        ctx.phase = Phase::BitmapUpdate;
        let qualifying = ctx.targets & !self.store.logging_mask();
        if qualifying == 0 {
            tracing::warn!(targets = ctx.targets,
                logging = self.store.logging_mask(),
                "Every targeted position is rebuild-logging");
            return Err(Error::EINVAL);
        }
        self.bitmap.clear_bits(io_start, io_end - io_start, qualifying)
            .await?;

        self.commit(ctx, io_end, true).await
    }

    /// Ask the consumption oracle about the range.  Returns `Some(report)` if
    /// the cycle finished on the unconsumed-skip path, `None` if it should
    /// proceed to I/O (with `ctx` possibly shrunk to the consumed prefix).
    async fn permit_check(&mut self, ctx: &mut RebuildContext)
        -> Result<Option<CycleReport>>
    {
        let chunk_size = self.bitmap.chunk_size();
        let reply = self.oracle.request(ctx.start_lba, ctx.block_count)
            .await?;
        ctx.object = reply.object_id;
        match reply.status {
            PermitStatus::Busy | PermitStatus::Denied => Err(Error::EBUSY),
            PermitStatus::NoUserData => {
                // Nothing lives at the head of the range.  Skip whole chunks
                // of it with no I/O.
                let span = reply.unconsumed_blocks.min(ctx.block_count);
                let aligned = span - span % chunk_size;
                if aligned == 0 {
                    // The unconsumed span ends inside the first chunk, whose
                    // tail is consumed.  Rebuild that whole chunk.
                    ctx.block_count = chunk_size.min(ctx.block_count);
                    return Ok(None);
                }
                let end = ctx.start_lba + aligned;
                // The skipped span is known stale no longer: clear its bits
                let qualifying = ctx.targets & !self.store.logging_mask();
                if qualifying == 0 {
                    return Err(Error::EINVAL);
                }
                self.bitmap.clear_bits(ctx.start_lba, aligned, qualifying)
                    .await?;
                self.commit(ctx, end, false).await.map(Some)
            },
            PermitStatus::Ok => {
                if reply.unconsumed_blocks > 0 {
                    // Consumed at the head only.  Shrink to the consumed
                    // prefix, rounded up to chunk alignment.
                    let consumed = ctx.block_count
                        .saturating_sub(reply.unconsumed_blocks);
                    if consumed == 0 {
                        return Err(Error::EINVAL);
                    }
                    let aligned = consumed.div_ceil(chunk_size) * chunk_size;
                    ctx.block_count = aligned.min(ctx.block_count);
                }
                Ok(None)
            }
        }
    }

    /// CHECKPOINT_UPDATE: commit the cycle's advance.
    async fn commit(&mut self, ctx: &mut RebuildContext, run_end: LbaT,
                    io_issued: bool) -> Result<CycleReport>
    {
        ctx.phase = Phase::CheckpointUpdate;
        // A position that went rebuild-logging mid-flight must not have its
        // checkpoint committed; fail the cycle as retryable instead.
        if ctx.targets & self.store.logging_mask() != 0 {
            return Err(Error::ECANCELED);
        }
        if ctx.is_metadata {
            // The checkpoint stays at the region boundary until the whole
            // metadata region is clean, then jumps past it in one step.
            let mut done = 0;
            for pos in 0..PosMask::BITS as PositionT {
                let bit = pos_bit(pos);
                if ctx.targets & bit != 0 && !self.bitmap.any_meta_marked(bit)
                {
                    done |= bit;
                }
            }
            if done == 0 {
                return Ok(CycleReport {
                    io_issued,
                    object: ctx.object,
                    ..Default::default()
                });
            }
            let end = self.bitmap.meta_end_lba();
            let advanced = self.store
                .advance(done, ctx.start_lba, end, 0)
                .await?;
            Ok(CycleReport {
                advanced,
                new_checkpoint: (advanced != 0).then_some(end),
                io_issued,
                blocks_counted: 0,
                object: ctx.object,
            })
        } else {
            let counted = run_end - ctx.start_lba;
            let advanced = self.store
                .advance(ctx.targets, ctx.start_lba, run_end, counted)
                .await?;
            Ok(CycleReport {
                advanced,
                new_checkpoint: (advanced != 0).then_some(run_end),
                io_issued,
                blocks_counted: if advanced != 0 { counted } else { 0 },
                object: ctx.object,
            })
        }
    }
}

// LCOV_EXCL_STOP
