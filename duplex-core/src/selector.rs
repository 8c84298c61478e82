// vim: tw=80
//! The rebuild selector
//!
//! Chooses which degraded position(s) the next cycle should advance, and
//! from what LBA.  Positions sharing the same effective checkpoint are
//! batched into one request so a single pass of reconstruction I/O serves
//! all of them.
//!
//! Region ordering is driven entirely by checkpoint values.  A freshly
//! degraded position sits at the user-capacity boundary, where the
//! metadata-of-metadata table decides: metadata chunks still marked means the
//! metadata region rebuilds first, a clean table means the position is
//! completing.  A checkpoint past the boundary means the metadata region just
//! finished, and the position needs its checkpoint reset to 0 before the user
//! sweep starts.

use itertools::Itertools;

use crate::{
    bitmap::NeedsRebuildBitmap,
    checkpoint::CheckpointStore,
    types::*,
};

/// What the next rebuild cycle should do.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RebuildAction {
    /// Every position with an occupied checkpoint slot
    pub degraded_mask: PosMask,
    /// Positions the next cycle should advance, all from `target_checkpoint`
    pub rebuild_now_mask: PosMask,
    /// Positions with no remaining work in either region, awaiting collapse
    /// to the end-marker
    pub completing_mask: PosMask,
    /// The cycle's starting LBA
    pub target_checkpoint: LbaT,
    /// The batch's checkpoints must rewind to 0 before any I/O: their
    /// metadata region just finished and the user sweep is about to start
    pub needs_reset: bool,
}

impl RebuildAction {
    /// Is there anything at all for the driver to do?
    pub fn is_idle(&self) -> bool {
        self.rebuild_now_mask == 0 && self.completing_mask == 0
    }
}

/// Scan all tracked positions and pick the next action.
///
/// `enabled` is the mask of positions with a usable path to their backing
/// store; the rest cannot be rebuild targets this cycle.
#[tracing::instrument(skip(store, bitmap))]
pub fn find_action(store: &CheckpointStore, bitmap: &NeedsRebuildBitmap,
                   enabled: PosMask) -> RebuildAction
{
    let user_capacity = bitmap.meta_start_lba();
    let mut action = RebuildAction::default();
    // (effective checkpoint, reset status) of the current best batch
    let mut best: Option<(LbaT, bool)> = None;

    let candidates = store.occupied()
        .sorted_by_key(|(position, _)| *position);
    for (position, checkpoint) in candidates {
        let bit = pos_bit(position);
        action.degraded_mask |= bit;
        // A position requires rebuild iff its checkpoint isn't the end-marker
        let Some(lba) = checkpoint.as_lba() else {
            continue;
        };
        if store.is_logging(position) || enabled & bit == 0 {
            continue;
        }
        let (effective, reset) = if lba > user_capacity {
            // Metadata region just finished; user sweep starts at 0
            (0, true)
        } else if lba == user_capacity {
            if bitmap.any_meta_marked(bit) {
                // Substitute the metadata region's LBA
                (bitmap.meta_start_lba(), false)
            } else {
                action.completing_mask |= bit;
                continue;
            }
        } else {
            (lba, false)
        };
        match best {
            None => {
                best = Some((effective, reset));
                action.rebuild_now_mask = bit;
            },
            Some((best_eff, _)) if effective > best_eff => {
                best = Some((effective, reset));
                action.rebuild_now_mask = bit;
            },
            Some((best_eff, best_reset))
                if effective == best_eff && reset == best_reset =>
            {
                action.rebuild_now_mask |= bit;
            },
            Some((best_eff, _)) if effective == best_eff => {
                // Equal checkpoints but mismatched reset status: defer the
                // later-scanned position one cycle rather than batch mixed
                // states.
                tracing::debug!(position, "Deferring mixed-reset sibling");
            },
            Some(_) => {},
        }
    }
    if let Some((effective, reset)) = best {
        action.target_checkpoint = effective;
        action.needs_reset = reset;
    }
    tracing::debug!(?action, "Selected");
    action
}

// LCOV_EXCL_STOP
