// vim: tw=80
//! The rebuild checkpoint table
//!
//! Two slots, because at most two positions of a RaidGroup may be degraded at
//! once.  The table and the per-slot blocks-rebuilt counters persist together
//! in one non-paged record that is replicated to the peer controller.
//! Rebuild-logging is part of the occupied slot, so an untracked position
//! cannot be rebuild-logging.
//!
//! Only the active controller originates advances.  To bound traffic on the
//! inter-controller link, routine advances persist with the local-only
//! increment variant; a full peer-replicated push happens when the configured
//! interval has elapsed or whenever a position completes.  Completion is
//! never allowed to ride on a local-only write.

use std::sync::Arc;

use serde_derive::{Deserialize, Serialize};
use tokio::time::{Duration, Instant};

use crate::{
    metadata::NonpagedStore,
    types::*,
};

/// Maximum number of simultaneously degraded positions.
pub const NSLOTS: usize = 2;

const RECORD_VERSION: u32 = 1;

/// One checkpoint slot.
///
/// Occupied iff the position currently needs rebuild tracking.  The tagged
/// representation makes "at most two degraded" explicit; there is no sentinel
/// position value, and a position cannot be rebuild-logging without being
/// tracked.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub enum Slot {
    #[default]
    Empty,
    Occupied {
        position: PositionT,
        checkpoint: Checkpoint,
        /// Down but journaled rather than actively rebuilt; the checkpoint
        /// is frozen while set
        logging: bool,
    },
}

impl Slot {
    fn position(&self) -> Option<PositionT> {
        if let Slot::Occupied { position, .. } = self {
            Some(*position)
        } else {
            None
        }
    }

    fn checkpoint(&self) -> Option<Checkpoint> {
        if let Slot::Occupied { checkpoint, .. } = self {
            Some(*checkpoint)
        } else {
            None
        }
    }
}

/// Persisted form of the checkpoint table.  Versioned; byte-compatible across
/// controller reboots within the same array.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct CheckpointRecord {
    version: u32,
    slots: [Slot; NSLOTS],
    /// Cumulative user blocks rebuilt, per slot.  Drives percent-complete.
    blocks: [LbaT; NSLOTS],
}

impl CheckpointRecord {
    fn new() -> Self {
        CheckpointRecord {
            version: RECORD_VERSION,
            slots: [Slot::Empty; NSLOTS],
            blocks: [0; NSLOTS],
        }
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|_| Error::EINTEGRITY)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        let rec: CheckpointRecord = bincode::deserialize(bytes)
            .map_err(|_| Error::EINTEGRITY)?;
        if rec.version != RECORD_VERSION {
            return Err(Error::EINTEGRITY);
        }
        Ok(rec)
    }
}

/// Which controller this store instance lives on.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Role {
    /// Originates checkpoint advances
    Active,
    /// Applies received updates verbatim
    Passive,
}

pub struct CheckpointStore {
    role: Role,
    rec: CheckpointRecord,
    store: Arc<dyn NonpagedStore>,
    push_interval: Duration,
    last_push: Instant,
}

impl CheckpointStore {
    pub fn create(role: Role, store: Arc<dyn NonpagedStore>,
                  push_interval: Duration) -> Self
    {
        CheckpointStore {
            role,
            rec: CheckpointRecord::new(),
            store,
            push_interval,
            last_push: Instant::now(),
        }
    }

    /// Reload the table after a controller reboot.
    pub async fn open(role: Role, store: Arc<dyn NonpagedStore>,
                      push_interval: Duration) -> Result<Self>
    {
        let buf = store.read().await?;
        let rec = CheckpointRecord::deserialize(&buf[..])?;
        Ok(CheckpointStore {
            role,
            rec,
            store,
            push_interval,
            last_push: Instant::now(),
        })
    }

    fn slot_of(&self, position: PositionT) -> Option<usize> {
        self.rec.slots.iter()
            .position(|s| s.position() == Some(position))
    }

    /// The checkpoint for `position`.  Untracked positions have no remaining
    /// work.
    pub fn checkpoint(&self, position: PositionT) -> Checkpoint {
        self.slot_of(position)
            .and_then(|i| self.rec.slots[i].checkpoint())
            .unwrap_or(Checkpoint::Complete)
    }

    /// The least-advanced checkpoint of any occupied slot.
    pub fn min_checkpoint(&self) -> Checkpoint {
        self.occupied().map(|(_, c)| c).min()
            .unwrap_or(Checkpoint::Complete)
    }

    /// The most-advanced checkpoint of any occupied slot.
    pub fn max_checkpoint(&self) -> Checkpoint {
        self.occupied().map(|(_, c)| c).max()
            .unwrap_or(Checkpoint::Complete)
    }

    /// Iterate over `(position, checkpoint)` for every occupied slot.
    pub fn occupied(&self)
        -> impl Iterator<Item = (PositionT, Checkpoint)> + '_
    {
        self.rec.slots.iter().filter_map(|s| {
            s.position().and_then(|p| s.checkpoint().map(|c| (p, c)))
        })
    }

    /// Cumulative user blocks rebuilt for `position`.
    pub fn blocks_rebuilt(&self, position: PositionT) -> LbaT {
        self.slot_of(position)
            .map(|i| self.rec.blocks[i])
            .unwrap_or(0)
    }

    /// Every tracked position currently in rebuild-logging.
    pub fn logging_mask(&self) -> PosMask {
        self.rec.slots.iter()
            .filter_map(|s| match s {
                Slot::Occupied { position, logging: true, .. } =>
                    Some(pos_bit(*position)),
                _ => None,
            })
            .fold(0, |acc, bit| acc | bit)
    }

    pub fn is_logging(&self, position: PositionT) -> bool {
        self.logging_mask() & pos_bit(position) != 0
    }

    /// Begin tracking `position`, seeded at `checkpoint`.
    ///
    /// Fails with `ENODEV` if both slots are already occupied by other
    /// positions: the redundancy model tolerates no more.
    pub async fn occupy(&mut self, position: PositionT,
                        checkpoint: Checkpoint) -> Result<()>
    {
        debug_assert_eq!(self.role, Role::Active);
        if self.slot_of(position).is_some() {
            return Err(Error::EPERM);
        }
        let Some(i) = self.rec.slots.iter().position(|s| *s == Slot::Empty)
        else {
            tracing::error!(position,
                "More degraded positions than the redundancy model tolerates");
            return Err(Error::ENODEV);
        };
        self.rec.slots[i] = Slot::Occupied {
            position,
            checkpoint,
            logging: false,
        };
        self.rec.blocks[i] = 0;
        self.push_full().await
    }

    /// Stop tracking `position` and clear its counters.
    pub async fn release(&mut self, position: PositionT) -> Result<()> {
        debug_assert_eq!(self.role, Role::Active);
        let i = self.slot_of(position).ok_or(Error::ENOENT)?;
        self.rec.slots[i] = Slot::Empty;
        self.rec.blocks[i] = 0;
        self.push_full().await
    }

    /// Set or clear rebuild-logging for `position`, which must be tracked.
    /// A state change, so it always takes the peer-replicated path.
    pub async fn set_logging(&mut self, position: PositionT, logging: bool)
        -> Result<()>
    {
        debug_assert_eq!(self.role, Role::Active);
        let i = self.slot_of(position).ok_or(Error::ENOENT)?;
        let Slot::Occupied { checkpoint, logging: old, .. } =
            self.rec.slots[i]
        else {
            unreachable!()
        };
        if logging == old {
            return Ok(());
        }
        self.rec.slots[i] = Slot::Occupied { position, checkpoint, logging };
        self.push_full().await
    }

    /// Advance every position in `mask` from `start` to `new`, crediting
    /// `counted_blocks` user blocks to each advanced slot.
    ///
    /// A masked position whose stored checkpoint is not `At(start)` is
    /// excluded rather than failed: a second, independently-degraded position
    /// can legitimately trail the range just completed.  Returns the mask of
    /// positions actually advanced.
    #[tracing::instrument(skip(self))]
    pub async fn advance(&mut self, mask: PosMask, start: LbaT, new: LbaT,
                         counted_blocks: LbaT) -> Result<PosMask>
    {
        debug_assert_eq!(self.role, Role::Active);
        debug_assert!(new >= start);
        let mut advanced = 0;
        for i in 0..NSLOTS {
            let Slot::Occupied { position, checkpoint, logging } =
                self.rec.slots[i]
            else {
                continue;
            };
            if mask & pos_bit(position) == 0 {
                continue;
            }
            if checkpoint != Checkpoint::At(start) {
                tracing::debug!(position, %checkpoint, start,
                    "Excluding position whose checkpoint moved");
                continue;
            }
            self.rec.slots[i] = Slot::Occupied {
                position,
                checkpoint: Checkpoint::At(new),
                logging,
            };
            self.rec.blocks[i] += counted_blocks;
            advanced |= pos_bit(position);
        }
        if advanced == 0 {
            // Every masked position raced away.  Nothing to persist.
            return Ok(0);
        }
        self.save(false).await?;
        Ok(advanced)
    }

    /// Rewind `position` to LBA 0.  Marks the metadata-to-user transition;
    /// the discontinuity always takes the peer-replicated path.
    pub async fn reset(&mut self, position: PositionT) -> Result<()> {
        debug_assert_eq!(self.role, Role::Active);
        let i = self.slot_of(position).ok_or(Error::ENOENT)?;
        let Slot::Occupied { logging, .. } = self.rec.slots[i] else {
            unreachable!()
        };
        self.rec.slots[i] = Slot::Occupied {
            position,
            checkpoint: Checkpoint::At(0),
            logging,
        };
        self.push_full().await
    }

    /// Collapse `position` to the end-marker.  Completion always persists via
    /// an unconditional full push; it must never be dropped.
    pub async fn complete(&mut self, position: PositionT) -> Result<()> {
        debug_assert_eq!(self.role, Role::Active);
        let i = self.slot_of(position).ok_or(Error::ENOENT)?;
        self.rec.slots[i] = Slot::Occupied {
            position,
            checkpoint: Checkpoint::Complete,
            logging: false,
        };
        self.push_full().await
    }

    /// Apply a full record received from the active controller.
    pub fn apply_peer_update(&mut self, bytes: &[u8]) -> Result<()> {
        if self.role != Role::Passive {
            return Err(Error::EPERM);
        }
        self.rec = CheckpointRecord::deserialize(bytes)?;
        Ok(())
    }

    /// The current record, serialized for the peer.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        self.rec.serialize()
    }

    /// Persist the record, choosing between a full peer-replicated push and a
    /// local-only increment.
    async fn save(&mut self, force: bool) -> Result<()> {
        let elapsed = self.last_push.elapsed();
        if force || elapsed >= self.push_interval {
            self.push_full().await
        } else {
            self.store.increment(self.rec.serialize()?).await
        }
    }

    async fn push_full(&mut self) -> Result<()> {
        self.store.set(self.rec.serialize()?).await?;
        self.last_push = Instant::now();
        Ok(())
    }
}

// LCOV_EXCL_STOP
