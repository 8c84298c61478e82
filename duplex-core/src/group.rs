// vim: tw=80
//! RaidGroup: geometry, lifecycle, and the rebuild cycle driver
//!
//! One `RaidGroup` owns the checkpoint table, the needs-rebuild bitmap, and
//! the progress reporter for one group of disk positions, and drives rebuild
//! cycles against the external service seams.  Cycles within a group are
//! strictly sequential; concurrency across groups is the embedding
//! controller's business.

use std::{
    fmt,
    sync::Arc,
};

use futures_locks::RwLock;
use serde_derive::{Deserialize, Serialize};
use tokio::time::Duration;
use uuid::Uuid;

use crate::{
    bitmap::NeedsRebuildBitmap,
    blockio::BlockIo,
    checkpoint::{CheckpointStore, Role},
    credit::{CreditGate, Priority},
    metadata::{NonpagedStore, PagedStore},
    notify::Notifier,
    permit::ConsumptionOracle,
    progress::ProgressReporter,
    rebuild::RebuildPipeline,
    selector::find_action,
    types::*,
};

/// Rebuild tunables.  All have usable defaults.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct RebuildParams {
    /// Upper bound on one user-region cycle, in chunks
    pub cycle_chunks: ChunkT,
    /// Minimum interval between interval-gated full peer pushes, in seconds
    pub push_interval_secs: u64,
    /// Credit priority while singly degraded.  Doubly degraded groups always
    /// request `Urgent`.
    pub priority: Priority,
    /// Credits requested per cycle
    pub io_credits: u32,
    /// Fixed backoff after a denied or deferred cycle, in milliseconds
    pub retry_backoff_ms: u64,
}

impl Default for RebuildParams {
    fn default() -> Self {
        RebuildParams {
            cycle_chunks: 16,
            push_interval_secs: 5,
            priority: Priority::Normal,
            io_credits: 8,
            retry_backoff_ms: 100,
        }
    }
}

impl RebuildParams {
    pub fn push_interval(&self) -> Duration {
        Duration::from_secs(self.push_interval_secs)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

/// Health of one disk position.
///
/// The ordering reflects which Health is "sicker"; a group's health is the
/// sickest of its positions'.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Ord, PartialEq, PartialOrd,
         Serialize)]
pub enum Health {
    /// Perfectly healthy
    Online,
    /// Stale; reconstruction in progress
    Rebuilding,
    /// Stale and deliberately falling further behind; writes to the position
    /// are only being logged
    RebuildLogging,
    /// No usable path to the backing store.  No I/O is possible
    Faulted,
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Online => "Online".fmt(f),
            Self::Rebuilding => "Rebuilding".fmt(f),
            Self::RebuildLogging => "RebuildLogging".fmt(f),
            Self::Faulted => "Faulted".fmt(f),
        }
    }
}

/// Per-position detail in a [`Status`].
#[derive(Clone, Copy, Debug)]
pub struct PositionStatus {
    pub position: PositionT,
    pub health: Health,
    /// Percent of user capacity rebuilt, for rebuilding positions
    pub percent: Option<u8>,
}

/// Return value of [`RaidGroup::status`]
#[derive(Clone, Debug)]
pub struct Status {
    pub health: Health,
    pub positions: Vec<PositionStatus>,
    pub uuid: Uuid,
}

impl Status {
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }
}

/// The external services a RaidGroup runs against.
#[derive(Clone)]
pub struct Services {
    pub blockio: Arc<dyn BlockIo>,
    pub oracle: Arc<dyn ConsumptionOracle>,
    pub gate: Arc<dyn CreditGate>,
    pub notifier: Arc<dyn Notifier>,
    /// Paged metadata backing the user-region chunk records
    pub paged: Arc<dyn PagedStore>,
    /// Non-paged region holding the checkpoint record
    pub checkpoint_store: Arc<dyn NonpagedStore>,
    /// Non-paged region holding the metadata-of-metadata table
    pub mom_store: Arc<dyn NonpagedStore>,
}

struct Inner {
    store: CheckpointStore,
    bitmap: NeedsRebuildBitmap,
    progress: ProgressReporter,
    /// Positions with a usable path to their backing store
    enabled: PosMask,
}

pub struct RaidGroup {
    uuid: Uuid,
    nr_positions: PositionT,
    params: RebuildParams,
    blockio: Arc<dyn BlockIo>,
    oracle: Arc<dyn ConsumptionOracle>,
    gate: Arc<dyn CreditGate>,
    notifier: Arc<dyn Notifier>,
    inner: RwLock<Inner>,
}

impl RaidGroup {
    /// Construct a freshly configured RaidGroup with no rebuild state.
    pub fn create(uuid: Uuid, nr_positions: PositionT, chunk_size: LbaT,
                  user_capacity: LbaT, meta_chunks: ChunkT,
                  params: RebuildParams, services: Services) -> Self
    {
        let store = CheckpointStore::create(Role::Active,
            services.checkpoint_store, params.push_interval());
        let bitmap = NeedsRebuildBitmap::create(chunk_size, user_capacity,
            meta_chunks, services.paged, services.mom_store);
        let progress = ProgressReporter::new(user_capacity);
        RaidGroup {
            uuid,
            nr_positions,
            params,
            blockio: services.blockio,
            oracle: services.oracle,
            gate: services.gate,
            notifier: services.notifier,
            inner: RwLock::new(Inner {
                store,
                bitmap,
                progress,
                enabled: !0,
            }),
        }
    }

    /// Reload a RaidGroup after a controller reboot.
    ///
    /// Checkpoint slots, blocks-rebuilt counters, and the rebuild-logging
    /// mask come back from the non-paged store.  Tracked positions resume in
    /// the progress reporter; ones with persisted progress skip the STARTED
    /// notification so external displays don't reset.
    pub async fn open(uuid: Uuid, nr_positions: PositionT, chunk_size: LbaT,
                      user_capacity: LbaT, meta_chunks: ChunkT,
                      params: RebuildParams, services: Services)
        -> Result<Self>
    {
        let store = CheckpointStore::open(Role::Active,
            services.checkpoint_store, params.push_interval()).await?;
        let bitmap = NeedsRebuildBitmap::open(chunk_size, user_capacity,
            meta_chunks, services.paged, services.mom_store).await?;
        let mut progress = ProgressReporter::new(user_capacity);
        for (position, checkpoint) in store.occupied() {
            if !checkpoint.is_complete() {
                progress.resume(position, store.blocks_rebuilt(position));
            }
        }
        Ok(RaidGroup {
            uuid,
            nr_positions,
            params,
            blockio: services.blockio,
            oracle: services.oracle,
            gate: services.gate,
            notifier: services.notifier,
            inner: RwLock::new(Inner {
                store,
                bitmap,
                progress,
                enabled: !0,
            }),
        })
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// A disk at `position` failed or was replaced with a stale one.
    ///
    /// Occupies a checkpoint slot, marks every chunk in both regions stale,
    /// and begins progress tracking.  Fails with `ENODEV` if the group is
    /// already doubly degraded; the caller must treat that as fatal.
    #[tracing::instrument(skip(self))]
    pub async fn degrade(&self, position: PositionT) -> Result<()> {
        assert!(position < self.nr_positions);
        let mut inner = self.inner.write().await;
        let boundary = inner.bitmap.meta_start_lba();
        // Seeding at the user-capacity boundary sends the selector straight
        // to the metadata region.
        inner.store.occupy(position, Checkpoint::At(boundary)).await?;
        if let Err(e) = inner.bitmap.mark_all(pos_bit(position)).await {
            // Without marked chunks the slot would skip-advance to a false
            // Complete.  Give the slot back so the whole degradation can be
            // re-attempted.
            inner.store.release(position).await?;
            return Err(e);
        }
        inner.progress.begin(position);
        Ok(())
    }

    /// `position`'s original disk came back with its data intact.  Stops
    /// tracking without a completion notification.
    pub async fn heal(&self, position: PositionT) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.store.release(position).await?;
        inner.progress.clear(position);
        Ok(())
    }

    /// Enter or leave rebuild-logging for `position`.  While set, the
    /// position receives no reconstruction I/O and its checkpoint is frozen.
    pub async fn set_rebuild_logging(&self, position: PositionT,
                                     logging: bool) -> Result<()>
    {
        let mut inner = self.inner.write().await;
        inner.store.set_logging(position, logging).await
    }

    /// Record whether `position` has a usable path to its backing store.
    pub async fn path_enabled(&self, position: PositionT, enabled: bool) {
        let mut inner = self.inner.write().await;
        let bit = pos_bit(position);
        if enabled {
            inner.enabled |= bit;
        } else {
            inner.enabled &= !bit;
        }
    }

    pub async fn checkpoint(&self, position: PositionT) -> Checkpoint {
        self.inner.read().await.store.checkpoint(position)
    }

    pub async fn min_checkpoint(&self) -> Checkpoint {
        self.inner.read().await.store.min_checkpoint()
    }

    pub async fn max_checkpoint(&self) -> Checkpoint {
        self.inner.read().await.store.max_checkpoint()
    }

    /// Percent of user capacity rebuilt for `position`.
    pub async fn percent_rebuilt(&self, position: PositionT) -> u8 {
        let inner = self.inner.read().await;
        let blocks = inner.store.blocks_rebuilt(position);
        inner.progress.percent(blocks)
    }

    pub async fn status(&self) -> Status {
        let inner = self.inner.read().await;
        let positions = (0..self.nr_positions).map(|position| {
            let bit = pos_bit(position);
            let rebuilding =
                !inner.store.checkpoint(position).is_complete();
            let health = if inner.enabled & bit == 0 {
                Health::Faulted
            } else if inner.store.is_logging(position) {
                Health::RebuildLogging
            } else if rebuilding {
                Health::Rebuilding
            } else {
                Health::Online
            };
            let percent = rebuilding.then(|| {
                inner.progress.percent(inner.store.blocks_rebuilt(position))
            });
            PositionStatus { position, health, percent }
        }).collect::<Vec<_>>();
        let health = positions.iter().map(|p| p.health).max()
            .unwrap_or(Health::Online);
        Status { health, positions, uuid: self.uuid }
    }

    /// Run rebuild cycles until every tracked position reaches the
    /// end-marker or a hard error stops the sweep.
    #[tracing::instrument(skip(self))]
    pub async fn rebuild_all(&self) -> Result<()> {
        while self.run_cycle().await? {
        }
        Ok(())
    }

    /// Execute at most one rebuild cycle.
    ///
    /// Returns `Ok(true)` if more work may remain, `Ok(false)` if every
    /// tracked position is at the end-marker.  Retryable conditions (denied
    /// credits, a busy permit service, a mid-flight cancellation) back off
    /// for the configured interval and report `Ok(true)`.
    pub async fn run_cycle(&self) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let action = find_action(&inner.store, &inner.bitmap, inner.enabled);

        // Collapse completing positions to the end-marker.
        let mut completing = action.completing_mask;
        while completing != 0 {
            let position = completing.trailing_zeros() as PositionT;
            completing &= completing - 1;
            let bit = pos_bit(position);
            if inner.bitmap.any_user_marked(bit).await? {
                // The checkpoint says done but chunks are still marked.  The
                // replicated checkpoint must have outrun a lost bitmap write;
                // sweep the user region again rather than declare victory.
                tracing::warn!(position,
                    "Marked user chunks behind a completing checkpoint");
                inner.store.reset(position).await?;
                continue;
            }
            inner.store.complete(position).await?;
            inner.progress.finish(position, &*self.notifier);
            tracing::info!(position, "Position fully rebuilt");
        }

        if action.rebuild_now_mask == 0 {
            return Ok(!find_action(&inner.store, &inner.bitmap,
                inner.enabled).is_idle());
        }

        if action.needs_reset {
            // Metadata region done; rewind to LBA 0 for the user sweep.
            let mut mask = action.rebuild_now_mask;
            while mask != 0 {
                let position = mask.trailing_zeros() as PositionT;
                mask &= mask - 1;
                inner.store.reset(position).await?;
            }
            return Ok(true);
        }

        let priority = if action.degraded_mask.count_ones() >= 2 {
            Priority::Urgent
        } else {
            self.params.priority
        };
        if !self.gate.request(priority, self.params.io_credits).await? {
            drop(inner);
            tracing::debug!("Credits denied; backing off");
            tokio::time::sleep(self.params.backoff()).await;
            return Ok(true);
        }

        let cycle_blocks = self.params.cycle_chunks
            * inner.bitmap.chunk_size();
        let result = {
            let inner = &mut *inner;
            let mut pipeline = RebuildPipeline {
                store: &mut inner.store,
                bitmap: &mut inner.bitmap,
                blockio: &*self.blockio,
                oracle: &*self.oracle,
                cycle_blocks,
            };
            pipeline.run(&action).await
        };
        match result {
            Ok(report) => {
                let mut mask = report.advanced;
                while mask != 0 {
                    let position = mask.trailing_zeros() as PositionT;
                    mask &= mask - 1;
                    if let Some(object) = report.object {
                        inner.progress.set_object(position, object,
                            &*self.notifier);
                    }
                    let blocks = inner.store.blocks_rebuilt(position);
                    inner.progress.update(position, blocks,
                        &*self.notifier);
                }
                Ok(true)
            },
            Err(e) if e.is_retryable() => {
                // Back off with the lock released so readers aren't stalled
                drop(inner);
                tokio::time::sleep(self.params.backoff()).await;
                Ok(true)
            },
            Err(e) => Err(e),
        }
    }
}

// LCOV_EXCL_STOP
