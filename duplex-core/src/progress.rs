// vim: tw=80
//! The progress reporter
//!
//! Computes percent-complete per rebuilding position and drives the external
//! notification state machine:
//!
//! ```text
//! Idle -> Started -> InProgress* -> Ended -> Idle
//! ```
//!
//! Percent is user blocks rebuilt over per-disk user capacity; the metadata
//! region does not count, so 100% means user space is fully rebuilt.

use crate::{
    checkpoint::NSLOTS,
    notify::Notifier,
    types::*,
};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum NotifyState {
    Idle,
    Started,
    InProgress,
    Ended,
}

#[derive(Clone, Copy, Debug)]
struct SlotState {
    position: PositionT,
    state: NotifyState,
    /// Previously reported percent
    last_percent: u8,
    /// External object currently notified, once known
    object: Option<ObjectId>,
}

pub struct ProgressReporter {
    /// Per-disk user capacity, in LBAs
    user_capacity: LbaT,
    slots: [Option<SlotState>; NSLOTS],
}

impl ProgressReporter {
    pub fn new(user_capacity: LbaT) -> Self {
        assert!(user_capacity > 0);
        ProgressReporter {
            user_capacity,
            slots: [None; NSLOTS],
        }
    }

    fn slot(&mut self, position: PositionT) -> Option<&mut SlotState> {
        self.slots.iter_mut()
            .flatten()
            .find(|s| s.position == position)
    }

    /// Begin tracking a freshly degraded position.
    pub fn begin(&mut self, position: PositionT) {
        debug_assert!(self.slot(position).is_none());
        let free = self.slots.iter_mut().find(|s| s.is_none())
            .expect("More progress slots than checkpoint slots");
        *free = Some(SlotState {
            position,
            state: NotifyState::Idle,
            last_percent: 0,
            object: None,
        });
    }

    /// Resume tracking after a controller reboot.
    ///
    /// With nonzero persisted progress the slot starts in `InProgress`, which
    /// suppresses a second STARTED and keeps external displays from resetting.
    pub fn resume(&mut self, position: PositionT, blocks_rebuilt: LbaT) {
        self.begin(position);
        if blocks_rebuilt > 0 {
            let pct = self.percent_of(blocks_rebuilt);
            let slot = self.slot(position).unwrap();
            slot.state = NotifyState::InProgress;
            slot.last_percent = pct;
        }
    }

    /// The external rebuild target for `position` became known.  Fires
    /// STARTED exactly once per degradation.
    pub fn set_object(&mut self, position: PositionT, object: ObjectId,
                      notifier: &dyn Notifier)
    {
        let Some(slot) = self.slot(position) else {
            return;
        };
        slot.object = Some(object);
        if slot.state == NotifyState::Idle {
            slot.state = NotifyState::Started;
            tracing::info!(%object, position, "Rebuild started");
            notifier.started(object, position);
        }
    }

    fn percent_of(&self, blocks_rebuilt: LbaT) -> u8 {
        // Widen before multiplying; capacities near the top of the LBA
        // range would overflow a u64 product.
        let done = blocks_rebuilt.min(self.user_capacity) as u128;
        (done * 100 / self.user_capacity as u128) as u8
    }

    /// Percent-complete for `position` given its blocks-rebuilt counter.
    pub fn percent(&self, blocks_rebuilt: LbaT) -> u8 {
        self.percent_of(blocks_rebuilt)
    }

    /// Note new cumulative progress.  Fires PROGRESS only when the integer
    /// percent moved.
    pub fn update(&mut self, position: PositionT, blocks_rebuilt: LbaT,
                  notifier: &dyn Notifier)
    {
        let pct = self.percent_of(blocks_rebuilt);
        let Some(slot) = self.slot(position) else {
            return;
        };
        match slot.state {
            // The external target isn't known yet; nothing to address
            NotifyState::Idle => {},
            NotifyState::Started | NotifyState::InProgress => {
                slot.state = NotifyState::InProgress;
                if pct != slot.last_percent {
                    slot.last_percent = pct;
                    if let Some(object) = slot.object {
                        notifier.progress(object, position, pct);
                    }
                }
            },
            NotifyState::Ended => {},
        }
    }

    /// The position finished rebuilding.  Fires ENDED once and clears the
    /// slot.
    pub fn finish(&mut self, position: PositionT, notifier: &dyn Notifier) {
        let Some(slot) = self.slot(position) else {
            return;
        };
        if slot.state != NotifyState::Ended {
            if let Some(object) = slot.object {
                tracing::info!(%object, position, "Rebuild complete");
                notifier.ended(object, position);
            }
        }
        self.clear(position);
    }

    /// Drop tracking without an ENDED event, e.g. when the position
    /// de-degrades because its disk came back.
    pub fn clear(&mut self, position: PositionT) {
        for s in self.slots.iter_mut() {
            if s.map(|ss| ss.position) == Some(position) {
                *s = None;
            }
        }
    }
}

// LCOV_EXCL_STOP
