// vim: tw=80
//! Seam to the LUN-consumption permit mechanism
//!
//! Before rebuilding a user-region range, the pipeline asks whether any
//! upstream LUN has ever allocated it.  Ranges no LUN consumes are never
//! read or written; their rebuild bits clear and the checkpoint advances
//! directly.

#[cfg(test)] use mockall::automock;

use crate::types::*;

/// Disposition of a permit request.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PermitStatus {
    /// The head of the range is consumed by a LUN.
    Ok,
    /// The head of the range is consumed by no LUN.
    NoUserData,
    /// The permit service cannot answer right now.  Retry later.
    Busy,
    /// The permit service refused the request.  Retry later.
    Denied,
}

/// Reply to a permit request.
#[derive(Clone, Copy, Debug)]
pub struct PermitReply {
    pub status: PermitStatus,
    /// The LUN consuming the head of the range, if any
    pub object_id: Option<ObjectId>,
    /// Does the range contain the consumer's first block?
    pub is_start: bool,
    /// Does the range contain the consumer's last block?
    pub is_end: bool,
    /// With `Ok`: trailing blocks of the range past the consumer's extent.
    /// With `NoUserData`: length of the unconsumed span at the head.
    pub unconsumed_blocks: LbaT,
}

impl PermitReply {
    /// A reply for a range that one LUN wholly consumes.
    pub fn consumed(object_id: ObjectId) -> Self {
        PermitReply {
            status: PermitStatus::Ok,
            object_id: Some(object_id),
            is_start: false,
            is_end: false,
            unconsumed_blocks: 0,
        }
    }

    /// A reply for a range no LUN consumes at its head.
    pub fn unconsumed(blocks: LbaT) -> Self {
        PermitReply {
            status: PermitStatus::NoUserData,
            object_id: None,
            is_start: false,
            is_end: false,
            unconsumed_blocks: blocks,
        }
    }
}

/// The "is this LBA consumed" oracle.
#[cfg_attr(test, automock)]
pub trait ConsumptionOracle: Send + Sync {
    /// Ask whether `[lba, lba + blocks)` is consumed by an upstream LUN.
    ///
    /// The reply arrives asynchronously; the caller's rebuild cycle suspends
    /// until it does.
    fn request(&self, lba: LbaT, blocks: LbaT) -> BoxRebuildFut<PermitReply>;
}
