// vim: tw=80
//! Seam to notification delivery
//!
//! The progress reporter emits start/progress/complete events addressed to
//! the external object being rebuilt.  Delivery (event log, management UI,
//! peer forwarding) happens outside of this subsystem and is fire-and-forget.

#[cfg(test)] use mockall::automock;

use crate::types::*;

/// Sink for rebuild lifecycle notifications.
#[cfg_attr(test, automock)]
pub trait Notifier: Send + Sync {
    /// Rebuild of `position` has begun.
    fn started(&self, object: ObjectId, position: PositionT);

    /// Percent-complete changed.  Only fires when the integer percent
    /// actually moves.
    fn progress(&self, object: ObjectId, position: PositionT, percent: u8);

    /// Rebuild of `position` reached 100%.
    fn ended(&self, object: ObjectId, position: PositionT);
}
