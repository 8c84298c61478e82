// vim: tw=80
//! Seam to the shared background-I/O credit gate
//!
//! Rebuild competes with host I/O and other background services for a shared
//! pool of I/O capacity.  Every cycle must be granted credits before it may
//! issue reconstruction I/O.  Denied credits defer the cycle with a fixed
//! backoff; they never block it indefinitely.

#[cfg(test)] use mockall::automock;

use serde_derive::{Deserialize, Serialize};

use crate::types::*;

/// Scheduling priority for a credit request.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Ord, PartialEq,
         PartialOrd, Serialize)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    /// Used when the RaidGroup is doubly degraded and data loss is one more
    /// failure away.
    Urgent,
}

/// The credit/priority admission gate.
#[cfg_attr(test, automock)]
pub trait CreditGate: Send + Sync {
    /// Request `io_credits` worth of background-I/O capacity.
    ///
    /// Resolves to `true` if granted.  `false` is not an error; the caller
    /// backs off and retries.
    fn request(&self, priority: Priority, io_credits: u32)
        -> BoxRebuildFut<bool>;
}
