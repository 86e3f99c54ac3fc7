//! Mutual exclusion between reconciliation, brick maintenance and locally
//! initiated snapshot operations.
//!
//! Only one of the activities below may touch the inventory or snapshot
//! bricks at a time.
//! Waiters block on a condition variable and are woken when the holder's
//! guard drops.

use parking_lot::{Condvar, Mutex};
use std::fmt;
use tracing::debug;

/// Work that needs exclusive access to snapshot bricks
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Activity {
    Reconciliation,
    BrickRestart,
    /// Create, delete or restore started on this node
    LocalOperation,
}

impl fmt::Display for Activity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reconciliation => f.write_str("reconciliation"),
            Self::BrickRestart => f.write_str("brick restart"),
            Self::LocalOperation => f.write_str("local snapshot operation"),
        }
    }
}

#[derive(Default)]
pub struct ExclusiveSection {
    holder: Mutex<Option<Activity>>,
    released: Condvar,
}

impl ExclusiveSection {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until no other activity holds the section, then take it
    pub fn enter(&self, activity: Activity) -> ExclusiveGuard<'_> {
        let mut holder = self.holder.lock();
        if let Some(current) = *holder {
            debug!("{} waiting for {} to finish", activity, current);
        }
        self.released.wait_while(&mut holder, |h| h.is_some());
        *holder = Some(activity);
        ExclusiveGuard {
            section: self,
            activity,
        }
    }

    /// Take the section only if it is free
    pub fn try_enter(&self, activity: Activity) -> Option<ExclusiveGuard<'_>> {
        let mut holder = self.holder.lock();
        if holder.is_some() {
            return None;
        }
        *holder = Some(activity);
        Some(ExclusiveGuard {
            section: self,
            activity,
        })
    }

    /// Activity currently holding the section
    pub fn holder(&self) -> Option<Activity> {
        *self.holder.lock()
    }
}

/// Releases the section and wakes all waiters on drop
pub struct ExclusiveGuard<'a> {
    section: &'a ExclusiveSection,
    activity: Activity,
}

impl ExclusiveGuard<'_> {
    #[must_use]
    pub const fn activity(&self) -> Activity {
        self.activity
    }
}

impl Drop for ExclusiveGuard<'_> {
    fn drop(&mut self) {
        *self.section.holder.lock() = None;
        self.section.released.notify_all();
    }
}
