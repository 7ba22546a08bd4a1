//! The wait lock and parent links.
//!
//! `WAIT_LOCK` closes the `exit`/`wait` race: a child that turns zombie
//! after its parent's scan but before the parent sleeps must not slip
//! its wakeup in between. It also serialises every `Proc::parent`
//! transition. Lock order: `WAIT_LOCK` before any slot lock.

use core::cell::UnsafeCell;

use crate::sync::{SpinLock, SpinLockGuard};

use super::Proc;

pub(super) struct WaitLock {}

static WAIT_LOCK: SpinLock<WaitLock> = SpinLock::new(WaitLock {});

pub(super) fn lock() -> SpinLockGuard<'static, WaitLock> {
    WAIT_LOCK.lock()
}

/// A parent back-reference, readable and writable only while holding
/// the wait lock (witnessed by the guard argument).
pub(super) struct Parent {
    parent: UnsafeCell<Option<&'static Proc>>,
}

unsafe impl Sync for Parent {}

impl Parent {
    pub(super) const fn new() -> Self {
        Self {
            parent: UnsafeCell::new(None),
        }
    }

    pub(super) fn get(&self, _wait_lock: &mut SpinLockGuard<'_, WaitLock>) -> Option<&'static Proc> {
        unsafe { *self.parent.get() }
    }

    pub(super) fn set(
        &self,
        parent: Option<&'static Proc>,
        _wait_lock: &mut SpinLockGuard<'_, WaitLock>,
    ) {
        unsafe {
            *self.parent.get() = parent;
        }
    }

    /// Clears the link without the wait lock; only valid while freeing
    /// a slot whose lock is held and whose state is being reset.
    pub(super) unsafe fn reset(&self) {
        unsafe {
            *self.parent.get() = None;
        }
    }
}
