//! Sleep locks: blocking mutual exclusion for long critical sections.
//!
//! Unlike a spin lock, holding a sleep lock leaves interrupts enabled
//! and the holder may itself block (disk I/O holds buffer sleep locks
//! across request completion). Never use one from an interrupt handler.

use core::{
    cell::UnsafeCell,
    ops::{Deref, DerefMut},
    ptr,
};

use mutex_api::Mutex;

use crate::proc::{self, ProcId};

use super::SpinLock;

struct RawSleepLock {
    /// (locked, owning pid); the spin lock guards both.
    inner: SpinLock<(bool, ProcId)>,
}

impl RawSleepLock {
    const fn new() -> Self {
        Self {
            inner: SpinLock::new((false, ProcId::INVALID)),
        }
    }

    fn acquire(&self) {
        let mut inner = self.inner.lock();
        while inner.0 {
            inner = proc::sleep(ptr::from_ref(self).addr(), inner);
        }
        inner.0 = true;
        inner.1 = proc::current_pid();
    }

    fn try_acquire(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.0 {
            return false;
        }
        inner.0 = true;
        inner.1 = proc::current_pid();
        true
    }

    fn release(&self) {
        let mut inner = self.inner.lock();
        inner.0 = false;
        inner.1 = ProcId::INVALID;
        proc::wakeup(ptr::from_ref(self).addr());
    }
}

/// A [`RawSleepLock`] protecting a value, with a scoped guard.
pub struct SleepLock<T> {
    lock: RawSleepLock,
    value: UnsafeCell<T>,
}

unsafe impl<T> Sync for SleepLock<T> where T: Send {}

impl<T> SleepLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            lock: RawSleepLock::new(),
            value: UnsafeCell::new(value),
        }
    }

    /// Acquires the lock, sleeping until it is available.
    pub fn lock(&self) -> SleepLockGuard<'_, T> {
        self.lock.acquire();
        SleepLockGuard { lock: self }
    }

    /// Acquires the lock only if it is free right now.
    pub fn try_lock(&self) -> Option<SleepLockGuard<'_, T>> {
        self.lock.try_acquire().then_some(SleepLockGuard { lock: self })
    }
}

impl<T> Mutex for SleepLock<T> {
    type Data = T;
    type Guard<'a>
        = SleepLockGuard<'a, T>
    where
        T: 'a;

    fn new(data: T) -> Self {
        Self::new(data)
    }

    fn lock(&self) -> SleepLockGuard<'_, T> {
        self.lock()
    }
}

pub struct SleepLockGuard<'a, T> {
    lock: &'a SleepLock<T>,
}

unsafe impl<T> Send for SleepLockGuard<'_, T> where T: Send {}
unsafe impl<T> Sync for SleepLockGuard<'_, T> where T: Sync {}

impl<T> Drop for SleepLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.lock.release();
    }
}

impl<T> Deref for SleepLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for SleepLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.value.get() }
    }
}
