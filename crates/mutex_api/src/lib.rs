//! Lock abstraction traits.
//!
//! Data structures that must work both inside the kernel (spin / sleep
//! locks) and in host unit tests (`std::sync`) are written against these
//! traits instead of a concrete lock type.
#![no_std]

use core::ops::DerefMut;

/// A mutual-exclusion lock.
pub trait Mutex {
    /// The data the lock protects.
    type Data;

    /// The guard returned by [`Mutex::lock`].
    type Guard<'a>: DerefMut<Target = Self::Data>
    where
        Self: 'a;

    /// Creates a new lock around `data`.
    fn new(data: Self::Data) -> Self;

    /// Acquires the lock, blocking until it is available.
    fn lock(&self) -> Self::Guard<'_>;
}

/// A condition variable paired with a [`Mutex`].
///
/// `wait` releases the guard's lock, suspends the caller, and reacquires
/// the lock before returning. Spurious wakeups are allowed; callers must
/// re-check their predicate in a loop.
pub trait Condvar<M>
where
    M: Mutex,
{
    /// Creates a new condition variable.
    fn new() -> Self;

    /// Atomically releases `guard` and waits for a notification.
    fn wait<'a>(&self, guard: M::Guard<'a>) -> M::Guard<'a>;

    /// Wakes every current waiter.
    fn notify_all(&self);
}

#[cfg(feature = "std")]
extern crate std;

/// [`Mutex`] and [`Condvar`] over `std::sync`, for unit tests of the
/// crates built on these traits.
#[cfg(feature = "std")]
pub mod host {
    use core::ops::{Deref, DerefMut};

    /// `std::sync::Mutex` behind the [`crate::Mutex`] trait.
    ///
    /// Poisoning is ignored; a panicking test fails on its own.
    pub struct StdMutex<T>(std::sync::Mutex<T>);

    pub struct StdMutexGuard<'a, T>(std::sync::MutexGuard<'a, T>);

    impl<T> crate::Mutex for StdMutex<T> {
        type Data = T;

        type Guard<'a>
            = StdMutexGuard<'a, T>
        where
            T: 'a;

        fn new(data: T) -> Self {
            Self(std::sync::Mutex::new(data))
        }

        fn lock(&self) -> StdMutexGuard<'_, T> {
            StdMutexGuard(self.0.lock().unwrap())
        }
    }

    impl<T> Deref for StdMutexGuard<'_, T> {
        type Target = T;

        fn deref(&self) -> &T {
            &self.0
        }
    }

    impl<T> DerefMut for StdMutexGuard<'_, T> {
        fn deref_mut(&mut self) -> &mut T {
            &mut self.0
        }
    }

    /// `std::sync::Condvar` behind the [`crate::Condvar`] trait.
    pub struct StdCondvar(std::sync::Condvar);

    impl<T> crate::Condvar<StdMutex<T>> for StdCondvar {
        fn new() -> Self {
            Self(std::sync::Condvar::new())
        }

        fn wait<'a>(&self, guard: StdMutexGuard<'a, T>) -> StdMutexGuard<'a, T>
        where
            T: 'a,
        {
            StdMutexGuard(self.0.wait(guard.0).unwrap())
        }

        fn notify_all(&self) {
            self.0.notify_all();
        }
    }
}
