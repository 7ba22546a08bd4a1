//! A cell initialised once at boot and read-only afterwards.

use core::{
    cell::UnsafeCell,
    mem::MaybeUninit,
    sync::atomic::{AtomicBool, Ordering},
};

pub struct Once<T> {
    initialized: AtomicBool,
    value: UnsafeCell<MaybeUninit<T>>,
}

unsafe impl<T> Sync for Once<T> where T: Send + Sync {}

impl<T> Once<T> {
    pub const fn new() -> Self {
        Self {
            initialized: AtomicBool::new(false),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    /// Initialises the cell.
    ///
    /// # Panics
    ///
    /// Panics if the cell is already initialised.
    pub fn init(&self, value: T) {
        self.initialized
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .expect("Once::init called twice");

        unsafe {
            (*self.value.get()).write(value);
        }
    }

    /// Returns the contents.
    ///
    /// # Panics
    ///
    /// Panics if the cell is empty.
    pub fn get(&self) -> &T {
        assert!(
            self.initialized.load(Ordering::Acquire),
            "Once used before init"
        );
        unsafe { (*self.value.get()).assume_init_ref() }
    }
}
