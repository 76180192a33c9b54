//! Init-once primitives used by the boot path.

use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicU8, Ordering};

const STATE_EMPTY: u8 = 0;
const STATE_BUSY: u8 = 1;
const STATE_SET: u8 = 2;

/// A write-once cell. `set` succeeds exactly once; `get` returns the stored
/// value after that. Used for service hook tables registered during boot.
pub struct OnceLock<T> {
    state: AtomicU8,
    value: UnsafeCell<MaybeUninit<T>>,
}

unsafe impl<T: Send> Send for OnceLock<T> {}
unsafe impl<T: Send + Sync> Sync for OnceLock<T> {}

impl<T> OnceLock<T> {
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(STATE_EMPTY),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    /// Store `value` if the cell is empty. Returns `Err(value)` if another
    /// writer got there first.
    pub fn set(&self, value: T) -> Result<(), T> {
        match self.state.compare_exchange(
            STATE_EMPTY,
            STATE_BUSY,
            Ordering::Acquire,
            Ordering::Relaxed,
        ) {
            Ok(_) => {
                unsafe { (*self.value.get()).write(value) };
                self.state.store(STATE_SET, Ordering::Release);
                Ok(())
            }
            Err(_) => Err(value),
        }
    }

    pub fn get(&self) -> Option<&T> {
        if self.state.load(Ordering::Acquire) == STATE_SET {
            Some(unsafe { (*self.value.get()).assume_init_ref() })
        } else {
            None
        }
    }

    pub fn is_set(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_SET
    }
}

impl<T> Default for OnceLock<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// A flag that can be raised exactly once. `init_once` returns true only for
/// the caller that performed the transition.
pub struct InitFlag {
    state: AtomicU8,
}

impl InitFlag {
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(0),
        }
    }

    /// Returns true exactly once, for the first caller.
    pub fn init_once(&self) -> bool {
        self.state
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn mark_set(&self) {
        self.state.store(1, Ordering::Release);
    }

    pub fn is_set(&self) -> bool {
        self.state.load(Ordering::Acquire) != 0
    }
}

impl Default for InitFlag {
    fn default() -> Self {
        Self::new()
    }
}
