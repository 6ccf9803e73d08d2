//! Small global, lock-free primitives shared across the library.

use std::sync::atomic::{AtomicBool, Ordering};

/// A one-shot latch, used to guard global initialization.
pub struct Flag(AtomicBool);

impl Flag {
    /// Creates a new, unset `Flag`.
    pub const fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    /// Checks if the flag is set.
    pub fn test(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    /// Sets the flag.
    pub fn set(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// Unsets the flag.
    pub fn unset(&self) {
        self.0.store(false, Ordering::Relaxed);
    }
}
