//! A cell with atomic load/store built on `critical_section::Mutex`.
//!
//! The stack targets cores without CAS (e.g. thumbv6m), so instead of
//! `core::sync::atomic` everything shared with interrupt context goes
//! through a short critical section.

use core::{cell::Cell, ops::Add};

use critical_section::Mutex;

/// Interior-mutable cell providing atomic access to a `Copy` value.
#[derive(Debug)]
pub struct AtomicCell<T: Copy> {
    inner: Mutex<Cell<T>>,
}

impl<T: Send + Copy> AtomicCell<T> {
    /// Create a new cell holding `value`.
    pub const fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(Cell::new(value)),
        }
    }

    /// Read the current value.
    pub fn load(&self) -> T {
        critical_section::with(|cs| self.inner.borrow(cs).get())
    }

    /// Replace the current value.
    pub fn store(&self, value: T) {
        critical_section::with(|cs| self.inner.borrow(cs).set(value));
    }

    /// Replace the current value, returning the previous one.
    pub fn swap(&self, value: T) -> T {
        critical_section::with(|cs| self.inner.borrow(cs).replace(value))
    }

    /// Apply `f` to the current value, storing the result if `Some`.
    ///
    /// Returns `Ok(previous)` when the update was applied, `Err(current)`
    /// when `f` returned `None`.
    pub fn fetch_update(&self, mut f: impl FnMut(T) -> Option<T>) -> Result<T, T> {
        critical_section::with(|cs| {
            let old = self.inner.borrow(cs).get();
            match f(old) {
                Some(new) => {
                    self.inner.borrow(cs).set(new);
                    Ok(old)
                }
                None => Err(old),
            }
        })
    }
}

impl<T: Send + Copy + Default> AtomicCell<T> {
    /// Take the current value, leaving `T::default()` behind.
    pub fn take(&self) -> T {
        critical_section::with(|cs| self.inner.borrow(cs).take())
    }
}

impl<T: Send + Copy + Add<Output = T>> AtomicCell<T> {
    /// Add `value` to the cell, returning the previous value.
    pub fn fetch_add(&self, value: T) -> T {
        critical_section::with(|cs| {
            let old = self.inner.borrow(cs).get();
            self.inner.borrow(cs).set(old + value);
            old
        })
    }
}

impl<T: Send + Copy + Default> Default for AtomicCell<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}
