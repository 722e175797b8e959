//! Volatile memory-mapped IO cells.
//!
//! Hardware registers must be accessed with single, non-elided, non-reordered
//! loads and stores. [`Mmio`] wraps a value so it can only be touched through
//! `read_volatile`/`write_volatile`, and only through a *shared* reference:
//! the device mutates register cells behind our back, so handing out `&mut`
//! to a register block would be a lie. See [vcell] for the idea.
//!
//! [vcell]: https://docs.rs/vcell

use core::cell::UnsafeCell;
use core::fmt::{self, Debug, Formatter};
use core::ptr;

/// A value that can only be accessed volatilely.
///
/// Never constructed by value: references to `Mmio` cells are obtained by
/// casting a pointer into a mapped register window, or by zero-allocating a
/// DMA structure that contains them.
#[repr(transparent)]
pub struct Mmio<T> {
    /// The cell. Only reachable through [`Mmio::read`] and [`Mmio::write`].
    value: UnsafeCell<T>,
}

impl<T: Copy> Mmio<T> {
    /// Performs a single volatile read of the cell.
    pub fn read(&self) -> T {
        unsafe { ptr::read_volatile(self.value.get()) }
    }

    /// Performs a single volatile write of the cell.
    pub fn write(&self, value: T) {
        unsafe { ptr::write_volatile(self.value.get(), value) }
    }
}

impl<T: Copy + Debug> Debug for Mmio<T> {
    /// Debug reads the cell, volatilely like everybody else.
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.read().fmt(f)
    }
}
