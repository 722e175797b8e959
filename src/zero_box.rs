//! Zeroed heap allocation for DMA structures.
//!
//! The port-local structures are multiple kilobytes and must start out
//! zeroed. Building them on the stack and moving them into a `Box` would
//! both risk a stack overflow and copy pages for nothing, so [`ZeroBox`]
//! allocates zeroed storage directly on the heap, honoring the alignment
//! the type demands.

use alloc::alloc::{alloc_zeroed, handle_alloc_error, Layout};
use alloc::boxed::Box;
use core::fmt::{self, Debug, Formatter};
use core::ops::{Deref, DerefMut};

/// Marker for types for which the all-zero bit pattern is a valid value.
pub unsafe trait ZeroInitialized {}

/// A boxed `T` whose storage was allocated zeroed, in place.
pub struct ZeroBox<T> {
    /// The owning allocation.
    owned: Box<T>,
}

impl<T: ZeroInitialized> ZeroBox<T> {
    /// Allocates a zeroed `T` directly on the heap.
    pub fn new_zeroed() -> ZeroBox<T> {
        let layout = Layout::new::<T>();
        let raw = unsafe { alloc_zeroed(layout) };
        if raw.is_null() {
            handle_alloc_error(layout);
        }
        // safe: the allocation succeeded with T's layout, and all-zero is a
        // valid T per the ZeroInitialized contract.
        ZeroBox { owned: unsafe { Box::from_raw(raw as *mut T) } }
    }
}

impl<T> Deref for ZeroBox<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.owned
    }
}

impl<T> DerefMut for ZeroBox<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.owned
    }
}

impl<T: Debug> Debug for ZeroBox<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.owned.fmt(f)
    }
}
