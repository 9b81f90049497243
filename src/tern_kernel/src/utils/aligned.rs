use core::cell::UnsafeCell;
use elain::{Align, Alignment};

use super::Init;

/// Untyped storage of the specified size and alignment, used to carve out
/// statically-allocated stack regions.
#[repr(C)]
pub struct AlignedStorage<const LEN: usize, const ALIGN: usize>
where
    Align<ALIGN>: Alignment,
{
    _align: Align<ALIGN>,
    storage: UnsafeCell<[u8; LEN]>,
}

// Safety: The contents are only accessed through raw pointers handed to the
// port layer, which synchronizes the accesses.
unsafe impl<const LEN: usize, const ALIGN: usize> Sync for AlignedStorage<LEN, ALIGN> where
    Align<ALIGN>: Alignment
{
}

impl<const LEN: usize, const ALIGN: usize> Init for AlignedStorage<LEN, ALIGN>
where
    Align<ALIGN>: Alignment,
{
    const INIT: Self = Self {
        _align: Align::NEW,
        storage: UnsafeCell::new([0; LEN]),
    };
}

impl<const LEN: usize, const ALIGN: usize> AlignedStorage<LEN, ALIGN>
where
    Align<ALIGN>: Alignment,
{
    /// Get a raw pointer to the storage.
    #[inline]
    pub fn as_ptr(&self) -> *mut [u8] {
        core::ptr::slice_from_raw_parts_mut(self.storage.get().cast::<u8>(), LEN)
    }
}

/// Storage for a task stack. The alignment is the strictest the Arm-M
/// exception frame requires.
pub type StackStorage<const LEN: usize> = AlignedStorage<LEN, 8>;
