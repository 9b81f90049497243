//! Memory pools: fixed-size block allocators with a 32-bit occupancy bitmap.
//!
//! The bitmap caps a pool at 32 elements. A blocking `take` on an exhausted
//! pool parks the caller; a `release` hands the freed slot directly to the
//! head waiter.
use core::{cell::Cell, fmt, ptr::NonNull};

use crate::{
    cfg::{self, ObjectCs},
    error::{impl_postcode, WaitEndError},
    klock::{self, CpuLockCell, CpuLockTokenRefMut},
    task,
    time::WaitTime,
    utils::Init,
    wait::{WaitPayload, WaitQueue},
    Component, Id, KernelTraits, System, TimeoutMs,
};

/// The occupancy bitmap is a `u32`, limiting a pool to this many elements.
pub const POOL_MAX_ELEMENTS: usize = 32;

/// Identifies a memory pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolId(pub(crate) Id);

/// *Pool control block* — the state data of a memory pool.
#[doc(hidden)]
pub struct PoolCb<Traits: KernelTraits> {
    pub(crate) cs: CpuLockCell<Traits, ObjectCs>,
    pub(crate) name: CpuLockCell<Traits, &'static str>,

    pub(crate) buf: CpuLockCell<Traits, Option<NonNull<u8>>>,
    pub(crate) elem_len: CpuLockCell<Traits, usize>,
    pub(crate) elem_num: CpuLockCell<Traits, usize>,

    /// One bit per element; set = in use.
    pub(crate) used_bits: CpuLockCell<Traits, u32>,

    pub(crate) wait_queue: WaitQueue<Traits>,
}

// Safety: The buffer pointer is only dereferenced with CPU Lock active
unsafe impl<Traits: KernelTraits> Send for PoolCb<Traits> {}
unsafe impl<Traits: KernelTraits> Sync for PoolCb<Traits> {}

impl<Traits: KernelTraits> Init for PoolCb<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        cs: Init::INIT,
        name: Init::INIT,
        buf: Init::INIT,
        elem_len: Init::INIT,
        elem_num: Init::INIT,
        used_bits: Init::INIT,
        wait_queue: Init::INIT,
    };
}

impl<Traits: KernelTraits> fmt::Debug for PoolCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PoolCb")
            .field("self", &(self as *const _))
            .field("name", &self.name)
            .field("elem_len", &self.elem_len)
            .field("elem_num", &self.elem_num)
            .field("used_bits", &self.used_bits)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitError {
    /// Zero element length/count, more than [`POOL_MAX_ELEMENTS`] elements,
    /// or the buffer is too small.
    BadParam,
    NoSlot,
    BadContext,
}
impl_postcode!(InitError, Component::Pool, {
    BadParam => 3,
    NoSlot => 4,
    BadContext => 2,
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TakeError {
    /// `timeout == POLL` and every element is in use.
    Unavailable,
    Timeout,
    /// The pool was deleted while waiting.
    NoData,
    /// The requested size exceeds the element length.
    BadParam,
    BadId,
    BadContext,
}
impl_postcode!(TakeError, Component::Pool, {
    Unavailable => unavailable,
    Timeout => timeout,
    NoData => nodata,
    BadParam => 3,
    BadId => 1,
    BadContext => 2,
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseError {
    /// The pointer is not an element of this pool.
    BadParam,
    /// The element was not taken.
    NotTaken,
    BadId,
    BadContext,
}
impl_postcode!(ReleaseError, Component::Pool, {
    BadParam => 3,
    NotTaken => 5,
    BadId => 1,
    BadContext => 2,
});

impl<Traits: KernelTraits> System<Traits> {
    fn pool_cb(
        id: PoolId,
        lock: CpuLockTokenRefMut<'_, Traits>,
    ) -> Result<&'static PoolCb<Traits>, crate::error::BadIdError> {
        cfg::get_cb(Traits::pool_cb_pool(), id.0, lock, |cb| &cb.cs)
    }

    /// Create a memory pool of `elem_num ≤ 32` elements of `elem_len` bytes
    /// over the caller-supplied `buffer`.
    pub fn pool_init(
        buffer: &'static mut [u8],
        elem_len: usize,
        elem_num: usize,
        name: &'static str,
    ) -> Result<PoolId, InitError> {
        if elem_len == 0
            || elem_num == 0
            || elem_num > POOL_MAX_ELEMENTS
            || buffer.len() < elem_len * elem_num
        {
            return Err(InitError::BadParam);
        }
        let mut lock = klock::CpuLockGuard::<Traits>::acquire().map_err(|_| InitError::BadContext)?;

        let (index, cb) =
            cfg::claim_slot(Traits::pool_cb_pool(), lock.borrow_mut(), |cb| &cb.cs)
                .ok_or(InitError::NoSlot)?;

        cb.name.replace(&mut *lock.borrow_mut(), name);
        cb.buf
            .replace(&mut *lock.borrow_mut(), NonNull::new(buffer.as_mut_ptr()));
        cb.elem_len.replace(&mut *lock.borrow_mut(), elem_len);
        cb.elem_num.replace(&mut *lock.borrow_mut(), elem_num);
        cb.used_bits.replace(&mut *lock.borrow_mut(), 0);

        Ok(PoolId(cfg::id_from_index(index)))
    }

    /// Take one element of at least `size` bytes, blocking up to `timeout`
    /// when the pool is exhausted.
    pub fn pool_take(
        id: PoolId,
        size: usize,
        timeout: TimeoutMs,
    ) -> Result<NonNull<u8>, TakeError> {
        let mut lock = klock::CpuLockGuard::<Traits>::acquire().map_err(|_| TakeError::BadContext)?;
        let cb = Self::pool_cb(id, lock.borrow_mut()).map_err(|_| TakeError::BadId)?;

        if size > cb.elem_len.get(&*lock) {
            return Err(TakeError::BadParam);
        }

        if let Some(ptr) = take_free_element(cb, lock.borrow_mut()) {
            return Ok(ptr);
        }

        let delta_us = match timeout.policy() {
            WaitTime::Poll => return Err(TakeError::Unavailable),
            WaitTime::Finite(us) => Some(us),
            WaitTime::Forever => None,
        };

        task::expect_waitable_context::<Traits>().map_err(|_| TakeError::BadContext)?;

        let payload = WaitPayload::PoolTake {
            out: CpuLockCell::new(Cell::new(None)),
        };
        let result = match delta_us {
            Some(us) => cb.wait_queue.wait_timeout(lock.borrow_mut(), payload, us),
            None => cb.wait_queue.wait(lock.borrow_mut(), payload),
        };

        match result {
            Ok(WaitPayload::PoolTake { out }) => {
                // The releasing task handed us its freed slot
                Ok(out.read(&*lock).get().unwrap())
            }
            Ok(_) => unreachable!(),
            Err(WaitEndError::Timeout) => Err(TakeError::Timeout),
            Err(WaitEndError::Deleted) => Err(TakeError::NoData),
        }
    }

    /// Return an element to the pool. If a task is waiting, the slot is
    /// handed directly to the highest-priority waiter.
    pub fn pool_release(id: PoolId, ptr: NonNull<u8>) -> Result<(), ReleaseError> {
        let mut lock = klock::CpuLockGuard::<Traits>::acquire().map_err(|_| ReleaseError::BadContext)?;
        let cb = Self::pool_cb(id, lock.borrow_mut()).map_err(|_| ReleaseError::BadId)?;

        let base = cb.buf.get(&*lock).unwrap().as_ptr() as usize;
        let elem_len = cb.elem_len.get(&*lock);
        let elem_num = cb.elem_num.get(&*lock);
        let addr = ptr.as_ptr() as usize;

        // The pointer must be element-aligned and within the pool range
        if addr < base
            || addr >= base + elem_len * elem_num
            || (addr - base) % elem_len != 0
        {
            return Err(ReleaseError::BadParam);
        }
        let element = (addr - base) / elem_len;

        if cb.used_bits.get(&*lock) & (1 << element) == 0 {
            return Err(ReleaseError::NotTaken);
        }

        // Hand the slot over to a waiter, keeping the bit set; only clear it
        // when no one wants the slot
        let handed_over = cb
            .wait_queue
            .wake_up_one_by(lock.borrow_mut(), |payload, l| match payload {
                WaitPayload::PoolTake { out } => {
                    out.read(&*l).set(Some(ptr));
                }
                _ => unreachable!(),
            })
            .is_some();

        if handed_over {
            task::unlock_cpu_and_check_preemption(lock);
        } else {
            let bits = cb.used_bits.get(&*lock);
            cb.used_bits
                .replace(&mut *lock.borrow_mut(), bits & !(1 << element));
        }
        Ok(())
    }

    /// The number of elements currently free.
    pub fn pool_free_count(id: PoolId) -> Result<usize, TakeError> {
        let mut lock = klock::CpuLockGuard::<Traits>::acquire().map_err(|_| TakeError::BadContext)?;
        let cb = Self::pool_cb(id, lock.borrow_mut()).map_err(|_| TakeError::BadId)?;
        let num = cb.elem_num.get(&*lock);
        let used = cb.used_bits.get(&*lock).count_ones() as usize;
        Ok(num - used)
    }

    /// Destroy the pool. Blocked takers are released with a "no data"
    /// result.
    pub fn pool_delete(id: PoolId) -> Result<(), ReleaseError> {
        let mut lock = klock::CpuLockGuard::<Traits>::acquire().map_err(|_| ReleaseError::BadContext)?;
        let cb = Self::pool_cb(id, lock.borrow_mut()).map_err(|_| ReleaseError::BadId)?;

        cb.wait_queue
            .wake_up_all(lock.borrow_mut(), Err(WaitEndError::Deleted));

        cb.name.replace(&mut *lock.borrow_mut(), "");
        cb.buf.replace(&mut *lock.borrow_mut(), None);
        cb.elem_len.replace(&mut *lock.borrow_mut(), 0);
        cb.elem_num.replace(&mut *lock.borrow_mut(), 0);
        cb.used_bits.replace(&mut *lock.borrow_mut(), 0);
        cb.cs.replace(&mut *lock.borrow_mut(), ObjectCs::empty());

        task::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }
}

/// Claim the lowest-numbered free element, if any.
fn take_free_element<Traits: KernelTraits>(
    cb: &PoolCb<Traits>,
    mut lock: CpuLockTokenRefMut<'_, Traits>,
) -> Option<NonNull<u8>> {
    let num = cb.elem_num.get(&*lock);
    let used = cb.used_bits.get(&*lock);

    // The lowest clear bit
    let element = (!used).trailing_zeros() as usize;
    if element >= num {
        return None;
    }

    cb.used_bits.replace(&mut *lock, used | (1 << element));

    let base = cb.buf.get(&*lock)?.as_ptr();
    let elem_len = cb.elem_len.get(&*lock);
    // Safety: `element < num`, so the offset is in bounds
    NonNull::new(unsafe { base.add(element * elem_len) })
}
