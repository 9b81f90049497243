//! Counting semaphores.
use core::fmt;

use crate::{
    cfg::{self, ObjectCs},
    error::{impl_postcode, WaitEndError},
    klock::{self, CpuLockCell},
    task,
    time::WaitTime,
    utils::Init,
    wait::{WaitPayload, WaitQueue},
    Component, Id, KernelTraits, System, TimeoutMs,
};

/// Identifies a semaphore.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SemaphoreId(pub(crate) Id);

/// *Semaphore control block* — the state data of a semaphore.
#[doc(hidden)]
pub struct SemaphoreCb<Traits: KernelTraits> {
    pub(crate) cs: CpuLockCell<Traits, ObjectCs>,
    pub(crate) name: CpuLockCell<Traits, &'static str>,

    /// Invariants: `remain <= limit`; while `remain > 0` the wait queue is
    /// empty.
    pub(crate) remain: CpuLockCell<Traits, u8>,
    pub(crate) limit: CpuLockCell<Traits, u8>,

    pub(crate) wait_queue: WaitQueue<Traits>,
}

impl<Traits: KernelTraits> Init for SemaphoreCb<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        cs: Init::INIT,
        name: Init::INIT,
        remain: Init::INIT,
        limit: Init::INIT,
        wait_queue: Init::INIT,
    };
}

impl<Traits: KernelTraits> fmt::Debug for SemaphoreCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SemaphoreCb")
            .field("self", &(self as *const _))
            .field("name", &self.name)
            .field("remain", &self.remain)
            .field("limit", &self.limit)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitError {
    /// `limit` is zero or `remain` exceeds it.
    BadParam,
    /// The semaphore pool is exhausted.
    NoSlot,
    BadContext,
}
impl_postcode!(InitError, Component::Semaphore, {
    BadParam => 3,
    NoSlot => 4,
    BadContext => 2,
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TakeError {
    /// `timeout == POLL` and no token was available.
    Unavailable,
    Timeout,
    /// The semaphore was deleted while waiting.
    NoData,
    BadId,
    BadContext,
}
impl_postcode!(TakeError, Component::Semaphore, {
    Unavailable => unavailable,
    Timeout => timeout,
    NoData => nodata,
    BadId => 1,
    BadContext => 2,
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GiveError {
    /// The count already reached the limit.
    Saturated,
    BadId,
    BadContext,
}
impl_postcode!(GiveError, Component::Semaphore, {
    Saturated => 5,
    BadId => 1,
    BadContext => 2,
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpError {
    BadId,
    BadContext,
}
impl_postcode!(OpError, Component::Semaphore, {
    BadId => 1,
    BadContext => 2,
});

impl<Traits: KernelTraits> System<Traits> {
    fn semaphore_cb(
        id: SemaphoreId,
        lock: klock::CpuLockTokenRefMut<'_, Traits>,
    ) -> Result<&'static SemaphoreCb<Traits>, crate::error::BadIdError> {
        cfg::get_cb(Traits::semaphore_cb_pool(), id.0, lock, |cb| &cb.cs)
    }

    /// Create a semaphore with `remain` initial tokens and a saturation
    /// limit of `limit`.
    pub fn semaphore_init(
        remain: u8,
        limit: u8,
        name: &'static str,
    ) -> Result<SemaphoreId, InitError> {
        if limit == 0 || remain > limit {
            return Err(InitError::BadParam);
        }
        let mut lock = klock::CpuLockGuard::<Traits>::acquire().map_err(|_| InitError::BadContext)?;

        let (index, cb) = cfg::claim_slot(Traits::semaphore_cb_pool(), lock.borrow_mut(), |cb| {
            &cb.cs
        })
        .ok_or(InitError::NoSlot)?;

        cb.name.replace(&mut *lock.borrow_mut(), name);
        cb.remain.replace(&mut *lock.borrow_mut(), remain);
        cb.limit.replace(&mut *lock.borrow_mut(), limit);

        Ok(SemaphoreId(cfg::id_from_index(index)))
    }

    /// Take one token, blocking up to `timeout` when none is available.
    pub fn semaphore_take(id: SemaphoreId, timeout: TimeoutMs) -> Result<(), TakeError> {
        let mut lock = klock::CpuLockGuard::<Traits>::acquire().map_err(|_| TakeError::BadContext)?;
        let cb = Self::semaphore_cb(id, lock.borrow_mut()).map_err(|_| TakeError::BadId)?;

        let remain = cb.remain.get(&*lock);
        if remain > 0 {
            cb.remain.replace(&mut *lock.borrow_mut(), remain - 1);
            return Ok(());
        }

        let delta_us = match timeout.policy() {
            WaitTime::Poll => return Err(TakeError::Unavailable),
            WaitTime::Finite(us) => Some(us),
            WaitTime::Forever => None,
        };

        task::expect_waitable_context::<Traits>().map_err(|_| TakeError::BadContext)?;

        // Start waiting. The wake-upper decides whether the token transfer
        // happens (`give`) or the wait ends empty-handed (`delete`).
        let result = match delta_us {
            Some(us) => cb
                .wait_queue
                .wait_timeout(lock.borrow_mut(), WaitPayload::Semaphore, us),
            None => cb.wait_queue.wait(lock.borrow_mut(), WaitPayload::Semaphore),
        };

        match result {
            Ok(_) => Ok(()),
            Err(WaitEndError::Timeout) => Err(TakeError::Timeout),
            Err(WaitEndError::Deleted) => Err(TakeError::NoData),
        }
    }

    /// Return one token. If a task is waiting, the token is handed directly
    /// to the highest-priority waiter.
    pub fn semaphore_give(id: SemaphoreId) -> Result<(), GiveError> {
        let mut lock = klock::CpuLockGuard::<Traits>::acquire().map_err(|_| GiveError::BadContext)?;
        let cb = Self::semaphore_cb(id, lock.borrow_mut()).map_err(|_| GiveError::BadId)?;

        if cb.wait_queue.wake_up_one(lock.borrow_mut()) {
            // The woken waiter consumed the token; the count is unchanged
            task::unlock_cpu_and_check_preemption(lock);
            return Ok(());
        }

        let remain = cb.remain.get(&*lock);
        if remain < cb.limit.get(&*lock) {
            cb.remain.replace(&mut *lock.borrow_mut(), remain + 1);
            Ok(())
        } else {
            Err(GiveError::Saturated)
        }
    }

    /// Release every waiter at once. Each released `take` returns success.
    pub fn semaphore_flush(id: SemaphoreId) -> Result<(), OpError> {
        let mut lock = klock::CpuLockGuard::<Traits>::acquire().map_err(|_| OpError::BadContext)?;
        let cb = Self::semaphore_cb(id, lock.borrow_mut()).map_err(|_| OpError::BadId)?;

        cb.wait_queue.wake_up_all(lock.borrow_mut(), Ok(()));
        task::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// Destroy the semaphore. Blocked takers are released with a "no data"
    /// result.
    pub fn semaphore_delete(id: SemaphoreId) -> Result<(), OpError> {
        let mut lock = klock::CpuLockGuard::<Traits>::acquire().map_err(|_| OpError::BadContext)?;
        let cb = Self::semaphore_cb(id, lock.borrow_mut()).map_err(|_| OpError::BadId)?;

        cb.wait_queue
            .wake_up_all(lock.borrow_mut(), Err(WaitEndError::Deleted));

        cb.name.replace(&mut *lock.borrow_mut(), "");
        cb.remain.replace(&mut *lock.borrow_mut(), 0);
        cb.limit.replace(&mut *lock.borrow_mut(), 0);
        cb.cs.replace(&mut *lock.borrow_mut(), ObjectCs::empty());

        task::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// The number of tokens currently available.
    pub fn semaphore_remaining(id: SemaphoreId) -> Result<u8, OpError> {
        let mut lock = klock::CpuLockGuard::<Traits>::acquire().map_err(|_| OpError::BadContext)?;
        let cb = Self::semaphore_cb(id, lock.borrow_mut()).map_err(|_| OpError::BadId)?;
        Ok(cb.remain.get(&*lock))
    }
}
