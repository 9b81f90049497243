//! Software timers.
//!
//! Timers ride the timeout wheel. A periodic (`Cycle`) timer re-arms itself
//! with drift compensation: the next delta is computed from the actual time
//! elapsed since the recorded firing stamp, modulo the period, so phase is
//! preserved against accumulated tick jitter. `Temporary` timers release
//! their slot after firing once.
//!
//! User callbacks never run in the tick interrupt: they're queued on the
//! kernel thread's deferred-callback list.
use core::fmt;

use num_integer::Integer;

use crate::{
    cfg::{self, ObjectCs},
    error::impl_postcode,
    klock::{self, CpuLockCell, CpuLockTokenRefMut},
    kthread::{self, DeferredCall},
    timeout,
    utils::Init,
    Component, Id, KernelTraits, System,
};

/// Identifies a software timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerId(pub(crate) Id);

/// The public start modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerMode {
    /// Fire once.
    Once,
    /// Fire periodically.
    Cycle,
}

/// The control mode, including the self-destroying flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerCtl {
    Once,
    Cycle,
    /// Fires once, then releases its own slot.
    Temporary,
}

impl Init for TimerCtl {
    const INIT: Self = Self::Once;
}

/// *Timer control block* — the state data of a software timer.
#[doc(hidden)]
pub struct TimerCb<Traits: KernelTraits> {
    pub(crate) cs: CpuLockCell<Traits, ObjectCs>,
    pub(crate) name: CpuLockCell<Traits, &'static str>,

    pub(crate) ctl: CpuLockCell<Traits, TimerCtl>,

    /// The nominal timeout, in milliseconds.
    pub(crate) period_ms: CpuLockCell<Traits, u32>,

    /// The timer's expiration record on the timeout wheel.
    pub(crate) expire: timeout::Timeout<Traits>,

    /// The user callback and its argument.
    pub(crate) callback: CpuLockCell<Traits, Option<(fn(usize), usize)>>,
}

impl<Traits: KernelTraits> Init for TimerCb<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        cs: Init::INIT,
        name: Init::INIT,
        ctl: Init::INIT,
        period_ms: Init::INIT,
        expire: Init::INIT,
        callback: Init::INIT,
    };
}

impl<Traits: KernelTraits> fmt::Debug for TimerCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TimerCb")
            .field("self", &(self as *const _))
            .field("name", &self.name)
            .field("ctl", &self.ctl)
            .field("period_ms", &self.period_ms)
            .field("expire", &self.expire)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitError {
    /// Zero timeout.
    BadParam,
    NoSlot,
    BadContext,
}
impl_postcode!(InitError, Component::Timer, {
    BadParam => 3,
    NoSlot => 4,
    BadContext => 2,
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpError {
    /// Zero timeout.
    BadParam,
    BadId,
    BadContext,
}
impl_postcode!(OpError, Component::Timer, {
    BadParam => 3,
    BadId => 1,
    BadContext => 2,
});

impl<Traits: KernelTraits> System<Traits> {
    fn timer_cb(
        id: TimerId,
        lock: CpuLockTokenRefMut<'_, Traits>,
    ) -> Result<&'static TimerCb<Traits>, crate::error::BadIdError> {
        cfg::get_cb(Traits::timer_cb_pool(), id.0, lock, |cb| &cb.cs)
    }

    /// Create a stable timer with the given user callback.
    pub fn timer_init(
        callback: fn(usize),
        arg: usize,
        name: &'static str,
    ) -> Result<TimerId, InitError> {
        let mut lock = klock::CpuLockGuard::<Traits>::acquire().map_err(|_| InitError::BadContext)?;

        let (index, cb) =
            cfg::claim_slot(Traits::timer_cb_pool(), lock.borrow_mut(), |cb| &cb.cs)
                .ok_or(InitError::NoSlot)?;

        cb.name.replace(&mut *lock.borrow_mut(), name);
        cb.callback
            .replace(&mut *lock.borrow_mut(), Some((callback, arg)));
        cb.expire
            .setup(lock.borrow_mut(), timeout::TimeoutKind::Timer, index);

        Ok(TimerId(cfg::id_from_index(index)))
    }

    /// Create and immediately start a one-shot timer whose slot is released
    /// automatically after it fires.
    pub fn timer_automatic(
        callback: fn(usize),
        arg: usize,
        timeout_ms: u32,
        name: &'static str,
    ) -> Result<TimerId, InitError> {
        if timeout_ms == 0 {
            return Err(InitError::BadParam);
        }
        let id = Self::timer_init(callback, arg, name)?;

        let mut lock = klock::CpuLockGuard::<Traits>::acquire().map_err(|_| InitError::BadContext)?;
        let cb = Self::timer_cb(id, lock.borrow_mut()).map_err(|_| InitError::NoSlot)?;
        cb.ctl.replace(&mut *lock.borrow_mut(), TimerCtl::Temporary);
        cb.period_ms.replace(&mut *lock.borrow_mut(), timeout_ms);
        timeout::arm(lock.borrow_mut(), &cb.expire, timeout_ms as u64 * 1_000);

        Ok(id)
    }

    /// Start (or restart) the timer. A pending expiration is superseded.
    pub fn timer_start(id: TimerId, mode: TimerMode, timeout_ms: u32) -> Result<(), OpError> {
        if timeout_ms == 0 {
            return Err(OpError::BadParam);
        }
        let mut lock = klock::CpuLockGuard::<Traits>::acquire().map_err(|_| OpError::BadContext)?;
        let cb = Self::timer_cb(id, lock.borrow_mut()).map_err(|_| OpError::BadId)?;

        if cb.ctl.get(&*lock) != TimerCtl::Temporary {
            cb.ctl.replace(
                &mut *lock.borrow_mut(),
                match mode {
                    TimerMode::Once => TimerCtl::Once,
                    TimerMode::Cycle => TimerCtl::Cycle,
                },
            );
        }
        cb.period_ms.replace(&mut *lock.borrow_mut(), timeout_ms);
        timeout::arm(lock.borrow_mut(), &cb.expire, timeout_ms as u64 * 1_000);

        Ok(())
    }

    /// Stop the timer. A pending expiration is discarded.
    pub fn timer_stop(id: TimerId) -> Result<(), OpError> {
        let mut lock = klock::CpuLockGuard::<Traits>::acquire().map_err(|_| OpError::BadContext)?;
        let cb = Self::timer_cb(id, lock.borrow_mut()).map_err(|_| OpError::BadId)?;

        timeout::cancel(lock.borrow_mut(), &cb.expire);
        Ok(())
    }

    /// Is the timer currently counting down?
    pub fn timer_busy(id: TimerId) -> Result<bool, OpError> {
        let mut lock = klock::CpuLockGuard::<Traits>::acquire().map_err(|_| OpError::BadContext)?;
        let cb = Self::timer_cb(id, lock.borrow_mut()).map_err(|_| OpError::BadId)?;
        Ok(cb.expire.is_armed(lock.borrow_mut()))
    }

    /// Destroy a stable timer.
    pub fn timer_delete(id: TimerId) -> Result<(), OpError> {
        let mut lock = klock::CpuLockGuard::<Traits>::acquire().map_err(|_| OpError::BadContext)?;
        let cb = Self::timer_cb(id, lock.borrow_mut()).map_err(|_| OpError::BadId)?;

        release_slot(cb, lock.borrow_mut());
        Ok(())
    }

    /// Milliseconds elapsed since boot.
    pub fn timer_system_total_ms() -> Result<u64, OpError> {
        let mut lock = klock::CpuLockGuard::<Traits>::acquire().map_err(|_| OpError::BadContext)?;
        Ok(timeout::system_time_us::<Traits>(lock.borrow_mut()) / 1_000)
    }

    /// Busy-wait until at least `us` microseconds have passed. Does not
    /// yield the processor.
    pub fn timer_busy_wait(us: u64) {
        let start = {
            let mut lock = klock::CpuLockGuard::<Traits>::acquire().unwrap();
            timeout::system_time_us::<Traits>(lock.borrow_mut())
        };
        loop {
            let now = {
                let mut lock = klock::CpuLockGuard::<Traits>::acquire().unwrap();
                timeout::system_time_us::<Traits>(lock.borrow_mut())
            };
            if now.wrapping_sub(start) >= us {
                break;
            }
            core::hint::spin_loop();
        }
    }
}

/// Return a timer's slot to the pool.
fn release_slot<Traits: KernelTraits>(
    cb: &'static TimerCb<Traits>,
    mut lock: CpuLockTokenRefMut<'_, Traits>,
) {
    cb.expire.teardown(lock.borrow_mut());
    cb.name.replace(&mut *lock, "");
    cb.period_ms.replace(&mut *lock, 0);
    cb.callback.replace(&mut *lock, None);
    cb.ctl.replace(&mut *lock, TimerCtl::Once);
    cb.cs.replace(&mut *lock, ObjectCs::empty());
}

/// Dispatch one expired timer. Called by the timeout wheel while draining
/// its `pend` list; the expiration record has been stamped with the firing
/// time and moved off the wheel.
pub(crate) fn handle_expired<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    index: usize,
) {
    let cb = &Traits::timer_cb_pool()[index];

    // Queue the user callback for out-of-interrupt execution. The call is
    // queued by value, so releasing the slot below can't invalidate it.
    if let Some((func, arg)) = cb.callback.get(&*lock) {
        kthread::push_deferred::<Traits>(lock.borrow_mut(), DeferredCall { func, arg });
    }

    match cb.ctl.get(&*lock) {
        TimerCtl::Once => {}
        TimerCtl::Cycle => {
            // Re-arm, preserving phase: the time consumed past the nominal
            // expiration is deducted from the next period
            let stamp = cb.expire.stamp_us(lock.borrow_mut());
            let now = timeout::system_time_us::<Traits>(lock.borrow_mut());
            let period_us = cb.period_ms.get(&*lock) as u64 * 1_000;
            let (_, behind) = now.wrapping_sub(stamp).div_rem(&period_us);
            timeout::arm(lock.borrow_mut(), &cb.expire, period_us - behind);
        }
        TimerCtl::Temporary => {
            release_slot(cb, lock.borrow_mut());
        }
    }
}
