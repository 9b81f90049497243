//! Timeouts (timed events) and the system clock.
//!
//! # The delta list
//!
//! Outstanding timeouts are kept on the `wait` list as a *delta list*: each
//! record stores the microseconds between its own expiration and its
//! predecessor's, so only the head's delta ever has to be compared against
//! elapsed time.
//!
//! ```text
//!  head                                            tail
//! ┌──────┐      ┌──────┐      ┌──────┐      ┌──────┐
//! │ Δ=10 │─────→│ Δ=15 │─────→│ Δ=5  │─────→│ Δ=10 │
//! └──────┘      └──────┘      └──────┘      └──────┘
//! absolute:10          25            30            40
//! ```
//!
//! Invariant: summing `duration_us` from the head to any record equals that
//! record's remaining time relative to the current measurement edge. The
//! ordered-insert transaction preserves this by letting its predicate
//! subtract each traversed delta from the candidate (see
//! [`crate::utils::list::insert_ordered`]).
//!
//! # Measurement edges
//!
//! The port's tick source reports microseconds elapsed since the last call
//! to [`PortTimer::time_interval_set`] (the *edge*). Any wheel mutation first
//! *folds* the un-consumed portion of that reading into the list (reducing
//! head deltas and advancing the system-µs counter), then re-programs the
//! tick source, starting a new edge. `edge_consumed_us` makes the fold
//! idempotent between edges.
//!
//! # Expiration
//!
//! On a tick, expired records are consumed from the head. A record wired to
//! the scheduler's wake-on-timeout fires inline. A record belonging to a
//! software timer is stamped with the current system-µs and parked on the
//! `pend` list; after the walk, `pend` is drained through
//! [`crate::timer::handle_expired`], which re-arms periodic timers with a
//! drift-corrected delta and queues the user callback on the kernel thread's
//! deferred list.
//!
//! [`PortTimer::time_interval_set`]: crate::PortTimer::time_interval_set
use core::{fmt, ptr::NonNull};

use crate::{
    klock::{self, CpuLockCell, CpuLockTokenRefMut},
    kthread, task, timer,
    utils::{
        list::{self, Link, ListItem},
        Init,
    },
    wait, KernelTraits, PortTimer, TIME_FOREVER_US,
};

/// A kernel-global state for timed event management.
pub(crate) struct TimeoutGlobals<Traits: KernelTraits> {
    /// Active timeouts, a delta list ordered by expiration.
    wait: CpuLockCell<Traits, list::ListHead<TimeoutRef<Traits>>>,

    /// Timer records that expired during the current tick, awaiting
    /// dispatch.
    pend: CpuLockCell<Traits, list::ListHead<TimeoutRef<Traits>>>,

    /// Microseconds since boot, advanced whenever elapsed time is folded
    /// into the wheel.
    system_us: CpuLockCell<Traits, u64>,

    /// The part of the current edge's elapsed reading already folded into
    /// the wheel.
    edge_consumed_us: CpuLockCell<Traits, u64>,

    /// Flag indicating whether `handle_tick` is in progress; suppresses
    /// redundant tick-source re-programming by the timeout handlers it
    /// calls.
    handling_tick: CpuLockCell<Traits, bool>,
}

impl<Traits: KernelTraits> Init for TimeoutGlobals<Traits> {
    const INIT: Self = Self {
        wait: Init::INIT,
        pend: Init::INIT,
        system_us: Init::INIT,
        edge_consumed_us: Init::INIT,
        handling_tick: Init::INIT,
    };
}

impl<Traits: KernelTraits> fmt::Debug for TimeoutGlobals<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TimeoutGlobals")
            .field("system_us", &self.system_us)
            .field("handling_tick", &self.handling_tick)
            .finish_non_exhaustive()
    }
}

/// An internal utility to access `TimeoutGlobals`.
trait KernelTimeoutGlobalsExt: KernelTraits {
    fn g_timeout() -> &'static TimeoutGlobals<Self>;
}

impl<T: KernelTraits> KernelTimeoutGlobalsExt for T {
    /// Shortcut for `&Self::state().timeout`.
    #[inline(always)]
    fn g_timeout() -> &'static TimeoutGlobals<Self> {
        &Self::state().timeout
    }
}

/// Which of the wheel's lists (if any) a record is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimeoutSt {
    /// Uninitialized (the owning slot is unclaimed).
    None,
    /// Armed-but-inactive.
    Idle,
    /// On the active delta list.
    Wait,
    /// Expired this tick, awaiting dispatch.
    Pend,
}

impl Init for TimeoutSt {
    const INIT: Self = Self::None;
}

/// What an expiration means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimeoutKind {
    /// Wake the task identified by `param` with a timeout result.
    TaskWake,
    /// Drive the software timer identified by `param`.
    Timer,
}

impl Init for TimeoutKind {
    const INIT: Self = Self::TaskWake;
}

/// An expiration record. Embedded in every task control block (the one
/// timeout slot reused across all blocking operations) and in every software
/// timer.
pub(crate) struct Timeout<Traits: KernelTraits> {
    link: CpuLockCell<Traits, Link<TimeoutRef<Traits>>>,

    st: CpuLockCell<Traits, TimeoutSt>,

    kind: CpuLockCell<Traits, TimeoutKind>,

    /// While on `wait`: the delta to the predecessor. While on `pend`: the
    /// system-µs stamp of the expiration. Otherwise scratch.
    duration_us: CpuLockCell<Traits, u64>,

    /// The pool index of the owning task or timer.
    param: CpuLockCell<Traits, usize>,
}

impl<Traits: KernelTraits> Init for Timeout<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        link: Init::INIT,
        st: Init::INIT,
        kind: Init::INIT,
        duration_us: Init::INIT,
        param: Init::INIT,
    };
}

impl<Traits: KernelTraits> fmt::Debug for Timeout<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Timeout")
            .field("st", &self.st)
            .field("kind", &self.kind)
            .field("duration_us", &self.duration_us)
            .field("param", &self.param)
            .finish_non_exhaustive()
    }
}

impl<Traits: KernelTraits> Timeout<Traits> {
    /// Wire the record to its owner. Called when the owning pool slot is
    /// claimed.
    pub(crate) fn setup(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        kind: TimeoutKind,
        param: usize,
    ) {
        debug_assert_ne!(self.st.get(&*lock), TimeoutSt::Wait);
        debug_assert_ne!(self.st.get(&*lock), TimeoutSt::Pend);
        self.kind.replace(&mut *lock, kind);
        self.param.replace(&mut *lock, param);
        self.st.replace(&mut *lock, TimeoutSt::Idle);
    }

    /// Unwire the record. Called when the owning pool slot is released.
    pub(crate) fn teardown(&self, mut lock: CpuLockTokenRefMut<'_, Traits>) {
        cancel::<Traits>(lock.borrow_mut(), self);
        self.st.replace(&mut *lock, TimeoutSt::None);
    }

    /// Is the record on the active delta list?
    pub(crate) fn is_armed(&self, lock: CpuLockTokenRefMut<'_, Traits>) -> bool {
        self.st.get(&*lock) == TimeoutSt::Wait
    }

    /// Read the stamp stored by the expiration walk.
    pub(crate) fn stamp_us(&self, lock: CpuLockTokenRefMut<'_, Traits>) -> u64 {
        self.duration_us.get(&*lock)
    }
}

/// A reference to a [`Timeout`].
pub(crate) struct TimeoutRef<Traits: KernelTraits>(NonNull<Timeout<Traits>>);

// Safety: `Timeout` is only accessed with CPU Lock active
unsafe impl<Traits: KernelTraits> Send for TimeoutRef<Traits> {}
unsafe impl<Traits: KernelTraits> Sync for TimeoutRef<Traits> {}

impl<Traits: KernelTraits> Clone for TimeoutRef<Traits> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<Traits: KernelTraits> Copy for TimeoutRef<Traits> {}

impl<Traits: KernelTraits> PartialEq for TimeoutRef<Traits> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}
impl<Traits: KernelTraits> Eq for TimeoutRef<Traits> {}

impl<Traits: KernelTraits> TimeoutRef<Traits> {
    #[inline]
    fn get(self) -> &'static Timeout<Traits> {
        // Safety: Expiration records are embedded in pool slots, which are
        // never deallocated
        unsafe { &*self.0.as_ptr() }
    }
}

impl<Traits: KernelTraits> ListItem<Traits> for TimeoutRef<Traits> {
    unsafe fn link<'a>(self) -> &'a CpuLockCell<Traits, Link<Self>> {
        // Safety: See `TimeoutRef::get`
        unsafe { &(*self.0.as_ptr()).link }
    }
}

/// Initialize the timekeeping system and start the tick source.
pub(crate) fn init<Traits: KernelTraits>(mut lock: CpuLockTokenRefMut<'_, Traits>) {
    let _ = &mut lock;
    // Safety: CPU Lock active
    unsafe {
        Traits::time_enable();
        Traits::time_interval_set(TIME_FOREVER_US);
    }
}

/// Fold the un-consumed part of the current edge's elapsed reading into the
/// wheel: advance the system-µs counter and reduce head deltas. Records
/// reaching a zero delta stay on the list; they are consumed by the next
/// expiration walk.
fn fold_elapsed<Traits: KernelTraits>(mut lock: CpuLockTokenRefMut<'_, Traits>) {
    let g = Traits::g_timeout();

    // Safety: CPU Lock active
    let edge_total = unsafe { Traits::time_elapsed_us() } as u64;
    let consumed = g.edge_consumed_us.replace(&mut *lock, edge_total);
    let mut fresh = edge_total.saturating_sub(consumed);

    let system_us = g.system_us.get(&*lock);
    g.system_us
        .replace(&mut *lock, system_us.wrapping_add(fresh));

    let mut cur = g.wait.read(&*lock).first();
    while fresh > 0 {
        let Some(c) = cur else { break };
        let record = c.get();
        let delta = record.duration_us.get(&*lock);
        if delta >= fresh {
            record.duration_us.replace(&mut *lock, delta - fresh);
            break;
        }
        record.duration_us.replace(&mut *lock, 0);
        fresh -= delta;
        cur = list::next(c, lock.borrow_mut());
    }
}

/// Program the tick source for the current head of the delta list and start
/// a new measurement edge.
///
/// Suppressed while the expiration walk is in progress; `handle_tick`
/// re-programs once at the end.
fn reprogram<Traits: KernelTraits>(mut lock: CpuLockTokenRefMut<'_, Traits>) {
    let g = Traits::g_timeout();
    if g.handling_tick.get(&*lock) {
        return;
    }

    let interval = match g.wait.read(&*lock).first() {
        Some(head) => {
            let delta = head.get().duration_us.get(&*lock);
            delta.min(Traits::MAX_INTERVAL_US as u64) as u32
        }
        None => TIME_FOREVER_US,
    };

    g.edge_consumed_us.replace(&mut *lock, 0);
    // Safety: CPU Lock active
    unsafe { Traits::time_interval_set(interval) };
}

/// Arm an expiration record `delta_us` from now.
///
/// A zero delta is accepted (the record fires on the next tick); callers
/// reject zero timeouts where the contract demands it.
pub(crate) fn arm<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    record: &Timeout<Traits>,
    delta_us: u64,
) {
    debug_assert_ne!(record.st.get(&*lock), TimeoutSt::None);

    cancel::<Traits>(lock.borrow_mut(), record);
    fold_elapsed::<Traits>(lock.borrow_mut());

    record.duration_us.replace(&mut *lock, delta_us);
    record.st.replace(&mut *lock, TimeoutSt::Wait);

    let g = Traits::g_timeout();
    list::insert_ordered(
        &g.wait,
        TimeoutRef(record.into()),
        lock.borrow_mut(),
        |cur, cand, mut l| {
            let cur_cell = &cur.get().duration_us;
            let cand_cell = &cand.get().duration_us;
            let cur_delta = cur_cell.get(&*l);
            let cand_delta = cand_cell.get(&*l);
            if cand_delta >= cur_delta {
                // Keep walking; the candidate's delta becomes relative to
                // the current record
                cand_cell.replace(&mut *l, cand_delta - cur_delta);
                true
            } else {
                // The candidate lands here; the successor's delta becomes
                // relative to the candidate
                cur_cell.replace(&mut *l, cur_delta - cand_delta);
                false
            }
        },
    );

    reprogram::<Traits>(lock);
}

/// Disarm an expiration record. Does nothing if it isn't armed. The record
/// returns to the armed-but-inactive state.
pub(crate) fn cancel<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    record: &Timeout<Traits>,
) {
    let g = Traits::g_timeout();
    let r = TimeoutRef(record.into());

    match record.st.get(&*lock) {
        TimeoutSt::Wait => {
            // Give the removed record's delta to its successor so that the
            // cumulative-sum invariant is preserved
            let successor = list::next(r, lock.borrow_mut());
            let removed = list::remove(&g.wait, r, lock.borrow_mut());
            debug_assert!(removed);
            if let Some(s) = successor {
                let delta = record.duration_us.get(&*lock);
                let s_delta = s.get().duration_us.get(&*lock);
                s.get().duration_us.replace(&mut *lock, s_delta + delta);
            }
            record.st.replace(&mut *lock, TimeoutSt::Idle);
            reprogram::<Traits>(lock);
        }
        TimeoutSt::Pend => {
            let removed = list::remove(&g.pend, r, lock.borrow_mut());
            debug_assert!(removed);
            record.st.replace(&mut *lock, TimeoutSt::Idle);
        }
        TimeoutSt::Idle | TimeoutSt::None => {}
    }
}

/// The current system time in microseconds since boot.
pub(crate) fn system_time_us<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
) -> u64 {
    let g = Traits::g_timeout();
    // Safety: CPU Lock active
    let edge_total = unsafe { Traits::time_elapsed_us() } as u64;
    let consumed = g.edge_consumed_us.get(&*lock);
    g.system_us
        .get(&*lock)
        .wrapping_add(edge_total.saturating_sub(consumed))
}

/// Implements [`crate::PortToKernel::timer_tick`].
///
/// Precondition: CPU Lock inactive, an interrupt context.
pub(crate) fn handle_tick<Traits: KernelTraits>() {
    // The precondition includes CPU Lock being inactive, so this `unwrap`
    // should succeed
    let mut lock = klock::CpuLockGuard::<Traits>::acquire().unwrap();

    let g = Traits::g_timeout();

    fold_elapsed::<Traits>(lock.borrow_mut());

    // Suppress redundant tick-source re-programming by the handlers below
    g.handling_tick.replace(&mut *lock.borrow_mut(), true);

    // Consume expired records from the head of the delta list
    loop {
        let Some(head) = g.wait.read(&*lock.borrow_mut()).first() else {
            break;
        };
        let record = head.get();
        if record.duration_us.get(&*lock.borrow_mut()) > 0 {
            break;
        }

        let popped = list::pop_front(&g.wait, lock.borrow_mut());
        debug_assert!(popped == Some(head));

        match record.kind.get(&*lock.borrow_mut()) {
            TimeoutKind::TaskWake => {
                // The scheduler's generic wake-on-timeout fires inline
                record.st.replace(&mut *lock.borrow_mut(), TimeoutSt::Idle);
                let task_i = record.param.get(&*lock.borrow_mut());
                let task_cb = &Traits::task_cb_pool()[task_i];
                wait::wake_task_by_timeout(lock.borrow_mut(), task_cb);
            }
            TimeoutKind::Timer => {
                // Stamp with the current system time and park for dispatch
                // after the walk
                let now = g.system_us.get(&*lock.borrow_mut());
                record.duration_us.replace(&mut *lock.borrow_mut(), now);
                record.st.replace(&mut *lock.borrow_mut(), TimeoutSt::Pend);
                list::push_back(&g.pend, head, lock.borrow_mut());
            }
        }
    }

    // Dispatch the expired timers
    let mut any_timer_fired = false;
    while let Some(r) = list::pop_front(&g.pend, lock.borrow_mut()) {
        let record = r.get();
        record.st.replace(&mut *lock.borrow_mut(), TimeoutSt::Idle);
        let timer_i = record.param.get(&*lock.borrow_mut());
        timer::handle_expired::<Traits>(lock.borrow_mut(), timer_i);
        any_timer_fired = true;
    }

    g.handling_tick.replace(&mut *lock.borrow_mut(), false);
    reprogram::<Traits>(lock.borrow_mut());

    if any_timer_fired {
        kthread::notify::<Traits>(lock.borrow_mut());
    }

    // Handlers might have woken up tasks. Check for dispatch and release CPU
    // Lock.
    task::unlock_cpu_and_check_preemption(lock);
}
