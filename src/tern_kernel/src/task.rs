//! Tasks — the schedulable units — and the scheduler core.
//!
//! A *task* is the scheduling half of a thread: the saved context, the
//! priority bookkeeping, the wait state, and the embedded expiration record.
//! The user-facing thread API (lifecycle, user data, stack accounting) lives
//! in [`crate::thread`] and operates on the same control blocks.
use core::{fmt, ptr::NonNull};

use crate::{
    klock::{self, CpuLockCell, CpuLockGuard, CpuLockTokenRefMut},
    mutex, thread, timeout,
    utils::{
        list::{Link, ListItem},
        Init,
    },
    wait, is_cooperation_level, KernelTraits, Priority, RawCell, KERNEL_THREAD_LEVEL,
};

#[doc(hidden)]
pub mod readyqueue;
use self::readyqueue::Queue as _;

bitflags::bitflags! {
    /// The control/status byte of a task. A zero value marks a free pool
    /// slot.
    pub(crate) struct ControlStatus: u8 {
        /// The slot is claimed and initialized.
        const INITED = 1 << 0;
        /// The task is the kernel housekeeping thread; it is not addressable
        /// through the public thread API.
        const KERNEL = 1 << 1;
    }
}

impl Init for ControlStatus {
    const INIT: Self = Self::empty();
}

/// Task state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TaskSt {
    /// The slot is unclaimed or the task was deleted.
    Dormant,
    Ready,
    Running,
    Waiting,
}

impl Init for TaskSt {
    const INIT: Self = Self::Dormant;
}

/// Where a task's stack came from.
///
/// `Left` is a caller-supplied region; `Right` was carved out of the kernel
/// heap and is returned to it when the task is deleted.
pub(crate) type StackSource = either::Either<*mut [u8], *mut [u8]>;

/// Scheduling timestamps of a task, in microseconds since boot.
#[cfg(feature = "schedule_analysis")]
#[derive(Debug, Clone, Copy)]
pub struct CallAnalyze {
    /// When the task last left the processor.
    pub last_pend_us: u64,
    /// When the task last became Ready.
    pub last_active_us: u64,
    /// When the task last started running.
    pub last_run_us: u64,
    /// Accumulated running time.
    pub total_run_us: u64,
}

#[cfg(feature = "schedule_analysis")]
impl Init for CallAnalyze {
    const INIT: Self = Self {
        last_pend_us: 0,
        last_active_us: 0,
        last_run_us: 0,
        total_run_us: 0,
    };
}

/// *Task control block* — the state data of a task.
///
/// This type isn't technically public but needs to be `pub` so that it can
/// be referred to by the configuration macro.
#[repr(C)]
pub struct TaskCb<Traits: KernelTraits> {
    /// Port-specific state (the saved stack pointer).
    ///
    /// This is guaranteed to be placed at the beginning of the struct so
    /// that the port's dispatcher can refer to it from assembly.
    pub port_task_state: Traits::PortTaskState,

    pub(crate) cs: CpuLockCell<Traits, ControlStatus>,

    pub(crate) name: CpuLockCell<Traits, &'static str>,

    /// The entry point and its parameter.
    ///
    /// [`RawCell`]s rather than token-guarded cells: the port's dispatcher
    /// reads these when building the task's initial context, and it has no
    /// token — only the guarantee that CPU Lock is active.
    pub(crate) entry: RawCell<Option<fn(usize)>>,
    pub(crate) entry_arg: RawCell<usize>,

    /// The stack region, if the task is live. See [`Self::entry`] for why
    /// this is a [`RawCell`].
    pub(crate) stack: RawCell<Option<StackSource>>,

    pub(crate) user_data: CpuLockCell<Traits, *mut ()>,

    /// The priority the task was created with (public encoding), for
    /// reporting.
    pub(crate) priority: CpuLockCell<Traits, Priority>,

    /// The internal level corresponding to `priority`.
    pub(crate) base_level: CpuLockCell<Traits, usize>,

    /// The internal level the scheduler actually uses; may be raised above
    /// `base_level` by priority inheritance.
    pub(crate) effective_level: CpuLockCell<Traits, usize>,

    pub(crate) st: CpuLockCell<Traits, TaskSt>,

    /// Links the task into one per-level FIFO of the ready queue.
    pub(crate) ready_link: CpuLockCell<Traits, Link<TaskRef<Traits>>>,

    /// The wait state of the task.
    pub(crate) wait: wait::TaskWait<Traits>,

    /// The task's one expiration record, reused by every blocking operation
    /// with a finite timeout.
    pub(crate) timeout: timeout::Timeout<Traits>,

    /// The last mutex locked by the task, forming a singly-linked list of
    /// all mutexes it currently holds.
    pub(crate) last_mutex_held: CpuLockCell<Traits, Option<&'static mutex::MutexCb<Traits>>>,

    #[cfg(feature = "schedule_analysis")]
    pub(crate) analyze: CpuLockCell<Traits, CallAnalyze>,
}

// Safety: The raw-pointer fields are only dereferenced by the owning task or
// with CPU Lock active
unsafe impl<Traits: KernelTraits> Send for TaskCb<Traits> {}
unsafe impl<Traits: KernelTraits> Sync for TaskCb<Traits> {}

impl<Traits: KernelTraits> Init for TaskCb<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        port_task_state: Init::INIT,
        cs: Init::INIT,
        name: Init::INIT,
        entry: Init::INIT,
        entry_arg: Init::INIT,
        stack: Init::INIT,
        user_data: CpuLockCell::new(core::ptr::null_mut()),
        priority: Init::INIT,
        base_level: Init::INIT,
        effective_level: Init::INIT,
        st: Init::INIT,
        ready_link: Init::INIT,
        wait: Init::INIT,
        timeout: Init::INIT,
        last_mutex_held: Init::INIT,
        #[cfg(feature = "schedule_analysis")]
        analyze: Init::INIT,
    };
}

impl<Traits: KernelTraits> TaskCb<Traits> {
    /// The task's entry point and parameter, for the port's dispatcher.
    ///
    /// # Safety
    ///
    /// CPU Lock must be active and the task must be initialized.
    pub unsafe fn entry_point(&self) -> (fn(usize), usize) {
        // Safety: Forwarded preconditions
        let entry = unsafe { self.entry.read() };
        (
            entry.expect("task has no entry point"),
            unsafe { self.entry_arg.read() },
        )
    }

    /// The task's stack region, for the port's dispatcher.
    ///
    /// # Safety
    ///
    /// CPU Lock must be active and the task must be initialized.
    pub unsafe fn stack_region(&self) -> *mut [u8] {
        // Safety: Forwarded preconditions
        match unsafe { self.stack.read() } {
            Some(source) => source.into_inner(),
            None => core::ptr::slice_from_raw_parts_mut(core::ptr::null_mut(), 0),
        }
    }
}

impl<Traits: KernelTraits> fmt::Debug for TaskCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TaskCb")
            .field("self", &(self as *const _))
            .field("name", &self.name)
            .field("st", &self.st)
            .field("base_level", &self.base_level)
            .field("effective_level", &self.effective_level)
            .finish_non_exhaustive()
    }
}

/// A reference to a [`TaskCb`] in the static task pool.
pub(crate) struct TaskRef<Traits: KernelTraits>(NonNull<TaskCb<Traits>>);

// Safety: `TaskCb` is `Send + Sync`
unsafe impl<Traits: KernelTraits> Send for TaskRef<Traits> {}
unsafe impl<Traits: KernelTraits> Sync for TaskRef<Traits> {}

impl<Traits: KernelTraits> Clone for TaskRef<Traits> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<Traits: KernelTraits> Copy for TaskRef<Traits> {}

impl<Traits: KernelTraits> PartialEq for TaskRef<Traits> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}
impl<Traits: KernelTraits> Eq for TaskRef<Traits> {}

impl<Traits: KernelTraits> fmt::Debug for TaskRef<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("TaskRef").field(&self.0).finish()
    }
}

impl<Traits: KernelTraits> TaskRef<Traits> {
    #[inline]
    pub(crate) fn new(cb: &'static TaskCb<Traits>) -> Self {
        Self(NonNull::from(cb))
    }

    /// All task control blocks live in the static pool, so the reference is
    /// `'static`.
    #[inline]
    pub(crate) fn get(self) -> &'static TaskCb<Traits> {
        // Safety: Task control blocks are never deallocated
        unsafe { &*self.0.as_ptr() }
    }
}

impl<Traits: KernelTraits> ListItem<Traits> for TaskRef<Traits> {
    unsafe fn link<'a>(self) -> &'a CpuLockCell<Traits, Link<Self>> {
        // Safety: Task control blocks are never deallocated
        unsafe { &(*self.0.as_ptr()).ready_link }
    }
}

/// If the current context can't block, return `Err(BadContext)`.
pub(crate) fn expect_waitable_context<Traits: KernelTraits>(
) -> Result<(), crate::error::BadContextError> {
    if Traits::is_task_context() {
        Ok(())
    } else {
        Err(crate::error::BadContextError::BadContext)
    }
}

/// Find a free slot in the task pool and mark it claimed.
///
/// The slot's expiration record is wired to the scheduler's wake-on-timeout
/// callback before the slot is returned.
pub(crate) fn claim_task_cb<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
) -> Option<(usize, &'static TaskCb<Traits>)> {
    let pool = Traits::task_cb_pool();
    for (index, cb) in pool.iter().enumerate() {
        if cb.cs.get(&*lock).is_empty() {
            cb.cs.replace(&mut *lock, ControlStatus::INITED);
            cb.timeout
                .setup(lock.borrow_mut(), timeout::TimeoutKind::TaskWake, index);
            return Some((index, cb));
        }
    }
    None
}

/// Transition the task into the Ready state. This function doesn't do any
/// proper cleanup for a previous state.
///
/// # Safety
///
/// The task's saved context must be valid and ready to resume.
pub(crate) unsafe fn make_ready<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task_cb: &'static TaskCb<Traits>,
) {
    task_cb.st.replace(&mut *lock, TaskSt::Ready);

    #[cfg(feature = "schedule_analysis")]
    {
        let now = timeout::system_time_us::<Traits>(lock.borrow_mut());
        task_cb.analyze.write(&mut *lock).last_active_us = now;
    }

    // Safety: `task_cb` is not in the ready queue
    unsafe {
        Traits::state()
            .ready_queue()
            .push_back_task(lock, TaskRef::new(task_cb));
    }
}

/// The effective level used for preemption decisions.
///
/// While a cooperation-level task runs, other cooperation levels must not
/// preempt it, so its level is reported as the best cooperation level; only
/// the kernel-thread level ranks above that.
fn preemption_level<Traits: KernelTraits>(level: usize) -> usize {
    if is_cooperation_level::<Traits>(level) {
        KERNEL_THREAD_LEVEL + 1
    } else {
        level
    }
}

/// Relinquish CPU Lock. After that, if there's a task with a higher effective
/// level than the running task's, call `Traits::yield_cpu`.
///
/// System services that transition a task into the Ready state should call
/// this before returning to the caller.
pub(crate) fn unlock_cpu_and_check_preemption<Traits: KernelTraits>(
    mut lock: CpuLockGuard<Traits>,
) {
    let prev_task_level =
        if let Some(running_task) = Traits::state().running_task(lock.borrow_mut()) {
            if running_task.st.get(&*lock) == TaskSt::Running {
                preemption_level::<Traits>(running_task.effective_level.get(&*lock))
            } else {
                usize::MAX
            }
        } else {
            usize::MAX
        };

    let has_preempting_task = Traits::state()
        .ready_queue()
        .has_ready_task_above(lock.borrow_mut(), prev_task_level);

    // Relinquish CPU Lock
    drop(lock);

    if has_preempting_task {
        // Safety: CPU Lock inactive
        unsafe { Traits::yield_cpu() };
    }
}

/// Implements [`crate::PortToKernel::choose_running_task`].
#[inline]
pub(crate) fn choose_next_running_task<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
) {
    // Stamp the scheduling decision for analysis
    let now = timeout::system_time_us::<Traits>(lock.borrow_mut());
    Traits::state()
        .pendsv_stamp_us
        .replace(&mut *lock, now);

    // The level of `running_task`. `usize::MAX` indicates that there is no
    // running task or that it can't continue to run, and a new task must be
    // elected even if no task is Ready.
    let prev_running_task = Traits::state().running_task(lock.borrow_mut());
    let prev_task_level = if let Some(running_task) = prev_running_task {
        if running_task.st.get(&*lock) == TaskSt::Running {
            preemption_level::<Traits>(running_task.effective_level.get(&*lock))
        } else {
            usize::MAX
        }
    } else {
        usize::MAX
    };

    let decision = Traits::state()
        .ready_queue()
        .pop_front_task(lock.borrow_mut(), prev_task_level);

    let next_running_task = match decision {
        readyqueue::ScheduleDecision::SwitchTo(task) => task.map(TaskRef::get),

        // There's no task willing to take over the current one, and the
        // current one can still run.
        readyqueue::ScheduleDecision::Keep => {
            debug_assert_ne!(prev_task_level, usize::MAX);
            return;
        }
    };

    if let Some(task) = next_running_task {
        task.st.replace(&mut *lock, TaskSt::Running);

        if core::ptr::eq(ptr_from_option_ref(prev_running_task), task) {
            // Skip the remaining steps if the task didn't change
            return;
        }

        #[cfg(feature = "schedule_analysis")]
        {
            task.analyze.write(&mut *lock).last_run_us = now;
        }
    }

    // `prev_running_task` now loses control of the processor.
    if let Some(running_task) = prev_running_task {
        #[cfg(feature = "schedule_analysis")]
        {
            let analyze = running_task.analyze.write(&mut *lock);
            analyze.total_run_us += now.saturating_sub(analyze.last_run_us);
            analyze.last_pend_us = now;
        }

        match running_task.st.get(&*lock) {
            TaskSt::Running => {
                // Safety: The previous state is Running, so the context is
                // valid
                unsafe { make_ready(lock.borrow_mut(), running_task) };
            }
            TaskSt::Waiting | TaskSt::Ready | TaskSt::Dormant => {
                // Stays off the processor; nothing to do
            }
        }
    }

    Traits::state().set_running_task(lock.borrow_mut(), next_running_task);
}

#[inline]
fn ptr_from_option_ref<T>(x: Option<&T>) -> *const T {
    if let Some(x) = x {
        x
    } else {
        core::ptr::null()
    }
}

/// Transition the currently running task into the Waiting state. Returns when
/// woken up.
///
/// The current context must be a task context (this function doesn't check
/// that).
pub(crate) fn wait_until_woken_up<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
) {
    // Transition the current task to Waiting
    let running_task = Traits::state().running_task(lock.borrow_mut()).unwrap();
    assert_eq!(running_task.st.get(&*lock), TaskSt::Running);
    running_task.st.replace(&mut *lock, TaskSt::Waiting);

    loop {
        // Temporarily release the CPU Lock before calling `yield_cpu`
        // Safety: (1) We don't access resources protected by CPU Lock.
        //         (2) We currently have CPU Lock.
        //         (3) We will re-acquire a CPU Lock before returning from
        //             this function.
        unsafe { Traits::leave_cpu_lock() };

        // Safety: CPU Lock inactive
        unsafe { Traits::yield_cpu() };

        // Re-acquire a CPU Lock
        unsafe { Traits::enter_cpu_lock() };

        if running_task.st.get(&*lock) == TaskSt::Running {
            break;
        }

        assert_eq!(running_task.st.get(&*lock), TaskSt::Waiting);
    }
}

/// Terminate the currently running task: abandon its held mutexes, release
/// its heap-allocated stack (if any), zero its control byte, and dispatch the
/// next task.
///
/// This is also the tail of the port's entry trampoline: a thread entry
/// function returning normally ends up here.
///
/// # Safety
///
/// Must be called from the task context that is being terminated. All data
/// on the task stack is invalidated.
pub unsafe fn exit_current_task<Traits: KernelTraits>() -> ! {
    // If CPU Lock is inactive, activate it
    let mut lock = unsafe {
        if !Traits::is_cpu_lock_active() {
            Traits::enter_cpu_lock();
        }
        klock::CpuLockGuard::<Traits>::adopt()
    };

    let running_task = Traits::state().running_task(lock.borrow_mut()).unwrap();

    // Abandon mutexes, waking up their next waiters (if any)
    mutex::abandon_held_mutexes(lock.borrow_mut(), running_task);
    debug_assert!(running_task.last_mutex_held.read(&*lock).is_none());

    thread::release_task_resources(lock.borrow_mut(), running_task);

    // Transition the current task to Dormant and erase the claim
    assert_eq!(running_task.st.get(&*lock), TaskSt::Running);
    running_task.st.replace(&mut *lock, TaskSt::Dormant);
    running_task.cs.replace(&mut *lock, ControlStatus::empty());

    Traits::state().set_running_task(lock.borrow_mut(), None);

    core::mem::forget(lock);

    // Safety: (1) The caller acknowledges that all preexisting data on the
    // task stack is invalidated. (2) CPU Lock active
    unsafe { Traits::exit_and_dispatch(running_task) }
}
