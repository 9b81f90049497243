//! The Tern kernel: a preemptive, fixed-priority real-time kernel for
//! single-core microcontrollers.
//!
//! This crate contains the portable part of the kernel: the scheduler, the
//! timeout wheel, and the blocking primitives (semaphore, mutex with priority
//! inheritance, event flags, message queue, memory pool, publish/subscribe).
//! The hardware-specific part — context switching, interrupt masking, and the
//! tick source — is supplied by a *port* crate implementing [`PortThreading`]
//! and [`PortTimer`] on a *kernel trait type*, an empty type created by the
//! [`static_kernel!`] macro which also instantiates the kernel's static
//! state.
//!
//! # Contexts
//!
//!  - **Task context**: code running on a task's stack. Blocking operations
//!    are allowed here and nowhere else.
//!  - **Interrupt context**: an ISR or the boot path. Non-blocking
//!    operations (`give`, `set`, poll-mode `take`, …) are allowed.
//!  - **CPU Lock**: the master critical section. Every privileged kernel
//!    routine runs entirely inside it; see [`klock`] for how this is made a
//!    compile-time guarantee.
//!
//! [`klock`]: crate::klock
#![cfg_attr(not(test), no_std)]

use core::{fmt, marker::PhantomData, num::NonZeroUsize};

#[macro_use]
pub mod utils;
#[macro_use]
mod error;
pub mod cfg;
pub mod event;
mod heap;
mod klock;
mod kthread;
pub mod msgqueue;
pub mod mutex;
pub mod pool;
pub mod postcode;
pub mod pubsub;
pub mod semaphore;
pub mod task;
pub mod thread;
mod time;
mod timeout;
pub mod timer;
mod wait;

pub use crate::{
    postcode::{Component, Postcode},
    time::TimeoutMs,
};

use crate::{task::TaskCb, utils::Init};

/// Numeric object identifier, `1..=pool len` (the pool index plus one). The
/// niche lets `Option<Id>` stay pointer-sized.
pub(crate) type Id = NonZeroUsize;

/// Application-visible task priority. Smaller values mean higher priority.
///
///  - `0` ([`PRIORITY_APPLICATION_HIGHEST`]) and greater are preemptive
///    application priorities.
///  - Negative values are *cooperation* slots (see [`cooperation_priority`]):
///    they rank above every application priority, but a running cooperation
///    task is never preempted by another cooperation task — control moves
///    between them only through explicit yields or blocking.
pub type Priority = i16;

/// The highest application priority.
pub const PRIORITY_APPLICATION_HIGHEST: Priority = 0;

/// Encode cooperation slot `c` as a [`Priority`].
///
/// The result is negative, placing the slot above all application
/// priorities. Slot `0` sits just above the applications; greater slot
/// numbers rank higher still. Slot numbers must be below the configured
/// cooperation level count.
pub const fn cooperation_priority(c: u8) -> Priority {
    -1 - (c as Priority)
}

/// The number of internal priority levels reserved by the kernel: the
/// kernel-thread level above everything and the idle level below everything.
pub const NUM_RESERVED_LEVELS: usize = 2;

/// The internal level of the kernel housekeeping thread.
pub(crate) const KERNEL_THREAD_LEVEL: usize = 0;

/// Map a public priority to an internal level index.
///
/// Level layout: `0` = kernel thread, `1..=NUM_COOPERATION_LEVELS` =
/// cooperation slots, then application priorities, and the last level is
/// reserved for idle accounting.
pub(crate) fn level_from_priority<Traits: KernelCfg>(priority: Priority) -> Option<usize> {
    let coop = Traits::NUM_COOPERATION_LEVELS;
    let level = priority as isize + coop as isize + 1;
    // Exclude the kernel-thread level and the idle level
    if level >= 1 && (level as usize) < Traits::NUM_PRIORITY_LEVELS - 1 {
        Some(level as usize)
    } else {
        None
    }
}

/// Map an internal level index back to a public priority.
pub(crate) fn priority_from_level<Traits: KernelCfg>(level: usize) -> Priority {
    (level as isize - Traits::NUM_COOPERATION_LEVELS as isize - 1) as Priority
}

/// Is `level` a cooperation level? (The kernel-thread level is not: it must
/// preempt everything, including cooperation tasks.)
pub(crate) fn is_cooperation_level<Traits: KernelCfg>(level: usize) -> bool {
    (1..=Traits::NUM_COOPERATION_LEVELS).contains(&level)
}

/// The byte used to fill unused stack space, scanned by the stack usage
/// probe.
pub const STACK_FILL_BYTE: u8 = 0xa5;

/// The value of [`PortTimer::time_interval_set`]'s parameter requesting the
/// tick source to be stopped.
pub const TIME_FOREVER_US: u32 = u32::MAX;

/// An initialization hook to be invoked before the scheduler starts.
///
/// Hooks run in ascending phase order (`0..=4`); ties run in registration
/// order.
#[derive(Debug, Clone, Copy)]
pub struct InitHook {
    pub phase: u8,
    pub func: fn(),
}

/// The number of initialization phases.
pub const NUM_INIT_PHASES: u8 = 5;

/// Implemented by a port on the kernel trait type to provide threading
/// facilities.
///
/// # Safety
///
/// These methods are only meant to be called by the kernel.
pub unsafe trait PortThreading: 'static + Sized + Send + Sync {
    /// Port-specific per-task state (the saved stack pointer). Placed at the
    /// beginning of [`TaskCb`] so that assembly code can reach it.
    type PortTaskState: Send + Sync + Init + fmt::Debug + 'static;

    /// The lower bound of acceptable task stack sizes, in bytes.
    const STACK_SIZE_MINIMUM: usize = 256;

    /// The upper bound of acceptable task stack sizes, in bytes.
    const STACK_SIZE_MAXIMUM: usize = 1 << 20;

    /// The stack size used when a thread is created without a caller-supplied
    /// stack and no explicit size.
    const STACK_DEFAULT_SIZE: usize = 2048;

    /// Transfer control to the first task chosen by the scheduler.
    ///
    /// Precondition: CPU Lock active, boot context.
    unsafe fn dispatch_first_task() -> !;

    /// Request a context switch (pend the dispatcher).
    ///
    /// Precondition: CPU Lock inactive.
    unsafe fn yield_cpu();

    /// Discard the current task's context and dispatch the next one.
    ///
    /// Precondition: CPU Lock active, task context.
    unsafe fn exit_and_dispatch(task: &'static TaskCb<Self>) -> !
    where
        Self: KernelTraits;

    /// Enter the CPU Lock state.
    unsafe fn enter_cpu_lock();

    /// Leave the CPU Lock state.
    unsafe fn leave_cpu_lock();

    /// Enter the CPU Lock state, failing if it's already active.
    unsafe fn try_enter_cpu_lock() -> bool {
        if Self::is_cpu_lock_active() {
            false
        } else {
            // Safety: forwarded precondition
            unsafe { Self::enter_cpu_lock() };
            true
        }
    }

    /// Fill the task's stack with [`STACK_FILL_BYTE`] and construct the
    /// initial context so that the next dispatch of this task enters its
    /// entry function. The port must arrange for a return from the entry
    /// function to invoke [`task::exit_current_task`].
    ///
    /// Precondition: CPU Lock active, the task is not running.
    unsafe fn initialize_task_state(task: &'static TaskCb<Self>)
    where
        Self: KernelTraits;

    /// Is the CPU Lock state active?
    fn is_cpu_lock_active() -> bool;

    /// Is the current context a task context (able to block)?
    fn is_task_context() -> bool;

    /// Is the current context an interrupt context?
    fn is_interrupt_context() -> bool;

    /// Estimate the number of never-used bytes of a task stack by scanning
    /// for the fill pattern from the stack base upward.
    ///
    /// # Safety
    ///
    /// `stack` must be a stack region previously initialized by
    /// [`Self::initialize_task_state`].
    unsafe fn stack_free_size(stack: *mut [u8]) -> usize {
        let base = stack.cast::<u8>();
        let len = stack.len();
        let mut n = 0;
        while n < len {
            // Safety: `base + n` is in bounds of the stack region
            if unsafe { base.add(n).read_volatile() } != STACK_FILL_BYTE {
                break;
            }
            n += 1;
        }
        n
    }
}

/// Implemented by a port on the kernel trait type to provide the hardware
/// tick source consumed by the timeout wheel.
///
/// The tick source is a free-running down-counter reporting elapsed
/// microseconds. `time_interval_set` starts a new measurement period and
/// programs the next tick interrupt; `time_elapsed_us` reports microseconds
/// elapsed since the last `time_interval_set` edge, monotonic between edges
/// and robust against counter wrap.
///
/// # Safety
///
/// These methods are only meant to be called by the kernel, with CPU Lock
/// active.
pub unsafe trait PortTimer: 'static {
    /// The longest programmable interval, in microseconds. Longer timeouts
    /// are delivered in multiple periods.
    const MAX_INTERVAL_US: u32;

    /// Program the next tick interrupt to fire after `us` microseconds and
    /// restart the elapsed measurement. [`TIME_FOREVER_US`] parks the counter
    /// at the maximum interval instead.
    unsafe fn time_interval_set(us: u32);

    /// Microseconds elapsed since the last `time_interval_set` edge.
    unsafe fn time_elapsed_us() -> u32;

    /// Start the tick source.
    unsafe fn time_enable();

    /// Stop the tick source.
    unsafe fn time_disable();
}

/// The static configuration of a kernel instance, implemented on the kernel
/// trait type by [`static_kernel!`].
///
/// # Safety
///
/// The returned pools and state must be truly `'static` and consistent
/// between calls.
pub unsafe trait KernelCfg: PortThreading + Sized + 'static {
    /// The total number of internal priority levels, including the two
    /// reserved levels ([`NUM_RESERVED_LEVELS`]).
    const NUM_PRIORITY_LEVELS: usize;

    /// The number of cooperation slots.
    const NUM_COOPERATION_LEVELS: usize;

    /// The task ready queue implementation.
    type ReadyQueue: task::readyqueue::Queue<Self>;

    fn state() -> &'static State<Self>
    where
        Self: KernelTraits;

    fn task_cb_pool() -> &'static [TaskCb<Self>]
    where
        Self: KernelTraits;

    fn semaphore_cb_pool() -> &'static [semaphore::SemaphoreCb<Self>]
    where
        Self: KernelTraits;

    fn mutex_cb_pool() -> &'static [mutex::MutexCb<Self>]
    where
        Self: KernelTraits;

    fn event_cb_pool() -> &'static [event::EventCb<Self>]
    where
        Self: KernelTraits;

    fn queue_cb_pool() -> &'static [msgqueue::QueueCb<Self>]
    where
        Self: KernelTraits;

    fn pool_cb_pool() -> &'static [pool::PoolCb<Self>]
    where
        Self: KernelTraits;

    fn timer_cb_pool() -> &'static [timer::TimerCb<Self>]
    where
        Self: KernelTraits;

    fn publish_cb_pool() -> &'static [pubsub::PublishCb<Self>]
    where
        Self: KernelTraits;

    fn subscribe_cb_pool() -> &'static [pubsub::SubscribeCb<Self>]
    where
        Self: KernelTraits;

    /// The stack region of the kernel housekeeping thread.
    fn kernel_stack() -> *mut [u8];

    /// The region managed by the kernel heap ([`heap`]), used for
    /// kernel-allocated task stacks.
    fn heap_region() -> *mut [u8];

    /// Initialization hooks, invoked in phase order before the scheduler
    /// starts.
    fn init_hooks() -> &'static [InitHook];
}

/// The combined requirements of a kernel trait type. Automatically
/// implemented when the port and configuration traits are.
pub trait KernelTraits: PortThreading + PortTimer + KernelCfg + 'static {}
impl<T: PortThreading + PortTimer + KernelCfg + 'static> KernelTraits for T {}

/// Kernel operations a port invokes on the kernel trait type.
pub trait PortToKernel {
    /// Bootstrap the kernel: initialize the heap and the tick source, run
    /// the initialization hooks, create the housekeeping thread, and
    /// dispatch the first task.
    ///
    /// Precondition: CPU Lock active, boot context.
    ///
    /// # Safety
    ///
    /// Only meant to be called by the port, exactly once.
    unsafe fn boot() -> !;

    /// Choose the next task to run, updating `running_task`. Called by the
    /// port inside the dispatcher (PendSV) before switching contexts.
    ///
    /// Precondition: CPU Lock active.
    ///
    /// # Safety
    ///
    /// Only meant to be called by the port.
    unsafe fn choose_running_task();

    /// Advance the timeout wheel. Called by the port from the tick
    /// interrupt.
    ///
    /// Precondition: CPU Lock inactive, interrupt context.
    ///
    /// # Safety
    ///
    /// Only meant to be called by the port.
    unsafe fn timer_tick();
}

impl<Traits: KernelTraits> PortToKernel for Traits {
    unsafe fn boot() -> ! {
        // Safety: The port entered CPU Lock before calling us
        let mut lock = unsafe { klock::CpuLockGuard::<Traits>::adopt() };

        heap::init::<Traits>(lock.borrow_mut());
        timeout::init::<Traits>(lock.borrow_mut());
        kthread::create_kernel_thread::<Traits>(lock.borrow_mut());

        // Initialization hooks run with CPU Lock inactive so that they can
        // use the normal object-creation APIs
        drop(lock);
        let hooks = Traits::init_hooks();
        for phase in 0..NUM_INIT_PHASES {
            for hook in hooks.iter().filter(|h| h.phase == phase) {
                (hook.func)();
            }
        }
        // Safety: `boot` is called exactly once with CPU Lock active
        unsafe { Traits::enter_cpu_lock() };
        let mut lock = unsafe { klock::CpuLockGuard::<Traits>::adopt() };
        Traits::state().run.replace(&mut *lock.borrow_mut(), true);
        core::mem::forget(lock);

        // Safety: CPU Lock active, boot context
        unsafe { Traits::dispatch_first_task() }
    }

    unsafe fn choose_running_task() {
        // Safety: The caller (the dispatcher) has CPU Lock active
        let mut lock = unsafe { klock::CpuLockGuard::<Traits>::adopt() };
        task::choose_next_running_task(lock.borrow_mut());
        core::mem::forget(lock);
    }

    unsafe fn timer_tick() {
        timeout::handle_tick::<Traits>();
    }
}

/// A marker type used as the receiver of the public kernel API:
/// `System::<Traits>::operation(…)`.
pub struct System<Traits>(PhantomData<Traits>);

impl<Traits: KernelTraits> System<Traits> {
    /// Is the scheduler up?
    pub fn is_running() -> bool {
        if let Ok(lock) = klock::CpuLockGuard::<Traits>::acquire() {
            Traits::state().run.get(&*lock)
        } else {
            // Called from inside a critical section; the kernel must be up
            // for application code to be running at all
            true
        }
    }
}

/// A plain cell directly accessible by the port's context-switch code.
///
/// Unlike [`klock::CpuLockCell`] this provides no token discipline; it's used
/// only for the fields that assembly code must reach (the running task
/// pointer and the saved stack pointers). Kernel code accesses it exclusively
/// with CPU Lock active.
#[doc(hidden)]
pub struct RawCell<T>(core::cell::UnsafeCell<T>);

// Safety: Accesses are synchronized by CPU Lock
unsafe impl<T: Send> Sync for RawCell<T> {}

impl<T: Init> Init for RawCell<T> {
    const INIT: Self = Self(core::cell::UnsafeCell::new(T::INIT));
}

impl<T> RawCell<T> {
    #[inline]
    pub fn get_ptr(&self) -> *mut T {
        self.0.get()
    }

    /// # Safety
    ///
    /// CPU Lock must be active, or the caller must otherwise be the only
    /// accessor.
    #[inline]
    pub(crate) unsafe fn read(&self) -> T
    where
        T: Copy,
    {
        unsafe { *self.0.get() }
    }

    /// # Safety
    ///
    /// See [`Self::read`].
    #[inline]
    pub(crate) unsafe fn write(&self, value: T) {
        unsafe { *self.0.get() = value };
    }
}

/// The global state of a kernel instance, instantiated once per kernel trait
/// type by [`static_kernel!`].
pub struct State<Traits: KernelTraits> {
    /// The currently running task. `None` while the processor idles in the
    /// port's idle loop.
    ///
    /// This is a [`RawCell`] because the port's dispatcher reaches it from
    /// assembly; all kernel accesses happen with CPU Lock active.
    running_task: RawCell<Option<&'static TaskCb<Traits>>>,

    /// The task ready queue.
    ready_queue: Traits::ReadyQueue,

    /// Timeout wheel state.
    pub(crate) timeout: timeout::TimeoutGlobals<Traits>,

    /// Kernel heap state.
    pub(crate) heap: heap::HeapGlobals<Traits>,

    /// Deferred-callback state of the kernel housekeeping thread.
    pub(crate) deferred: kthread::DeferredGlobals<Traits>,

    /// `true` once `boot` has run.
    pub(crate) run: klock::CpuLockCell<Traits, bool>,

    /// The wall-clock (µs since boot) of the last scheduling decision,
    /// recorded for analysis.
    pub(crate) pendsv_stamp_us: klock::CpuLockCell<Traits, u64>,
}

impl<Traits: KernelTraits> Init for State<Traits> {
    const INIT: Self = Self {
        running_task: Init::INIT,
        ready_queue: Init::INIT,
        timeout: Init::INIT,
        heap: Init::INIT,
        deferred: Init::INIT,
        run: Init::INIT,
        pendsv_stamp_us: Init::INIT,
    };
}

impl<Traits: KernelTraits> fmt::Debug for State<Traits>
where
    <Traits as KernelCfg>::ReadyQueue: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("State")
            .field("ready_queue", &self.ready_queue)
            .field("run", &self.run)
            .finish_non_exhaustive()
    }
}

impl<Traits: KernelTraits> State<Traits> {
    /// Get the currently running task.
    #[inline]
    pub(crate) fn running_task(
        &self,
        _lock: klock::CpuLockTokenRefMut<'_, Traits>,
    ) -> Option<&'static TaskCb<Traits>> {
        // Safety: CPU Lock is active, as witnessed by `_lock`
        unsafe { self.running_task.read() }
    }

    #[inline]
    pub(crate) fn set_running_task(
        &self,
        _lock: klock::CpuLockTokenRefMut<'_, Traits>,
        task: Option<&'static TaskCb<Traits>>,
    ) {
        // Safety: CPU Lock is active, as witnessed by `_lock`
        unsafe { self.running_task.write(task) };
    }

    #[inline]
    pub(crate) fn ready_queue(&self) -> &Traits::ReadyQueue {
        &self.ready_queue
    }

    /// The address of the running-task pointer, for the port's dispatcher.
    pub fn running_task_ptr(&self) -> *mut Option<&'static TaskCb<Traits>> {
        self.running_task.get_ptr()
    }
}
