//! Simulation environment for running the Tern kernel on a hosted target.
//!
//! Each kernel task is backed by a host thread gated so that at most one
//! task thread executes at a time, faithfully modeling the single-core
//! scheduling discipline:
//!
//!  - **CPU Lock** is a process-global lock with a recorded holder; entering
//!    it blocks until it's free, which models interrupt masking (a masked
//!    "interrupt" — the tick thread — simply waits its turn).
//!  - **The dispatcher** (the PendSV stand-in) runs inside whichever thread
//!    requests a reschedule: it asks the kernel to choose the next running
//!    task, unparks that task's gate, and — when the requester is a task
//!    thread that lost the processor — parks the requester's gate.
//!  - **The tick source** is a dedicated thread sleeping until the
//!    programmed interval elapses, then invoking `timer_tick` exactly like
//!    a tick interrupt handler would.
//!
//! The port is bound to a kernel trait type with [`use_port!`]:
//!
//! ```ignore
//! tern_kernel::static_kernel! { pub struct App; /* … */ }
//! tern_port_std::use_port!(impl App);
//!
//! fn main() {
//!     tern_port_std::start_kernel::<App>();
//!     /* the kernel is now running in background threads */
//! }
//! ```
use std::{
    cell::Cell,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Condvar, Mutex,
    },
    thread,
    time::{Duration, Instant},
};

use tern_kernel::{
    task::TaskCb, KernelTraits, PortThreading, PortToKernel, STACK_FILL_BYTE, TIME_FOREVER_US,
};

/// Used by [`use_port!`].
#[doc(hidden)]
pub use tern_kernel;

/// The shortest honored tick interval. Re-programming with a shorter value
/// (including zero) is clamped here, mirroring a hardware port's minimum
/// programmable interval.
pub const MIN_INTERVAL_US: u32 = 100;

/// The longest programmable tick interval.
pub const MAX_INTERVAL_US: u32 = 1 << 30;

thread_local! {
    /// The address of the `TaskCb` owned by this thread, or `0`.
    static CURRENT_TASK: Cell<usize> = const { Cell::new(0) };

    /// Set while this thread is simulating an interrupt handler.
    static IN_INTERRUPT: Cell<bool> = const { Cell::new(false) };
}

/// Implemented on a kernel trait type by [`use_port!`].
///
/// # Safety
///
/// Only meant to be implemented by [`use_port!`].
pub unsafe trait PortInstance:
    KernelTraits + PortThreading<PortTaskState = TaskState>
{
    fn port_state() -> &'static PortState;
}

/// The gate that admits a task thread to the processor.
struct Gate {
    st: Mutex<GateSt>,
    cv: Condvar,
}

#[derive(Clone, Copy)]
struct GateSt {
    runnable: bool,
    cancelled: bool,
}

impl Gate {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            st: Mutex::new(GateSt {
                runnable: false,
                cancelled: false,
            }),
            cv: Condvar::new(),
        })
    }

    fn make_runnable(&self) {
        self.st.lock().unwrap().runnable = true;
        self.cv.notify_all();
    }

    fn cancel(&self) {
        self.st.lock().unwrap().cancelled = true;
        self.cv.notify_all();
    }

    /// Wait until admitted. Returns `false` if the task slot was recycled
    /// while parked; the thread must not touch kernel state anymore.
    fn wait_runnable(&self) -> bool {
        let mut st = self.st.lock().unwrap();
        loop {
            if st.cancelled {
                return false;
            }
            if st.runnable {
                st.runnable = false;
                return true;
            }
            st = self.cv.wait(st).unwrap();
        }
    }
}

/// Port-specific per-task state: the gate of the backing host thread.
pub struct TaskState {
    gate: spin::Mutex<Option<Arc<Gate>>>,
}

impl tern_kernel::utils::Init for TaskState {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        gate: spin::Mutex::new(None),
    };
}

impl std::fmt::Debug for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str("TaskState")
    }
}

struct CpuLockSt {
    holder: Option<thread::ThreadId>,
}

struct TimerSt {
    edge: Option<Instant>,
    interval_us: u32,
    enabled: bool,
    generation: u64,
}

/// The per-kernel-instance state of this port, instantiated by
/// [`use_port!`].
pub struct PortState {
    cpu: Mutex<CpuLockSt>,
    cpu_cv: Condvar,

    timer: Mutex<TimerSt>,
    timer_cv: Condvar,
    timer_thread_spawned: AtomicBool,

    boot_started: AtomicBool,
}

impl PortState {
    #[allow(clippy::new_without_default)]
    pub const fn new() -> Self {
        Self {
            cpu: Mutex::new(CpuLockSt { holder: None }),
            cpu_cv: Condvar::new(),
            timer: Mutex::new(TimerSt {
                edge: None,
                interval_us: TIME_FOREVER_US,
                enabled: false,
                generation: 0,
            }),
            timer_cv: Condvar::new(),
            timer_thread_spawned: AtomicBool::new(false),
            boot_started: AtomicBool::new(false),
        }
    }
}

// CPU Lock
// ---------------------------------------------------------------------------

pub fn enter_cpu_lock<Traits: PortInstance>() {
    let state = Traits::port_state();
    loop {
        let mut cpu = state.cpu.lock().unwrap();
        debug_assert_ne!(
            cpu.holder,
            Some(thread::current().id()),
            "CPU Lock is not recursive"
        );
        while cpu.holder.is_some() {
            cpu = state.cpu_cv.wait(cpu).unwrap();
        }
        cpu.holder = Some(thread::current().id());
        drop(cpu);

        // Preemption net: a host thread can't be interrupted mid-execution
        // the way a real core can, so a preempted task thread takes effect
        // of the preemption here, at its next kernel entry. If this thread's
        // task lost the processor, surrender the lock and park until the
        // scheduler hands the processor back.
        let current = CURRENT_TASK.with(|c| c.get());
        if current != 0 && !IN_INTERRUPT.with(|c| c.get()) {
            // Safety: CPU Lock active
            let running: Option<&'static TaskCb<Traits>> =
                unsafe { *Traits::state().running_task_ptr() };
            let running_addr = running.map_or(0, |t| t as *const TaskCb<Traits> as usize);
            if running_addr != current {
                leave_cpu_lock::<Traits>();
                // Safety: `current` points to a pool slot, which is never
                // deallocated
                let own = unsafe { &*(current as *const TaskCb<Traits>) };
                if !task_gate(own).wait_runnable() {
                    park_forever();
                }
                continue;
            }
        }
        return;
    }
}

pub fn leave_cpu_lock<Traits: PortInstance>() {
    let state = Traits::port_state();
    let mut cpu = state.cpu.lock().unwrap();
    debug_assert_eq!(cpu.holder, Some(thread::current().id()));
    cpu.holder = None;
    drop(cpu);
    state.cpu_cv.notify_all();
}

pub fn is_cpu_lock_active<Traits: PortInstance>() -> bool {
    let state = Traits::port_state();
    state.cpu.lock().unwrap().holder == Some(thread::current().id())
}

// Context switching
// ---------------------------------------------------------------------------

fn task_gate<Traits: PortInstance>(task: &TaskCb<Traits>) -> Arc<Gate> {
    task.port_task_state
        .gate
        .lock()
        .clone()
        .expect("task has no backing thread")
}

/// The dispatcher. Chooses the next running task and transfers the
/// processor to it.
///
/// # Safety
///
/// CPU Lock must be active. `park_if_preempted` must be `false` when the
/// calling thread isn't a task thread.
unsafe fn dispatch<Traits: PortInstance>(park_if_preempted: bool) {
    // Safety: CPU Lock active
    let prev: Option<&'static TaskCb<Traits>> = unsafe { *Traits::state().running_task_ptr() };
    let prev_addr = prev.map_or(0, |t| t as *const TaskCb<Traits> as usize);

    // Safety: CPU Lock active
    unsafe { Traits::choose_running_task() };

    // Safety: CPU Lock active; the pointer is valid for the kernel's
    // lifetime
    let next: Option<&'static TaskCb<Traits>> = unsafe { *Traits::state().running_task_ptr() };
    let next_addr = next.map_or(0, |t| t as *const TaskCb<Traits> as usize);

    if next_addr == prev_addr {
        // No switch
        leave_cpu_lock::<Traits>();
        return;
    }

    log::trace!("dispatch: {:#x} -> {:#x}", prev_addr, next_addr);

    let next_gate = next.map(task_gate);

    leave_cpu_lock::<Traits>();

    if let Some(gate) = next_gate {
        gate.make_runnable();
    }

    let current = CURRENT_TASK.with(|c| c.get());
    if park_if_preempted && current != 0 && next_addr != current {
        // Safety: `current` was set by this thread's trampoline and points
        // to a pool slot, which is never deallocated
        let own = unsafe { &*(current as *const TaskCb<Traits>) };
        if !task_gate(own).wait_runnable() {
            // The task slot was recycled while this thread was parked
            park_forever();
        }
    }
}

pub fn yield_cpu<Traits: PortInstance>() {
    enter_cpu_lock::<Traits>();
    // Safety: CPU Lock was just entered; task threads may park here
    unsafe { dispatch::<Traits>(true) };
}

/// # Safety
///
/// CPU Lock active, boot context.
pub unsafe fn dispatch_first_task<Traits: PortInstance>() -> ! {
    log::trace!("dispatching the first task");
    // Safety: CPU Lock active; the boot thread isn't a task thread
    unsafe { dispatch::<Traits>(false) };

    // The boot thread now plays the idle loop. All further activity is
    // driven by the task threads and the tick thread.
    park_forever();
}

/// # Safety
///
/// CPU Lock active, called from the task thread being terminated.
pub unsafe fn exit_and_dispatch<Traits: PortInstance>(_task: &'static TaskCb<Traits>) -> ! {
    // Safety: CPU Lock active; the terminated task never runs again, so
    // don't park-and-resume — fall through to `park_forever`
    unsafe { dispatch::<Traits>(false) };
    park_forever();
}

fn park_forever() -> ! {
    loop {
        thread::park();
    }
}

/// # Safety
///
/// CPU Lock active; the task must be Dormant.
pub unsafe fn initialize_task_state<Traits: PortInstance>(task: &'static TaskCb<Traits>) {
    // Safety: CPU Lock active, the task slot is claimed
    let stack = unsafe { task.stack_region() };
    if !stack.is_null() && stack.len() > 0 {
        // Fill the (unused, on this port) stack region so the stack probe
        // reports it untouched
        // Safety: The region is a live, exclusively-owned buffer
        unsafe {
            core::ptr::write_bytes(stack.cast::<u8>(), STACK_FILL_BYTE, stack.len());
        }
    }

    let gate = Gate::new();
    if let Some(old) = task.port_task_state.gate.lock().replace(gate.clone()) {
        // The slot is being recycled; let the previous backing thread know
        old.cancel();
    }

    let task_addr = task as *const TaskCb<Traits> as usize;
    thread::Builder::new()
        .name("tern task".to_owned())
        .spawn(move || {
            CURRENT_TASK.with(|c| c.set(task_addr));

            if !gate.wait_runnable() {
                return;
            }

            // First dispatch: read the entry point, then enter the task
            // body with CPU Lock inactive, like an exception return
            enter_cpu_lock::<Traits>();
            // Safety: CPU Lock active, the task is initialized
            let (entry, arg) = unsafe { task.entry_point() };
            leave_cpu_lock::<Traits>();

            entry(arg);

            // The entry function returned; terminate the task
            // Safety: We are the task context being terminated
            unsafe { tern_kernel::task::exit_current_task::<Traits>() }
        })
        .expect("failed to spawn a task thread");
}

pub fn is_task_context<Traits: PortInstance>() -> bool {
    CURRENT_TASK.with(|c| c.get()) != 0 && !IN_INTERRUPT.with(|c| c.get())
}

pub fn is_interrupt_context<Traits: PortInstance>() -> bool {
    IN_INTERRUPT.with(|c| c.get())
}

// Tick source
// ---------------------------------------------------------------------------

pub fn time_interval_set<Traits: PortInstance>(us: u32) {
    let state = Traits::port_state();
    let mut timer = state.timer.lock().unwrap();
    timer.edge = Some(Instant::now());
    timer.interval_us = if us == TIME_FOREVER_US {
        TIME_FOREVER_US
    } else {
        us.clamp(MIN_INTERVAL_US, MAX_INTERVAL_US)
    };
    timer.generation += 1;
    drop(timer);
    state.timer_cv.notify_all();
}

pub fn time_elapsed_us<Traits: PortInstance>() -> u32 {
    let state = Traits::port_state();
    let timer = state.timer.lock().unwrap();
    timer
        .edge
        .map_or(0, |edge| edge.elapsed().as_micros().min(u32::MAX as u128) as u32)
}

pub fn time_enable<Traits: PortInstance>() {
    let state = Traits::port_state();
    state.timer.lock().unwrap().enabled = true;

    if !state.timer_thread_spawned.swap(true, Ordering::SeqCst) {
        thread::Builder::new()
            .name("tern tick".to_owned())
            .spawn(tick_thread_body::<Traits>)
            .expect("failed to spawn the tick thread");
    }
}

pub fn time_disable<Traits: PortInstance>() {
    let state = Traits::port_state();
    state.timer.lock().unwrap().enabled = false;
}

fn tick_thread_body<Traits: PortInstance>() {
    let state = Traits::port_state();
    loop {
        let mut timer = state.timer.lock().unwrap();

        let deadline = match (timer.enabled, timer.interval_us, timer.edge) {
            (true, us, Some(edge)) if us != TIME_FOREVER_US => {
                Some(edge + Duration::from_micros(us as u64))
            }
            _ => None,
        };

        match deadline {
            None => {
                // Nothing programmed; sleep until re-programmed
                drop(state.timer_cv.wait(timer).unwrap());
            }
            Some(deadline) => {
                let now = Instant::now();
                if deadline > now {
                    let generation = timer.generation;
                    let (t, _) = state
                        .timer_cv
                        .wait_timeout(timer, deadline - now)
                        .unwrap();
                    timer = t;
                    if timer.generation != generation {
                        // Re-programmed while sleeping; re-evaluate
                        continue;
                    }
                    if Instant::now() < deadline {
                        // Spurious wakeup
                        continue;
                    }
                }
                drop(timer);

                // Fire the tick "interrupt"
                IN_INTERRUPT.with(|c| c.set(true));
                // Safety: CPU Lock inactive on this thread, interrupt
                // context flag set
                unsafe { Traits::timer_tick() };
                IN_INTERRUPT.with(|c| c.set(false));
            }
        }
    }
}

// Entry points
// ---------------------------------------------------------------------------

/// Boot the kernel on the calling thread. Never returns; the calling thread
/// becomes the idle loop.
pub fn boot<Traits: PortInstance>() -> ! {
    let _ = env_logger::builder().is_test(true).try_init();

    enter_cpu_lock::<Traits>();
    // Safety: CPU Lock active, boot context, called once
    unsafe { <Traits as PortToKernel>::boot() }
}

/// Boot the kernel on a background thread and return once it's up. The
/// caller can then interact with the kernel from its threads. Subsequent
/// calls for the same kernel trait type only wait for the running state.
pub fn start_kernel<Traits: PortInstance>() {
    if !Traits::port_state()
        .boot_started
        .swap(true, Ordering::SeqCst)
    {
        thread::Builder::new()
            .name("tern boot".to_owned())
            .spawn(|| boot::<Traits>())
            .expect("failed to spawn the boot thread");
    }

    // Wait until the scheduler reports itself running
    while !tern_kernel::System::<Traits>::is_running() {
        thread::sleep(Duration::from_millis(1));
    }
}

/// Bind this port to a kernel trait type.
#[macro_export]
macro_rules! use_port {
    (impl $Traits:ty) => {
        const _: () = {
            static PORT_STATE: $crate::PortState = $crate::PortState::new();

            unsafe impl $crate::PortInstance for $Traits {
                fn port_state() -> &'static $crate::PortState {
                    &PORT_STATE
                }
            }

            unsafe impl $crate::tern_kernel::PortThreading for $Traits {
                type PortTaskState = $crate::TaskState;

                unsafe fn dispatch_first_task() -> ! {
                    // Safety: Forwarded preconditions
                    unsafe { $crate::dispatch_first_task::<$Traits>() }
                }

                unsafe fn yield_cpu() {
                    $crate::yield_cpu::<$Traits>();
                }

                unsafe fn exit_and_dispatch(
                    task: &'static $crate::tern_kernel::task::TaskCb<Self>,
                ) -> ! {
                    // Safety: Forwarded preconditions
                    unsafe { $crate::exit_and_dispatch::<$Traits>(task) }
                }

                unsafe fn enter_cpu_lock() {
                    $crate::enter_cpu_lock::<$Traits>();
                }

                unsafe fn leave_cpu_lock() {
                    $crate::leave_cpu_lock::<$Traits>();
                }

                unsafe fn initialize_task_state(
                    task: &'static $crate::tern_kernel::task::TaskCb<Self>,
                ) {
                    // Safety: Forwarded preconditions
                    unsafe { $crate::initialize_task_state::<$Traits>(task) }
                }

                fn is_cpu_lock_active() -> bool {
                    $crate::is_cpu_lock_active::<$Traits>()
                }

                fn is_task_context() -> bool {
                    $crate::is_task_context::<$Traits>()
                }

                fn is_interrupt_context() -> bool {
                    $crate::is_interrupt_context::<$Traits>()
                }
            }

            unsafe impl $crate::tern_kernel::PortTimer for $Traits {
                const MAX_INTERVAL_US: u32 = $crate::MAX_INTERVAL_US;

                unsafe fn time_interval_set(us: u32) {
                    $crate::time_interval_set::<$Traits>(us);
                }

                unsafe fn time_elapsed_us() -> u32 {
                    $crate::time_elapsed_us::<$Traits>()
                }

                unsafe fn time_enable() {
                    $crate::time_enable::<$Traits>();
                }

                unsafe fn time_disable() {
                    $crate::time_disable::<$Traits>();
                }
            }
        };
    };
}
