//! The threading implementation: CPU Lock, context management, and the
//! dispatcher entry points. The exception handlers themselves are emitted by
//! [`use_port!`] because they must be nameable symbols in the application
//! binary; everything they call lives here.
//!
//! [`use_port!`]: crate::use_port
use core::{
    cell::UnsafeCell,
    mem::{offset_of, MaybeUninit},
    slice,
    sync::atomic::{compiler_fence, Ordering},
};

use tern_kernel::{task::TaskCb, KernelTraits, PortToKernel, STACK_FILL_BYTE};

use crate::ThreadingOptions;

/// Implemented on a kernel trait type by [`use_port!`].
///
/// # Safety
///
/// Only meant to be implemented by [`use_port!`].
///
/// [`use_port!`]: crate::use_port
pub unsafe trait PortInstance:
    KernelTraits + tern_kernel::PortThreading<PortTaskState = TaskState> + ThreadingOptions
{
    fn port_state() -> &'static State;
}

/// The per-instance state of the port, reachable from the exception
/// handlers.
#[repr(C)]
pub struct State {
    /// Caches `Traits::state().running_task_ptr()` so the PendSV handler can
    /// reach it without a function call. Assigned by
    /// [`dispatch_first_task`]. The pointee type is
    /// `Option<&'static TaskCb<Traits>>`.
    pub(crate) running_task_ptr: UnsafeCell<*mut ()>,

    /// The SVC gateway whitelist (see [`crate::svc`]).
    pub(crate) svc_table: crate::SvcTable,

    /// SysTick bookkeeping (see [`crate::systick`]).
    pub(crate) systick: crate::SysTickState,
}

impl State {
    /// Used by the PendSV handler emitted by `use_port!`.
    pub const OFFSET_RUNNING_TASK_PTR: usize = offset_of!(State, running_task_ptr);

    #[allow(clippy::new_without_default)]
    pub const fn new() -> Self {
        Self {
            running_task_ptr: UnsafeCell::new(core::ptr::null_mut()),
            svc_table: crate::SvcTable::new(),
            systick: crate::SysTickState::new(),
        }
    }
}

// Safety: The contents are only accessed with CPU Lock active or from the
// (non-reentrant) exception handlers
unsafe impl Sync for State {}

/// Port-specific per-task state: the saved process stack pointer.
///
/// Placed at offset 0 of `TaskCb` so the PendSV handler can store and load
/// it with a single indexed access.
#[derive(Debug)]
#[repr(C)]
pub struct TaskState {
    sp: UnsafeCell<u32>,
}

// Safety: Only accessed by the dispatcher
unsafe impl Sync for TaskState {}

impl tern_kernel::utils::Init for TaskState {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        sp: UnsafeCell::new(0),
    };
}

/// Enter the boot context: configure exception priorities and hand control
/// to the kernel.
///
/// # Safety
///
/// Thread mode, interrupts enabled, called once from reset.
pub unsafe fn port_boot<Traits: PortInstance>() -> ! {
    unsafe { enter_cpu_lock::<Traits>() };

    // Claim the ownership of `Peripherals`
    let mut peripherals = unsafe { cortex_m::Peripherals::steal() };

    // PendSV and SVCall run at the lowest priority so that a dispatch never
    // preempts an interrupt handler
    // Safety: We don't make "priority-based critical sections"
    unsafe {
        peripherals
            .SCB
            .set_priority(cortex_m::peripheral::scb::SystemHandler::SVCall, 0xff);
        peripherals
            .SCB
            .set_priority(cortex_m::peripheral::scb::SystemHandler::PendSV, 0xff);
    }

    // Safety: We are a port, so it's okay to call this
    unsafe { <Traits as PortToKernel>::boot() }
}

/// # Safety
///
/// CPU Lock active, boot context.
pub unsafe fn dispatch_first_task<Traits: PortInstance>() -> ! {
    let state = Traits::port_state();
    unsafe {
        *state.running_task_ptr.get() = Traits::state().running_task_ptr() as *mut ();
    }

    // Pend PendSV
    cortex_m::peripheral::SCB::set_pendsv();

    // Discard the current context and transfer the control to the idle
    // task. We have pended PendSV, so the dispatcher will kick in as soon
    // as the idle task releases CPU Lock.
    //
    // Safety: `CONTROL.SPSEL == 0`, Thread mode (entailed by the boot
    // context), CPU Lock active
    unsafe { idle_task::<Traits>() }
}

/// Reset MSP to the top of the interrupt stack, release CPU Lock, and start
/// executing the idle loop.
///
/// # Safety
///
/// `CONTROL.SPSEL == 0`, Thread mode, CPU Lock active.
#[inline(never)]
pub unsafe extern "C" fn idle_task<Traits: PortInstance>() -> ! {
    extern "C" {
        // Provided by `cortex-m-rt`: the initial (interrupt) stack top
        static _stack_start: u32;
    }
    let msp_top = unsafe { &_stack_start as *const u32 as u32 };

    // The idle loop lives inside the asm block: once MSP is reset, this
    // function's frame no longer exists, so control must never return to
    // compiler-generated code.
    if Traits::USE_WFI {
        unsafe {
            core::arch::asm!(
                "
                # Reset MSP to the top of the stack, effectively discarding
                # the current context. Beyond this point, this code is
                # considered to be running in the idle task.
                #
                # The idle task uses MSP as its stack.
                mov sp, {msp_top}

                # Release CPU Lock
                movs r0, #0
                msr basepri, r0
                cpsie i

            0:
                wfi
                b 0b
                ",
                msp_top = in(reg) msp_top,
                options(noreturn),
            );
        }
    } else {
        unsafe {
            core::arch::asm!(
                "
                mov sp, {msp_top}
                movs r0, #0
                msr basepri, r0
                cpsie i

            0:
                b 0b
                ",
                msp_top = in(reg) msp_top,
                options(noreturn),
            );
        }
    }
}

/// # Safety
///
/// CPU Lock inactive.
pub unsafe fn yield_cpu<Traits: PortInstance>() {
    // Ensure preceding memory operations are visible to the PendSV handler
    compiler_fence(Ordering::Release);

    cortex_m::peripheral::SCB::set_pendsv();

    // Technically this DSB isn't required for correctness, but ensures
    // PendSV is taken before the next operation.
    cortex_m::asm::dsb();

    // Ensure the PendSV handler's memory operations are visible to us
    compiler_fence(Ordering::Acquire);
}

/// # Safety
///
/// CPU Lock active, task context; the current task never runs again.
pub unsafe fn exit_and_dispatch<Traits: PortInstance>(_task: &'static TaskCb<Traits>) -> ! {
    // Pend PendSV
    cortex_m::peripheral::SCB::set_pendsv();

    unsafe {
        core::arch::asm!(
            "
            # Activate the idle task's context by switching the current SP
            # to MSP. `running_task` is `None` at this point, so the
            # processor state will be consistent with `running_task` after
            # this operation.
            mrs r0, control
            subs r0, #2
            msr control, r0

            # Transfer the control to the idle task. We have pended PendSV,
            # so the dispatcher will kick in as soon as the idle task
            # releases CPU Lock.
            b {idle_task}
            ",
            idle_task = sym idle_task::<Traits>,
            options(noreturn),
        );
    }
}

/// Called by the PendSV handler to run the scheduling decision.
pub extern "C" fn choose_next_task<Traits: PortInstance>() {
    unsafe { enter_cpu_lock::<Traits>() };
    // Safety: CPU Lock active
    unsafe { Traits::choose_running_task() };
    unsafe { leave_cpu_lock::<Traits>() };
}

/// # Safety
///
/// Only meant to be called by the kernel.
#[inline(always)]
pub unsafe fn enter_cpu_lock<Traits: PortInstance>() {
    if Traits::CPU_LOCK_PRIORITY_MASK > 0 {
        // Set `BASEPRI` to `CPU_LOCK_PRIORITY_MASK`
        unsafe { cortex_m::register::basepri::write(Traits::CPU_LOCK_PRIORITY_MASK) };
        compiler_fence(Ordering::Acquire);
        return;
    }

    // Set `PRIMASK` to `1`
    cortex_m::interrupt::disable();
}

/// # Safety
///
/// Only meant to be called by the kernel.
#[inline(always)]
pub unsafe fn leave_cpu_lock<Traits: PortInstance>() {
    if Traits::CPU_LOCK_PRIORITY_MASK > 0 {
        compiler_fence(Ordering::Release);
        // Set `BASEPRI` to `0` (no masking)
        unsafe { cortex_m::register::basepri::write(0) };
        return;
    }

    // Set `PRIMASK` to `0`
    unsafe { cortex_m::interrupt::enable() };
}

#[inline(always)]
pub fn is_cpu_lock_active<Traits: PortInstance>() -> bool {
    if Traits::CPU_LOCK_PRIORITY_MASK > 0 {
        return cortex_m::register::basepri::read() != 0;
    }

    cortex_m::register::primask::read().is_inactive()
}

pub fn is_task_context<Traits: PortInstance>() -> bool {
    // All tasks use PSP. The idle task is the exception, but user code
    // cannot run in the idle task, so we can ignore this.
    cortex_m::register::control::read().spsel() == cortex_m::register::control::Spsel::Psp
}

#[inline]
pub fn is_interrupt_context<Traits: PortInstance>() -> bool {
    // `IPSR.Exception != 0`
    let ipsr: u32;
    unsafe {
        core::arch::asm!(
            "mrs {}, ipsr",
            out(reg) ipsr,
            options(nomem, preserves_flags, nostack),
        );
    }
    (ipsr & ((1u32 << 9) - 1)) != 0
}

/// Build the initial context of a task so that the first dispatch enters its
/// entry function in Thread mode on PSP, and a return from the entry
/// function terminates the task.
///
/// # Safety
///
/// CPU Lock active; the task is not running.
pub unsafe fn initialize_task_state<Traits: PortInstance>(task: &'static TaskCb<Traits>) {
    // Safety: CPU Lock active, the slot is claimed
    let stack = unsafe { task.stack_region() };
    let (entry, entry_arg) = unsafe { task.entry_point() };

    // Fill the stack for the usage probe
    // Safety: The region is a live, exclusively-owned buffer
    unsafe { core::ptr::write_bytes(stack.cast::<u8>(), STACK_FILL_BYTE, stack.len()) };

    let mut sp = stack
        .cast::<u8>()
        .wrapping_add(stack.len() & !7usize)
        .cast::<MaybeUninit<u32>>();

    // Exception frame (automatically saved and restored as part of the
    // architecturally-defined exception entry/return sequence)
    let exc_frame = unsafe {
        sp = sp.wrapping_sub(8);
        slice::from_raw_parts_mut(sp, 8)
    };

    // R0: Parameter to the entry point
    exc_frame[0] = MaybeUninit::new(entry_arg as u32);
    // R1-R3, R12: Uninitialized (they carry the fill pattern)
    // LR: The return address — terminate the task when the entry returns
    exc_frame[5] = MaybeUninit::new(exit_trampoline::<Traits> as usize as u32);
    // PC: The entry point. The function pointer has its LSB set to signify
    // a Thumb function; in an exception frame the bit must be clear to
    // represent the exact program counter value.
    exc_frame[6] = MaybeUninit::new(entry as usize as u32 & !1);
    // xPSR: T bit set
    exc_frame[7] = MaybeUninit::new(0x01000000);

    // Extra context (saved and restored by the dispatcher)
    let extra_ctx = unsafe {
        sp = sp.wrapping_sub(10);
        slice::from_raw_parts_mut(sp, 10)
    };

    // EXC_RETURN: “Return to Thread mode; exception return gets state from
    // the process stack; on return execution uses the process stack.”
    extra_ctx[0] = MaybeUninit::new(0xfffffffd);
    // CONTROL: SPSEL = 1 (use PSP); nPRIV per the build option
    extra_ctx[1] = MaybeUninit::new(if cfg!(feature = "unprivileged-threads") {
        0x00000003
    } else {
        0x00000002
    });
    // R4-R11: Uninitialized
    // TODO: Allocate room for S16-S31 and set `EXC_RETURN.FType`
    //       conditionally once FP context preservation is implemented

    let task_state = &task.port_task_state;
    unsafe { *task_state.sp.get() = sp as usize as u32 };
}

/// The LR target of a freshly-initialized task frame.
extern "C" fn exit_trampoline<Traits: PortInstance>() -> ! {
    // Safety: Called on the returning task's own context
    unsafe { tern_kernel::task::exit_current_task::<Traits>() }
}
