//! Arm Cortex-M port for the Tern kernel (Armv7-M and later).
//!
//! # Exception usage
//!
//!  - **PendSV** (lowest priority) performs the context switch: it saves the
//!    outgoing task's callee-saved registers on its process stack, asks the
//!    kernel to choose the next running task, and restores that task's
//!    context. Pending PendSV from anywhere defers the switch to the end of
//!    interrupt processing.
//!  - **SVC** is the privilege gateway: `svc #2` dispatches a whitelisted
//!    privileged routine identified by a table index carried in `r0`, with
//!    the argument in `r1` and the result written back to the caller's
//!    stacked `r0`.
//!  - **SysTick** drives the kernel's timeout wheel through the
//!    free-running-down-counter contract of `PortTimer`.
//!
//! # Binding
//!
//! ```ignore
//! tern_kernel::static_kernel! { pub struct App; /* … */ }
//! tern_port_arm_m::use_port!(impl App);
//!
//! impl tern_port_arm_m::ThreadingOptions for App {}
//! impl tern_port_arm_m::SysTickOptions for App {
//!     const FREQUENCY: u64 = 48_000_000;
//! }
//! ```
#![no_std]

/// The configuration of the threading part of the port.
pub trait ThreadingOptions {
    /// The value to which `BASEPRI` is set during a critical section. `0`
    /// masks with `PRIMASK` instead, blocking every interrupt.
    const CPU_LOCK_PRIORITY_MASK: u8 = 0;

    /// Use the `WFI` instruction in the idle loop.
    const USE_WFI: bool = true;
}

/// The configuration of the SysTick-based tick source.
pub trait SysTickOptions {
    /// The processor (SysTick input) clock frequency, in hertz.
    const FREQUENCY: u64;

    /// The shortest honored tick interval, in microseconds. Programming a
    /// shorter interval (including zero) is clamped here to keep the tick
    /// interrupt from starving the rest of the system.
    const MIN_INTERVAL_US: u32 = 10;
}

#[cfg(target_os = "none")]
mod svc;
#[cfg(target_os = "none")]
mod systick;
#[cfg(target_os = "none")]
mod threading;

#[cfg(target_os = "none")]
pub use self::{svc::*, systick::*, threading::*};

/// Used by [`use_port!`].
#[doc(hidden)]
pub use tern_kernel;

/// Bind this port to a kernel trait type.
///
/// Emits the PendSV, SVCall, and SysTick handlers (overriding the weak
/// `cortex-m-rt` defaults), the per-instance port state, and the
/// [`PortThreading`]/[`PortTimer`] implementations.
///
/// The application must also implement [`ThreadingOptions`] and
/// [`SysTickOptions`] on the kernel trait type, and enter the kernel with
/// [`port_boot`] from its reset handler.
///
/// [`PortThreading`]: tern_kernel::PortThreading
/// [`PortTimer`]: tern_kernel::PortTimer
#[cfg(target_os = "none")]
#[macro_export]
macro_rules! use_port {
    (impl $Traits:ty) => {
        const _: () = {
            static PORT_STATE: $crate::State = $crate::State::new();

            unsafe impl $crate::PortInstance for $Traits {
                fn port_state() -> &'static $crate::State {
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
                    // Safety: Forwarded preconditions
                    unsafe { $crate::yield_cpu::<$Traits>() }
                }

                unsafe fn exit_and_dispatch(
                    task: &'static $crate::tern_kernel::task::TaskCb<Self>,
                ) -> ! {
                    // Safety: Forwarded preconditions
                    unsafe { $crate::exit_and_dispatch::<$Traits>(task) }
                }

                unsafe fn enter_cpu_lock() {
                    // Safety: Forwarded preconditions
                    unsafe { $crate::enter_cpu_lock::<$Traits>() }
                }

                unsafe fn leave_cpu_lock() {
                    // Safety: Forwarded preconditions
                    unsafe { $crate::leave_cpu_lock::<$Traits>() }
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
                const MAX_INTERVAL_US: u32 = 0x00ff_ffff;

                unsafe fn time_interval_set(us: u32) {
                    // Safety: Forwarded preconditions
                    unsafe { $crate::time_interval_set::<$Traits>(us) }
                }

                unsafe fn time_elapsed_us() -> u32 {
                    // Safety: Forwarded preconditions
                    unsafe { $crate::time_elapsed_us::<$Traits>() }
                }

                unsafe fn time_enable() {
                    // Safety: Forwarded preconditions
                    unsafe { $crate::time_enable::<$Traits>() }
                }

                unsafe fn time_disable() {
                    // Safety: Forwarded preconditions
                    unsafe { $crate::time_disable::<$Traits>() }
                }
            }

            /// The context-switch exception.
            ///
            /// Precondition: the exception was taken in Thread mode (PendSV
            /// runs at the lowest priority). If the interrupted context is a
            /// task, the exception frame went to PSP; if it is the idle
            /// task, to MSP.
            #[unsafe(naked)]
            #[no_mangle]
            unsafe extern "C" fn PendSV() {
                core::arch::naked_asm!(
                    "
                    # Save the context of the outgoing task:
                    #
                    #    [sp_cell] = psp - 40
                    #    [psp - 40] = {{lr (EXC_RETURN), control, r4-r11}}
                    ldr r0, ={state}
                    ldr r0, [r0, #{offset_running_task_ptr}]
                    ldr r1, [r0]
                    cbz r1, 0f
                    mrs r2, psp
                    mrs r3, control
                    subs r2, #40
                    str r2, [r1]
                    strd lr, r3, [r2], #8
                    stmia r2, {{r4-r11}}
                0:
                    # Choose the next task to run
                    mov r5, r0
                    bl {choose_next_task}
                    mov r0, r5

                    # Restore the context of the next task, or return to the
                    # idle task when there is none
                    ldr r1, [r0]
                    cbz r1, 1f
                    ldr r2, [r1]
                    ldrd lr, r3, [r2], #8
                    ldmia r2!, {{r4-r11}}
                    msr control, r3
                    msr psp, r2
                    bx lr
                1:
                    # 0xfffffff9: return to Thread mode, use MSP
                    movs r0, #0
                    mvn lr, #6
                    msr control, r0
                    bx lr
                    ",
                    state = sym PORT_STATE,
                    offset_running_task_ptr =
                        const $crate::State::OFFSET_RUNNING_TASK_PTR,
                    choose_next_task = sym $crate::choose_next_task::<$Traits>,
                )
            }

            /// The privilege gateway. Recovers the caller's exception frame
            /// and forwards it to the whitelist dispatcher.
            #[unsafe(naked)]
            #[no_mangle]
            unsafe extern "C" fn SVCall() {
                core::arch::naked_asm!(
                    "
                    tst lr, #4
                    ite eq
                    mrseq r0, msp
                    mrsne r0, psp
                    ldr r1, ={state}
                    b {handle_svc}
                    ",
                    state = sym PORT_STATE,
                    handle_svc = sym $crate::handle_svc,
                )
            }

            /// The tick interrupt.
            #[no_mangle]
            unsafe extern "C" fn SysTick() {
                // Safety: Interrupt context, CPU Lock inactive
                unsafe { $crate::handle_tick::<$Traits>() }
            }
        };
    };
}
