//! The SVC privilege gateway.
//!
//! `svc #2` transfers control to the SVC handler with a table index in `r0`
//! and an argument in `r1`. The handler recovers the caller's stacked
//! exception frame (MSP or PSP depending on the caller's mode), validates
//! the SVC immediate, looks the index up in the *whitelist* of registered
//! privileged routines, invokes the routine, and writes its result back to
//! the frame's `r0`, where the caller picks it up after the exception
//! return.
//!
//! Dispatching by table index rather than by a function pointer read from
//! the caller's registers keeps unprivileged code from steering the kernel
//! to an arbitrary address.
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::PortInstance;

/// The SVC immediate used by the gateway. Other immediates are ignored.
pub const SVC_GATEWAY: u8 = 2;

/// A privileged routine reachable through the gateway.
pub type PrivilegedFn = unsafe extern "C" fn(usize) -> i32;

const SVC_TABLE_LEN: usize = 8;

/// The whitelist of privileged routines.
pub struct SvcTable {
    entries: [AtomicUsize; SVC_TABLE_LEN],
    len: AtomicUsize,
}

impl SvcTable {
    #[allow(clippy::new_without_default)]
    pub const fn new() -> Self {
        #[allow(clippy::declare_interior_mutable_const)]
        const NULL: AtomicUsize = AtomicUsize::new(0);
        Self {
            entries: [NULL; SVC_TABLE_LEN],
            len: AtomicUsize::new(0),
        }
    }
}

/// The result delivered when an SVC request names no registered routine.
pub const SVC_BAD_CALL: i32 = i32::MIN;

/// Register a privileged routine, returning the index to pass in `r0` of
/// `svc #2`. Returns `None` when the table is full.
pub fn svc_whitelist_register<Traits: PortInstance>(f: PrivilegedFn) -> Option<usize> {
    let table = &Traits::port_state().svc_table;
    let index = table.len.fetch_add(1, Ordering::Relaxed);
    if index >= SVC_TABLE_LEN {
        table.len.store(SVC_TABLE_LEN, Ordering::Relaxed);
        return None;
    }
    table.entries[index].store(f as usize, Ordering::Release);
    Some(index)
}

/// Invoke a registered privileged routine from the current context.
///
/// In handler mode, or when threads run privileged, the routine is called
/// directly; otherwise the call goes through `svc #2`.
pub fn privilege_invoke<Traits: PortInstance>(index: usize, arg: usize) -> i32 {
    if cfg!(feature = "unprivileged-threads") && !crate::is_interrupt_context::<Traits>() {
        kernel_svc_call(index, arg, 0, 0)
    } else {
        let table = &Traits::port_state().svc_table;
        let Some(entry) = table.entries.get(index) else {
            return SVC_BAD_CALL;
        };
        let raw = entry.load(Ordering::Acquire);
        if raw == 0 {
            return SVC_BAD_CALL;
        }
        // Safety: The entry was registered from a `PrivilegedFn`
        let f: PrivilegedFn = unsafe { core::mem::transmute(raw) };
        unsafe { f(arg) }
    }
}

/// Issue `svc #2` with up to four arguments in `r0`–`r3`. Only `r0` (the
/// table index) and `r1` (the routine argument) are interpreted by the
/// gateway.
#[inline]
pub fn kernel_svc_call(a0: usize, a1: usize, a2: usize, a3: usize) -> i32 {
    let result: i32;
    unsafe {
        core::arch::asm!(
            "svc #2",
            inlateout("r0") a0 => result,
            in("r1") a1,
            in("r2") a2,
            in("r3") a3,
            options(nostack),
        );
    }
    result
}

/// The Rust half of the SVC handler. `frame` points to the caller's stacked
/// exception frame; `state` is the port state emitted by `use_port!`.
///
/// # Safety
///
/// Only meant to be called by the SVC handler with a valid frame and state
/// pointer.
pub unsafe extern "C" fn handle_svc(frame: *mut u32, state: *const crate::State) {
    // Safety: `state` is the address of the static port state
    let state = unsafe { &*state };
    // Recover the SVC immediate from the instruction preceding the stacked
    // return address; ignore anything but the gateway number
    // Safety: The frame was stacked by the exception entry sequence
    let pc = unsafe { frame.add(6).read() };
    let imm = unsafe { ((pc - 2) as *const u8).read() };
    if imm != SVC_GATEWAY {
        return;
    }

    let index = unsafe { frame.read() } as usize;
    let arg = unsafe { frame.add(1).read() } as usize;

    let result = 'call: {
        let Some(entry) = state.svc_table.entries.get(index) else {
            break 'call SVC_BAD_CALL;
        };
        let raw = entry.load(Ordering::Acquire);
        if raw == 0 {
            break 'call SVC_BAD_CALL;
        }
        // Safety: The entry was registered from a `PrivilegedFn`
        let f: PrivilegedFn = unsafe { core::mem::transmute(raw) };
        unsafe { f(arg) }
    };

    // The caller reads the result from `r0` after the exception return
    unsafe { frame.write(result as u32) };
}
