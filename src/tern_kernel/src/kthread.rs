//! The kernel housekeeping thread.
//!
//! Work that must not run in interrupt context — software-timer user
//! callbacks and publish/subscribe notifications — is queued on a fixed-
//! capacity deferred-callback list and executed by a dedicated kernel
//! thread. The thread runs at the reserved level above all application
//! priorities (cooperation slots included), so a queued callback runs as
//! soon as the queuing interrupt returns.
use arrayvec::ArrayVec;
use core::fmt;

use crate::{
    klock::{self, CpuLockCell, CpuLockTokenRefMut},
    task::{self, ControlStatus, TaskCb, TaskSt},
    utils::Init,
    wait, KernelTraits, KERNEL_THREAD_LEVEL,
};

/// The capacity of the deferred-callback list. Callbacks queued while the
/// list is full are dropped; the capacity is sized generously against the
/// timer pool limit.
pub(crate) const DEFERRED_CAPACITY: usize = 16;

/// A queued callback, held by value so that the queuing object may vanish
/// before the call runs (temporary timers do).
#[derive(Clone, Copy)]
pub(crate) struct DeferredCall {
    pub func: fn(usize),
    pub arg: usize,
}

/// Deferred-callback state, part of the kernel [`State`].
///
/// [`State`]: crate::State
pub(crate) struct DeferredGlobals<Traits: KernelTraits> {
    queue: CpuLockCell<Traits, ArrayVec<DeferredCall, DEFERRED_CAPACITY>>,

    /// The kernel thread's control block, once created.
    kthread: CpuLockCell<Traits, Option<&'static TaskCb<Traits>>>,

    /// Set by [`notify`]; cleared by the kernel thread before parking.
    /// Guards against a notification arriving while the thread is draining.
    signaled: CpuLockCell<Traits, bool>,
}

impl<Traits: KernelTraits> Init for DeferredGlobals<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        queue: Init::INIT,
        kthread: Init::INIT,
        signaled: Init::INIT,
    };
}

impl<Traits: KernelTraits> fmt::Debug for DeferredGlobals<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("DeferredGlobals")
    }
}

/// Queue a callback for execution by the kernel thread. Call [`notify`]
/// afterwards (once per batch).
pub(crate) fn push_deferred<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    call: DeferredCall,
) {
    let queue = Traits::state().deferred.queue.write(&mut *lock);
    // A full list drops the callback; timers keep firing, so a stall here
    // resolves itself once the kernel thread catches up
    let _ = queue.try_push(call);
}

/// Wake the kernel thread to drain the deferred-callback list.
///
/// This may make the kernel thread Ready, but doesn't yield the processor.
/// Call [`task::unlock_cpu_and_check_preemption`] as needed.
pub(crate) fn notify<Traits: KernelTraits>(mut lock: CpuLockTokenRefMut<'_, Traits>) {
    let g = &Traits::state().deferred;
    g.signaled.replace(&mut *lock, true);

    if let Some(kthread) = g.kthread.get(&*lock) {
        if kthread.st.get(&*lock) == TaskSt::Waiting {
            let woken = wait::interrupt_task(lock, kthread, Ok(()));
            debug_assert!(woken);
        }
    }
}

/// Create the kernel thread at boot. Claims a slot of the task pool.
pub(crate) fn create_kernel_thread<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
) {
    let (_, task_cb) =
        task::claim_task_cb(lock.borrow_mut()).expect("the task pool has no room for the kernel thread");

    task_cb.cs.replace(
        &mut *lock,
        ControlStatus::INITED | ControlStatus::KERNEL,
    );
    task_cb.name.replace(&mut *lock, "tern.kthread");
    // Safety: CPU Lock active, as witnessed by `lock`
    unsafe {
        task_cb.entry.write(Some(body::<Traits> as fn(usize)));
        task_cb.entry_arg.write(0);
        task_cb
            .stack
            .write(Some(either::Either::Left(Traits::kernel_stack())));
    }
    task_cb.base_level.replace(&mut *lock, KERNEL_THREAD_LEVEL);
    task_cb
        .effective_level
        .replace(&mut *lock, KERNEL_THREAD_LEVEL);

    Traits::state().deferred.kthread.replace(&mut *lock, Some(task_cb));

    // Safety: CPU Lock active, the task is Dormant
    unsafe { Traits::initialize_task_state(task_cb) };
    // Safety: The task state was just initialized
    unsafe { task::make_ready(lock, task_cb) };
}

/// The kernel thread body: run queued callbacks, then park until notified.
fn body<Traits: KernelTraits>(_: usize) {
    loop {
        let mut lock = klock::CpuLockGuard::<Traits>::acquire().unwrap();
        let g = &Traits::state().deferred;

        // Drain the list, releasing CPU Lock around each call
        loop {
            let call = {
                let queue = g.queue.write(&mut *lock);
                if queue.is_empty() {
                    None
                } else {
                    Some(queue.remove(0))
                }
            };
            let Some(DeferredCall { func, arg }) = call else {
                break;
            };
            drop(lock);
            func(arg);
            lock = klock::CpuLockGuard::<Traits>::acquire().unwrap();
        }

        // Park unless a notification arrived while draining
        if !g.signaled.replace(&mut *lock.borrow_mut(), false) {
            let _ = wait::wait_no_queue(lock.borrow_mut(), wait::WaitPayload::Suspend, None);
        }
        drop(lock);
    }
}
