//! The public thread API.
//!
//! A thread is a task plus its user-facing metadata: entry point, stack,
//! name, user data. Threads are created at runtime from the task pool;
//! stacks are caller-supplied or carved out of the kernel heap.
use core::fmt;

use either::Either;

use crate::{
    error::{impl_postcode, WaitEndError},
    heap,
    klock::{self, CpuLockTokenRefMut},
    level_from_priority, priority_from_level,
    task::{self, ControlStatus, TaskCb, TaskRef, TaskSt},
    time::WaitTime,
    wait, Component, Id, KernelTraits, Priority, System, TimeoutMs,
};

use crate::task::readyqueue::Queue as _;

/// Identifies a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadId(pub(crate) Id);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitError {
    /// The priority is out of range, or the stack size is outside
    /// `STACK_SIZE_MINIMUM..=STACK_SIZE_MAXIMUM`.
    BadParam,
    /// The task pool is exhausted.
    NoSlot,
    /// The kernel heap couldn't supply the stack.
    OutOfMemory,
    BadContext,
}
impl_postcode!(InitError, Component::Thread, {
    BadParam => 3,
    NoSlot => 4,
    OutOfMemory => 5,
    BadContext => 2,
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpError {
    BadId,
    BadContext,
}
impl_postcode!(OpError, Component::Thread, {
    BadId => 1,
    BadContext => 2,
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspendError {
    /// The operation would leave no runnable task.
    LastRunnable,
    BadId,
    BadContext,
}
impl_postcode!(SuspendError, Component::Thread, {
    LastRunnable => 6,
    BadId => 1,
    BadContext => 2,
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepError {
    /// Zero duration.
    BadParam,
    /// The sleep was cut short by `thread_resume`.
    Interrupted,
    BadContext,
}
impl_postcode!(SleepError, Component::Thread, {
    BadParam => 3,
    Interrupted => available,
    BadContext => 2,
});

/// Look up a thread's control block, rejecting the kernel thread and free
/// slots.
fn task_cb_by_id<Traits: KernelTraits>(
    id: ThreadId,
    lock: CpuLockTokenRefMut<'_, Traits>,
) -> Result<&'static TaskCb<Traits>, OpError> {
    let cb = Traits::task_cb_pool()
        .get(id.0.get() - 1)
        .ok_or(OpError::BadId)?;
    let cs = cb.cs.get(&*lock);
    if cs.contains(ControlStatus::INITED) && !cs.contains(ControlStatus::KERNEL) {
        Ok(cb)
    } else {
        Err(OpError::BadId)
    }
}

/// Release the resources owned by a task: its expiration record, its
/// heap-allocated stack (if any), and its metadata.
pub(crate) fn release_task_resources<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task_cb: &'static TaskCb<Traits>,
) {
    task_cb.timeout.teardown(lock.borrow_mut());

    // Safety: CPU Lock active, as witnessed by `lock`
    let stack = unsafe {
        let stack = task_cb.stack.read();
        task_cb.stack.write(None);
        stack
    };
    if let Some(Either::Right(region)) = stack {
        if let Some(ptr) = core::ptr::NonNull::new(region.cast::<u8>()) {
            heap::free::<Traits>(lock.borrow_mut(), ptr);
        }
    }

    task_cb.name.replace(&mut *lock, "");
    // Safety: CPU Lock active, as witnessed by `lock`
    unsafe {
        task_cb.entry.write(None);
        task_cb.entry_arg.write(0);
    }
    task_cb.user_data.replace(&mut *lock, core::ptr::null_mut());
}

impl<Traits: KernelTraits> System<Traits> {
    /// Create a thread and make it Ready.
    ///
    /// `stack` may be a caller-supplied region; otherwise a stack of
    /// `stack_size` bytes (or the port default when `0`) is allocated from
    /// the kernel heap and returned to it when the thread is deleted.
    pub fn thread_init(
        entry: fn(usize),
        arg: usize,
        stack: Option<&'static mut [u8]>,
        stack_size: usize,
        priority: Priority,
        name: &'static str,
    ) -> Result<ThreadId, InitError> {
        let level = level_from_priority::<Traits>(priority).ok_or(InitError::BadParam)?;

        let mut lock = klock::CpuLockGuard::<Traits>::acquire().map_err(|_| InitError::BadContext)?;

        let stack_source = match stack {
            Some(region) => {
                if region.len() < Traits::STACK_SIZE_MINIMUM
                    || region.len() > Traits::STACK_SIZE_MAXIMUM
                {
                    return Err(InitError::BadParam);
                }
                Either::Left(region as *mut [u8])
            }
            None => {
                let size = if stack_size == 0 {
                    Traits::STACK_DEFAULT_SIZE
                } else {
                    stack_size
                };
                if size < Traits::STACK_SIZE_MINIMUM || size > Traits::STACK_SIZE_MAXIMUM {
                    return Err(InitError::BadParam);
                }
                let ptr = heap::allocate::<Traits>(lock.borrow_mut(), size)
                    .ok_or(InitError::OutOfMemory)?;
                Either::Right(core::ptr::slice_from_raw_parts_mut(ptr.as_ptr(), size))
            }
        };

        let Some((index, task_cb)) = task::claim_task_cb(lock.borrow_mut()) else {
            // Don't leak the stack we just allocated
            if let Either::Right(region) = stack_source {
                if let Some(ptr) = core::ptr::NonNull::new(region.cast::<u8>()) {
                    heap::free::<Traits>(lock.borrow_mut(), ptr);
                }
            }
            return Err(InitError::NoSlot);
        };

        task_cb.name.replace(&mut *lock.borrow_mut(), name);
        // Safety: CPU Lock active, as witnessed by `lock`
        unsafe {
            task_cb.entry.write(Some(entry));
            task_cb.entry_arg.write(arg);
            task_cb.stack.write(Some(stack_source));
        }
        task_cb.priority.replace(&mut *lock.borrow_mut(), priority);
        task_cb.base_level.replace(&mut *lock.borrow_mut(), level);
        task_cb
            .effective_level
            .replace(&mut *lock.borrow_mut(), level);
        task_cb
            .last_mutex_held
            .replace(&mut *lock.borrow_mut(), None);

        // Safety: CPU Lock active, the task is Dormant
        unsafe { Traits::initialize_task_state(task_cb) };
        // Safety: The task state was just initialized
        unsafe { task::make_ready(lock.borrow_mut(), task_cb) };

        // A new higher-priority thread preempts its creator (not before the
        // scheduler starts, though)
        if Traits::state().run.get(&*lock) {
            task::unlock_cpu_and_check_preemption(lock);
        }

        Ok(ThreadId(crate::cfg::id_from_index(index)))
    }

    /// The calling thread's own identifier.
    pub fn thread_current() -> Result<ThreadId, OpError> {
        let mut lock = klock::CpuLockGuard::<Traits>::acquire().map_err(|_| OpError::BadContext)?;
        let running = Traits::state()
            .running_task(lock.borrow_mut())
            .ok_or(OpError::BadContext)?;

        // Recover the pool index from the control block address
        let pool = Traits::task_cb_pool();
        let offset = running as *const TaskCb<Traits> as usize - pool.as_ptr() as usize;
        let index = offset / core::mem::size_of::<TaskCb<Traits>>();

        Ok(ThreadId(crate::cfg::id_from_index(index)))
    }

    /// Move a waiting or suspended thread back to Ready. No-op on a thread
    /// that is already runnable.
    pub fn thread_resume(id: ThreadId) -> Result<(), OpError> {
        let mut lock = klock::CpuLockGuard::<Traits>::acquire().map_err(|_| OpError::BadContext)?;
        let task_cb = task_cb_by_id(id, lock.borrow_mut())?;

        match task_cb.st.get(&*lock) {
            TaskSt::Waiting => {
                let woken = wait::interrupt_task(lock.borrow_mut(), task_cb, Ok(()));
                debug_assert!(woken);
                task::unlock_cpu_and_check_preemption(lock);
                Ok(())
            }
            TaskSt::Ready | TaskSt::Running => Ok(()),
            TaskSt::Dormant => Err(OpError::BadId),
        }
    }

    /// Park a thread until `thread_resume`. Suspending the last runnable
    /// thread is rejected.
    pub fn thread_suspend(id: ThreadId) -> Result<(), SuspendError> {
        let mut lock = klock::CpuLockGuard::<Traits>::acquire().map_err(|_| SuspendError::BadContext)?;
        let task_cb = task_cb_by_id(id, lock.borrow_mut()).map_err(|_| SuspendError::BadId)?;

        match task_cb.st.get(&*lock) {
            TaskSt::Running => {
                // Suspending the caller itself
                if !Traits::state()
                    .ready_queue()
                    .has_ready_task(lock.borrow_mut())
                {
                    return Err(SuspendError::LastRunnable);
                }
                let _ = wait::wait_no_queue(
                    lock.borrow_mut(),
                    wait::WaitPayload::Suspend,
                    None,
                );
                Ok(())
            }
            TaskSt::Ready => {
                // Park a peer: pull it out of the ready queue
                let level = task_cb.effective_level.get(&*lock);
                // Safety: The task is Ready, so it's in the queue at `level`
                unsafe {
                    Traits::state().ready_queue().remove_task(
                        lock.borrow_mut(),
                        TaskRef::new(task_cb),
                        level,
                    );
                }
                task_cb.st.replace(&mut *lock.borrow_mut(), TaskSt::Waiting);
                Ok(())
            }
            TaskSt::Waiting => Ok(()),
            TaskSt::Dormant => Err(SuspendError::BadId),
        }
    }

    /// Give up the processor until resumed. Unlike `thread_sleep` there is
    /// no timeout; unlike blocking on a primitive there is no condition —
    /// but another Ready task must exist to hand the processor to.
    pub fn thread_yield() -> Result<(), SuspendError> {
        let mut lock = klock::CpuLockGuard::<Traits>::acquire().map_err(|_| SuspendError::BadContext)?;
        task::expect_waitable_context::<Traits>().map_err(|_| SuspendError::BadContext)?;

        if !Traits::state()
            .ready_queue()
            .has_ready_task(lock.borrow_mut())
        {
            return Err(SuspendError::LastRunnable);
        }

        let _ = wait::wait_no_queue(lock.borrow_mut(), wait::WaitPayload::Suspend, None);
        Ok(())
    }

    /// Sleep for `duration`. Returns normally when the timeout fires;
    /// reports [`SleepError::Interrupted`] when cut short by
    /// `thread_resume`. A zero duration is rejected.
    pub fn thread_sleep(duration: TimeoutMs) -> Result<(), SleepError> {
        let delta_us = match duration.policy() {
            // A sleep must actually suspend; zero would be a no-op poll
            WaitTime::Poll => return Err(SleepError::BadParam),
            WaitTime::Finite(us) => Some(us),
            WaitTime::Forever => None,
        };

        let mut lock = klock::CpuLockGuard::<Traits>::acquire().map_err(|_| SleepError::BadContext)?;
        task::expect_waitable_context::<Traits>().map_err(|_| SleepError::BadContext)?;

        match wait::wait_no_queue(lock.borrow_mut(), wait::WaitPayload::Sleep, delta_us) {
            Err(WaitEndError::Timeout) => Ok(()),
            Ok(_) => Err(SleepError::Interrupted),
            Err(WaitEndError::Deleted) => unreachable!(),
        }
    }

    /// Destroy a thread: cancel its timeout, unlink it from every list,
    /// release its stack, and zero its control byte.
    ///
    /// Deleting the calling thread never returns. Deleting the last
    /// runnable thread is rejected.
    pub fn thread_delete(id: ThreadId) -> Result<(), SuspendError> {
        let mut lock = klock::CpuLockGuard::<Traits>::acquire().map_err(|_| SuspendError::BadContext)?;
        let task_cb = task_cb_by_id(id, lock.borrow_mut()).map_err(|_| SuspendError::BadId)?;

        match task_cb.st.get(&*lock) {
            TaskSt::Running => {
                if !Traits::state()
                    .ready_queue()
                    .has_ready_task(lock.borrow_mut())
                {
                    return Err(SuspendError::LastRunnable);
                }
                drop(lock);
                // Safety: `task_cb` is the running task, so this is the
                // caller's own context
                unsafe { task::exit_current_task::<Traits>() }
            }
            TaskSt::Ready => {
                let level = task_cb.effective_level.get(&*lock);
                // Safety: The task is Ready, so it's in the queue at `level`
                unsafe {
                    Traits::state().ready_queue().remove_task(
                        lock.borrow_mut(),
                        TaskRef::new(task_cb),
                        level,
                    );
                }
            }
            TaskSt::Waiting => {
                wait::abandon_wait(lock.borrow_mut(), task_cb);
            }
            TaskSt::Dormant => return Err(SuspendError::BadId),
        }

        crate::mutex::abandon_held_mutexes(lock.borrow_mut(), task_cb);
        release_task_resources(lock.borrow_mut(), task_cb);
        task_cb.st.replace(&mut *lock.borrow_mut(), TaskSt::Dormant);
        task_cb
            .cs
            .replace(&mut *lock.borrow_mut(), ControlStatus::empty());

        task::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// Attach an arbitrary pointer to a thread.
    pub fn thread_user_data_set(id: ThreadId, data: *mut ()) -> Result<(), OpError> {
        let mut lock = klock::CpuLockGuard::<Traits>::acquire().map_err(|_| OpError::BadContext)?;
        let task_cb = task_cb_by_id(id, lock.borrow_mut())?;
        task_cb.user_data.replace(&mut *lock.borrow_mut(), data);
        Ok(())
    }

    /// Read back a thread's user data pointer.
    pub fn thread_user_data_get(id: ThreadId) -> Result<*mut (), OpError> {
        let mut lock = klock::CpuLockGuard::<Traits>::acquire().map_err(|_| OpError::BadContext)?;
        let task_cb = task_cb_by_id(id, lock.borrow_mut())?;
        Ok(task_cb.user_data.get(&*lock))
    }

    /// Estimate the never-used portion of a thread's stack by scanning for
    /// the fill pattern.
    pub fn thread_stack_free_size_probe(id: ThreadId) -> Result<usize, OpError> {
        let mut lock = klock::CpuLockGuard::<Traits>::acquire().map_err(|_| OpError::BadContext)?;
        let task_cb = task_cb_by_id(id, lock.borrow_mut())?;

        // Safety: CPU Lock active, as witnessed by `lock`
        let region = match unsafe { task_cb.stack.read() } {
            Some(Either::Left(region)) | Some(Either::Right(region)) => region,
            None => return Err(OpError::BadId),
        };
        // Safety: The region was initialized by `initialize_task_state`
        Ok(unsafe { Traits::stack_free_size(region) })
    }

    /// A thread's name.
    pub fn thread_name(id: ThreadId) -> Result<&'static str, OpError> {
        let mut lock = klock::CpuLockGuard::<Traits>::acquire().map_err(|_| OpError::BadContext)?;
        let task_cb = task_cb_by_id(id, lock.borrow_mut())?;
        Ok(task_cb.name.get(&*lock))
    }

    /// A thread's configured (base) priority.
    pub fn thread_priority(id: ThreadId) -> Result<Priority, OpError> {
        let mut lock = klock::CpuLockGuard::<Traits>::acquire().map_err(|_| OpError::BadContext)?;
        let task_cb = task_cb_by_id(id, lock.borrow_mut())?;
        Ok(task_cb.priority.get(&*lock))
    }

    /// A thread's current effective priority — its base priority unless
    /// raised by priority inheritance.
    pub fn thread_effective_priority(id: ThreadId) -> Result<Priority, OpError> {
        let mut lock = klock::CpuLockGuard::<Traits>::acquire().map_err(|_| OpError::BadContext)?;
        let task_cb = task_cb_by_id(id, lock.borrow_mut())?;
        Ok(priority_from_level::<Traits>(
            task_cb.effective_level.get(&*lock),
        ))
    }

    /// A thread's scheduling timestamps (last pend/active/run and the
    /// accumulated running time).
    #[cfg(feature = "schedule_analysis")]
    pub fn thread_schedule_analyze(id: ThreadId) -> Result<task::CallAnalyze, OpError> {
        let mut lock = klock::CpuLockGuard::<Traits>::acquire().map_err(|_| OpError::BadContext)?;
        let task_cb = task_cb_by_id(id, lock.borrow_mut())?;
        Ok(task_cb.analyze.get(&*lock))
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "thread#{}", self.0)
    }
}
