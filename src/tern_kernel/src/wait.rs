//! The blocking protocol shared by all waitable primitives.
//!
//! A blocking operation constructs a *wait object* on the waiting task's
//! stack, inserts it into the primitive's wait queue (ordered by effective
//! task priority, ties first-in first-out), optionally arms the task's
//! embedded expiration record, and parks the task. A completing operation —
//! the *wake-upper* — removes the wait object, performs the primitive-
//! specific completion against the wait payload (delivering a queue element,
//! handing over a pool slot, reporting event bits), stores the wait result,
//! and makes the task Ready again. When the waiting task resumes, the
//! payload — possibly filled in by the wake-upper — is handed back to the
//! operation that started the wait.
use core::{cell::Cell, fmt, ptr::NonNull};

use crate::{
    error::WaitEndError,
    event::EventReport,
    klock::{CpuLockCell, CpuLockTokenRef, CpuLockTokenRefMut},
    mutex, task,
    task::{TaskCb, TaskSt},
    timeout,
    utils::{
        list::{self, Link, ListItem},
        Init,
    },
    KernelTraits,
};

/// A reference to a [`Wait`].
pub(crate) struct WaitRef<Traits: KernelTraits>(NonNull<Wait<Traits>>);

// Safety: `Wait` is only accessed with CPU Lock active
unsafe impl<Traits: KernelTraits> Send for WaitRef<Traits> {}
unsafe impl<Traits: KernelTraits> Sync for WaitRef<Traits> {}

impl<Traits: KernelTraits> Clone for WaitRef<Traits> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<Traits: KernelTraits> Copy for WaitRef<Traits> {}

impl<Traits: KernelTraits> PartialEq for WaitRef<Traits> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}
impl<Traits: KernelTraits> Eq for WaitRef<Traits> {}

impl<Traits: KernelTraits> fmt::Debug for WaitRef<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("WaitRef").field(&self.0).finish()
    }
}

impl<Traits: KernelTraits> ListItem<Traits> for WaitRef<Traits> {
    unsafe fn link<'a>(self) -> &'a CpuLockCell<Traits, Link<Self>> {
        // Safety: A `WaitRef` only exists while its pointee is linked or
        // being (un)linked, and a `Wait` is never dropped while linked
        unsafe { &(*self.0.as_ptr()).link }
    }
}

/// *A wait object* describing *which task* is waiting on *what condition*.
///
/// # Lifetime
///
/// This object is constructed by [`WaitQueue::wait`] on a waiting task's
/// stack and only survives until the method returns. This means a `Wait` can
/// expire only when the waiting task is not waiting anymore. It never moves
/// while linked: it's a plain local of the frame that blocks on it.
struct Wait<Traits: KernelTraits> {
    /// The task that is waiting for something.
    task: &'static TaskCb<Traits>,

    /// Forms a linked list headed by `WaitQueue::waits`.
    link: CpuLockCell<Traits, Link<WaitRef<Traits>>>,

    /// The containing [`WaitQueue`], if any.
    wait_queue: Option<&'static WaitQueue<Traits>>,

    payload: WaitPayload<Traits>,
}

/// Additional information included in a [`Wait`], specific to waitable
/// object types. The wake-upper reads this to perform the primitive-specific
/// part of the completion.
pub(crate) enum WaitPayload<Traits: KernelTraits> {
    Semaphore,
    Mutex(&'static mutex::MutexCb<Traits>),
    EventWait {
        listen: u32,
        /// The wake-upper stores the reported trigger bits and the committed
        /// value here.
        out: CpuLockCell<Traits, Cell<EventReport>>,
    },
    /// A sender blocked on a full message queue. The wake-upper copies
    /// `len` bytes from `buf` directly into the queue storage, so the send
    /// completes atomically with the wake.
    QueueSend {
        buf: *const u8,
        len: usize,
        to_front: bool,
    },
    /// A receiver blocked on an empty message queue. The wake-upper copies
    /// the element directly into `buf`.
    QueueRecv {
        buf: *mut u8,
        len: usize,
        from_back: bool,
    },
    /// A taker blocked on an exhausted memory pool. The wake-upper hands
    /// over the freed slot through `out`.
    PoolTake {
        out: CpuLockCell<Traits, Cell<Option<NonNull<u8>>>>,
    },
    /// `thread_sleep`.
    Sleep,
    /// `thread_suspend`, `thread_yield`, or the kernel thread parked with
    /// nothing to do.
    Suspend,
}

/// The wait state of a task.
pub(crate) struct TaskWait<Traits: KernelTraits> {
    /// The wait object describing the ongoing Waiting state of the task.
    /// `None` iff the task is not in the Waiting state.
    current_wait: CpuLockCell<Traits, Option<WaitRef<Traits>>>,

    /// The result of the last wait operation, set by a wake-upper.
    wait_result: CpuLockCell<Traits, Result<(), WaitEndError>>,
}

impl<Traits: KernelTraits> Init for TaskWait<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        current_wait: Init::INIT,
        wait_result: CpuLockCell::new(Ok(())),
    };
}

impl<Traits: KernelTraits> fmt::Debug for TaskWait<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TaskWait")
            .field("wait_result", &self.wait_result)
            .finish_non_exhaustive()
    }
}

/// A queue of wait objects ([`Wait`]) waiting on a particular waitable
/// object.
pub(crate) struct WaitQueue<Traits: KernelTraits> {
    /// All elements of this linked list must be valid. The waiting tasks
    /// (`Wait::task`) must be in the Waiting state.
    waits: CpuLockCell<Traits, list::ListHead<WaitRef<Traits>>>,
}

impl<Traits: KernelTraits> Init for WaitQueue<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self { waits: Init::INIT };
}

impl<Traits: KernelTraits> fmt::Debug for WaitQueue<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("WaitQueue")
    }
}

impl<Traits: KernelTraits> WaitQueue<Traits> {
    /// Insert a wait object pertaining to the currently running task to
    /// `self`, transitioning the task into the Waiting state. Blocks
    /// indefinitely until a wake-upper releases the task.
    ///
    /// The current context must be a task context (this function doesn't
    /// check that).
    ///
    /// On success, the payload — possibly updated by the wake-upper — is
    /// returned.
    #[inline]
    pub(crate) fn wait(
        &'static self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        payload: WaitPayload<Traits>,
    ) -> Result<WaitPayload<Traits>, WaitEndError> {
        let task = Traits::state().running_task(lock.borrow_mut()).unwrap();
        let wait = Wait {
            task,
            link: Init::INIT,
            wait_queue: Some(self),
            payload,
        };

        wait_inner(lock, &wait, None)?;

        Ok(wait.payload)
    }

    /// Like [`Self::wait`], but the operation times out after `delta_us`
    /// microseconds, delivered through the task's embedded expiration
    /// record.
    #[inline]
    pub(crate) fn wait_timeout(
        &'static self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        payload: WaitPayload<Traits>,
        delta_us: u64,
    ) -> Result<WaitPayload<Traits>, WaitEndError> {
        let task = Traits::state().running_task(lock.borrow_mut()).unwrap();
        let wait = Wait {
            task,
            link: Init::INIT,
            wait_queue: Some(self),
            payload,
        };

        wait_inner(lock, &wait, Some(delta_us))?;

        Ok(wait.payload)
    }

    /// Get the next waiting task to be woken up.
    pub(crate) fn first_waiting_task(
        &self,
        lock: CpuLockTokenRefMut<'_, Traits>,
    ) -> Option<&'static TaskCb<Traits>> {
        self.waits
            .read(&*lock)
            .first()
            // Safety: The wait object is linked, hence valid
            .map(|r| unsafe { r.0.as_ref() }.task)
    }

    /// Wake up up to one waiting task. Returns `true` if it has successfully
    /// woken up a task.
    ///
    /// This method may make a task Ready, but doesn't yield the processor.
    /// Call [`task::unlock_cpu_and_check_preemption`] as needed.
    pub(crate) fn wake_up_one(&self, lock: CpuLockTokenRefMut<'_, Traits>) -> bool {
        self.wake_up_one_by(lock, |_, _| ()).is_some()
    }

    /// Wake up up to one waiting task, giving `f` a chance to perform the
    /// primitive-specific completion against the wait payload before the
    /// task is released.
    pub(crate) fn wake_up_one_by<R>(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        f: impl FnOnce(&WaitPayload<Traits>, CpuLockTokenRefMut<'_, Traits>) -> R,
    ) -> Option<R> {
        let wait_ref = list::pop_front(&self.waits, lock.borrow_mut())?;

        // Safety: `wait_ref` was in `self.waits`, hence the pointee is valid
        // until its task resumes, which can't happen while we hold CPU Lock
        let wait = unsafe { wait_ref.0.as_ref() };

        let r = f(&wait.payload, lock.borrow_mut());

        complete_wait(lock, wait, Ok(()));

        Some(r)
    }

    /// Wake up all waiting tasks with the specified wait result.
    ///
    /// This method may make tasks Ready, but doesn't yield the processor.
    /// Call [`task::unlock_cpu_and_check_preemption`] as needed.
    pub(crate) fn wake_up_all(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        wait_result: Result<(), WaitEndError>,
    ) {
        while let Some(wait_ref) = list::pop_front(&self.waits, lock.borrow_mut()) {
            // Safety: See `wake_up_one_by`
            let wait = unsafe { wait_ref.0.as_ref() };
            complete_wait(lock.borrow_mut(), wait, wait_result);
        }
    }

    /// Conditionally wake up waiting tasks.
    ///
    /// `cond` receives each waiter's payload in priority order; returning
    /// `true` wakes that waiter. `cond` gets the CPU Lock token read-only so
    /// it can update payload output cells but can't invalidate the
    /// assumption that the next wait object is still linked.
    pub(crate) fn wake_up_all_conditional(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        mut cond: impl FnMut(&WaitPayload<Traits>, CpuLockTokenRef<'_, Traits>) -> bool,
    ) {
        let mut cur = self.waits.read(&*lock).first();

        while let Some(wait_ref) = cur {
            // Find the next wait object before we possibly remove `wait_ref`
            cur = list::next(wait_ref, lock.borrow_mut());

            // Safety: `wait_ref` is in `self.waits`, hence valid
            let wait = unsafe { wait_ref.0.as_ref() };

            if !cond(&wait.payload, lock.borrow()) {
                continue;
            }

            let removed = list::remove(&self.waits, wait_ref, lock.borrow_mut());
            debug_assert!(removed);

            complete_wait(lock.borrow_mut(), wait, Ok(()));
        }
    }
}

/// Block the currently running task without a wait queue. The only ways to
/// end such a wait are [`interrupt_task`] and (with a timeout) the
/// expiration record.
pub(crate) fn wait_no_queue<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    payload: WaitPayload<Traits>,
    delta_us: Option<u64>,
) -> Result<WaitPayload<Traits>, WaitEndError> {
    let task = Traits::state().running_task(lock.borrow_mut()).unwrap();
    let wait = Wait {
        task,
        link: Init::INIT,
        wait_queue: None,
        payload,
    };

    wait_inner(lock, &wait, delta_us)?;

    Ok(wait.payload)
}

/// The core portion of the wait operations. Parks the current task until a
/// wake-upper releases it, and reports the wait result.
fn wait_inner<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    wait: &Wait<Traits>,
    delta_us: Option<u64>,
) -> Result<(), WaitEndError> {
    let task = wait.task;
    let wait_ref = WaitRef(wait.into());

    debug_assert!(core::ptr::eq(
        wait.task,
        Traits::state().running_task(lock.borrow_mut()).unwrap()
    ));

    if let Some(wait_queue) = wait.wait_queue {
        // Insert `wait_ref` into the wait queue, ordered by effective task
        // priority with first-in first-out ties
        let cand_level = task.effective_level.get(&*lock);
        list::insert_ordered(
            &wait_queue.waits,
            wait_ref,
            lock.borrow_mut(),
            |cur, _cand, l| {
                // Safety: `cur` is linked, hence the pointee is valid
                let cur_level = unsafe { cur.0.as_ref() }.task.effective_level.get(&*l);
                cur_level <= cand_level
            },
        );
    }

    task.wait.current_wait.replace(&mut *lock, Some(wait_ref));

    if let Some(delta_us) = delta_us {
        timeout::arm(lock.borrow_mut(), &task.timeout, delta_us);
    }

    // Transition the task into Waiting. This statement completes when the
    // task is woken up.
    task::wait_until_woken_up(lock.borrow_mut());

    // A wake-upper must have detached the wait object
    debug_assert!(wait.link.read(&*lock).next.is_none());
    debug_assert!(task.wait.current_wait.get(&*lock).is_none());

    timeout::cancel(lock.borrow_mut(), &task.timeout);

    task.wait.wait_result.get(&*lock)
}

/// Deassociate the specified wait object from its waiting task and wake up
/// the task.
///
/// This method doesn't remove `wait` from its wait queue; the caller must
/// have done that already.
fn complete_wait<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    wait: &Wait<Traits>,
    wait_result: Result<(), WaitEndError>,
) {
    let task_cb = wait.task;

    debug_assert_eq!(
        task_cb.wait.current_wait.get(&*lock),
        Some(WaitRef(wait.into()))
    );
    task_cb.wait.current_wait.replace(&mut *lock, None);
    task_cb.wait.wait_result.replace(&mut *lock, wait_result);

    // Disarm the task's expiration record; the wait is over
    timeout::cancel(lock.borrow_mut(), &task_cb.timeout);

    assert_eq!(task_cb.st.get(&*lock), TaskSt::Waiting);

    // Make the task Ready
    //
    // Safety: The task is in the Waiting state, so its context is valid and
    // ready to resume from where it was interrupted.
    unsafe { task::make_ready(lock, task_cb) };
}

/// Interrupt any ongoing wait operation of the task, delivering the given
/// wait result. Returns `false` if the task was not in the Waiting state.
///
/// This method may make the task Ready, but doesn't yield the processor.
/// Call [`task::unlock_cpu_and_check_preemption`] as needed.
pub(crate) fn interrupt_task<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task_cb: &'static TaskCb<Traits>,
    wait_result: Result<(), WaitEndError>,
) -> bool {
    if task_cb.st.get(&*lock) != TaskSt::Waiting {
        return false;
    }

    if let Some(wait_ref) = task_cb.wait.current_wait.get(&*lock) {
        // Safety: `wait_ref` points to a valid `Wait` because the waiting
        // task can't resume (and destroy it) while we hold CPU Lock
        let wait = unsafe { wait_ref.0.as_ref() };

        // Remove `wait` from the wait queue it belongs to
        if let Some(wait_queue) = wait.wait_queue {
            let removed = list::remove(&wait_queue.waits, wait_ref, lock.borrow_mut());
            debug_assert!(removed);
        }

        complete_wait(lock, wait, wait_result);
    } else {
        // The task was parked without a wait object (peer-suspended)
        task_cb.wait.wait_result.replace(&mut *lock, wait_result);
        timeout::cancel(lock.borrow_mut(), &task_cb.timeout);
        // Safety: The task is Waiting, so its context is valid
        unsafe { task::make_ready(lock, task_cb) };
    }

    true
}

/// Detach the task's wait object without waking the task, as part of
/// deleting the task. Does nothing if the task isn't waiting.
pub(crate) fn abandon_wait<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task_cb: &'static TaskCb<Traits>,
) {
    let Some(wait_ref) = task_cb.wait.current_wait.get(&*lock) else {
        return;
    };

    // Safety: While `current_wait` is `Some(_)`, the pointee is valid
    let wait = unsafe { wait_ref.0.as_ref() };

    if let Some(wait_queue) = wait.wait_queue {
        let removed = list::remove(&wait_queue.waits, wait_ref, lock.borrow_mut());
        debug_assert!(removed);
    }

    task_cb.wait.current_wait.replace(&mut *lock, None);
}

/// The timeout wheel's wake-on-timeout callback.
pub(crate) fn wake_task_by_timeout<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    task_cb: &'static TaskCb<Traits>,
) {
    // Even if the task is not waiting anymore, we don't care
    let _ = interrupt_task(lock, task_cb, Err(WaitEndError::Timeout));
}

/// Access the specified task's current wait payload in the supplied closure.
///
/// The wait object might get deallocated when the task starts running. This
/// function allows access to the wait object while ensuring the reference
/// doesn't escape from the scope.
pub(crate) fn with_current_wait_payload<Traits: KernelTraits, R>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    task_cb: &TaskCb<Traits>,
    f: impl FnOnce(Option<&WaitPayload<Traits>>) -> R,
) -> R {
    let wait_ref = task_cb.wait.current_wait.get(&*lock);

    // Safety: While `current_wait` is `Some(_)`, the pointee is valid
    let payload = wait_ref.map(|r| &unsafe { &*r.0.as_ptr() }.payload);

    f(payload)
}

/// Reposition the given task's wait object within its wait queue. This is
/// necessary after a change of the task's effective priority because wait
/// queues sort wait objects by it.
///
/// Does nothing if the task is not waiting or its wait object isn't on a
/// queue.
pub(crate) fn reorder_wait_of_task<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task_cb: &'static TaskCb<Traits>,
) {
    let Some(wait_ref) = task_cb.wait.current_wait.get(&*lock) else {
        return;
    };

    // Safety: While `current_wait` is `Some(_)`, the pointee is valid
    let wait = unsafe { wait_ref.0.as_ref() };

    let Some(wait_queue) = wait.wait_queue else {
        return;
    };

    let removed = list::remove(&wait_queue.waits, wait_ref, lock.borrow_mut());
    debug_assert!(removed);

    let cand_level = task_cb.effective_level.get(&*lock);
    list::insert_ordered(
        &wait_queue.waits,
        wait_ref,
        lock.borrow_mut(),
        |cur, _cand, l| {
            // Safety: `cur` is linked, hence valid
            let cur_level = unsafe { cur.0.as_ref() }.task.effective_level.get(&*l);
            cur_level <= cand_level
        },
    );
}
