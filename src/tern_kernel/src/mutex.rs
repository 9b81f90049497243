//! Mutexes with priority inheritance.
//!
//! Lock contention temporarily raises the holder's effective priority to the
//! highest-priority waiter's, preventing priority inversion. Unlocking
//! restores the holder's priority and hands the ownership directly to the
//! best waiter.
//!
//! There is no `delete` operation: destroying a mutex that tasks may be
//! blocked on cannot be made safe, so only [`System::mutex_force_free`]
//! exists, and it refuses to operate while any task is waiting.
use core::fmt;

use crate::{
    cfg::{self, ObjectCs},
    error::impl_postcode,
    klock::{self, CpuLockCell, CpuLockTokenRefMut},
    task::{self, TaskCb, TaskRef, TaskSt},
    utils::Init,
    wait::{self, WaitPayload, WaitQueue},
    Component, Id, KernelTraits, System,
};

use crate::task::readyqueue::Queue as _;

/// Identifies a mutex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutexId(pub(crate) Id);

/// *Mutex control block* — the state data of a mutex.
#[doc(hidden)]
pub struct MutexCb<Traits: KernelTraits> {
    pub(crate) cs: CpuLockCell<Traits, ObjectCs>,
    pub(crate) name: CpuLockCell<Traits, &'static str>,

    /// Invariant: `locked == true ⇔ owning_task.is_some()`.
    pub(crate) locked: CpuLockCell<Traits, bool>,

    /// The task that currently owns the mutex lock.
    pub(crate) owning_task: CpuLockCell<Traits, Option<&'static TaskCb<Traits>>>,

    /// The holder's effective level at the moment it acquired the lock,
    /// restored on unlock.
    pub(crate) original_level: CpuLockCell<Traits, usize>,

    /// The next element in the singly-linked list headed by
    /// `TaskCb::last_mutex_held`, containing all mutexes currently held by
    /// the owning task.
    pub(crate) prev_mutex_held: CpuLockCell<Traits, Option<&'static Self>>,

    pub(crate) wait_queue: WaitQueue<Traits>,
}

impl<Traits: KernelTraits> Init for MutexCb<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        cs: Init::INIT,
        name: Init::INIT,
        locked: Init::INIT,
        owning_task: Init::INIT,
        original_level: Init::INIT,
        prev_mutex_held: Init::INIT,
        wait_queue: Init::INIT,
    };
}

impl<Traits: KernelTraits> fmt::Debug for MutexCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        // `owning_task` is omitted: printing it would recurse back into the
        // holder's control block
        f.debug_struct("MutexCb")
            .field("self", &(self as *const _))
            .field("name", &self.name)
            .field("locked", &self.locked)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitError {
    NoSlot,
    BadContext,
}
impl_postcode!(InitError, Component::Mutex, {
    NoSlot => 4,
    BadContext => 2,
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockError {
    /// The calling task already owns the mutex.
    WouldDeadlock,
    BadId,
    BadContext,
}
impl_postcode!(LockError, Component::Mutex, {
    WouldDeadlock => 5,
    BadId => 1,
    BadContext => 2,
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnlockError {
    /// The calling task does not own the mutex.
    NotOwner,
    BadId,
    BadContext,
}
impl_postcode!(UnlockError, Component::Mutex, {
    NotOwner => 6,
    BadId => 1,
    BadContext => 2,
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForceFreeError {
    /// At least one task is blocked on the mutex.
    Waited,
    /// The mutex is not locked.
    NotLocked,
    BadId,
    BadContext,
}
impl_postcode!(ForceFreeError, Component::Mutex, {
    Waited => 7,
    NotLocked => 8,
    BadId => 1,
    BadContext => 2,
});

impl<Traits: KernelTraits> System<Traits> {
    fn mutex_cb(
        id: MutexId,
        lock: CpuLockTokenRefMut<'_, Traits>,
    ) -> Result<&'static MutexCb<Traits>, crate::error::BadIdError> {
        cfg::get_cb(Traits::mutex_cb_pool(), id.0, lock, |cb| &cb.cs)
    }

    /// Create a mutex.
    pub fn mutex_init(name: &'static str) -> Result<MutexId, InitError> {
        let mut lock = klock::CpuLockGuard::<Traits>::acquire().map_err(|_| InitError::BadContext)?;

        let (index, cb) =
            cfg::claim_slot(Traits::mutex_cb_pool(), lock.borrow_mut(), |cb| &cb.cs)
                .ok_or(InitError::NoSlot)?;

        cb.name.replace(&mut *lock.borrow_mut(), name);

        Ok(MutexId(cfg::id_from_index(index)))
    }

    /// Acquire the mutex, blocking indefinitely while another task holds it.
    /// Contention raises the holder's effective priority to the caller's if
    /// the caller's is higher.
    pub fn mutex_lock(id: MutexId) -> Result<(), LockError> {
        let mut lock = klock::CpuLockGuard::<Traits>::acquire().map_err(|_| LockError::BadContext)?;
        task::expect_waitable_context::<Traits>().map_err(|_| LockError::BadContext)?;
        let cb = Self::mutex_cb(id, lock.borrow_mut()).map_err(|_| LockError::BadId)?;

        let running_task = Traits::state().running_task(lock.borrow_mut()).unwrap();

        match cb.owning_task.get(&*lock) {
            None => {
                lock_core(cb, running_task, lock.borrow_mut());
                Ok(())
            }
            Some(holder) if core::ptr::eq(holder, running_task) => Err(LockError::WouldDeadlock),
            Some(holder) => {
                // Priority inheritance: lend the caller's priority to the
                // holder for the duration of the contention
                let caller_level = running_task.effective_level.get(&*lock);
                raise_task_effective_level(lock.borrow_mut(), holder, caller_level);

                // The unlock path transfers the ownership to us before
                // waking us, so a normal wake means the lock is held
                cb.wait_queue
                    .wait(lock.borrow_mut(), WaitPayload::Mutex(cb))
                    .expect("mutexes are never deleted");

                debug_assert!(core::ptr::eq(
                    cb.owning_task.get(&*lock).unwrap(),
                    running_task
                ));

                Ok(())
            }
        }
    }

    /// Release the mutex. The holder's effective priority is restored, and
    /// the highest-priority waiter (if any) becomes the new holder.
    pub fn mutex_unlock(id: MutexId) -> Result<(), UnlockError> {
        let mut lock = klock::CpuLockGuard::<Traits>::acquire().map_err(|_| UnlockError::BadContext)?;
        let cb = Self::mutex_cb(id, lock.borrow_mut()).map_err(|_| UnlockError::BadId)?;

        let running_task = Traits::state().running_task(lock.borrow_mut()).unwrap();

        match cb.owning_task.get(&*lock) {
            Some(holder) if core::ptr::eq(holder, running_task) => {}
            _ => return Err(UnlockError::NotOwner),
        }

        remove_from_held_chain(lock.borrow_mut(), running_task, cb);

        // Drop any priority inherited through this mutex
        let base = running_task.base_level.get(&*lock);
        let restored = evaluate_task_effective_level(lock.borrow_mut(), running_task, base);
        set_task_effective_level(lock.borrow_mut(), running_task, restored);

        // Hand the ownership to the next waiter
        unlock_core(cb, lock.borrow_mut());

        task::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// Is the mutex currently locked?
    pub fn mutex_is_locked(id: MutexId) -> Result<bool, LockError> {
        let mut lock = klock::CpuLockGuard::<Traits>::acquire().map_err(|_| LockError::BadContext)?;
        let cb = Self::mutex_cb(id, lock.borrow_mut()).map_err(|_| LockError::BadId)?;
        Ok(cb.locked.get(&*lock))
    }

    /// Forcibly release a mutex regardless of its owner.
    ///
    /// Only legal while no task is blocked on the mutex; this is an escape
    /// hatch for tearing down a lock whose holder is gone.
    pub fn mutex_force_free(id: MutexId) -> Result<(), ForceFreeError> {
        let mut lock = klock::CpuLockGuard::<Traits>::acquire().map_err(|_| ForceFreeError::BadContext)?;
        let cb = Self::mutex_cb(id, lock.borrow_mut()).map_err(|_| ForceFreeError::BadId)?;

        if cb.wait_queue.first_waiting_task(lock.borrow_mut()).is_some() {
            return Err(ForceFreeError::Waited);
        }

        let Some(holder) = cb.owning_task.get(&*lock) else {
            return Err(ForceFreeError::NotLocked);
        };

        remove_from_held_chain(lock.borrow_mut(), holder, cb);
        let base = holder.base_level.get(&*lock);
        let restored = evaluate_task_effective_level(lock.borrow_mut(), holder, base);
        set_task_effective_level(lock.borrow_mut(), holder, restored);

        cb.locked.replace(&mut *lock.borrow_mut(), false);
        cb.owning_task.replace(&mut *lock.borrow_mut(), None);

        task::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }
}

/// Give the ownership of the mutex to `task`.
///
/// The task must be in the Running or Waiting state.
fn lock_core<Traits: KernelTraits>(
    cb: &'static MutexCb<Traits>,
    task: &'static TaskCb<Traits>,
    mut lock: CpuLockTokenRefMut<'_, Traits>,
) {
    debug_assert!(matches!(
        task.st.get(&*lock),
        TaskSt::Running | TaskSt::Waiting
    ));

    cb.locked.replace(&mut *lock, true);
    cb.owning_task.replace(&mut *lock, Some(task));
    let level = task.effective_level.get(&*lock);
    cb.original_level.replace(&mut *lock, level);

    // Push `cb` onto the list of mutexes held by the task
    let prev = task.last_mutex_held.replace(&mut *lock, Some(cb));
    cb.prev_mutex_held.replace(&mut *lock, prev);
}

/// Wake up the next waiter of the mutex and make it the owner, or mark the
/// mutex unlocked if there's no waiter.
///
/// This method may make a task Ready, but doesn't yield the processor.
/// Call [`task::unlock_cpu_and_check_preemption`] as needed.
fn unlock_core<Traits: KernelTraits>(
    cb: &'static MutexCb<Traits>,
    mut lock: CpuLockTokenRefMut<'_, Traits>,
) {
    if let Some(next_task) = cb.wait_queue.first_waiting_task(lock.borrow_mut()) {
        // Transfer the ownership to `next_task`, then wake it
        lock_core(cb, next_task, lock.borrow_mut());
        let woke = cb.wait_queue.wake_up_one(lock.borrow_mut());
        debug_assert!(woke);
    } else {
        cb.locked.replace(&mut *lock, false);
        cb.owning_task.replace(&mut *lock, None);
    }
}

/// Remove `cb` from the task's held-mutex chain.
fn remove_from_held_chain<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task: &'static TaskCb<Traits>,
    cb: &'static MutexCb<Traits>,
) {
    let mut cur = task.last_mutex_held.get(&*lock);
    let mut prev: Option<&'static MutexCb<Traits>> = None;
    while let Some(held) = cur {
        let next = held.prev_mutex_held.get(&*lock);
        if core::ptr::eq(held, cb) {
            match prev {
                Some(p) => {
                    p.prev_mutex_held.replace(&mut *lock, next);
                }
                None => {
                    task.last_mutex_held.replace(&mut *lock, next);
                }
            }
            cb.prev_mutex_held.replace(&mut *lock, None);
            return;
        }
        prev = cur;
        cur = next;
    }
    debug_assert!(false, "mutex not on the holder's chain");
}

/// Reevaluate the task's effective level from its base level and the waiters
/// of all mutexes it holds. (This doesn't update the task; see
/// [`set_task_effective_level`].)
pub(crate) fn evaluate_task_effective_level<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task: &'static TaskCb<Traits>,
    base_level: usize,
) -> usize {
    let mut level = base_level;
    let mut maybe_cb = task.last_mutex_held.get(&*lock);

    while let Some(cb) = maybe_cb {
        if let Some(waiter) = cb.wait_queue.first_waiting_task(lock.borrow_mut()) {
            level = level.min(waiter.effective_level.get(&*lock));
        }
        maybe_cb = cb.prev_mutex_held.get(&*lock);
    }

    level
}

/// Raise the task's effective level to `level` if that is an improvement.
fn raise_task_effective_level<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    task: &'static TaskCb<Traits>,
    level: usize,
) {
    let current = task.effective_level.get(&*lock);
    set_task_effective_level(lock, task, level.min(current));
}

/// Change the task's effective level, repositioning it in whatever priority-
/// ordered structure it currently occupies.
fn set_task_effective_level<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task: &'static TaskCb<Traits>,
    level: usize,
) {
    let old_level = task.effective_level.replace(&mut *lock, level);
    if old_level == level {
        return;
    }

    match task.st.get(&*lock) {
        TaskSt::Ready => {
            // Safety: The task is Ready, so it was inserted with `old_level`
            unsafe {
                Traits::state().ready_queue().reorder_task(
                    lock.borrow_mut(),
                    TaskRef::new(task),
                    level,
                    old_level,
                );
            }
        }
        TaskSt::Waiting => {
            wait::reorder_wait_of_task(lock.borrow_mut(), task);
        }
        TaskSt::Running | TaskSt::Dormant => {}
    }
}

/// Abandon all mutexes held by the task, as part of terminating it. Waiters
/// are handed the ownership as if the task unlocked normally.
///
/// This method may make tasks Ready, but doesn't yield the processor.
pub(crate) fn abandon_held_mutexes<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task: &'static TaskCb<Traits>,
) {
    let mut maybe_cb = task.last_mutex_held.replace(&mut *lock, None);
    while let Some(cb) = maybe_cb {
        maybe_cb = cb.prev_mutex_held.get(&*lock);
        cb.prev_mutex_held.replace(&mut *lock, None);
        unlock_core(cb, lock.borrow_mut());
    }
}
