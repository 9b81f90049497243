//! Task ready queue implementation (internal use only).
//!
//! **This module is exempt from the API stability guarantee.**
use core::fmt;

use crate::{
    klock::{CpuLockCell, CpuLockTokenRefMut},
    task::TaskRef,
    utils::{list, FixedPrioBitmap, Init, PrioBitmap},
    KernelCfg, KernelTraits,
};

/// Represents a task ready queue, which tracks the Ready tasks of every
/// priority level.
///
/// This trait is not intended to be implemented on custom types.
pub trait Queue<Traits>: Send + Sync + Init + 'static + private::Sealed {
    /// Return a flag indicating whether there's a Ready task whose level is
    /// numerically lower (= higher priority) than `level`.
    fn has_ready_task_above(&self, lock: CpuLockTokenRefMut<'_, Traits>, level: usize) -> bool
    where
        Traits: KernelTraits;

    /// Return a flag indicating whether any task is Ready.
    fn has_ready_task(&self, lock: CpuLockTokenRefMut<'_, Traits>) -> bool
    where
        Traits: KernelTraits;

    /// Insert the specified task to the ready queue.
    ///
    /// The task is inserted behind all tasks of the same effective level,
    /// making same-level scheduling first-in first-out.
    ///
    /// # Safety
    ///
    /// This method will cause an undefined behavior if `task` is already
    /// included in the queue.
    unsafe fn push_back_task(&self, lock: CpuLockTokenRefMut<'_, Traits>, task: TaskRef<Traits>)
    where
        Traits: KernelTraits;

    /// Choose the next task to schedule based on `prev_task_level`, the
    /// effective level of the task that would keep running if no preemption
    /// took place (`usize::MAX` if there is no such task).
    ///
    /// If this method returns `SwitchTo(Some(task))`, `task` is removed from
    /// the queue.
    fn pop_front_task(
        &self,
        lock: CpuLockTokenRefMut<'_, Traits>,
        prev_task_level: usize,
    ) -> ScheduleDecision<TaskRef<Traits>>
    where
        Traits: KernelTraits;

    /// Remove the specified task from the ready queue.
    ///
    /// # Safety
    ///
    /// `task` must have been inserted with the effective level `level` and
    /// not removed since.
    unsafe fn remove_task(
        &self,
        lock: CpuLockTokenRefMut<'_, Traits>,
        task: TaskRef<Traits>,
        level: usize,
    ) where
        Traits: KernelTraits;

    /// Reposition the specified task after a change of its effective level
    /// from `old_level` to `level`.
    ///
    /// # Safety
    ///
    /// `task` must have been inserted with the effective level `old_level`
    /// and not removed since.
    unsafe fn reorder_task(
        &self,
        lock: CpuLockTokenRefMut<'_, Traits>,
        task: TaskRef<Traits>,
        level: usize,
        old_level: usize,
    ) where
        Traits: KernelTraits;
}

/// Implements [the sealed trait pattern], which protects [`Queue`] against
/// downstream implementations.
///
/// [the sealed trait pattern]: https://rust-lang.github.io/api-guidelines/future-proofing.html
mod private {
    pub trait Sealed {}
}

/// The result type of [`Queue::pop_front_task`].
pub enum ScheduleDecision<T> {
    /// The kernel should not perform a context switch and should continue to
    /// schedule the current task.
    Keep,
    /// The kernel should perform a context switch to the specified task.
    SwitchTo(Option<T>),
}

/// The ready queue implementation: one FIFO list per priority level, plus a
/// bitmap indicating the non-empty levels.
pub struct BitmapQueue<Traits: KernelTraits, const LEN: usize> {
    /// Invariant: `queues[i]` is non-empty iff bit `i` of `bitmap` is set.
    queues: [CpuLockCell<Traits, list::ListHead<TaskRef<Traits>>>; LEN],
    bitmap: CpuLockCell<Traits, FixedPrioBitmap>,
}

impl<Traits: KernelTraits, const LEN: usize> Init for BitmapQueue<Traits, LEN> {
    const INIT: Self = Self {
        queues: Init::INIT,
        bitmap: Init::INIT,
    };
}

// Safety: The contents are only accessed with CPU Lock active
unsafe impl<Traits: KernelTraits, const LEN: usize> Send for BitmapQueue<Traits, LEN> {}
unsafe impl<Traits: KernelTraits, const LEN: usize> Sync for BitmapQueue<Traits, LEN> {}

impl<Traits: KernelTraits, const LEN: usize> fmt::Debug for BitmapQueue<Traits, LEN> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("BitmapQueue")
    }
}

impl<Traits: KernelTraits, const LEN: usize> private::Sealed for BitmapQueue<Traits, LEN> {}

impl<Traits, const LEN: usize> Queue<Traits> for BitmapQueue<Traits, LEN>
where
    Traits: KernelCfg<ReadyQueue = Self> + KernelTraits,
{
    #[inline]
    fn has_ready_task_above(&self, lock: CpuLockTokenRefMut<'_, Traits>, level: usize) -> bool {
        let highest = self.bitmap.read(&*lock).find_set().unwrap_or(usize::MAX);
        highest < level
    }

    #[inline]
    fn has_ready_task(&self, lock: CpuLockTokenRefMut<'_, Traits>) -> bool {
        self.bitmap.read(&*lock).find_set().is_some()
    }

    #[inline]
    unsafe fn push_back_task(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        task: TaskRef<Traits>,
    ) {
        let level = task.get().effective_level.get(&*lock);
        debug_assert!(level < LEN);
        list::push_back(&self.queues[level], task, lock.borrow_mut());
        self.bitmap.write(&mut *lock).set(level);
    }

    #[inline]
    fn pop_front_task(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        prev_task_level: usize,
    ) -> ScheduleDecision<TaskRef<Traits>> {
        // The default value (the value given to `unwrap_or`) is
        // `usize::MAX - 1` so that, when there's no schedulable task and no
        // current task (`prev_task_level == usize::MAX`), the method returns
        // `SwitchTo(None)` instead of `Keep`. `usize::MAX - 1` never collides
        // with an actual level.
        let next_task_level = self
            .bitmap
            .read(&*lock)
            .find_set()
            .unwrap_or(usize::MAX - 1);

        if prev_task_level <= next_task_level {
            ScheduleDecision::Keep
        } else if next_task_level < LEN {
            let task = list::pop_front(&self.queues[next_task_level], lock.borrow_mut())
                // There must be at least one element, because the bitmap
                // indicated so
                .unwrap();

            if self.queues[next_task_level].read(&*lock).is_empty() {
                self.bitmap.write(&mut *lock).clear(next_task_level);
            }

            ScheduleDecision::SwitchTo(Some(task))
        } else {
            ScheduleDecision::SwitchTo(None)
        }
    }

    #[inline]
    unsafe fn remove_task(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        task: TaskRef<Traits>,
        level: usize,
    ) {
        let removed = list::remove(&self.queues[level], task, lock.borrow_mut());
        debug_assert!(removed);
        if self.queues[level].read(&*lock).is_empty() {
            self.bitmap.write(&mut *lock).clear(level);
        }
    }

    #[inline]
    unsafe fn reorder_task(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        task: TaskRef<Traits>,
        level: usize,
        old_level: usize,
    ) {
        debug_assert_ne!(level, old_level);

        // Safety: Forwarded precondition
        unsafe { self.remove_task(lock.borrow_mut(), task, old_level) };
        list::push_back(&self.queues[level], task, lock.borrow_mut());
        self.bitmap.write(&mut *lock).set(level);
    }
}
