//! Static configuration mechanism for the kernel.
//!
//! A kernel instance is bound to a *kernel trait type* — an empty type the
//! application names — by [`static_kernel!`], which instantiates the global
//! [`State`] and one fixed-capacity control-block pool per primitive type,
//! and implements [`KernelCfg`] to expose them. A port crate's `use_port!`
//! macro implements the hardware-facing traits on the same type.
//!
//! Kernel objects are created at runtime: each `*_init` operation claims the
//! first free slot of its pool (a slot is free while its control/status byte
//! is zero) and `*_delete` returns the slot. The pools and the state are
//! plain statics, so the memory cost of a configuration is visible in the
//! map file.
//!
//! [`State`]: crate::State
//! [`KernelCfg`]: crate::KernelCfg
use crate::{
    error::BadIdError,
    klock::{CpuLockCell, CpuLockTokenRefMut},
    utils::Init,
    Id,
};

bitflags::bitflags! {
    /// The control/status byte of a kernel object. A zero value marks a free
    /// pool slot.
    pub struct ObjectCs: u8 {
        const INITED = 1 << 0;
    }
}

impl Init for ObjectCs {
    const INIT: Self = Self::empty();
}

/// Claim the first free slot of a control-block pool.
pub(crate) fn claim_slot<Traits, T: 'static>(
    pool: &'static [T],
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    cs_of: impl Fn(&T) -> &CpuLockCell<Traits, ObjectCs>,
) -> Option<(usize, &'static T)> {
    for (index, cb) in pool.iter().enumerate() {
        if cs_of(cb).get(&*lock).is_empty() {
            cs_of(cb).replace(&mut *lock, ObjectCs::INITED);
            return Some((index, cb));
        }
    }
    None
}

/// Resolve an [`Id`] to a live control block.
pub(crate) fn get_cb<Traits, T: 'static>(
    pool: &'static [T],
    id: Id,
    lock: CpuLockTokenRefMut<'_, Traits>,
    cs_of: impl Fn(&T) -> &CpuLockCell<Traits, ObjectCs>,
) -> Result<&'static T, BadIdError> {
    let cb = pool.get(id.get() - 1).ok_or(BadIdError::BadId)?;
    if cs_of(cb).get(&*lock).contains(ObjectCs::INITED) {
        Ok(cb)
    } else {
        Err(BadIdError::BadId)
    }
}

#[inline]
pub(crate) fn id_from_index(index: usize) -> Id {
    // Pool indices are bounded by the pool length, so the increment can't
    // wrap
    Id::new(index + 1).unwrap()
}

/// Instantiate a kernel: define the global state and the control-block pools
/// for a kernel trait type, and implement [`KernelCfg`] on it.
///
/// ```ignore
/// tern_kernel::static_kernel! {
///     pub struct App;
///     cooperation_levels: 2,
///     application_levels: 16,
///     threads: 8,            // includes one slot for the kernel thread
///     semaphores: 4,
///     mutexes: 4,
///     events: 4,
///     queues: 4,
///     pools: 2,
///     timers: 4,
///     publishers: 2,
///     subscribers: 4,
///     kernel_stack_size: 4096,
///     heap_size: 16384,
///     init_hooks: [],
/// }
/// tern_port_std::use_port!(impl App);
/// ```
///
/// The task pool must have room for the kernel housekeeping thread in
/// addition to the application's threads.
///
/// [`KernelCfg`]: crate::KernelCfg
#[macro_export]
macro_rules! static_kernel {
    (
        $vis:vis struct $Traits:ident;
        cooperation_levels: $coop:literal,
        application_levels: $app:literal,
        threads: $n_task:literal,
        semaphores: $n_sem:literal,
        mutexes: $n_mutex:literal,
        events: $n_event:literal,
        queues: $n_queue:literal,
        pools: $n_pool:literal,
        timers: $n_timer:literal,
        publishers: $n_publish:literal,
        subscribers: $n_subscribe:literal,
        kernel_stack_size: $kstack:literal,
        heap_size: $heap:literal,
        init_hooks: [ $( ($phase:expr, $hook:expr) ),* $(,)? ] $(,)?
    ) => {
        $vis struct $Traits;

        const _: () = {
            use $crate::utils::Init;

            static STATE: $crate::State<$Traits> = Init::INIT;
            static TASK_CB_POOL: [$crate::task::TaskCb<$Traits>; $n_task] = Init::INIT;
            static SEMAPHORE_CB_POOL: [$crate::semaphore::SemaphoreCb<$Traits>; $n_sem] =
                Init::INIT;
            static MUTEX_CB_POOL: [$crate::mutex::MutexCb<$Traits>; $n_mutex] = Init::INIT;
            static EVENT_CB_POOL: [$crate::event::EventCb<$Traits>; $n_event] = Init::INIT;
            static QUEUE_CB_POOL: [$crate::msgqueue::QueueCb<$Traits>; $n_queue] = Init::INIT;
            static POOL_CB_POOL: [$crate::pool::PoolCb<$Traits>; $n_pool] = Init::INIT;
            static TIMER_CB_POOL: [$crate::timer::TimerCb<$Traits>; $n_timer] = Init::INIT;
            static PUBLISH_CB_POOL: [$crate::pubsub::PublishCb<$Traits>; $n_publish] = Init::INIT;
            static SUBSCRIBE_CB_POOL: [$crate::pubsub::SubscribeCb<$Traits>; $n_subscribe] =
                Init::INIT;
            static KERNEL_STACK: $crate::utils::StackStorage<$kstack> = Init::INIT;
            static HEAP_REGION: $crate::utils::StackStorage<$heap> = Init::INIT;
            static INIT_HOOKS: &[$crate::InitHook] = &[
                $( $crate::InitHook { phase: $phase, func: $hook }, )*
            ];

            // Safety: The pools and state above are truly `'static`
            unsafe impl $crate::KernelCfg for $Traits {
                const NUM_PRIORITY_LEVELS: usize =
                    $coop + $app + $crate::NUM_RESERVED_LEVELS;
                const NUM_COOPERATION_LEVELS: usize = $coop;

                type ReadyQueue = $crate::task::readyqueue::BitmapQueue<
                    $Traits,
                    { $coop + $app + $crate::NUM_RESERVED_LEVELS },
                >;

                fn state() -> &'static $crate::State<$Traits> {
                    &STATE
                }

                fn task_cb_pool() -> &'static [$crate::task::TaskCb<$Traits>] {
                    &TASK_CB_POOL
                }

                fn semaphore_cb_pool() -> &'static [$crate::semaphore::SemaphoreCb<$Traits>] {
                    &SEMAPHORE_CB_POOL
                }

                fn mutex_cb_pool() -> &'static [$crate::mutex::MutexCb<$Traits>] {
                    &MUTEX_CB_POOL
                }

                fn event_cb_pool() -> &'static [$crate::event::EventCb<$Traits>] {
                    &EVENT_CB_POOL
                }

                fn queue_cb_pool() -> &'static [$crate::msgqueue::QueueCb<$Traits>] {
                    &QUEUE_CB_POOL
                }

                fn pool_cb_pool() -> &'static [$crate::pool::PoolCb<$Traits>] {
                    &POOL_CB_POOL
                }

                fn timer_cb_pool() -> &'static [$crate::timer::TimerCb<$Traits>] {
                    &TIMER_CB_POOL
                }

                fn publish_cb_pool() -> &'static [$crate::pubsub::PublishCb<$Traits>] {
                    &PUBLISH_CB_POOL
                }

                fn subscribe_cb_pool() -> &'static [$crate::pubsub::SubscribeCb<$Traits>] {
                    &SUBSCRIBE_CB_POOL
                }

                fn kernel_stack() -> *mut [u8] {
                    KERNEL_STACK.as_ptr()
                }

                fn heap_region() -> *mut [u8] {
                    HEAP_REGION.as_ptr()
                }

                fn init_hooks() -> &'static [$crate::InitHook] {
                    INIT_HOOKS
                }
            }
        };
    };
}
