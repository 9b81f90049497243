//! Scheduling-discipline and cross-primitive tests.
use std::{
    thread,
    time::{Duration, Instant},
};

fn wait_until(what: &str, timeout_ms: u64, cond: impl Fn() -> bool) {
    let t0 = Instant::now();
    while !cond() {
        assert!(
            t0.elapsed() < Duration::from_millis(timeout_ms),
            "timed out waiting for {what}"
        );
        thread::sleep(Duration::from_millis(1));
    }
}

fn leak_buf(len: usize) -> &'static mut [u8] {
    Box::leak(vec![0u8; len].into_boxed_slice())
}

mod cooperation {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tern_kernel::{cooperation_priority, System, TimeoutMs};

    tern_kernel::static_kernel! {
        pub struct App;
        cooperation_levels: 2,
        application_levels: 16,
        threads: 8,
        semaphores: 4,
        mutexes: 4,
        events: 4,
        queues: 4,
        pools: 2,
        timers: 4,
        publishers: 2,
        subscribers: 4,
        kernel_stack_size: 4096,
        heap_size: 65536,
        init_hooks: [],
    }
    tern_port_std::use_port!(impl App);

    static ORDER: Mutex<Vec<(u8, u8)>> = Mutex::new(Vec::new());
    static PHASES: AtomicUsize = AtomicUsize::new(0);
    static STOP: AtomicBool = AtomicBool::new(false);

    fn coop_body(tag: usize) {
        // Run two phases; between phases, give the processor away
        // explicitly. A cooperation task is only displaced at these points,
        // never by the other cooperation task becoming Ready.
        for phase in 0..2u8 {
            ORDER.lock().unwrap().push((tag as u8, phase));
            PHASES.fetch_add(1, Ordering::SeqCst);
            System::<App>::thread_sleep(TimeoutMs(20)).unwrap();
        }
        while !STOP.load(Ordering::SeqCst) {
            let _ = System::<App>::thread_sleep(TimeoutMs(20));
        }
    }

    /// Two cooperation tasks interleave only at their own blocking points:
    /// each phase runs to completion even though the other task has the
    /// nominally higher slot.
    #[test]
    fn cooperation_tasks_run_phases_uninterrupted() {
        tern_port_std::start_kernel::<App>();

        System::<App>::thread_init(
            coop_body,
            0,
            None,
            4096,
            cooperation_priority(0),
            "coop0",
        )
        .unwrap();
        System::<App>::thread_init(
            coop_body,
            1,
            None,
            4096,
            cooperation_priority(1),
            "coop1",
        )
        .unwrap();

        wait_until("all phases to run", 3_000, || {
            PHASES.load(Ordering::SeqCst) >= 4
        });
        STOP.store(true, Ordering::SeqCst);

        let order = ORDER.lock().unwrap().clone();
        // Every task completed both phases
        for tag in 0..2u8 {
            for phase in 0..2u8 {
                assert!(order.contains(&(tag, phase)), "missing ({tag}, {phase})");
            }
        }
    }
}

mod pool_handoff {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tern_kernel::{pool, System, TimeoutMs};

    tern_kernel::static_kernel! {
        pub struct App;
        cooperation_levels: 2,
        application_levels: 16,
        threads: 8,
        semaphores: 4,
        mutexes: 4,
        events: 4,
        queues: 4,
        pools: 2,
        timers: 4,
        publishers: 2,
        subscribers: 4,
        kernel_stack_size: 4096,
        heap_size: 65536,
        init_hooks: [],
    }
    tern_port_std::use_port!(impl App);

    static POOL_ID: std::sync::OnceLock<pool::PoolId> = std::sync::OnceLock::new();
    static TAKEN: AtomicUsize = AtomicUsize::new(0);
    static HANDED_OVER: AtomicBool = AtomicBool::new(false);

    fn blocked_taker(_: usize) {
        let pool = *POOL_ID.get().unwrap();
        // The pool is exhausted at this point; the releasing task hands us
        // its slot directly
        let slot = System::<App>::pool_take(pool, 8, TimeoutMs::FOREVER).unwrap();
        HANDED_OVER.store(true, Ordering::SeqCst);
        System::<App>::pool_release(pool, slot).unwrap();
        let _ = System::<App>::thread_suspend(System::<App>::thread_current().unwrap());
    }

    #[test]
    fn release_hands_the_slot_to_a_waiter() {
        tern_port_std::start_kernel::<App>();

        let pool = System::<App>::pool_init(leak_buf(2 * 8), 8, 2, "pool").unwrap();
        POOL_ID.set(pool).unwrap();

        let a = System::<App>::pool_take(pool, 8, TimeoutMs::POLL).unwrap();
        let b = System::<App>::pool_take(pool, 8, TimeoutMs::POLL).unwrap();
        assert_ne!(a, b);
        TAKEN.store(2, Ordering::SeqCst);
        assert_eq!(System::<App>::pool_free_count(pool).unwrap(), 0);

        // Exhausted: polling fails, a waiter parks
        assert_eq!(
            System::<App>::pool_take(pool, 8, TimeoutMs::POLL),
            Err(pool::TakeError::Unavailable)
        );
        System::<App>::thread_init(blocked_taker, 0, None, 4096, 3, "taker").unwrap();
        thread::sleep(Duration::from_millis(20));
        assert!(!HANDED_OVER.load(Ordering::SeqCst));

        System::<App>::pool_release(pool, a).unwrap();
        wait_until("the slot hand-over", 2_000, || {
            HANDED_OVER.load(Ordering::SeqCst)
        });

        System::<App>::pool_release(pool, b).unwrap();
        assert_eq!(System::<App>::pool_free_count(pool).unwrap(), 2);
    }
}

mod event_latch {
    use super::*;
    use tern_kernel::{event::EventReport, System, TimeoutMs};

    tern_kernel::static_kernel! {
        pub struct App;
        cooperation_levels: 2,
        application_levels: 16,
        threads: 8,
        semaphores: 4,
        mutexes: 4,
        events: 4,
        queues: 4,
        pools: 2,
        timers: 4,
        publishers: 2,
        subscribers: 4,
        kernel_stack_size: 4096,
        heap_size: 65536,
        init_hooks: [],
    }
    tern_port_std::use_port!(impl App);

    /// A trigger produced with no waiter present is latched and satisfies
    /// the next wait immediately.
    #[test]
    fn unclaimed_triggers_are_latched() {
        tern_port_std::start_kernel::<App>();

        // Bit 0: edge, rising
        let event = System::<App>::event_init(0, 0x1, 0x1, 0, "latch").unwrap();

        // Nobody is listening; the rising edge latches
        System::<App>::event_set(event, 0x1, 0, 0).unwrap();

        // A later poll-mode wait claims the latched trigger without blocking
        let mut report = EventReport {
            trigger: 0,
            value: 0x1, // the caller has already seen the current value
        };
        System::<App>::event_wait(event, &mut report, 0x1, TimeoutMs::POLL).unwrap();
        assert_eq!(report.trigger & 0x1, 0x1);
        assert_eq!(report.value, 0x1);

        // The latch was consumed; a second poll reports unavailability
        let mut report2 = EventReport {
            trigger: 0,
            value: report.value,
        };
        assert_eq!(
            System::<App>::event_wait(event, &mut report2, 0x1, TimeoutMs::POLL),
            Err(tern_kernel::event::WaitError::Unavailable)
        );

        // `any`-masked bits trigger on any change, in both directions
        let any_event = System::<App>::event_init(0x2, 0, 0, 0, "any").unwrap();
        System::<App>::event_set(any_event, 0x2, 0, 0).unwrap();
        let mut r = EventReport { trigger: 0, value: 0 };
        System::<App>::event_wait(any_event, &mut r, 0x2, TimeoutMs::POLL).unwrap();
        System::<App>::event_set(any_event, 0, 0x2, 0).unwrap();
        let mut r2 = EventReport {
            trigger: 0,
            value: r.value,
        };
        System::<App>::event_wait(any_event, &mut r2, 0x2, TimeoutMs::POLL).unwrap();
    }
}

mod deferred_callbacks {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tern_kernel::System;

    tern_kernel::static_kernel! {
        pub struct App;
        cooperation_levels: 2,
        application_levels: 16,
        threads: 8,
        semaphores: 4,
        mutexes: 4,
        events: 4,
        queues: 4,
        pools: 2,
        timers: 4,
        publishers: 2,
        subscribers: 4,
        kernel_stack_size: 4096,
        heap_size: 65536,
        init_hooks: [],
    }
    tern_port_std::use_port!(impl App);

    static NOTIFIED: AtomicUsize = AtomicUsize::new(0);

    fn on_publish(arg: usize) {
        NOTIFIED.fetch_add(arg, Ordering::SeqCst);
    }

    /// An unmuted subscriber's callback is queued on the kernel thread and
    /// runs outside the publisher's context; a muted one stays silent.
    #[test]
    fn unmuted_subscribers_get_called_back() {
        tern_port_std::start_kernel::<App>();

        let publisher = System::<App>::publish_init("p").unwrap();

        let loud = System::<App>::subscribe_init(leak_buf(4), "loud").unwrap();
        System::<App>::subscribe_register(loud, publisher, false, Some((on_publish, 1)))
            .unwrap();

        let muted = System::<App>::subscribe_init(leak_buf(4), "muted").unwrap();
        System::<App>::subscribe_register(muted, publisher, true, Some((on_publish, 100)))
            .unwrap();

        System::<App>::publish_data_submit(publisher, &[1, 2, 3, 4]).unwrap();
        wait_until("the deferred callback", 2_000, || {
            NOTIFIED.load(Ordering::SeqCst) == 1
        });

        System::<App>::publish_data_submit(publisher, &[5, 6, 7, 8]).unwrap();
        wait_until("the second deferred callback", 2_000, || {
            NOTIFIED.load(Ordering::SeqCst) == 2
        });

        // Both subscribers saw the data regardless of muting
        assert!(System::<App>::subscribe_data_is_ready(loud).unwrap());
        assert!(System::<App>::subscribe_data_is_ready(muted).unwrap());
    }
}

mod init_hooks {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tern_kernel::System;

    static ORDER: Mutex<Vec<u8>> = Mutex::new(Vec::new());
    static SEM_FROM_HOOK: AtomicUsize = AtomicUsize::new(0);

    fn hook_phase0() {
        ORDER.lock().unwrap().push(0);
        // Hooks may create kernel objects
        let sem = System::<App>::semaphore_init(1, 1, "from-hook").unwrap();
        SEM_FROM_HOOK.store(1, Ordering::SeqCst);
        let _ = sem;
    }

    fn hook_phase2() {
        ORDER.lock().unwrap().push(2);
    }

    fn hook_phase4() {
        ORDER.lock().unwrap().push(4);
    }

    tern_kernel::static_kernel! {
        pub struct App;
        cooperation_levels: 2,
        application_levels: 16,
        threads: 8,
        semaphores: 4,
        mutexes: 4,
        events: 4,
        queues: 4,
        pools: 2,
        timers: 4,
        publishers: 2,
        subscribers: 4,
        kernel_stack_size: 4096,
        heap_size: 65536,
        init_hooks: [(4, hook_phase4), (0, hook_phase0), (2, hook_phase2)],
    }
    tern_port_std::use_port!(impl App);

    /// Hooks run in ascending phase order before the scheduler starts,
    /// regardless of registration order.
    #[test]
    fn hooks_run_in_phase_order() {
        tern_port_std::start_kernel::<App>();

        wait_until("the hooks to have run", 2_000, || {
            ORDER.lock().unwrap().len() == 3
        });
        assert_eq!(*ORDER.lock().unwrap(), [0, 2, 4]);
        assert_eq!(SEM_FROM_HOOK.load(Ordering::SeqCst), 1);
    }
}

mod mutex_edges {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tern_kernel::{mutex, System};

    tern_kernel::static_kernel! {
        pub struct App;
        cooperation_levels: 2,
        application_levels: 16,
        threads: 8,
        semaphores: 4,
        mutexes: 4,
        events: 4,
        queues: 4,
        pools: 2,
        timers: 4,
        publishers: 2,
        subscribers: 4,
        kernel_stack_size: 4096,
        heap_size: 65536,
        init_hooks: [],
    }
    tern_port_std::use_port!(impl App);

    static MUTEX_ID: std::sync::OnceLock<mutex::MutexId> = std::sync::OnceLock::new();
    static DONE: AtomicBool = AtomicBool::new(false);

    fn edge_body(_: usize) {
        let m = *MUTEX_ID.get().unwrap();

        System::<App>::mutex_lock(m).unwrap();
        assert!(System::<App>::mutex_is_locked(m).unwrap());

        // Re-locking by the holder fails fast instead of deadlocking
        assert_eq!(
            System::<App>::mutex_lock(m),
            Err(mutex::LockError::WouldDeadlock)
        );

        // Force-free releases a held lock as long as nobody waits on it
        System::<App>::mutex_force_free(m).unwrap();
        assert!(!System::<App>::mutex_is_locked(m).unwrap());

        // Unlocking an unheld mutex is rejected
        assert_eq!(
            System::<App>::mutex_unlock(m),
            Err(mutex::UnlockError::NotOwner)
        );

        // Force-freeing an unlocked mutex is rejected
        assert_eq!(
            System::<App>::mutex_force_free(m),
            Err(mutex::ForceFreeError::NotLocked)
        );

        DONE.store(true, Ordering::SeqCst);
        let _ = System::<App>::thread_suspend(System::<App>::thread_current().unwrap());
    }

    #[test]
    fn relock_and_force_free_edge_cases() {
        tern_port_std::start_kernel::<App>();

        let m = System::<App>::mutex_init("m").unwrap();
        MUTEX_ID.set(m).unwrap();

        System::<App>::thread_init(edge_body, 0, None, 4096, 3, "edges").unwrap();
        wait_until("the edge-case thread", 2_000, || DONE.load(Ordering::SeqCst));
    }
}

mod heap_exhaustion {
    use super::*;
    use tern_kernel::{thread, System, TimeoutMs};

    tern_kernel::static_kernel! {
        pub struct App;
        cooperation_levels: 2,
        application_levels: 16,
        threads: 8,
        semaphores: 4,
        mutexes: 4,
        events: 4,
        queues: 4,
        pools: 2,
        timers: 4,
        publishers: 2,
        subscribers: 4,
        kernel_stack_size: 4096,
        heap_size: 16384,
        init_hooks: [],
    }
    tern_port_std::use_port!(impl App);

    fn idler(_: usize) {
        loop {
            let _ = System::<App>::thread_sleep(TimeoutMs(100));
        }
    }

    /// Kernel-allocated stacks come from the fixed heap region; exhausting
    /// it fails thread creation cleanly, and deleting a thread returns its
    /// stack.
    #[test]
    fn stack_allocation_is_bounded_by_the_heap() {
        tern_port_std::start_kernel::<App>();

        // 16 KiB heap: two 4 KiB stacks fit (with allocator overhead), but
        // an 8 KiB one no longer does
        let a = System::<App>::thread_init(idler, 0, None, 4096, 5, "a").unwrap();
        let _b = System::<App>::thread_init(idler, 0, None, 4096, 5, "b").unwrap();
        let c = System::<App>::thread_init(idler, 0, None, 8192, 5, "c");
        assert_eq!(c, Err(thread::InitError::OutOfMemory));

        // Deleting a thread returns its stack to the heap
        System::<App>::thread_delete(a).unwrap();
        let _d = System::<App>::thread_init(idler, 0, None, 4096, 5, "d").unwrap();

        // Out-of-range stack sizes are rejected before touching the heap
        assert_eq!(
            System::<App>::thread_init(idler, 0, None, 64, 5, "tiny"),
            Err(thread::InitError::BadParam)
        );
        // Impossible priorities too
        assert_eq!(
            System::<App>::thread_init(idler, 0, None, 4096, i16::MAX, "prio"),
            Err(thread::InitError::BadParam)
        );
    }
}

mod queue_timeout {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tern_kernel::{msgqueue, System, TimeoutMs};

    tern_kernel::static_kernel! {
        pub struct App;
        cooperation_levels: 2,
        application_levels: 16,
        threads: 8,
        semaphores: 4,
        mutexes: 4,
        events: 4,
        queues: 4,
        pools: 2,
        timers: 4,
        publishers: 2,
        subscribers: 4,
        kernel_stack_size: 4096,
        heap_size: 65536,
        init_hooks: [],
    }
    tern_port_std::use_port!(impl App);

    static QUEUE_ID: std::sync::OnceLock<msgqueue::QueueId> = std::sync::OnceLock::new();
    static RESULT: AtomicUsize = AtomicUsize::new(0);

    fn timed_receiver(_: usize) {
        let q = *QUEUE_ID.get().unwrap();
        let mut buf = [0u8; 4];
        match System::<App>::queue_receive(q, &mut buf, false, TimeoutMs(30)) {
            Err(msgqueue::ReceiveError::Timeout) => RESULT.store(1, Ordering::SeqCst),
            _ => RESULT.store(2, Ordering::SeqCst),
        }
        let _ = System::<App>::thread_suspend(System::<App>::thread_current().unwrap());
    }

    /// A finite receive timeout on an empty queue delivers the timeout
    /// category, leaving the queue untouched.
    #[test]
    fn receive_timeout_fires() {
        tern_port_std::start_kernel::<App>();

        let q = System::<App>::queue_init(leak_buf(16), 4, 4, "q").unwrap();
        QUEUE_ID.set(q).unwrap();

        System::<App>::thread_init(timed_receiver, 0, None, 4096, 3, "recv").unwrap();
        wait_until("the receive to time out", 2_000, || {
            RESULT.load(Ordering::SeqCst) != 0
        });
        assert_eq!(RESULT.load(Ordering::SeqCst), 1);
        assert_eq!(System::<App>::queue_len(q).unwrap(), 0);
    }
}

mod wake_order {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use tern_kernel::{semaphore, System, TimeoutMs};

    tern_kernel::static_kernel! {
        pub struct App;
        cooperation_levels: 2,
        application_levels: 16,
        threads: 8,
        semaphores: 4,
        mutexes: 4,
        events: 4,
        queues: 4,
        pools: 2,
        timers: 4,
        publishers: 2,
        subscribers: 4,
        kernel_stack_size: 4096,
        heap_size: 65536,
        init_hooks: [],
    }
    tern_port_std::use_port!(impl App);

    static SEM_ID: std::sync::OnceLock<semaphore::SemaphoreId> = std::sync::OnceLock::new();
    static PARKED: AtomicBool = AtomicBool::new(false);
    static WAKE_ORDER: Mutex<Vec<i16>> = Mutex::new(Vec::new());

    fn waiter_body(prio: usize) {
        let sem = *SEM_ID.get().unwrap();
        System::<App>::semaphore_take(sem, TimeoutMs::FOREVER).unwrap();
        WAKE_ORDER.lock().unwrap().push(prio as i16);
        let _ = System::<App>::thread_suspend(System::<App>::thread_current().unwrap());
    }

    /// Waiters are released in priority order, not arrival order.
    #[test]
    fn waiters_release_by_priority() {
        tern_port_std::start_kernel::<App>();

        let sem = System::<App>::semaphore_init(0, 3, "order").unwrap();
        SEM_ID.set(sem).unwrap();

        // Park three waiters, lowest priority first
        for prio in [9i16, 6, 3] {
            System::<App>::thread_init(waiter_body, prio as usize, None, 4096, prio, "w")
                .unwrap();
            // Let each one reach the wait queue before the next is created
            thread::sleep(Duration::from_millis(20));
        }
        PARKED.store(true, Ordering::SeqCst);

        for _ in 0..3 {
            System::<App>::semaphore_give(sem).unwrap();
            thread::sleep(Duration::from_millis(20));
        }

        wait_until("all waiters to report", 2_000, || {
            WAKE_ORDER.lock().unwrap().len() == 3
        });
        // Highest priority (numerically smallest) out first
        assert_eq!(*WAKE_ORDER.lock().unwrap(), [3, 6, 9]);
    }
}

mod sleep_ordering {
    use super::*;
    use std::sync::Mutex;
    use tern_kernel::{System, TimeoutMs};

    tern_kernel::static_kernel! {
        pub struct App;
        cooperation_levels: 2,
        application_levels: 16,
        threads: 8,
        semaphores: 4,
        mutexes: 4,
        events: 4,
        queues: 4,
        pools: 2,
        timers: 4,
        publishers: 2,
        subscribers: 4,
        kernel_stack_size: 4096,
        heap_size: 65536,
        init_hooks: [],
    }
    tern_port_std::use_port!(impl App);

    static WAKE_ORDER: Mutex<Vec<u32>> = Mutex::new(Vec::new());

    fn sleeper_body(ms: usize) {
        System::<App>::thread_sleep(TimeoutMs(ms as u32)).unwrap();
        WAKE_ORDER.lock().unwrap().push(ms as u32);
        let _ = System::<App>::thread_suspend(System::<App>::thread_current().unwrap());
    }

    /// Sleeps armed out of order wake in expiration order: the wheel keeps
    /// its cumulative-delta ordering regardless of arming sequence.
    #[test]
    fn interleaved_sleeps_wake_in_expiration_order() {
        tern_port_std::start_kernel::<App>();

        // Same priority for all: wake order is decided by the wheel alone
        for ms in [90usize, 30, 60, 120] {
            System::<App>::thread_init(sleeper_body, ms, None, 4096, 5, "sleeper").unwrap();
        }

        wait_until("all sleepers to wake", 3_000, || {
            WAKE_ORDER.lock().unwrap().len() == 4
        });
        assert_eq!(*WAKE_ORDER.lock().unwrap(), [30, 60, 90, 120]);
    }
}
