//! Kernel behavior tests, each running a full kernel instance on this
//! port. Every test module owns a distinct kernel trait type, so the
//! instances are independent and the tests can run in parallel.
use std::{
    thread,
    time::{Duration, Instant},
};

/// Poll `cond` until it holds, panicking after `timeout_ms`.
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

mod preemption {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
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

    static LOW_ITERATIONS: AtomicU64 = AtomicU64::new(0);
    static HIGH_WOKE: AtomicBool = AtomicBool::new(false);
    static LOW_SAW_HIGH: AtomicBool = AtomicBool::new(false);
    static STOP: AtomicBool = AtomicBool::new(false);

    fn low_body(_: usize) {
        while !STOP.load(Ordering::SeqCst) {
            LOW_ITERATIONS.fetch_add(1, Ordering::SeqCst);
            if HIGH_WOKE.load(Ordering::SeqCst) {
                LOW_SAW_HIGH.store(true, Ordering::SeqCst);
            }
            // A kernel entry per iteration gives the dispatcher a
            // preemption point
            let _ = System::<App>::timer_system_total_ms();
        }
        let _ = System::<App>::thread_suspend(System::<App>::thread_current().unwrap());
    }

    fn high_body(_: usize) {
        System::<App>::thread_sleep(TimeoutMs(10)).unwrap();
        HIGH_WOKE.store(true, Ordering::SeqCst);
        let _ = System::<App>::thread_suspend(System::<App>::thread_current().unwrap());
    }

    /// A sleeping high-priority thread preempts a busy lower-priority one
    /// the moment its timeout fires.
    #[test]
    fn higher_priority_wakes_and_preempts() {
        tern_port_std::start_kernel::<App>();

        System::<App>::thread_init(low_body, 0, None, 4096, 5, "low").unwrap();
        System::<App>::thread_init(high_body, 0, None, 4096, 2, "high").unwrap();

        wait_until("the high-priority thread to wake", 2_000, || {
            HIGH_WOKE.load(Ordering::SeqCst)
        });
        // The low thread kept running while "high" slept…
        assert!(LOW_ITERATIONS.load(Ordering::SeqCst) > 0);
        // …and observed the wake afterwards
        wait_until("the low thread to observe the wake", 2_000, || {
            LOW_SAW_HIGH.load(Ordering::SeqCst)
        });
        STOP.store(true, Ordering::SeqCst);
    }
}

mod priority_inheritance {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
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

    static MUTEX_ID: std::sync::OnceLock<tern_kernel::mutex::MutexId> =
        std::sync::OnceLock::new();
    static LOW_HOLDS: AtomicBool = AtomicBool::new(false);
    static RELEASE: AtomicBool = AtomicBool::new(false);
    static HIGH_GOT_LOCK: AtomicBool = AtomicBool::new(false);

    fn mutex_id() -> tern_kernel::mutex::MutexId {
        *MUTEX_ID.get().unwrap()
    }

    fn low_body(_: usize) {
        System::<App>::mutex_lock(mutex_id()).unwrap();
        LOW_HOLDS.store(true, Ordering::SeqCst);
        while !RELEASE.load(Ordering::SeqCst) {
            let _ = System::<App>::timer_system_total_ms();
        }
        System::<App>::mutex_unlock(mutex_id()).unwrap();
        let _ = System::<App>::thread_suspend(System::<App>::thread_current().unwrap());
    }

    fn high_body(_: usize) {
        System::<App>::mutex_lock(mutex_id()).unwrap();
        HIGH_GOT_LOCK.store(true, Ordering::SeqCst);
        System::<App>::mutex_unlock(mutex_id()).unwrap();
        let _ = System::<App>::thread_suspend(System::<App>::thread_current().unwrap());
    }

    /// A contended lock lends the waiter's priority to the holder until the
    /// holder releases.
    #[test]
    fn holder_inherits_waiter_priority() {
        tern_port_std::start_kernel::<App>();

        let mutex = System::<App>::mutex_init("m").unwrap();
        MUTEX_ID.set(mutex).unwrap();

        let low = System::<App>::thread_init(low_body, 0, None, 4096, 10, "low").unwrap();
        wait_until("the low thread to take the lock", 2_000, || {
            LOW_HOLDS.load(Ordering::SeqCst)
        });
        assert_eq!(System::<App>::thread_effective_priority(low).unwrap(), 10);

        System::<App>::thread_init(high_body, 0, None, 4096, 1, "high").unwrap();
        wait_until("priority inheritance to kick in", 2_000, || {
            System::<App>::thread_effective_priority(low).unwrap() == 1
        });
        assert!(!HIGH_GOT_LOCK.load(Ordering::SeqCst));
        // The base priority is unchanged all along
        assert_eq!(System::<App>::thread_priority(low).unwrap(), 10);

        RELEASE.store(true, Ordering::SeqCst);
        wait_until("the high thread to get the lock", 2_000, || {
            HIGH_GOT_LOCK.load(Ordering::SeqCst)
        });
        assert_eq!(System::<App>::thread_effective_priority(low).unwrap(), 10);
    }
}

mod queue_handoff {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
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

    static QUEUE_ID: std::sync::OnceLock<tern_kernel::msgqueue::QueueId> =
        std::sync::OnceLock::new();
    static PRODUCER_DONE: AtomicBool = AtomicBool::new(false);
    static FIRST_RECEIVED: Mutex<Option<[u8; 4]>> = Mutex::new(None);
    static DRAINED: Mutex<Vec<[u8; 4]>> = Mutex::new(Vec::new());
    static CONSUMER_GO: AtomicBool = AtomicBool::new(false);
    static CONSUMER_DONE: AtomicBool = AtomicBool::new(false);

    fn queue_id() -> tern_kernel::msgqueue::QueueId {
        *QUEUE_ID.get().unwrap()
    }

    fn producer_body(_: usize) {
        for msg in [b"AAAA", b"BBBB", b"CCCC", b"DDDD"] {
            System::<App>::queue_send(queue_id(), msg, false, TimeoutMs::POLL).unwrap();
        }
        // The queue is full now; this send parks until the consumer drains
        // one slot, and completes inside the consumer's wake-up
        System::<App>::queue_send(queue_id(), b"EEEE", false, TimeoutMs::FOREVER).unwrap();
        PRODUCER_DONE.store(true, Ordering::SeqCst);
        let _ = System::<App>::thread_suspend(System::<App>::thread_current().unwrap());
    }

    fn consumer_body(_: usize) {
        while !CONSUMER_GO.load(Ordering::SeqCst) {
            let _ = System::<App>::timer_system_total_ms();
        }

        let mut buf = [0u8; 4];
        System::<App>::queue_receive(queue_id(), &mut buf, false, TimeoutMs::FOREVER).unwrap();
        *FIRST_RECEIVED.lock().unwrap() = Some(buf);

        while !PRODUCER_DONE.load(Ordering::SeqCst) {
            let _ = System::<App>::timer_system_total_ms();
        }

        let mut drained = Vec::new();
        while System::<App>::queue_len(queue_id()).unwrap() > 0 {
            let mut buf = [0u8; 4];
            System::<App>::queue_receive(queue_id(), &mut buf, false, TimeoutMs::POLL).unwrap();
            drained.push(buf);
        }
        *DRAINED.lock().unwrap() = drained;
        CONSUMER_DONE.store(true, Ordering::SeqCst);
        let _ = System::<App>::thread_suspend(System::<App>::thread_current().unwrap());
    }

    /// The classic producer hand-off: a receiver draining a full queue
    /// completes the blocked sender's enqueue atomically with the wake.
    #[test]
    fn blocked_send_completes_with_the_wake() {
        tern_port_std::start_kernel::<App>();

        let buffer = leak_buf(16);
        let queue = System::<App>::queue_init(buffer, 4, 4, "q").unwrap();
        QUEUE_ID.set(queue).unwrap();

        // Producer has the higher priority: it runs first and fills the
        // queue before the consumer gets a turn
        System::<App>::thread_init(producer_body, 0, None, 4096, 3, "producer").unwrap();
        System::<App>::thread_init(consumer_body, 0, None, 4096, 4, "consumer").unwrap();

        wait_until("the producer to fill the queue and park", 2_000, || {
            System::<App>::queue_len(queue).unwrap() == 4
        });
        assert!(!PRODUCER_DONE.load(Ordering::SeqCst));

        CONSUMER_GO.store(true, Ordering::SeqCst);
        wait_until("the consumer to finish", 2_000, || {
            CONSUMER_DONE.load(Ordering::SeqCst)
        });

        assert_eq!(FIRST_RECEIVED.lock().unwrap().as_ref().unwrap(), b"AAAA");
        assert_eq!(
            *DRAINED.lock().unwrap(),
            [*b"BBBB", *b"CCCC", *b"DDDD", *b"EEEE"]
        );
    }
}

mod event_edge {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
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

    static EVENT_ID: std::sync::OnceLock<tern_kernel::event::EventId> =
        std::sync::OnceLock::new();
    static WAKES: AtomicUsize = AtomicUsize::new(0);

    fn event_id() -> tern_kernel::event::EventId {
        *EVENT_ID.get().unwrap()
    }

    fn waiter_body(_: usize) {
        let mut report = EventReport { trigger: 0, value: 0 };
        loop {
            System::<App>::event_wait(event_id(), &mut report, 0x1, TimeoutMs::FOREVER).unwrap();
            WAKES.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Rising-edge configuration: only 0→1 transitions of the listened bit
    /// release the waiter; writing an unchanged value does not.
    #[test]
    fn rising_edge_triggers_once_per_edge() {
        tern_port_std::start_kernel::<App>();

        // Bit 0: edge-triggered (mode), rising (dir); nothing in `any`
        let event = System::<App>::event_init(0x0, 0x1, 0x1, 0x0, "e").unwrap();
        EVENT_ID.set(event).unwrap();

        System::<App>::thread_init(waiter_body, 0, None, 4096, 3, "waiter").unwrap();
        thread::sleep(Duration::from_millis(20));
        assert_eq!(WAKES.load(Ordering::SeqCst), 0);

        // 0 → 1: rising edge, one wake
        System::<App>::event_set(event, 0x1, 0, 0).unwrap();
        wait_until("the first wake", 2_000, || {
            WAKES.load(Ordering::SeqCst) == 1
        });

        // 1 → 1: no change, no wake
        System::<App>::event_set(event, 0x1, 0, 0).unwrap();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(WAKES.load(Ordering::SeqCst), 1);

        // 1 → 0: falling edge of a rise-configured bit, no wake
        System::<App>::event_set(event, 0, 0x1, 0).unwrap();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(WAKES.load(Ordering::SeqCst), 1);

        // 0 → 1: rising edge again
        System::<App>::event_set(event, 0x1, 0, 0).unwrap();
        wait_until("the second wake", 2_000, || {
            WAKES.load(Ordering::SeqCst) == 2
        });
    }
}

mod sleep_precision {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
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

    static ELAPSED_MS: AtomicU64 = AtomicU64::new(0);
    static DONE: AtomicBool = AtomicBool::new(false);

    fn sleeper_body(_: usize) {
        let t0 = System::<App>::timer_system_total_ms().unwrap();
        for _ in 0..10 {
            System::<App>::thread_sleep(TimeoutMs(20)).unwrap();
        }
        let t1 = System::<App>::timer_system_total_ms().unwrap();
        ELAPSED_MS.store(t1 - t0, Ordering::SeqCst);
        DONE.store(true, Ordering::SeqCst);
        let _ = System::<App>::thread_suspend(System::<App>::thread_current().unwrap());
    }

    /// Back-to-back sleeps accumulate bounded drift: each wake re-arms
    /// against the actual elapsed time.
    #[test]
    fn sleeps_do_not_accumulate_drift() {
        tern_port_std::start_kernel::<App>();
        System::<App>::thread_init(sleeper_body, 0, None, 4096, 3, "sleeper").unwrap();

        wait_until("the sleeper to finish", 5_000, || {
            DONE.load(Ordering::SeqCst)
        });
        let elapsed = ELAPSED_MS.load(Ordering::SeqCst);
        assert!(elapsed >= 200, "slept only {elapsed} ms");
        // Host scheduling adds latency, but nothing should multiply the
        // nominal duration
        assert!(elapsed < 400, "slept {elapsed} ms");
    }
}

mod pubsub {
    use super::*;
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

    /// Submissions without an intervening apply overwrite each other; the
    /// subscriber observes only the latest value.
    #[test]
    fn last_writer_wins() {
        tern_port_std::start_kernel::<App>();

        let publisher = System::<App>::publish_init("pub").unwrap();
        let sub_buf = leak_buf(4);
        let sub = System::<App>::subscribe_init(sub_buf, "sub").unwrap();
        System::<App>::subscribe_register(sub, publisher, true, None).unwrap();

        assert!(!System::<App>::subscribe_data_is_ready(sub).unwrap());

        for value in [1u32, 2, 3] {
            System::<App>::publish_data_submit(publisher, &value.to_le_bytes()).unwrap();
        }

        assert!(System::<App>::subscribe_data_is_ready(sub).unwrap());
        let mut out = [0u8; 4];
        let n = System::<App>::subscribe_data_apply(sub, &mut out).unwrap();
        assert_eq!(n, 4);
        assert_eq!(u32::from_le_bytes(out), 3);

        // The "new data" condition was consumed
        assert!(!System::<App>::subscribe_data_is_ready(sub).unwrap());
        assert!(System::<App>::subscribe_data_apply(sub, &mut out).is_err());
    }
}
