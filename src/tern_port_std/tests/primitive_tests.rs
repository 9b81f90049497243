//! Primitive-level behavior and boundary tests.
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

mod semaphores {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
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
    static TOOK: AtomicUsize = AtomicUsize::new(0);
    static TIMEOUT_MEASURED_MS: AtomicUsize = AtomicUsize::new(0);
    static TIMED_OUT: AtomicBool = AtomicBool::new(false);

    fn taker_body(_: usize) {
        let sem = *SEM_ID.get().unwrap();
        System::<App>::semaphore_take(sem, TimeoutMs::FOREVER).unwrap();
        TOOK.fetch_add(1, Ordering::SeqCst);
        let _ = System::<App>::thread_suspend(System::<App>::thread_current().unwrap());
    }

    fn timed_taker_body(_: usize) {
        let sem = *SEM_ID.get().unwrap();
        let t0 = System::<App>::timer_system_total_ms().unwrap();
        let r = System::<App>::semaphore_take(sem, TimeoutMs(30));
        let t1 = System::<App>::timer_system_total_ms().unwrap();
        assert_eq!(r, Err(semaphore::TakeError::Timeout));
        TIMEOUT_MEASURED_MS.store((t1 - t0) as usize, Ordering::SeqCst);
        TIMED_OUT.store(true, Ordering::SeqCst);
        let _ = System::<App>::thread_suspend(System::<App>::thread_current().unwrap());
    }

    #[test]
    fn uncontested_give_take_round_trips() {
        tern_port_std::start_kernel::<App>();
        let sem = System::<App>::semaphore_init(1, 3, "s").unwrap();

        assert_eq!(System::<App>::semaphore_remaining(sem).unwrap(), 1);
        System::<App>::semaphore_take(sem, TimeoutMs::POLL).unwrap();
        assert_eq!(System::<App>::semaphore_remaining(sem).unwrap(), 0);
        System::<App>::semaphore_give(sem).unwrap();
        assert_eq!(System::<App>::semaphore_remaining(sem).unwrap(), 1);

        // Polling an empty semaphore never blocks
        System::<App>::semaphore_take(sem, TimeoutMs::POLL).unwrap();
        assert_eq!(
            System::<App>::semaphore_take(sem, TimeoutMs::POLL),
            Err(tern_kernel::semaphore::TakeError::Unavailable)
        );

        // Saturation: the limit is 3
        for _ in 0..3 {
            System::<App>::semaphore_give(sem).unwrap();
        }
        assert_eq!(
            System::<App>::semaphore_give(sem),
            Err(tern_kernel::semaphore::GiveError::Saturated)
        );

        // A blocked taker gets the token straight from `give`
        SEM_ID.set(sem).unwrap();
        for _ in 0..3 {
            System::<App>::semaphore_take(sem, TimeoutMs::POLL).unwrap();
        }
        System::<App>::thread_init(taker_body, 0, None, 4096, 3, "taker").unwrap();
        thread::sleep(Duration::from_millis(20));
        assert_eq!(TOOK.load(Ordering::SeqCst), 0);
        System::<App>::semaphore_give(sem).unwrap();
        wait_until("the taker to be released", 2_000, || {
            TOOK.load(Ordering::SeqCst) == 1
        });
        // The token went to the waiter, not to the count
        assert_eq!(System::<App>::semaphore_remaining(sem).unwrap(), 0);

        // A finite timeout fires within tolerance
        System::<App>::thread_init(timed_taker_body, 0, None, 4096, 3, "timed").unwrap();
        wait_until("the timed taker to time out", 2_000, || {
            TIMED_OUT.load(Ordering::SeqCst)
        });
        let measured = TIMEOUT_MEASURED_MS.load(Ordering::SeqCst);
        assert!((30..150).contains(&measured), "timed out after {measured} ms");
    }
}

mod sem_delete {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
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
    static GOT_NODATA: AtomicBool = AtomicBool::new(false);

    fn waiter_body(_: usize) {
        let sem = *SEM_ID.get().unwrap();
        let r = System::<App>::semaphore_take(sem, TimeoutMs::FOREVER);
        assert_eq!(r, Err(semaphore::TakeError::NoData));
        GOT_NODATA.store(true, Ordering::SeqCst);
        let _ = System::<App>::thread_suspend(System::<App>::thread_current().unwrap());
    }

    /// Destroying a semaphore releases its waiters with the "no data"
    /// sentinel and frees the pool slot.
    #[test]
    fn delete_wakes_waiters_with_nodata() {
        tern_port_std::start_kernel::<App>();
        let sem = System::<App>::semaphore_init(0, 1, "s").unwrap();
        SEM_ID.set(sem).unwrap();

        System::<App>::thread_init(waiter_body, 0, None, 4096, 3, "waiter").unwrap();
        thread::sleep(Duration::from_millis(20));

        System::<App>::semaphore_delete(sem).unwrap();
        wait_until("the waiter to observe the deletion", 2_000, || {
            GOT_NODATA.load(Ordering::SeqCst)
        });

        // The handle is dead now
        assert!(System::<App>::semaphore_give(sem).is_err());

        // The slot can be claimed again
        let again = System::<App>::semaphore_init(1, 1, "s2").unwrap();
        assert_eq!(again, sem);
    }
}

mod timers {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tern_kernel::{timer::TimerMode, System};

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

    static ONCE_FIRES: AtomicUsize = AtomicUsize::new(0);
    static CYCLE_FIRES: AtomicUsize = AtomicUsize::new(0);

    fn once_cb(_: usize) {
        ONCE_FIRES.fetch_add(1, Ordering::SeqCst);
    }

    fn cycle_cb(_: usize) {
        CYCLE_FIRES.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn one_shot_fires_once() {
        tern_port_std::start_kernel::<App>();

        let timer = System::<App>::timer_init(once_cb, 0, "once").unwrap();
        assert!(!System::<App>::timer_busy(timer).unwrap());

        System::<App>::timer_start(timer, TimerMode::Once, 20).unwrap();
        assert!(System::<App>::timer_busy(timer).unwrap());

        wait_until("the one-shot to fire", 2_000, || {
            ONCE_FIRES.load(Ordering::SeqCst) == 1
        });
        thread::sleep(Duration::from_millis(60));
        assert_eq!(ONCE_FIRES.load(Ordering::SeqCst), 1);
        assert!(!System::<App>::timer_busy(timer).unwrap());

        // Zero timeouts are rejected
        assert!(System::<App>::timer_start(timer, TimerMode::Once, 0).is_err());
    }

    #[test]
    fn periodic_fires_repeatedly_and_stops() {
        tern_port_std::start_kernel::<App>();

        let timer = System::<App>::timer_init(cycle_cb, 0, "cycle").unwrap();
        System::<App>::timer_start(timer, TimerMode::Cycle, 20).unwrap();

        wait_until("a few periodic fires", 5_000, || {
            CYCLE_FIRES.load(Ordering::SeqCst) >= 5
        });

        System::<App>::timer_stop(timer).unwrap();
        assert!(!System::<App>::timer_busy(timer).unwrap());
        let after_stop = CYCLE_FIRES.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(100));
        // At most one further fire could have been in flight at stop time
        assert!(CYCLE_FIRES.load(Ordering::SeqCst) <= after_stop + 1);
    }

}

mod temporary_timer {
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

    static AUTO_FIRES: AtomicUsize = AtomicUsize::new(0);

    fn auto_cb(arg: usize) {
        AUTO_FIRES.fetch_add(arg, Ordering::SeqCst);
    }

    /// A temporary timer fires once and then releases its own pool slot.
    #[test]
    fn temporary_timer_frees_its_slot() {
        tern_port_std::start_kernel::<App>();

        let timer = System::<App>::timer_automatic(auto_cb, 1, 20, "auto").unwrap();
        wait_until("the temporary timer to fire", 2_000, || {
            AUTO_FIRES.load(Ordering::SeqCst) == 1
        });
        thread::sleep(Duration::from_millis(50));
        // It fired exactly once
        assert_eq!(AUTO_FIRES.load(Ordering::SeqCst), 1);

        // The slot was released after the firing; the handle is dead
        assert!(System::<App>::timer_busy(timer).is_err());
    }
}

mod boundaries {
    use super::*;
    use tern_kernel::{msgqueue, pool, System, TimeoutMs};

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

    #[test]
    fn contract_violations_are_rejected() {
        tern_port_std::start_kernel::<App>();

        // A pool with more elements than the bitmap can track
        assert_eq!(
            System::<App>::pool_init(leak_buf(33 * 8), 8, 33, "p"),
            Err(pool::InitError::BadParam)
        );

        // A pool at the limit is fine
        let p = System::<App>::pool_init(leak_buf(32 * 8), 8, 32, "p").unwrap();
        let elem = System::<App>::pool_take(p, 8, TimeoutMs::POLL).unwrap();
        System::<App>::pool_release(p, elem).unwrap();

        // Foreign and misaligned pointers are rejected by release
        let foreign = Box::leak(Box::new(0u64));
        assert_eq!(
            System::<App>::pool_release(
                p,
                std::ptr::NonNull::new(foreign as *mut u64 as *mut u8).unwrap()
            ),
            Err(pool::ReleaseError::BadParam)
        );

        // Oversized queue elements are rejected
        let q = System::<App>::queue_init(leak_buf(16), 4, 4, "q").unwrap();
        assert_eq!(
            System::<App>::queue_send(q, b"TOO LONG", false, TimeoutMs::POLL),
            Err(msgqueue::SendError::BadParam)
        );

        // An empty queue polled for receive reports unavailability
        let mut buf = [0u8; 4];
        assert_eq!(
            System::<App>::queue_receive(q, &mut buf, false, TimeoutMs::POLL),
            Err(msgqueue::ReceiveError::Unavailable)
        );

        // Front-insertion jumps the line
        System::<App>::queue_send(q, b"2222", false, TimeoutMs::POLL).unwrap();
        System::<App>::queue_send(q, b"1111", true, TimeoutMs::POLL).unwrap();
        System::<App>::queue_receive(q, &mut buf, false, TimeoutMs::POLL).unwrap();
        assert_eq!(&buf, b"1111");
        // Back-removal takes the newest
        System::<App>::queue_send(q, b"3333", false, TimeoutMs::POLL).unwrap();
        System::<App>::queue_receive(q, &mut buf, true, TimeoutMs::POLL).unwrap();
        assert_eq!(&buf, b"3333");
    }

    #[test]
    fn exhausted_pools_report_no_slot() {
        tern_port_std::start_kernel::<App>();

        // The mutex pool holds 4 entries
        for i in 0..4 {
            // Interleave with the other test sharing this kernel: tolerate
            // slots claimed by it
            if System::<App>::mutex_init("m").is_err() {
                assert!(i > 0, "no mutex slot at all");
                return;
            }
        }
        assert!(matches!(
            System::<App>::mutex_init("m"),
            Err(tern_kernel::mutex::InitError::NoSlot)
        ));
    }
}

mod thread_lifecycle {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
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
        heap_size: 65536,
        init_hooks: [],
    }
    tern_port_std::use_port!(impl App);

    static SLEEPER_RESULT: AtomicUsize = AtomicUsize::new(0);
    static EXITED: AtomicBool = AtomicBool::new(false);

    fn sleeper_body(_: usize) {
        // Resumed mid-sleep: the sleep reports the interruption
        match System::<App>::thread_sleep(TimeoutMs(10_000)) {
            Err(thread::SleepError::Interrupted) => {
                SLEEPER_RESULT.store(1, Ordering::SeqCst);
            }
            other => {
                let _ = other;
                SLEEPER_RESULT.store(2, Ordering::SeqCst);
            }
        }
        let _ = System::<App>::thread_suspend(System::<App>::thread_current().unwrap());
    }

    fn short_lived_body(_: usize) {
        EXITED.store(true, Ordering::SeqCst);
        // Returning from the entry function deletes the thread
    }

    #[test]
    fn resume_interrupts_sleep() {
        tern_port_std::start_kernel::<App>();

        let sleeper =
            System::<App>::thread_init(sleeper_body, 0, None, 4096, 3, "sleeper").unwrap();
        std::thread::sleep(Duration::from_millis(30));

        System::<App>::thread_resume(sleeper).unwrap();
        wait_until("the sleeper to report", 2_000, || {
            SLEEPER_RESULT.load(Ordering::SeqCst) != 0
        });
        assert_eq!(SLEEPER_RESULT.load(Ordering::SeqCst), 1);

        // Zero-duration sleeps are rejected outright
        assert_eq!(
            System::<App>::thread_sleep(TimeoutMs(0)),
            Err(thread::SleepError::BadParam)
        );
    }

    #[test]
    fn entry_return_releases_the_slot() {
        tern_port_std::start_kernel::<App>();

        let t = System::<App>::thread_init(short_lived_body, 0, None, 4096, 4, "brief").unwrap();
        wait_until("the thread to run", 2_000, || EXITED.load(Ordering::SeqCst));
        // After the trampoline delete, the handle is dead
        wait_until("the slot to be released", 2_000, || {
            System::<App>::thread_user_data_get(t).is_err()
        });
    }

    #[test]
    fn user_data_and_names_round_trip() {
        tern_port_std::start_kernel::<App>();

        static DATUM: u32 = 7;
        let t = System::<App>::thread_init(
            |_| loop {
                let _ = System::<App>::thread_sleep(TimeoutMs(50));
            },
            0,
            None,
            4096,
            5,
            "roundtrip",
        )
        .unwrap();

        System::<App>::thread_user_data_set(t, &DATUM as *const u32 as *mut ()).unwrap();
        assert_eq!(
            System::<App>::thread_user_data_get(t).unwrap(),
            &DATUM as *const u32 as *mut ()
        );
        assert_eq!(System::<App>::thread_name(t).unwrap(), "roundtrip");
        assert_eq!(System::<App>::thread_priority(t).unwrap(), 5);

        // The stack was filled with the probe pattern; a mostly-idle thread
        // leaves most of it untouched
        let free = System::<App>::thread_stack_free_size_probe(t).unwrap();
        assert!(free > 0);
    }
}
