//! A small producer/consumer demonstration on the hosted port.
//!
//! A producer thread pushes readings into a message queue every 100 ms; a
//! periodic software timer publishes a heartbeat through a pub/sub cell; the
//! consumer drains both.
use std::sync::{
    atomic::{AtomicU32, Ordering},
    OnceLock,
};

use tern_kernel::{timer::TimerMode, System, TimeoutMs};

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

static QUEUE: OnceLock<tern_kernel::msgqueue::QueueId> = OnceLock::new();
static PUBLISHER: OnceLock<tern_kernel::pubsub::PublishId> = OnceLock::new();
static SUB: OnceLock<tern_kernel::pubsub::SubscribeId> = OnceLock::new();

fn producer(_: usize) {
    let queue = *QUEUE.get().unwrap();
    for reading in 0u32.. {
        System::<App>::queue_send(queue, &reading.to_le_bytes(), false, TimeoutMs::FOREVER)
            .unwrap();
        System::<App>::thread_sleep(TimeoutMs(100)).unwrap();
    }
}

fn consumer(_: usize) {
    let queue = *QUEUE.get().unwrap();
    let sub = *SUB.get().unwrap();
    loop {
        let mut buf = [0u8; 4];
        System::<App>::queue_receive(queue, &mut buf, false, TimeoutMs::FOREVER).unwrap();
        println!("reading: {}", u32::from_le_bytes(buf));

        if System::<App>::subscribe_data_is_ready(sub).unwrap() {
            let mut beat = [0u8; 4];
            System::<App>::subscribe_data_apply(sub, &mut beat).unwrap();
            println!("heartbeat: {}", u32::from_le_bytes(beat));
        }
    }
}

/// The timer callback, run on the kernel housekeeping thread.
fn heartbeat(_: usize) {
    static BEATS: AtomicU32 = AtomicU32::new(0);
    let n = BEATS.fetch_add(1, Ordering::Relaxed);
    let _ = System::<App>::publish_data_submit(*PUBLISHER.get().unwrap(), &n.to_le_bytes());
}

fn main() {
    tern_port_std::start_kernel::<App>();

    let buffer = Box::leak(vec![0u8; 64].into_boxed_slice());
    QUEUE
        .set(System::<App>::queue_init(buffer, 4, 16, "readings").unwrap())
        .unwrap();

    let publisher = System::<App>::publish_init("heartbeat.pub").unwrap();
    PUBLISHER.set(publisher).unwrap();
    let sub_buf = Box::leak(vec![0u8; 4].into_boxed_slice());
    let sub = System::<App>::subscribe_init(sub_buf, "heartbeat.sub").unwrap();
    System::<App>::subscribe_register(sub, publisher, true, None).unwrap();
    SUB.set(sub).unwrap();

    System::<App>::thread_init(producer, 0, None, 4096, 3, "producer").unwrap();
    System::<App>::thread_init(consumer, 0, None, 4096, 4, "consumer").unwrap();

    let heartbeat_timer = System::<App>::timer_init(heartbeat, 0, "heartbeat").unwrap();
    System::<App>::timer_start(heartbeat_timer, TimerMode::Cycle, 500).unwrap();

    std::thread::sleep(std::time::Duration::from_secs(3));
}
