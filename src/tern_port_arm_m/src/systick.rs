//! The SysTick-based tick source.
//!
//! SysTick is a 24-bit down-counter clocked at the processor frequency. The
//! kernel programs one interval at a time ([`time_interval_set`]); the
//! counter wrapping to the reload value raises the tick interrupt, and
//! [`time_elapsed_us`] reports the microseconds consumed since the interval
//! was programmed, accounting for any wraps that occurred while the
//! interrupt was held off.
//!
//! Reading the wrap flag and the counter is not atomic, so the elapsed
//! readback re-checks the flag until it observes a stable pair.
use core::cell::UnsafeCell;

use tern_kernel::{PortToKernel, TIME_FOREVER_US};

use crate::{PortInstance, SysTickOptions};

/// SysTick's counter is 24 bits wide.
const MAX_RELOAD: u64 = 0x00ff_ffff;

/// Per-instance SysTick bookkeeping. Accessed with CPU Lock active only.
pub struct SysTickState {
    inner: UnsafeCell<SysTickInner>,
}

struct SysTickInner {
    /// The cycle count of the programmed period (`RELOAD + 1`).
    period_cycles: u64,

    /// Wraps observed (and consumed from the wrap flag) since the last
    /// program edge.
    wraps: u64,

    /// `false` while parked by `TIME_FOREVER_US`.
    armed: bool,
}

impl SysTickState {
    #[allow(clippy::new_without_default)]
    pub const fn new() -> Self {
        Self {
            inner: UnsafeCell::new(SysTickInner {
                period_cycles: MAX_RELOAD + 1,
                wraps: 0,
                armed: false,
            }),
        }
    }
}

// Safety: Accessed with CPU Lock active only
unsafe impl Sync for SysTickState {}

const fn cycles_from_us<Traits: SysTickOptions>(us: u64) -> u64 {
    us * Traits::FREQUENCY / 1_000_000
}

fn us_from_cycles<Traits: SysTickOptions>(cycles: u64) -> u64 {
    cycles * 1_000_000 / Traits::FREQUENCY
}

fn syst() -> cortex_m::peripheral::SYST {
    // Safety: The port owns SysTick
    unsafe { cortex_m::Peripherals::steal().SYST }
}

/// # Safety
///
/// CPU Lock active.
pub unsafe fn time_enable<Traits: PortInstance + SysTickOptions>() {
    let mut syst = syst();
    syst.set_clock_source(cortex_m::peripheral::syst::SystClkSource::Core);
    syst.set_reload(MAX_RELOAD as u32);
    syst.clear_current();
    syst.enable_counter();
}

/// # Safety
///
/// CPU Lock active.
pub unsafe fn time_disable<Traits: PortInstance + SysTickOptions>() {
    let mut syst = syst();
    syst.disable_interrupt();
    syst.disable_counter();
}

/// Program the next tick interrupt and restart the elapsed measurement.
///
/// # Safety
///
/// CPU Lock active.
pub unsafe fn time_interval_set<Traits: PortInstance + SysTickOptions>(us: u32) {
    // Safety: CPU Lock active
    let inner = unsafe { &mut *Traits::port_state().systick.inner.get() };
    let mut syst = syst();

    if us == TIME_FOREVER_US {
        // Park the counter: no interrupt, maximum period. The clock stands
        // still until the next interval is programmed.
        syst.disable_interrupt();
        syst.set_reload(MAX_RELOAD as u32);
        syst.clear_current();
        let _ = syst.has_wrapped();
        inner.period_cycles = MAX_RELOAD + 1;
        inner.wraps = 0;
        inner.armed = false;
        return;
    }

    let min_cycles = cycles_from_us::<Traits>(Traits::MIN_INTERVAL_US as u64).max(1);
    let cycles = cycles_from_us::<Traits>(us as u64).clamp(min_cycles, MAX_RELOAD + 1);

    syst.set_reload((cycles - 1) as u32);
    syst.clear_current();
    // Consume a stale wrap flag left over from the previous period
    let _ = syst.has_wrapped();
    syst.enable_interrupt();

    inner.period_cycles = cycles;
    inner.wraps = 0;
    inner.armed = true;
}

/// Microseconds elapsed since the last [`time_interval_set`] edge.
///
/// # Safety
///
/// CPU Lock active.
pub unsafe fn time_elapsed_us<Traits: PortInstance + SysTickOptions>() -> u32 {
    // Safety: CPU Lock active
    let inner = unsafe { &mut *Traits::port_state().systick.inner.get() };
    if !inner.armed {
        return 0;
    }

    let mut syst = syst();
    let reload = inner.period_cycles - 1;

    // Read the counter and the wrap flag until the pair is stable: the
    // counter may wrap between the two reads, and reading the flag clears
    // it, so every observed wrap must be accumulated.
    let current = loop {
        if syst.has_wrapped() {
            inner.wraps += 1;
            continue;
        }
        let value = cortex_m::peripheral::SYST::get_current() as u64;
        if syst.has_wrapped() {
            // Wrapped right after the read; the value is from the old
            // period
            inner.wraps += 1;
            continue;
        }
        break value;
    };

    let cycles = inner.wraps * inner.period_cycles + (reload - current);
    us_from_cycles::<Traits>(cycles).min(u32::MAX as u64 - 1) as u32
}

/// The SysTick interrupt body: forward the tick to the kernel.
///
/// # Safety
///
/// Interrupt context, CPU Lock inactive.
pub unsafe fn handle_tick<Traits: PortInstance + SysTickOptions>() {
    // Safety: Interrupt context, CPU Lock inactive
    unsafe { <Traits as PortToKernel>::timer_tick() };
}
