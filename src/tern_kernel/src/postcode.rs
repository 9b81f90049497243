//! The postcode return-code space.
//!
//! Every public kernel operation reports its outcome as a *postcode*, a
//! 32-bit signed value:
//!
//!  - `0` is success.
//!  - Positive values are non-failure categories produced by blocking
//!    operations ([`Postcode::WAIT_TIMEOUT`] and friends).
//!  - Negative values are failures. The magnitude packs
//!    `{component: 10 bits, source line: 13 bits, subcode: 8 bits}` so a
//!    failure can be traced to the kernel component and line that raised it.
//!
//! The kernel's typed error enums (see [`crate::error`]) convert into
//! postcodes; the conversion captures the caller's source line through
//! `#[track_caller]`, so the line recorded is the line of the `?` or
//! `.into()` that surfaced the failure.
use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering};

const COMPONENT_POS: u32 = 21;
const COMPONENT_MSK: u32 = 0x3ff;
const LINE_POS: u32 = 8;
const LINE_MSK: u32 = 0x1fff;
const SUBCODE_MSK: u32 = 0xff;

/// Kernel component numbers recorded in failure postcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Component {
    Kernel = 2,
    Thread = 3,
    Semaphore = 4,
    Mutex = 5,
    Queue = 6,
    Event = 7,
    Timer = 8,
    Pool = 9,
    Publish = 10,
}

/// A 32-bit signed operation outcome. See the module documentation.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Postcode(pub i32);

impl Postcode {
    pub const SUCCESS: Self = Self(0);

    /// A blocking operation ended because its timeout fired.
    pub const WAIT_TIMEOUT: Self = Self(1);
    /// A waiter was released by a completing operation (give, flush, …).
    pub const WAIT_AVAILABLE: Self = Self(2);
    /// A polling operation (`timeout == 0`) found the resource unavailable,
    /// or the result will be delivered later through the wait mechanism.
    pub const WAIT_UNAVAILABLE: Self = Self(3);
    /// The waited-on object was destroyed, or no data was pending.
    pub const WAIT_NODATA: Self = Self(4);

    /// Construct a failure postcode, recording the calling source line and
    /// invoking the registered trace callback.
    #[track_caller]
    pub(crate) fn failure(component: Component, subcode: u8) -> Self {
        let line = core::panic::Location::caller().line() & LINE_MSK;
        let code = ((component as u32 & COMPONENT_MSK) << COMPONENT_POS)
            | (line << LINE_POS)
            | subcode as u32;
        let this = Self(-(code as i32));
        trace_failure(component, line);
        this
    }

    #[inline]
    pub fn is_success(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn is_failure(self) -> bool {
        self.0 < 0
    }

    /// The component number of a failure postcode.
    pub fn component(self) -> Option<u16> {
        self.is_failure()
            .then(|| ((self.0.unsigned_abs() >> COMPONENT_POS) & COMPONENT_MSK) as u16)
    }

    /// The source line recorded in a failure postcode.
    pub fn line(self) -> Option<u32> {
        self.is_failure()
            .then(|| (self.0.unsigned_abs() >> LINE_POS) & LINE_MSK)
    }

    /// The subcode of a failure postcode.
    pub fn subcode(self) -> Option<u8> {
        self.is_failure()
            .then(|| (self.0.unsigned_abs() & SUBCODE_MSK) as u8)
    }
}

impl fmt::Debug for Postcode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Self::SUCCESS => f.write_str("Postcode(SUCCESS)"),
            Self::WAIT_TIMEOUT => f.write_str("Postcode(WAIT_TIMEOUT)"),
            Self::WAIT_AVAILABLE => f.write_str("Postcode(WAIT_AVAILABLE)"),
            Self::WAIT_UNAVAILABLE => f.write_str("Postcode(WAIT_UNAVAILABLE)"),
            Self::WAIT_NODATA => f.write_str("Postcode(WAIT_NODATA)"),
            _ => f
                .debug_struct("Postcode")
                .field("component", &self.component())
                .field("line", &self.line())
                .field("subcode", &self.subcode())
                .finish(),
        }
    }
}

/// The signature of the failure trace callback: `(component, source line)`.
pub type TraceFn = fn(u16, u32);

static TRACE_FN: AtomicUsize = AtomicUsize::new(0);

/// Register a callback invoked with `(component, line)` whenever a failure
/// postcode is constructed. Diagnostic only; it does not affect kernel state.
pub fn trace_failure_set(f: TraceFn) {
    TRACE_FN.store(f as usize, Ordering::Relaxed);
}

fn trace_failure(component: Component, line: u32) {
    let raw = TRACE_FN.load(Ordering::Relaxed);
    if raw != 0 {
        // Safety: The value was stored from a `TraceFn` in `trace_failure_set`
        let f: TraceFn = unsafe { core::mem::transmute(raw) };
        f(component as u16, line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_packs_component_line_subcode() {
        let pc = Postcode::failure(Component::Queue, 0x5a);
        assert!(pc.is_failure());
        assert!(!pc.is_success());
        assert_eq!(pc.component(), Some(Component::Queue as u16));
        assert_eq!(pc.subcode(), Some(0x5a));
        // The line is this file's call site above; only check plausibility
        let line = pc.line().unwrap();
        assert!(line > 0 && line < 8192);
    }

    #[test]
    fn categories_are_positive_and_distinct() {
        let cats = [
            Postcode::WAIT_TIMEOUT,
            Postcode::WAIT_AVAILABLE,
            Postcode::WAIT_UNAVAILABLE,
            Postcode::WAIT_NODATA,
        ];
        for (i, a) in cats.iter().enumerate() {
            assert!(a.0 > 0);
            assert!(!a.is_failure());
            for b in &cats[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn trace_callback_observes_failures() {
        use std::sync::atomic::{AtomicU32, Ordering};
        static LAST: AtomicU32 = AtomicU32::new(0);

        trace_failure_set(|component, line| {
            // Other tests may raise failures concurrently; only record ours
            if component == Component::Mutex as u16 {
                LAST.store((component as u32) << 16 | line, Ordering::Relaxed);
            }
        });
        let pc = Postcode::failure(Component::Mutex, 1);
        let last = LAST.load(Ordering::Relaxed);
        assert_eq!(last >> 16, Component::Mutex as u32);
        assert_eq!(last & 0xffff, pc.line().unwrap());
    }
}
