//! Event flags.
//!
//! An event object carries a 32-bit value and three configuration masks
//! deciding which value changes produce *trigger* bits:
//!
//!  - `any_mask` — any change of these bits triggers;
//!  - `mode_mask` — set bits are edge-triggered, clear bits level-triggered;
//!  - `dir_mask` — for edge bits, set = rising, clear = falling; for level
//!    bits, set = high, clear = low.
//!
//! Trigger bits not claimed by any waiter are latched in `triggered` and
//! delivered to the next matching `wait`.
use core::{cell::Cell, fmt};

use crate::{
    cfg::{self, ObjectCs},
    error::{impl_postcode, WaitEndError},
    klock::{self, CpuLockCell, CpuLockTokenRefMut},
    task,
    time::WaitTime,
    utils::Init,
    wait::{WaitPayload, WaitQueue},
    Component, Id, KernelTraits, System, TimeoutMs,
};

/// Identifies an event object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventId(pub(crate) Id);

/// What an ended wait reports: the trigger word that released the waiter and
/// the committed value.
///
/// The `value` field doubles as the waiter's last-seen value on input to
/// [`System::event_wait`]; level-triggered and `any`-masked conditions are
/// evaluated against it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventReport {
    pub trigger: u32,
    pub value: u32,
}

impl Init for EventReport {
    const INIT: Self = Self {
        trigger: 0,
        value: 0,
    };
}

/// *Event control block* — the state data of an event object.
#[doc(hidden)]
pub struct EventCb<Traits: KernelTraits> {
    pub(crate) cs: CpuLockCell<Traits, ObjectCs>,
    pub(crate) name: CpuLockCell<Traits, &'static str>,

    /// The event signal value.
    pub(crate) value: CpuLockCell<Traits, u32>,

    /// Changed bits always trigger = 1; see `dir_mask` otherwise.
    pub(crate) any_mask: CpuLockCell<Traits, u32>,

    /// Level trigger = 0, edge trigger = 1.
    pub(crate) mode_mask: CpuLockCell<Traits, u32>,

    /// Fall or low trigger = 0, rise or high trigger = 1.
    pub(crate) dir_mask: CpuLockCell<Traits, u32>,

    /// Trigger bits produced but not yet claimed by any waiter.
    pub(crate) triggered: CpuLockCell<Traits, u32>,

    pub(crate) wait_queue: WaitQueue<Traits>,
}

impl<Traits: KernelTraits> Init for EventCb<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        cs: Init::INIT,
        name: Init::INIT,
        value: Init::INIT,
        any_mask: Init::INIT,
        mode_mask: Init::INIT,
        dir_mask: Init::INIT,
        triggered: Init::INIT,
        wait_queue: Init::INIT,
    };
}

impl<Traits: KernelTraits> fmt::Debug for EventCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("EventCb")
            .field("self", &(self as *const _))
            .field("name", &self.name)
            .field("value", &self.value)
            .field("triggered", &self.triggered)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitError {
    NoSlot,
    BadContext,
}
impl_postcode!(InitError, Component::Event, {
    NoSlot => 4,
    BadContext => 2,
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetError {
    BadId,
    BadContext,
}
impl_postcode!(SetError, Component::Event, {
    BadId => 1,
    BadContext => 2,
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    /// `timeout == POLL` and nothing listened-for is pending.
    Unavailable,
    Timeout,
    /// The event object was deleted while waiting.
    NoData,
    BadId,
    BadContext,
}
impl_postcode!(WaitError, Component::Event, {
    Unavailable => unavailable,
    Timeout => timeout,
    NoData => nodata,
    BadId => 1,
    BadContext => 2,
});

/// Compute the trigger word produced by a value transition `old → new`.
fn compute_trigger(any: u32, mode: u32, dir: u32, old: u32, new: u32) -> u32 {
    let changed = new ^ old;
    let edge = mode;
    let level = !mode;

    (any & changed)
        | (edge & new & dir & changed)
        | (edge & !new & !dir & changed)
        | (level & new & dir & changed)
        | (level & !new & !dir & changed)
}

impl<Traits: KernelTraits> System<Traits> {
    fn event_cb(
        id: EventId,
        lock: CpuLockTokenRefMut<'_, Traits>,
    ) -> Result<&'static EventCb<Traits>, crate::error::BadIdError> {
        cfg::get_cb(Traits::event_cb_pool(), id.0, lock, |cb| &cb.cs)
    }

    /// Create an event object with the given trigger configuration and
    /// initial value.
    pub fn event_init(
        any_mask: u32,
        mode_mask: u32,
        dir_mask: u32,
        init_value: u32,
        name: &'static str,
    ) -> Result<EventId, InitError> {
        let mut lock = klock::CpuLockGuard::<Traits>::acquire().map_err(|_| InitError::BadContext)?;

        let (index, cb) =
            cfg::claim_slot(Traits::event_cb_pool(), lock.borrow_mut(), |cb| &cb.cs)
                .ok_or(InitError::NoSlot)?;

        cb.name.replace(&mut *lock.borrow_mut(), name);
        cb.any_mask.replace(&mut *lock.borrow_mut(), any_mask);
        cb.mode_mask.replace(&mut *lock.borrow_mut(), mode_mask);
        cb.dir_mask.replace(&mut *lock.borrow_mut(), dir_mask);
        cb.value.replace(&mut *lock.borrow_mut(), init_value);
        cb.triggered.replace(&mut *lock.borrow_mut(), 0);

        Ok(EventId(cfg::id_from_index(index)))
    }

    /// Update the event value: `new = ((value & !clear) | set) ^ toggle`.
    ///
    /// Waiters whose listen masks intersect the produced trigger word are
    /// released in priority order; unclaimed trigger bits are latched for
    /// future waiters.
    pub fn event_set(
        id: EventId,
        set_bits: u32,
        clear_bits: u32,
        toggle_bits: u32,
    ) -> Result<(), SetError> {
        let mut lock = klock::CpuLockGuard::<Traits>::acquire().map_err(|_| SetError::BadContext)?;
        let cb = Self::event_cb(id, lock.borrow_mut()).map_err(|_| SetError::BadId)?;

        let old = cb.value.get(&*lock);
        let new = ((old & !clear_bits) | set_bits) ^ toggle_bits;

        let trigger = compute_trigger(
            cb.any_mask.get(&*lock),
            cb.mode_mask.get(&*lock),
            cb.dir_mask.get(&*lock),
            old,
            new,
        ) | cb.triggered.get(&*lock);

        // Release matching waiters in priority order, recording which
        // trigger bits got claimed
        let mut consumed = 0u32;
        let mut woke_any = false;
        cb.wait_queue
            .wake_up_all_conditional(lock.borrow_mut(), |payload, l| match payload {
                WaitPayload::EventWait { listen, out } => {
                    let report = trigger & listen;
                    if report != 0 {
                        out.read(&*l).set(EventReport {
                            trigger,
                            value: new,
                        });
                        consumed |= report;
                        woke_any = true;
                        true
                    } else {
                        false
                    }
                }
                _ => unreachable!(),
            });

        // Latch the unclaimed trigger bits and commit the value
        cb.triggered.replace(&mut *lock.borrow_mut(), trigger & !consumed);
        cb.value.replace(&mut *lock.borrow_mut(), new);

        if woke_any {
            task::unlock_cpu_and_check_preemption(lock);
        }
        Ok(())
    }

    /// Wait for trigger bits matching `listen`.
    ///
    /// On entry `report.value` must hold the caller's last-seen value; the
    /// trigger computation runs against it, so standing level conditions are
    /// observed immediately. On success `report` receives the full trigger
    /// word and the current value.
    pub fn event_wait(
        id: EventId,
        report: &mut EventReport,
        listen: u32,
        timeout: TimeoutMs,
    ) -> Result<(), WaitError> {
        let mut lock = klock::CpuLockGuard::<Traits>::acquire().map_err(|_| WaitError::BadContext)?;
        let cb = Self::event_cb(id, lock.borrow_mut()).map_err(|_| WaitError::BadId)?;

        // Evaluate the condition against the caller's last-seen value
        let value = cb.value.get(&*lock);
        let trigger = compute_trigger(
            cb.any_mask.get(&*lock),
            cb.mode_mask.get(&*lock),
            cb.dir_mask.get(&*lock),
            report.value,
            value,
        ) | cb.triggered.get(&*lock);

        let matched = trigger & listen;
        if matched != 0 {
            // Claim the matched bits out of the latch
            let latched = cb.triggered.get(&*lock);
            cb.triggered
                .replace(&mut *lock.borrow_mut(), latched & !matched);
            *report = EventReport { trigger, value };
            return Ok(());
        }

        let delta_us = match timeout.policy() {
            WaitTime::Poll => return Err(WaitError::Unavailable),
            WaitTime::Finite(us) => Some(us),
            WaitTime::Forever => None,
        };

        task::expect_waitable_context::<Traits>().map_err(|_| WaitError::BadContext)?;

        let payload = WaitPayload::EventWait {
            listen,
            out: CpuLockCell::new(Cell::new(EventReport::INIT)),
        };

        let result = match delta_us {
            Some(us) => cb.wait_queue.wait_timeout(lock.borrow_mut(), payload, us),
            None => cb.wait_queue.wait(lock.borrow_mut(), payload),
        };

        match result {
            Ok(WaitPayload::EventWait { out, .. }) => {
                // The releasing `event_set` stored the report in the payload
                // cell; fetch it back out
                *report = out.read(&*lock).get();
                Ok(())
            }
            Ok(_) => unreachable!(),
            Err(WaitEndError::Timeout) => Err(WaitError::Timeout),
            Err(WaitEndError::Deleted) => Err(WaitError::NoData),
        }
    }

    /// The current event value.
    pub fn event_value(id: EventId) -> Result<u32, SetError> {
        let mut lock = klock::CpuLockGuard::<Traits>::acquire().map_err(|_| SetError::BadContext)?;
        let cb = Self::event_cb(id, lock.borrow_mut()).map_err(|_| SetError::BadId)?;
        Ok(cb.value.get(&*lock))
    }

    /// Destroy the event object. Blocked waiters are released with a "no
    /// data" result.
    pub fn event_delete(id: EventId) -> Result<(), SetError> {
        let mut lock = klock::CpuLockGuard::<Traits>::acquire().map_err(|_| SetError::BadContext)?;
        let cb = Self::event_cb(id, lock.borrow_mut()).map_err(|_| SetError::BadId)?;

        cb.wait_queue
            .wake_up_all(lock.borrow_mut(), Err(WaitEndError::Deleted));

        cb.name.replace(&mut *lock.borrow_mut(), "");
        cb.value.replace(&mut *lock.borrow_mut(), 0);
        cb.any_mask.replace(&mut *lock.borrow_mut(), 0);
        cb.mode_mask.replace(&mut *lock.borrow_mut(), 0);
        cb.dir_mask.replace(&mut *lock.borrow_mut(), 0);
        cb.triggered.replace(&mut *lock.borrow_mut(), 0);
        cb.cs.replace(&mut *lock.borrow_mut(), ObjectCs::empty());

        task::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::compute_trigger;

    #[test]
    fn any_mask_triggers_on_any_change() {
        assert_eq!(compute_trigger(0b1111, 0, 0, 0b0000, 0b0101), 0b0101);
        assert_eq!(compute_trigger(0b1111, 0, 0, 0b0101, 0b0101), 0);
    }

    #[test]
    fn edge_rising_and_falling() {
        // Bit 0: edge, rising
        assert_eq!(compute_trigger(0, 0b1, 0b1, 0b0, 0b1), 0b1);
        assert_eq!(compute_trigger(0, 0b1, 0b1, 0b1, 0b0), 0);
        // Bit 1: edge, falling
        assert_eq!(compute_trigger(0, 0b10, 0b00, 0b10, 0b00), 0b10);
        assert_eq!(compute_trigger(0, 0b10, 0b00, 0b00, 0b10), 0);
    }

    #[test]
    fn level_high_and_low() {
        // Bit 2: level, high — triggers when the bit becomes high
        assert_eq!(compute_trigger(0, 0, 0b100, 0b000, 0b100), 0b100);
        // Bit 3: level, low — triggers when the bit becomes low
        assert_eq!(compute_trigger(0, 0, 0b0000, 0b1000, 0b0000), 0b1000);
        // No change, no trigger
        assert_eq!(compute_trigger(0, 0, 0b100, 0b100, 0b100), 0);
    }
}
