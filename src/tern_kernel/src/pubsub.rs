//! Publish/subscribe.
//!
//! A publisher fans each submitted datum out to its registered subscribers'
//! buffers and bumps their `updated` counters. A subscriber consumes with
//! `subscribe_data_apply`, which reports fresh data iff `accepted <
//! updated`. There is no per-message queuing: a subscriber that doesn't
//! drain between submissions observes only the most recent value
//! (last-writer-wins).
//!
//! Unless muted, each delivery also queues the subscriber's notification
//! callback on the kernel thread's deferred-callback list; the kernel thread
//! runs the callbacks outside interrupt context.
use core::{fmt, ptr::NonNull};

use crate::{
    cfg::{self, ObjectCs},
    error::impl_postcode,
    klock::{self, CpuLockCell, CpuLockTokenRefMut},
    kthread::{self, DeferredCall},
    task,
    utils::{
        list::{self, Link, ListItem},
        Init,
    },
    Component, Id, KernelTraits, System,
};

/// Identifies a publisher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishId(pub(crate) Id);

/// Identifies a subscriber cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscribeId(pub(crate) Id);

/// *Publish control block* — a publisher and its subscriber list.
#[doc(hidden)]
pub struct PublishCb<Traits: KernelTraits> {
    pub(crate) cs: CpuLockCell<Traits, ObjectCs>,
    pub(crate) name: CpuLockCell<Traits, &'static str>,

    pub(crate) subscribers: CpuLockCell<Traits, list::ListHead<SubscribeRef<Traits>>>,
}

impl<Traits: KernelTraits> Init for PublishCb<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        cs: Init::INIT,
        name: Init::INIT,
        subscribers: Init::INIT,
    };
}

impl<Traits: KernelTraits> fmt::Debug for PublishCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PublishCb")
            .field("self", &(self as *const _))
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// *Subscribe control block* — a subscriber cell with its notify record.
#[doc(hidden)]
pub struct SubscribeCb<Traits: KernelTraits> {
    pub(crate) cs: CpuLockCell<Traits, ObjectCs>,
    pub(crate) name: CpuLockCell<Traits, &'static str>,

    /// Links the cell into its publisher's subscriber list.
    pub(crate) link: CpuLockCell<Traits, Link<SubscribeRef<Traits>>>,
    pub(crate) publisher: CpuLockCell<Traits, Option<&'static PublishCb<Traits>>>,

    /// The subscriber's data buffer.
    pub(crate) buf: CpuLockCell<Traits, Option<NonNull<u8>>>,
    pub(crate) len: CpuLockCell<Traits, usize>,

    /// The length of the most recent delivery.
    pub(crate) last_len: CpuLockCell<Traits, usize>,

    /// Bumped on every delivery. New data is ready iff
    /// `accepted < updated`.
    pub(crate) updated: CpuLockCell<Traits, u32>,
    pub(crate) accepted: CpuLockCell<Traits, u32>,

    pub(crate) muted: CpuLockCell<Traits, bool>,

    /// The deferred notification callback and its argument.
    pub(crate) callback: CpuLockCell<Traits, Option<(fn(usize), usize)>>,
}

// Safety: The buffer pointer is only dereferenced with CPU Lock active
unsafe impl<Traits: KernelTraits> Send for SubscribeCb<Traits> {}
unsafe impl<Traits: KernelTraits> Sync for SubscribeCb<Traits> {}

impl<Traits: KernelTraits> Init for SubscribeCb<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        cs: Init::INIT,
        name: Init::INIT,
        link: Init::INIT,
        publisher: Init::INIT,
        buf: Init::INIT,
        len: Init::INIT,
        last_len: Init::INIT,
        updated: Init::INIT,
        accepted: Init::INIT,
        muted: Init::INIT,
        callback: Init::INIT,
    };
}

impl<Traits: KernelTraits> fmt::Debug for SubscribeCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SubscribeCb")
            .field("self", &(self as *const _))
            .field("name", &self.name)
            .field("updated", &self.updated)
            .field("accepted", &self.accepted)
            .field("muted", &self.muted)
            .finish_non_exhaustive()
    }
}

/// A reference to a [`SubscribeCb`] in the static pool.
pub(crate) struct SubscribeRef<Traits: KernelTraits>(NonNull<SubscribeCb<Traits>>);

// Safety: `SubscribeCb` is `Send + Sync`
unsafe impl<Traits: KernelTraits> Send for SubscribeRef<Traits> {}
unsafe impl<Traits: KernelTraits> Sync for SubscribeRef<Traits> {}

impl<Traits: KernelTraits> Clone for SubscribeRef<Traits> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<Traits: KernelTraits> Copy for SubscribeRef<Traits> {}

impl<Traits: KernelTraits> PartialEq for SubscribeRef<Traits> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}
impl<Traits: KernelTraits> Eq for SubscribeRef<Traits> {}

impl<Traits: KernelTraits> SubscribeRef<Traits> {
    fn get(self) -> &'static SubscribeCb<Traits> {
        // Safety: Subscriber control blocks are never deallocated
        unsafe { &*self.0.as_ptr() }
    }
}

impl<Traits: KernelTraits> ListItem<Traits> for SubscribeRef<Traits> {
    unsafe fn link<'a>(self) -> &'a CpuLockCell<Traits, Link<Self>> {
        // Safety: See `SubscribeRef::get`
        unsafe { &(*self.0.as_ptr()).link }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitError {
    BadParam,
    NoSlot,
    BadContext,
}
impl_postcode!(InitError, Component::Publish, {
    BadParam => 3,
    NoSlot => 4,
    BadContext => 2,
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterError {
    /// The subscriber is already registered to a publisher.
    AlreadyRegistered,
    BadId,
    BadContext,
}
impl_postcode!(RegisterError, Component::Publish, {
    AlreadyRegistered => 5,
    BadId => 1,
    BadContext => 2,
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitError {
    BadId,
    BadContext,
}
impl_postcode!(SubmitError, Component::Publish, {
    BadId => 1,
    BadContext => 2,
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyError {
    /// Nothing was published since the last apply.
    NoData,
    BadId,
    BadContext,
}
impl_postcode!(ApplyError, Component::Publish, {
    NoData => nodata,
    BadId => 1,
    BadContext => 2,
});

impl<Traits: KernelTraits> System<Traits> {
    fn publish_cb(
        id: PublishId,
        lock: CpuLockTokenRefMut<'_, Traits>,
    ) -> Result<&'static PublishCb<Traits>, crate::error::BadIdError> {
        cfg::get_cb(Traits::publish_cb_pool(), id.0, lock, |cb| &cb.cs)
    }

    fn subscribe_cb(
        id: SubscribeId,
        lock: CpuLockTokenRefMut<'_, Traits>,
    ) -> Result<&'static SubscribeCb<Traits>, crate::error::BadIdError> {
        cfg::get_cb(Traits::subscribe_cb_pool(), id.0, lock, |cb| &cb.cs)
    }

    /// Create a publisher.
    pub fn publish_init(name: &'static str) -> Result<PublishId, InitError> {
        let mut lock = klock::CpuLockGuard::<Traits>::acquire().map_err(|_| InitError::BadContext)?;

        let (index, cb) =
            cfg::claim_slot(Traits::publish_cb_pool(), lock.borrow_mut(), |cb| &cb.cs)
                .ok_or(InitError::NoSlot)?;

        cb.name.replace(&mut *lock.borrow_mut(), name);

        Ok(PublishId(cfg::id_from_index(index)))
    }

    /// Create a subscriber cell backed by `buffer`.
    pub fn subscribe_init(
        buffer: &'static mut [u8],
        name: &'static str,
    ) -> Result<SubscribeId, InitError> {
        if buffer.is_empty() {
            return Err(InitError::BadParam);
        }
        let mut lock = klock::CpuLockGuard::<Traits>::acquire().map_err(|_| InitError::BadContext)?;

        let (index, cb) =
            cfg::claim_slot(Traits::subscribe_cb_pool(), lock.borrow_mut(), |cb| &cb.cs)
                .ok_or(InitError::NoSlot)?;

        cb.name.replace(&mut *lock.borrow_mut(), name);
        cb.len.replace(&mut *lock.borrow_mut(), buffer.len());
        cb.buf
            .replace(&mut *lock.borrow_mut(), NonNull::new(buffer.as_mut_ptr()));

        Ok(SubscribeId(cfg::id_from_index(index)))
    }

    /// Attach a subscriber to a publisher. `callback` (if any) is queued on
    /// the kernel thread after each delivery unless `muted`.
    pub fn subscribe_register(
        sub: SubscribeId,
        publisher: PublishId,
        muted: bool,
        callback: Option<(fn(usize), usize)>,
    ) -> Result<(), RegisterError> {
        let mut lock = klock::CpuLockGuard::<Traits>::acquire().map_err(|_| RegisterError::BadContext)?;
        let sub_cb = Self::subscribe_cb(sub, lock.borrow_mut()).map_err(|_| RegisterError::BadId)?;
        let pub_cb =
            Self::publish_cb(publisher, lock.borrow_mut()).map_err(|_| RegisterError::BadId)?;

        if sub_cb.publisher.get(&*lock).is_some() {
            return Err(RegisterError::AlreadyRegistered);
        }

        sub_cb.publisher.replace(&mut *lock.borrow_mut(), Some(pub_cb));
        sub_cb.muted.replace(&mut *lock.borrow_mut(), muted);
        sub_cb.callback.replace(&mut *lock.borrow_mut(), callback);

        list::push_back(
            &pub_cb.subscribers,
            SubscribeRef(sub_cb.into()),
            lock.borrow_mut(),
        );

        Ok(())
    }

    /// Deliver `data` to every subscriber of the publisher: copy
    /// `min(data.len, subscriber.len)` bytes, bump `updated`, and queue the
    /// notification callbacks. The kernel thread is notified once at the
    /// end.
    pub fn publish_data_submit(id: PublishId, data: &[u8]) -> Result<(), SubmitError> {
        let mut lock = klock::CpuLockGuard::<Traits>::acquire().map_err(|_| SubmitError::BadContext)?;
        let cb = Self::publish_cb(id, lock.borrow_mut()).map_err(|_| SubmitError::BadId)?;

        let mut queued_any = false;
        let mut cur = cb.subscribers.read(&*lock).first();
        while let Some(sub_ref) = cur {
            cur = list::next(sub_ref, lock.borrow_mut());
            let sub = sub_ref.get();

            let n = data.len().min(sub.len.get(&*lock));
            if let Some(buf) = sub.buf.get(&*lock) {
                // Safety: The subscriber's buffer is a live static region of
                // at least `sub.len` bytes; we hold CPU Lock
                unsafe { core::ptr::copy_nonoverlapping(data.as_ptr(), buf.as_ptr(), n) };
            }
            sub.last_len.replace(&mut *lock.borrow_mut(), n);
            let updated = sub.updated.get(&*lock).wrapping_add(1);
            sub.updated.replace(&mut *lock.borrow_mut(), updated);

            if !sub.muted.get(&*lock) {
                if let Some((func, arg)) = sub.callback.get(&*lock) {
                    kthread::push_deferred::<Traits>(
                        lock.borrow_mut(),
                        DeferredCall { func, arg },
                    );
                    queued_any = true;
                }
            }
        }

        if queued_any {
            kthread::notify::<Traits>(lock.borrow_mut());
            task::unlock_cpu_and_check_preemption(lock);
        }
        Ok(())
    }

    /// Copy the latest published data into `out` if anything new arrived
    /// since the last apply, consuming the "new data" condition.
    ///
    /// Returns the number of bytes copied.
    pub fn subscribe_data_apply(sub: SubscribeId, out: &mut [u8]) -> Result<usize, ApplyError> {
        let mut lock = klock::CpuLockGuard::<Traits>::acquire().map_err(|_| ApplyError::BadContext)?;
        let cb = Self::subscribe_cb(sub, lock.borrow_mut()).map_err(|_| ApplyError::BadId)?;

        let updated = cb.updated.get(&*lock);
        if cb.accepted.get(&*lock) == updated {
            return Err(ApplyError::NoData);
        }

        let n = out.len().min(cb.last_len.get(&*lock));
        if let Some(buf) = cb.buf.get(&*lock) {
            // Safety: See `publish_data_submit`
            unsafe { core::ptr::copy_nonoverlapping(buf.as_ptr(), out.as_mut_ptr(), n) };
        }
        cb.accepted.replace(&mut *lock.borrow_mut(), updated);

        Ok(n)
    }

    /// Is unconsumed published data pending? Doesn't consume it.
    pub fn subscribe_data_is_ready(sub: SubscribeId) -> Result<bool, ApplyError> {
        let mut lock = klock::CpuLockGuard::<Traits>::acquire().map_err(|_| ApplyError::BadContext)?;
        let cb = Self::subscribe_cb(sub, lock.borrow_mut()).map_err(|_| ApplyError::BadId)?;
        Ok(cb.accepted.get(&*lock) != cb.updated.get(&*lock))
    }
}
