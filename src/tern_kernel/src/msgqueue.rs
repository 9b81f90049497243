//! Message queues.
//!
//! A ring buffer of fixed-size elements over caller-supplied storage, with
//! two wait lists: senders block on a full queue, receivers on an empty one.
//! A blocked peer's transfer is performed *by the waker* directly against
//! the queue storage, so the hand-off completes atomically with the wake:
//! when a receiver drains a slot of a full queue, it immediately executes
//! the head sender's pending enqueue, and vice versa.
use core::{fmt, ptr::NonNull};

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

/// Identifies a message queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueId(pub(crate) Id);

/// *Queue control block* — the state data of a message queue.
#[doc(hidden)]
pub struct QueueCb<Traits: KernelTraits> {
    pub(crate) cs: CpuLockCell<Traits, ObjectCs>,
    pub(crate) name: CpuLockCell<Traits, &'static str>,

    pub(crate) buf: CpuLockCell<Traits, Option<NonNull<u8>>>,
    pub(crate) elem_len: CpuLockCell<Traits, usize>,
    pub(crate) elem_num: CpuLockCell<Traits, usize>,

    /// The write index.
    pub(crate) left: CpuLockCell<Traits, usize>,
    /// The read index.
    pub(crate) right: CpuLockCell<Traits, usize>,
    /// The number of stored elements. Empty ⇔ `0`, full ⇔ `elem_num`.
    pub(crate) cache: CpuLockCell<Traits, usize>,

    /// Senders blocked on a full queue.
    pub(crate) inbound: WaitQueue<Traits>,
    /// Receivers blocked on an empty queue.
    pub(crate) outbound: WaitQueue<Traits>,
}

// Safety: The buffer pointer is only dereferenced with CPU Lock active
unsafe impl<Traits: KernelTraits> Send for QueueCb<Traits> {}
unsafe impl<Traits: KernelTraits> Sync for QueueCb<Traits> {}

impl<Traits: KernelTraits> Init for QueueCb<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        cs: Init::INIT,
        name: Init::INIT,
        buf: Init::INIT,
        elem_len: Init::INIT,
        elem_num: Init::INIT,
        left: Init::INIT,
        right: Init::INIT,
        cache: Init::INIT,
        inbound: Init::INIT,
        outbound: Init::INIT,
    };
}

impl<Traits: KernelTraits> fmt::Debug for QueueCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("QueueCb")
            .field("self", &(self as *const _))
            .field("name", &self.name)
            .field("elem_len", &self.elem_len)
            .field("elem_num", &self.elem_num)
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitError {
    /// Zero element length/count, or the buffer is too small for
    /// `elem_len * elem_num`.
    BadParam,
    NoSlot,
    BadContext,
}
impl_postcode!(InitError, Component::Queue, {
    BadParam => 3,
    NoSlot => 4,
    BadContext => 2,
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// `timeout == POLL` and the queue is full.
    Unavailable,
    Timeout,
    /// The queue was deleted while waiting.
    NoData,
    /// The message is larger than the element length.
    BadParam,
    BadId,
    BadContext,
}
impl_postcode!(SendError, Component::Queue, {
    Unavailable => unavailable,
    Timeout => timeout,
    NoData => nodata,
    BadParam => 3,
    BadId => 1,
    BadContext => 2,
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveError {
    /// `timeout == POLL` and the queue is empty.
    Unavailable,
    Timeout,
    NoData,
    /// The destination buffer is larger than the element length.
    BadParam,
    BadId,
    BadContext,
}
impl_postcode!(ReceiveError, Component::Queue, {
    Unavailable => unavailable,
    Timeout => timeout,
    NoData => nodata,
    BadParam => 3,
    BadId => 1,
    BadContext => 2,
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpError {
    BadId,
    BadContext,
}
impl_postcode!(OpError, Component::Queue, {
    BadId => 1,
    BadContext => 2,
});

/// Copy `src` into the element slot at `index`.
///
/// # Safety
///
/// CPU Lock must be active; `index` must be a valid slot; `src` must be
/// readable for `len <= elem_len` bytes.
unsafe fn slot_write<Traits: KernelTraits>(
    cb: &QueueCb<Traits>,
    lock: &mut CpuLockTokenRefMut<'_, Traits>,
    index: usize,
    src: *const u8,
    len: usize,
) {
    let base = cb.buf.get(&**lock).unwrap().as_ptr();
    let elem_len = cb.elem_len.get(&**lock);
    debug_assert!(len <= elem_len);
    // Safety: Forwarded preconditions
    unsafe { core::ptr::copy_nonoverlapping(src, base.add(index * elem_len), len) };
}

/// Copy the element slot at `index` into `dst`.
///
/// # Safety
///
/// See [`slot_write`]; `dst` must be writable for `len` bytes.
unsafe fn slot_read<Traits: KernelTraits>(
    cb: &QueueCb<Traits>,
    lock: &mut CpuLockTokenRefMut<'_, Traits>,
    index: usize,
    dst: *mut u8,
    len: usize,
) {
    let base = cb.buf.get(&**lock).unwrap().as_ptr();
    let elem_len = cb.elem_len.get(&**lock);
    debug_assert!(len <= elem_len);
    // Safety: Forwarded preconditions
    unsafe { core::ptr::copy_nonoverlapping(base.add(index * elem_len), dst, len) };
}

/// Enqueue one element. The queue must not be full.
fn enqueue<Traits: KernelTraits>(
    cb: &QueueCb<Traits>,
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    src: *const u8,
    len: usize,
    to_front: bool,
) {
    let num = cb.elem_num.get(&*lock);
    debug_assert!(cb.cache.get(&*lock) < num);

    let index = if to_front {
        // The element becomes the next one to be received
        let right = (cb.right.get(&*lock) + num - 1) % num;
        cb.right.replace(&mut *lock, right);
        right
    } else {
        let left = cb.left.get(&*lock);
        cb.left.replace(&mut *lock, (left + 1) % num);
        left
    };

    // Safety: `index` was just carved out of the ring; the source buffer is
    // supplied by a live caller
    unsafe { slot_write(cb, &mut lock, index, src, len) };
    let cache = cb.cache.get(&*lock);
    cb.cache.replace(&mut *lock, cache + 1);
}

/// Dequeue one element. The queue must not be empty.
fn dequeue<Traits: KernelTraits>(
    cb: &QueueCb<Traits>,
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    dst: *mut u8,
    len: usize,
    from_back: bool,
) {
    let num = cb.elem_num.get(&*lock);
    debug_assert!(cb.cache.get(&*lock) > 0);

    let index = if from_back {
        // Take the most recently enqueued element
        let left = (cb.left.get(&*lock) + num - 1) % num;
        cb.left.replace(&mut *lock, left);
        left
    } else {
        let right = cb.right.get(&*lock);
        cb.right.replace(&mut *lock, (right + 1) % num);
        right
    };

    // Safety: `index` holds a stored element; the destination buffer is
    // supplied by a live caller
    unsafe { slot_read(cb, &mut lock, index, dst, len) };
    let cache = cb.cache.get(&*lock);
    cb.cache.replace(&mut *lock, cache - 1);
}

/// After freeing a slot, complete the head blocked sender's pending enqueue
/// (the producer hand-off). Returns `true` if a sender was released.
fn complete_blocked_sender<Traits: KernelTraits>(
    cb: &'static QueueCb<Traits>,
    lock: CpuLockTokenRefMut<'_, Traits>,
) -> bool {
    cb.inbound
        .wake_up_one_by(lock, |payload, l| match payload {
            WaitPayload::QueueSend { buf, len, to_front } => {
                enqueue(cb, l, *buf, *len, *to_front);
            }
            _ => unreachable!(),
        })
        .is_some()
}

/// After storing an element, hand it to the head blocked receiver. Returns
/// `true` if a receiver was released.
fn complete_blocked_receiver<Traits: KernelTraits>(
    cb: &'static QueueCb<Traits>,
    lock: CpuLockTokenRefMut<'_, Traits>,
) -> bool {
    cb.outbound
        .wake_up_one_by(lock, |payload, l| match payload {
            WaitPayload::QueueRecv {
                buf,
                len,
                from_back,
            } => {
                dequeue(cb, l, *buf, *len, *from_back);
            }
            _ => unreachable!(),
        })
        .is_some()
}

impl<Traits: KernelTraits> System<Traits> {
    fn queue_cb(
        id: QueueId,
        lock: CpuLockTokenRefMut<'_, Traits>,
    ) -> Result<&'static QueueCb<Traits>, crate::error::BadIdError> {
        cfg::get_cb(Traits::queue_cb_pool(), id.0, lock, |cb| &cb.cs)
    }

    /// Create a message queue of `elem_num` elements of `elem_len` bytes
    /// over the caller-supplied `buffer`.
    pub fn queue_init(
        buffer: &'static mut [u8],
        elem_len: usize,
        elem_num: usize,
        name: &'static str,
    ) -> Result<QueueId, InitError> {
        if elem_len == 0 || elem_num == 0 || buffer.len() < elem_len * elem_num {
            return Err(InitError::BadParam);
        }
        let mut lock = klock::CpuLockGuard::<Traits>::acquire().map_err(|_| InitError::BadContext)?;

        let (index, cb) =
            cfg::claim_slot(Traits::queue_cb_pool(), lock.borrow_mut(), |cb| &cb.cs)
                .ok_or(InitError::NoSlot)?;

        cb.name.replace(&mut *lock.borrow_mut(), name);
        cb.buf
            .replace(&mut *lock.borrow_mut(), NonNull::new(buffer.as_mut_ptr()));
        cb.elem_len.replace(&mut *lock.borrow_mut(), elem_len);
        cb.elem_num.replace(&mut *lock.borrow_mut(), elem_num);
        cb.left.replace(&mut *lock.borrow_mut(), 0);
        cb.right.replace(&mut *lock.borrow_mut(), 0);
        cb.cache.replace(&mut *lock.borrow_mut(), 0);

        Ok(QueueId(cfg::id_from_index(index)))
    }

    /// Send a message, blocking up to `timeout` while the queue is full.
    /// `to_front` makes the message the next to be received.
    pub fn queue_send(
        id: QueueId,
        msg: &[u8],
        to_front: bool,
        timeout: TimeoutMs,
    ) -> Result<(), SendError> {
        let mut lock = klock::CpuLockGuard::<Traits>::acquire().map_err(|_| SendError::BadContext)?;
        let cb = Self::queue_cb(id, lock.borrow_mut()).map_err(|_| SendError::BadId)?;

        if msg.is_empty() || msg.len() > cb.elem_len.get(&*lock) {
            return Err(SendError::BadParam);
        }

        if cb.cache.get(&*lock) < cb.elem_num.get(&*lock) {
            enqueue(cb, lock.borrow_mut(), msg.as_ptr(), msg.len(), to_front);
            // Hand the element straight to a blocked receiver, if any
            if complete_blocked_receiver(cb, lock.borrow_mut()) {
                task::unlock_cpu_and_check_preemption(lock);
            }
            return Ok(());
        }

        let delta_us = match timeout.policy() {
            WaitTime::Poll => return Err(SendError::Unavailable),
            WaitTime::Finite(us) => Some(us),
            WaitTime::Forever => None,
        };

        task::expect_waitable_context::<Traits>().map_err(|_| SendError::BadContext)?;

        // Park with the transfer descriptor; the receiver that frees a slot
        // performs this enqueue
        let payload = WaitPayload::QueueSend {
            buf: msg.as_ptr(),
            len: msg.len(),
            to_front,
        };
        let result = match delta_us {
            Some(us) => cb.inbound.wait_timeout(lock.borrow_mut(), payload, us),
            None => cb.inbound.wait(lock.borrow_mut(), payload),
        };

        match result {
            Ok(_) => Ok(()),
            Err(WaitEndError::Timeout) => Err(SendError::Timeout),
            Err(WaitEndError::Deleted) => Err(SendError::NoData),
        }
    }

    /// Receive a message into `dst`, blocking up to `timeout` while the
    /// queue is empty. `from_back` takes the most recently sent message.
    pub fn queue_receive(
        id: QueueId,
        dst: &mut [u8],
        from_back: bool,
        timeout: TimeoutMs,
    ) -> Result<(), ReceiveError> {
        let mut lock = klock::CpuLockGuard::<Traits>::acquire().map_err(|_| ReceiveError::BadContext)?;
        let cb = Self::queue_cb(id, lock.borrow_mut()).map_err(|_| ReceiveError::BadId)?;

        if dst.is_empty() || dst.len() > cb.elem_len.get(&*lock) {
            return Err(ReceiveError::BadParam);
        }

        if cb.cache.get(&*lock) > 0 {
            dequeue(cb, lock.borrow_mut(), dst.as_mut_ptr(), dst.len(), from_back);
            // A slot is free now; complete the head sender's pending enqueue
            if complete_blocked_sender(cb, lock.borrow_mut()) {
                task::unlock_cpu_and_check_preemption(lock);
            }
            return Ok(());
        }

        let delta_us = match timeout.policy() {
            WaitTime::Poll => return Err(ReceiveError::Unavailable),
            WaitTime::Finite(us) => Some(us),
            WaitTime::Forever => None,
        };

        task::expect_waitable_context::<Traits>().map_err(|_| ReceiveError::BadContext)?;

        let payload = WaitPayload::QueueRecv {
            buf: dst.as_mut_ptr(),
            len: dst.len(),
            from_back,
        };
        let result = match delta_us {
            Some(us) => cb.outbound.wait_timeout(lock.borrow_mut(), payload, us),
            None => cb.outbound.wait(lock.borrow_mut(), payload),
        };

        match result {
            Ok(_) => Ok(()),
            Err(WaitEndError::Timeout) => Err(ReceiveError::Timeout),
            Err(WaitEndError::Deleted) => Err(ReceiveError::NoData),
        }
    }

    /// The number of messages currently stored.
    pub fn queue_len(id: QueueId) -> Result<usize, OpError> {
        let mut lock = klock::CpuLockGuard::<Traits>::acquire().map_err(|_| OpError::BadContext)?;
        let cb = Self::queue_cb(id, lock.borrow_mut()).map_err(|_| OpError::BadId)?;
        Ok(cb.cache.get(&*lock))
    }

    /// Destroy the queue. Blocked senders and receivers are released with a
    /// "no data" result.
    pub fn queue_delete(id: QueueId) -> Result<(), OpError> {
        let mut lock = klock::CpuLockGuard::<Traits>::acquire().map_err(|_| OpError::BadContext)?;
        let cb = Self::queue_cb(id, lock.borrow_mut()).map_err(|_| OpError::BadId)?;

        cb.inbound
            .wake_up_all(lock.borrow_mut(), Err(WaitEndError::Deleted));
        cb.outbound
            .wake_up_all(lock.borrow_mut(), Err(WaitEndError::Deleted));

        cb.name.replace(&mut *lock.borrow_mut(), "");
        cb.buf.replace(&mut *lock.borrow_mut(), None);
        cb.elem_len.replace(&mut *lock.borrow_mut(), 0);
        cb.elem_num.replace(&mut *lock.borrow_mut(), 0);
        cb.left.replace(&mut *lock.borrow_mut(), 0);
        cb.right.replace(&mut *lock.borrow_mut(), 0);
        cb.cache.replace(&mut *lock.borrow_mut(), 0);
        cb.cs.replace(&mut *lock.borrow_mut(), ObjectCs::empty());

        task::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }
}
