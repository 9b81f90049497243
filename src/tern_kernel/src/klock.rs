//! The master critical section.
//!
//! Every privileged routine in this kernel — object creation during the
//! numbered init phases, the blocking protocol, wake-uppers, the tick
//! handler — mutates shared scheduler state. All of that state is protected
//! by a single critical section, *CPU Lock*, which has two halves:
//!
//!  1. A hardware half owned by the port: entering CPU Lock masks
//!     interrupts (PRIMASK or BASEPRI on Arm-M, a holder-tracked process
//!     lock on the hosted port), so at most one context is ever inside.
//!  2. A compile-time half owned by this module: a zero-sized *token*,
//!     materialized only while the hardware half is held. Kernel state
//!     lives in [`CpuLockCell`]s whose accessors demand the token, so a
//!     state access outside the critical section is a type error, not a
//!     latent race.
//!
//! The token is branded per kernel instance through the kernel trait type,
//! which keeps two kernels in one test binary from unlocking each other's
//! cells.
//!
//! There is deliberately no way to get the token during the init phases
//! without going through [`CpuLockGuard::acquire`]: an init hook uses the
//! same public operations as a task, and those operations acquire and
//! release CPU Lock like anywhere else. The only exceptions are the boot
//! path and the dispatcher, which *inherit* an already-masked CPU from the
//! port and therefore materialize the token with
//! [`CpuLockGuard::adopt`] instead of acquiring it.
use core::{fmt, marker::PhantomData, ops};

use crate::{error::BadContextError, utils::Init, PortThreading};

/// Type-level brand tying CPU Lock tokens and cells to one kernel instance.
pub(super) struct CpuLockTag<Traits>(PhantomData<Traits>);

/// The witness that CPU Lock is held. Zero-sized; exists only inside a
/// [`CpuLockGuard`].
pub(super) type CpuLockToken<Traits> = tokenlock::UnsyncSingletonToken<CpuLockTag<Traits>>;

/// The cell-side identifier the token is checked against.
pub(super) type CpuLockKeyhole<Traits> = tokenlock::SingletonTokenId<CpuLockTag<Traits>>;

/// An exclusive re-borrow of the token, passed down through the kernel's
/// internal call chains. Unlike `&mut CpuLockGuard`, forwarding one costs
/// nothing at runtime; unlike plain `&mut` references it is not reborrowed
/// implicitly, so callees receive it via an explicit
/// [`borrow_mut`](tokenlock::UnsyncSingletonTokenRefMut::borrow_mut).
pub(super) type CpuLockTokenRefMut<'a, Traits> =
    tokenlock::UnsyncSingletonTokenRefMut<'a, CpuLockTag<Traits>>;

/// A shared re-borrow of the token. Handed to wake-up predicates so they
/// can fill a waiter's output cells (which are `Cell`s for exactly this
/// reason) while being structurally unable to unlink wait objects under
/// the iteration that invoked them.
pub(super) type CpuLockTokenRef<'a, Traits> =
    tokenlock::UnsyncSingletonTokenRef<'a, CpuLockTag<Traits>>;

/// One piece of kernel state, readable and writable only under CPU Lock.
///
/// Control blocks, the ready queue, the timeout wheel and the deferred-
/// callback list are all built out of these. The accessors mirror the
/// shapes the kernel needs: by-value [`get`](Self::get) for small copies,
/// borrowing [`read`](Self::read)/[`write`](Self::write) for in-place
/// inspection or mutation, and [`replace`](Self::replace) for swaps.
pub(super) struct CpuLockCell<Traits, T> {
    contents: tokenlock::UnsyncTokenLock<T, CpuLockKeyhole<Traits>>,
}

impl<Traits, T> CpuLockCell<Traits, T> {
    pub(super) const fn new(contents: T) -> Self {
        Self {
            contents: tokenlock::UnsyncTokenLock::new(CpuLockKeyhole::INIT, contents),
        }
    }

    /// Copy the contents out.
    #[inline]
    pub(super) fn get(&self, key: &CpuLockToken<Traits>) -> T
    where
        T: Clone,
    {
        self.contents.get(key)
    }

    /// Borrow the contents for as long as the token stays borrowed.
    #[inline]
    pub(super) fn read<'a>(&'a self, key: &'a CpuLockToken<Traits>) -> &'a T {
        self.contents.read(key)
    }

    /// Borrow the contents mutably. Holding the result pins the token, so
    /// no other cell can be touched until it's dropped — which is the
    /// point: a half-updated invariant can't be observed through another
    /// cell.
    #[inline]
    pub(super) fn write<'a>(&'a self, key: &'a mut CpuLockToken<Traits>) -> &'a mut T {
        self.contents.write(key)
    }

    /// Store a new value, returning the previous one.
    #[inline]
    pub(super) fn replace(&self, key: &mut CpuLockToken<Traits>, value: T) -> T {
        self.contents.replace(key, value)
    }
}

impl<Traits, T: Init> Init for CpuLockCell<Traits, T> {
    const INIT: Self = Self::new(T::INIT);
}

/// Formatting acquires CPU Lock for the duration of the read. When that
/// fails — the formatter is running inside a critical section already — a
/// placeholder is printed rather than risking a recursive acquisition.
impl<Traits: PortThreading, T: Clone + fmt::Debug> fmt::Debug for CpuLockCell<Traits, T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match CpuLockGuard::<Traits>::acquire() {
            Ok(guard) => {
                let contents = self.get(&guard);
                drop(guard);
                contents.fmt(f)
            }
            Err(_) => f.write_str("<interrupts masked>"),
        }
    }
}

/// An active CPU Lock session: interrupts are masked and the token is live.
///
/// Dropping the guard unmasks. Every public kernel operation is structured
/// as "acquire, mutate through the token, release"; operations that block
/// keep the guard across the suspension (the port re-masks before the task
/// resumes, so the token never outlives the hardware half).
pub(super) struct CpuLockGuard<Traits: PortThreading> {
    token: CpuLockToken<Traits>,
}

impl<Traits: PortThreading> CpuLockGuard<Traits> {
    /// Enter CPU Lock. Fails with `BadContext` when the current context is
    /// already inside it — the kernel never nests the critical section, so
    /// a nested acquisition is a caller error (a blocking call from a
    /// timeout handler, say), reported rather than deadlocked on.
    pub(super) fn acquire() -> Result<Self, BadContextError> {
        // Safety: `try_enter_cpu_lock` is for the kernel's use, and this is
        // the kernel
        if unsafe { Traits::try_enter_cpu_lock() } {
            // Safety: The hardware half was just entered, and whoever held
            // a previous token has released it (or we'd have failed above)
            Ok(unsafe { Self::adopt() })
        } else {
            Err(BadContextError::BadContext)
        }
    }

    /// Materialize the token for a CPU Lock session the port has already
    /// opened: the boot path (the port calls [`boot`] with interrupts
    /// masked) and the dispatcher (which runs with the dispatch exception's
    /// masking in effect).
    ///
    /// # Safety
    ///
    /// The hardware half must be held, and no other token may exist.
    ///
    /// [`boot`]: crate::PortToKernel::boot
    pub(super) unsafe fn adopt() -> Self {
        debug_assert!(Traits::is_cpu_lock_active());

        Self {
            // Safety: Token uniqueness is the caller's precondition
            token: unsafe { CpuLockToken::new_unchecked() },
        }
    }

    /// Re-borrow the token for passing into a callee.
    pub(super) fn borrow_mut(&mut self) -> CpuLockTokenRefMut<'_, Traits> {
        self.token.borrow_mut()
    }
}

impl<Traits: PortThreading> Drop for CpuLockGuard<Traits> {
    fn drop(&mut self) {
        // The token dies with the guard; unmask afterwards.
        // Safety: This guard is the session that masked (or adopted the
        // masking), so it's entitled to undo it
        unsafe { Traits::leave_cpu_lock() };
    }
}

// The guard hands out its token through deref so that call sites can write
// `&*lock` / `&mut *lock` where a cell accessor wants the token itself.
impl<Traits: PortThreading> ops::Deref for CpuLockGuard<Traits> {
    type Target = CpuLockToken<Traits>;
    fn deref(&self) -> &Self::Target {
        &self.token
    }
}

impl<Traits: PortThreading> ops::DerefMut for CpuLockGuard<Traits> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.token
    }
}
