//! Error plumbing shared by the kernel components.
//!
//! Public operations return per-operation error enums defined next to the
//! operations themselves; every such enum converts into a [`Postcode`]. The
//! enums here are the internal building blocks threaded through the wait and
//! lock machinery, which the per-operation enums are built from.
//!
//! [`Postcode`]: crate::postcode::Postcode

/// CPU Lock was already active, or the calling context cannot block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BadContextError {
    BadContext,
}

/// A handle did not refer to a live kernel object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BadIdError {
    BadId,
}

/// The fixed-capacity context pool for the primitive type is exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NoSlotError {
    NoSlot,
}

/// Why a wait operation ended without its condition being satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitEndError {
    /// The per-task expiration record fired.
    Timeout,
    /// The waited-on object was destroyed, or the wait was interrupted by an
    /// external release (resume, flush).
    Deleted,
}

/// Implement `From<$Name> for Postcode`.
///
/// Each variant maps either to one of the positive wait categories
/// (`timeout`, `available`, `unavailable`, `nodata`) or to a failure subcode
/// literal packed with the component number and the calling source line.
macro_rules! impl_postcode {
    (
        $Name:ident, $component:expr, {
            $( $Variant:ident => $kind:tt ),* $(,)?
        }
    ) => {
        impl From<$Name> for $crate::postcode::Postcode {
            #[track_caller]
            fn from(x: $Name) -> Self {
                match x {
                    $( $Name::$Variant => impl_postcode!(@pc $component, $kind), )*
                }
            }
        }
    };
    (@pc $component:expr, timeout) => {
        $crate::postcode::Postcode::WAIT_TIMEOUT
    };
    (@pc $component:expr, available) => {
        $crate::postcode::Postcode::WAIT_AVAILABLE
    };
    (@pc $component:expr, unavailable) => {
        $crate::postcode::Postcode::WAIT_UNAVAILABLE
    };
    (@pc $component:expr, nodata) => {
        $crate::postcode::Postcode::WAIT_NODATA
    };
    (@pc $component:expr, $sub:literal) => {
        $crate::postcode::Postcode::failure($component, $sub)
    };
}

pub(crate) use impl_postcode;
