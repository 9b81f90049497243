//! Time argument types.

/// A millisecond timeout argument carried by every blocking operation.
///
///  - [`TimeoutMs::POLL`] (`0`) means "poll, do not block".
///  - [`TimeoutMs::FOREVER`] means "block indefinitely".
///  - Any other value arms the calling task's expiration record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutMs(pub u32);

impl TimeoutMs {
    /// Poll: never block.
    pub const POLL: Self = Self(0);

    /// Block indefinitely.
    pub const FOREVER: Self = Self(u32::MAX);

    #[inline]
    pub(crate) fn policy(self) -> WaitTime {
        match self {
            Self::POLL => WaitTime::Poll,
            Self::FOREVER => WaitTime::Forever,
            Self(ms) => WaitTime::Finite(ms as u64 * 1_000),
        }
    }
}

/// The resolved blocking policy of a [`TimeoutMs`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitTime {
    Poll,
    /// Finite timeout, in microseconds.
    Finite(u64),
    Forever,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_boundaries() {
        assert_eq!(TimeoutMs(0).policy(), WaitTime::Poll);
        assert_eq!(TimeoutMs(1).policy(), WaitTime::Finite(1_000));
        assert_eq!(TimeoutMs(u32::MAX - 1).policy(), WaitTime::Finite((u32::MAX as u64 - 1) * 1_000));
        assert_eq!(TimeoutMs::FOREVER.policy(), WaitTime::Forever);
    }
}
