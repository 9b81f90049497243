//! Provides `FixedPrioBitmap`, a bit array structure supporting constant-time
//! bit scan operations over a small number of machine words.
use core::fmt;

use super::{ctz::trailing_zeros, Init};

const WORD_LEN: usize = usize::BITS as usize;

/// The maximum bit count supported by [`FixedPrioBitmap`].
pub const FIXED_PRIO_BITMAP_MAX_LEN: usize = WORD_LEN * BITMAP_WORDS;

/// The number of words backing a [`FixedPrioBitmap`]. Enough for 128 priority
/// levels on a 32-bit target, which far exceeds what a realistic application
/// configures.
const BITMAP_WORDS: usize = 4;

/// A bit array structure supporting bit scan operations, used to find the
/// highest-priority (lowest-numbered) runnable level.
pub trait PrioBitmap: Init + Send + Sync + Clone + Copy + fmt::Debug + 'static {
    /// Get the bit at the specified position.
    fn get(&self, i: usize) -> bool;

    /// Clear the bit at the specified position.
    fn clear(&mut self, i: usize);

    /// Set the bit at the specified position.
    fn set(&mut self, i: usize);

    /// Get the position of the first set bit.
    fn find_set(&self) -> Option<usize>;
}

/// The implementation of [`PrioBitmap`] used by the task ready queue.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct FixedPrioBitmap {
    bits: [usize; BITMAP_WORDS],
}

impl Init for FixedPrioBitmap {
    const INIT: Self = Self {
        bits: [0; BITMAP_WORDS],
    };
}

impl fmt::Debug for FixedPrioBitmap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_set()
            .entries((0..FIXED_PRIO_BITMAP_MAX_LEN).filter(|&i| self.get(i)))
            .finish()
    }
}

impl PrioBitmap for FixedPrioBitmap {
    #[inline]
    fn get(&self, i: usize) -> bool {
        self.bits[i / WORD_LEN] & (1 << (i % WORD_LEN)) != 0
    }

    #[inline]
    fn clear(&mut self, i: usize) {
        self.bits[i / WORD_LEN] &= !(1 << (i % WORD_LEN));
    }

    #[inline]
    fn set(&mut self, i: usize) {
        self.bits[i / WORD_LEN] |= 1 << (i % WORD_LEN);
    }

    #[inline]
    fn find_set(&self) -> Option<usize> {
        for (word_i, &word) in self.bits.iter().enumerate() {
            if word != 0 {
                return Some(word_i * WORD_LEN + trailing_zeros::<WORD_LEN>(word) as usize);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;
    use std::collections::BTreeSet;

    #[quickcheck]
    fn bitmap_matches_set_model(ops: Vec<(u8, bool)>) {
        let mut subject = FixedPrioBitmap::INIT;
        let mut model = BTreeSet::new();

        for (pos, insert) in ops {
            let pos = pos as usize % FIXED_PRIO_BITMAP_MAX_LEN;
            if insert {
                subject.set(pos);
                model.insert(pos);
            } else {
                subject.clear(pos);
                model.remove(&pos);
            }

            assert_eq!(subject.find_set(), model.iter().next().copied());
            for probe in model.iter() {
                assert!(subject.get(*probe));
            }
        }
    }
}
