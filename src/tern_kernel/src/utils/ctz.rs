//! Count trailing zeros
const USIZE_BITS: u32 = usize::BITS;

/// Indicates whether the target has a usable hardware count-leading/trailing-
/// zeros instruction.
#[allow(clippy::needless_bool)]
const HAS_CTZ: bool = if cfg!(target_arch = "arm") {
    // (It's actually CLZ + RBIT)
    cfg!(target_feature = "v6t2")
        || (cfg!(target_feature = "v5te") && !cfg!(target_feature = "thumb-mode"))
} else {
    // AArch64: All
    // x86: 80386 and later
    true
};

/// Return the number of trailing zeros in `x` (`0..=usize::BITS`). Only
/// `BITS` lowest bits of `x` are considered; the rest are ignored.
#[inline]
pub(crate) fn trailing_zeros<const BITS: usize>(x: usize) -> u32 {
    if BITS == 0 {
        USIZE_BITS
    } else if BITS == 1 {
        // `x & 1` == 0 ⇒ 32, otherwise 0
        (1 - (x & 1) as u32) * USIZE_BITS
    } else if HAS_CTZ || BITS as u32 > USIZE_BITS / 2 {
        let masked = if BITS as u32 >= USIZE_BITS {
            x
        } else {
            x & ((1 << BITS) - 1)
        };
        masked.trailing_zeros()
    } else {
        ctz_linear::<BITS>(x)
    }
}

/// Linear search, for targets where a hardware instruction is unavailable and
/// the operand is known to be narrow.
#[inline]
fn ctz_linear<const BITS: usize>(mut x: usize) -> u32 {
    for i in 0..BITS as u32 {
        if x & 1 != 0 {
            return i;
        }
        x >>= 1;
    }
    USIZE_BITS
}

#[cfg(test)]
mod tests {
    macro_rules! gen_test {
        ($name:ident, $func:expr, $bits:expr) => {
            mod $name {
                #[quickcheck_macros::quickcheck]
                fn quickcheck(x: usize) {
                    let func: fn(usize) -> u32 = $func;
                    let in_range = if $bits >= usize::BITS as usize {
                        x
                    } else {
                        x & ((1usize << $bits) - 1)
                    };
                    let got = func(in_range);
                    let expect = if in_range == 0 {
                        usize::BITS
                    } else {
                        in_range.trailing_zeros()
                    };
                    assert_eq!(
                        got, expect,
                        "func({in_range}) = {got}, expected {expect}"
                    );
                }
            }
        };
    }

    gen_test!(trailing_zeros_0, super::super::trailing_zeros::<0>, 0);
    gen_test!(trailing_zeros_1, super::super::trailing_zeros::<1>, 1);
    gen_test!(trailing_zeros_2, super::super::trailing_zeros::<2>, 2);
    gen_test!(trailing_zeros_7, super::super::trailing_zeros::<7>, 7);
    gen_test!(trailing_zeros_16, super::super::trailing_zeros::<16>, 16);
    gen_test!(
        trailing_zeros_max,
        super::super::trailing_zeros::<{ super::super::USIZE_BITS as usize }>,
        super::super::USIZE_BITS as usize
    );
    gen_test!(ctz_linear_1, super::super::ctz_linear::<1>, 1);
    gen_test!(ctz_linear_2, super::super::ctz_linear::<2>, 2);
    gen_test!(ctz_linear_15, super::super::ctz_linear::<15>, 15);
    gen_test!(
        ctz_linear_max,
        super::super::ctz_linear::<{ super::super::USIZE_BITS as usize }>,
        super::super::USIZE_BITS as usize
    );
}
