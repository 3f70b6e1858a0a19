#![allow(non_snake_case)]

use num_traits::Float;

use super::{Dim, Rt, St};

/// Columns of `b` a fragment with `n` columns reads when starting at `offset_n`.
#[inline]
fn visible_cols(offset_n: usize, n: usize, b_cols: usize) -> usize {
    b_cols.saturating_sub(offset_n).min(n)
}

/// C += A * B
///
/// LAYOUT ASSUMPTIONS:
/// - A: Scratch tile [M, K] row-major.
/// - B: Scratch tile [K, BN] row-major. C reads columns `offset_n..offset_n + N`
///      of B; columns past BN contribute nothing.
/// - C: Accumulator fragment [M, N].
///
/// Only the first `depth` entries of the shared dimension are read, so
/// zero-padded tails of K cost nothing.
pub fn mma_AB<F: Float, M: Dim, N: Dim, K: Dim, BN: Dim>(
    c: &mut Rt<F, M, N>,
    a: &St<F, M, K>,
    b: &St<F, K, BN>,
    depth: usize,
    offset_n: usize,
) {
    let depth = depth.min(K::VALUE);
    let cols = visible_cols(offset_n, N::VALUE, BN::VALUE);
    if cols == 0 {
        return;
    }

    for m in 0..M::VALUE {
        let a_row = a.row(m);
        let c_row = &mut c.row_mut(m)[..cols];
        for k in 0..depth {
            let a_val = a_row[k];
            if a_val == F::zero() {
                continue;
            }
            let b_row = &b.row(k)[offset_n..offset_n + cols];
            for (acc, &b_val) in c_row.iter_mut().zip(b_row) {
                *acc = *acc + a_val * b_val;
            }
        }
    }
}

/// C += A^T * B
///
/// LAYOUT ASSUMPTIONS:
/// - A: Scratch tile stored as [K, M] row-major (the transpose of the logical operand).
/// - B: Scratch tile [K, BN] row-major, read from column `offset_n`.
/// - C: Accumulator fragment [M, N].
pub fn mma_AtB<F: Float, M: Dim, N: Dim, K: Dim, BN: Dim>(
    c: &mut Rt<F, M, N>,
    a: &St<F, K, M>,
    b: &St<F, K, BN>,
    depth: usize,
    offset_n: usize,
) {
    let depth = depth.min(K::VALUE);
    let cols = visible_cols(offset_n, N::VALUE, BN::VALUE);
    if cols == 0 {
        return;
    }

    for k in 0..depth {
        let a_row = a.row(k);
        let b_row = &b.row(k)[offset_n..offset_n + cols];
        for m in 0..M::VALUE {
            let a_val = a_row[m];
            if a_val == F::zero() {
                continue;
            }
            let c_row = &mut c.row_mut(m)[..cols];
            for (acc, &b_val) in c_row.iter_mut().zip(b_row) {
                *acc = *acc + a_val * b_val;
            }
        }
    }
}

/// C += A * B^T
///
/// LAYOUT ASSUMPTIONS:
/// - A: Scratch tile [M, K] row-major.
/// - B: Scratch tile [N, K] row-major (the transpose of the logical operand).
/// - C: Accumulator fragment [M, N].
///
/// Both operands are read along contiguous rows, which is why the score
/// products keep their operands in this form.
pub fn mma_ABt<F: Float, M: Dim, N: Dim, K: Dim>(
    c: &mut Rt<F, M, N>,
    a: &St<F, M, K>,
    b: &St<F, N, K>,
    depth: usize,
) {
    let depth = depth.min(K::VALUE);

    for m in 0..M::VALUE {
        let a_row = &a.row(m)[..depth];
        for n in 0..N::VALUE {
            let b_row = &b.row(n)[..depth];
            let dot = a_row
                .iter()
                .zip(b_row)
                .fold(F::zero(), |acc, (&x, &y)| acc + x * y);
            c.set(m, n, c.at(m, n) + dot);
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::{Rng, SeedableRng, rngs::StdRng};
    use test_case::test_case;

    use super::*;
    use crate::tiles::{D4, D8, D16};

    fn random_st<R: Dim, C: Dim>(rng: &mut StdRng) -> St<f32, R, C> {
        let mut st = St::new();
        for v in st.as_mut_slice() {
            *v = rng.gen_range(-1.0..1.0);
        }
        st
    }

    #[test_case(8, 0 ; "full_depth")]
    #[test_case(5, 0 ; "partial_depth")]
    #[test_case(8, 8 ; "second_chunk")]
    #[test_case(8, 12 ; "ragged_chunk")]
    fn ab_matches_naive(depth: usize, offset_n: usize) {
        let mut rng = StdRng::seed_from_u64(42);
        let a = random_st::<D4, D8>(&mut rng);
        let b = random_st::<D8, D16>(&mut rng);
        let mut c = Rt::<f32, D4, D8>::new();

        mma_AB(&mut c, &a, &b, depth, offset_n);

        for m in 0..4 {
            for n in 0..8 {
                let expected: f32 = if offset_n + n < 16 {
                    (0..depth).map(|k| a.at(m, k) * b.at(k, offset_n + n)).sum()
                } else {
                    0.0
                };
                assert!((c.at(m, n) - expected).abs() < 1e-5, "({m}, {n})");
            }
        }
    }

    #[test]
    fn atb_matches_naive() {
        let mut rng = StdRng::seed_from_u64(7);
        let a = random_st::<D8, D4>(&mut rng);
        let b = random_st::<D8, D16>(&mut rng);
        let mut c = Rt::<f32, D4, D8>::new();

        mma_AtB(&mut c, &a, &b, 6, 4);

        for m in 0..4 {
            for n in 0..8 {
                let expected: f32 = (0..6).map(|k| a.at(k, m) * b.at(k, 4 + n)).sum();
                assert!((c.at(m, n) - expected).abs() < 1e-5, "({m}, {n})");
            }
        }
    }

    #[test]
    fn abt_accumulates() {
        let mut rng = StdRng::seed_from_u64(3);
        let a = random_st::<D4, D8>(&mut rng);
        let b = random_st::<D8, D8>(&mut rng);
        let mut c = Rt::<f32, D4, D8>::new();

        mma_ABt(&mut c, &a, &b, 8);
        mma_ABt(&mut c, &a, &b, 8);

        for m in 0..4 {
            for n in 0..8 {
                let expected: f32 = 2.0 * (0..8).map(|k| a.at(m, k) * b.at(n, k)).sum::<f32>();
                assert!((c.at(m, n) - expected).abs() < 1e-4, "({m}, {n})");
            }
        }
    }
}
