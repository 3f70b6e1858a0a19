//! The matrix-multiply capability a fused kernel drives.
//!
//! A kernel only needs two things from its linear-algebra back end: tile
//! products that leave their result in an accumulator fragment, and an
//! epilogue that writes a fragment into a strided destination. Anything that
//! implements [`GemmEngine`] can be plugged in; [`PortableGemm`] is the plain
//! CPU implementation built on the `mma_*` tile routines.

use crate::{
    element::Element,
    global::GlobalViewMut,
    plane,
    tiles::{Dim, Rt, St, mma_AB, mma_ABt, mma_AtB},
};

/// How an epilogue combines a fragment with its destination.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreMode {
    /// `dst = alpha * acc`
    Overwrite,
    /// `dst += alpha * acc`
    Accumulate,
}

impl StoreMode {
    pub fn first_or_accumulate(first: bool) -> Self {
        if first { Self::Overwrite } else { Self::Accumulate }
    }
}

pub trait GemmEngine: Send + Sync {
    /// `c += a * b[:, offset_n..]`
    fn mma_ab<M: Dim, N: Dim, K: Dim, BN: Dim>(
        &self,
        c: &mut Rt<f32, M, N>,
        a: &St<f32, M, K>,
        b: &St<f32, K, BN>,
        depth: usize,
        offset_n: usize,
    );

    /// `c += a^T * b[:, offset_n..]`, with `a` stored as `[K, M]`.
    fn mma_atb<M: Dim, N: Dim, K: Dim, BN: Dim>(
        &self,
        c: &mut Rt<f32, M, N>,
        a: &St<f32, K, M>,
        b: &St<f32, K, BN>,
        depth: usize,
        offset_n: usize,
    );

    /// `c += a * b^T`, with `b` stored as `[N, K]`.
    fn mma_abt<M: Dim, N: Dim, K: Dim>(
        &self,
        c: &mut Rt<f32, M, N>,
        a: &St<f32, M, K>,
        b: &St<f32, N, K>,
        depth: usize,
    );

    /// Writes the leading `rows` x `cols` block of `alpha * acc` into `dst`.
    fn epilogue<E: Element, M: Dim, N: Dim>(
        &self,
        acc: &Rt<f32, M, N>,
        dst: &mut GlobalViewMut<'_, E>,
        rows: usize,
        cols: usize,
        alpha: f32,
        mode: StoreMode,
    );
}

/// Scalar CPU back end.
#[derive(Clone, Copy, Debug, Default)]
pub struct PortableGemm;

impl GemmEngine for PortableGemm {
    fn mma_ab<M: Dim, N: Dim, K: Dim, BN: Dim>(
        &self,
        c: &mut Rt<f32, M, N>,
        a: &St<f32, M, K>,
        b: &St<f32, K, BN>,
        depth: usize,
        offset_n: usize,
    ) {
        mma_AB(c, a, b, depth, offset_n);
    }

    fn mma_atb<M: Dim, N: Dim, K: Dim, BN: Dim>(
        &self,
        c: &mut Rt<f32, M, N>,
        a: &St<f32, K, M>,
        b: &St<f32, K, BN>,
        depth: usize,
        offset_n: usize,
    ) {
        mma_AtB(c, a, b, depth, offset_n);
    }

    fn mma_abt<M: Dim, N: Dim, K: Dim>(
        &self,
        c: &mut Rt<f32, M, N>,
        a: &St<f32, M, K>,
        b: &St<f32, N, K>,
        depth: usize,
    ) {
        mma_ABt(c, a, b, depth);
    }

    fn epilogue<E: Element, M: Dim, N: Dim>(
        &self,
        acc: &Rt<f32, M, N>,
        dst: &mut GlobalViewMut<'_, E>,
        rows: usize,
        cols: usize,
        alpha: f32,
        mode: StoreMode,
    ) {
        plane::store_rt(acc, dst, rows, cols, alpha, mode);
    }
}
