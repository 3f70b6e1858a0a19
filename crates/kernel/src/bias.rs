//! Additive broadcast biases and their gradient epilogues.
//!
//! Two biases can take part in the scores, each with its own broadcast
//! pattern. A bias is enabled at configuration time by supplying its tensor;
//! its gradient is produced when a destination is supplied as well. Gradient
//! destinations are `f32` and accumulate additively, so the caller must
//! zero them.

use std::marker::PhantomData;

use evoattn_tiles::{
    element::Element,
    global::{GlobalView, GlobalViewMut, RawBuffer},
    plane,
    tiles::{Dim, St},
};

use crate::params::AttentionShape;

/// Pointer-advance rule of one broadcast bias.
pub trait BiasBroadcast: Send + Sync + 'static {
    const NAME: &'static str;

    /// Logical shape of the bias (and of its gradient).
    fn shape(shape: &AttentionShape) -> Vec<usize>;

    /// Offset of the unit's `(query 0, key 0)` entry.
    fn unit_offset(shape: &AttentionShape, batch_id: usize, head: usize) -> usize;

    /// Distance between consecutive query rows; zero when broadcast over queries.
    fn query_stride(shape: &AttentionShape) -> usize;

    /// Adds the pre-scale `dS` tile into the gradient, with `dst` positioned
    /// at the tile's `(query_start, key_start)` entry.
    fn accumulate_grad<I: Dim, J: Dim>(
        ds: &St<f32, I, J>,
        rows: usize,
        cols: usize,
        dst: &mut GlobalViewMut<'_, f32>,
    );

    fn len(shape: &AttentionShape) -> usize {
        Self::shape(shape).iter().product()
    }
}

/// Per-key mask, `[B·N, Mk]`, shared by every head and query row.
pub struct KeyMask;

impl BiasBroadcast for KeyMask {
    const NAME: &'static str = "bias1";

    fn shape(shape: &AttentionShape) -> Vec<usize> {
        vec![shape.batch, shape.num_keys]
    }

    fn unit_offset(shape: &AttentionShape, batch_id: usize, _head: usize) -> usize {
        batch_id * shape.num_keys
    }

    fn query_stride(_shape: &AttentionShape) -> usize {
        0
    }

    fn accumulate_grad<I: Dim, J: Dim>(
        ds: &St<f32, I, J>,
        rows: usize,
        cols: usize,
        dst: &mut GlobalViewMut<'_, f32>,
    ) {
        let mut sums = vec![0.0f32; cols];
        plane::reduce_st_cols(ds, rows, &mut sums);
        for (d, s) in dst.row_mut(0, cols).iter_mut().zip(&sums) {
            *d += s;
        }
    }
}

/// Pair bias, `[B, H, Mq, Mk]`, shared by the `N` batches of a group.
pub struct PairBias;

impl BiasBroadcast for PairBias {
    const NAME: &'static str = "bias2";

    fn shape(shape: &AttentionShape) -> Vec<usize> {
        vec![
            shape.bias_groups(),
            shape.heads,
            shape.num_queries,
            shape.num_keys,
        ]
    }

    fn unit_offset(shape: &AttentionShape, batch_id: usize, head: usize) -> usize {
        let group = batch_id / shape.group_size;
        (group * shape.heads + head) * shape.scores_per_head()
    }

    fn query_stride(shape: &AttentionShape) -> usize {
        shape.num_keys
    }

    fn accumulate_grad<I: Dim, J: Dim>(
        ds: &St<f32, I, J>,
        rows: usize,
        cols: usize,
        dst: &mut GlobalViewMut<'_, f32>,
    ) {
        for r in 0..rows {
            for (d, &s) in dst.row_mut(r, cols).iter_mut().zip(ds.row(r)) {
                *d += s;
            }
        }
    }
}

/// One bias as seen by one compute unit.
pub struct BiasTerm<'r, E, B> {
    data: &'r [E],
    grad: Option<&'r RawBuffer<'r, f32>>,
    unit_offset: usize,
    query_stride: usize,
    _broadcast: PhantomData<B>,
}

impl<'r, E: Element, B: BiasBroadcast> BiasTerm<'r, E, B> {
    pub fn new(
        data: &'r [E],
        grad: Option<&'r RawBuffer<'r, f32>>,
        shape: &AttentionShape,
        batch_id: usize,
        head: usize,
    ) -> Self {
        Self {
            data,
            grad,
            unit_offset: B::unit_offset(shape, batch_id, head),
            query_stride: B::query_stride(shape),
            _broadcast: PhantomData,
        }
    }

    fn tile_offset(&self, query_start: usize, key_start: usize) -> usize {
        self.unit_offset + query_start * self.query_stride + key_start
    }

    /// Bias values of the tile at `(query_start, key_start)`, query-major.
    pub fn tile(&self, query_start: usize, key_start: usize) -> GlobalView<'r, E> {
        GlobalView::new(
            self.data,
            self.tile_offset(query_start, key_start),
            self.query_stride,
        )
    }

    pub fn wants_grad(&self) -> bool {
        self.grad.is_some()
    }

    /// Bias-gradient epilogue for one tile.
    pub fn accumulate_grad<I: Dim, J: Dim>(
        &self,
        ds: &St<f32, I, J>,
        rows: usize,
        cols: usize,
        query_start: usize,
        key_start: usize,
    ) {
        let Some(grad) = self.grad else {
            return;
        };
        let offset = self.tile_offset(query_start, key_start);
        // SAFETY: units writing the same gradient region run one after another
        // (see `scheduler::unit_groups`), and this view is dropped before the
        // next tile's.
        let mut dst = unsafe { grad.view(offset, self.query_stride) };
        B::accumulate_grad(ds, rows, cols, &mut dst);
    }
}
