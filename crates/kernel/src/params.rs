//! Problem shape, tensor layouts and the compile-time tile parameters.

use std::marker::PhantomData;

use evoattn_tiles::{
    LINE_SIZE, align_up,
    element::Element,
    global::GlobalView,
    tiles::{Dim, Rt, St},
};
use serde::Serialize;

use crate::bundle::tensor_bundle;

/// Compile-time tile shape of one kernel instantiation.
pub trait TileParams: Send + Sync + 'static {
    /// Query rows per tile (kBlockSizeI).
    type I: Dim;
    /// Key rows per tile (kBlockSizeJ).
    type J: Dim;
    /// Largest supported head dimension (kMaxK).
    type MaxK: Dim;

    const BLOCK_I: usize = <Self::I as Dim>::VALUE;
    const BLOCK_J: usize = <Self::J as Dim>::VALUE;
    const MAX_K: usize = <Self::MaxK as Dim>::VALUE;
}

/// Concrete [`TileParams`] for a triple of dimension markers.
pub struct Tiles<I: Dim, J: Dim, K: Dim>(PhantomData<(I, J, K)>);

impl<I: Dim, J: Dim, K: Dim> TileParams for Tiles<I, J, K> {
    type I = I;
    type J = J;
    type MaxK = K;
}

/// Query-row operand: `Q_i` or `dO_i`, `[I, MaxK]`.
pub type StIK<P> = St<f32, <P as TileParams>::I, <P as TileParams>::MaxK>;
/// Key-row operand: `K_j` or `V_j`, `[J, MaxK]`.
pub type StJK<P> = St<f32, <P as TileParams>::J, <P as TileParams>::MaxK>;
/// Key-major score tile, `[J, I]`.
pub type StJI<P> = St<f32, <P as TileParams>::J, <P as TileParams>::I>;
/// Query-major score tile, `[I, J]`.
pub type StIJ<P> = St<f32, <P as TileParams>::I, <P as TileParams>::J>;
pub type RtJI<P> = Rt<f32, <P as TileParams>::J, <P as TileParams>::I>;
pub type RtIJ<P> = Rt<f32, <P as TileParams>::I, <P as TileParams>::J>;

/// Sizes of one backward problem.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct AttentionShape {
    /// Batches, including the bias group dimension (`B * N`).
    pub batch: usize,
    pub heads: usize,
    pub num_queries: usize,
    pub num_keys: usize,
    /// Head dim of Q and K.
    pub head_dim: usize,
    /// Head dim of V.
    pub head_dim_value: usize,
    /// Batches sharing one pair bias (`N`).
    pub group_size: usize,
}

impl AttentionShape {
    pub fn units(&self) -> usize {
        self.batch * self.heads
    }

    pub fn bias_groups(&self) -> usize {
        self.batch / self.group_size
    }

    /// Elements of one (head, query, key) score plane.
    pub fn scores_per_head(&self) -> usize {
        self.num_queries * self.num_keys
    }
}

/// Strided layout of a `[batch, rows, heads, cols]` tensor with contiguous columns.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Layout {
    pub offset: usize,
    pub batch_stride: usize,
    pub row_stride: usize,
    pub head_stride: usize,
}

impl Layout {
    /// Dense `[batch, rows, heads, cols]`.
    pub fn packed(rows: usize, heads: usize, cols: usize) -> Self {
        Self {
            offset: 0,
            batch_stride: rows * heads * cols,
            row_stride: heads * cols,
            head_stride: cols,
        }
    }

    /// `[batch, rows, heads, cols]` with each head's row padded to whole
    /// vector lines.
    pub fn aligned(rows: usize, heads: usize, cols: usize) -> Self {
        Self::packed(rows, heads, align_up(cols, LINE_SIZE))
    }

    pub fn unit_offset(&self, batch_id: usize, head: usize) -> usize {
        self.offset + batch_id * self.batch_stride + head * self.head_stride
    }

    /// Smallest buffer length that holds every addressed element.
    pub fn required_len(&self, batch: usize, rows: usize, heads: usize, cols: usize) -> usize {
        self.offset
            + (batch - 1) * self.batch_stride
            + (rows - 1) * self.row_stride
            + (heads - 1) * self.head_stride
            + cols
    }

    /// Sufficient condition for no two elements sharing an address: sorted by
    /// stride, each dimension steps past everything the smaller ones span.
    pub fn is_injective(&self, batch: usize, rows: usize, heads: usize, cols: usize) -> bool {
        let mut dims: Vec<(usize, usize)> = [
            (self.batch_stride, batch),
            (self.row_stride, rows),
            (self.head_stride, heads),
        ]
        .into_iter()
        .filter(|&(_, extent)| extent > 1)
        .collect();
        dims.sort_unstable();

        let mut span = cols;
        for (stride, extent) in dims {
            if stride < span {
                return false;
            }
            span += stride * (extent - 1);
        }
        true
    }
}

/// Layout of the `[batch, heads, queries]` log-sum-exp tensor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct LseLayout {
    pub batch_stride: usize,
    pub head_stride: usize,
}

impl LseLayout {
    /// Dense layout with each head's row padded to a multiple of 8.
    pub fn padded(heads: usize, num_queries: usize) -> Self {
        let head_stride = align_up(num_queries, 8);
        Self {
            batch_stride: heads * head_stride,
            head_stride,
        }
    }

    pub fn unit_offset(&self, batch_id: usize, head: usize) -> usize {
        batch_id * self.batch_stride + head * self.head_stride
    }
}

/// Immutable global tensor handed to the kernel.
#[derive(Clone, Copy, Debug)]
pub struct TensorRef<'a, E> {
    pub data: &'a [E],
    pub layout: Layout,
}

impl<'a, E: Element> TensorRef<'a, E> {
    /// Row view of the unit whose base offset is `offset`.
    pub fn view(&self, offset: usize) -> GlobalView<'a, E> {
        GlobalView::new(self.data, offset, self.layout.row_stride)
    }
}

/// Output tensor handed to the kernel.
#[derive(Debug)]
pub struct TensorMut<'a, E> {
    pub data: &'a mut [E],
    pub layout: Layout,
}

tensor_bundle! {
    /// Forward-pass tensors the backward pass reads.
    pub struct AttentionInputs[5] { q, k, v, o, d_o }
}

tensor_bundle! {
    /// Gradients with respect to Q, K and V.
    pub struct AttentionGrads[3] { grad_q, grad_k, grad_v }
}
