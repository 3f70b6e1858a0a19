//! Flags derived from the element type and tile shape, and the workspace
//! layout they imply.

use std::ops::Range;

use evoattn_common::DType;
use evoattn_tiles::align_up;
use serde::Serialize;

use crate::{accumulator::AccumStrategy, params::AttentionShape};

/// Per-launch kernel traits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct KernelPlan {
    pub block_i: usize,
    pub block_j: usize,
    pub max_head_dim: usize,
    pub is_half: bool,
    /// gradK/gradV of a key tile stay in the accumulator across the whole
    /// query loop and are written once.
    pub output_in_registers: bool,
    pub grad_q: AccumStrategy,
    pub grad_k: AccumStrategy,
    pub grad_v: AccumStrategy,
}

impl KernelPlan {
    pub fn new(dtype: DType, block_i: usize, block_j: usize, max_head_dim: usize) -> Self {
        let is_half = dtype.is_half();
        let output_in_registers = is_half && max_head_dim <= block_i;
        let output_is_f32 = dtype == DType::F32;
        let grad_kv = if output_in_registers {
            AccumStrategy::InPlace
        } else {
            AccumStrategy::for_output(output_is_f32)
        };

        Self {
            block_i,
            block_j,
            max_head_dim,
            is_half,
            output_in_registers,
            grad_q: AccumStrategy::for_output(output_is_f32),
            grad_k: grad_kv,
            grad_v: grad_kv,
        }
    }

    /// Column chunk width of the gradK and gradV products.
    pub fn kv_chunk(&self) -> usize {
        self.block_i
    }

    /// Column chunk width of the gradQ product.
    pub fn q_chunk(&self) -> usize {
        self.block_j
    }

    pub fn workspace_layout(&self, shape: &AttentionShape) -> WorkspaceLayout {
        let (i, j) = (self.block_i, self.block_j);
        let keys = align_up(shape.num_keys, j);

        let grad_k = if self.grad_k.uses_workspace() {
            keys * align_up(shape.head_dim, self.kv_chunk())
        } else {
            0
        };
        let grad_v = if self.grad_v.uses_workspace() {
            keys * align_up(shape.head_dim_value, self.kv_chunk())
        } else {
            0
        };
        // A single key tile finishes every gradQ tile in one visit.
        let grad_q = if self.grad_q.uses_workspace() && shape.num_keys > j {
            align_up(shape.num_queries, i) * align_up(shape.head_dim, self.q_chunk())
        } else {
            0
        };

        WorkspaceLayout {
            block_i: i,
            block_j: j,
            grad_k,
            grad_v,
            grad_q,
            unit_stride: align_up(grad_k + grad_v + grad_q, 4),
            units: shape.units(),
        }
    }
}

/// Split of the `f32` workspace. Each (batch, head) unit owns `unit_stride`
/// consecutive elements laid out as `[gradK | gradV | gradQ]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct WorkspaceLayout {
    block_i: usize,
    block_j: usize,
    pub grad_k: usize,
    pub grad_v: usize,
    pub grad_q: usize,
    pub unit_stride: usize,
    pub units: usize,
}

impl WorkspaceLayout {
    pub fn elements(&self) -> usize {
        self.units * self.unit_stride
    }

    pub fn size_in_bytes(&self) -> usize {
        self.elements() * std::mem::size_of::<f32>()
    }

    pub fn is_empty(&self) -> bool {
        self.unit_stride == 0
    }

    /// Slot of gradK column chunk `storage_id` within a unit's slice. Reused
    /// by every key tile.
    pub fn grad_k_tile(&self, storage_id: usize) -> Range<usize> {
        let len = self.block_j * self.block_i;
        let start = storage_id * len;
        start..start + len
    }

    /// Slot of gradV column chunk `storage_id` within a unit's slice.
    pub fn grad_v_tile(&self, storage_id: usize) -> Range<usize> {
        let len = self.block_j * self.block_i;
        let start = self.grad_k + storage_id * len;
        start..start + len
    }

    /// Slot of the gradQ tile for column chunk `col_id` of the query tile
    /// starting at `query_start`.
    pub fn grad_q_tile(&self, col_id: usize, query_start: usize, num_cols: usize) -> Range<usize> {
        let len = self.block_i * self.block_j;
        let storage_id = col_id + query_start / self.block_i * num_cols;
        let start = self.grad_k + self.grad_v + storage_id * len;
        start..start + len
    }
}
