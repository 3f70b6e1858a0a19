//! Assignment of (batch, head) pairs to compute units.
//!
//! Every unit owns one pair and runs the whole tile loop for it. Units only
//! interact through the bias gradients, which several units accumulate into;
//! [`unit_groups`] serializes exactly those units.

use std::collections::BTreeMap;

use crate::{
    bundle::TensorBundle,
    dropout::DropoutParams,
    params::{AttentionGrads, AttentionInputs, AttentionShape, Layout, LseLayout},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct UnitCoord {
    pub batch_id: usize,
    pub head: usize,
}

impl UnitCoord {
    /// Row-major index over `[batch, heads]`, also the unit's workspace slot.
    pub fn index(&self, heads: usize) -> usize {
        self.batch_id * heads + self.head
    }
}

/// Base offsets of one unit into every tensor.
#[derive(Clone, Debug)]
pub struct UnitOffsets {
    pub inputs: AttentionInputs<usize>,
    pub grads: AttentionGrads<usize>,
    pub lse: usize,
    pub delta: usize,
    pub rng_offset: u64,
}

/// Folds batch and head strides of every tensor into base offsets for `coord`.
pub fn advance_to_block(
    shape: &AttentionShape,
    inputs: &AttentionInputs<Layout>,
    grads: &AttentionGrads<Layout>,
    lse: &LseLayout,
    dropout: &DropoutParams,
    coord: UnitCoord,
) -> UnitOffsets {
    let UnitCoord { batch_id, head } = coord;
    let at = |layout: &Layout| layout.unit_offset(batch_id, head);

    UnitOffsets {
        inputs: inputs.borrowed().map(at),
        grads: grads.borrowed().map(at),
        lse: lse.unit_offset(batch_id, head),
        delta: coord.index(shape.heads) * shape.num_queries,
        rng_offset: dropout.unit_offset(shape, batch_id, head),
    }
}

/// Splits all units into groups that may run concurrently. Units inside a
/// group write the same bias-gradient region and run in order.
///
/// - key-mask gradient: shared by all heads of a batch;
/// - pair-bias gradient: shared by the `group_size` batches of a group.
pub fn unit_groups(
    shape: &AttentionShape,
    key_mask_grad: bool,
    pair_bias_grad: bool,
) -> Vec<Vec<UnitCoord>> {
    let mut groups: BTreeMap<(usize, usize), Vec<UnitCoord>> = BTreeMap::new();
    for batch_id in 0..shape.batch {
        for head in 0..shape.heads {
            let group_batch = if pair_bias_grad {
                batch_id / shape.group_size
            } else {
                batch_id
            };
            let group_head = if key_mask_grad { 0 } else { head };
            groups
                .entry((group_batch, group_head))
                .or_default()
                .push(UnitCoord { batch_id, head });
        }
    }
    groups.into_values().collect()
}
