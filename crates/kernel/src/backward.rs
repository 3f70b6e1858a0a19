//! The work of one compute unit: the full tile loop for one (batch, head)
//! pair.
//!
//! For each key tile the unit loads `K_j` and `V_j` once, then walks the
//! query tiles that key tile attends to. Every (query tile, key tile) pair
//! runs the five chained products in the unit's scratch arena. gradK and
//! gradV of the key tile are complete after its query loop; gradQ of a query
//! tile only after the last key tile that visits it.

use std::{marker::PhantomData, ops::Range};

use evoattn_tiles::{
    element::Element,
    gemm::{GemmEngine, StoreMode},
    global::{GlobalViewMut, RawBuffer},
    tiles::{Dim, Rt},
};
use tracing::trace;

use crate::{
    accumulator::{AccumStrategy, Visit},
    arena::ScratchArena,
    bias::BiasTerm,
    bundle::TensorBundle,
    delta::compute_delta,
    dropout::{DropoutMask, DropoutParams},
    params::{
        AttentionGrads, AttentionInputs, AttentionShape, Layout, LseLayout, RtIJ, RtJI, TensorRef,
        TileParams,
    },
    plan::{KernelPlan, WorkspaceLayout},
    scheduler::{UnitCoord, advance_to_block},
    skip::{QueryStartPolicy, first_query_tile, next_iteration, zero_fill_key_tile},
    stages::{self, TileExtent, UnitBiases},
};

/// A bias tensor and, when its gradient is requested, the gradient buffer.
pub struct BiasInput<'r, E> {
    pub data: &'r [E],
    pub grad: Option<RawBuffer<'r, f32>>,
}

/// Everything a compute unit reads, shared by all units of a launch.
pub struct BackwardKernel<'r, P, E, G, Q> {
    pub shape: AttentionShape,
    pub plan: KernelPlan,
    pub workspace: WorkspaceLayout,
    pub scale: f32,
    pub dropout: DropoutParams,
    pub engine: G,
    pub policy: &'r Q,
    pub inputs: AttentionInputs<TensorRef<'r, E>>,
    pub lse: &'r [f32],
    pub lse_layout: LseLayout,
    pub grads: AttentionGrads<RawBuffer<'r, E>>,
    pub grad_layouts: AttentionGrads<Layout>,
    pub key_mask: Option<BiasInput<'r, E>>,
    pub pair_bias: Option<BiasInput<'r, E>>,
    pub tiles: PhantomData<P>,
}

/// Accumulator fragments a unit keeps across stages.
struct Registers<P: TileParams> {
    scores: RtJI<P>,
    dp: RtIJ<P>,
    grad_q: RtIJ<P>,
    grad_k: RtJI<P>,
    grad_v: RtJI<P>,
}

impl<P: TileParams> Registers<P> {
    fn new() -> Self {
        Self {
            scores: RtJI::<P>::new(),
            dp: RtIJ::<P>::new(),
            grad_q: RtIJ::<P>::new(),
            grad_k: RtJI::<P>::new(),
            grad_v: RtJI::<P>::new(),
        }
    }
}

/// One output tile, split into column chunks of `width`.
struct ChunkedTile {
    strategy: AccumStrategy,
    width: usize,
    row_start: usize,
    rows: usize,
    cols: usize,
    visit: Visit,
}

impl<P, E, G, Q> BackwardKernel<'_, P, E, G, Q>
where
    P: TileParams,
    E: Element,
    G: GemmEngine,
    Q: QueryStartPolicy,
{
    /// Runs the whole tile loop for `coord`. `delta` receives the unit's
    /// Delta row; `workspace` is the unit's slice, if the plan uses one.
    pub fn run_unit(&self, coord: UnitCoord, delta: &mut [f32], mut workspace: Option<&mut [f32]>) {
        let shape = &self.shape;
        let (block_i, block_j) = (P::BLOCK_I, P::BLOCK_J);
        let (num_queries, num_keys) = (shape.num_queries, shape.num_keys);
        let (head_dim, head_dim_value) = (shape.head_dim, shape.head_dim_value);

        let input_layouts = self.inputs.borrowed().map(|t| t.layout);
        let offsets = advance_to_block(
            shape,
            &input_layouts,
            &self.grad_layouts,
            &self.lse_layout,
            &self.dropout,
            coord,
        );
        trace!(
            batch = coord.batch_id,
            head = coord.head,
            rng_offset = offsets.rng_offset,
            "compute unit start"
        );

        let q = self.inputs.q.view(offsets.inputs.q);
        let k = self.inputs.k.view(offsets.inputs.k);
        let v = self.inputs.v.view(offsets.inputs.v);
        let o = self.inputs.o.view(offsets.inputs.o);
        let d_o = self.inputs.d_o.view(offsets.inputs.d_o);
        let lse = &self.lse[offsets.lse..offsets.lse + num_queries];

        compute_delta(&o, &d_o, num_queries, head_dim_value, block_i, delta);
        let delta = &*delta;

        // SAFETY: a unit only addresses the rows of its own (batch, head)
        // pair, and gradient layouts are checked to be injective before
        // launch, so views of different units never share an element.
        let (mut grad_q, mut grad_k, mut grad_v) = unsafe {
            (
                self.grads.grad_q.view(offsets.grads.grad_q, self.grad_layouts.grad_q.row_stride),
                self.grads.grad_k.view(offsets.grads.grad_k, self.grad_layouts.grad_k.row_stride),
                self.grads.grad_v.view(offsets.grads.grad_v, self.grad_layouts.grad_v.row_stride),
            )
        };

        let biases = UnitBiases {
            key_mask: self
                .key_mask
                .as_ref()
                .map(|b| BiasTerm::new(b.data, b.grad.as_ref(), shape, coord.batch_id, coord.head)),
            pair_bias: self
                .pair_bias
                .as_ref()
                .map(|b| BiasTerm::new(b.data, b.grad.as_ref(), shape, coord.batch_id, coord.head)),
        };
        let mut mask = DropoutMask::for_unit(&self.dropout, shape, coord.batch_id, coord.head);

        let mut arena = ScratchArena::<P>::new();
        let mut regs = Registers::<P>::new();
        let resident = self.plan.output_in_registers;
        let q_chunks = head_dim.div_ceil(self.plan.q_chunk());

        for key_start in (0..num_keys).step_by(block_j) {
            let rows_j = block_j.min(num_keys - key_start);
            let first_query = first_query_tile(self.policy, key_start, num_queries, block_i);

            if resident {
                regs.grad_k.zero();
                regs.grad_v.zero();
            } else if first_query >= num_queries {
                trace!(key_start, "key tile unreachable, zero-filling");
                zero_fill_key_tile(
                    &mut grad_k.sub_view(key_start, 0),
                    &mut grad_v.sub_view(key_start, 0),
                    rows_j,
                    head_dim,
                    head_dim_value,
                );
                continue;
            }

            // gradQ of a query tile is final once the next key tile starts past it.
            let (next_key_query, next_key) =
                next_iteration(self.policy, num_queries, block_i, block_j, num_queries, key_start);

            if first_query < num_queries {
                let ext = TileExtent {
                    query_start: first_query,
                    key_start,
                    rows_i: 0,
                    rows_j,
                };
                stages::load_key_tile(arena.load_keys(), &k, &v, ext, head_dim, head_dim_value);
            }

            for query_start in (first_query..num_queries).step_by(block_i) {
                let ext = TileExtent {
                    query_start,
                    key_start,
                    rows_i: block_i.min(num_queries - query_start),
                    rows_j,
                };
                let (_, following_key) = next_iteration(
                    self.policy,
                    num_queries,
                    block_i,
                    block_j,
                    query_start,
                    key_start,
                );
                let kv_visit = Visit {
                    is_first: query_start == first_query,
                    is_last: following_key != key_start,
                };
                let q_visit = Visit {
                    is_first: key_start == 0,
                    is_last: next_key_query > query_start || next_key >= num_keys,
                };

                stages::load_query_tile(
                    arena.load_queries(),
                    &q,
                    &d_o,
                    lse,
                    delta,
                    ext,
                    head_dim,
                    head_dim_value,
                );
                let masked = stages::score_recompute(
                    &self.engine,
                    arena.score_recompute(),
                    &mut regs.scores,
                    ext,
                    head_dim,
                    self.scale,
                    &biases,
                    mask.as_mut(),
                );

                let mut value_view = arena.value_grad();
                stages::value_operand(&mut value_view, masked);
                let value_tile = ChunkedTile {
                    strategy: self.plan.grad_v,
                    width: self.plan.kv_chunk(),
                    row_start: key_start,
                    rows: rows_j,
                    cols: head_dim_value,
                    visit: kv_visit,
                };
                self.accumulate_chunks(
                    &value_tile,
                    resident,
                    &mut regs.grad_v,
                    &mut grad_v,
                    |c| self.workspace.grad_v_tile(c),
                    workspace.as_deref_mut(),
                    |acc, offset| {
                        let (p, d_o) = (&*value_view.staging, value_view.grad_out_rows);
                        self.engine.mma_ab(acc, p, d_o, ext.rows_i, offset)
                    },
                );

                stages::score_grad(
                    &self.engine,
                    arena.score_grad(),
                    &mut regs.dp,
                    ext,
                    head_dim_value,
                    self.scale,
                    masked,
                    &biases,
                );

                let query_view = arena.query_grad();
                let query_tile = ChunkedTile {
                    strategy: self.plan.grad_q,
                    width: self.plan.q_chunk(),
                    row_start: query_start,
                    rows: ext.rows_i,
                    cols: head_dim,
                    visit: q_visit,
                };
                let grad_q_slots = self.workspace.grad_q > 0;
                self.accumulate_chunks(
                    &query_tile,
                    false,
                    &mut regs.grad_q,
                    &mut grad_q,
                    |c| self.workspace.grad_q_tile(c, query_start, q_chunks),
                    workspace.as_deref_mut().filter(|_| grad_q_slots),
                    |acc, offset| {
                        let (ds, k) = (query_view.grad_scores, query_view.key_rows);
                        self.engine.mma_ab(acc, ds, k, ext.rows_j, offset)
                    },
                );

                let key_view = arena.key_grad();
                let key_tile = ChunkedTile {
                    strategy: self.plan.grad_k,
                    width: self.plan.kv_chunk(),
                    row_start: key_start,
                    rows: rows_j,
                    cols: head_dim,
                    visit: kv_visit,
                };
                self.accumulate_chunks(
                    &key_tile,
                    resident,
                    &mut regs.grad_k,
                    &mut grad_k,
                    |c| self.workspace.grad_k_tile(c),
                    workspace.as_deref_mut(),
                    |acc, offset| {
                        let (ds, q) = (key_view.grad_scores, key_view.query_rows);
                        self.engine.mma_atb(acc, ds, q, ext.rows_i, offset)
                    },
                );
            }

            if resident {
                let overwrite = StoreMode::Overwrite;
                let mut dst = grad_k.sub_view(key_start, 0);
                self.engine.epilogue(&regs.grad_k, &mut dst, rows_j, head_dim, 1.0, overwrite);
                let mut dst = grad_v.sub_view(key_start, 0);
                let cols = head_dim_value;
                self.engine.epilogue(&regs.grad_v, &mut dst, rows_j, cols, 1.0, overwrite);
            }
        }
    }

    /// Applies one contribution to every column chunk of `tile`.
    ///
    /// A resident accumulator covers the whole head dim in one chunk and is
    /// neither primed nor flushed here.
    fn accumulate_chunks<R: Dim, C: Dim>(
        &self,
        tile: &ChunkedTile,
        resident: bool,
        acc: &mut Rt<f32, R, C>,
        dst: &mut GlobalViewMut<'_, E>,
        slot: impl Fn(usize) -> Range<usize>,
        mut workspace: Option<&mut [f32]>,
        mut product: impl FnMut(&mut Rt<f32, R, C>, usize),
    ) {
        if resident {
            product(acc, 0);
            return;
        }

        let uses_slot = tile.strategy.uses_workspace();
        for chunk in 0..tile.cols.div_ceil(tile.width) {
            let col_start = chunk * tile.width;
            let range = slot(chunk);

            let prime_slot = workspace
                .as_deref()
                .filter(|_| uses_slot)
                .map(|ws| &ws[range.clone()]);
            tile.strategy.prime(acc, tile.visit, prime_slot);
            product(acc, col_start);

            let flush_slot = workspace
                .as_deref_mut()
                .filter(|_| uses_slot)
                .map(|ws| &mut ws[range]);
            let mut chunk_dst = dst.sub_view(tile.row_start, col_start);
            tile.strategy.flush(
                &self.engine,
                acc,
                tile.visit,
                flush_slot,
                &mut chunk_dst,
                tile.rows,
                tile.width.min(tile.cols - col_start),
            );
        }
    }
}
