//! The per-tile pipeline: loads, score recompute, and the score-gradient
//! stage with its bias epilogues. The three gradient products are driven by
//! `backward`, which owns the accumulators.

use evoattn_tiles::{
    element::Element,
    gemm::GemmEngine,
    global::GlobalView,
    plane,
    tiles::{Dim, St},
};

use crate::{
    arena::{KeyLoad, QueryLoad, ScoreGradView, ScoreRecomputeView, ValueGradView},
    bias::{BiasTerm, KeyMask, PairBias},
    dropout::DropoutMask,
    params::{RtIJ, RtJI, TileParams},
};

/// Position and valid extent of one (query tile, key tile) pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TileExtent {
    pub query_start: usize,
    pub key_start: usize,
    pub rows_i: usize,
    pub rows_j: usize,
}

/// The biases active for one compute unit.
pub struct UnitBiases<'r, E> {
    pub key_mask: Option<BiasTerm<'r, E, KeyMask>>,
    pub pair_bias: Option<BiasTerm<'r, E, PairBias>>,
}

impl<E: Element> UnitBiases<'_, E> {
    #[cfg(test)]
    pub fn none() -> Self {
        Self {
            key_mask: None,
            pair_bias: None,
        }
    }

    fn tiles(&self, ext: TileExtent) -> [Option<GlobalView<'_, E>>; 2] {
        [
            self.key_mask.as_ref().map(|b| b.tile(ext.query_start, ext.key_start)),
            self.pair_bias.as_ref().map(|b| b.tile(ext.query_start, ext.key_start)),
        ]
    }

    fn accumulate_grads<I: Dim, J: Dim>(&self, ds: &St<f32, I, J>, ext: TileExtent) {
        if let Some(bias) = self.key_mask.as_ref().filter(|b| b.wants_grad()) {
            bias.accumulate_grad(ds, ext.rows_i, ext.rows_j, ext.query_start, ext.key_start);
        }
        if let Some(bias) = self.pair_bias.as_ref().filter(|b| b.wants_grad()) {
            bias.accumulate_grad(ds, ext.rows_i, ext.rows_j, ext.query_start, ext.key_start);
        }
    }
}

pub fn load_key_tile<P: TileParams, E: Element>(
    view: KeyLoad<'_, P>,
    k: &GlobalView<'_, E>,
    v: &GlobalView<'_, E>,
    ext: TileExtent,
    head_dim: usize,
    head_dim_value: usize,
) {
    let k = k.sub_view(ext.key_start, 0);
    let v = v.sub_view(ext.key_start, 0);
    plane::load_st_direct(view.key_rows, &k, ext.rows_j, head_dim);
    plane::load_st_direct(view.value_rows, &v, ext.rows_j, head_dim_value);
}

/// Loads `Q_i`, `dO_i` and the LSE and Delta rows of the query tile. LSE rows
/// past the end are `+inf`, which turns their probabilities into zeros.
pub fn load_query_tile<P: TileParams, E: Element>(
    view: QueryLoad<'_, P>,
    q: &GlobalView<'_, E>,
    d_o: &GlobalView<'_, E>,
    lse: &[f32],
    delta: &[f32],
    ext: TileExtent,
    head_dim: usize,
    head_dim_value: usize,
) {
    let q = q.sub_view(ext.query_start, 0);
    let d_o = d_o.sub_view(ext.query_start, 0);
    plane::load_st_direct(view.query_rows, &q, ext.rows_i, head_dim);
    plane::load_st_direct(view.grad_out_rows, &d_o, ext.rows_i, head_dim_value);
    plane::load_rv(view.lse, &lse[ext.query_start..], ext.rows_i, f32::INFINITY);
    plane::load_rv(view.delta, &delta[ext.query_start..], ext.rows_i, 0.0);
}

/// `P^T = exp(scale * K_j Q_i^T + bias - LSE_i)`, key-major, zero outside the
/// valid block. Also regenerates the tile's dropout mask; returns whether one
/// was written.
pub fn score_recompute<P: TileParams, E: Element, G: GemmEngine>(
    engine: &G,
    view: ScoreRecomputeView<'_, P>,
    scores: &mut RtJI<P>,
    ext: TileExtent,
    head_dim: usize,
    scale: f32,
    biases: &UnitBiases<'_, E>,
    dropout: Option<&mut DropoutMask>,
) -> bool {
    scores.zero();
    engine.mma_abt(scores, view.key_rows, view.query_rows, head_dim);

    let bias_tiles = biases.tiles(ext);
    for jj in 0..P::BLOCK_J {
        let out = view.prob_t.row_mut(jj);
        if jj >= ext.rows_j {
            out.fill(0.0);
            continue;
        }
        for ii in 0..P::BLOCK_I {
            if ii >= ext.rows_i {
                out[ii] = 0.0;
                continue;
            }
            let mut s = scores.at(jj, ii) * scale;
            for tile in bias_tiles.iter().flatten() {
                s += tile.at(ii, jj).to_f32();
            }
            out[ii] = (s - view.lse[ii]).exp();
        }
    }

    let Some(mask) = dropout else {
        return false;
    };
    view.mask.fill(0.0);
    for ii in 0..ext.rows_i {
        let row = &mut view.mask.row_mut(ii)[..ext.rows_j];
        mask.fill_row(ext.query_start + ii, ext.key_start, row);
    }
    true
}

/// Writes the gradV operand into staging: `P^T`, multiplied by the mask
/// when dropout is active.
pub fn value_operand<P: TileParams>(view: &mut ValueGradView<'_, P>, masked: bool) {
    view.staging.copy_from(view.prob_t);
    if !masked {
        return;
    }
    for jj in 0..P::BLOCK_J {
        let row = view.staging.row_mut(jj);
        for ii in 0..P::BLOCK_I {
            row[ii] *= view.mask.at(ii, jj);
        }
    }
}

/// `dS = P * (dP - Delta_i)` with `dP = dO_i V_j^T`, masked by dropout.
/// Bias gradients receive the pre-scale `dS`; the stored tile is scaled.
pub fn score_grad<P: TileParams, E: Element, G: GemmEngine>(
    engine: &G,
    view: ScoreGradView<'_, P>,
    dp: &mut RtIJ<P>,
    ext: TileExtent,
    head_dim_value: usize,
    scale: f32,
    masked: bool,
    biases: &UnitBiases<'_, E>,
) {
    dp.zero();
    engine.mma_abt(dp, view.grad_out_rows, view.value_rows, head_dim_value);

    for ii in 0..P::BLOCK_I {
        let delta = view.delta[ii];
        let out = view.grad_scores.row_mut(ii);
        for jj in 0..P::BLOCK_J {
            let mut dpv = dp.at(ii, jj);
            if masked {
                dpv *= view.mask.at(ii, jj);
            }
            out[jj] = view.prob_t.at(jj, ii) * (dpv - delta);
        }
    }

    biases.accumulate_grads(view.grad_scores, ext);
    view.grad_scores.mul_scalar(scale);
}

#[cfg(test)]
mod tests {
    use evoattn_tiles::{gemm::PortableGemm, tiles::{D4, D8}};

    use super::*;
    use crate::{arena::ScratchArena, params::Tiles};

    type P = Tiles<D4, D4, D8>;

    fn extent(rows_i: usize, rows_j: usize) -> TileExtent {
        TileExtent {
            query_start: 0,
            key_start: 0,
            rows_i,
            rows_j,
        }
    }

    fn load(arena: &mut ScratchArena<P>, rows_i: usize, rows_j: usize, lse: f32) {
        let qk: Vec<f32> = (0..4 * 8).map(|v| ((v % 5) as f32 - 2.0) * 0.25).collect();
        let view = GlobalView::new(&qk, 0, 8);
        let ext = extent(rows_i, rows_j);
        load_key_tile(arena.load_keys(), &view, &view, ext, 8, 8);
        let lse = vec![lse; 4];
        let delta = vec![0.5; 4];
        load_query_tile(arena.load_queries(), &view, &view, &lse, &delta, ext, 8, 8);
    }

    #[test]
    fn probabilities_vanish_outside_partial_tile() {
        let mut arena = ScratchArena::<P>::new();
        load(&mut arena, 3, 2, 0.0);
        let mut scores = RtJI::<P>::new();

        let view = arena.score_recompute();
        let masked = score_recompute(
            &PortableGemm,
            view,
            &mut scores,
            extent(3, 2),
            8,
            1.0,
            &UnitBiases::<f32>::none(),
            None,
        );
        assert!(!masked);

        let view = arena.value_grad();
        for jj in 0..4 {
            for ii in 0..4 {
                let p = view.prob_t.at(jj, ii);
                if jj < 2 && ii < 3 {
                    assert!(p > 0.0);
                } else {
                    assert_eq!(p, 0.0, "({jj}, {ii})");
                }
            }
        }
    }

    #[test]
    fn score_grad_scales_after_softmax_jacobian() {
        let mut arena = ScratchArena::<P>::new();
        load(&mut arena, 4, 4, 1.0);
        let mut scores = RtJI::<P>::new();
        let mut dp = RtIJ::<P>::new();
        let ext = extent(4, 4);
        let biases = UnitBiases::<f32>::none();

        let view = arena.score_recompute();
        score_recompute(&PortableGemm, view, &mut scores, ext, 8, 1.0, &biases, None);
        let mut view = arena.value_grad();
        value_operand(&mut view, false);
        assert_eq!(view.staging.as_slice(), view.prob_t.as_slice());

        score_grad(&PortableGemm, arena.score_grad(), &mut dp, ext, 8, 0.5, false, &biases);

        let grads = arena.query_grad();
        for ii in 0..4 {
            for jj in 0..4 {
                // K = Q and V = dO, so dP is the transposed raw score.
                let raw = scores.at(jj, ii);
                assert!((dp.at(ii, jj) - raw).abs() < 1e-6);
                let p = (raw - 1.0).exp();
                let expected = 0.5 * p * (raw - 0.5);
                assert!((grads.grad_scores.at(ii, jj) - expected).abs() < 1e-5);
            }
        }
    }
}
