//! On-chip scratch storage of one compute unit.
//!
//! The arena holds every scratch tile a unit uses, as named regions. Each
//! pipeline phase gets a view that borrows exactly the regions it reads and
//! the ones it produces; opening a view is the barrier that ends the previous
//! phase. Debug builds check that phases follow the pipeline order.

use crate::params::{StIJ, StIK, StJI, StJK, TileParams};

/// Pipeline phases in execution order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    LoadKeys,
    LoadQueries,
    ScoreRecompute,
    ValueGrad,
    ScoreGrad,
    QueryGrad,
    KeyGrad,
}

impl Phase {
    fn can_advance_to(self, next: Phase) -> bool {
        use Phase::*;
        matches!(
            (self, next),
            (LoadKeys, LoadKeys | LoadQueries)
                | (LoadQueries, ScoreRecompute)
                | (ScoreRecompute, ValueGrad)
                | (ValueGrad, ScoreGrad)
                | (ScoreGrad, QueryGrad)
                | (QueryGrad, KeyGrad)
                | (KeyGrad, LoadQueries | LoadKeys)
        )
    }
}

pub struct ScratchArena<P: TileParams> {
    phase: Phase,
    key_rows: StJK<P>,
    value_rows: StJK<P>,
    query_rows: StIK<P>,
    grad_out_rows: StIK<P>,
    lse: Vec<f32>,
    delta: Vec<f32>,
    prob_t: StJI<P>,
    mask: StIJ<P>,
    staging: StJI<P>,
    grad_scores: StIJ<P>,
}

pub struct KeyLoad<'s, P: TileParams> {
    pub key_rows: &'s mut StJK<P>,
    pub value_rows: &'s mut StJK<P>,
}

pub struct QueryLoad<'s, P: TileParams> {
    pub query_rows: &'s mut StIK<P>,
    pub grad_out_rows: &'s mut StIK<P>,
    pub lse: &'s mut [f32],
    pub delta: &'s mut [f32],
}

pub struct ScoreRecomputeView<'s, P: TileParams> {
    pub query_rows: &'s StIK<P>,
    pub key_rows: &'s StJK<P>,
    pub lse: &'s [f32],
    pub prob_t: &'s mut StJI<P>,
    pub mask: &'s mut StIJ<P>,
}

pub struct ValueGradView<'s, P: TileParams> {
    pub prob_t: &'s StJI<P>,
    pub mask: &'s StIJ<P>,
    pub grad_out_rows: &'s StIK<P>,
    /// Dropout-masked copy of `prob_t`; `prob_t` itself is still needed for dS.
    pub staging: &'s mut StJI<P>,
}

pub struct ScoreGradView<'s, P: TileParams> {
    pub prob_t: &'s StJI<P>,
    pub mask: &'s StIJ<P>,
    pub grad_out_rows: &'s StIK<P>,
    pub value_rows: &'s StJK<P>,
    pub delta: &'s [f32],
    pub grad_scores: &'s mut StIJ<P>,
}

pub struct QueryGradView<'s, P: TileParams> {
    pub grad_scores: &'s StIJ<P>,
    pub key_rows: &'s StJK<P>,
}

pub struct KeyGradView<'s, P: TileParams> {
    pub grad_scores: &'s StIJ<P>,
    pub query_rows: &'s StIK<P>,
}

impl<P: TileParams> ScratchArena<P> {
    pub fn new() -> Self {
        Self {
            phase: Phase::LoadKeys,
            key_rows: StJK::<P>::new(),
            value_rows: StJK::<P>::new(),
            query_rows: StIK::<P>::new(),
            grad_out_rows: StIK::<P>::new(),
            lse: vec![0.0; P::BLOCK_I],
            delta: vec![0.0; P::BLOCK_I],
            prob_t: StJI::<P>::new(),
            mask: StIJ::<P>::new(),
            staging: StJI::<P>::new(),
            grad_scores: StIJ::<P>::new(),
        }
    }

    /// Bytes of scratch storage per unit.
    pub fn capacity_bytes() -> usize {
        let (i, j, k) = (P::BLOCK_I, P::BLOCK_J, P::MAX_K);
        let elements = 2 * j * k + 2 * i * k + 2 * i + 4 * i * j;
        elements * std::mem::size_of::<f32>()
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    fn barrier(&mut self, next: Phase) {
        debug_assert!(
            self.phase.can_advance_to(next),
            "scratch phase {:?} cannot be followed by {next:?}",
            self.phase
        );
        self.phase = next;
    }

    pub fn load_keys(&mut self) -> KeyLoad<'_, P> {
        self.barrier(Phase::LoadKeys);
        KeyLoad {
            key_rows: &mut self.key_rows,
            value_rows: &mut self.value_rows,
        }
    }

    pub fn load_queries(&mut self) -> QueryLoad<'_, P> {
        self.barrier(Phase::LoadQueries);
        QueryLoad {
            query_rows: &mut self.query_rows,
            grad_out_rows: &mut self.grad_out_rows,
            lse: &mut self.lse,
            delta: &mut self.delta,
        }
    }

    pub fn score_recompute(&mut self) -> ScoreRecomputeView<'_, P> {
        self.barrier(Phase::ScoreRecompute);
        ScoreRecomputeView {
            query_rows: &self.query_rows,
            key_rows: &self.key_rows,
            lse: &self.lse,
            prob_t: &mut self.prob_t,
            mask: &mut self.mask,
        }
    }

    pub fn value_grad(&mut self) -> ValueGradView<'_, P> {
        self.barrier(Phase::ValueGrad);
        ValueGradView {
            prob_t: &self.prob_t,
            mask: &self.mask,
            grad_out_rows: &self.grad_out_rows,
            staging: &mut self.staging,
        }
    }

    pub fn score_grad(&mut self) -> ScoreGradView<'_, P> {
        self.barrier(Phase::ScoreGrad);
        ScoreGradView {
            prob_t: &self.prob_t,
            mask: &self.mask,
            grad_out_rows: &self.grad_out_rows,
            value_rows: &self.value_rows,
            delta: &self.delta,
            grad_scores: &mut self.grad_scores,
        }
    }

    pub fn query_grad(&mut self) -> QueryGradView<'_, P> {
        self.barrier(Phase::QueryGrad);
        QueryGradView {
            grad_scores: &self.grad_scores,
            key_rows: &self.key_rows,
        }
    }

    pub fn key_grad(&mut self) -> KeyGradView<'_, P> {
        self.barrier(Phase::KeyGrad);
        KeyGradView {
            grad_scores: &self.grad_scores,
            query_rows: &self.query_rows,
        }
    }
}

impl<P: TileParams> Default for ScratchArena<P> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use evoattn_tiles::tiles::{D8, D16, D32};

    use super::*;
    use crate::params::Tiles;

    type P = Tiles<D16, D8, D32>;

    #[test]
    fn pipeline_order_is_accepted() {
        let mut arena = ScratchArena::<P>::new();
        for _ in 0..2 {
            arena.load_keys();
            for _ in 0..3 {
                arena.load_queries();
                arena.score_recompute();
                arena.value_grad();
                arena.score_grad();
                arena.query_grad();
                arena.key_grad();
            }
        }
        assert_eq!(arena.phase(), Phase::KeyGrad);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "cannot be followed by")]
    fn skipping_score_recompute_is_rejected() {
        let mut arena = ScratchArena::<P>::new();
        arena.load_keys();
        arena.load_queries();
        arena.value_grad();
    }

    #[test]
    fn capacity_counts_every_region() {
        // 2 * 8 * 32 + 2 * 16 * 32 + 2 * 16 + 4 * 16 * 8
        assert_eq!(ScratchArena::<P>::capacity_bytes(), (512 + 1024 + 32 + 512) * 4);
    }
}
