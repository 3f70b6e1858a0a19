//! Deterministic dropout mask, regenerated on the fly.
//!
//! Every (batch, head, query, key) coordinate owns one 32-bit word of a
//! counter-based ChaCha stream keyed by the dropout seed. The word position is
//! `offset + batch_id·H·Mq·Mk + head·Mq·Mk + query·Mk + key`, so a mask entry
//! depends only on its coordinate and is never stored.

#[cfg(feature = "dropout")]
use rand_chacha::{
    ChaCha8Rng,
    rand_core::{RngCore, SeedableRng},
};
use serde::Serialize;

use crate::params::AttentionShape;

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct DropoutParams {
    pub prob: f32,
    pub seed: u64,
    pub offset: u64,
}

impl DropoutParams {
    pub fn disabled() -> Self {
        Self {
            prob: 0.0,
            seed: 0,
            offset: 0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.prob > 0.0
    }

    /// Value a kept entry is multiplied by.
    pub fn keep_scale(&self) -> f32 {
        if self.prob >= 1.0 {
            0.0
        } else {
            1.0 / (1.0 - self.prob)
        }
    }

    /// Stream position of the unit's `(query 0, key 0)` coordinate.
    pub fn unit_offset(&self, shape: &AttentionShape, batch_id: usize, head: usize) -> u64 {
        let per_head = shape.scores_per_head() as u64;
        self.offset + batch_id as u64 * shape.heads as u64 * per_head + head as u64 * per_head
    }
}

/// Maps a stream word to a uniform in `[0, 1)` with 24 bits of precision.
#[cfg(feature = "dropout")]
#[inline]
fn uniform(word: u32) -> f32 {
    (word >> 8) as f32 * (1.0 / 16_777_216.0)
}

/// Whether the entry at one coordinate survives dropout.
#[cfg(feature = "dropout")]
pub fn keep(
    params: &DropoutParams,
    shape: &AttentionShape,
    batch_id: usize,
    head: usize,
    query: usize,
    key: usize,
) -> bool {
    let pos = params.unit_offset(shape, batch_id, head) + (query * shape.num_keys + key) as u64;
    let mut rng = ChaCha8Rng::seed_from_u64(params.seed);
    rng.set_word_pos(pos as u128);
    uniform(rng.next_u32()) >= params.prob
}

/// Mask generator owned by one compute unit.
pub struct DropoutMask {
    #[cfg(feature = "dropout")]
    rng: ChaCha8Rng,
    prob: f32,
    scale: f32,
    unit_offset: u64,
    num_keys: usize,
}

impl DropoutMask {
    /// `None` when dropout is off.
    pub fn for_unit(
        params: &DropoutParams,
        shape: &AttentionShape,
        batch_id: usize,
        head: usize,
    ) -> Option<Self> {
        if !params.is_enabled() || !cfg!(feature = "dropout") {
            return None;
        }
        Some(Self {
            #[cfg(feature = "dropout")]
            rng: ChaCha8Rng::seed_from_u64(params.seed),
            prob: params.prob,
            scale: params.keep_scale(),
            unit_offset: params.unit_offset(shape, batch_id, head),
            num_keys: shape.num_keys,
        })
    }

    /// Writes the mask values (`0` or `1 / (1 - p)`) of `query` for keys
    /// `key_start..key_start + out.len()`.
    pub fn fill_row(&mut self, query: usize, key_start: usize, out: &mut [f32]) {
        #[cfg(feature = "dropout")]
        {
            let pos = self.unit_offset + (query * self.num_keys + key_start) as u64;
            self.rng.set_word_pos(pos as u128);
            for value in out.iter_mut() {
                *value = if uniform(self.rng.next_u32()) >= self.prob {
                    self.scale
                } else {
                    0.0
                };
            }
        }
        #[cfg(not(feature = "dropout"))]
        {
            let _ = (query, key_start, self.unit_offset, self.num_keys, self.prob);
            out.fill(self.scale);
        }
    }
}

/// The full `[Mq, Mk]` mask plane of one (batch, head) pair. Only the
/// reference path materializes this.
pub fn mask_plane(
    params: &DropoutParams,
    shape: &AttentionShape,
    batch_id: usize,
    head: usize,
) -> Vec<f32> {
    let mut plane = vec![1.0f32; shape.scores_per_head()];
    if let Some(mut mask) = DropoutMask::for_unit(params, shape, batch_id, head) {
        for (q, row) in plane.chunks_mut(shape.num_keys).enumerate() {
            mask.fill_row(q, 0, row);
        }
    }
    plane
}
