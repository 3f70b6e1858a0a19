//! Cross-tile accumulation of partial gradients.
//!
//! An output tile of gradQ receives one contribution per key tile, and an
//! output tile of gradK/gradV one per query tile. Between contributions the
//! partial sum lives either in the output itself ([`AccumStrategy::InPlace`],
//! read-add-write, exact when the output is `f32`) or in an `f32` workspace
//! slot ([`AccumStrategy::Workspace`]) that is only downcast on the last visit.

use evoattn_tiles::{
    element::Element,
    gemm::{GemmEngine, StoreMode},
    global::GlobalViewMut,
    tiles::{Dim, Rt},
};
use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AccumStrategy {
    InPlace,
    Workspace,
}

impl AccumStrategy {
    /// `Workspace` unless the output element can hold the running sum exactly.
    pub fn for_output(output_is_f32: bool) -> Self {
        if output_is_f32 {
            Self::InPlace
        } else {
            Self::Workspace
        }
    }

    pub fn uses_workspace(self) -> bool {
        self == Self::Workspace
    }

    /// Readies `acc` for the next contribution: cleared on the first visit,
    /// otherwise reloaded from the workspace slot.
    pub fn prime<R: Dim, C: Dim>(
        self,
        acc: &mut Rt<f32, R, C>,
        visit: Visit,
        slot: Option<&[f32]>,
    ) {
        match (self, slot) {
            (Self::Workspace, Some(slot)) if !visit.is_first => acc.copy_from_slice(slot),
            _ => acc.zero(),
        }
    }

    /// Retires `acc` after a contribution: parked in the workspace while more
    /// contributions follow, otherwise written to `dst` by the epilogue.
    pub fn flush<G: GemmEngine, E: Element, R: Dim, C: Dim>(
        self,
        engine: &G,
        acc: &Rt<f32, R, C>,
        visit: Visit,
        slot: Option<&mut [f32]>,
        dst: &mut GlobalViewMut<'_, E>,
        rows: usize,
        cols: usize,
    ) {
        if let (Self::Workspace, false, Some(slot)) = (self, visit.is_last, slot) {
            acc.copy_to_slice(slot);
            return;
        }
        let first = visit.is_first || self.uses_workspace();
        engine.epilogue(acc, dst, rows, cols, 1.0, StoreMode::first_or_accumulate(first));
    }
}

/// Where one contribution falls in the sequence for its output tile.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Visit {
    pub is_first: bool,
    pub is_last: bool,
}
