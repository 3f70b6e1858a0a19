//! Fused, tiled backward pass of evoformer scaled-dot-product attention.
//!
//! Given Q, K, V, the forward output O, its incoming gradient dO and the
//! per-row log-sum-exp saved by the forward pass, [`launch`] computes gradQ,
//! gradK, gradV and, optionally, the gradients of two broadcast biases,
//! without materializing the full score matrix. The tensor-level entry point
//! is [`api::attention_backward`].
//!
//! One compute unit handles one (batch, head) pair. For each key tile it
//! walks the query tiles, recomputing the probabilities from LSE and chaining
//! the five dependent tile products; partial gradients that outlive a tile
//! are reconciled by the cross-tile accumulator.

#![allow(clippy::too_many_arguments)]
#![allow(clippy::needless_range_loop)]

pub mod accumulator;
pub mod api;
pub mod arena;
pub mod backward;
pub mod bias;
mod bundle;
pub mod config;
pub mod delta;
pub mod dropout;
pub mod error;
pub mod launch;
pub mod params;
pub mod plan;
pub mod problem;
pub mod reference;
pub mod scheduler;
pub mod skip;
mod stages;

#[cfg(test)]
mod test_utils;

#[cfg(test)]
mod tests;

pub use bundle::TensorBundle;
pub use config::AttentionBackwardConfig;
pub use error::LaunchError;
pub use evoattn_common::DType;
pub use launch::{
    BackwardArgs, LaunchReport, check_supported, launch, launch_with_policy, workspace_elements,
    workspace_layout, workspace_size,
};
pub use params::{AttentionGrads, AttentionInputs, AttentionShape, Layout, LseLayout};
