use evoattn_common::{BiasMode, DType};
use evoattn_tiles::{element::Element, test_utils::TestFloat};
use half::{bf16, f16};
use test_case::{test_case, test_matrix};

use crate::{
    api::{attention_backward, infer_shape},
    config::AttentionBackwardConfig,
    error::LaunchError,
    launch::{check_supported, element_dtype, launch, launch_with_policy, workspace_size},
    problem::{OutputsData, ProblemData, ProblemDims, RefBackend},
    reference::reference_backward,
    skip::QueryStartPolicy,
    test_utils::{HostBuffers, assert_outputs_close},
};

fn config<E: Element>(
    block_i: usize,
    block_j: usize,
    max_head_dim: usize,
) -> AttentionBackwardConfig {
    AttentionBackwardConfig::new()
        .with_block_i(block_i)
        .with_block_j(block_j)
        .with_max_head_dim(max_head_dim)
        .with_dtype(element_dtype::<E>())
}

fn run_kernel<E: Element>(
    problem: &ProblemData,
    config: &AttentionBackwardConfig,
    bias_grads: bool,
) -> OutputsData {
    let device = Default::default();
    let inputs = problem.inputs::<E, RefBackend>(config, bias_grads, &device).unwrap();
    OutputsData::from_outputs(attention_backward(inputs, config).unwrap()).unwrap()
}

fn run_reference<E: Element>(
    problem: &ProblemData,
    config: &AttentionBackwardConfig,
    bias_grads: bool,
) -> OutputsData {
    let device = Default::default();
    let inputs = problem.inputs::<E, RefBackend>(config, bias_grads, &device).unwrap();
    OutputsData::from_outputs(reference_backward(inputs, config).unwrap()).unwrap()
}

fn check_against_reference<E: TestFloat>(
    dims: ProblemDims,
    config: &AttentionBackwardConfig,
    bias: BiasMode,
) {
    let problem = ProblemData::random::<E>(dims, bias, 42);
    let bias_grads = bias != BiasMode::None;
    assert_outputs_close(
        &run_kernel::<E>(&problem, config, bias_grads),
        &run_reference::<E>(&problem, config, bias_grads),
        E::RTOL,
        E::ATOL,
        &format!("{} {dims:?}", E::NAME),
    );
}

/// `(batch, heads, queries, keys, head_dim, head_dim_value)`
type Sizes = (usize, usize, usize, usize, usize, usize);

#[test_case((2, 3, 64, 64, 32, 32), (16, 16, 32) ; "exact_tiles")]
#[test_case((2, 2, 70, 45, 32, 32), (16, 16, 32) ; "partial_tiles")]
#[test_case((1, 2, 33, 97, 64, 40), (32, 32, 64) ; "value_dim_differs")]
#[test_case((1, 1, 130, 20, 128, 128), (64, 32, 128) ; "wide_head")]
#[test_case((2, 3, 19, 23, 6, 5), (16, 16, 32) ; "unaligned_head_dims")]
#[test_case((1, 2, 1, 1, 1, 1), (8, 8, 32) ; "single_column_heads")]
fn kernel_matches_reference_f32(sizes: Sizes, tiles: (usize, usize, usize)) {
    let (batch, heads, num_queries, num_keys, head_dim, head_dim_value) = sizes;
    let dims = ProblemDims::new(batch, heads, num_queries, num_keys, head_dim)
        .with_value_dim(head_dim_value);
    let config = config::<f32>(tiles.0, tiles.1, tiles.2);
    check_against_reference::<f32>(dims, &config, BiasMode::None);
}

#[test_case(16, 16, 32 ; "workspace_accumulation")]
#[test_case(32, 32, 32 ; "register_resident")]
#[test_case(64, 64, 64 ; "large_tiles")]
fn kernel_matches_reference_f16(block_i: usize, block_j: usize, max_head_dim: usize) {
    let dims = ProblemDims::new(2, 2, 70, 90, 32);
    let config = config::<f16>(block_i, block_j, max_head_dim);
    check_against_reference::<f16>(dims, &config, BiasMode::None);
}

#[test_case(16, 16, 32 ; "workspace_accumulation")]
#[test_case(32, 32, 32 ; "register_resident")]
fn kernel_matches_reference_bf16(block_i: usize, block_j: usize, max_head_dim: usize) {
    let dims = ProblemDims::new(1, 2, 50, 40, 32);
    let config = config::<bf16>(block_i, block_j, max_head_dim);
    check_against_reference::<bf16>(dims, &config, BiasMode::None);
}

#[test_matrix([(8, 8), (16, 16), (32, 32), (64, 32), (64, 64)])]
fn result_does_not_depend_on_tile_shape(tiles: (usize, usize)) {
    let dims = ProblemDims::new(2, 2, 75, 68, 32);
    let problem = ProblemData::random::<f32>(dims, BiasMode::Both, 7);
    let baseline = run_kernel::<f32>(&problem, &config::<f32>(16, 16, 32), true);
    let tested = run_kernel::<f32>(&problem, &config::<f32>(tiles.0, tiles.1, 32), true);
    let name = format!("tiles {tiles:?}");
    assert_outputs_close(&tested, &baseline, f32::RTOL, f32::ATOL, &name);
}

#[test]
fn single_query_single_key() {
    let dims = ProblemDims::new(1, 1, 1, 1, 1);
    let problem = ProblemData::random::<f32>(dims, BiasMode::None, 3);
    let out = run_kernel::<f32>(&problem, &config::<f32>(8, 8, 32), false);

    // P = 1, so dS = dP - Delta = 0 and gradV passes dO through.
    assert_eq!(out.grad_q, vec![0.0]);
    assert_eq!(out.grad_k, vec![0.0]);
    assert!((out.grad_v[0] - problem.d_o[0]).abs() < 1e-6);
    assert!((out.delta[0] - problem.v[0] * problem.d_o[0]).abs() < 1e-6);
}

#[test_case(BiasMode::PairBias, 2 ; "pair_bias_grouped")]
#[test_case(BiasMode::PairBias, 1 ; "pair_bias_per_batch")]
#[test_case(BiasMode::KeyMask, 1 ; "key_mask")]
#[test_case(BiasMode::Both, 2 ; "both")]
fn bias_gradients_match_reference(bias: BiasMode, group_size: usize) {
    let dims = ProblemDims::new(4, 2, 37, 41, 16).with_group_size(group_size);
    check_against_reference::<f32>(dims, &config::<f32>(16, 16, 32), bias);
}

#[test_case(1 ; "per_batch")]
#[test_case(2 ; "pairs")]
#[test_case(4 ; "whole_batch")]
fn group_size_follows_pair_bias(group_size: usize) {
    let dims = ProblemDims::new(4, 2, 8, 8, 16).with_group_size(group_size);
    let config = config::<f32>(16, 16, 32);
    let problem = ProblemData::random::<f32>(dims, BiasMode::PairBias, 6);
    let inputs = problem.inputs::<f32, RefBackend>(&config, false, &Default::default()).unwrap();
    assert_eq!(infer_shape(&inputs).unwrap(), dims.shape());
}

#[test]
fn bias_gradient_is_not_requested_without_flag() {
    let dims = ProblemDims::new(2, 1, 20, 20, 16);
    let problem = ProblemData::random::<f32>(dims, BiasMode::Both, 5);
    let out = run_kernel::<f32>(&problem, &config::<f32>(16, 16, 32), false);
    assert!(out.grad_bias1.is_none());
    assert!(out.grad_bias2.is_none());
}

#[cfg(feature = "dropout")]
mod dropout {
    use super::*;

    fn dropout_config(offset: u64) -> AttentionBackwardConfig {
        config::<f32>(16, 16, 32)
            .with_dropout_prob(0.25)
            .with_dropout_seed(1234)
            .with_dropout_offset(offset)
    }

    #[test]
    fn matches_reference_with_dropout() {
        let dims = ProblemDims::new(2, 2, 40, 36, 16);
        check_against_reference::<f32>(dims, &dropout_config(0), BiasMode::PairBias);
    }

    #[test]
    fn matches_reference_with_dropout_in_half_workspace() {
        let dims = ProblemDims::new(2, 2, 40, 36, 16).with_group_size(2);
        let config = config::<f16>(16, 16, 32)
            .with_dropout_prob(0.3)
            .with_dropout_seed(99)
            .with_dropout_offset(640);
        check_against_reference::<f16>(dims, &config, BiasMode::Both);
    }

    #[test_matrix([(8, 8), (32, 32), (64, 32)])]
    fn dropout_does_not_depend_on_tile_shape(tiles: (usize, usize)) {
        let dims = ProblemDims::new(2, 2, 75, 68, 32);
        let problem = ProblemData::random::<f32>(dims, BiasMode::Both, 17);
        let with_tiles = |(block_i, block_j): (usize, usize)| {
            config::<f32>(block_i, block_j, 32)
                .with_dropout_prob(0.3)
                .with_dropout_seed(2024)
        };
        let baseline = run_kernel::<f32>(&problem, &with_tiles((16, 16)), true);
        let tested = run_kernel::<f32>(&problem, &with_tiles(tiles), true);
        let name = format!("dropout tiles {tiles:?}");
        assert_outputs_close(&tested, &baseline, f32::RTOL, f32::ATOL, &name);
    }

    fn problem() -> ProblemData {
        ProblemData::random::<f32>(ProblemDims::new(1, 2, 30, 30, 16), BiasMode::None, 9)
    }

    #[test]
    fn same_offset_gives_identical_gradients() {
        let problem = problem();
        let a = run_kernel::<f32>(&problem, &dropout_config(77), false);
        let b = run_kernel::<f32>(&problem, &dropout_config(77), false);
        assert_eq!(a.grad_q, b.grad_q);
        assert_eq!(a.grad_k, b.grad_k);
        assert_eq!(a.grad_v, b.grad_v);
    }

    #[test]
    fn offset_changes_gradients_not_shapes() {
        let problem = problem();
        let a = run_kernel::<f32>(&problem, &dropout_config(0), false);
        let b = run_kernel::<f32>(&problem, &dropout_config(5000), false);
        assert_eq!(a.grad_v.len(), b.grad_v.len());
        assert_ne!(a.grad_v, b.grad_v);
        assert_ne!(a.grad_q, b.grad_q);
        assert_ne!(a.grad_k, b.grad_k);
    }
}

#[test]
fn units_do_not_see_each_other() {
    let dims = ProblemDims::new(2, 2, 24, 24, 16);
    let problem = ProblemData::random::<f32>(dims, BiasMode::None, 11);
    let mut perturbed = problem.clone();
    // Batch 1 occupies the second half of every input.
    for data in [&mut perturbed.q, &mut perturbed.k, &mut perturbed.v, &mut perturbed.d_o] {
        let half = data.len() / 2;
        for value in &mut data[half..] {
            *value = -*value * 0.5;
        }
    }

    let config = config::<f32>(16, 16, 32);
    let a = run_kernel::<f32>(&problem, &config, false);
    let b = run_kernel::<f32>(&perturbed, &config, false);
    for (name, (x, y)) in [
        ("grad_q", (&a.grad_q, &b.grad_q)),
        ("grad_k", (&a.grad_k, &b.grad_k)),
        ("grad_v", (&a.grad_v, &b.grad_v)),
        ("delta", (&a.delta, &b.delta)),
    ] {
        let half = x.len() / 2;
        assert_eq!(x[..half], y[..half], "{name} of batch 0 changed");
        assert_ne!(x[half..], y[half..], "{name} of batch 1 did not change");
    }
}

/// Key tiles from `key_start` onward attend to no query.
struct SkipKeysFrom(usize);

impl QueryStartPolicy for SkipKeysFrom {
    fn query_start(&self, key_start: usize, num_queries: usize) -> usize {
        if key_start >= self.0 { num_queries } else { 0 }
    }
}

fn check_unreachable_tiles_zeroed<E: Element>(block: usize) {
    let dims = ProblemDims::new(2, 2, 20, 3 * block - 5, 32);
    let config = config::<E>(block, block, 32);
    let mut buffers = HostBuffers::<E>::random(dims, &config, 13);
    let poison = E::from_f32(f32::NAN);
    let grads = &mut buffers.grads;
    for grad in [&mut grads.grad_q, &mut grads.grad_k, &mut grads.grad_v] {
        grad.fill(poison);
    }

    launch_with_policy(&config, buffers.args(), &SkipKeysFrom(block)).unwrap();

    let row_len = dims.heads * dims.head_dim;
    let written = [("grad_k", &buffers.grads.grad_k), ("grad_v", &buffers.grads.grad_v)];
    for (name, grad) in written {
        for (row, values) in grad.chunks(row_len).enumerate() {
            let key = row % dims.num_keys;
            for value in values.iter().map(|v| v.to_f32()) {
                if key >= block {
                    assert_eq!(value, 0.0, "{name} key {key}");
                } else {
                    assert!(value.is_finite(), "{name} key {key}");
                }
            }
        }
    }
    assert!(buffers.grads.grad_q.iter().all(|v| v.to_f32().is_finite()));
}

#[test]
fn unreachable_key_tiles_are_zero_filled() {
    check_unreachable_tiles_zeroed::<f32>(16);
}

#[test]
fn unreachable_key_tiles_are_zero_filled_in_registers() {
    check_unreachable_tiles_zeroed::<f16>(32);
}

#[test]
fn full_attention_policy_writes_every_row() {
    let dims = ProblemDims::new(1, 2, 17, 33, 16);
    let config = config::<f16>(16, 16, 32);
    let mut buffers = HostBuffers::<f16>::random(dims, &config, 21);
    buffers.grads.grad_k.fill(f16::NAN);
    let report = launch(&config, buffers.args()).unwrap();

    assert!(buffers.grads.grad_k.iter().all(|v| v.is_finite()));
    assert!(report.workspace_bytes > 0);
    assert_eq!(report.units, 2);
    assert_eq!(report.groups, 2);
}

#[test]
fn bias_gradient_units_are_serialized() {
    let dims = ProblemDims::new(4, 3, 10, 10, 16).with_group_size(2);
    let config = config::<f32>(16, 16, 32);
    let mut buffers = HostBuffers::<f32>::random(dims, &config, 4);
    let bias = vec![0.0f32; 2 * 3 * 10 * 10];
    let mut grad = vec![0.0f32; bias.len()];
    let mut args = buffers.args();
    args.bias2 = Some(bias.as_slice());
    args.grad_bias2 = Some(grad.as_mut_slice());

    let report = launch(&config, args).unwrap();
    assert_eq!(report.units, 12);
    assert_eq!(report.groups, 6);
}

#[test]
fn workspace_only_for_narrow_outputs() {
    let shape = ProblemDims::new(2, 4, 100, 100, 64).shape();
    assert_eq!(workspace_size(&config::<f32>(64, 64, 64), &shape), 0);
    assert!(workspace_size(&config::<f16>(32, 32, 64), &shape) > 0);
}

mod validation {
    use super::*;
    use test_case::test_case;

    fn buffers(dims: ProblemDims, config: &AttentionBackwardConfig) -> HostBuffers<f32> {
        HostBuffers::random(dims, config, 1)
    }

    fn dims() -> ProblemDims {
        ProblemDims::new(2, 2, 20, 20, 16)
    }

    #[test]
    fn accepts_valid_arguments() {
        let config = config::<f32>(16, 16, 32);
        let mut buffers = buffers(dims(), &config);
        assert_eq!(check_supported(&config, &buffers.args()), Ok(()));
    }

    #[test_case(16, 8, 32 ; "mismatched_tiles")]
    #[test_case(64, 64, 256 ; "head_dim_max")]
    #[test_case(128, 128, 64 ; "oversized_tiles")]
    fn rejects_unsupported_tiles(block_i: usize, block_j: usize, max_head_dim: usize) {
        let config = config::<f32>(block_i, block_j, max_head_dim);
        let mut buffers = buffers(dims(), &config);
        assert_eq!(
            check_supported(&config, &buffers.args()),
            Err(LaunchError::UnsupportedTiles {
                block_i,
                block_j,
                max_head_dim
            })
        );
    }

    #[test]
    fn rejects_oversized_head_dim() {
        let config = config::<f32>(16, 16, 32);
        let mut buffers = buffers(ProblemDims::new(1, 1, 8, 8, 64), &config);
        assert_eq!(
            check_supported(&config, &buffers.args()),
            Err(LaunchError::HeadDimTooLarge {
                name: "head_dim",
                value: 64,
                max: 32
            })
        );
    }

    #[test]
    fn rejects_empty_dimension() {
        let config = config::<f32>(16, 16, 32);
        let mut buffers = buffers(ProblemDims::new(1, 1, 8, 8, 16), &config);
        let mut args = buffers.args();
        args.shape.num_keys = 0;
        assert_eq!(
            check_supported(&config, &args),
            Err(LaunchError::NonPositive { name: "num_keys" })
        );
    }

    #[test]
    fn rejects_indivisible_group() {
        let config = config::<f32>(16, 16, 32);
        let mut buffers = buffers(ProblemDims::new(3, 1, 8, 8, 16).with_group_size(2), &config);
        assert_eq!(
            check_supported(&config, &buffers.args()),
            Err(LaunchError::GroupSize {
                group_size: 2,
                batch: 3
            })
        );
    }

    #[test_case(-0.1 ; "negative")]
    #[test_case(1.5 ; "above_one")]
    fn rejects_dropout_out_of_range(prob: f32) {
        let config = config::<f32>(16, 16, 32).with_dropout_prob(prob);
        let mut buffers = buffers(dims(), &config);
        assert_eq!(
            check_supported(&config, &buffers.args()),
            Err(LaunchError::DropoutOutOfRange(prob))
        );
    }

    #[test]
    fn rejects_missing_workspace() {
        let config = config::<f16>(16, 16, 32);
        let mut buffers = HostBuffers::<f16>::random(dims(), &config, 1);
        let required = buffers.workspace.len();
        assert!(required > 0);
        buffers.workspace.clear();
        assert_eq!(
            check_supported(&config, &buffers.args()),
            Err(LaunchError::Workspace {
                required,
                provided: 0
            })
        );
    }

    #[test]
    fn rejects_misaligned_query_offset() {
        let config = config::<f32>(16, 16, 32);
        let mut buffers = buffers(dims(), &config);
        buffers.layouts.q.offset = 2;
        assert_eq!(
            check_supported(&config, &buffers.args()),
            Err(LaunchError::Misaligned {
                tensor: "q",
                what: "base offset",
                value: 2,
                alignment: 4
            })
        );
    }

    #[test]
    fn rejects_misaligned_key_row_stride() {
        let config = config::<f32>(16, 16, 32);
        let mut buffers = buffers(dims(), &config);
        // Heads stay 4-aligned, so only the row pitch is off.
        buffers.layouts.k.row_stride = 34;
        assert_eq!(
            check_supported(&config, &buffers.args()),
            Err(LaunchError::Misaligned {
                tensor: "k",
                what: "row stride",
                value: 34,
                alignment: 4
            })
        );
    }

    #[test]
    fn rejects_misaligned_lse_stride() {
        let config = config::<f32>(16, 16, 32);
        let mut buffers = buffers(dims(), &config);
        let mut args = buffers.args();
        args.lse_layout.head_stride = 20;
        args.lse_layout.batch_stride = 40;
        assert!(matches!(
            check_supported(&config, &args),
            Err(LaunchError::Misaligned { tensor: "lse", .. })
        ));
    }

    #[test]
    fn rejects_short_tensor() {
        let config = config::<f32>(16, 16, 32);
        let mut buffers = buffers(dims(), &config);
        buffers.inputs.v.truncate(10);
        assert!(matches!(
            check_supported(&config, &buffers.args()),
            Err(LaunchError::TensorTooShort { tensor: "v", len: 10, .. })
        ));
    }

    #[test]
    fn rejects_overlapping_gradient() {
        let config = config::<f32>(16, 16, 32);
        let mut buffers = buffers(dims(), &config);
        let mut args = buffers.args();
        args.grads.grad_k.layout.head_stride = 0;
        assert_eq!(
            check_supported(&config, &args),
            Err(LaunchError::OverlappingLayout { tensor: "grad_k" })
        );
    }

    #[test]
    fn rejects_bias_gradient_without_bias() {
        let config = config::<f32>(16, 16, 32);
        let mut buffers = buffers(dims(), &config);
        let mut grad = vec![0.0f32; 2 * 20];
        let mut args = buffers.args();
        args.grad_bias1 = Some(grad.as_mut_slice());
        assert_eq!(
            check_supported(&config, &args),
            Err(LaunchError::OrphanBiasGrad("grad_bias1"))
        );
    }

    #[test]
    fn api_reports_shape_mismatch() {
        let dims = ProblemDims::new(1, 2, 8, 8, 16);
        let config = config::<f32>(16, 16, 32);
        let problem = ProblemData::random::<f32>(dims, BiasMode::None, 2);
        let device = Default::default();
        let mut inputs = problem.inputs::<f32, RefBackend>(&config, false, &device).unwrap();
        inputs.v = inputs.v.slice([0..1, 0..4, 0..2, 0..16]);

        let err = attention_backward(inputs, &config).unwrap_err();
        assert_eq!(
            err,
            LaunchError::ShapeMismatch {
                tensor: "v",
                expected: vec![1, 8, 2, 16],
                actual: vec![1, 4, 2, 16],
            }
        );
    }

    #[test]
    fn api_rejects_pair_bias_groups_that_split_the_batch() {
        let dims = ProblemDims::new(4, 1, 8, 8, 16);
        let config = config::<f32>(16, 16, 32);
        let problem = ProblemData::random::<f32>(dims, BiasMode::PairBias, 2);
        let device = Default::default();
        let mut inputs = problem.inputs::<f32, RefBackend>(&config, true, &device).unwrap();
        inputs.bias2 = inputs.bias2.map(|b| b.slice([0..3, 0..1, 0..8, 0..8]));

        assert_eq!(
            attention_backward(inputs, &config).unwrap_err(),
            LaunchError::BiasGroups { groups: 3, batch: 4 }
        );
    }

    #[test]
    fn dtype_selects_element_type() {
        assert_eq!(element_dtype::<f32>(), DType::F32);
        assert_eq!(element_dtype::<f16>(), DType::F16);
        assert_eq!(element_dtype::<bf16>(), DType::BF16);
    }
}
