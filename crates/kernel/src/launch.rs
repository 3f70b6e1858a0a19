//! Host-side entry: validation, tile-shape dispatch and the parallel run.

use std::marker::PhantomData;

use evoattn_common::DType;
use evoattn_tiles::{
    LINE_SIZE,
    element::Element,
    gemm::{GemmEngine, PortableGemm},
    global::RawBuffer,
    tiles::{D8, D16, D32, D64, D128},
};
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info};

use crate::{
    arena::ScratchArena,
    backward::{BackwardKernel, BiasInput},
    bias::{BiasBroadcast, KeyMask, PairBias},
    bundle::TensorBundle,
    config::AttentionBackwardConfig,
    dropout::DropoutParams,
    error::LaunchError,
    params::{
        AttentionGrads, AttentionInputs, AttentionShape, Layout, LseLayout, TensorMut, TensorRef,
        TileParams, Tiles,
    },
    plan::{KernelPlan, WorkspaceLayout},
    scheduler::{UnitCoord, unit_groups},
    skip::{FullAttention, QueryStartPolicy},
};

/// Tile shapes `(block_i, block_j)` the kernel is instantiated for.
pub const SUPPORTED_TILES: [(usize, usize); 5] = [(8, 8), (16, 16), (32, 32), (64, 32), (64, 64)];

/// Head-dim maxima the kernel is instantiated for.
pub const SUPPORTED_MAX_HEAD_DIMS: [usize; 3] = [32, 64, 128];

/// Buffers of one backward launch.
///
/// `delta` receives Delta as `[batch, heads, num_queries]`. Bias-gradient
/// buffers must be zeroed by the caller.
pub struct BackwardArgs<'a, E> {
    pub shape: AttentionShape,
    pub inputs: AttentionInputs<TensorRef<'a, E>>,
    pub lse: &'a [f32],
    pub lse_layout: LseLayout,
    pub grads: AttentionGrads<TensorMut<'a, E>>,
    pub delta: &'a mut [f32],
    /// Key mask, `[batch, num_keys]`.
    pub bias1: Option<&'a [E]>,
    /// Pair bias, `[batch / group_size, heads, num_queries, num_keys]`.
    pub bias2: Option<&'a [E]>,
    pub grad_bias1: Option<&'a mut [f32]>,
    pub grad_bias2: Option<&'a mut [f32]>,
    pub workspace: Option<&'a mut [f32]>,
}

/// What a launch did.
#[derive(Clone, Debug, Serialize)]
pub struct LaunchReport {
    pub plan: KernelPlan,
    pub workspace: WorkspaceLayout,
    pub workspace_bytes: usize,
    pub scratch_bytes: usize,
    pub units: usize,
    pub groups: usize,
}

pub(crate) fn element_dtype<E: Element>() -> DType {
    match E::NAME {
        "f16" => DType::F16,
        "bf16" => DType::BF16,
        _ => DType::F32,
    }
}

fn plan_for(config: &AttentionBackwardConfig, dtype: DType) -> KernelPlan {
    KernelPlan::new(dtype, config.block_i, config.block_j, config.max_head_dim)
}

/// Workspace split for `shape` under `config`.
pub fn workspace_layout(
    config: &AttentionBackwardConfig,
    shape: &AttentionShape,
) -> WorkspaceLayout {
    plan_for(config, config.dtype).workspace_layout(shape)
}

/// Workspace size in `f32` elements.
pub fn workspace_elements(config: &AttentionBackwardConfig, shape: &AttentionShape) -> usize {
    workspace_layout(config, shape).elements()
}

/// Workspace size in bytes. Zero when no accumulation needs one.
pub fn workspace_size(config: &AttentionBackwardConfig, shape: &AttentionShape) -> usize {
    workspace_layout(config, shape).size_in_bytes()
}

fn check_tiles(config: &AttentionBackwardConfig) -> Result<(), LaunchError> {
    let tiles = (config.block_i, config.block_j);
    if SUPPORTED_TILES.contains(&tiles) && SUPPORTED_MAX_HEAD_DIMS.contains(&config.max_head_dim) {
        Ok(())
    } else {
        Err(LaunchError::UnsupportedTiles {
            block_i: config.block_i,
            block_j: config.block_j,
            max_head_dim: config.max_head_dim,
        })
    }
}

fn check_shape(
    config: &AttentionBackwardConfig,
    shape: &AttentionShape,
) -> Result<(), LaunchError> {
    let dims = [
        ("batch", shape.batch),
        ("heads", shape.heads),
        ("num_queries", shape.num_queries),
        ("num_keys", shape.num_keys),
        ("head_dim", shape.head_dim),
        ("head_dim_value", shape.head_dim_value),
        ("group_size", shape.group_size),
    ];
    if let Some(&(name, _)) = dims.iter().find(|(_, value)| *value == 0) {
        return Err(LaunchError::NonPositive { name });
    }
    for (name, value) in [("head_dim", shape.head_dim), ("head_dim_value", shape.head_dim_value)] {
        if value > config.max_head_dim {
            return Err(LaunchError::HeadDimTooLarge {
                name,
                value,
                max: config.max_head_dim,
            });
        }
    }
    if shape.batch % shape.group_size != 0 {
        return Err(LaunchError::GroupSize {
            group_size: shape.group_size,
            batch: shape.batch,
        });
    }
    Ok(())
}

fn check_alignment(
    tensor: &'static str,
    layout: &Layout,
    shape: &AttentionShape,
) -> Result<(), LaunchError> {
    let mut checks = vec![("base offset", layout.offset), ("row stride", layout.row_stride)];
    if shape.heads > 1 {
        checks.push(("head stride", layout.head_stride));
    }
    if shape.batch > 1 {
        checks.push(("batch stride", layout.batch_stride));
    }
    for (what, value) in checks {
        if value % LINE_SIZE != 0 {
            return Err(LaunchError::Misaligned {
                tensor,
                what,
                value,
                alignment: LINE_SIZE,
            });
        }
    }
    Ok(())
}

fn check_len(tensor: &'static str, required: usize, len: usize) -> Result<(), LaunchError> {
    if len < required {
        return Err(LaunchError::TensorTooShort { tensor, required, len });
    }
    Ok(())
}

/// Row and column extents of each input tensor, in bundle order.
fn input_extents(shape: &AttentionShape) -> AttentionInputs<(usize, usize)> {
    let (mq, mk) = (shape.num_queries, shape.num_keys);
    let (k, kv) = (shape.head_dim, shape.head_dim_value);
    AttentionInputs {
        q: (mq, k),
        k: (mk, k),
        v: (mk, kv),
        o: (mq, kv),
        d_o: (mq, kv),
    }
}

fn grad_extents(shape: &AttentionShape) -> AttentionGrads<(usize, usize)> {
    let (mq, mk) = (shape.num_queries, shape.num_keys);
    AttentionGrads {
        grad_q: (mq, shape.head_dim),
        grad_k: (mk, shape.head_dim),
        grad_v: (mk, shape.head_dim_value),
    }
}

/// Refuses a launch whose arguments break a kernel precondition.
pub fn check_supported<E: Element>(
    config: &AttentionBackwardConfig,
    args: &BackwardArgs<'_, E>,
) -> Result<(), LaunchError> {
    let shape = &args.shape;
    check_tiles(config)?;
    check_shape(config, shape)?;

    const INPUT_NAMES: [&str; 5] = ["q", "k", "v", "o", "d_o"];
    let inputs = args.inputs.borrowed().into_array();
    let extents = input_extents(shape).into_array();
    for ((name, tensor), (rows, cols)) in INPUT_NAMES.into_iter().zip(inputs).zip(extents) {
        if matches!(name, "q" | "k" | "v") {
            check_alignment(name, &tensor.layout, shape)?;
        }
        let required = tensor.layout.required_len(shape.batch, rows, shape.heads, cols);
        check_len(name, required, tensor.data.len())?;
    }

    const GRAD_NAMES: [&str; 3] = ["grad_q", "grad_k", "grad_v"];
    let grads = args.grads.borrowed().into_array();
    let extents = grad_extents(shape).into_array();
    for ((name, tensor), (rows, cols)) in GRAD_NAMES.into_iter().zip(grads).zip(extents) {
        let required = tensor.layout.required_len(shape.batch, rows, shape.heads, cols);
        check_len(name, required, tensor.data.len())?;
        if !tensor.layout.is_injective(shape.batch, rows, shape.heads, cols) {
            return Err(LaunchError::OverlappingLayout { tensor: name });
        }
    }

    let lse = &args.lse_layout;
    for (what, value) in [("head stride", lse.head_stride), ("batch stride", lse.batch_stride)] {
        if value % 8 != 0 {
            return Err(LaunchError::Misaligned {
                tensor: "lse",
                what,
                value,
                alignment: 8,
            });
        }
    }
    let lse_required = lse.unit_offset(shape.batch - 1, shape.heads - 1) + shape.num_queries;
    check_len("lse", lse_required, args.lse.len())?;
    check_len("delta", shape.units() * shape.num_queries, args.delta.len())?;

    if let Some(bias) = args.bias1 {
        check_len(KeyMask::NAME, KeyMask::len(shape), bias.len())?;
    }
    if let Some(bias) = args.bias2 {
        check_len(PairBias::NAME, PairBias::len(shape), bias.len())?;
    }
    match (&args.bias1, &args.grad_bias1) {
        (None, Some(_)) => return Err(LaunchError::OrphanBiasGrad("grad_bias1")),
        (Some(_), Some(grad)) => check_len("grad_bias1", KeyMask::len(shape), grad.len())?,
        _ => {}
    }
    match (&args.bias2, &args.grad_bias2) {
        (None, Some(_)) => return Err(LaunchError::OrphanBiasGrad("grad_bias2")),
        (Some(_), Some(grad)) => check_len("grad_bias2", PairBias::len(shape), grad.len())?,
        _ => {}
    }

    let prob = config.dropout_prob;
    if !(0.0..=1.0).contains(&prob) {
        return Err(LaunchError::DropoutOutOfRange(prob));
    }
    if prob > 0.0 && !cfg!(feature = "dropout") {
        return Err(LaunchError::DropoutUnsupported(prob));
    }

    let required = plan_for(config, element_dtype::<E>()).workspace_layout(shape).elements();
    let provided = args.workspace.as_ref().map_or(0, |ws| ws.len());
    if provided < required {
        return Err(LaunchError::Workspace { required, provided });
    }
    Ok(())
}

/// Computes all gradients of one launch with every key tile attending to
/// every query.
pub fn launch<E: Element>(
    config: &AttentionBackwardConfig,
    args: BackwardArgs<'_, E>,
) -> Result<LaunchReport, LaunchError> {
    launch_with_policy(config, args, &FullAttention)
}

struct LaunchContext<'a, 'p, E, G, Q> {
    config: &'a AttentionBackwardConfig,
    plan: KernelPlan,
    workspace: WorkspaceLayout,
    engine: G,
    policy: &'p Q,
    args: BackwardArgs<'a, E>,
}

macro_rules! tile_dispatch {
    (
        $dims:expr => $run:ident($ctx:ident);
        $( ($i:literal, $j:literal, $di:ty, $dj:ty) ),* $(,)?
    ) => {
        match $dims {
            $(
                ($i, $j, 32) => $run::<Tiles<$di, $dj, D32>, _, _, _>($ctx),
                ($i, $j, 64) => $run::<Tiles<$di, $dj, D64>, _, _, _>($ctx),
                ($i, $j, 128) => $run::<Tiles<$di, $dj, D128>, _, _, _>($ctx),
            )*
            (block_i, block_j, max_head_dim) => Err(LaunchError::UnsupportedTiles {
                block_i,
                block_j,
                max_head_dim,
            }),
        }
    };
}

/// Like [`launch`], with a key-tile skip policy.
pub fn launch_with_policy<E: Element, Q: QueryStartPolicy>(
    config: &AttentionBackwardConfig,
    args: BackwardArgs<'_, E>,
    policy: &Q,
) -> Result<LaunchReport, LaunchError> {
    check_supported(config, &args)?;

    let plan = plan_for(config, element_dtype::<E>());
    let workspace = plan.workspace_layout(&args.shape);
    info!(
        shape = ?args.shape,
        dtype = E::NAME,
        block_i = plan.block_i,
        block_j = plan.block_j,
        max_head_dim = plan.max_head_dim,
        grad_q = ?plan.grad_q,
        grad_k = ?plan.grad_k,
        grad_v = ?plan.grad_v,
        output_in_registers = plan.output_in_registers,
        workspace_bytes = workspace.size_in_bytes(),
        "launching attention backward"
    );

    let ctx = LaunchContext {
        config,
        plan,
        workspace,
        engine: PortableGemm,
        policy,
        args,
    };
    tile_dispatch!((plan.block_i, plan.block_j, plan.max_head_dim) => run_tiled(ctx);
        (8, 8, D8, D8),
        (16, 16, D16, D16),
        (32, 32, D32, D32),
        (64, 32, D64, D32),
        (64, 64, D64, D64),
    )
}

type UnitJob<'a> = (UnitCoord, &'a mut [f32], Option<&'a mut [f32]>);

fn run_tiled<P: TileParams, E: Element, G: GemmEngine, Q: QueryStartPolicy>(
    ctx: LaunchContext<'_, '_, E, G, Q>,
) -> Result<LaunchReport, LaunchError> {
    let LaunchContext {
        config,
        plan,
        workspace,
        engine,
        policy,
        args,
    } = ctx;
    let BackwardArgs {
        shape,
        inputs,
        lse,
        lse_layout,
        grads,
        delta,
        bias1,
        bias2,
        grad_bias1,
        grad_bias2,
        workspace: workspace_buf,
    } = args;

    let groups = unit_groups(&shape, grad_bias1.is_some(), grad_bias2.is_some());
    debug!(
        units = shape.units(),
        groups = groups.len(),
        "grouped compute units by shared bias gradients"
    );

    let units = shape.units();
    let mut deltas: Vec<Option<&mut [f32]>> = delta[..units * shape.num_queries]
        .chunks_mut(shape.num_queries)
        .map(Some)
        .collect();
    let mut slots: Vec<Option<&mut [f32]>> = match workspace_buf {
        Some(ws) if !workspace.is_empty() => ws[..workspace.elements()]
            .chunks_mut(workspace.unit_stride)
            .map(Some)
            .collect(),
        _ => (0..units).map(|_| None).collect(),
    };

    let group_count = groups.len();
    let mut jobs: Vec<Vec<UnitJob<'_>>> = Vec::with_capacity(group_count);
    for group in groups {
        let mut group_jobs = Vec::with_capacity(group.len());
        for coord in group {
            let index = coord.index(shape.heads);
            if let Some(delta) = deltas[index].take() {
                group_jobs.push((coord, delta, slots[index].take()));
            }
        }
        jobs.push(group_jobs);
    }

    let dropout = DropoutParams {
        prob: config.dropout_prob,
        seed: config.dropout_seed,
        offset: config.dropout_offset,
    };
    let kernel = BackwardKernel::<P, E, G, Q> {
        shape,
        plan,
        workspace,
        scale: config.resolved_scale(shape.head_dim),
        dropout,
        engine,
        policy,
        inputs,
        lse,
        lse_layout,
        grad_layouts: grads.borrowed().map(|g| g.layout),
        grads: grads.map(|g| RawBuffer::new(g.data)),
        key_mask: bias1.map(|data| BiasInput {
            data,
            grad: grad_bias1.map(RawBuffer::new),
        }),
        pair_bias: bias2.map(|data| BiasInput {
            data,
            grad: grad_bias2.map(RawBuffer::new),
        }),
        tiles: PhantomData,
    };

    jobs.into_par_iter().for_each(|group| {
        for (coord, delta, slot) in group {
            kernel.run_unit(coord, delta, slot);
        }
    });

    Ok(LaunchReport {
        plan,
        workspace,
        workspace_bytes: workspace.size_in_bytes(),
        scratch_bytes: ScratchArena::<P>::capacity_bytes(),
        units,
        groups: group_count,
    })
}
