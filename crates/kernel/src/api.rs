//! Tensor-level entry point on burn tensors.
//!
//! Inputs are read back to the host, converted to the configured element
//! type, run through [`launch`](crate::launch::launch) and converted back.

use burn::tensor::{Tensor, TensorData, backend::Backend};
use evoattn_common::DType;
use evoattn_tiles::element::Element;
use half::{bf16, f16};

use crate::{
    bias::{BiasBroadcast, KeyMask, PairBias},
    bundle::TensorBundle,
    config::AttentionBackwardConfig,
    error::LaunchError,
    launch::{BackwardArgs, LaunchReport, launch, workspace_layout},
    params::{
        AttentionGrads, AttentionInputs, AttentionShape, Layout, LseLayout, TensorMut, TensorRef,
    },
};

/// Forward tensors, `[batch, rows, heads, head_dim]` unless noted.
#[derive(Debug, Clone)]
pub struct AttentionBackwardInputs<B: Backend> {
    pub q: Tensor<B, 4>,
    pub k: Tensor<B, 4>,
    pub v: Tensor<B, 4>,
    pub o: Tensor<B, 4>,
    pub d_o: Tensor<B, 4>,
    /// `[batch, heads, num_queries]`
    pub lse: Tensor<B, 3>,
    /// Key mask, `[batch, num_keys]`.
    pub bias1: Option<Tensor<B, 2>>,
    /// Pair bias, `[groups, heads, num_queries, num_keys]`. Consecutive runs
    /// of `batch / groups` batches share one group.
    pub bias2: Option<Tensor<B, 4>>,
    /// Also compute the gradient of every supplied bias.
    pub bias_grads: bool,
}

#[derive(Debug, Clone)]
pub struct AttentionBackwardOutputs<B: Backend> {
    pub grad_q: Tensor<B, 4>,
    pub grad_k: Tensor<B, 4>,
    pub grad_v: Tensor<B, 4>,
    /// `[batch, heads, num_queries]`
    pub delta: Tensor<B, 3>,
    pub grad_bias1: Option<Tensor<B, 2>>,
    pub grad_bias2: Option<Tensor<B, 4>>,
}

/// Batches sharing one pair bias, read off the leading dimension of `bias2`.
pub(crate) fn pair_bias_group_size(batch: usize, groups: usize) -> Result<usize, LaunchError> {
    if groups == 0 || batch % groups != 0 {
        return Err(LaunchError::BiasGroups { groups, batch });
    }
    Ok((batch / groups).max(1))
}

/// Problem shape implied by the input tensors, with every tensor's shape checked.
pub fn infer_shape<B: Backend>(
    inputs: &AttentionBackwardInputs<B>,
) -> Result<AttentionShape, LaunchError> {
    let [batch, num_queries, heads, head_dim] = inputs.q.dims();
    let [_, num_keys, _, _] = inputs.k.dims();
    let [_, _, _, head_dim_value] = inputs.v.dims();

    let group_size = match &inputs.bias2 {
        Some(bias) => pair_bias_group_size(batch, bias.dims()[0])?,
        None => 1,
    };
    let shape = AttentionShape {
        batch,
        heads,
        num_queries,
        num_keys,
        head_dim,
        head_dim_value,
        group_size,
    };

    let check = |tensor: &'static str, expected: Vec<usize>, actual: Vec<usize>| {
        if expected == actual {
            Ok(())
        } else {
            Err(LaunchError::ShapeMismatch {
                tensor,
                expected,
                actual,
            })
        }
    };
    check("k", vec![batch, num_keys, heads, head_dim], inputs.k.dims().to_vec())?;
    check("v", vec![batch, num_keys, heads, head_dim_value], inputs.v.dims().to_vec())?;
    check("o", vec![batch, num_queries, heads, head_dim_value], inputs.o.dims().to_vec())?;
    check("d_o", vec![batch, num_queries, heads, head_dim_value], inputs.d_o.dims().to_vec())?;
    check("lse", vec![batch, heads, num_queries], inputs.lse.dims().to_vec())?;
    if let Some(bias) = &inputs.bias1 {
        check(KeyMask::NAME, KeyMask::shape(&shape), bias.dims().to_vec())?;
    }
    if let Some(bias) = &inputs.bias2 {
        check(PairBias::NAME, PairBias::shape(&shape), bias.dims().to_vec())?;
    }
    Ok(shape)
}

pub(crate) fn host_f32<B: Backend, const D: usize>(
    tensor: Tensor<B, D>,
) -> Result<Vec<f32>, LaunchError> {
    tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|err| LaunchError::Data(format!("{err:?}")))
}

fn host<E: Element, B: Backend, const D: usize>(
    tensor: Tensor<B, D>,
) -> Result<Vec<E>, LaunchError> {
    Ok(host_f32(tensor)?.into_iter().map(E::from_f32).collect())
}

/// Copies dense rows of `cols` values into rows of `stride` values.
fn pad_rows<E: Element>(dense: Vec<E>, cols: usize, stride: usize) -> Vec<E> {
    if cols == stride {
        return dense;
    }
    let mut padded = vec![E::default(); dense.len() / cols * stride];
    for (dst, src) in padded.chunks_mut(stride).zip(dense.chunks(cols)) {
        dst[..cols].copy_from_slice(src);
    }
    padded
}

/// Inverse of [`pad_rows`].
fn strip_rows<E: Element>(padded: &[E], cols: usize, stride: usize) -> Vec<E> {
    if cols == stride {
        return padded.to_vec();
    }
    padded.chunks(stride).flat_map(|row| &row[..cols]).copied().collect()
}

fn device_tensor<E: Element, B: Backend, const D: usize>(
    values: &[E],
    shape: [usize; D],
    device: &B::Device,
) -> Tensor<B, D> {
    let values: Vec<f32> = values.iter().map(|v| v.to_f32()).collect();
    Tensor::from_data(TensorData::new(values, shape), device)
}

/// Computes gradQ, gradK, gradV, Delta and the requested bias gradients.
pub fn attention_backward<B: Backend>(
    inputs: AttentionBackwardInputs<B>,
    config: &AttentionBackwardConfig,
) -> Result<AttentionBackwardOutputs<B>, LaunchError> {
    attention_backward_with_report(inputs, config).map(|(outputs, _)| outputs)
}

/// [`attention_backward`], also returning the launch report.
pub fn attention_backward_with_report<B: Backend>(
    inputs: AttentionBackwardInputs<B>,
    config: &AttentionBackwardConfig,
) -> Result<(AttentionBackwardOutputs<B>, LaunchReport), LaunchError> {
    match config.dtype {
        DType::F32 => run::<f32, B>(inputs, config),
        DType::F16 => run::<f16, B>(inputs, config),
        DType::BF16 => run::<bf16, B>(inputs, config),
    }
}

fn run<E: Element, B: Backend>(
    inputs: AttentionBackwardInputs<B>,
    config: &AttentionBackwardConfig,
) -> Result<(AttentionBackwardOutputs<B>, LaunchReport), LaunchError> {
    let shape = infer_shape(&inputs)?;
    let device = inputs.q.device();
    let AttentionShape {
        batch,
        heads,
        num_queries,
        num_keys,
        head_dim,
        head_dim_value,
        ..
    } = shape;

    let AttentionBackwardInputs {
        q,
        k,
        v,
        o,
        d_o,
        lse,
        bias1,
        bias2,
        bias_grads,
    } = inputs;
    let layouts = AttentionInputs {
        q: Layout::aligned(num_queries, heads, head_dim),
        k: Layout::aligned(num_keys, heads, head_dim),
        v: Layout::aligned(num_keys, heads, head_dim_value),
        o: Layout::aligned(num_queries, heads, head_dim_value),
        d_o: Layout::aligned(num_queries, heads, head_dim_value),
    };
    let (qk_stride, v_stride) = (layouts.q.head_stride, layouts.v.head_stride);
    let data = AttentionInputs { q, k, v, o, d_o }.try_map(host::<E, B, 4>)?;
    let data = AttentionInputs {
        q: pad_rows(data.q, head_dim, qk_stride),
        k: pad_rows(data.k, head_dim, qk_stride),
        v: pad_rows(data.v, head_dim_value, v_stride),
        o: pad_rows(data.o, head_dim_value, v_stride),
        d_o: pad_rows(data.d_o, head_dim_value, v_stride),
    };

    let lse_layout = LseLayout::padded(heads, num_queries);
    let lse_dense = host_f32(lse)?;
    let mut lse_padded = vec![0.0f32; batch * lse_layout.batch_stride];
    for (unit, row) in lse_dense.chunks(num_queries.max(1)).enumerate() {
        let start = lse_layout.unit_offset(unit / heads.max(1), unit % heads.max(1));
        lse_padded[start..start + row.len()].copy_from_slice(row);
    }

    let bias1 = bias1.map(host::<E, B, 2>).transpose()?;
    let bias2 = bias2.map(host::<E, B, 4>).transpose()?;
    let mut grad_bias1 = bias1
        .as_ref()
        .filter(|_| bias_grads)
        .map(|_| vec![0.0f32; KeyMask::len(&shape)]);
    let mut grad_bias2 = bias2
        .as_ref()
        .filter(|_| bias_grads)
        .map(|_| vec![0.0f32; PairBias::len(&shape)]);

    let grad_layouts = AttentionGrads {
        grad_q: layouts.q,
        grad_k: layouts.k,
        grad_v: layouts.v,
    };
    let mut grad_data = AttentionGrads {
        grad_q: vec![E::default(); data.q.len()],
        grad_k: vec![E::default(); data.k.len()],
        grad_v: vec![E::default(); data.v.len()],
    };
    let mut delta = vec![0.0f32; shape.units() * num_queries];
    let mut workspace = vec![0.0f32; workspace_layout(config, &shape).elements()];

    let args = BackwardArgs {
        shape,
        inputs: AttentionInputs {
            q: TensorRef { data: &data.q, layout: layouts.q },
            k: TensorRef { data: &data.k, layout: layouts.k },
            v: TensorRef { data: &data.v, layout: layouts.v },
            o: TensorRef { data: &data.o, layout: layouts.o },
            d_o: TensorRef { data: &data.d_o, layout: layouts.d_o },
        },
        lse: &lse_padded,
        lse_layout,
        grads: AttentionGrads {
            grad_q: TensorMut { data: &mut grad_data.grad_q, layout: grad_layouts.grad_q },
            grad_k: TensorMut { data: &mut grad_data.grad_k, layout: grad_layouts.grad_k },
            grad_v: TensorMut { data: &mut grad_data.grad_v, layout: grad_layouts.grad_v },
        },
        delta: &mut delta,
        bias1: bias1.as_deref(),
        bias2: bias2.as_deref(),
        grad_bias1: grad_bias1.as_deref_mut(),
        grad_bias2: grad_bias2.as_deref_mut(),
        workspace: (!workspace.is_empty()).then_some(workspace.as_mut_slice()),
    };
    let report = launch(config, args)?;

    let grad_q = strip_rows(&grad_data.grad_q, head_dim, qk_stride);
    let grad_k = strip_rows(&grad_data.grad_k, head_dim, qk_stride);
    let grad_v = strip_rows(&grad_data.grad_v, head_dim_value, v_stride);
    let outputs = AttentionBackwardOutputs {
        grad_q: device_tensor(&grad_q, [batch, num_queries, heads, head_dim], &device),
        grad_k: device_tensor(&grad_k, [batch, num_keys, heads, head_dim], &device),
        grad_v: device_tensor(&grad_v, [batch, num_keys, heads, head_dim_value], &device),
        delta: device_tensor(&delta, [batch, heads, num_queries], &device),
        grad_bias1: grad_bias1.map(|g| device_tensor(&g, [batch, num_keys], &device)),
        grad_bias2: grad_bias2.map(|g| {
            device_tensor(&g, [shape.bias_groups(), heads, num_queries, num_keys], &device)
        }),
    };
    Ok((outputs, report))
}
