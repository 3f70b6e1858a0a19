//! Non-tiled forward and backward with plain burn tensor ops.
//!
//! Both materialize the full `[batch, heads, Mq, Mk]` score tensor. They
//! exist to check the fused kernel and to produce consistent O and LSE for
//! it.

use burn::tensor::{Tensor, TensorData, backend::Backend};

use crate::{
    api::{AttentionBackwardInputs, AttentionBackwardOutputs, infer_shape, pair_bias_group_size},
    config::AttentionBackwardConfig,
    dropout::{DropoutParams, mask_plane},
    error::LaunchError,
    params::AttentionShape,
};

fn dropout_params(config: &AttentionBackwardConfig) -> DropoutParams {
    DropoutParams {
        prob: config.dropout_prob,
        seed: config.dropout_seed,
        offset: config.dropout_offset,
    }
}

/// Dropout mask as `[batch, heads, Mq, Mk]`, `None` when dropout is off.
fn dropout_mask<B: Backend>(
    config: &AttentionBackwardConfig,
    shape: &AttentionShape,
    device: &B::Device,
) -> Option<Tensor<B, 4>> {
    let params = dropout_params(config);
    if !params.is_enabled() {
        return None;
    }
    let mut values = Vec::with_capacity(shape.units() * shape.scores_per_head());
    for batch_id in 0..shape.batch {
        for head in 0..shape.heads {
            values.extend(mask_plane(&params, shape, batch_id, head));
        }
    }
    let dims = [shape.batch, shape.heads, shape.num_queries, shape.num_keys];
    Some(Tensor::from_data(TensorData::new(values, dims), device))
}

/// `scale * Q K^T + bias1 + bias2`, as `[batch, heads, Mq, Mk]`.
fn scores<B: Backend>(
    q: &Tensor<B, 4>,
    k: &Tensor<B, 4>,
    bias1: Option<&Tensor<B, 2>>,
    bias2: Option<&Tensor<B, 4>>,
    shape: &AttentionShape,
    scale: f32,
) -> Tensor<B, 4> {
    let q = q.clone().swap_dims(1, 2);
    let k = k.clone().swap_dims(1, 2);
    let mut s = q.matmul(k.transpose()) * scale;

    if let Some(bias) = bias1 {
        s = s + bias.clone().reshape([shape.batch, 1, 1, shape.num_keys]);
    }
    if let Some(bias) = bias2 {
        let groups = shape.bias_groups();
        let expanded = bias
            .clone()
            .unsqueeze_dim::<5>(1)
            .repeat_dim(1, shape.group_size)
            .reshape([groups * shape.group_size, shape.heads, shape.num_queries, shape.num_keys]);
        s = s + expanded;
    }
    s
}

/// Forward attention: returns O `[batch, Mq, heads, Kv]` and LSE
/// `[batch, heads, Mq]`.
pub fn reference_forward<B: Backend>(
    q: Tensor<B, 4>,
    k: Tensor<B, 4>,
    v: Tensor<B, 4>,
    bias1: Option<Tensor<B, 2>>,
    bias2: Option<Tensor<B, 4>>,
    config: &AttentionBackwardConfig,
) -> (Tensor<B, 4>, Tensor<B, 3>) {
    let [batch, num_queries, heads, head_dim] = q.dims();
    let [_, num_keys, _, head_dim_value] = v.dims();
    let group_size = match &bias2 {
        Some(bias) => pair_bias_group_size(batch, bias.dims()[0]).unwrap_or(1),
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
    let device = q.device();
    let scale = config.resolved_scale(head_dim);

    let s = scores(&q, &k, bias1.as_ref(), bias2.as_ref(), &shape, scale);
    let max = s.clone().max_dim(3);
    let lse = (s.clone() - max.clone()).exp().sum_dim(3).log() + max;
    let mut p = (s - lse.clone()).exp();
    if let Some(mask) = dropout_mask::<B>(config, &shape, &device) {
        p = p * mask;
    }

    let o = p.matmul(v.swap_dims(1, 2)).swap_dims(1, 2);
    (o, lse.squeeze::<3>(3))
}

/// Backward attention with the softmax-Jacobian written out in full.
pub fn reference_backward<B: Backend>(
    inputs: AttentionBackwardInputs<B>,
    config: &AttentionBackwardConfig,
) -> Result<AttentionBackwardOutputs<B>, LaunchError> {
    let shape = infer_shape(&inputs)?;
    let device = inputs.q.device();
    let scale = config.resolved_scale(shape.head_dim);

    let s = scores(
        &inputs.q,
        &inputs.k,
        inputs.bias1.as_ref(),
        inputs.bias2.as_ref(),
        &shape,
        scale,
    );
    let p = (s - inputs.lse.clone().unsqueeze_dim::<4>(3)).exp();
    let mask = dropout_mask::<B>(config, &shape, &device);

    let q = inputs.q.swap_dims(1, 2);
    let k = inputs.k.swap_dims(1, 2);
    let v = inputs.v.swap_dims(1, 2);
    let o = inputs.o.swap_dims(1, 2);
    let d_o = inputs.d_o.swap_dims(1, 2);

    let p_dropped = match &mask {
        Some(mask) => p.clone() * mask.clone(),
        None => p.clone(),
    };
    let grad_v = p_dropped.transpose().matmul(d_o.clone());

    let mut dp = d_o.clone().matmul(v.transpose());
    if let Some(mask) = mask {
        dp = dp * mask;
    }
    let delta = (o * d_o).sum_dim(3);
    let ds = p * (dp - delta.clone());

    let grad_bias1 = inputs.bias1.as_ref().filter(|_| inputs.bias_grads).map(|_| {
        ds.clone()
            .sum_dim(2)
            .sum_dim(1)
            .reshape([shape.batch, shape.num_keys])
    });
    let grad_bias2 = inputs.bias2.as_ref().filter(|_| inputs.bias_grads).map(|_| {
        let groups = shape.bias_groups();
        ds.clone()
            .reshape([groups, shape.group_size, shape.heads, shape.num_queries, shape.num_keys])
            .sum_dim(1)
            .reshape([groups, shape.heads, shape.num_queries, shape.num_keys])
    });

    let ds = ds * scale;
    let grad_q = ds.clone().matmul(k);
    let grad_k = ds.transpose().matmul(q);

    Ok(AttentionBackwardOutputs {
        grad_q: grad_q.swap_dims(1, 2),
        grad_k: grad_k.swap_dims(1, 2),
        grad_v: grad_v.swap_dims(1, 2),
        delta: delta.squeeze::<3>(3),
        grad_bias1,
        grad_bias2,
    })
}
