//! Seeded random problems and host copies of the outputs, for the bench
//! binary and the tests.

use burn::tensor::{Tensor, TensorData, backend::Backend};
use evoattn_common::BiasMode;
use evoattn_tiles::element::Element;
use rand::{Rng, SeedableRng, rngs::StdRng};

use crate::{
    api::{AttentionBackwardInputs, AttentionBackwardOutputs, host_f32},
    bias::{BiasBroadcast, KeyMask, PairBias},
    config::AttentionBackwardConfig,
    error::LaunchError,
    params::AttentionShape,
    reference::reference_forward,
};

/// `len` values drawn uniformly from `[lo, hi)`.
pub fn random_vec(rng: &mut StdRng, len: usize, lo: f32, hi: f32) -> Vec<f32> {
    (0..len).map(|_| rng.gen_range(lo..hi)).collect()
}

/// Rounds every value through `E`, so the reference sees the same inputs as a
/// narrow-precision kernel.
pub fn quantize<E: Element>(values: &[f32]) -> Vec<f32> {
    values.iter().map(|&v| E::from_f32(v).to_f32()).collect()
}

/// Backend used for reference computations.
pub type RefBackend = burn::backend::NdArray<f32>;

/// Sizes of a generated problem.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProblemDims {
    pub batch: usize,
    pub heads: usize,
    pub num_queries: usize,
    pub num_keys: usize,
    pub head_dim: usize,
    pub head_dim_value: usize,
    pub group_size: usize,
}

impl ProblemDims {
    pub fn new(
        batch: usize,
        heads: usize,
        num_queries: usize,
        num_keys: usize,
        head_dim: usize,
    ) -> Self {
        Self {
            batch,
            heads,
            num_queries,
            num_keys,
            head_dim,
            head_dim_value: head_dim,
            group_size: 1,
        }
    }

    pub fn with_group_size(self, group_size: usize) -> Self {
        Self { group_size, ..self }
    }

    pub fn with_value_dim(self, head_dim_value: usize) -> Self {
        Self {
            head_dim_value,
            ..self
        }
    }

    pub fn shape(&self) -> AttentionShape {
        AttentionShape {
            batch: self.batch,
            heads: self.heads,
            num_queries: self.num_queries,
            num_keys: self.num_keys,
            head_dim: self.head_dim,
            head_dim_value: self.head_dim_value,
            group_size: self.group_size,
        }
    }
}

/// Host copy of a random problem, already rounded through the element type
/// the kernel will run in.
#[derive(Clone, Debug)]
pub struct ProblemData {
    pub dims: ProblemDims,
    pub q: Vec<f32>,
    pub k: Vec<f32>,
    pub v: Vec<f32>,
    pub d_o: Vec<f32>,
    pub bias1: Option<Vec<f32>>,
    pub bias2: Option<Vec<f32>>,
}

impl ProblemData {
    pub fn random<E: Element>(dims: ProblemDims, bias: BiasMode, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let shape = dims.shape();
        let (b, h) = (dims.batch, dims.heads);
        let mut draw =
            |len: usize, lo: f32, hi: f32| quantize::<E>(&random_vec(&mut rng, len, lo, hi));

        let q = draw(b * dims.num_queries * h * dims.head_dim, -1.0, 1.0);
        let k = draw(b * dims.num_keys * h * dims.head_dim, -1.0, 1.0);
        let v = draw(b * dims.num_keys * h * dims.head_dim_value, -1.0, 1.0);
        let d_o = draw(b * dims.num_queries * h * dims.head_dim_value, -1.0, 1.0);
        let bias1 = bias.key_mask().then(|| draw(KeyMask::len(&shape), -1.0, 0.0));
        let bias2 = bias.pair_bias().then(|| draw(PairBias::len(&shape), -0.5, 0.5));

        Self {
            dims,
            q,
            k,
            v,
            d_o,
            bias1,
            bias2,
        }
    }

    /// Tensors for [`attention_backward`](crate::api::attention_backward),
    /// with O and LSE from [`reference_forward`]. O is rounded through `E`
    /// like the rest.
    pub fn inputs<E: Element, B: Backend>(
        &self,
        config: &AttentionBackwardConfig,
        bias_grads: bool,
        device: &B::Device,
    ) -> Result<AttentionBackwardInputs<B>, LaunchError> {
        let d = &self.dims;
        let shape = d.shape();
        let q_shape = [d.batch, d.num_queries, d.heads, d.head_dim];
        let k_shape = [d.batch, d.num_keys, d.heads, d.head_dim];
        let v_shape = [d.batch, d.num_keys, d.heads, d.head_dim_value];
        let o_shape = [d.batch, d.num_queries, d.heads, d.head_dim_value];

        let tensor4 = |data: &[f32], dims: [usize; 4]| -> Tensor<B, 4> {
            Tensor::from_data(TensorData::new(data.to_vec(), dims), device)
        };
        let q = tensor4(&self.q, q_shape);
        let k = tensor4(&self.k, k_shape);
        let v = tensor4(&self.v, v_shape);
        let bias1 = self.bias1.as_ref().map(|b| {
            Tensor::<B, 2>::from_data(TensorData::new(b.clone(), [d.batch, d.num_keys]), device)
        });
        let bias2 = self.bias2.as_ref().map(|b| {
            let dims: [usize; 4] = [shape.bias_groups(), d.heads, d.num_queries, d.num_keys];
            tensor4(b, dims)
        });

        let (o, lse) = reference_forward(
            q.clone(),
            k.clone(),
            v.clone(),
            bias1.clone(),
            bias2.clone(),
            config,
        );
        let o = quantize::<E>(&host_f32(o)?);

        Ok(AttentionBackwardInputs {
            q,
            k,
            v,
            o: tensor4(&o, o_shape),
            d_o: tensor4(&self.d_o, o_shape),
            lse,
            bias1,
            bias2,
            bias_grads,
        })
    }
}

/// Host copy of backward outputs.
#[derive(Clone, Debug)]
pub struct OutputsData {
    pub grad_q: Vec<f32>,
    pub grad_k: Vec<f32>,
    pub grad_v: Vec<f32>,
    pub delta: Vec<f32>,
    pub grad_bias1: Option<Vec<f32>>,
    pub grad_bias2: Option<Vec<f32>>,
}

impl OutputsData {
    pub fn from_outputs<B: Backend>(
        outputs: AttentionBackwardOutputs<B>,
    ) -> Result<Self, LaunchError> {
        Ok(Self {
            grad_q: host_f32(outputs.grad_q)?,
            grad_k: host_f32(outputs.grad_k)?,
            grad_v: host_f32(outputs.grad_v)?,
            delta: host_f32(outputs.delta)?,
            grad_bias1: outputs.grad_bias1.map(host_f32).transpose()?,
            grad_bias2: outputs.grad_bias2.map(host_f32).transpose()?,
        })
    }

    /// Named buffers, in a fixed order.
    pub fn named(&self) -> Vec<(&'static str, &[f32])> {
        let mut named = vec![
            ("grad_q", self.grad_q.as_slice()),
            ("grad_k", self.grad_k.as_slice()),
            ("grad_v", self.grad_v.as_slice()),
            ("delta", self.delta.as_slice()),
        ];
        if let Some(g) = &self.grad_bias1 {
            named.push(("grad_bias1", g.as_slice()));
        }
        if let Some(g) = &self.grad_bias2 {
            named.push(("grad_bias2", g.as_slice()));
        }
        named
    }

    /// Largest absolute difference per named buffer.
    pub fn max_abs_diff(&self, other: &Self) -> Vec<(&'static str, f32)> {
        self.named()
            .into_iter()
            .zip(other.named())
            .map(|((name, a), (_, b))| {
                let diff = a
                    .iter()
                    .zip(b)
                    .map(|(x, y)| (x - y).abs())
                    .fold(0.0f32, f32::max);
                (name, diff)
            })
            .collect()
    }
}
