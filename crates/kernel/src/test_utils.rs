//! Comparison helpers and raw launch buffers for the kernel tests.

use evoattn_tiles::{element::Element, test_utils::assert_data_close};
use rand::{SeedableRng, rngs::StdRng};

use crate::{
    bundle::TensorBundle,
    config::AttentionBackwardConfig,
    launch::{BackwardArgs, workspace_elements},
    params::{
        AttentionGrads, AttentionInputs, AttentionShape, Layout, LseLayout, TensorMut, TensorRef,
    },
    problem::{OutputsData, ProblemDims, random_vec},
};

pub fn assert_outputs_close(
    tested: &OutputsData,
    expected: &OutputsData,
    rtol: f32,
    atol: f32,
    name: &str,
) {
    let tested_named = tested.named();
    let expected_named = expected.named();
    assert_eq!(
        tested_named.iter().map(|(n, _)| *n).collect::<Vec<_>>(),
        expected_named.iter().map(|(n, _)| *n).collect::<Vec<_>>(),
        "{name}: output sets differ"
    );
    for ((buffer, a), (_, b)) in tested_named.into_iter().zip(expected_named) {
        assert_data_close(a, b, rtol, atol, &format!("{name} {buffer}"));
    }
}

/// Host buffers for driving [`launch`](crate::launch::launch) directly, with
/// packed layouts.
#[derive(Clone, Debug)]
pub struct HostBuffers<E> {
    pub shape: AttentionShape,
    pub inputs: AttentionInputs<Vec<E>>,
    pub layouts: AttentionInputs<Layout>,
    pub lse: Vec<f32>,
    pub lse_layout: LseLayout,
    pub grads: AttentionGrads<Vec<E>>,
    pub delta: Vec<f32>,
    pub workspace: Vec<f32>,
}

impl<E: Element> HostBuffers<E> {
    /// Random finite inputs. The values are not a consistent forward pass;
    /// use [`ProblemData`](crate::problem::ProblemData) for numerical
    /// checks.
    pub fn random(dims: ProblemDims, config: &AttentionBackwardConfig, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let shape = dims.shape();
        let (b, h, mq, mk) = (dims.batch, dims.heads, dims.num_queries, dims.num_keys);
        let (k, kv) = (dims.head_dim, dims.head_dim_value);
        let layouts = AttentionInputs {
            q: Layout::packed(mq, h, k),
            k: Layout::packed(mk, h, k),
            v: Layout::packed(mk, h, kv),
            o: Layout::packed(mq, h, kv),
            d_o: Layout::packed(mq, h, kv),
        };
        let lens = [
            b * mq * h * k,
            b * mk * h * k,
            b * mk * h * kv,
            b * mq * h * kv,
            b * mq * h * kv,
        ];
        let inputs = AttentionInputs::from_array(lens.map(|len| {
            random_vec(&mut rng, len, -1.0, 1.0)
                .into_iter()
                .map(E::from_f32)
                .collect::<Vec<E>>()
        }));
        let lse_layout = LseLayout::padded(h, mq);
        let lse = random_vec(&mut rng, b * lse_layout.batch_stride, 1.0, 2.0);

        Self {
            shape,
            grads: AttentionGrads {
                grad_q: vec![E::default(); lens[0]],
                grad_k: vec![E::default(); lens[1]],
                grad_v: vec![E::default(); lens[2]],
            },
            inputs,
            layouts,
            lse,
            lse_layout,
            delta: vec![0.0; shape.units() * mq],
            workspace: vec![0.0; workspace_elements(config, &shape)],
        }
    }

    pub fn args(&mut self) -> BackwardArgs<'_, E> {
        let l = &self.layouts;
        BackwardArgs {
            shape: self.shape,
            inputs: AttentionInputs {
                q: TensorRef { data: &self.inputs.q, layout: l.q },
                k: TensorRef { data: &self.inputs.k, layout: l.k },
                v: TensorRef { data: &self.inputs.v, layout: l.v },
                o: TensorRef { data: &self.inputs.o, layout: l.o },
                d_o: TensorRef { data: &self.inputs.d_o, layout: l.d_o },
            },
            lse: &self.lse,
            lse_layout: self.lse_layout,
            grads: AttentionGrads {
                grad_q: TensorMut { data: &mut self.grads.grad_q, layout: l.q },
                grad_k: TensorMut { data: &mut self.grads.grad_k, layout: l.k },
                grad_v: TensorMut { data: &mut self.grads.grad_v, layout: l.v },
            },
            delta: &mut self.delta,
            bias1: None,
            bias2: None,
            grad_bias1: None,
            grad_bias2: None,
            workspace: (!self.workspace.is_empty()).then_some(self.workspace.as_mut_slice()),
        }
    }
}
