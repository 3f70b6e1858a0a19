use burn::config::Config;
use evoattn_common::DType;

/// Launch configuration for the backward kernel.
#[derive(Config, Debug)]
pub struct AttentionBackwardConfig {
    /// Query rows per tile.
    #[config(default = 64)]
    pub block_i: usize,
    /// Key rows per tile.
    #[config(default = 64)]
    pub block_j: usize,
    /// Largest head dimension the instantiated kernel handles.
    #[config(default = 128)]
    pub max_head_dim: usize,
    /// Softmax scale. Defaults to `1 / sqrt(head_dim)`.
    #[config(default = "None")]
    pub scale: Option<f32>,
    #[config(default = 0.0)]
    pub dropout_prob: f32,
    #[config(default = 0)]
    pub dropout_seed: u64,
    /// Base position of the dropout stream, advanced by the caller between steps.
    #[config(default = 0)]
    pub dropout_offset: u64,
    #[config(default = "DType::F32")]
    pub dtype: DType,
}

impl AttentionBackwardConfig {
    pub fn resolved_scale(&self, head_dim: usize) -> f32 {
        self.scale.unwrap_or_else(|| 1.0 / (head_dim as f32).sqrt())
    }
}
