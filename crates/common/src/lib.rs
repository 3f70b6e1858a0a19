//! Common types shared between evoformer attention crates.

#[cfg(feature = "burn")]
pub use burn::config::Config;
use serde::{Deserialize, Serialize};

/// Element type of the attention tensors and gradients.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[serde(rename_all = "lowercase")]
pub enum DType {
    #[default]
    F32,
    F16,
    BF16,
}

impl DType {
    pub fn size_in_bytes(self) -> usize {
        match self {
            Self::F32 => 4,
            Self::F16 | Self::BF16 => 2,
        }
    }

    pub fn is_half(self) -> bool {
        self.size_in_bytes() <= 2
    }
}

impl std::fmt::Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::F32 => write!(f, "f32"),
            Self::F16 => write!(f, "f16"),
            Self::BF16 => write!(f, "bf16"),
        }
    }
}

/// Which broadcast biases take part in the scores.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[serde(rename_all = "kebab-case")]
pub enum BiasMode {
    #[default]
    None,
    /// Per-key mask shared by every head and query row.
    KeyMask,
    /// Per-(head, query, key) bias shared by a batch group.
    PairBias,
    Both,
}

impl BiasMode {
    pub fn key_mask(self) -> bool {
        matches!(self, Self::KeyMask | Self::Both)
    }

    pub fn pair_bias(self) -> bool {
        matches!(self, Self::PairBias | Self::Both)
    }
}

impl std::fmt::Display for BiasMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::KeyMask => write!(f, "key-mask"),
            Self::PairBias => write!(f, "pair-bias"),
            Self::Both => write!(f, "both"),
        }
    }
}
