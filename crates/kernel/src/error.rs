use thiserror::Error;

/// Reasons a launch is refused. Every check runs before any compute unit
/// starts, so an error never leaves partially written outputs.
#[derive(Debug, Error, PartialEq)]
pub enum LaunchError {
    #[error("{name} must be positive")]
    NonPositive { name: &'static str },

    #[error("{name} = {value} exceeds the compiled maximum head dim {max}")]
    HeadDimTooLarge {
        name: &'static str,
        value: usize,
        max: usize,
    },

    #[error("{tensor}: {what} = {value} is not a multiple of {alignment}")]
    Misaligned {
        tensor: &'static str,
        what: &'static str,
        value: usize,
        alignment: usize,
    },

    #[error("dropout probability {0} is outside [0, 1]")]
    DropoutOutOfRange(f32),

    #[error("dropout probability {0} requested but dropout support is not compiled in")]
    DropoutUnsupported(f32),

    #[error("workspace of {required} f32 elements required, got {provided}")]
    Workspace { required: usize, provided: usize },

    #[error(
        "unsupported tile configuration: block_i = {block_i}, block_j = {block_j}, \
         max_head_dim = {max_head_dim}"
    )]
    UnsupportedTiles {
        block_i: usize,
        block_j: usize,
        max_head_dim: usize,
    },

    #[error("{tensor} needs {required} elements for its layout but holds {len}")]
    TensorTooShort {
        tensor: &'static str,
        required: usize,
        len: usize,
    },

    #[error("{tensor} layout maps distinct elements to the same address")]
    OverlappingLayout { tensor: &'static str },

    #[error("{tensor} has shape {actual:?}, expected {expected:?}")]
    ShapeMismatch {
        tensor: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("group size {group_size} does not divide the batch count {batch}")]
    GroupSize { group_size: usize, batch: usize },

    #[error("bias2 has {groups} groups, which does not divide the batch count {batch}")]
    BiasGroups { groups: usize, batch: usize },

    #[error("{0} was supplied without its bias")]
    OrphanBiasGrad(&'static str),

    #[error("tensor data conversion failed: {0}")]
    Data(String),
}
