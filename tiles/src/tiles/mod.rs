mod dim;
mod mma;
mod rt;
mod st;

pub use dim::*;
pub use mma::*;
pub use rt::*;
pub use st::*;
