//! Cooperative routines executed by all lanes of a compute unit.

mod load;
mod reduce;
mod store;

pub use load::*;
pub use reduce::*;
pub use store::*;
